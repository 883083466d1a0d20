//! Sink: frees everything it receives.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::batch::PacketBatch;
use crate::graph::Context;
use crate::module::{InitCtx, Module, ModuleClass};
use crate::pool::free_bulk;
use crate::worker::MAX_WORKERS;

pub struct Sink {
    consumed: AtomicU64,
}

impl Module for Sink {
    fn process_batch(&self, _ctx: &mut Context<'_>, batch: &mut PacketBatch) {
        self.consumed.fetch_add(batch.len() as u64, Ordering::Relaxed);
        free_bulk(batch);
    }

    fn desc(&self) -> String {
        format!("{} consumed", self.consumed.load(Ordering::Relaxed))
    }
}

pub static SINK_CLASS: ModuleClass = ModuleClass {
    name: "Sink",
    name_template: "",
    help: "Frees every received packet",
    igates: 1,
    ogates: 0,
    commands: &[],
    init: |_arg, ictx: &mut InitCtx| {
        // Stateless apart from a counter: any number of workers may feed it.
        ictx.set_allowed_workers(0, MAX_WORKERS);
        Ok(Box::new(Sink {
            consumed: AtomicU64::new(0),
        }))
    },
};
