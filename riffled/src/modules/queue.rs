//! Queue: a ring between an input gate and a draining task, decoupling the
//! producer's worker from the consumer's.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use crossbeam_queue::ArrayQueue;
use serde_json::{json, Value};

use crate::batch::{PacketBatch, MAX_BURST};
use crate::error::{ControlError, ControlResult};
use crate::graph::Context;
use crate::module::{CommandDesc, InitCtx, Module, ModuleClass, TaskResult};
use crate::packet::Packet;

const DEFAULT_CAPACITY: usize = 1024;

pub struct Queue {
    ring: ArcSwap<ArrayQueue<Packet>>,
    burst: AtomicUsize,
    dropped: AtomicU64,
}

impl Module for Queue {
    fn process_batch(&self, _ctx: &mut Context<'_>, batch: &mut PacketBatch) {
        let ring = self.ring.load();
        while let Some(pkt) = batch.pop() {
            if let Err(pkt) = ring.push(pkt) {
                // Full: tail drop.
                self.dropped.fetch_add(1, Ordering::Relaxed);
                drop(pkt);
            }
        }
    }

    fn run_task(&self, ctx: &mut Context<'_>, batch: &mut PacketBatch, _arg: u64) -> TaskResult {
        let ring = self.ring.load();
        let burst = self.burst.load(Ordering::Relaxed);
        while batch.len() < burst {
            match ring.pop() {
                Some(pkt) => batch.push(pkt),
                None => break,
            }
        }
        let packets = batch.len() as u64;
        let bits = batch.total_bits();
        if packets == 0 {
            return TaskResult {
                block: true,
                packets: 0,
                bits: 0,
            };
        }
        ctx.emit(0, batch);
        TaskResult {
            block: false,
            packets,
            bits,
        }
    }

    fn desc(&self) -> String {
        let ring = self.ring.load();
        format!("{}/{} occupied", ring.len(), ring.capacity())
    }

    fn command(&self, cmd: &str, arg: &Value) -> ControlResult<Value> {
        match cmd {
            "set_size" => {
                let size = arg
                    .get("size")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| ControlError::InvalidArgument("size required".into()))?
                    as usize;
                if size == 0 || !size.is_power_of_two() {
                    return Err(ControlError::InvalidArgument(
                        "size must be a power of two".into(),
                    ));
                }
                // Not MT-safe: only runs while no worker touches this
                // module, so draining the old ring cannot race a producer.
                let fresh = Arc::new(ArrayQueue::new(size));
                let old = self.ring.swap(fresh.clone());
                while let Some(pkt) = old.pop() {
                    if let Err(pkt) = fresh.push(pkt) {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        drop(pkt);
                    }
                }
                Ok(Value::Null)
            }
            "get_status" => {
                let ring = self.ring.load();
                Ok(json!({
                    "size": ring.capacity(),
                    "occupied": ring.len(),
                    "dropped": self.dropped.load(Ordering::Relaxed),
                }))
            }
            other => Err(ControlError::NotSupported(format!("command '{other}'"))),
        }
    }
}

pub static QUEUE_CLASS: ModuleClass = ModuleClass {
    name: "Queue",
    name_template: "",
    help: "Ring buffer with a draining task; igate 0 in, ogate 0 out",
    igates: 1,
    ogates: 1,
    commands: &[
        CommandDesc {
            name: "set_size",
            arg: "QueueCommandSetSizeArg",
            mt_safe: false,
        },
        CommandDesc {
            name: "get_status",
            arg: "EmptyArg",
            mt_safe: true,
        },
    ],
    init: |arg, ictx: &mut InitCtx| {
        let size = arg
            .get("size")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_CAPACITY as u64) as usize;
        if size == 0 || !size.is_power_of_two() {
            return Err(ControlError::InvalidArgument(
                "size must be a power of two".into(),
            ));
        }
        let burst = arg
            .get("burst")
            .and_then(Value::as_u64)
            .unwrap_or(MAX_BURST as u64) as usize;
        if burst == 0 || burst > MAX_BURST {
            return Err(ControlError::InvalidArgument(format!(
                "burst must be in [1, {MAX_BURST}]"
            )));
        }
        ictx.register_task(0);
        // One producer worker plus the task's worker.
        ictx.set_allowed_workers(0, 2);
        Ok(Box::new(Queue {
            ring: ArcSwap::new(Arc::new(ArrayQueue::new(size))),
            burst: AtomicUsize::new(burst),
            dropped: AtomicU64::new(0),
        }))
    },
};
