//! PortInc: pulls packets from a port's incoming queues, one task per
//! queue.

use std::sync::Arc;

use serde_json::Value;

use crate::batch::{PacketBatch, MAX_BURST};
use crate::error::ControlError;
use crate::graph::Context;
use crate::module::{InitCtx, Module, ModuleClass, TaskResult};
use crate::port::{PacketDir, PortInstance, FRAME_OVERHEAD_BYTES};

pub struct PortInc {
    port: Arc<PortInstance>,
    burst: usize,
}

impl Module for PortInc {
    fn run_task(&self, ctx: &mut Context<'_>, batch: &mut PacketBatch, arg: u64) -> TaskResult {
        let qid = arg as usize;
        let received = self
            .port
            .imp
            .recv_packets(qid, ctx.pool, batch, self.burst);
        if received == 0 {
            return TaskResult {
                block: true,
                packets: 0,
                bits: 0,
            };
        }
        let bytes: u64 = batch.iter().map(|p| p.total_len() as u64).sum();
        if !self.port.imp.features().self_inc_stats {
            if let Some(qs) = self.port.queue_stats(PacketDir::Inc, qid) {
                qs.record(received as u64, bytes, 0);
            }
        }
        let bits = (bytes + received as u64 * FRAME_OVERHEAD_BYTES) * 8;
        ctx.emit(0, batch);
        TaskResult {
            block: false,
            packets: received as u64,
            bits,
        }
    }

    fn desc(&self) -> String {
        format!("{}/{}", self.port.name, self.port.class.name)
    }

    fn deinit(&self) {
        self.port.release();
    }
}

pub static PORT_INC_CLASS: ModuleClass = ModuleClass {
    name: "PortInc",
    name_template: "",
    help: "Receives from a port; one task per incoming queue",
    igates: 0,
    ogates: 1,
    commands: &[],
    init: |arg, ictx: &mut InitCtx| {
        let port_name = arg
            .get("port")
            .and_then(Value::as_str)
            .ok_or_else(|| ControlError::InvalidArgument("port name required".into()))?;
        let port = ictx.port(port_name)?;
        let burst = arg
            .get("burst")
            .and_then(Value::as_u64)
            .unwrap_or(MAX_BURST as u64) as usize;
        if burst == 0 || burst > MAX_BURST {
            return Err(ControlError::InvalidArgument(format!(
                "burst must be in [1, {MAX_BURST}]"
            )));
        }
        for qid in 0..port.num_queues[PacketDir::Inc as usize] {
            ictx.register_task(qid as u64);
        }
        ictx.set_node_constraints(port.imp.node_placement_constraint());
        port.acquire();
        Ok(Box::new(PortInc { port, burst }))
    },
};
