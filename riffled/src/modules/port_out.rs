//! PortOut: pushes received batches out of a port.

use std::sync::Arc;

use serde_json::Value;

use crate::batch::PacketBatch;
use crate::error::ControlError;
use crate::graph::Context;
use crate::module::{InitCtx, Module, ModuleClass};
use crate::pool::free_bulk;
use crate::port::{PacketDir, PortInstance};
use crate::worker::MAX_WORKERS;

pub struct PortOut {
    port: Arc<PortInstance>,
}

impl Module for PortOut {
    fn process_batch(&self, ctx: &mut Context<'_>, batch: &mut PacketBatch) {
        let num_q = self.port.num_queues[PacketDir::Out as usize].max(1);
        let qid = ctx.wid % num_q;
        let total = batch.len();
        let bytes: u64 = batch.iter().map(|p| p.total_len() as u64).sum();

        let sent = self.port.imp.send_packets(qid, batch);
        let dropped = total - sent;
        if !self.port.imp.features().self_out_stats {
            if let Some(qs) = self.port.queue_stats(PacketDir::Out, qid) {
                qs.record(sent as u64, bytes, dropped as u64);
            }
        }
        if !batch.is_empty() {
            free_bulk(batch);
        }
    }

    fn desc(&self) -> String {
        format!("{}/{}", self.port.name, self.port.class.name)
    }

    fn deinit(&self) {
        self.port.release();
    }
}

pub static PORT_OUT_CLASS: ModuleClass = ModuleClass {
    name: "PortOut",
    name_template: "",
    help: "Sends every received packet out of a port",
    igates: 1,
    ogates: 0,
    commands: &[],
    init: |arg, ictx: &mut InitCtx| {
        let port_name = arg
            .get("port")
            .and_then(Value::as_str)
            .ok_or_else(|| ControlError::InvalidArgument("port name required".into()))?;
        let port = ictx.port(port_name)?;
        ictx.set_node_constraints(port.imp.node_placement_constraint());
        // Workers hash onto distinct out queues.
        ictx.set_allowed_workers(0, port.num_queues[PacketDir::Out as usize].min(MAX_WORKERS));
        port.acquire();
        Ok(Box::new(PortOut { port }))
    },
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphStore, ModuleId};
    use crate::pool::PacketPool;
    use crate::port::{NullPort, PortArgs, PortInstance, NULL_PORT_CLASS};

    fn port() -> Arc<PortInstance> {
        Arc::new(
            PortInstance::new(
                "null0".into(),
                &NULL_PORT_CLASS,
                Box::new(NullPort),
                &PortArgs {
                    num_inc_q: 1,
                    num_out_q: 1,
                    conf: None,
                },
            )
            .unwrap(),
        )
    }

    #[test]
    fn port_out_accounts_sent_packets() {
        let mut g = GraphStore::new();
        let mut ictx = InitCtx::default();
        let port = port();
        ictx.ports.insert("null0".into(), port.clone());
        let imp = (PORT_OUT_CLASS.init)(
            &serde_json::json!({ "port": "null0" }),
            &mut ictx,
        )
        .unwrap();
        let out: ModuleId = g
            .insert("out0".into(), &PORT_OUT_CLASS, imp.into(), ictx, Value::Null)
            .unwrap();
        let view = g.build_view();
        let pool = PacketPool::new_plain("po_t", 64, 0);

        let mut ctx = crate::graph::Context::for_test(&view, &pool, out);
        let mut batch = PacketBatch::new();
        assert!(pool.alloc_bulk(&mut batch, 16, 60));
        view.module_by_id(out)
            .unwrap()
            .imp
            .clone()
            .process_batch(&mut ctx, &mut batch);

        assert_eq!(pool.available(), 64);
        let snap = port.stats_snapshot();
        assert_eq!(snap["out"]["0"]["packets"], 16);
        assert_eq!(snap["out"]["0"]["dropped"], 0);
        assert!(port.in_use());
    }
}
