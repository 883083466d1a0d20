//! Source: a task that emits batches of freshly allocated packets.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;

use crate::batch::{PacketBatch, MAX_BURST};
use crate::error::{ControlError, ControlResult};
use crate::graph::Context;
use crate::module::{CommandDesc, InitCtx, Module, ModuleClass, TaskResult};
use crate::packet::PKT_DATA;
use crate::port::FRAME_OVERHEAD_BYTES;

pub struct Source {
    pkt_len: AtomicUsize,
    burst: AtomicUsize,
}

impl Source {
    fn pkt_len(&self) -> usize {
        self.pkt_len.load(Ordering::Relaxed)
    }

    fn burst(&self) -> usize {
        self.burst.load(Ordering::Relaxed)
    }
}

impl Module for Source {
    fn run_task(&self, ctx: &mut Context<'_>, batch: &mut PacketBatch, _arg: u64) -> TaskResult {
        let len = self.pkt_len();
        let burst = self.burst();
        if !ctx.pool.alloc_bulk(batch, burst, len) {
            return TaskResult {
                block: true,
                packets: 0,
                bits: 0,
            };
        }
        let packets = batch.len() as u64;
        let bits = packets * (len as u64 + FRAME_OVERHEAD_BYTES) * 8;
        ctx.emit(0, batch);
        TaskResult {
            block: false,
            packets,
            bits,
        }
    }

    fn desc(&self) -> String {
        format!("{}B x {}", self.pkt_len(), self.burst())
    }

    fn command(&self, cmd: &str, arg: &Value) -> ControlResult<Value> {
        match cmd {
            "set_pkt_size" => {
                let size = arg
                    .get("size")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| ControlError::InvalidArgument("size required".into()))?
                    as usize;
                if size == 0 || size > PKT_DATA {
                    return Err(ControlError::InvalidArgument(format!(
                        "size must be in [1, {PKT_DATA}]"
                    )));
                }
                self.pkt_len.store(size, Ordering::Relaxed);
                Ok(Value::Null)
            }
            "set_burst" => {
                let burst = arg
                    .get("burst")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| ControlError::InvalidArgument("burst required".into()))?
                    as usize;
                if burst == 0 || burst > MAX_BURST {
                    return Err(ControlError::InvalidArgument(format!(
                        "burst must be in [1, {MAX_BURST}]"
                    )));
                }
                self.burst.store(burst, Ordering::Relaxed);
                Ok(Value::Null)
            }
            other => Err(ControlError::NotSupported(format!("command '{other}'"))),
        }
    }
}

pub static SOURCE_CLASS: ModuleClass = ModuleClass {
    name: "Source",
    name_template: "",
    help: "Infinite packet source; one task, emits on ogate 0",
    igates: 0,
    ogates: 1,
    commands: &[
        CommandDesc {
            name: "set_pkt_size",
            arg: "SourceCommandSetPktSizeArg",
            mt_safe: false,
        },
        CommandDesc {
            name: "set_burst",
            arg: "SourceCommandSetBurstArg",
            mt_safe: true,
        },
    ],
    init: |arg, ictx: &mut InitCtx| {
        let pkt_len = arg.get("pkt_size").and_then(Value::as_u64).unwrap_or(60) as usize;
        let burst = arg
            .get("burst")
            .and_then(Value::as_u64)
            .unwrap_or(MAX_BURST as u64) as usize;
        if pkt_len == 0 || pkt_len > PKT_DATA {
            return Err(ControlError::InvalidArgument(format!(
                "pkt_size must be in [1, {PKT_DATA}]"
            )));
        }
        if burst == 0 || burst > MAX_BURST {
            return Err(ControlError::InvalidArgument(format!(
                "burst must be in [1, {MAX_BURST}]"
            )));
        }
        ictx.register_task(0);
        Ok(Box::new(Source {
            pkt_len: AtomicUsize::new(pkt_len),
            burst: AtomicUsize::new(burst),
        }))
    },
};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use crate::graph::testutil::SWALLOW_CLASS;
    use crate::graph::{testutil, GraphStore, TaskSpec};
    use crate::pool::PacketPool;

    #[test]
    fn source_emits_full_bursts() {
        let mut g = GraphStore::new();
        let mut ictx = InitCtx::default();
        let imp = (SOURCE_CLASS.init)(&json!({"pkt_size": 100}), &mut ictx).unwrap();
        assert_eq!(ictx.tasks.len(), 1);
        let src = g
            .insert("src0".into(), &SOURCE_CLASS, imp.into(), ictx, Value::Null)
            .unwrap();
        let sink = testutil::add(&mut g, &SWALLOW_CLASS, "sink0");
        g.connect(src, 0, sink, 0, vec![]).unwrap();
        let view = g.build_view();
        let pool = PacketPool::new_plain("src_t", 128, 0);

        let result = view.run_task(
            TaskSpec {
                module: src,
                arg: 0,
            },
            0,
            &pool,
            1000,
        );
        assert!(!result.block);
        assert_eq!(result.packets, 32);
        assert_eq!(result.bits, 32 * (100 + 24) * 8);
        assert_eq!(pool.available(), 128, "sink freed everything");
    }

    #[test]
    fn source_blocks_on_empty_pool() {
        let mut g = GraphStore::new();
        let mut ictx = InitCtx::default();
        let imp = (SOURCE_CLASS.init)(&Value::Null, &mut ictx).unwrap();
        let src = g
            .insert("src0".into(), &SOURCE_CLASS, imp.into(), ictx, Value::Null)
            .unwrap();
        let view = g.build_view();
        // Too small for one burst.
        let pool = PacketPool::new_plain("src_e", 8, 0);
        let result = view.run_task(
            TaskSpec {
                module: src,
                arg: 0,
            },
            0,
            &pool,
            1000,
        );
        assert!(result.block);
        assert_eq!(result.packets, 0);
        assert_eq!(pool.available(), 8);
    }
}
