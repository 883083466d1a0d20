//! Gates and gate hooks.
//!
//! Gates are the connection points of the module graph: an output gate leads
//! to exactly one input gate, an input gate fans in from any number of
//! output gates. Both sides carry an ordered list of observation hooks that
//! see every batch crossing the gate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::batch::PacketBatch;
use crate::error::{ControlError, ControlResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDir {
    In,
    Out,
}

/// An observation callback attached to a gate. Hooks run in
/// (priority, name) order and must not modify the batch.
pub trait GateHook: Send + Sync {
    fn class_name(&self) -> &'static str;
    fn name(&self) -> &str;
    fn priority(&self) -> u16;
    fn process_batch(&self, batch: &PacketBatch);
    /// Current hook state for the control plane.
    fn snapshot(&self) -> Value;
    fn command(&self, cmd: &str, _arg: &Value) -> ControlResult<Value> {
        Err(ControlError::NotSupported(format!(
            "{} does not support command '{cmd}'",
            self.class_name()
        )))
    }
}

/// Keep a hook list in its invocation order.
pub fn insert_hook(hooks: &mut Vec<Arc<dyn GateHook>>, hook: Arc<dyn GateHook>) {
    let pos = hooks
        .iter()
        .position(|h| (h.priority(), h.name()) > (hook.priority(), hook.name()))
        .unwrap_or(hooks.len());
    hooks.insert(pos, hook);
}

/// The default per-gate counter hook.
pub struct TrackHook {
    name: String,
    priority: u16,
    track_bits: bool,
    batches: AtomicU64,
    packets: AtomicU64,
    bits: AtomicU64,
}

impl TrackHook {
    pub const CLASS: &'static str = "track";

    pub fn new(track_bits: bool) -> TrackHook {
        TrackHook {
            name: Self::CLASS.to_string(),
            priority: 0,
            track_bits,
            batches: AtomicU64::new(0),
            packets: AtomicU64::new(0),
            bits: AtomicU64::new(0),
        }
    }

    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }
}

impl GateHook for TrackHook {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u16 {
        self.priority
    }

    fn process_batch(&self, batch: &PacketBatch) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.packets.fetch_add(batch.len() as u64, Ordering::Relaxed);
        if self.track_bits {
            self.bits.fetch_add(batch.total_bits(), Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> Value {
        json!({
            "batches": self.batches.load(Ordering::Relaxed),
            "packets": self.packets.load(Ordering::Relaxed),
            "bits": if self.track_bits {
                Value::from(self.bits.load(Ordering::Relaxed))
            } else {
                Value::Null
            },
        })
    }

    fn command(&self, cmd: &str, _arg: &Value) -> ControlResult<Value> {
        match cmd {
            "reset" => {
                self.batches.store(0, Ordering::Relaxed);
                self.packets.store(0, Ordering::Relaxed);
                self.bits.store(0, Ordering::Relaxed);
                Ok(Value::Null)
            }
            other => Err(ControlError::NotSupported(format!(
                "track does not support command '{other}'"
            ))),
        }
    }
}

/// A gate-hook class: how the control plane instantiates hooks by name.
pub struct GateHookClass {
    pub name: &'static str,
    pub help: &'static str,
    pub builder: fn(&Value) -> ControlResult<Arc<dyn GateHook>>,
}

pub fn builtin_gatehook_classes() -> Vec<GateHookClass> {
    vec![GateHookClass {
        name: TrackHook::CLASS,
        help: "Counts batches and packets (optionally bits) crossing a gate",
        builder: |arg| {
            let track_bits = arg
                .get("bits")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            Ok(Arc::new(TrackHook::new(track_bits)))
        },
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PacketPool;

    #[test]
    fn track_counts_batches_and_packets() {
        let pool = PacketPool::new_plain("g0", 64, 0);
        let hook = TrackHook::new(false);
        let mut batch = PacketBatch::new();
        for _ in 0..5 {
            batch.push(pool.alloc(60).unwrap());
        }
        hook.process_batch(&batch);
        hook.process_batch(&batch);
        assert_eq!(hook.batches(), 2);
        assert_eq!(hook.packets(), 10);
        hook.command("reset", &Value::Null).unwrap();
        assert_eq!(hook.packets(), 0);
    }

    #[test]
    fn hooks_ordered_by_priority_then_name() {
        struct P(u16, &'static str);
        impl GateHook for P {
            fn class_name(&self) -> &'static str {
                "p"
            }
            fn name(&self) -> &str {
                self.1
            }
            fn priority(&self) -> u16 {
                self.0
            }
            fn process_batch(&self, _: &PacketBatch) {}
            fn snapshot(&self) -> Value {
                Value::Null
            }
        }
        let mut hooks: Vec<Arc<dyn GateHook>> = Vec::new();
        insert_hook(&mut hooks, Arc::new(P(5, "b")));
        insert_hook(&mut hooks, Arc::new(P(1, "z")));
        insert_hook(&mut hooks, Arc::new(P(5, "a")));
        let order: Vec<_> = hooks.iter().map(|h| (h.priority(), h.name())).collect();
        assert_eq!(order, vec![(1, "z"), (5, "a"), (5, "b")]);
    }
}
