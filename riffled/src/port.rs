//! Ports: the boundary between the graph and the outside world.
//!
//! The core only knows the `Port` trait and the driver registry; concrete
//! drivers (PMD, pcap, vhost) live out of tree. `NullPort` ships in-tree so
//! the port plumbing, queue accounting and the PortInc/PortOut modules can
//! be exercised without hardware.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::{json, Value};

use crate::batch::PacketBatch;
use crate::error::{ControlError, ControlResult};
use crate::pool::{free_bulk, PacketPool};

pub const MAX_QUEUES_PER_DIR: usize = 128;
pub const DEFAULT_QUEUE_SIZE: usize = 256;
pub const DEFAULT_MTU: usize = 1500;

/// Ethernet framing overhead (preamble + IFG + CRC) charged per packet when
/// converting packet counts to line-rate bits.
pub const FRAME_OVERHEAD_BYTES: u64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketDir {
    /// Outside world -> dataplane.
    Inc = 0,
    /// Dataplane -> outside world.
    Out = 1,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PortConf {
    pub mac_addr: String,
    pub mtu: usize,
    pub admin_up: bool,
}

impl Default for PortConf {
    fn default() -> Self {
        PortConf {
            mac_addr: random_mac(),
            mtu: DEFAULT_MTU,
            admin_up: true,
        }
    }
}

fn random_mac() -> String {
    // Locally administered, unicast; low bits from the monotonic clock are
    // random enough for a synthetic address.
    let seed = crate::tsc::rdtsc();
    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        (seed >> 32) as u8,
        (seed >> 24) as u8,
        (seed >> 16) as u8,
        (seed >> 8) as u8,
        seed as u8,
    )
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct PortFeatures {
    /// Driver maintains its own inc-direction counters.
    pub self_inc_stats: bool,
    /// Driver maintains its own out-direction counters.
    pub self_out_stats: bool,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct LinkStatus {
    pub speed_mbps: u32,
    pub full_duplex: bool,
    pub autoneg: bool,
    pub link_up: bool,
}

impl Default for LinkStatus {
    fn default() -> Self {
        LinkStatus {
            speed_mbps: 0,
            full_duplex: true,
            autoneg: true,
            link_up: true,
        }
    }
}

/// Per-queue counters; written by whichever worker drives the queue.
#[derive(Default)]
pub struct QueueStats {
    pub packets: std::sync::atomic::AtomicU64,
    pub dropped: std::sync::atomic::AtomicU64,
    pub bytes: std::sync::atomic::AtomicU64,
}

impl QueueStats {
    pub fn record(&self, packets: u64, bytes: u64, dropped: u64) {
        self.packets.fetch_add(packets, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.dropped.fetch_add(dropped, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.packets.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Value {
        json!({
            "packets": self.packets.load(Ordering::Relaxed),
            "bytes": self.bytes.load(Ordering::Relaxed),
            "dropped": self.dropped.load(Ordering::Relaxed),
        })
    }
}

/// The driver contract the core consumes.
pub trait Port: Send + Sync {
    /// Pull up to `max` packets from queue `qid` into `batch`. Allocation
    /// comes from `pool`.
    fn recv_packets(
        &self,
        qid: usize,
        pool: &PacketPool,
        batch: &mut PacketBatch,
        max: usize,
    ) -> usize;

    /// Push packets from the front of `batch` out of queue `qid`. Accepted
    /// packets are consumed; rejected ones stay in the batch for the caller
    /// to account and drop.
    fn send_packets(&self, qid: usize, batch: &mut PacketBatch) -> usize;

    fn collect_stats(&self, _reset: bool) {}

    fn link_status(&self) -> LinkStatus {
        LinkStatus::default()
    }

    fn update_conf(&self, _conf: &PortConf) -> ControlResult<()> {
        Ok(())
    }

    /// NUMA placement mask for modules bound to this port.
    fn node_placement_constraint(&self) -> u64 {
        u64::MAX
    }

    fn features(&self) -> PortFeatures {
        PortFeatures::default()
    }

    fn default_inc_queue_size(&self) -> usize {
        DEFAULT_QUEUE_SIZE
    }

    fn default_out_queue_size(&self) -> usize {
        DEFAULT_QUEUE_SIZE
    }

    fn deinit(&self) {}
}

/// Arguments common to every driver's create call.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PortArgs {
    #[serde(default = "default_one")]
    pub num_inc_q: usize,
    #[serde(default = "default_one")]
    pub num_out_q: usize,
    #[serde(default)]
    pub conf: Option<PortConf>,
}

fn default_one() -> usize {
    1
}

/// A port class ("driver"): type descriptor plus factory.
pub struct PortClass {
    pub name: &'static str,
    pub name_template: &'static str,
    pub help: &'static str,
    pub init: fn(&Value) -> ControlResult<Box<dyn Port>>,
}

#[derive(Default)]
pub struct PortClassRegistry {
    classes: BTreeMap<&'static str, &'static PortClass>,
}

impl PortClassRegistry {
    pub fn register(&mut self, class: &'static PortClass) {
        self.classes.insert(class.name, class);
    }

    pub fn get(&self, name: &str) -> ControlResult<&'static PortClass> {
        self.classes
            .get(name)
            .copied()
            .ok_or_else(|| ControlError::NotFound(format!("driver {name}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static PortClass> + '_ {
        self.classes.values().copied()
    }
}

/// A live port: driver instance plus the core-side bookkeeping.
pub struct PortInstance {
    pub name: String,
    pub class: &'static PortClass,
    pub imp: Box<dyn Port>,
    pub conf: Mutex<PortConf>,
    pub num_queues: [usize; 2],
    queue_stats: [Vec<QueueStats>; 2],
    /// Modules currently bound to this port.
    refs: AtomicUsize,
}

impl PortInstance {
    pub fn new(
        name: String,
        class: &'static PortClass,
        imp: Box<dyn Port>,
        args: &PortArgs,
    ) -> ControlResult<PortInstance> {
        if args.num_inc_q > MAX_QUEUES_PER_DIR || args.num_out_q > MAX_QUEUES_PER_DIR {
            return Err(ControlError::ResourceExhausted(format!(
                "at most {MAX_QUEUES_PER_DIR} queues per direction"
            )));
        }
        let conf = args.conf.clone().unwrap_or_default();
        Ok(PortInstance {
            name,
            class,
            imp,
            conf: Mutex::new(conf),
            num_queues: [args.num_inc_q, args.num_out_q],
            queue_stats: [
                (0..args.num_inc_q).map(|_| QueueStats::default()).collect(),
                (0..args.num_out_q).map(|_| QueueStats::default()).collect(),
            ],
            refs: AtomicUsize::new(0),
        })
    }

    pub fn queue_stats(&self, dir: PacketDir, qid: usize) -> Option<&QueueStats> {
        self.queue_stats[dir as usize].get(qid)
    }

    pub fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release(&self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn in_use(&self) -> bool {
        self.refs.load(Ordering::Acquire) > 0
    }

    pub fn stats_snapshot(&self) -> Value {
        let dir_json = |dir: PacketDir| {
            self.queue_stats[dir as usize]
                .iter()
                .enumerate()
                .map(|(qid, qs)| (qid.to_string(), qs.snapshot()))
                .collect::<serde_json::Map<_, _>>()
        };
        json!({
            "inc": dir_json(PacketDir::Inc),
            "out": dir_json(PacketDir::Out),
        })
    }

    pub fn reset_stats(&self) {
        for dir in &self.queue_stats {
            for qs in dir {
                qs.reset();
            }
        }
    }

    pub fn update_conf(&self, conf: PortConf) -> ControlResult<()> {
        self.imp.update_conf(&conf)?;
        *self.conf.lock().unwrap() = conf;
        Ok(())
    }
}

/// A port that accepts everything and receives nothing. Stands in for real
/// hardware in tests and bring-up.
pub struct NullPort;

impl Port for NullPort {
    fn recv_packets(
        &self,
        _qid: usize,
        _pool: &PacketPool,
        _batch: &mut PacketBatch,
        _max: usize,
    ) -> usize {
        0
    }

    fn send_packets(&self, _qid: usize, batch: &mut PacketBatch) -> usize {
        let n = batch.len();
        free_bulk(batch);
        n
    }
}

pub static NULL_PORT_CLASS: PortClass = PortClass {
    name: "NullPort",
    name_template: "null",
    help: "Accepts every packet on send; never receives",
    init: |_arg| Ok(Box::new(NullPort)),
};

pub fn builtin_port_classes() -> Vec<&'static PortClass> {
    vec![&NULL_PORT_CLASS]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(inc: usize, out: usize) -> PortArgs {
        PortArgs {
            num_inc_q: inc,
            num_out_q: out,
            conf: None,
        }
    }

    #[test]
    fn null_port_accepts_and_frees() {
        let pool = PacketPool::new_plain("p0", 64, 0);
        let port = PortInstance::new(
            "null0".into(),
            &NULL_PORT_CLASS,
            Box::new(NullPort),
            &args(1, 1),
        )
        .unwrap();

        let mut batch = PacketBatch::new();
        assert!(pool.alloc_bulk(&mut batch, 8, 60));
        let sent = port.imp.send_packets(0, &mut batch);
        assert_eq!(sent, 8);
        assert!(batch.is_empty());
        assert_eq!(pool.available(), 64);

        let got = port.imp.recv_packets(0, &pool, &mut batch, 32);
        assert_eq!(got, 0);
    }

    #[test]
    fn queue_count_bounds() {
        let err = PortInstance::new(
            "big".into(),
            &NULL_PORT_CLASS,
            Box::new(NullPort),
            &args(MAX_QUEUES_PER_DIR + 1, 1),
        );
        assert!(matches!(err, Err(ControlError::ResourceExhausted(_))));
    }

    #[test]
    fn refcount_gates_destruction() {
        let port = PortInstance::new(
            "null0".into(),
            &NULL_PORT_CLASS,
            Box::new(NullPort),
            &args(1, 1),
        )
        .unwrap();
        assert!(!port.in_use());
        port.acquire();
        assert!(port.in_use());
        port.release();
        assert!(!port.in_use());
    }

    #[test]
    fn stats_accumulate_and_reset() {
        let port = PortInstance::new(
            "null0".into(),
            &NULL_PORT_CLASS,
            Box::new(NullPort),
            &args(2, 1),
        )
        .unwrap();
        port.queue_stats(PacketDir::Inc, 1)
            .unwrap()
            .record(10, 600, 2);
        let snap = port.stats_snapshot();
        assert_eq!(snap["inc"]["1"]["packets"], 10);
        assert_eq!(snap["inc"]["1"]["dropped"], 2);
        port.reset_stats();
        assert_eq!(port.stats_snapshot()["inc"]["1"]["packets"], 0);
    }
}
