//! End-to-end engine tests: scheduler fairness, rate limiting against wall
//! time, pause/resume latency, orphan attachment, and control-surface
//! round trips.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use riffled::config::Config;
use riffled::graph::{GraphStore, TaskSpec};
use riffled::hub::{AddTcRequest, Hub, UpdateTcParentRequest};
use riffled::metadata::AccessMode;
use riffled::module::{InitCtx, Module, ModuleClass};
use riffled::modules::{SINK_CLASS, SOURCE_CLASS};
use riffled::pool::PacketPool;
use riffled::scheduler::{Scheduler, SchedulerKind};
use riffled::tc::{DetachedTc, Resource};
use riffled::worker::is_cpu_present;

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.runtime.plain_pools = true;
    cfg.runtime.buffers_per_socket = 4096;
    cfg.runtime.default_core = 0;
    cfg
}

fn add_module(
    g: &mut GraphStore,
    class: &'static ModuleClass,
    name: &str,
    arg: Value,
) -> riffled::graph::ModuleId {
    let mut ictx = InitCtx::default();
    let imp = (class.init)(&arg, &mut ictx).unwrap();
    g.insert(name.to_string(), class, imp.into(), ictx, arg)
        .unwrap()
}

/// Placeholder behavior for metadata-only test modules; never runs packets.
struct Inert;

impl Module for Inert {}

static TTL_WRITER_CLASS: ModuleClass = ModuleClass {
    name: "TtlWriter",
    name_template: "",
    help: "test: declares write(ttl, 1)",
    igates: 1,
    ogates: 1,
    commands: &[],
    init: |_arg, ictx| {
        ictx.add_attr("ttl", 1, AccessMode::Write)?;
        Ok(Box::new(Inert))
    },
};

static TTL_READER_CLASS: ModuleClass = ModuleClass {
    name: "TtlReader",
    name_template: "",
    help: "test: declares read(ttl, 1)",
    igates: 1,
    ogates: 1,
    commands: &[],
    init: |_arg, ictx| {
        ictx.add_attr("ttl", 1, AccessMode::Read)?;
        Ok(Box::new(Inert))
    },
};

/// Two source leaves under a synthesized round-robin root: four scheduler
/// rounds produce four full bursts, alternating leaves.
#[test]
fn round_robin_alternates_two_source_leaves() {
    let mut g = GraphStore::new();
    let src1 = add_module(&mut g, &SOURCE_CLASS, "s1", json!({ "pkt_size": 60 }));
    let src2 = add_module(&mut g, &SOURCE_CLASS, "s2", json!({ "pkt_size": 60 }));
    let sink = add_module(&mut g, &SINK_CLASS, "sink0", Value::Null);
    g.connect(src1, 0, sink, 0, vec![]).unwrap();
    g.connect(src2, 0, sink, 0, vec![]).unwrap();
    let view = g.build_view();
    let pool = PacketPool::new_plain("rr_e2e", 256, 0);

    let mut sched = Scheduler::new(SchedulerKind::Default);
    sched.attach_orphan(
        DetachedTc::leaf("l1", Some(TaskSpec { module: src1, arg: 0 })),
        0,
    );
    sched.attach_orphan(
        DetachedTc::leaf("l2", Some(TaskSpec { module: src2, arg: 0 })),
        0,
    );
    assert!(sched.find("!default_rr_0").is_some());

    for _ in 0..4 {
        sched.schedule_once(&view, 0, &pool);
    }

    let l1 = sched.find("l1").unwrap();
    let l2 = sched.find("l2").unwrap();
    let s1 = sched.tree.get(l1).unwrap().stats;
    let s2 = sched.tree.get(l2).unwrap().stats;
    assert_eq!(s1.usage[Resource::Count as usize], 2, "l1 selected twice");
    assert_eq!(s2.usage[Resource::Count as usize], 2, "l2 selected twice");
    let total = s1.usage[Resource::Packet as usize] + s2.usage[Resource::Packet as usize];
    assert_eq!(total, 128);
}

/// A rate limit of one million packets per second holds over one second of
/// wall time, within the configured burst.
#[test]
fn rate_limit_packets_per_second_wall_clock() {
    let hub = Hub::new(test_config());
    hub.add_worker(0, 0, "default").unwrap();
    hub.create_module("Source", Some("src0".into()), json!({ "pkt_size": 60 }))
        .unwrap();

    hub.add_tc(AddTcRequest {
        name: "rl0".into(),
        policy: "rate_limit".into(),
        resource: Some("packet".into()),
        limit: Some(1_000_000),
        max_burst: Some(1_000_000),
        parent: None,
        wid: Some(0),
        priority: None,
        share: None,
    })
    .unwrap();
    hub.update_tc_parent(UpdateTcParentRequest {
        name: "!leaf_src0:0".into(),
        parent: Some("rl0".into()),
        wid: None,
        priority: None,
        share: None,
    })
    .unwrap();

    hub.resume_all().unwrap();
    std::thread::sleep(Duration::from_secs(1));
    hub.pause_all().unwrap();

    let stats = hub.get_tc_stats("!leaf_src0:0").unwrap();
    let packets = stats["stats"]["usage"][Resource::Packet as usize]
        .as_u64()
        .unwrap();
    assert!(
        (950_000..=1_100_000).contains(&packets),
        "forwarded {packets} packets in ~1s at a 1M pps limit"
    );

    hub.reset_all().unwrap();
    hub.pause_all().unwrap();
}

/// Both workers observe a pause and a resume well within the 100ms bound.
#[test]
fn pause_resume_handshake_latency() {
    let hub = Hub::new(test_config());
    hub.add_worker(0, 0, "default").unwrap();
    let two_workers = is_cpu_present(1);
    if two_workers {
        hub.add_worker(1, 1, "default").unwrap();
    }

    hub.resume_all().unwrap();
    let statuses = |hub: &Arc<Hub>| -> Vec<String> {
        hub.list_workers()["workers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|w| w["status"].as_str().unwrap().to_string())
            .collect()
    };
    assert!(statuses(&hub).iter().all(|s| s == "running"));

    let start = Instant::now();
    hub.pause_all().unwrap();
    assert!(start.elapsed() < Duration::from_millis(100));
    assert!(statuses(&hub).iter().all(|s| s == "paused"));

    let start = Instant::now();
    hub.resume_all().unwrap();
    assert!(start.elapsed() < Duration::from_millis(100));
    assert!(statuses(&hub).iter().all(|s| s == "running"));

    hub.pause_all().unwrap();
}

/// Orphan attachment synthesizes a default round-robin root for the second
/// leaf and collapses it again once the second module is destroyed.
#[test]
fn orphan_attachment_synthesizes_and_collapses_default_rr() {
    let hub = Hub::new(test_config());
    hub.add_worker(0, 0, "default").unwrap();

    hub.create_module("Source", Some("sa".into()), json!({}))
        .unwrap();
    hub.resume_all().unwrap();

    let tc_names = |hub: &Arc<Hub>| -> Vec<String> {
        hub.list_tcs()["classes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap().to_string())
            .collect()
    };
    let names = tc_names(&hub);
    assert!(names.contains(&"!leaf_sa:0".to_string()));
    assert!(!names.iter().any(|n| n.starts_with("!default_rr_")));
    assert_eq!(hub.status()["orphan_tcs"], 0, "orphans empty after resume");

    hub.create_module("Source", Some("sb".into()), json!({}))
        .unwrap();
    hub.resume_all().unwrap();
    let names = tc_names(&hub);
    assert!(names.contains(&"!default_rr_0".to_string()));
    assert!(names.contains(&"!leaf_sa:0".to_string()));
    assert!(names.contains(&"!leaf_sb:0".to_string()));

    hub.destroy_module("sb").unwrap();
    let names = tc_names(&hub);
    assert!(!names.contains(&"!default_rr_0".to_string()), "rr collapsed");
    assert!(names.contains(&"!leaf_sa:0".to_string()));

    hub.pause_all().unwrap();
}

/// Metadata offsets agree across a connected writer/reader pair and revert
/// to sentinels after a disconnect.
#[test]
fn metadata_offsets_shared_through_control_plane() {
    let hub = Hub::new(test_config());
    hub.register_module_class(&TTL_WRITER_CLASS);
    hub.register_module_class(&TTL_READER_CLASS);

    hub.create_module("TtlWriter", Some("w0".into()), json!({}))
        .unwrap();
    hub.create_module("TtlReader", Some("r0".into()), json!({}))
        .unwrap();
    hub.connect_modules("w0", 0, "r0", 0, false).unwrap();

    let offset_of = |hub: &Arc<Hub>, module: &str| -> i64 {
        hub.get_module_info(module).unwrap()["metadata"][0]["offset"]
            .as_i64()
            .unwrap()
    };
    let w = offset_of(&hub, "w0");
    let r = offset_of(&hub, "r0");
    assert!(w >= 0);
    assert_eq!(w, r);

    hub.disconnect_modules("w0", 0).unwrap();
    assert_eq!(
        offset_of(&hub, "w0"),
        riffled::metadata::OFFSET_NO_READ as i64
    );
    assert_eq!(
        offset_of(&hub, "r0"),
        riffled::metadata::OFFSET_NO_WRITE as i64
    );
}

/// create + get_initial_arg round trip, and connect/disconnect restoring
/// gate state.
#[test]
fn control_surface_round_trips() {
    let hub = Hub::new(test_config());

    let arg = json!({ "pkt_size": 128, "burst": 16 });
    hub.create_module("Source", Some("src0".into()), arg.clone())
        .unwrap();
    let initial = hub
        .module_command("src0", "get_initial_arg", &Value::Null)
        .unwrap();
    assert_eq!(initial, arg);

    hub.create_module("Sink", Some("sink0".into()), json!({}))
        .unwrap();
    let before = hub.get_module_info("src0").unwrap();
    hub.connect_modules("src0", 0, "sink0", 0, false).unwrap();
    hub.disconnect_modules("src0", 0).unwrap();
    let after = hub.get_module_info("src0").unwrap();
    assert_eq!(before["ogates"], after["ogates"]);
    assert_eq!(
        hub.get_module_info("sink0").unwrap()["igates"],
        json!([])
    );

    // Duplicate names are rejected.
    assert!(hub
        .create_module("Source", Some("src0".into()), json!({}))
        .is_err());

    // Default hook installation is skipped per-connection on request.
    hub.connect_modules("src0", 0, "sink0", 0, true).unwrap();
    let hooks = hub.list_gatehooks();
    assert_eq!(hooks["hooks"].as_array().unwrap().len(), 0);
    hub.disconnect_modules("src0", 0).unwrap();

    hub.connect_modules("src0", 0, "sink0", 0, false).unwrap();
    let hooks = hub.list_gatehooks();
    assert_eq!(hooks["hooks"].as_array().unwrap().len(), 1);

    hub.reset_all().unwrap();
    assert_eq!(hub.list_modules()["modules"], json!([]));
    assert_eq!(hub.list_tcs()["classes"], json!([]));
}

/// Ports: creation, stats via PortOut traffic, busy-on-destroy while bound.
#[test]
fn port_lifecycle_and_accounting() {
    let hub = Hub::new(test_config());
    hub.create_port("NullPort", Some("null0".into()), json!({ "num_out_q": 2 }))
        .unwrap();
    hub.create_module(
        "PortOut",
        Some("out0".into()),
        json!({ "port": "null0" }),
    )
    .unwrap();

    // Bound port cannot be destroyed.
    assert!(matches!(
        hub.destroy_port("null0"),
        Err(riffled::error::ControlError::Busy(_))
    ));

    hub.destroy_module("out0").unwrap();
    hub.destroy_port("null0").unwrap();
    assert_eq!(hub.list_ports()["ports"], json!([]));
}

/// The experimental scheduler parks an idle leaf instead of spinning it.
#[test]
fn experimental_scheduler_backs_off_idle_leaf() {
    let mut g = GraphStore::new();
    // A source with an exhausted pool reports block+0 packets every call.
    let src = add_module(&mut g, &SOURCE_CLASS, "s1", json!({}));
    let view = g.build_view();
    let pool = PacketPool::new_plain("exp_e2e", 8, 0); // < one burst

    let mut sched = Scheduler::new(SchedulerKind::Experimental);
    sched.attach_orphan(
        DetachedTc::leaf("l1", Some(TaskSpec { module: src, arg: 0 })),
        0,
    );

    sched.schedule_once(&view, 0, &pool);
    let l1 = sched.find("l1").unwrap();
    assert!(sched.tree.get(l1).unwrap().blocked, "leaf parked");
    assert!(sched.tree.get(l1).unwrap().wakeup_time > 0);
    assert_eq!(sched.wakeup_queue_len(), 1);

    // Further rounds idle rather than re-running the leaf immediately.
    let count_before = sched.tree.get(l1).unwrap().stats.usage[Resource::Count as usize];
    sched.schedule_once(&view, 0, &pool);
    let count_after = sched.tree.get(l1).unwrap().stats.usage[Resource::Count as usize];
    assert_eq!(count_before, count_after);
}

/// add_tc + attach + detach + destroy leaves the registry empty again.
#[test]
fn tc_attach_detach_destroy_round_trip() {
    let hub = Hub::new(test_config());
    hub.add_worker(0, 0, "default").unwrap();

    hub.add_tc(AddTcRequest {
        name: "root_rr".into(),
        policy: "round_robin".into(),
        resource: None,
        limit: None,
        max_burst: None,
        parent: None,
        wid: Some(0),
        priority: None,
        share: None,
    })
    .unwrap();
    hub.add_tc(AddTcRequest {
        name: "wf0".into(),
        policy: "weighted_fair".into(),
        resource: Some("cycle".into()),
        limit: None,
        max_burst: None,
        parent: Some("root_rr".into()),
        wid: None,
        priority: None,
        share: Some(3),
    })
    .unwrap();

    let stats = hub.get_tc_stats("wf0").unwrap();
    assert_eq!(stats["policy"], "weighted_fair");
    assert_eq!(stats["wid"], 0);

    // Duplicate names are rejected.
    assert!(hub
        .add_tc(AddTcRequest {
            name: "wf0".into(),
            policy: "round_robin".into(),
            resource: None,
            limit: None,
            max_burst: None,
            parent: None,
            wid: None,
            priority: None,
            share: None,
        })
        .is_err());

    hub.update_tc_parent(UpdateTcParentRequest {
        name: "wf0".into(),
        parent: None,
        wid: Some(0),
        priority: None,
        share: None,
    })
    .unwrap();

    hub.destroy_tc("wf0").unwrap();
    hub.destroy_tc("root_rr").unwrap();
    assert_eq!(hub.list_tcs()["classes"], json!([]));
}
