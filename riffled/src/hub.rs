//! The hub: one structure owning every registry, behind one lock.
//!
//! Every control-plane entry point lives here. Handlers that could race
//! packet processing run inside the worker pauser: pause the running
//! workers, mutate, then attach orphans, run resume hooks, recompute
//! placement, publish a fresh graph snapshot and resume exactly the workers
//! that were paused.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use log::{error, info, warn};
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::config::Config;
use crate::error::{ControlError, ControlResult};
use crate::gate::{builtin_gatehook_classes, insert_hook, GateHook, GateHookClass, TrackHook};
use crate::graph::{ConstraintViolation, GraphStore, GraphView, ModuleId, TaskHandle, TaskSpec};
use crate::metadata::{registry_summary, AttrRegistry};
use crate::metrics::Metrics;
use crate::module::{
    default_name_template, InitCtx, ModuleClassRegistry, ModuleEvent,
};
use crate::modules::builtin_module_classes;
use crate::pool::{PacketPool, DEFAULT_POOL_CAPACITY};
use crate::port::{
    builtin_port_classes, PortArgs, PortClassRegistry, PortConf, PortInstance,
};
use crate::resume::{
    builtin_resume_hook_classes, ResumeCtx, ResumeHookClass, ResumeHookRegistry,
};
use crate::scheduler::SchedulerKind;
use crate::tc::{
    AttachArgs, DetachedPolicy, DetachedTc, Resource, DEFAULT_PRIORITY,
};
use crate::worker::{core_socket, WorkerSet, ANY_WORKER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcLocation {
    Worker(usize),
    Orphan,
}

pub struct HubInner {
    cfg: Config,
    pub graph: GraphStore,
    pub mclasses: ModuleClassRegistry,
    pub attrs: AttrRegistry,
    pub workers: WorkerSet,
    orphans: Vec<(i64, DetachedTc)>,
    tc_index: HashMap<String, TcLocation>,
    pub ports: HashMap<String, Arc<PortInstance>>,
    pub drivers: PortClassRegistry,
    gatehook_classes: Vec<GateHookClass>,
    resume_hook_classes: Vec<ResumeHookClass>,
    pub resume_hooks: ResumeHookRegistry,
    pools: BTreeMap<u32, Arc<PacketPool>>,
    graph_view: Arc<ArcSwap<GraphView>>,
}

pub struct Hub {
    inner: Mutex<HubInner>,
    graph_view: Arc<ArcSwap<GraphView>>,
    pub metrics: Arc<Metrics>,
    shutdown: watch::Sender<bool>,
}

impl Hub {
    pub fn new(cfg: Config) -> Arc<Hub> {
        let graph_view = Arc::new(ArcSwap::new(GraphView::empty()));

        let mut mclasses = ModuleClassRegistry::default();
        for class in builtin_module_classes() {
            mclasses.register(class);
        }
        let mut drivers = PortClassRegistry::default();
        for class in builtin_port_classes() {
            drivers.register(class);
        }

        let (shutdown, _) = watch::channel(false);
        Arc::new(Hub {
            inner: Mutex::new(HubInner {
                cfg,
                graph: GraphStore::new(),
                mclasses,
                attrs: AttrRegistry::default(),
                workers: WorkerSet::new(),
                orphans: Vec::new(),
                tc_index: HashMap::new(),
                ports: HashMap::new(),
                drivers,
                gatehook_classes: builtin_gatehook_classes(),
                resume_hook_classes: builtin_resume_hook_classes(),
                resume_hooks: ResumeHookRegistry::with_defaults(),
                pools: BTreeMap::new(),
                graph_view: graph_view.clone(),
            }),
            graph_view,
            metrics: Arc::new(Metrics::new()),
            shutdown,
        })
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap()
    }

    /// Run `f` with every previously-running worker paused, then finish the
    /// resume sequence for exactly those workers.
    fn with_pauser<T>(
        &self,
        f: impl FnOnce(&mut HubInner) -> ControlResult<T>,
    ) -> ControlResult<T> {
        let mut inner = self.lock();
        let paused = inner.workers.pause_running();
        if !paused.is_empty() {
            self.metrics.inc_pause();
        }
        let result = f(&mut inner);
        let resumed = inner.finish_resume(&paused, &self.metrics);
        match (result, resumed) {
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
            (Ok(v), Ok(())) => Ok(v),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn pause_all(&self) -> ControlResult<()> {
        self.metrics.inc_control_op();
        let inner = self.lock();
        inner.workers.pause_running();
        self.metrics.inc_pause();
        Ok(())
    }

    pub fn resume_all(&self) -> ControlResult<()> {
        self.metrics.inc_control_op();
        let mut inner = self.lock();
        let all = inner.workers.active_wids();
        inner.finish_resume(&all, &self.metrics)
    }

    pub fn pause_worker(&self, wid: usize) -> ControlResult<()> {
        self.metrics.inc_control_op();
        let inner = self.lock();
        if inner.workers.get(wid).is_none() {
            return Err(ControlError::NotFound(format!("worker {wid}")));
        }
        inner.workers.pause_worker(wid);
        self.metrics.inc_pause();
        Ok(())
    }

    pub fn resume_worker(&self, wid: usize) -> ControlResult<()> {
        self.metrics.inc_control_op();
        let inner = self.lock();
        inner.workers.resume_worker(wid)?;
        self.metrics.inc_resume();
        Ok(())
    }

    pub fn reset_all(&self) -> ControlResult<()> {
        self.metrics.inc_control_op();
        self.with_pauser(|inner| {
            inner.destroy_all_modules()?;
            inner.destroy_all_ports()?;
            inner.clear_all_tcs();
            Ok(())
        })
    }

    pub fn kill(&self) {
        self.metrics.inc_control_op();
        info!("[riffled] kill requested over the control channel");
        let _ = self.shutdown.send(true);
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    pub fn list_workers(&self) -> Value {
        self.metrics.inc_control_op();
        let inner = self.lock();
        let entries: Vec<Value> = inner
            .workers
            .active_wids()
            .into_iter()
            .map(|wid| {
                let w = inner.workers.get(wid).unwrap();
                let sched = w.shared.sched.lock().unwrap();
                let stats = sched.stats();
                json!({
                    "wid": wid,
                    "core": w.shared.core,
                    "socket": w.shared.socket,
                    "status": w.shared.status(),
                    "num_tcs": sched.num_tcs(),
                    "scheduler": sched.kind(),
                    "cnt_idle": stats.cnt_idle,
                    "cycles_idle": stats.cycles_idle,
                })
            })
            .collect();
        json!({ "workers": entries })
    }

    pub fn add_worker(&self, wid: usize, core: usize, scheduler: &str) -> ControlResult<()> {
        self.metrics.inc_control_op();
        let kind = SchedulerKind::parse(scheduler)?;
        let mut inner = self.lock();
        inner.launch_worker(wid, core, kind)
    }

    pub fn destroy_worker(&self, wid: usize) -> ControlResult<()> {
        self.metrics.inc_control_op();
        let mut inner = self.lock();
        {
            let handle = inner
                .workers
                .get(wid)
                .ok_or_else(|| ControlError::NotFound(format!("worker {wid}")))?;
            let sched = handle.shared.sched.lock().unwrap();
            if sched.num_tcs() > 0 {
                return Err(ControlError::Busy(format!(
                    "worker {wid} still has {} traffic classes",
                    sched.num_tcs()
                )));
            }
        }
        inner.workers.destroy_worker(wid)?;
        if inner.workers.num_workers() == 0 {
            // Operator-installed resume hooks die with the last worker.
            inner.resume_hooks.clear_non_default();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Traffic classes
    // ------------------------------------------------------------------

    pub fn list_tcs(&self) -> Value {
        self.metrics.inc_control_op();
        let inner = self.lock();
        let mut entries = Vec::new();
        for wid in inner.workers.active_wids() {
            let w = inner.workers.get(wid).unwrap();
            let sched = w.shared.sched.lock().unwrap();
            if let Some(root) = sched.root() {
                for id in sched.tree.subtree(root) {
                    let node = sched.tree.get(id).unwrap();
                    let parent = node
                        .parent
                        .and_then(|p| sched.tree.get(p))
                        .map(|p| p.name.clone());
                    entries.push(json!({
                        "name": node.name,
                        "policy": node.policy.kind(),
                        "blocked": node.blocked,
                        "parent": parent,
                        "wid": wid,
                    }));
                }
            }
        }
        for (hint, det) in &inner.orphans {
            let mut names = Vec::new();
            det.names(&mut names);
            for name in names {
                let sub = det.find(&name).unwrap();
                entries.push(json!({
                    "name": name,
                    "policy": sub.kind(),
                    "blocked": Value::Null,
                    "parent": if name == det.name { Value::Null } else { Value::String(det.name.clone()) },
                    "wid": if *hint < 0 { Value::Null } else { json!(hint) },
                }));
            }
        }
        json!({ "classes": entries })
    }

    pub fn add_tc(&self, req: AddTcRequest) -> ControlResult<()> {
        self.metrics.inc_control_op();
        self.with_pauser(|inner| {
            if inner.tc_index.contains_key(&req.name) {
                return Err(ControlError::AlreadyExists(format!(
                    "traffic class {}",
                    req.name
                )));
            }
            let det = build_detached(&req)?;
            match &req.parent {
                Some(parent) => inner.attach_under(parent, det, &req),
                None => {
                    let hint = req.wid.unwrap_or(ANY_WORKER);
                    inner.tc_index.insert(req.name.clone(), TcLocation::Orphan);
                    inner.orphans.push((hint, det));
                    Ok(())
                }
            }
        })
    }

    pub fn update_tc_params(&self, req: UpdateTcParamsRequest) -> ControlResult<()> {
        self.metrics.inc_control_op();
        self.with_pauser(|inner| {
            let resource = Resource::parse(req.resource.as_deref().unwrap_or("count"))?;
            let location = *inner
                .tc_index
                .get(&req.name)
                .ok_or_else(|| ControlError::NotFound(format!("traffic class {}", req.name)))?;
            match location {
                TcLocation::Worker(wid) => {
                    let w = inner.workers.get(wid).unwrap();
                    let mut sched = w.shared.sched.lock().unwrap();
                    let id = sched
                        .find(&req.name)
                        .ok_or_else(|| ControlError::NotFound(format!("traffic class {}", req.name)))?;
                    sched.tree.update_rate_limit(
                        id,
                        resource,
                        req.limit.unwrap_or(0),
                        req.max_burst.unwrap_or(0),
                    )
                }
                TcLocation::Orphan => {
                    let det = inner
                        .orphan_mut(&req.name)
                        .ok_or_else(|| ControlError::NotFound(format!("traffic class {}", req.name)))?;
                    match &mut det.policy {
                        DetachedPolicy::RateLimit {
                            resource: res,
                            limit_arg,
                            max_burst_arg,
                            ..
                        } => {
                            *res = resource;
                            *limit_arg = req.limit.unwrap_or(0);
                            *max_burst_arg = req.max_burst.unwrap_or(0);
                            Ok(())
                        }
                        _ => Err(ControlError::InvalidArgument(format!(
                            "{} is not a rate_limit class",
                            req.name
                        ))),
                    }
                }
            }
        })
    }

    /// Re-parent a class: detach it from wherever it lives and attach it
    /// under the new parent (or leave it an orphan when `parent` is None).
    /// Weighted-fair passes and rate-limit tokens restart from zero.
    pub fn update_tc_parent(&self, req: UpdateTcParentRequest) -> ControlResult<()> {
        self.metrics.inc_control_op();
        self.with_pauser(|inner| {
            let det = inner.detach_tc(&req.name)?;
            match &req.parent {
                Some(parent) => {
                    let attach_req = AddTcRequest {
                        name: req.name.clone(),
                        policy: det.kind().to_string(),
                        resource: None,
                        limit: None,
                        max_burst: None,
                        parent: Some(parent.clone()),
                        wid: req.wid,
                        priority: req.priority,
                        share: req.share,
                    };
                    inner.attach_under(parent, det, &attach_req)
                }
                None => {
                    let hint = req.wid.unwrap_or(ANY_WORKER);
                    let mut names = Vec::new();
                    det.names(&mut names);
                    for name in names {
                        inner.tc_index.insert(name, TcLocation::Orphan);
                    }
                    inner.orphans.push((hint, det));
                    Ok(())
                }
            }
        })
    }

    /// Destroy a childless policy class, detaching it first if necessary.
    /// Task-bound leaves belong to their module and cannot be destroyed
    /// directly.
    pub fn destroy_tc(&self, name: &str) -> ControlResult<()> {
        self.metrics.inc_control_op();
        self.with_pauser(|inner| {
            let location = *inner
                .tc_index
                .get(name)
                .ok_or_else(|| ControlError::NotFound(format!("traffic class {name}")))?;
            match location {
                TcLocation::Worker(wid) => {
                    let w = inner.workers.get(wid).unwrap();
                    let sched = w.shared.sched.lock().unwrap();
                    let id = sched
                        .find(name)
                        .ok_or_else(|| ControlError::NotFound(format!("traffic class {name}")))?;
                    if sched.tree.size(id) > 1 {
                        return Err(ControlError::Busy(format!("{name} still has children")));
                    }
                    if sched.tree.leaf_task(id).is_some() {
                        return Err(ControlError::InvalidArgument(format!(
                            "{name} is a task leaf; destroy its module instead"
                        )));
                    }
                }
                TcLocation::Orphan => {
                    let det = inner
                        .orphan_ref(name)
                        .ok_or_else(|| ControlError::NotFound(format!("traffic class {name}")))?;
                    let mut names = Vec::new();
                    det.names(&mut names);
                    if names.len() > 1 {
                        return Err(ControlError::Busy(format!("{name} still has children")));
                    }
                    if matches!(det.policy, DetachedPolicy::Leaf { task: Some(_) }) {
                        return Err(ControlError::InvalidArgument(format!(
                            "{name} is a task leaf; destroy its module instead"
                        )));
                    }
                }
            }
            drop(inner.detach_tc(name)?);
            Ok(())
        })
    }

    pub fn get_tc_stats(&self, name: &str) -> ControlResult<Value> {
        self.metrics.inc_control_op();
        let inner = self.lock();
        let location = *inner
            .tc_index
            .get(name)
            .ok_or_else(|| ControlError::NotFound(format!("traffic class {name}")))?;
        match location {
            TcLocation::Worker(wid) => {
                let w = inner.workers.get(wid).unwrap();
                let sched = w.shared.sched.lock().unwrap();
                let id = sched
                    .find(name)
                    .ok_or_else(|| ControlError::NotFound(format!("traffic class {name}")))?;
                let mut v = sched.tree.describe(id).unwrap_or(Value::Null);
                v["wid"] = json!(wid);
                Ok(v)
            }
            TcLocation::Orphan => {
                let det = inner
                    .orphan_ref(name)
                    .ok_or_else(|| ControlError::NotFound(format!("traffic class {name}")))?;
                Ok(json!({
                    "name": det.name,
                    "policy": det.kind(),
                    "stats": det.stats,
                    "wid": Value::Null,
                }))
            }
        }
    }

    /// Tear every policy node down; task-bound leaves survive as orphans
    /// hinted back at the worker they ran on.
    pub fn reset_tcs(&self) -> ControlResult<()> {
        self.metrics.inc_control_op();
        self.with_pauser(|inner| {
            inner.reduce_tcs_to_leaves();
            Ok(())
        })
    }

    pub fn check_scheduling_constraints(&self) -> ControlResult<Value> {
        self.metrics.inc_control_op();
        let mut inner = self.lock();
        let violations = inner.propagate_and_check();
        self.metrics.add_constraint_violations(violations.len() as u64);
        Ok(json!({
            "fatal": violations.iter().any(|v| v.fatal),
            "violations": violations,
        }))
    }

    // ------------------------------------------------------------------
    // Ports
    // ------------------------------------------------------------------

    pub fn list_drivers(&self) -> Value {
        self.metrics.inc_control_op();
        let inner = self.lock();
        let names: Vec<&str> = inner.drivers.iter().map(|c| c.name).collect();
        json!({ "drivers": names })
    }

    pub fn get_driver_info(&self, name: &str) -> ControlResult<Value> {
        self.metrics.inc_control_op();
        let inner = self.lock();
        let class = inner.drivers.get(name)?;
        Ok(json!({
            "name": class.name,
            "help": class.help,
            "name_template": class.name_template,
        }))
    }

    pub fn list_ports(&self) -> Value {
        self.metrics.inc_control_op();
        let inner = self.lock();
        let entries: Vec<Value> = inner
            .ports
            .values()
            .map(|p| {
                json!({
                    "name": p.name,
                    "driver": p.class.name,
                    "num_inc_q": p.num_queues[0],
                    "num_out_q": p.num_queues[1],
                    "conf": &*p.conf.lock().unwrap(),
                })
            })
            .collect();
        json!({ "ports": entries })
    }

    pub fn create_port(
        &self,
        driver: &str,
        name: Option<String>,
        arg: Value,
    ) -> ControlResult<Value> {
        self.metrics.inc_control_op();
        let mut inner = self.lock();
        let class = inner.drivers.get(driver)?;
        let name = match name {
            Some(name) => {
                if inner.ports.contains_key(&name) {
                    return Err(ControlError::AlreadyExists(format!("port {name}")));
                }
                name
            }
            None => {
                let template = if class.name_template.is_empty() {
                    class.name.to_lowercase()
                } else {
                    class.name_template.to_string()
                };
                (0..)
                    .map(|i| format!("{template}{i}"))
                    .find(|n| !inner.ports.contains_key(n))
                    .unwrap()
            }
        };
        let args: PortArgs = serde_json::from_value(arg.clone())
            .map_err(|e| ControlError::InvalidArgument(format!("port args: {e}")))?;
        let imp = (class.init)(&arg)?;
        let port = Arc::new(PortInstance::new(name.clone(), class, imp, &args)?);
        inner.ports.insert(name.clone(), port);
        Ok(json!({ "name": name }))
    }

    pub fn destroy_port(&self, name: &str) -> ControlResult<()> {
        self.metrics.inc_control_op();
        self.with_pauser(|inner| {
            let port = inner
                .ports
                .get(name)
                .ok_or_else(|| ControlError::NotFound(format!("port {name}")))?;
            if port.in_use() {
                return Err(ControlError::Busy(format!("port {name}")));
            }
            port.imp.deinit();
            inner.ports.remove(name);
            Ok(())
        })
    }

    pub fn get_port_conf(&self, name: &str) -> ControlResult<Value> {
        self.metrics.inc_control_op();
        let inner = self.lock();
        let port = inner
            .ports
            .get(name)
            .ok_or_else(|| ControlError::NotFound(format!("port {name}")))?;
        let conf = json!(&*port.conf.lock().unwrap());
        Ok(conf)
    }

    pub fn set_port_conf(&self, name: &str, conf: PortConf) -> ControlResult<()> {
        self.metrics.inc_control_op();
        self.with_pauser(|inner| {
            let port = inner
                .ports
                .get(name)
                .ok_or_else(|| ControlError::NotFound(format!("port {name}")))?;
            port.update_conf(conf)
        })
    }

    pub fn get_port_stats(&self, name: &str) -> ControlResult<Value> {
        self.metrics.inc_control_op();
        let inner = self.lock();
        let port = inner
            .ports
            .get(name)
            .ok_or_else(|| ControlError::NotFound(format!("port {name}")))?;
        port.imp.collect_stats(false);
        Ok(port.stats_snapshot())
    }

    pub fn get_link_status(&self, name: &str) -> ControlResult<Value> {
        self.metrics.inc_control_op();
        let inner = self.lock();
        let port = inner
            .ports
            .get(name)
            .ok_or_else(|| ControlError::NotFound(format!("port {name}")))?;
        Ok(json!(port.imp.link_status()))
    }

    pub fn reset_ports(&self) -> ControlResult<()> {
        self.metrics.inc_control_op();
        self.with_pauser(|inner| inner.destroy_all_ports())
    }

    // ------------------------------------------------------------------
    // Modules
    // ------------------------------------------------------------------

    pub fn list_mclasses(&self) -> Value {
        self.metrics.inc_control_op();
        let inner = self.lock();
        let names: Vec<&str> = inner.mclasses.iter().map(|c| c.name).collect();
        json!({ "classes": names })
    }

    pub fn get_mclass_info(&self, name: &str) -> ControlResult<Value> {
        self.metrics.inc_control_op();
        let inner = self.lock();
        let class = inner.mclasses.get(name)?;
        Ok(json!({
            "name": class.name,
            "help": class.help,
            "igates": class.igates,
            "ogates": class.ogates,
            "commands": class.commands,
        }))
    }

    pub fn list_modules(&self) -> Value {
        self.metrics.inc_control_op();
        let inner = self.lock();
        let entries: Vec<Value> = inner
            .graph
            .iter()
            .map(|node| {
                json!({
                    "name": node.name,
                    "mclass": node.class.name,
                    "desc": node.imp.desc(),
                    "deadends": node.stats.deadends.load(std::sync::atomic::Ordering::Relaxed),
                })
            })
            .collect();
        json!({ "modules": entries })
    }

    pub fn create_module(
        &self,
        mclass: &str,
        name: Option<String>,
        arg: Value,
    ) -> ControlResult<Value> {
        self.metrics.inc_control_op();
        let created = self.with_pauser(|inner| inner.create_module(mclass, name, arg))?;
        self.metrics.inc_graph_update();
        Ok(json!({ "name": created }))
    }

    pub fn destroy_module(&self, name: &str) -> ControlResult<()> {
        self.metrics.inc_control_op();
        self.with_pauser(|inner| inner.destroy_module(name))?;
        self.metrics.inc_graph_update();
        Ok(())
    }

    pub fn get_module_info(&self, name: &str) -> ControlResult<Value> {
        self.metrics.inc_control_op();
        let inner = self.lock();
        let node = inner.graph.by_name(name)?;
        let igates: Vec<Value> = node
            .igates
            .iter()
            .enumerate()
            .filter_map(|(idx, ig)| ig.as_ref().map(|ig| (idx, ig)))
            .map(|(idx, ig)| {
                let upstream: Vec<Value> = ig
                    .upstream
                    .iter()
                    .filter_map(|&(m, og)| {
                        inner.graph.get(m).ok().map(|n| json!({ "module": n.name, "ogate": og }))
                    })
                    .collect();
                json!({
                    "igate": idx,
                    "upstream": upstream,
                    "hooks": ig.hooks.iter().map(|h| h.name()).collect::<Vec<_>>(),
                })
            })
            .collect();
        let ogates: Vec<Value> = node
            .ogates
            .iter()
            .enumerate()
            .filter_map(|(idx, og)| og.as_ref().map(|og| (idx, og)))
            .map(|(idx, og)| {
                let target = inner
                    .graph
                    .get(og.target)
                    .map(|n| n.name.clone())
                    .unwrap_or_default();
                json!({
                    "ogate": idx,
                    "module": target,
                    "igate": og.target_igate,
                    "hooks": og.hooks.iter().map(|h| h.name()).collect::<Vec<_>>(),
                })
            })
            .collect();
        let attrs: Vec<Value> = node
            .attrs
            .iter()
            .zip(node.attr_offsets.iter())
            .map(|(a, off)| json!({ "name": a.name, "size": a.size, "mode": a.mode, "offset": off }))
            .collect();
        Ok(json!({
            "name": node.name,
            "mclass": node.class.name,
            "desc": node.imp.desc(),
            "igates": igates,
            "ogates": ogates,
            "metadata": attrs,
            "tasks": node.tasks.iter().map(|t| json!({ "leaf": t.leaf, "arg": t.arg })).collect::<Vec<_>>(),
            "active_workers": (0..crate::worker::MAX_WORKERS).filter(|&w| node.has_worker(w)).collect::<Vec<_>>(),
            "deadends": node.stats.deadends.load(std::sync::atomic::Ordering::Relaxed),
        }))
    }

    pub fn connect_modules(
        &self,
        m1: &str,
        ogate: u16,
        m2: &str,
        igate: u16,
        skip_default_hooks: bool,
    ) -> ControlResult<()> {
        self.metrics.inc_control_op();
        self.with_pauser(|inner| {
            let from = inner
                .graph
                .find(m1)
                .ok_or_else(|| ControlError::NotFound(format!("module {m1}")))?;
            let to = inner
                .graph
                .find(m2)
                .ok_or_else(|| ControlError::NotFound(format!("module {m2}")))?;
            let mut default_hooks: Vec<Arc<dyn GateHook>> = Vec::new();
            if inner.cfg.runtime.track_gates && !skip_default_hooks {
                default_hooks.push(Arc::new(TrackHook::new(false)));
            }
            inner.graph.connect(from, ogate, to, igate, default_hooks)
        })?;
        self.metrics.inc_graph_update();
        Ok(())
    }

    pub fn disconnect_modules(&self, m1: &str, ogate: u16) -> ControlResult<()> {
        self.metrics.inc_control_op();
        self.with_pauser(|inner| {
            let from = inner
                .graph
                .find(m1)
                .ok_or_else(|| ControlError::NotFound(format!("module {m1}")))?;
            inner.graph.disconnect(from, ogate)
        })?;
        self.metrics.inc_graph_update();
        Ok(())
    }

    pub fn reset_modules(&self) -> ControlResult<()> {
        self.metrics.inc_control_op();
        self.with_pauser(|inner| inner.destroy_all_modules())
    }

    pub fn module_command(&self, name: &str, cmd: &str, arg: &Value) -> ControlResult<Value> {
        self.metrics.inc_control_op();
        let inner = self.lock();
        let node = inner.graph.by_name(name)?;
        if cmd == "get_initial_arg" {
            return Ok(node.initial_arg.clone());
        }
        if let Some(desc) = node.class.find_command(cmd) {
            if !desc.mt_safe {
                let running = inner
                    .workers
                    .active_wids()
                    .into_iter()
                    .any(|wid| node.has_worker(wid) && inner.workers.is_running(wid));
                if running {
                    return Err(ControlError::Busy(format!(
                        "worker is running and command '{cmd}' is not MT-safe"
                    )));
                }
            }
        }
        node.imp.command(cmd, arg)
    }

    // ------------------------------------------------------------------
    // Gate hooks & resume hooks
    // ------------------------------------------------------------------

    pub fn list_gatehook_classes(&self) -> Value {
        self.metrics.inc_control_op();
        let inner = self.lock();
        let entries: Vec<Value> = inner
            .gatehook_classes
            .iter()
            .map(|c| json!({ "name": c.name, "help": c.help }))
            .collect();
        json!({ "classes": entries })
    }

    pub fn get_gatehook_class_info(&self, name: &str) -> ControlResult<Value> {
        self.metrics.inc_control_op();
        let inner = self.lock();
        inner
            .gatehook_classes
            .iter()
            .find(|c| c.name == name)
            .map(|c| json!({ "name": c.name, "help": c.help }))
            .ok_or_else(|| ControlError::NotFound(format!("gate hook class {name}")))
    }

    pub fn list_gatehooks(&self) -> Value {
        self.metrics.inc_control_op();
        let inner = self.lock();
        let mut entries = Vec::new();
        for node in inner.graph.iter() {
            for (idx, ig) in node.igates.iter().enumerate() {
                let Some(ig) = ig else { continue };
                for hook in &ig.hooks {
                    entries.push(json!({
                        "module": node.name,
                        "gate": idx,
                        "dir": "in",
                        "class": hook.class_name(),
                        "state": hook.snapshot(),
                    }));
                }
            }
            for (idx, og) in node.ogates.iter().enumerate() {
                let Some(og) = og else { continue };
                for hook in &og.hooks {
                    entries.push(json!({
                        "module": node.name,
                        "gate": idx,
                        "dir": "out",
                        "class": hook.class_name(),
                        "state": hook.snapshot(),
                    }));
                }
            }
        }
        json!({ "hooks": entries })
    }

    pub fn configure_gatehook(&self, req: ConfigureGatehookRequest) -> ControlResult<()> {
        self.metrics.inc_control_op();
        self.with_pauser(|inner| {
            let builder = inner
                .gatehook_classes
                .iter()
                .find(|c| c.name == req.class)
                .map(|c| c.builder)
                .ok_or_else(|| ControlError::NotFound(format!("gate hook class {}", req.class)))?;
            let id = inner
                .graph
                .find(&req.module)
                .ok_or_else(|| ControlError::NotFound(format!("module {}", req.module)))?;
            let node = inner.graph.get_mut(id)?;
            let hooks = match req.dir.as_str() {
                "out" => node
                    .ogates
                    .get_mut(req.gate as usize)
                    .and_then(Option::as_mut)
                    .map(|og| &mut og.hooks),
                "in" => node
                    .igates
                    .get_mut(req.gate as usize)
                    .and_then(Option::as_mut)
                    .map(|ig| &mut ig.hooks),
                other => {
                    return Err(ControlError::InvalidArgument(format!(
                        "dir must be 'in' or 'out', got '{other}'"
                    )))
                }
            }
            .ok_or_else(|| {
                ControlError::NotFound(format!("{}:{} gate {}", req.module, req.dir, req.gate))
            })?;
            if req.enable {
                if hooks.iter().any(|h| h.class_name() == req.class) {
                    return Err(ControlError::AlreadyExists(format!(
                        "hook {} on {}:{}",
                        req.class, req.module, req.gate
                    )));
                }
                let hook = builder(&req.arg)?;
                insert_hook(hooks, hook);
            } else {
                hooks.retain(|h| h.class_name() != req.class);
            }
            Ok(())
        })
    }

    pub fn gatehook_command(&self, req: GatehookCommandRequest) -> ControlResult<Value> {
        self.metrics.inc_control_op();
        let inner = self.lock();
        let node = inner.graph.by_name(&req.module)?;
        let hook = match req.dir.as_str() {
            "out" => node
                .ogates
                .get(req.gate as usize)
                .and_then(Option::as_ref)
                .and_then(|og| og.hooks.iter().find(|h| h.class_name() == req.class)),
            _ => node
                .igates
                .get(req.gate as usize)
                .and_then(Option::as_ref)
                .and_then(|ig| ig.hooks.iter().find(|h| h.class_name() == req.class)),
        }
        .ok_or_else(|| {
            ControlError::NotFound(format!(
                "hook {} on {}:{} gate {}",
                req.class, req.module, req.dir, req.gate
            ))
        })?;
        hook.command(&req.cmd, &req.arg)
    }

    pub fn configure_resume_hook(&self, name: &str, enable: bool, arg: &Value) -> ControlResult<()> {
        self.metrics.inc_control_op();
        let mut inner = self.lock();
        if enable {
            if inner.resume_hooks.contains(name) {
                return Err(ControlError::AlreadyExists(format!("resume hook {name}")));
            }
            let builder = inner
                .resume_hook_classes
                .iter()
                .find(|c| c.name == name)
                .map(|c| c.builder)
                .ok_or_else(|| ControlError::NotFound(format!("resume hook class {name}")))?;
            let hook = builder(arg)?;
            inner.resume_hooks.add(hook);
        } else if !inner.resume_hooks.remove(name) {
            return Err(ControlError::NotFound(format!("resume hook {name}")));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Misc
    // ------------------------------------------------------------------

    pub fn dump_mempool(&self) -> Value {
        self.metrics.inc_control_op();
        let inner = self.lock();
        let pools: Vec<Value> = inner
            .pools
            .values()
            .map(|p| {
                json!({
                    "name": p.name(),
                    "socket": p.socket(),
                    "capacity": p.capacity(),
                    "available": p.available(),
                    "pinned": p.is_pinned(),
                    "physically_contiguous": p.is_physically_contiguous(),
                })
            })
            .collect();
        json!({ "pools": pools })
    }

    pub fn list_attributes(&self) -> Value {
        self.metrics.inc_control_op();
        let inner = self.lock();
        json!({ "attributes": registry_summary(&inner.attrs) })
    }

    pub fn import_plugin(&self, path: &str) -> ControlResult<()> {
        self.metrics.inc_control_op();
        Err(ControlError::NotSupported(format!(
            "dynamic plugin loading ({path})"
        )))
    }

    pub fn unload_plugin(&self, path: &str) -> ControlResult<()> {
        self.metrics.inc_control_op();
        Err(ControlError::NotSupported(format!(
            "dynamic plugin loading ({path})"
        )))
    }

    pub fn list_plugins(&self) -> Value {
        self.metrics.inc_control_op();
        json!({ "plugins": [] })
    }

    pub fn status(&self) -> Value {
        let inner = self.lock();
        json!({
            "version": self.version(),
            "uptime_s": self.metrics.uptime_seconds(),
            "workers": inner.workers.num_workers(),
            "modules": inner.graph.len(),
            "ports": inner.ports.len(),
            "orphan_tcs": inner.orphans.len(),
            "control_ops": self.metrics.control_ops(),
            "pauses": self.metrics.pauses(),
            "resumes": self.metrics.resumes(),
            "graph_updates": self.metrics.graph_updates(),
        })
    }

    /// Handle used by workers and tests to observe published snapshots.
    pub fn graph_view(&self) -> Arc<ArcSwap<GraphView>> {
        self.graph_view.clone()
    }

    /// Register an out-of-tree module class (tests, embedding).
    pub fn register_module_class(&self, class: &'static crate::module::ModuleClass) {
        self.lock().mclasses.register(class);
    }
}

// ----------------------------------------------------------------------
// HubInner: the actual operations, running under the hub lock.
// ----------------------------------------------------------------------

impl HubInner {
    fn pool_for_socket(&mut self, socket: u32) -> Arc<PacketPool> {
        if let Some(pool) = self.pools.get(&socket) {
            return pool.clone();
        }
        let capacity = self
            .cfg
            .runtime
            .buffers_per_socket
            .min(DEFAULT_POOL_CAPACITY)
            .max(64);
        let name = format!("pframe{socket}");
        let pool = if self.cfg.runtime.plain_pools {
            Arc::new(PacketPool::new_plain(&name, capacity, socket))
        } else {
            match PacketPool::new_hugepage(&name, capacity, socket) {
                Ok(pool) => Arc::new(pool),
                Err(err) => {
                    warn!("[riffled] huge-page pool for socket {socket} failed ({err}); falling back to plain pages");
                    Arc::new(PacketPool::new_plain(&name, capacity, socket))
                }
            }
        };
        self.pools.insert(socket, pool.clone());
        pool
    }

    fn launch_worker(&mut self, wid: usize, core: usize, kind: SchedulerKind) -> ControlResult<()> {
        let pool = self.pool_for_socket(core_socket(core));
        self.workers
            .launch(wid, core, kind, self.graph_view.clone(), pool)
    }

    fn orphan_ref(&self, name: &str) -> Option<&DetachedTc> {
        self.orphans.iter().find_map(|(_, det)| det.find(name))
    }

    fn orphan_mut(&mut self, name: &str) -> Option<&mut DetachedTc> {
        self.orphans
            .iter_mut()
            .find_map(|(_, det)| det.find_mut(name))
    }

    /// Attach a detached class under the named parent, wherever it lives.
    fn attach_under(
        &mut self,
        parent: &str,
        det: DetachedTc,
        req: &AddTcRequest,
    ) -> ControlResult<()> {
        let mut subtree_names = Vec::new();
        det.names(&mut subtree_names);
        let location = *self
            .tc_index
            .get(parent)
            .ok_or_else(|| ControlError::NotFound(format!("traffic class {parent}")))?;
        match location {
            TcLocation::Worker(wid) => {
                let args = {
                    let w = self.workers.get(wid).unwrap();
                    let sched = w.shared.sched.lock().unwrap();
                    let pid = sched
                        .find(parent)
                        .ok_or_else(|| ControlError::NotFound(format!("traffic class {parent}")))?;
                    attach_args_for(sched.tree.get(pid).unwrap().policy.kind(), req)?
                };
                let w = self.workers.get(wid).unwrap();
                let mut sched = w.shared.sched.lock().unwrap();
                let pid = sched
                    .find(parent)
                    .ok_or_else(|| ControlError::NotFound(format!("traffic class {parent}")))?;
                let id = sched.tree.graft(det);
                if let Err(err) = sched.tree.add_child(pid, id, args) {
                    // Leave nothing half-grafted behind.
                    let _ = sched.tree.extract(id);
                    return Err(err);
                }
                for name in subtree_names {
                    self.tc_index.insert(name, TcLocation::Worker(wid));
                }
                Ok(())
            }
            TcLocation::Orphan => {
                let root = self
                    .orphans
                    .iter_mut()
                    .find(|(_, d)| d.find(parent).is_some())
                    .map(|(_, d)| d)
                    .ok_or_else(|| ControlError::NotFound(format!("traffic class {parent}")))?;
                let args = attach_args_for(root.find(parent).unwrap().kind(), req)?;
                root.add_child_at(parent, args, det)?;
                for name in subtree_names {
                    self.tc_index.insert(name, TcLocation::Orphan);
                }
                Ok(())
            }
        }
    }

    /// Pull a class (and its subtree) out of wherever it lives.
    fn detach_tc(&mut self, name: &str) -> ControlResult<DetachedTc> {
        let location = *self
            .tc_index
            .get(name)
            .ok_or_else(|| ControlError::NotFound(format!("traffic class {name}")))?;
        let det = match location {
            TcLocation::Worker(wid) => {
                let w = self.workers.get(wid).unwrap();
                let mut sched = w.shared.sched.lock().unwrap();
                sched
                    .detach_class(name)
                    .ok_or_else(|| ControlError::NotFound(format!("traffic class {name}")))?
            }
            TcLocation::Orphan => {
                if let Some(pos) = self.orphans.iter().position(|(_, d)| d.name == name) {
                    self.orphans.remove(pos).1
                } else {
                    self.orphans
                        .iter_mut()
                        .find_map(|(_, d)| d.remove_child_at(name))
                        .ok_or_else(|| ControlError::NotFound(format!("traffic class {name}")))?
                }
            }
        };
        let mut names = Vec::new();
        det.names(&mut names);
        for n in names {
            self.tc_index.remove(&n);
        }
        Ok(det)
    }

    fn clear_all_tcs(&mut self) {
        for wid in self.workers.active_wids() {
            let w = self.workers.get(wid).unwrap();
            let mut sched = w.shared.sched.lock().unwrap();
            while let Some(root) = sched.root() {
                let name = sched.tree.get(root).unwrap().name.clone();
                let _ = sched.detach_class(&name);
            }
        }
        self.orphans.clear();
        self.tc_index.clear();
    }

    fn reduce_tcs_to_leaves(&mut self) {
        let mut leaves: Vec<(i64, DetachedTc)> = Vec::new();
        for wid in self.workers.active_wids() {
            let w = self.workers.get(wid).unwrap();
            let mut sched = w.shared.sched.lock().unwrap();
            while let Some(root) = sched.root() {
                let name = sched.tree.get(root).unwrap().name.clone();
                if let Some(det) = sched.detach_class(&name) {
                    let mut out = Vec::new();
                    det.collect_leaves(&mut out);
                    leaves.extend(out.into_iter().map(|l| (wid as i64, l)));
                }
            }
        }
        for (_, det) in self.orphans.drain(..) {
            let mut out = Vec::new();
            det.collect_leaves(&mut out);
            leaves.extend(out.into_iter().map(|l| (ANY_WORKER, l)));
        }
        self.tc_index.clear();
        for (hint, leaf) in leaves {
            self.tc_index.insert(leaf.name.clone(), TcLocation::Orphan);
            self.orphans.push((hint, leaf));
        }
    }

    fn create_module(
        &mut self,
        mclass: &str,
        name: Option<String>,
        arg: Value,
    ) -> ControlResult<String> {
        let class = self.mclasses.get(mclass)?;
        let name = match name {
            Some(name) => {
                if self.graph.find(&name).is_some() {
                    return Err(ControlError::AlreadyExists(format!("module {name}")));
                }
                name
            }
            None => self.graph.generate_name(&default_name_template(class)),
        };

        let mut ictx = InitCtx::default();
        ictx.ports = self.ports.clone();
        let imp = (class.init)(&arg, &mut ictx)?;

        // Attribute registration must agree with every other module's view
        // of the name; roll back on conflict.
        let mut registered = Vec::new();
        for attr in &ictx.attrs {
            match self.attrs.register(&attr.name, attr.size) {
                Ok(()) => registered.push(attr.name.clone()),
                Err(msg) => {
                    for done in registered {
                        self.attrs.deregister(&done);
                    }
                    imp.deinit();
                    return Err(ControlError::InvalidArgument(msg));
                }
            }
        }

        let task_args = ictx.tasks.clone();
        let id = self
            .graph
            .insert(name.clone(), class, imp.into(), ictx, arg)?;

        for (tid, task_arg) in task_args.iter().enumerate() {
            let leaf_name = format!("!leaf_{name}:{tid}");
            let leaf = DetachedTc::leaf(
                &leaf_name,
                Some(TaskSpec {
                    module: id,
                    arg: *task_arg,
                }),
            );
            self.graph.get_mut(id)?.tasks.push(TaskHandle {
                leaf: leaf_name.clone(),
                arg: *task_arg,
            });
            self.tc_index.insert(leaf_name, TcLocation::Orphan);
            self.orphans.push((ANY_WORKER, leaf));
        }
        Ok(name)
    }

    fn destroy_module(&mut self, name: &str) -> ControlResult<()> {
        let id = self
            .graph
            .find(name)
            .ok_or_else(|| ControlError::NotFound(format!("module {name}")))?;
        let (leaf_names, attr_names) = {
            let node = self.graph.get(id)?;
            node.imp.deinit();
            (
                node.tasks.iter().map(|t| t.leaf.clone()).collect::<Vec<_>>(),
                node.attrs.iter().map(|a| a.name.clone()).collect::<Vec<_>>(),
            )
        };
        for leaf in leaf_names {
            match self.detach_tc(&leaf) {
                Ok(det) => drop(det),
                Err(err) => warn!("[riffled] task leaf {leaf} vanished early: {err}"),
            }
        }
        for attr in attr_names {
            self.attrs.deregister(&attr);
        }
        self.graph.disconnect_all(id)?;
        self.graph.remove(id)?;
        Ok(())
    }

    fn destroy_all_modules(&mut self) -> ControlResult<()> {
        let names: Vec<String> = self.graph.iter().map(|n| n.name.clone()).collect();
        for name in names {
            self.destroy_module(&name)?;
        }
        Ok(())
    }

    fn destroy_all_ports(&mut self) -> ControlResult<()> {
        let names: Vec<String> = self.ports.keys().cloned().collect();
        for name in names {
            let port = self.ports.get(&name).unwrap();
            if port.in_use() {
                return Err(ControlError::Busy(format!("port {name}")));
            }
            port.imp.deinit();
            self.ports.remove(&name);
        }
        Ok(())
    }

    /// Hand every orphan to a scheduler. Preserves the historical quirk of
    /// silently conjuring worker 0 when tasks exist but no worker does.
    fn attach_orphans(&mut self) -> ControlResult<()> {
        if self.orphans.is_empty() {
            return Ok(());
        }
        if self.workers.num_workers() == 0 {
            let core = self.cfg.runtime.default_core;
            let kind = SchedulerKind::parse(&self.cfg.runtime.default_scheduler)?;
            warn!(
                "[riffled] no workers exist; implicitly launching worker 0 on core {core} to host orphan classes"
            );
            self.launch_worker(0, core, kind)?;
        }
        let orphans = std::mem::take(&mut self.orphans);
        for (hint, det) in orphans {
            let wid = if hint >= 0 && self.workers.get(hint as usize).is_some() {
                hint as usize
            } else {
                match self.workers.next_active_worker() {
                    Some(wid) => wid,
                    None => {
                        // Could not place it; keep it an orphan.
                        self.orphans.push((hint, det));
                        continue;
                    }
                }
            };
            let mut names = Vec::new();
            det.names(&mut names);
            let w = self.workers.get(wid).unwrap();
            let mut sched = w.shared.sched.lock().unwrap();
            sched.attach_orphan(det, wid);
            drop(sched);
            for name in names {
                self.tc_index.insert(name, TcLocation::Worker(wid));
            }
        }
        Ok(())
    }

    fn propagate_and_check(&mut self) -> Vec<ConstraintViolation> {
        self.graph.reset_active_workers();
        for wid in self.workers.active_wids() {
            let tasks = {
                let w = self.workers.get(wid).unwrap();
                let sched = w.shared.sched.lock().unwrap();
                sched.tasks()
            };
            for (_, spec) in tasks {
                self.graph.add_active_worker(wid, spec);
            }
        }
        self.graph.check_constraints(&self.workers.sockets())
    }

    /// The back half of the worker pauser: orphans, hooks, constraints,
    /// snapshot, PreResume events, resume.
    fn finish_resume(&mut self, paused: &[usize], metrics: &Metrics) -> ControlResult<()> {
        self.attach_orphans()?;

        for wid in self.workers.active_wids() {
            let w = self.workers.get(wid).unwrap();
            let mut sched = w.shared.sched.lock().unwrap();
            sched.adjust_default();
            // Collapsing may have renamed the topology; refresh the index.
            if let Some(root) = sched.root() {
                for id in sched.tree.subtree(root) {
                    let name = sched.tree.get(id).unwrap().name.clone();
                    self.tc_index.insert(name, TcLocation::Worker(wid));
                }
            }
        }
        let workers = &self.workers;
        self.tc_index.retain(|name, loc| match loc {
            TcLocation::Orphan => true,
            TcLocation::Worker(wid) => workers
                .get(*wid)
                .map(|w| {
                    let sched = w.shared.sched.lock().unwrap();
                    sched.find(name).is_some()
                })
                .unwrap_or(false),
        });

        {
            let HubInner {
                ref mut graph,
                ref attrs,
                ref resume_hooks,
                ..
            } = *self;
            let mut ctx = ResumeCtx { graph, attrs };
            resume_hooks.run_all(&mut ctx);
        }

        let violations = self.propagate_and_check();
        metrics.add_constraint_violations(violations.len() as u64);
        for v in &violations {
            if v.fatal {
                error!("[riffled] fatal placement violation on {}: {}", v.module, v.message);
            } else {
                warn!("[riffled] placement violation on {}: {}", v.module, v.message);
            }
        }
        if violations.iter().any(|v| v.fatal) {
            return Err(ControlError::Busy(format!(
                "fatal scheduling constraint violations: {}",
                violations
                    .iter()
                    .filter(|v| v.fatal)
                    .map(|v| v.module.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        self.graph_view.store(self.graph.build_view());

        // PreResume events: once per module, only for modules whose workers
        // are coming back.
        let mut delivered: HashSet<ModuleId> = HashSet::new();
        for &wid in paused {
            let candidates: Vec<ModuleId> = self
                .graph
                .iter()
                .filter(|n| n.wants_pre_resume && n.has_worker(wid) && !delivered.contains(&n.id))
                .map(|n| n.id)
                .collect();
            for id in candidates {
                delivered.insert(id);
                let node = self.graph.get(id)?;
                if let Err(ControlError::NotSupported(_)) = node.imp.on_event(ModuleEvent::PreResume)
                {
                    self.graph.get_mut(id)?.wants_pre_resume = false;
                }
            }
        }

        for &wid in paused {
            self.workers.resume_worker(wid)?;
            metrics.inc_resume();
        }
        Ok(())
    }
}

fn attach_args_for(parent_kind: &str, req: &AddTcRequest) -> ControlResult<AttachArgs> {
    match parent_kind {
        "priority" => Ok(AttachArgs::Priority(
            req.priority.unwrap_or(DEFAULT_PRIORITY),
        )),
        "weighted_fair" => Ok(AttachArgs::Share(req.share.unwrap_or(1))),
        "round_robin" | "rate_limit" => Ok(AttachArgs::Plain),
        other => Err(ControlError::InvalidArgument(format!(
            "cannot attach under a {other} class"
        ))),
    }
}

fn build_detached(req: &AddTcRequest) -> ControlResult<DetachedTc> {
    let policy = match req.policy.as_str() {
        "priority" => DetachedPolicy::Priority {
            children: Vec::new(),
        },
        "weighted_fair" => DetachedPolicy::WeightedFair {
            resource: Resource::parse(req.resource.as_deref().unwrap_or("count"))?,
            children: Vec::new(),
        },
        "round_robin" => DetachedPolicy::RoundRobin {
            children: Vec::new(),
        },
        "rate_limit" => DetachedPolicy::RateLimit {
            resource: Resource::parse(req.resource.as_deref().unwrap_or("count"))?,
            limit_arg: req.limit.unwrap_or(0),
            max_burst_arg: req.max_burst.unwrap_or(req.limit.unwrap_or(0)),
            child: None,
        },
        "leaf" => {
            return Err(ControlError::InvalidArgument(
                "leaf classes are created by module tasks".to_string(),
            ))
        }
        other => {
            return Err(ControlError::InvalidArgument(format!(
                "unknown policy '{other}'"
            )))
        }
    };
    Ok(DetachedTc {
        name: req.name.clone(),
        stats: Default::default(),
        policy,
    })
}

// ----------------------------------------------------------------------
// Request types
// ----------------------------------------------------------------------

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AddTcRequest {
    pub name: String,
    pub policy: String,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub max_burst: Option<u64>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub wid: Option<i64>,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub share: Option<u32>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct UpdateTcParamsRequest {
    pub name: String,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub max_burst: Option<u64>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct UpdateTcParentRequest {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub wid: Option<i64>,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub share: Option<u32>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ConfigureGatehookRequest {
    pub module: String,
    pub dir: String,
    pub gate: u16,
    pub class: String,
    pub enable: bool,
    #[serde(default)]
    pub arg: Value,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct GatehookCommandRequest {
    pub module: String,
    pub dir: String,
    pub gate: u16,
    pub class: String,
    pub cmd: String,
    #[serde(default)]
    pub arg: Value,
}
