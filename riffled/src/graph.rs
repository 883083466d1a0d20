//! The module graph.
//!
//! Modules live in a generation-tagged arena; edges and task bindings store
//! ids, never references. The control plane mutates the arena under the
//! worker pauser and then publishes an immutable `GraphView` snapshot, which
//! workers load at the pause-check boundary and traverse lock-free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::batch::PacketBatch;
use crate::error::{ControlError, ControlResult};
use crate::gate::{insert_hook, GateHook};
use crate::metadata::{compute_offsets, Attribute, ModuleAttrsView};
use crate::module::{InitCtx, Module, ModuleClass, TaskResult};
use crate::pool::{free_bulk, PacketPool};
use crate::tsc;
use crate::worker::MAX_WORKERS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct ModuleId {
    pub idx: u32,
    pub gen: u32,
}

/// A schedulable entry point: the owning module plus an opaque argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSpec {
    pub module: ModuleId,
    pub arg: u64,
}

/// Counters owned by the module instance, shared across graph snapshots.
#[derive(Default)]
pub struct ModuleStats {
    /// Packets dropped at unconnected output gates.
    pub deadends: AtomicU64,
}

pub struct OGateNode {
    pub target: ModuleId,
    pub target_igate: u16,
    pub hooks: Vec<Arc<dyn GateHook>>,
}

pub struct IGateNode {
    /// Upstream (module, ogate index) pairs feeding this gate.
    pub upstream: Vec<(ModuleId, u16)>,
    pub hooks: Vec<Arc<dyn GateHook>>,
}

pub struct TaskHandle {
    /// Name of the leaf traffic class bound to this task.
    pub leaf: String,
    pub arg: u64,
}

pub struct ModuleNode {
    pub id: ModuleId,
    pub name: String,
    pub class: &'static ModuleClass,
    pub imp: Arc<dyn Module>,
    pub stats: Arc<ModuleStats>,
    pub igates: Vec<Option<IGateNode>>,
    pub ogates: Vec<Option<OGateNode>>,
    pub attrs: Vec<Attribute>,
    pub attr_offsets: Vec<i8>,
    pub tasks: Vec<TaskHandle>,
    pub active_workers: u64,
    visited_tasks: Vec<TaskSpec>,
    pub propagate_workers: bool,
    pub node_constraints: u64,
    pub min_allowed_workers: usize,
    pub max_allowed_workers: usize,
    pub wants_pre_resume: bool,
    pub initial_arg: Value,
}

impl ModuleNode {
    pub fn num_active_workers(&self) -> usize {
        self.active_workers.count_ones() as usize
    }

    pub fn has_worker(&self, wid: usize) -> bool {
        self.active_workers & (1u64 << wid) != 0
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConstraintViolation {
    pub module: String,
    pub fatal: bool,
    pub message: String,
}

struct Slot {
    gen: u32,
    node: Option<ModuleNode>,
}

/// The mutable module arena. Control-plane only.
#[derive(Default)]
pub struct GraphStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_name: HashMap<String, ModuleId>,
}

impl GraphStore {
    pub fn new() -> GraphStore {
        GraphStore::default()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<ModuleId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: ModuleId) -> ControlResult<&ModuleNode> {
        self.slots
            .get(id.idx as usize)
            .filter(|s| s.gen == id.gen)
            .and_then(|s| s.node.as_ref())
            .ok_or_else(|| ControlError::NotFound(format!("module id {}", id.idx)))
    }

    pub fn get_mut(&mut self, id: ModuleId) -> ControlResult<&mut ModuleNode> {
        self.slots
            .get_mut(id.idx as usize)
            .filter(|s| s.gen == id.gen)
            .and_then(|s| s.node.as_mut())
            .ok_or_else(|| ControlError::NotFound(format!("module id {}", id.idx)))
    }

    pub fn by_name(&self, name: &str) -> ControlResult<&ModuleNode> {
        let id = self
            .find(name)
            .ok_or_else(|| ControlError::NotFound(format!("module {name}")))?;
        self.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleNode> {
        self.slots.iter().filter_map(|s| s.node.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ModuleNode> {
        self.slots.iter_mut().filter_map(|s| s.node.as_mut())
    }

    /// First free `template%d` name.
    pub fn generate_name(&self, template: &str) -> String {
        for i in 0.. {
            let name = format!("{template}{i}");
            if !self.by_name.contains_key(&name) {
                return name;
            }
        }
        unreachable!()
    }

    pub fn insert(
        &mut self,
        name: String,
        class: &'static ModuleClass,
        imp: Arc<dyn Module>,
        ictx: InitCtx,
        initial_arg: Value,
    ) -> ControlResult<ModuleId> {
        if self.by_name.contains_key(&name) {
            return Err(ControlError::AlreadyExists(format!("module {name}")));
        }
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(Slot { gen: 0, node: None });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[idx as usize];
        let id = ModuleId { idx, gen: slot.gen };
        let num_attrs = ictx.attrs.len();
        slot.node = Some(ModuleNode {
            id,
            name: name.clone(),
            class,
            imp,
            stats: Arc::new(ModuleStats::default()),
            igates: Vec::new(),
            ogates: Vec::new(),
            attrs: ictx.attrs,
            attr_offsets: vec![crate::metadata::OFFSET_NO_WRITE; num_attrs],
            tasks: Vec::new(),
            active_workers: 0,
            visited_tasks: Vec::new(),
            propagate_workers: ictx.propagate_workers,
            node_constraints: ictx.node_constraints,
            min_allowed_workers: ictx.min_allowed_workers,
            max_allowed_workers: ictx.max_allowed_workers,
            wants_pre_resume: ictx.wants_pre_resume,
            initial_arg,
        });
        self.by_name.insert(name, id);
        Ok(id)
    }

    /// Remove a module whose gates have already been disconnected.
    pub fn remove(&mut self, id: ModuleId) -> ControlResult<ModuleNode> {
        let slot = self
            .slots
            .get_mut(id.idx as usize)
            .filter(|s| s.gen == id.gen)
            .ok_or_else(|| ControlError::NotFound(format!("module id {}", id.idx)))?;
        let node = slot
            .node
            .take()
            .ok_or_else(|| ControlError::NotFound(format!("module id {}", id.idx)))?;
        slot.gen = slot.gen.wrapping_add(1);
        self.by_name.remove(&node.name);
        self.free.push(id.idx);
        Ok(node)
    }

    /// Connect `from`'s output gate to `to`'s input gate, creating both gate
    /// objects as needed. `default_hooks` is installed on the new ogate
    /// unless the caller asked to skip defaults for this connection.
    pub fn connect(
        &mut self,
        from: ModuleId,
        ogate_idx: u16,
        to: ModuleId,
        igate_idx: u16,
        default_hooks: Vec<Arc<dyn GateHook>>,
    ) -> ControlResult<()> {
        {
            let from_node = self.get(from)?;
            if ogate_idx >= from_node.class.ogates {
                return Err(ControlError::InvalidArgument(format!(
                    "ogate {ogate_idx} out of range for {} (max {})",
                    from_node.class.name, from_node.class.ogates
                )));
            }
            if from_node
                .ogates
                .get(ogate_idx as usize)
                .is_some_and(Option::is_some)
            {
                return Err(ControlError::Busy(format!(
                    "{}:ogate {ogate_idx}",
                    from_node.name
                )));
            }
            let to_node = self.get(to)?;
            if igate_idx >= to_node.class.igates {
                return Err(ControlError::InvalidArgument(format!(
                    "igate {igate_idx} out of range for {} (max {})",
                    to_node.class.name, to_node.class.igates
                )));
            }
        }

        {
            let to_node = self.get_mut(to)?;
            if to_node.igates.len() <= igate_idx as usize {
                to_node.igates.resize_with(igate_idx as usize + 1, || None);
            }
            let igate = to_node.igates[igate_idx as usize].get_or_insert_with(|| IGateNode {
                upstream: Vec::new(),
                hooks: Vec::new(),
            });
            igate.upstream.push((from, ogate_idx));
        }

        let from_node = self.get_mut(from)?;
        if from_node.ogates.len() <= ogate_idx as usize {
            from_node.ogates.resize_with(ogate_idx as usize + 1, || None);
        }
        let mut hooks = Vec::new();
        for hook in default_hooks {
            insert_hook(&mut hooks, hook);
        }
        from_node.ogates[ogate_idx as usize] = Some(OGateNode {
            target: to,
            target_igate: igate_idx,
            hooks,
        });
        Ok(())
    }

    /// Tear down one output gate. Removing the last upstream of an input
    /// gate removes the input gate too. Disconnecting an unconnected gate is
    /// not an error.
    pub fn disconnect(&mut self, from: ModuleId, ogate_idx: u16) -> ControlResult<()> {
        let Some(ogate) = self
            .get_mut(from)?
            .ogates
            .get_mut(ogate_idx as usize)
            .and_then(Option::take)
        else {
            return Ok(());
        };
        if let Ok(to_node) = self.get_mut(ogate.target) {
            if let Some(igate_slot) = to_node.igates.get_mut(ogate.target_igate as usize) {
                if let Some(igate) = igate_slot {
                    igate
                        .upstream
                        .retain(|&(m, o)| !(m == from && o == ogate_idx));
                    if igate.upstream.is_empty() {
                        *igate_slot = None;
                    }
                }
            }
        }
        Ok(())
    }

    /// Disconnect everything around `id`, both directions. Used on destroy.
    pub fn disconnect_all(&mut self, id: ModuleId) -> ControlResult<()> {
        // Downstream edges.
        let ogate_count = self.get(id)?.ogates.len();
        for og in 0..ogate_count {
            self.disconnect(id, og as u16)?;
        }
        // Upstream edges: clear every peer ogate that points at us.
        let upstream: Vec<(ModuleId, u16)> = self
            .get(id)?
            .igates
            .iter()
            .flatten()
            .flat_map(|ig| ig.upstream.iter().copied())
            .collect();
        for (peer, ogate_idx) in upstream {
            if let Ok(peer_node) = self.get_mut(peer) {
                if let Some(slot) = peer_node.ogates.get_mut(ogate_idx as usize) {
                    *slot = None;
                }
            }
        }
        let node = self.get_mut(id)?;
        node.igates.clear();
        Ok(())
    }

    /// Recompute every module's metadata offsets from the current topology.
    pub fn compute_metadata_offsets(&mut self) {
        let occupied: Vec<u32> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.node.is_some())
            .map(|(i, _)| i as u32)
            .collect();
        let pos_of: HashMap<u32, usize> = occupied
            .iter()
            .enumerate()
            .map(|(pos, &idx)| (idx, pos))
            .collect();

        let successors: Vec<Vec<usize>> = occupied
            .iter()
            .map(|&idx| {
                self.slots[idx as usize]
                    .node
                    .as_ref()
                    .unwrap()
                    .ogates
                    .iter()
                    .flatten()
                    .filter_map(|og| pos_of.get(&og.target.idx).copied())
                    .collect()
            })
            .collect();

        let views: Vec<ModuleAttrsView<'_>> = occupied
            .iter()
            .enumerate()
            .map(|(pos, &idx)| {
                let node = self.slots[idx as usize].node.as_ref().unwrap();
                ModuleAttrsView {
                    key: &node.name,
                    attrs: &node.attrs,
                    successors: &successors[pos],
                }
            })
            .collect();

        let offsets = compute_offsets(&views);
        for (pos, &idx) in occupied.iter().enumerate() {
            self.slots[idx as usize].node.as_mut().unwrap().attr_offsets = offsets[pos].clone();
        }
    }

    pub fn reset_active_workers(&mut self) {
        for node in self.iter_mut() {
            node.active_workers = 0;
            node.visited_tasks.clear();
        }
    }

    /// Record that `wid` runs `task`, starting at the task's module and
    /// walking downstream where propagation applies.
    pub fn add_active_worker(&mut self, wid: usize, task: TaskSpec) {
        debug_assert!(wid < MAX_WORKERS);
        let mut stack = vec![task.module];
        while let Some(id) = stack.pop() {
            let Ok(node) = self.get_mut(id) else { continue };
            if node.visited_tasks.contains(&task) {
                continue;
            }
            node.visited_tasks.push(task);
            node.active_workers |= 1u64 << wid;
            let owns_task = id == task.module;
            if node.propagate_workers || owns_task {
                stack.extend(node.ogates.iter().flatten().map(|og| og.target));
            }
        }
    }

    /// Validate worker placement against every module's constraints.
    /// `sockets[wid]` is the NUMA node of an active worker, None otherwise.
    pub fn check_constraints(&self, sockets: &[Option<u32>]) -> Vec<ConstraintViolation> {
        let mut violations = Vec::new();
        for node in self.iter() {
            let active = node.num_active_workers();
            if active > node.max_allowed_workers {
                violations.push(ConstraintViolation {
                    module: node.name.clone(),
                    fatal: true,
                    message: format!(
                        "{active} workers attached, at most {} allowed",
                        node.max_allowed_workers
                    ),
                });
            } else if active < node.min_allowed_workers {
                violations.push(ConstraintViolation {
                    module: node.name.clone(),
                    fatal: false,
                    message: format!(
                        "{active} workers attached, at least {} required",
                        node.min_allowed_workers
                    ),
                });
            }
            for (wid, socket) in sockets.iter().enumerate() {
                if !node.has_worker(wid) {
                    continue;
                }
                if let Some(socket) = socket {
                    if node.node_constraints & (1u64 << socket) == 0 {
                        violations.push(ConstraintViolation {
                            module: node.name.clone(),
                            fatal: false,
                            message: format!(
                                "worker {wid} on socket {socket} violates placement mask {:#x}",
                                node.node_constraints
                            ),
                        });
                    }
                }
            }
        }
        violations
    }

    /// Snapshot the graph for lock-free traversal by workers.
    pub fn build_view(&self) -> Arc<GraphView> {
        let modules = self
            .slots
            .iter()
            .map(|slot| {
                slot.node.as_ref().map(|node| ModuleView {
                    id: node.id,
                    name: node.name.as_str().into(),
                    imp: node.imp.clone(),
                    stats: node.stats.clone(),
                    igate_hooks: node
                        .igates
                        .iter()
                        .map(|ig| ig.as_ref().map(|ig| ig.hooks.clone().into()))
                        .collect(),
                    ogates: node
                        .ogates
                        .iter()
                        .map(|og| {
                            og.as_ref().map(|og| OGateView {
                                target: og.target.idx,
                                target_igate: og.target_igate,
                                hooks: og.hooks.clone().into(),
                            })
                        })
                        .collect(),
                    attr_offsets: node.attr_offsets.clone().into(),
                })
            })
            .collect();
        Arc::new(GraphView { modules })
    }
}

pub struct OGateView {
    pub target: u32,
    pub target_igate: u16,
    pub hooks: Arc<[Arc<dyn GateHook>]>,
}

pub struct ModuleView {
    pub id: ModuleId,
    pub name: Arc<str>,
    pub imp: Arc<dyn Module>,
    pub stats: Arc<ModuleStats>,
    pub igate_hooks: Vec<Option<Arc<[Arc<dyn GateHook>]>>>,
    pub ogates: Vec<Option<OGateView>>,
    pub attr_offsets: Arc<[i8]>,
}

/// Immutable execution snapshot of the graph.
pub struct GraphView {
    modules: Vec<Option<ModuleView>>,
}

impl GraphView {
    pub fn empty() -> Arc<GraphView> {
        Arc::new(GraphView {
            modules: Vec::new(),
        })
    }

    #[inline]
    pub fn module(&self, slot: u32) -> Option<&ModuleView> {
        self.modules.get(slot as usize).and_then(Option::as_ref)
    }

    pub fn module_by_id(&self, id: ModuleId) -> Option<&ModuleView> {
        self.module(id.idx).filter(|m| m.id == id)
    }

    /// Run one task invocation to completion, including every downstream
    /// `process_batch` it triggers on this call stack.
    pub fn run_task(
        &self,
        spec: TaskSpec,
        wid: usize,
        pool: &PacketPool,
        now_tsc: u64,
    ) -> TaskResult {
        let Some(module) = self.module_by_id(spec.module) else {
            return TaskResult {
                block: true,
                packets: 0,
                bits: 0,
            };
        };
        let imp = module.imp.clone();
        let mut ctx = Context {
            view: self,
            pool,
            wid,
            current_tsc: now_tsc,
            current_ns: tsc::cycles_to_ns(now_tsc),
            task_arg: spec.arg,
            cur: spec.module.idx,
        };
        let mut batch = PacketBatch::new();
        imp.run_task(&mut ctx, &mut batch, spec.arg)
    }
}

/// Per-invocation module execution context: who is running, on which
/// worker, against which snapshot.
pub struct Context<'a> {
    pub view: &'a GraphView,
    pub pool: &'a PacketPool,
    pub wid: usize,
    pub current_tsc: u64,
    pub current_ns: u64,
    pub task_arg: u64,
    cur: u32,
}

impl<'a> Context<'a> {
    /// Assigned metadata offset of the current module's attribute
    /// `attr_idx`, or a sentinel.
    pub fn attr_offset(&self, attr_idx: usize) -> i8 {
        self.view
            .module(self.cur)
            .and_then(|m| m.attr_offsets.get(attr_idx).copied())
            .unwrap_or(crate::metadata::OFFSET_NO_WRITE)
    }

    /// Send the whole batch out one gate, walking the downstream module on
    /// this call stack. Unconnected gates drop and count.
    pub fn emit(&mut self, ogate_idx: u16, batch: &mut PacketBatch) {
        if batch.is_empty() {
            return;
        }
        // Detach the snapshot reference from `self` so the recursion below
        // can re-borrow the context mutably.
        let view: &'a GraphView = self.view;
        let Some(module) = view.module(self.cur) else {
            free_bulk(batch);
            return;
        };
        let Some(Some(ogate)) = module.ogates.get(ogate_idx as usize) else {
            module
                .stats
                .deadends
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            free_bulk(batch);
            return;
        };
        for hook in ogate.hooks.iter() {
            hook.process_batch(batch);
        }
        let Some(next) = view.module(ogate.target) else {
            free_bulk(batch);
            return;
        };
        if let Some(Some(hooks)) = next.igate_hooks.get(ogate.target_igate as usize) {
            for hook in hooks.iter() {
                hook.process_batch(batch);
            }
        }
        let imp = next.imp.clone();
        let saved = self.cur;
        self.cur = ogate.target;
        imp.process_batch(self, batch);
        self.cur = saved;
    }

    /// Partition the batch by per-packet output gate and emit each group.
    /// `gates[i]` is the destination of `batch[i]`; groups keep packet
    /// order.
    pub fn run_split(&mut self, gates: &[u16], batch: &mut PacketBatch) {
        debug_assert!(gates.len() >= batch.len());
        let mut groups: Vec<(u16, PacketBatch)> = Vec::new();
        for (i, pkt) in batch.drain().enumerate() {
            let gate = gates[i];
            match groups.iter_mut().find(|(g, _)| *g == gate) {
                Some((_, group)) => group.push(pkt),
                None => {
                    let mut group = PacketBatch::new();
                    group.push(pkt);
                    groups.push((gate, group));
                }
            }
        }
        for (gate, mut group) in groups {
            self.emit(gate, &mut group);
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(view: &'a GraphView, pool: &'a PacketPool, at: ModuleId) -> Context<'a> {
        Context {
            view,
            pool,
            wid: 0,
            current_tsc: 0,
            current_ns: 0,
            task_arg: 0,
            cur: at.idx,
        }
    }

    /// Drop the batch, attributing it to the current module.
    pub fn drop_batch(&mut self, batch: &mut PacketBatch) {
        if let Some(module) = self.view.module(self.cur) {
            module
                .stats
                .deadends
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
        }
        free_bulk(batch);
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::module::CommandDesc;

    /// Forwards every batch to ogate 0 and remembers how many packets it
    /// saw.
    pub struct Forward {
        pub seen: AtomicU64,
    }

    impl Module for Forward {
        fn process_batch(&self, ctx: &mut Context<'_>, batch: &mut PacketBatch) {
            self.seen.fetch_add(batch.len() as u64, Ordering::Relaxed);
            ctx.emit(0, batch);
        }
    }

    pub static FORWARD_CLASS: ModuleClass = ModuleClass {
        name: "TestForward",
        name_template: "fwd",
        help: "test module: forward to ogate 0",
        igates: 4,
        ogates: 4,
        commands: &[] as &[CommandDesc],
        init: |_arg, _ctx| Ok(Box::new(Forward { seen: AtomicU64::new(0) })),
    };

    /// Swallows batches, recording packet count.
    pub struct Swallow {
        pub seen: AtomicU64,
    }

    impl Module for Swallow {
        fn process_batch(&self, _ctx: &mut Context<'_>, batch: &mut PacketBatch) {
            self.seen.fetch_add(batch.len() as u64, Ordering::Relaxed);
            free_bulk(batch);
        }
    }

    pub static SWALLOW_CLASS: ModuleClass = ModuleClass {
        name: "TestSwallow",
        name_template: "swl",
        help: "test module: consume everything",
        igates: 4,
        ogates: 0,
        commands: &[] as &[CommandDesc],
        init: |_arg, _ctx| Ok(Box::new(Swallow { seen: AtomicU64::new(0) })),
    };

    pub fn add(store: &mut GraphStore, class: &'static ModuleClass, name: &str) -> ModuleId {
        let mut ictx = InitCtx::default();
        let imp = (class.init)(&Value::Null, &mut ictx).unwrap();
        store
            .insert(name.to_string(), class, imp.into(), ictx, Value::Null)
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::gate::TrackHook;
    use crate::metadata::{is_valid_offset, AccessMode};
    use crate::pool::PacketPool;

    fn fill(pool: &PacketPool, n: usize) -> PacketBatch {
        let mut batch = PacketBatch::new();
        assert!(pool.alloc_bulk(&mut batch, n, 60));
        batch
    }

    #[test]
    fn connect_disconnect_round_trip() {
        let mut g = GraphStore::new();
        let a = add(&mut g, &FORWARD_CLASS, "a");
        let b = add(&mut g, &SWALLOW_CLASS, "b");

        g.connect(a, 0, b, 0, vec![]).unwrap();
        assert!(g.get(a).unwrap().ogates[0].is_some());
        let igate = g.get(b).unwrap().igates[0].as_ref().unwrap();
        assert_eq!(igate.upstream, vec![(a, 0)]);

        // Occupied ogate is busy.
        assert!(matches!(
            g.connect(a, 0, b, 0, vec![]),
            Err(ControlError::Busy(_))
        ));

        g.disconnect(a, 0).unwrap();
        assert!(g.get(a).unwrap().ogates[0].is_none());
        assert!(g.get(b).unwrap().igates[0].is_none());

        // Idempotent.
        g.disconnect(a, 0).unwrap();
    }

    #[test]
    fn igate_outlives_one_of_two_upstreams() {
        let mut g = GraphStore::new();
        let a = add(&mut g, &FORWARD_CLASS, "a");
        let b = add(&mut g, &FORWARD_CLASS, "b");
        let c = add(&mut g, &SWALLOW_CLASS, "c");
        g.connect(a, 0, c, 0, vec![]).unwrap();
        g.connect(b, 0, c, 0, vec![]).unwrap();
        g.disconnect(a, 0).unwrap();
        let igate = g.get(c).unwrap().igates[0].as_ref().unwrap();
        assert_eq!(igate.upstream, vec![(b, 0)]);
    }

    #[test]
    fn gate_index_range_checked() {
        let mut g = GraphStore::new();
        let a = add(&mut g, &FORWARD_CLASS, "a");
        let b = add(&mut g, &SWALLOW_CLASS, "b");
        assert!(matches!(
            g.connect(a, 99, b, 0, vec![]),
            Err(ControlError::InvalidArgument(_))
        ));
        assert!(matches!(
            g.connect(a, 0, b, 99, vec![]),
            Err(ControlError::InvalidArgument(_))
        ));
    }

    #[test]
    fn emit_walks_downstream_and_hooks_count() {
        let mut g = GraphStore::new();
        let a = add(&mut g, &FORWARD_CLASS, "a");
        let b = add(&mut g, &SWALLOW_CLASS, "b");
        let track = Arc::new(TrackHook::new(false));
        g.connect(a, 0, b, 0, vec![track.clone()]).unwrap();
        let view = g.build_view();

        let pool = PacketPool::new_plain("gv0", 64, 0);
        let mut ctx = Context {
            view: &view,
            pool: &pool,
            wid: 0,
            current_tsc: 0,
            current_ns: 0,
            task_arg: 0,
            cur: a.idx,
        };
        let mut batch = fill(&pool, 8);
        ctx.emit(0, &mut batch);
        assert_eq!(track.packets(), 8);
        assert_eq!(pool.available(), 64, "swallow must free the batch");
    }

    #[test]
    fn unconnected_gate_is_a_deadend() {
        let mut g = GraphStore::new();
        let a = add(&mut g, &FORWARD_CLASS, "a");
        let view = g.build_view();
        let pool = PacketPool::new_plain("gv1", 64, 0);
        let mut ctx = Context {
            view: &view,
            pool: &pool,
            wid: 0,
            current_tsc: 0,
            current_ns: 0,
            task_arg: 0,
            cur: a.idx,
        };
        let mut batch = fill(&pool, 5);
        ctx.emit(3, &mut batch);
        assert_eq!(pool.available(), 64);
        assert_eq!(g.get(a).unwrap().stats.deadends.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn run_split_partitions_by_gate() {
        let mut g = GraphStore::new();
        let a = add(&mut g, &FORWARD_CLASS, "a");

        let b_imp = Arc::new(Swallow {
            seen: AtomicU64::new(0),
        });
        let c_imp = Arc::new(Swallow {
            seen: AtomicU64::new(0),
        });
        let b = g
            .insert(
                "b".into(),
                &SWALLOW_CLASS,
                b_imp.clone(),
                InitCtx::default(),
                Value::Null,
            )
            .unwrap();
        let c = g
            .insert(
                "c".into(),
                &SWALLOW_CLASS,
                c_imp.clone(),
                InitCtx::default(),
                Value::Null,
            )
            .unwrap();
        g.connect(a, 0, b, 0, vec![]).unwrap();
        g.connect(a, 1, c, 0, vec![]).unwrap();
        let view = g.build_view();

        let pool = PacketPool::new_plain("gv2", 64, 0);
        let mut ctx = Context {
            view: &view,
            pool: &pool,
            wid: 0,
            current_tsc: 0,
            current_ns: 0,
            task_arg: 0,
            cur: a.idx,
        };
        let mut batch = fill(&pool, 6);
        ctx.run_split(&[0, 1, 0, 1, 0, 1], &mut batch);

        assert_eq!(b_imp.seen.load(Ordering::Relaxed), 3);
        assert_eq!(c_imp.seen.load(Ordering::Relaxed), 3);
        assert_eq!(pool.available(), 64);
    }

    #[test]
    fn metadata_offsets_follow_topology() {
        let mut g = GraphStore::new();

        static WRITER_CLASS: ModuleClass = ModuleClass {
            name: "TtlWriter",
            name_template: "",
            help: "",
            igates: 1,
            ogates: 1,
            commands: &[],
            init: |_arg, ictx| {
                ictx.add_attr("ttl", 1, AccessMode::Write)?;
                Ok(Box::new(Forward {
                    seen: AtomicU64::new(0),
                }))
            },
        };
        static READER_CLASS: ModuleClass = ModuleClass {
            name: "TtlReader",
            name_template: "",
            help: "",
            igates: 1,
            ogates: 1,
            commands: &[],
            init: |_arg, ictx| {
                ictx.add_attr("ttl", 1, AccessMode::Read)?;
                Ok(Box::new(Swallow {
                    seen: AtomicU64::new(0),
                }))
            },
        };

        let a = add(&mut g, &WRITER_CLASS, "a");
        let b = add(&mut g, &READER_CLASS, "b");

        g.connect(a, 0, b, 0, vec![]).unwrap();
        g.compute_metadata_offsets();
        let off_a = g.get(a).unwrap().attr_offsets[0];
        let off_b = g.get(b).unwrap().attr_offsets[0];
        assert!(is_valid_offset(off_a));
        assert_eq!(off_a, off_b);

        g.disconnect(a, 0).unwrap();
        g.compute_metadata_offsets();
        assert_eq!(
            g.get(a).unwrap().attr_offsets[0],
            crate::metadata::OFFSET_NO_READ
        );
        assert_eq!(
            g.get(b).unwrap().attr_offsets[0],
            crate::metadata::OFFSET_NO_WRITE
        );
    }

    #[test]
    fn active_worker_propagation_and_constraints() {
        let mut g = GraphStore::new();
        let a = add(&mut g, &FORWARD_CLASS, "a");
        let b = add(&mut g, &SWALLOW_CLASS, "b");
        g.connect(a, 0, b, 0, vec![]).unwrap();

        g.reset_active_workers();
        g.add_active_worker(
            2,
            TaskSpec {
                module: a,
                arg: 0,
            },
        );
        assert!(g.get(a).unwrap().has_worker(2));
        // Task owned by `a` propagates downstream to b.
        assert!(g.get(b).unwrap().has_worker(2));

        // One worker within bounds: no violations.
        let mut sockets = vec![None; MAX_WORKERS];
        sockets[2] = Some(0);
        assert!(g.check_constraints(&sockets).is_empty());

        // Two workers exceed the default max of 1: fatal.
        g.add_active_worker(
            3,
            TaskSpec {
                module: a,
                arg: 1,
            },
        );
        sockets[3] = Some(0);
        let violations = g.check_constraints(&sockets);
        assert!(violations.iter().any(|v| v.fatal));
    }

    #[test]
    fn generated_names_skip_taken() {
        let mut g = GraphStore::new();
        add(&mut g, &FORWARD_CLASS, "fwd0");
        assert_eq!(g.generate_name("fwd"), "fwd1");
    }
}
