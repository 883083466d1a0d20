//! Hierarchical traffic classes.
//!
//! Each worker's scheduler owns one tree of traffic classes. Interior nodes
//! carry a scheduling policy (priority, weighted-fair, round-robin,
//! rate-limit); leaves bind exactly one task. Nodes live in an arena keyed
//! by ids, so the tree has no reference cycles and moves between workers as
//! a detached value.
//!
//! The blocking invariant: a class is blocked iff no leaf is schedulable
//! through it. The flag is maintained incrementally — towards the root on
//! every attach, detach, throttle and wakeup.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use serde_json::json;

use crate::error::{ControlError, ControlResult};
use crate::graph::TaskSpec;
use crate::tsc;

/// Reserved "default" priority (lowest possible preference).
pub const DEFAULT_PRIORITY: u32 = 0xffff_ffff;

/// Strides are STRIDE1 / share; 1024 distinct shares are plenty.
pub const STRIDE1: i64 = 1 << 20;

/// 1 work unit == 2^32 resource units, for fixed-point token accounting.
pub const USAGE_AMPLIFIER_POW: u32 = 32;

/// Leaf backoff floor for the experimental scheduler.
pub const INITIAL_WAIT_CYCLES: u64 = 1 << 14;

/// Leaf backoff cap for the experimental scheduler.
pub const MAX_WAIT_CYCLES: u64 = 1 << 32;

pub const NUM_RESOURCES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Count = 0,
    Cycle = 1,
    Packet = 2,
    Bit = 3,
}

impl Resource {
    pub fn parse(s: &str) -> ControlResult<Resource> {
        match s {
            "count" => Ok(Resource::Count),
            "cycle" => Ok(Resource::Cycle),
            "packet" => Ok(Resource::Packet),
            "bit" => Ok(Resource::Bit),
            other => Err(ControlError::InvalidArgument(format!(
                "unknown resource '{other}'"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Resource::Count => "count",
            Resource::Cycle => "cycle",
            Resource::Packet => "packet",
            Resource::Bit => "bit",
        }
    }
}

pub type ResourceArr = [u64; NUM_RESOURCES];

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct TcStats {
    pub usage: ResourceArr,
    pub cnt_throttled: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcId(pub(crate) u32);

#[derive(Debug, Clone, Copy)]
pub struct PrioChild {
    pub priority: u32,
    pub id: TcId,
}

#[derive(Debug, Clone, Copy)]
pub struct WfChild {
    pub id: TcId,
    pub stride: i64,
    pub pass: i64,
}

/// Min-heap entry ordered by pass (then id, for a deterministic layout).
#[derive(Debug, Clone, Copy)]
struct WfEntry(WfChild);

impl PartialEq for WfEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.pass == other.0.pass && self.0.id == other.0.id
    }
}
impl Eq for WfEntry {}
impl PartialOrd for WfEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for WfEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the smallest pass on
        // top.
        other
            .0
            .pass
            .cmp(&self.0.pass)
            .then_with(|| other.0.id.0.cmp(&self.0.id.0))
    }
}

pub enum Policy {
    Priority {
        /// Index of the first unblocked child, kept so picking is O(1).
        first_runnable: usize,
        /// Sorted by priority ascending; lower index wins.
        children: Vec<PrioChild>,
    },
    WeightedFair {
        resource: Resource,
        runnable: BinaryHeap<WfEntry>,
        blocked: Vec<WfChild>,
        /// (child, share) pairs, safe to read while picking happens.
        shares: Vec<(TcId, u32)>,
    },
    RoundRobin {
        runnable: VecDeque<TcId>,
        blocked: Vec<TcId>,
    },
    RateLimit {
        resource: Resource,
        /// Work units per cycle; 0 means unlimited.
        limit: u64,
        /// Resource units per second, as configured.
        limit_arg: u64,
        /// Work units.
        max_burst: u64,
        /// Resource units, as configured.
        max_burst_arg: u64,
        tokens: u64,
        last_tsc: u64,
        child: Option<TcId>,
    },
    Leaf {
        task: Option<TaskSpec>,
        wait_cycles: u64,
    },
}

impl Policy {
    pub fn kind(&self) -> &'static str {
        match self {
            Policy::Priority { .. } => "priority",
            Policy::WeightedFair { .. } => "weighted_fair",
            Policy::RoundRobin { .. } => "round_robin",
            Policy::RateLimit { .. } => "rate_limit",
            Policy::Leaf { .. } => "leaf",
        }
    }
}

/// Resource units per second -> work units per cycle.
pub fn to_work_units_per_cycle(x: u64) -> u64 {
    (((x as u128) << USAGE_AMPLIFIER_POW) / tsc::tsc_hz() as u128) as u64
}

/// Resource units -> work units.
pub fn to_work_units(x: u64) -> u64 {
    x << USAGE_AMPLIFIER_POW
}

pub struct TcNode {
    pub name: String,
    pub parent: Option<TcId>,
    pub blocked: bool,
    pub wakeup_time: u64,
    pub stats: TcStats,
    pub policy: Policy,
}

/// How a child hangs off its parent; captured for detach/re-attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachArgs {
    Priority(u32),
    Share(u32),
    Plain,
}

/// A subtree detached from any worker: the portable, owned form used for
/// orphans and for moving classes between schedulers. Weighted-fair pass
/// values and rate-limit tokens do not survive the move.
pub struct DetachedTc {
    pub name: String,
    pub stats: TcStats,
    pub policy: DetachedPolicy,
}

pub enum DetachedPolicy {
    Priority {
        children: Vec<(u32, DetachedTc)>,
    },
    WeightedFair {
        resource: Resource,
        children: Vec<(u32, DetachedTc)>,
    },
    RoundRobin {
        children: Vec<DetachedTc>,
    },
    RateLimit {
        resource: Resource,
        limit_arg: u64,
        max_burst_arg: u64,
        child: Option<Box<DetachedTc>>,
    },
    Leaf {
        task: Option<TaskSpec>,
    },
}

impl DetachedTc {
    pub fn leaf(name: &str, task: Option<TaskSpec>) -> DetachedTc {
        DetachedTc {
            name: name.to_string(),
            stats: TcStats::default(),
            policy: DetachedPolicy::Leaf { task },
        }
    }

    /// Every class name in this subtree.
    pub fn names(&self, out: &mut Vec<String>) {
        out.push(self.name.clone());
        match &self.policy {
            DetachedPolicy::Priority { children } => {
                children.iter().for_each(|(_, c)| c.names(out))
            }
            DetachedPolicy::WeightedFair { children, .. } => {
                children.iter().for_each(|(_, c)| c.names(out))
            }
            DetachedPolicy::RoundRobin { children } => children.iter().for_each(|c| c.names(out)),
            DetachedPolicy::RateLimit { child, .. } => {
                if let Some(c) = child {
                    c.names(out);
                }
            }
            DetachedPolicy::Leaf { .. } => {}
        }
    }

    pub fn kind(&self) -> &'static str {
        match &self.policy {
            DetachedPolicy::Priority { .. } => "priority",
            DetachedPolicy::WeightedFair { .. } => "weighted_fair",
            DetachedPolicy::RoundRobin { .. } => "round_robin",
            DetachedPolicy::RateLimit { .. } => "rate_limit",
            DetachedPolicy::Leaf { .. } => "leaf",
        }
    }

    pub fn find(&self, name: &str) -> Option<&DetachedTc> {
        if self.name == name {
            return Some(self);
        }
        match &self.policy {
            DetachedPolicy::Priority { children } => {
                children.iter().find_map(|(_, c)| c.find(name))
            }
            DetachedPolicy::WeightedFair { children, .. } => {
                children.iter().find_map(|(_, c)| c.find(name))
            }
            DetachedPolicy::RoundRobin { children } => children.iter().find_map(|c| c.find(name)),
            DetachedPolicy::RateLimit { child, .. } => {
                child.as_ref().and_then(|c| c.find(name))
            }
            DetachedPolicy::Leaf { .. } => None,
        }
    }

    pub(crate) fn find_mut(&mut self, name: &str) -> Option<&mut DetachedTc> {
        if self.name == name {
            return Some(self);
        }
        match &mut self.policy {
            DetachedPolicy::Priority { children } => {
                children.iter_mut().find_map(|(_, c)| c.find_mut(name))
            }
            DetachedPolicy::WeightedFair { children, .. } => {
                children.iter_mut().find_map(|(_, c)| c.find_mut(name))
            }
            DetachedPolicy::RoundRobin { children } => {
                children.iter_mut().find_map(|c| c.find_mut(name))
            }
            DetachedPolicy::RateLimit { child, .. } => {
                child.as_mut().and_then(|c| c.find_mut(name))
            }
            DetachedPolicy::Leaf { .. } => None,
        }
    }

    /// Attach `child` under the class named `parent_name`, with the same
    /// validation `TcTree::add_child` applies.
    pub fn add_child_at(
        &mut self,
        parent_name: &str,
        args: AttachArgs,
        child: DetachedTc,
    ) -> ControlResult<()> {
        let parent = self
            .find_mut(parent_name)
            .ok_or_else(|| ControlError::NotFound(format!("traffic class {parent_name}")))?;
        match (&mut parent.policy, args) {
            (DetachedPolicy::Priority { children }, AttachArgs::Priority(priority)) => {
                if children.iter().any(|(p, _)| *p == priority) {
                    return Err(ControlError::AlreadyExists(format!("priority {priority}")));
                }
                children.push((priority, child));
                Ok(())
            }
            (DetachedPolicy::WeightedFair { children, .. }, AttachArgs::Share(share)) => {
                if share == 0 {
                    return Err(ControlError::InvalidArgument(
                        "share must be positive".to_string(),
                    ));
                }
                children.push((share, child));
                Ok(())
            }
            (DetachedPolicy::RoundRobin { children }, AttachArgs::Plain) => {
                children.push(child);
                Ok(())
            }
            (DetachedPolicy::RateLimit { child: slot, .. }, AttachArgs::Plain) => {
                if slot.is_some() {
                    return Err(ControlError::Busy(format!(
                        "{parent_name} already has a child"
                    )));
                }
                *slot = Some(Box::new(child));
                Ok(())
            }
            (DetachedPolicy::Leaf { .. }, _) => Err(ControlError::NotSupported(
                "leaf classes cannot have children".to_string(),
            )),
            _ => Err(ControlError::InvalidArgument(
                "attach args do not match parent policy".to_string(),
            )),
        }
    }

    /// Detach the subtree named `name` from anywhere below this node.
    pub fn remove_child_at(&mut self, name: &str) -> Option<DetachedTc> {
        match &mut self.policy {
            DetachedPolicy::Priority { children } => {
                if let Some(pos) = children.iter().position(|(_, c)| c.name == name) {
                    return Some(children.remove(pos).1);
                }
                children
                    .iter_mut()
                    .find_map(|(_, c)| c.remove_child_at(name))
            }
            DetachedPolicy::WeightedFair { children, .. } => {
                if let Some(pos) = children.iter().position(|(_, c)| c.name == name) {
                    return Some(children.remove(pos).1);
                }
                children
                    .iter_mut()
                    .find_map(|(_, c)| c.remove_child_at(name))
            }
            DetachedPolicy::RoundRobin { children } => {
                if let Some(pos) = children.iter().position(|c| c.name == name) {
                    return Some(children.remove(pos));
                }
                children.iter_mut().find_map(|c| c.remove_child_at(name))
            }
            DetachedPolicy::RateLimit { child, .. } => {
                if child.as_ref().is_some_and(|c| c.name == name) {
                    return child.take().map(|b| *b);
                }
                child.as_mut().and_then(|c| c.remove_child_at(name))
            }
            DetachedPolicy::Leaf { .. } => None,
        }
    }

    /// Tear a subtree down to its task-bearing leaves, discarding every
    /// policy node. Used by reset_tcs.
    pub fn collect_leaves(self, out: &mut Vec<DetachedTc>) {
        match self.policy {
            DetachedPolicy::Leaf { task: Some(_) } => out.push(self),
            DetachedPolicy::Leaf { task: None } => {}
            DetachedPolicy::Priority { children } => {
                for (_, c) in children {
                    c.collect_leaves(out);
                }
            }
            DetachedPolicy::WeightedFair { children, .. } => {
                for (_, c) in children {
                    c.collect_leaves(out);
                }
            }
            DetachedPolicy::RoundRobin { children } => {
                for c in children {
                    c.collect_leaves(out);
                }
            }
            DetachedPolicy::RateLimit { child, .. } => {
                if let Some(c) = child {
                    c.collect_leaves(out);
                }
            }
        }
    }
}

/// Min-heap of (wakeup_time, class) pairs.
#[derive(Default)]
pub struct WakeupQueue {
    heap: BinaryHeap<Reverse<(u64, u32)>>,
}

impl WakeupQueue {
    pub fn add(&mut self, id: TcId, wakeup_time: u64) {
        self.heap.push(Reverse((wakeup_time, id.0)));
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[derive(Default)]
pub struct TcTree {
    nodes: Vec<Option<TcNode>>,
    free: Vec<u32>,
}

impl TcTree {
    pub fn new() -> TcTree {
        TcTree::default()
    }

    fn alloc(&mut self, node: TcNode) -> TcId {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx as usize] = Some(node);
                TcId(idx)
            }
            None => {
                self.nodes.push(Some(node));
                TcId((self.nodes.len() - 1) as u32)
            }
        }
    }

    fn release(&mut self, id: TcId) -> Option<TcNode> {
        let node = self.nodes.get_mut(id.0 as usize)?.take();
        if node.is_some() {
            self.free.push(id.0);
        }
        node
    }

    pub fn get(&self, id: TcId) -> Option<&TcNode> {
        self.nodes.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: TcId) -> Option<&mut TcNode> {
        self.nodes.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    pub fn new_priority(&mut self, name: &str) -> TcId {
        self.alloc(TcNode {
            name: name.to_string(),
            parent: None,
            blocked: true,
            wakeup_time: 0,
            stats: TcStats::default(),
            policy: Policy::Priority {
                first_runnable: 0,
                children: Vec::new(),
            },
        })
    }

    pub fn new_weighted_fair(&mut self, name: &str, resource: Resource) -> TcId {
        self.alloc(TcNode {
            name: name.to_string(),
            parent: None,
            blocked: true,
            wakeup_time: 0,
            stats: TcStats::default(),
            policy: Policy::WeightedFair {
                resource,
                runnable: BinaryHeap::new(),
                blocked: Vec::new(),
                shares: Vec::new(),
            },
        })
    }

    pub fn new_round_robin(&mut self, name: &str) -> TcId {
        self.alloc(TcNode {
            name: name.to_string(),
            parent: None,
            blocked: true,
            wakeup_time: 0,
            stats: TcStats::default(),
            policy: Policy::RoundRobin {
                runnable: VecDeque::new(),
                blocked: Vec::new(),
            },
        })
    }

    pub fn new_rate_limit(
        &mut self,
        name: &str,
        resource: Resource,
        limit_arg: u64,
        max_burst_arg: u64,
    ) -> TcId {
        self.alloc(TcNode {
            name: name.to_string(),
            parent: None,
            blocked: true,
            wakeup_time: 0,
            stats: TcStats::default(),
            policy: Policy::RateLimit {
                resource,
                limit: to_work_units_per_cycle(limit_arg),
                limit_arg,
                max_burst: to_work_units(max_burst_arg),
                max_burst_arg,
                tokens: 0,
                last_tsc: 0,
                child: None,
            },
        })
    }

    /// A leaf with no task starts blocked; attaching a task unblocks it.
    pub fn new_leaf(&mut self, name: &str, task: Option<TaskSpec>) -> TcId {
        let blocked = task.is_none();
        self.alloc(TcNode {
            name: name.to_string(),
            parent: None,
            blocked,
            wakeup_time: 0,
            stats: TcStats::default(),
            policy: Policy::Leaf {
                task,
                wait_cycles: INITIAL_WAIT_CYCLES,
            },
        })
    }

    // ------------------------------------------------------------------
    // Tree structure
    // ------------------------------------------------------------------

    pub fn children_of(&self, id: TcId) -> Vec<TcId> {
        let Some(node) = self.get(id) else {
            return Vec::new();
        };
        match &node.policy {
            Policy::Priority { children, .. } => children.iter().map(|c| c.id).collect(),
            Policy::WeightedFair { shares, .. } => shares.iter().map(|(id, _)| *id).collect(),
            Policy::RoundRobin {
                runnable, blocked, ..
            } => runnable.iter().chain(blocked.iter()).copied().collect(),
            Policy::RateLimit { child, .. } => child.iter().copied().collect(),
            Policy::Leaf { .. } => Vec::new(),
        }
    }

    /// Number of classes in the subtree, including the root.
    pub fn size(&self, id: TcId) -> usize {
        1 + self
            .children_of(id)
            .iter()
            .map(|&c| self.size(c))
            .sum::<usize>()
    }

    pub fn find_by_name(&self, root: TcId, name: &str) -> Option<TcId> {
        if self.get(root)?.name == name {
            return Some(root);
        }
        self.children_of(root)
            .into_iter()
            .find_map(|c| self.find_by_name(c, name))
    }

    pub fn subtree(&self, root: TcId) -> Vec<TcId> {
        let mut out = vec![root];
        for c in self.children_of(root) {
            out.extend(self.subtree(c));
        }
        out
    }

    /// Every leaf with a bound task under `root`.
    pub fn leaves_under(&self, root: TcId) -> Vec<(TcId, TaskSpec)> {
        self.subtree(root)
            .into_iter()
            .filter_map(|id| match &self.get(id)?.policy {
                Policy::Leaf {
                    task: Some(task), ..
                } => Some((id, *task)),
                _ => None,
            })
            .collect()
    }

    /// Attach `child` under `parent`. The child must currently be detached.
    pub fn add_child(&mut self, parent: TcId, child: TcId, args: AttachArgs) -> ControlResult<()> {
        if self.get(child).is_none() {
            return Err(ControlError::NotFound(format!("class id {}", child.0)));
        }
        if self.get(child).unwrap().parent.is_some() {
            return Err(ControlError::Busy(format!(
                "{} is already attached",
                self.get(child).unwrap().name
            )));
        }
        let parent_node = self
            .get_mut(parent)
            .ok_or_else(|| ControlError::NotFound(format!("class id {}", parent.0)))?;
        let parent_name = parent_node.name.clone();
        let parent_kind = parent_node.policy.kind();
        match (&mut parent_node.policy, args) {
            (Policy::Priority { children, .. }, AttachArgs::Priority(priority)) => {
                if children.iter().any(|c| c.priority == priority) {
                    return Err(ControlError::AlreadyExists(format!("priority {priority}")));
                }
                let pos = children
                    .iter()
                    .position(|c| c.priority > priority)
                    .unwrap_or(children.len());
                children.insert(pos, PrioChild { priority, id: child });
            }
            (Policy::WeightedFair { blocked, shares, .. }, AttachArgs::Share(share)) => {
                if share == 0 {
                    return Err(ControlError::InvalidArgument(
                        "share must be positive".to_string(),
                    ));
                }
                blocked.push(WfChild {
                    id: child,
                    stride: STRIDE1 / share as i64,
                    pass: 0,
                });
                shares.push((child, share));
            }
            (Policy::RoundRobin { blocked, .. }, AttachArgs::Plain) => {
                blocked.push(child);
            }
            (Policy::RateLimit { child: slot, .. }, AttachArgs::Plain) => {
                if slot.is_some() {
                    return Err(ControlError::Busy(format!(
                        "{parent_name} already has a child"
                    )));
                }
                *slot = Some(child);
            }
            (Policy::Leaf { .. }, _) => {
                return Err(ControlError::NotSupported(
                    "leaf classes cannot have children".to_string(),
                ));
            }
            _ => {
                return Err(ControlError::InvalidArgument(format!(
                    "attach args do not match policy {parent_kind}"
                )));
            }
        }
        self.get_mut(child).unwrap().parent = Some(parent);
        if !self.get(child).unwrap().blocked {
            self.promote_in_parent(child);
            self.propagate_unblock(child);
        }
        Ok(())
    }

    /// Detach `child` from `parent`. The caller owns the child afterwards.
    pub fn remove_child(&mut self, parent: TcId, child: TcId) -> ControlResult<()> {
        let parent_node = self
            .get_mut(parent)
            .ok_or_else(|| ControlError::NotFound(format!("class id {}", parent.0)))?;
        let parent_name = parent_node.name.clone();
        let found = match &mut parent_node.policy {
            Policy::Priority {
                children,
                first_runnable,
            } => {
                let before = children.len();
                children.retain(|c| c.id != child);
                *first_runnable = 0;
                before != children.len()
            }
            Policy::WeightedFair {
                runnable,
                blocked,
                shares,
                ..
            } => {
                let before = shares.len();
                shares.retain(|(id, _)| *id != child);
                blocked.retain(|c| c.id != child);
                let entries: Vec<WfEntry> =
                    runnable.drain().filter(|e| e.0.id != child).collect();
                runnable.extend(entries);
                before != shares.len()
            }
            Policy::RoundRobin { runnable, blocked } => {
                let before = runnable.len() + blocked.len();
                runnable.retain(|&id| id != child);
                blocked.retain(|&id| id != child);
                before != runnable.len() + blocked.len()
            }
            Policy::RateLimit { child: slot, .. } => {
                if *slot == Some(child) {
                    *slot = None;
                    true
                } else {
                    false
                }
            }
            Policy::Leaf { .. } => false,
        };
        if !found {
            return Err(ControlError::NotFound(format!(
                "child id {} under {parent_name}",
                child.0
            )));
        }
        self.refresh_priority_cursor(parent);
        if let Some(node) = self.get_mut(child) {
            node.parent = None;
        }
        // The parent may have just lost its only runnable subtree.
        self.reevaluate_block(parent);
        Ok(())
    }

    /// Bind a task to an empty leaf; unblocks it (and possibly the path to
    /// the root).
    pub fn attach_task(&mut self, leaf: TcId, task: TaskSpec) -> ControlResult<()> {
        let node = self
            .get_mut(leaf)
            .ok_or_else(|| ControlError::NotFound(format!("class id {}", leaf.0)))?;
        match &mut node.policy {
            Policy::Leaf { task: slot, .. } => {
                if slot.is_some() {
                    return Err(ControlError::Busy(node.name.clone()));
                }
                *slot = Some(task);
            }
            _ => {
                return Err(ControlError::InvalidArgument(format!(
                    "{} is not a leaf",
                    node.name
                )))
            }
        }
        node.blocked = false;
        self.promote_in_parent(leaf);
        self.propagate_unblock(leaf);
        Ok(())
    }

    /// Detach the whole subtree rooted at `id` into its portable form,
    /// freeing the arena slots. The node must already be parentless.
    pub fn extract(&mut self, id: TcId) -> ControlResult<DetachedTc> {
        if let Some(node) = self.get(id) {
            if node.parent.is_some() {
                return Err(ControlError::Busy(format!(
                    "{} is still attached",
                    node.name
                )));
            }
        }
        self.extract_inner(id)
    }

    fn extract_inner(&mut self, id: TcId) -> ControlResult<DetachedTc> {
        let node = self
            .release(id)
            .ok_or_else(|| ControlError::NotFound(format!("class id {}", id.0)))?;
        let policy = match node.policy {
            Policy::Priority { children, .. } => DetachedPolicy::Priority {
                children: children
                    .into_iter()
                    .map(|c| Ok((c.priority, self.extract_inner(c.id)?)))
                    .collect::<ControlResult<Vec<_>>>()?,
            },
            Policy::WeightedFair {
                resource, shares, ..
            } => DetachedPolicy::WeightedFair {
                resource,
                children: shares
                    .into_iter()
                    .map(|(id, share)| Ok((share, self.extract_inner(id)?)))
                    .collect::<ControlResult<Vec<_>>>()?,
            },
            Policy::RoundRobin { runnable, blocked } => DetachedPolicy::RoundRobin {
                children: runnable
                    .into_iter()
                    .chain(blocked)
                    .map(|id| self.extract_inner(id))
                    .collect::<ControlResult<Vec<_>>>()?,
            },
            Policy::RateLimit {
                resource,
                limit_arg,
                max_burst_arg,
                child,
                ..
            } => DetachedPolicy::RateLimit {
                resource,
                limit_arg,
                max_burst_arg,
                child: match child {
                    Some(c) => Some(Box::new(self.extract_inner(c)?)),
                    None => None,
                },
            },
            Policy::Leaf { task, .. } => DetachedPolicy::Leaf { task },
        };
        Ok(DetachedTc {
            name: node.name,
            stats: node.stats,
            policy,
        })
    }

    /// Rebuild a detached subtree inside this arena. Returns the new root
    /// id; the caller attaches it wherever it belongs.
    pub fn graft(&mut self, det: DetachedTc) -> TcId {
        let DetachedTc {
            name,
            stats,
            policy,
        } = det;
        let id = match policy {
            DetachedPolicy::Priority { children } => {
                let id = self.new_priority(&name);
                for (priority, child) in children {
                    let cid = self.graft(child);
                    let _ = self.add_child(id, cid, AttachArgs::Priority(priority));
                }
                id
            }
            DetachedPolicy::WeightedFair { resource, children } => {
                let id = self.new_weighted_fair(&name, resource);
                for (share, child) in children {
                    let cid = self.graft(child);
                    let _ = self.add_child(id, cid, AttachArgs::Share(share));
                }
                id
            }
            DetachedPolicy::RoundRobin { children } => {
                let id = self.new_round_robin(&name);
                for child in children {
                    let cid = self.graft(child);
                    let _ = self.add_child(id, cid, AttachArgs::Plain);
                }
                id
            }
            DetachedPolicy::RateLimit {
                resource,
                limit_arg,
                max_burst_arg,
                child,
            } => {
                let id = self.new_rate_limit(&name, resource, limit_arg, max_burst_arg);
                if let Some(child) = child {
                    let cid = self.graft(*child);
                    let _ = self.add_child(id, cid, AttachArgs::Plain);
                }
                id
            }
            DetachedPolicy::Leaf { task } => self.new_leaf(&name, task),
        };
        self.get_mut(id).unwrap().stats = stats;
        id
    }

    // ------------------------------------------------------------------
    // Blocking bookkeeping
    // ------------------------------------------------------------------

    fn child_blocked(&self, id: TcId) -> bool {
        self.get(id).map(|n| n.blocked).unwrap_or(true)
    }

    /// Recompute a priority node's first-runnable cursor.
    fn refresh_priority_cursor(&mut self, id: TcId) {
        let first = match self.get(id).map(|n| &n.policy) {
            Some(Policy::Priority { children, .. }) => {
                let ids: Vec<TcId> = children.iter().map(|c| c.id).collect();
                ids.iter()
                    .position(|&c| !self.child_blocked(c))
                    .unwrap_or(ids.len())
            }
            _ => return,
        };
        if let Some(Policy::Priority { first_runnable, .. }) =
            self.get_mut(id).map(|n| &mut n.policy)
        {
            *first_runnable = first;
        }
    }

    /// Is anything schedulable through this node right now?
    fn computes_runnable(&self, id: TcId) -> bool {
        let Some(node) = self.get(id) else {
            return false;
        };
        match &node.policy {
            Policy::Priority { children, .. } => {
                children.iter().any(|c| !self.child_blocked(c.id))
            }
            Policy::WeightedFair { runnable, .. } => !runnable.is_empty(),
            Policy::RoundRobin { runnable, .. } => !runnable.is_empty(),
            Policy::RateLimit { child, .. } => {
                node.wakeup_time == 0
                    && child.map(|c| !self.child_blocked(c)).unwrap_or(false)
            }
            Policy::Leaf { task, .. } => task.is_some() && node.wakeup_time == 0,
        }
    }

    /// Move `child` from its parent's blocked list to the runnable side.
    /// Called when `child.blocked` has just turned false.
    fn promote_in_parent(&mut self, child: TcId) {
        let Some(parent) = self.get(child).and_then(|n| n.parent) else {
            return;
        };
        if matches!(
            self.get(parent).map(|n| &n.policy),
            Some(Policy::Priority { .. })
        ) {
            self.refresh_priority_cursor(parent);
            return;
        }
        // Weighted-fair re-seeds the pass to the current minimum so a
        // returning child cannot monopolize or starve.
        let seed_pass = match self.get(parent).map(|n| &n.policy) {
            Some(Policy::WeightedFair { runnable, .. }) => {
                runnable.peek().map(|e| e.0.pass).unwrap_or(0)
            }
            _ => 0,
        };
        let Some(parent_node) = self.get_mut(parent) else {
            return;
        };
        match &mut parent_node.policy {
            Policy::WeightedFair {
                runnable, blocked, ..
            } => {
                if let Some(pos) = blocked.iter().position(|c| c.id == child) {
                    let mut entry = blocked.remove(pos);
                    entry.pass = seed_pass;
                    runnable.push(WfEntry(entry));
                }
            }
            Policy::RoundRobin { runnable, blocked } => {
                if let Some(pos) = blocked.iter().position(|&id| id == child) {
                    blocked.remove(pos);
                    runnable.push_back(child);
                }
            }
            _ => {}
        }
    }

    /// Move `child` out of its parent's runnable structures. Called when
    /// `child.blocked` has just turned true.
    fn demote_in_parent(&mut self, child: TcId) {
        let Some(parent) = self.get(child).and_then(|n| n.parent) else {
            return;
        };
        if matches!(
            self.get(parent).map(|n| &n.policy),
            Some(Policy::Priority { .. })
        ) {
            self.refresh_priority_cursor(parent);
            return;
        }
        let Some(parent_node) = self.get_mut(parent) else {
            return;
        };
        match &mut parent_node.policy {
            Policy::WeightedFair {
                runnable, blocked, ..
            } => {
                let mut entries: Vec<WfEntry> = runnable.drain().collect();
                if let Some(pos) = entries.iter().position(|e| e.0.id == child) {
                    let entry = entries.remove(pos);
                    blocked.push(entry.0);
                }
                runnable.extend(entries);
            }
            Policy::RoundRobin { runnable, blocked } => {
                if let Some(pos) = runnable.iter().position(|&id| id == child) {
                    runnable.remove(pos);
                    blocked.push(child);
                }
            }
            _ => {}
        }
    }

    /// `id` just became unblocked: walk towards the root, unblocking every
    /// ancestor that now has a runnable path.
    fn propagate_unblock(&mut self, id: TcId) {
        let mut child = id;
        while let Some(parent) = self.get(child).and_then(|n| n.parent) {
            let was_blocked = self.child_blocked(parent);
            let now_runnable = self.computes_runnable(parent);
            if !was_blocked || !now_runnable {
                break;
            }
            self.get_mut(parent).unwrap().blocked = false;
            self.promote_in_parent(parent);
            child = parent;
        }
    }

    /// `id` just became blocked: walk towards the root, blocking every
    /// ancestor whose last runnable path this was.
    fn propagate_block(&mut self, id: TcId) {
        let mut child = id;
        while let Some(parent) = self.get(child).and_then(|n| n.parent) {
            self.demote_in_parent(child);
            let was_blocked = self.child_blocked(parent);
            let still_runnable = self.computes_runnable(parent);
            if was_blocked || still_runnable {
                self.refresh_priority_cursor(parent);
                break;
            }
            self.get_mut(parent).unwrap().blocked = true;
            child = parent;
        }
    }

    /// Recompute `id`'s own blocked flag from its children and propagate
    /// whichever way it flipped.
    pub fn reevaluate_block(&mut self, id: TcId) {
        let Some(node) = self.get(id) else { return };
        let was = node.blocked;
        let runnable = self.computes_runnable(id);
        self.get_mut(id).unwrap().blocked = !runnable;
        self.refresh_priority_cursor(id);
        if was && runnable {
            self.promote_in_parent(id);
            self.propagate_unblock(id);
        } else if !was && !runnable {
            self.propagate_block(id);
        }
    }

    /// Externally block a class (throttle, experimental backoff).
    pub fn block_class(&mut self, id: TcId, wakeup_time: u64) {
        if let Some(node) = self.get_mut(id) {
            node.blocked = true;
            node.wakeup_time = wakeup_time;
        }
        self.propagate_block(id);
    }

    /// Timer expiry: clear the wakeup and unblock if the subtree permits.
    pub fn wake_class(&mut self, id: TcId) {
        let Some(node) = self.get_mut(id) else { return };
        node.wakeup_time = 0;
        let runnable = self.computes_runnable(id);
        let node = self.get_mut(id).unwrap();
        let was_blocked = node.blocked;
        node.blocked = !runnable;
        if was_blocked && runnable {
            self.promote_in_parent(id);
            self.propagate_unblock(id);
        }
    }

    // ------------------------------------------------------------------
    // Selection and accounting
    // ------------------------------------------------------------------

    /// Next schedulable child of `id`, without structural changes.
    pub fn pick_next_child(&self, id: TcId) -> Option<TcId> {
        let node = self.get(id)?;
        match &node.policy {
            Policy::Priority {
                first_runnable,
                children,
            } => children.get(*first_runnable).map(|c| c.id),
            Policy::WeightedFair { runnable, .. } => runnable.peek().map(|e| e.0.id),
            Policy::RoundRobin { runnable, .. } => runnable.front().copied(),
            Policy::RateLimit { child, .. } => *child,
            Policy::Leaf { .. } => None,
        }
    }

    /// Walk from `root` to a leaf, recording the path. None if the root is
    /// blocked.
    pub fn pick_path(&self, root: TcId) -> Option<Vec<TcId>> {
        let node = self.get(root)?;
        if node.blocked {
            return None;
        }
        let mut path = vec![root];
        let mut cur = root;
        loop {
            let node = self.get(cur)?;
            if matches!(node.policy, Policy::Leaf { .. }) {
                return Some(path);
            }
            cur = self.pick_next_child(cur)?;
            path.push(cur);
        }
    }

    pub fn leaf_task(&self, id: TcId) -> Option<TaskSpec> {
        match &self.get(id)?.policy {
            Policy::Leaf { task, .. } => *task,
            _ => None,
        }
    }

    pub fn leaf_wait_cycles(&self, id: TcId) -> u64 {
        match self.get(id).map(|n| &n.policy) {
            Some(Policy::Leaf { wait_cycles, .. }) => *wait_cycles,
            _ => INITIAL_WAIT_CYCLES,
        }
    }

    pub fn set_leaf_wait_cycles(&mut self, id: TcId, cycles: u64) {
        if let Some(Policy::Leaf { wait_cycles, .. }) = self.get_mut(id).map(|n| &mut n.policy) {
            *wait_cycles = cycles;
        }
    }

    /// Charge `usage` along a previously picked path (leaf last), updating
    /// every policy's books and re-propagating blocked flags. Rate limiters
    /// on the path may throttle themselves into `wakeups`.
    ///
    /// Each ancestor's structural update happens after its child's blocked
    /// flag is final, so the walk must run bottom-up over the whole path:
    /// weighted-fair passes advance at every level the child ran under.
    pub fn finish_and_account(
        &mut self,
        wakeups: &mut WakeupQueue,
        path: &[TcId],
        usage: &ResourceArr,
        now: u64,
    ) {
        if path.is_empty() {
            return;
        }
        let leaf = *path.last().unwrap();
        if let Some(node) = self.get_mut(leaf) {
            for (acc, add) in node.stats.usage.iter_mut().zip(usage.iter()) {
                *acc += add;
            }
        }
        let mut child_blocked = self.child_blocked(leaf);

        for i in (0..path.len() - 1).rev() {
            let id = path[i];
            let child = path[i + 1];
            if let Some(node) = self.get_mut(id) {
                for (acc, add) in node.stats.usage.iter_mut().zip(usage.iter()) {
                    *acc += add;
                }
            } else {
                continue;
            }

            let now_blocked = match self.get(id).map(|n| n.policy.kind()) {
                Some("priority") => {
                    self.refresh_priority_cursor(id);
                    !self.computes_runnable(id)
                }
                Some("weighted_fair") => {
                    let mut empty = true;
                    if let Some(Policy::WeightedFair {
                        resource,
                        runnable,
                        blocked,
                        ..
                    }) = self.get_mut(id).map(|n| &mut n.policy)
                    {
                        let consumed = usage[*resource as usize] as i64;
                        // The child we ran is on top of the heap; charge its
                        // pass and re-sift, or shelve it if it went blocked.
                        if runnable.peek().map(|e| e.0.id) == Some(child) {
                            let mut entry = runnable.pop().unwrap().0;
                            entry.pass += entry.stride * consumed;
                            if child_blocked {
                                blocked.push(entry);
                            } else {
                                runnable.push(WfEntry(entry));
                            }
                        }
                        empty = runnable.is_empty();
                    }
                    empty
                }
                Some("round_robin") => {
                    let mut empty = true;
                    if let Some(Policy::RoundRobin { runnable, blocked }) =
                        self.get_mut(id).map(|n| &mut n.policy)
                    {
                        if runnable.front() == Some(&child) {
                            runnable.pop_front();
                            if child_blocked {
                                blocked.push(child);
                            } else {
                                runnable.push_back(child);
                            }
                        }
                        empty = runnable.is_empty();
                    }
                    empty
                }
                Some("rate_limit") => {
                    let mut now_blocked = child_blocked;
                    let mut throttle_until = None;
                    if let Some(node) = self.get_mut(id) {
                        if let Policy::RateLimit {
                            resource,
                            limit,
                            tokens,
                            max_burst,
                            last_tsc,
                            ..
                        } = &mut node.policy
                        {
                            if *limit > 0 {
                                // First account after creation or a move:
                                // start the clock now, or the whole uptime
                                // would count as refill.
                                if *last_tsc == 0 {
                                    *last_tsc = now;
                                }
                                let elapsed = now.saturating_sub(*last_tsc);
                                let refill = (elapsed as u128) * (*limit as u128);
                                *tokens =
                                    ((*tokens as u128 + refill).min(*max_burst as u128)) as u64;
                                let consumed = to_work_units(usage[*resource as usize]);
                                if *tokens < consumed {
                                    let deficit = consumed - *tokens;
                                    *tokens = 0;
                                    throttle_until = Some(now + deficit.div_ceil(*limit));
                                    now_blocked = true;
                                } else {
                                    *tokens -= consumed;
                                }
                            }
                            *last_tsc = now;
                        }
                        if let Some(until) = throttle_until {
                            node.wakeup_time = until;
                            node.stats.cnt_throttled += 1;
                            wakeups.add(id, until);
                        }
                    }
                    now_blocked
                }
                _ => child_blocked,
            };

            if let Some(node) = self.get_mut(id) {
                node.blocked = now_blocked;
            }
            child_blocked = now_blocked;
        }
    }

    /// Pop every expired entry and wake its class.
    pub fn wake_expired(&mut self, wakeups: &mut WakeupQueue, now: u64) {
        while let Some(&Reverse((when, idx))) = wakeups.heap.peek() {
            if when >= now {
                break;
            }
            wakeups.heap.pop();
            let id = TcId(idx);
            // Stale entries: class destroyed, or re-armed with another time.
            let Some(node) = self.get(id) else { continue };
            if node.wakeup_time != when {
                continue;
            }
            self.wake_class(id);
        }
    }

    // ------------------------------------------------------------------
    // Introspection / parameter updates
    // ------------------------------------------------------------------

    pub fn describe(&self, id: TcId) -> Option<serde_json::Value> {
        let node = self.get(id)?;
        let mut v = json!({
            "name": node.name,
            "policy": node.policy.kind(),
            "blocked": node.blocked,
            "stats": node.stats,
        });
        match &node.policy {
            Policy::WeightedFair { resource, .. } => {
                v["resource"] = json!(resource.name());
            }
            Policy::RateLimit {
                resource,
                limit_arg,
                max_burst_arg,
                ..
            } => {
                v["resource"] = json!(resource.name());
                v["limit"] = json!(limit_arg);
                v["max_burst"] = json!(max_burst_arg);
            }
            Policy::Leaf { task, .. } => {
                v["has_task"] = json!(task.is_some());
            }
            _ => {}
        }
        Some(v)
    }

    /// Update a rate limiter's parameters; the bucket restarts empty.
    pub fn update_rate_limit(
        &mut self,
        id: TcId,
        resource: Resource,
        limit_arg: u64,
        max_burst_arg: u64,
    ) -> ControlResult<()> {
        let node = self
            .get_mut(id)
            .ok_or_else(|| ControlError::NotFound(format!("class id {}", id.0)))?;
        match &mut node.policy {
            Policy::RateLimit {
                resource: res,
                limit,
                limit_arg: la,
                max_burst,
                max_burst_arg: ba,
                tokens,
                ..
            } => {
                *res = resource;
                *limit = to_work_units_per_cycle(limit_arg);
                *la = limit_arg;
                *max_burst = to_work_units(max_burst_arg);
                *ba = max_burst_arg;
                *tokens = 0;
                Ok(())
            }
            _ => Err(ControlError::InvalidArgument(format!(
                "{} is not a rate_limit class",
                node.name
            ))),
        }
    }

    /// Invariant check used by tests: blocked == no runnable leaf below.
    #[cfg(test)]
    pub fn check_blocking_invariant(&self, root: TcId) -> bool {
        self.subtree(root).into_iter().all(|id| {
            let node = self.get(id).unwrap();
            node.blocked == !self.has_runnable_leaf(id)
        })
    }

    #[cfg(test)]
    fn has_runnable_leaf(&self, id: TcId) -> bool {
        let node = self.get(id).unwrap();
        match &node.policy {
            Policy::Leaf { task, .. } => task.is_some() && node.wakeup_time == 0,
            Policy::RateLimit { child, .. } => {
                node.wakeup_time == 0
                    && child.map(|c| self.has_runnable_leaf(c)).unwrap_or(false)
            }
            _ => self
                .children_of(id)
                .iter()
                .any(|&c| self.has_runnable_leaf(c)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ModuleId;

    fn task(arg: u64) -> TaskSpec {
        TaskSpec {
            module: ModuleId { idx: 0, gen: 0 },
            arg,
        }
    }

    fn usage_one(packets: u64) -> ResourceArr {
        [1, 100, packets, packets * 60 * 8]
    }

    #[test]
    fn empty_leaf_blocks_until_task_attached() {
        let mut t = TcTree::new();
        let root = t.new_priority("root");
        let leaf = t.new_leaf("leaf", None);
        t.add_child(root, leaf, AttachArgs::Priority(10)).unwrap();
        assert!(t.get(leaf).unwrap().blocked);
        assert!(t.get(root).unwrap().blocked);
        assert_eq!(t.pick_path(root), None);

        t.attach_task(leaf, task(0)).unwrap();
        assert!(!t.get(leaf).unwrap().blocked);
        assert!(!t.get(root).unwrap().blocked);
        assert_eq!(t.pick_path(root), Some(vec![root, leaf]));
        assert!(t.check_blocking_invariant(root));
    }

    #[test]
    fn priority_prefers_lowest_value() {
        let mut t = TcTree::new();
        let root = t.new_priority("root");
        let hi = t.new_leaf("hi", Some(task(1)));
        let lo = t.new_leaf("lo", Some(task(2)));
        t.add_child(root, lo, AttachArgs::Priority(10)).unwrap();
        t.add_child(root, hi, AttachArgs::Priority(5)).unwrap();

        // Always the priority-5 child while it is runnable.
        for _ in 0..3 {
            assert_eq!(t.pick_path(root), Some(vec![root, hi]));
        }

        // Block it: the priority-10 child takes over.
        t.block_class(hi, u64::MAX);
        assert_eq!(t.pick_path(root), Some(vec![root, lo]));

        // Unblock: back to priority 5.
        t.wake_class(hi);
        assert_eq!(t.pick_path(root), Some(vec![root, hi]));
        assert!(t.check_blocking_invariant(root));
    }

    #[test]
    fn duplicate_priority_rejected() {
        let mut t = TcTree::new();
        let root = t.new_priority("root");
        let a = t.new_leaf("a", Some(task(0)));
        let b = t.new_leaf("b", Some(task(1)));
        t.add_child(root, a, AttachArgs::Priority(7)).unwrap();
        assert!(matches!(
            t.add_child(root, b, AttachArgs::Priority(7)),
            Err(ControlError::AlreadyExists(_))
        ));
    }

    #[test]
    fn priority_single_child_cursor_stays_zero() {
        let mut t = TcTree::new();
        let root = t.new_priority("root");
        let only = t.new_leaf("only", Some(task(0)));
        t.add_child(root, only, AttachArgs::Priority(3)).unwrap();
        let mut wakeups = WakeupQueue::default();
        for _ in 0..10 {
            let path = t.pick_path(root).unwrap();
            assert_eq!(path, vec![root, only]);
            t.finish_and_account(&mut wakeups, &path, &usage_one(32), 1000);
            if let Policy::Priority { first_runnable, .. } = &t.get(root).unwrap().policy {
                assert_eq!(*first_runnable, 0);
            }
        }
    }

    #[test]
    fn round_robin_rotates() {
        let mut t = TcTree::new();
        let root = t.new_round_robin("root");
        let a = t.new_leaf("a", Some(task(0)));
        let b = t.new_leaf("b", Some(task(1)));
        t.add_child(root, a, AttachArgs::Plain).unwrap();
        t.add_child(root, b, AttachArgs::Plain).unwrap();

        let mut wakeups = WakeupQueue::default();
        let mut order = Vec::new();
        for _ in 0..4 {
            let path = t.pick_path(root).unwrap();
            order.push(path[1]);
            t.finish_and_account(&mut wakeups, &path, &usage_one(32), 100);
        }
        assert_eq!(order, vec![a, b, a, b]);
    }

    #[test]
    fn round_robin_skips_blocked_child() {
        let mut t = TcTree::new();
        let root = t.new_round_robin("root");
        let a = t.new_leaf("a", Some(task(0)));
        let b = t.new_leaf("b", Some(task(1)));
        t.add_child(root, a, AttachArgs::Plain).unwrap();
        t.add_child(root, b, AttachArgs::Plain).unwrap();

        t.block_class(a, u64::MAX);
        let mut wakeups = WakeupQueue::default();
        for _ in 0..3 {
            let path = t.pick_path(root).unwrap();
            assert_eq!(path[1], b);
            t.finish_and_account(&mut wakeups, &path, &usage_one(1), 100);
        }
        t.wake_class(a);
        let picks: Vec<TcId> = (0..4)
            .map(|_| {
                let path = t.pick_path(root).unwrap();
                t.finish_and_account(&mut wakeups, &path, &usage_one(1), 200);
                path[1]
            })
            .collect();
        assert!(picks.contains(&a));
        assert!(picks.contains(&b));
    }

    #[test]
    fn weighted_fair_respects_shares() {
        let mut t = TcTree::new();
        let root = t.new_weighted_fair("root", Resource::Count);
        let heavy = t.new_leaf("heavy", Some(task(0)));
        let light = t.new_leaf("light", Some(task(1)));
        t.add_child(root, heavy, AttachArgs::Share(2)).unwrap();
        t.add_child(root, light, AttachArgs::Share(1)).unwrap();

        let mut wakeups = WakeupQueue::default();
        let mut counts = std::collections::HashMap::new();
        for _ in 0..300 {
            let path = t.pick_path(root).unwrap();
            *counts.entry(path[1]).or_insert(0u32) += 1;
            t.finish_and_account(&mut wakeups, &path, &usage_one(1), 100);
        }
        let h = counts[&heavy] as f64;
        let l = counts[&light] as f64;
        // Share 2 vs 1: heavy should get about twice the picks.
        assert!((h / l - 2.0).abs() < 0.1, "h={h} l={l}");
    }

    #[test]
    fn weighted_fair_single_child_is_passthrough() {
        let mut t = TcTree::new();
        let root = t.new_weighted_fair("root", Resource::Cycle);
        let only = t.new_leaf("only", Some(task(0)));
        t.add_child(root, only, AttachArgs::Share(5)).unwrap();

        let mut wakeups = WakeupQueue::default();
        for _ in 0..50 {
            let path = t.pick_path(root).unwrap();
            assert_eq!(path, vec![root, only]);
            t.finish_and_account(&mut wakeups, &path, &usage_one(32), 100);
        }
        // Pass values must not skew anything observable: still picked.
        assert!(!t.get(root).unwrap().blocked);
    }

    #[test]
    fn weighted_fair_zero_share_rejected() {
        let mut t = TcTree::new();
        let root = t.new_weighted_fair("root", Resource::Count);
        let a = t.new_leaf("a", Some(task(0)));
        assert!(matches!(
            t.add_child(root, a, AttachArgs::Share(0)),
            Err(ControlError::InvalidArgument(_))
        ));
    }

    #[test]
    fn rate_limit_throttles_and_wakes() {
        let mut t = TcTree::new();
        // 1000 packets/sec.
        let root = t.new_rate_limit("rl", Resource::Packet, 1000, 1000);
        let leaf = t.new_leaf("leaf", Some(task(0)));
        t.add_child(root, leaf, AttachArgs::Plain).unwrap();

        let mut wakeups = WakeupQueue::default();
        let mut now = 1_000_000u64;

        // First run is allowed (bucket starts empty but unthrottled).
        let path = t.pick_path(root).unwrap();
        t.finish_and_account(&mut wakeups, &path, &usage_one(32), now);

        // 32 packets at 1000/s blows the budget: throttled.
        assert!(t.get(root).unwrap().blocked);
        assert!(t.get(root).unwrap().wakeup_time > now);
        assert_eq!(t.get(root).unwrap().stats.cnt_throttled, 1);
        assert_eq!(t.pick_path(root), None);
        assert_eq!(wakeups.len(), 1);

        // Wake it past the deadline.
        now = t.get(root).unwrap().wakeup_time + 1;
        t.wake_expired(&mut wakeups, now);
        assert!(!t.get(root).unwrap().blocked);
        assert!(t.pick_path(root).is_some());
    }

    #[test]
    fn rate_limit_zero_is_unlimited() {
        let mut t = TcTree::new();
        let root = t.new_rate_limit("rl", Resource::Packet, 0, 0);
        let leaf = t.new_leaf("leaf", Some(task(0)));
        t.add_child(root, leaf, AttachArgs::Plain).unwrap();

        let mut wakeups = WakeupQueue::default();
        for i in 0..100 {
            let path = t.pick_path(root).expect("never throttles");
            t.finish_and_account(&mut wakeups, &path, &usage_one(32), 1000 + i);
        }
        assert_eq!(t.get(root).unwrap().stats.cnt_throttled, 0);
        assert!(wakeups.is_empty());
    }

    #[test]
    fn rate_limit_single_child_only() {
        let mut t = TcTree::new();
        let root = t.new_rate_limit("rl", Resource::Bit, 100, 100);
        let a = t.new_leaf("a", Some(task(0)));
        let b = t.new_leaf("b", Some(task(1)));
        t.add_child(root, a, AttachArgs::Plain).unwrap();
        assert!(matches!(
            t.add_child(root, b, AttachArgs::Plain),
            Err(ControlError::Busy(_))
        ));
    }

    #[test]
    fn sustained_rate_stays_bounded() {
        // Invariant 4: accounted resource <= (t1 - t0) * limit + max_burst.
        let mut t = TcTree::new();
        let limit_per_sec = 1_000_000u64;
        let root = t.new_rate_limit("rl", Resource::Packet, limit_per_sec, limit_per_sec);
        let leaf = t.new_leaf("leaf", Some(task(0)));
        t.add_child(root, leaf, AttachArgs::Plain).unwrap();

        let hz = tsc::tsc_hz();
        let t0 = 1_000_000u64;
        let horizon = hz; // one second of cycles
        let mut now = t0;
        let mut wakeups = WakeupQueue::default();
        let mut total_packets = 0u64;
        while now < t0 + horizon {
            t.wake_expired(&mut wakeups, now);
            if let Some(path) = t.pick_path(root) {
                total_packets += 32;
                t.finish_and_account(&mut wakeups, &path, &usage_one(32), now);
            }
            now += hz / 10_000; // 100us steps
        }
        let budget = limit_per_sec + limit_per_sec; // 1s * limit + max_burst
        assert!(
            total_packets <= budget,
            "forwarded {total_packets}, budget {budget}"
        );
        assert!(total_packets > limit_per_sec / 2, "made some progress");
    }

    #[test]
    fn remove_child_orphans_and_blocks_parent() {
        let mut t = TcTree::new();
        let root = t.new_round_robin("root");
        let leaf = t.new_leaf("leaf", Some(task(0)));
        t.add_child(root, leaf, AttachArgs::Plain).unwrap();
        assert!(!t.get(root).unwrap().blocked);

        t.remove_child(root, leaf).unwrap();
        assert_eq!(t.get(leaf).unwrap().parent, None);
        assert!(t.get(root).unwrap().blocked);

        // Removing twice is an error.
        assert!(matches!(
            t.remove_child(root, leaf),
            Err(ControlError::NotFound(_))
        ));
    }

    #[test]
    fn extract_graft_round_trip() {
        let mut t = TcTree::new();
        let root = t.new_weighted_fair("wf", Resource::Packet);
        let a = t.new_leaf("a", Some(task(7)));
        let b = t.new_leaf("b", None);
        t.add_child(root, a, AttachArgs::Share(3)).unwrap();
        t.add_child(root, b, AttachArgs::Share(5)).unwrap();

        let det = t.extract(root).unwrap();
        assert!(t.is_empty());
        let mut names = Vec::new();
        det.names(&mut names);
        assert_eq!(names, vec!["wf", "a", "b"]);

        let mut t2 = TcTree::new();
        let root2 = t2.graft(det);
        assert_eq!(t2.size(root2), 3);
        let a2 = t2.find_by_name(root2, "a").unwrap();
        assert_eq!(t2.leaf_task(a2), Some(task(7)));
        // Runnable leaf "a" keeps the grafted tree unblocked.
        assert!(!t2.get(root2).unwrap().blocked);
        assert!(t2.check_blocking_invariant(root2));
    }

    #[test]
    fn attached_class_cannot_be_extracted() {
        let mut t = TcTree::new();
        let root = t.new_round_robin("root");
        let leaf = t.new_leaf("leaf", Some(task(0)));
        t.add_child(root, leaf, AttachArgs::Plain).unwrap();
        assert!(matches!(t.extract(leaf), Err(ControlError::Busy(_))));
    }

    #[test]
    fn nested_tree_blocking_invariant() {
        let mut t = TcTree::new();
        let root = t.new_priority("root");
        let rr = t.new_round_robin("rr");
        let wf = t.new_weighted_fair("wf", Resource::Count);
        let l1 = t.new_leaf("l1", Some(task(1)));
        let l2 = t.new_leaf("l2", Some(task(2)));
        let l3 = t.new_leaf("l3", None);

        t.add_child(root, rr, AttachArgs::Priority(1)).unwrap();
        t.add_child(root, wf, AttachArgs::Priority(2)).unwrap();
        t.add_child(rr, l1, AttachArgs::Plain).unwrap();
        t.add_child(rr, l2, AttachArgs::Plain).unwrap();
        t.add_child(wf, l3, AttachArgs::Share(1)).unwrap();

        assert!(t.check_blocking_invariant(root));
        assert!(!t.get(root).unwrap().blocked);
        assert!(t.get(wf).unwrap().blocked, "wf has no runnable leaf");

        t.block_class(l1, u64::MAX);
        t.block_class(l2, u64::MAX);
        assert!(t.get(rr).unwrap().blocked);
        assert!(t.get(root).unwrap().blocked);
        assert!(t.check_blocking_invariant(root));

        t.attach_task(l3, task(3)).unwrap();
        assert!(!t.get(wf).unwrap().blocked);
        assert!(!t.get(root).unwrap().blocked);
        assert!(t.check_blocking_invariant(root));
    }

    #[test]
    fn stats_accumulate_along_path() {
        let mut t = TcTree::new();
        let root = t.new_round_robin("root");
        let leaf = t.new_leaf("leaf", Some(task(0)));
        t.add_child(root, leaf, AttachArgs::Plain).unwrap();

        let mut wakeups = WakeupQueue::default();
        for _ in 0..3 {
            let path = t.pick_path(root).unwrap();
            t.finish_and_account(&mut wakeups, &path, &usage_one(32), 100);
        }
        let leaf_stats = t.get(leaf).unwrap().stats;
        let root_stats = t.get(root).unwrap().stats;
        assert_eq!(leaf_stats.usage[Resource::Count as usize], 3);
        assert_eq!(leaf_stats.usage[Resource::Packet as usize], 96);
        assert_eq!(root_stats.usage[Resource::Packet as usize], 96);
    }
}
