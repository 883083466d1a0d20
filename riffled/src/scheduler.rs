//! The per-worker scheduling loop.
//!
//! A scheduler owns one traffic-class tree plus the wakeup queue for
//! throttled classes. Every round it wakes expired classes, descends the
//! tree to a leaf, runs the leaf's task (which may walk half the module
//! graph on the same stack), and charges the observed usage back up the
//! tree.

use crate::graph::{GraphView, TaskSpec};
use crate::module::TaskResult;
use crate::pool::PacketPool;
use crate::tc::{
    AttachArgs, DetachedTc, ResourceArr, TcId, TcTree, WakeupQueue, INITIAL_WAIT_CYCLES,
    MAX_WAIT_CYCLES,
};
use crate::tsc;

/// Rounds between pause checks; must be a power of two.
pub const ROUNDS_PER_PAUSE_CHECK: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    Default,
    /// Backs off leaves whose tasks report no work, so idle sources stop
    /// spinning.
    Experimental,
}

impl SchedulerKind {
    pub fn parse(s: &str) -> Result<SchedulerKind, crate::error::ControlError> {
        match s {
            "" | "default" => Ok(SchedulerKind::Default),
            "experimental" => Ok(SchedulerKind::Experimental),
            other => Err(crate::error::ControlError::InvalidArgument(format!(
                "unknown scheduler '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct SchedStats {
    pub usage: ResourceArr,
    pub cnt_idle: u64,
    pub cycles_idle: u64,
}

pub struct Scheduler {
    kind: SchedulerKind,
    pub tree: TcTree,
    root: Option<TcId>,
    default_rr: Option<TcId>,
    wakeups: WakeupQueue,
    stats: SchedStats,
    checkpoint: u64,
}

impl Scheduler {
    pub fn new(kind: SchedulerKind) -> Scheduler {
        Scheduler {
            kind,
            tree: TcTree::new(),
            root: None,
            default_rr: None,
            wakeups: WakeupQueue::default(),
            stats: SchedStats::default(),
            checkpoint: 0,
        }
    }

    pub fn kind(&self) -> SchedulerKind {
        self.kind
    }

    pub fn root(&self) -> Option<TcId> {
        self.root
    }

    pub fn stats(&self) -> SchedStats {
        self.stats
    }

    pub fn num_tcs(&self) -> usize {
        self.root.map(|r| self.tree.size(r)).unwrap_or(0)
    }

    /// Names of every class in this scheduler's tree.
    pub fn class_names(&self) -> Vec<String> {
        let Some(root) = self.root else {
            return Vec::new();
        };
        self.tree
            .subtree(root)
            .into_iter()
            .filter_map(|id| self.tree.get(id).map(|n| n.name.clone()))
            .collect()
    }

    pub fn find(&self, name: &str) -> Option<TcId> {
        self.tree.find_by_name(self.root?, name)
    }

    /// Graft an orphan subtree at the top of the tree. An empty scheduler
    /// adopts it as the root; otherwise a synthesized round-robin root named
    /// `!default_rr_<wid>` holds the existing root and the newcomer.
    pub fn attach_orphan(&mut self, det: DetachedTc, wid: usize) {
        let id = self.tree.graft(det);
        let Some(root) = self.root else {
            self.root = Some(id);
            return;
        };
        if let Some(rr) = self.default_rr {
            let _ = self.tree.add_child(rr, id, AttachArgs::Plain);
            return;
        }
        let rr = self.tree.new_round_robin(&format!("!default_rr_{wid}"));
        let _ = self.tree.add_child(rr, root, AttachArgs::Plain);
        let _ = self.tree.add_child(rr, id, AttachArgs::Plain);
        self.root = Some(rr);
        self.default_rr = Some(rr);
    }

    /// Collapse a synthesized round-robin root that no longer needs to
    /// exist (one child or none).
    pub fn adjust_default(&mut self) {
        let Some(rr) = self.default_rr else { return };
        let children = self.tree.children_of(rr);
        match children.len() {
            0 => {
                let _ = self.tree.extract(rr);
                self.root = None;
                self.default_rr = None;
            }
            1 => {
                let only = children[0];
                let _ = self.tree.remove_child(rr, only);
                let _ = self.tree.extract(rr);
                self.root = Some(only);
                self.default_rr = None;
            }
            _ => {}
        }
    }

    /// Detach the class `name` (and its whole subtree) from this scheduler,
    /// returning it in portable form.
    pub fn detach_class(&mut self, name: &str) -> Option<DetachedTc> {
        let id = self.find(name)?;
        let parent = self.tree.get(id)?.parent;
        match parent {
            Some(parent) => {
                self.tree.remove_child(parent, id).ok()?;
            }
            None => {
                // Detaching the root.
                self.root = None;
                if self.default_rr == Some(id) {
                    self.default_rr = None;
                }
            }
        }
        self.tree.extract(id).ok()
    }

    /// Every bound task in this scheduler.
    pub fn tasks(&self) -> Vec<(TcId, TaskSpec)> {
        self.root
            .map(|r| self.tree.leaves_under(r))
            .unwrap_or_default()
    }

    /// Pick the next leaf. Wakes expired classes first; None if the tree is
    /// empty or fully blocked.
    pub fn next(&mut self, now: u64) -> Option<Vec<TcId>> {
        self.tree.wake_expired(&mut self.wakeups, now);
        self.tree.pick_path(self.root?)
    }

    /// One schedule -> run -> account round.
    pub fn schedule_once(&mut self, view: &GraphView, wid: usize, pool: &PacketPool) {
        if self.checkpoint == 0 {
            self.checkpoint = tsc::rdtsc();
        }
        let now;
        match self.next(self.checkpoint) {
            Some(path) => {
                let leaf = *path.last().unwrap();
                let result = match self.tree.leaf_task(leaf) {
                    Some(spec) => view.run_task(spec, wid, pool, self.checkpoint),
                    None => TaskResult {
                        block: true,
                        packets: 0,
                        bits: 0,
                    },
                };
                now = tsc::rdtsc();

                let mut usage: ResourceArr = [
                    1,
                    now.saturating_sub(self.checkpoint),
                    result.packets,
                    result.bits,
                ];

                if self.kind == SchedulerKind::Experimental {
                    if result.block && result.packets == 0 {
                        // Idle task: double its wait and park it in the
                        // wakeup queue instead of spinning.
                        let wait = (self.tree.leaf_wait_cycles(leaf) << 1).min(MAX_WAIT_CYCLES);
                        self.tree.set_leaf_wait_cycles(leaf, wait);
                        self.tree.block_class(leaf, now + wait);
                        self.wakeups.add(leaf, now + wait);
                        usage = [0; 4];
                    } else {
                        let halved = ((self.tree.leaf_wait_cycles(leaf) + 1) >> 1)
                            .max(INITIAL_WAIT_CYCLES);
                        self.tree.set_leaf_wait_cycles(leaf, halved);
                    }
                }

                for (acc, add) in self.stats.usage.iter_mut().zip(usage.iter()) {
                    *acc += add;
                }
                self.tree
                    .finish_and_account(&mut self.wakeups, &path, &usage, now);
            }
            None => {
                self.stats.cnt_idle += 1;
                now = tsc::rdtsc();
                self.stats.cycles_idle += now.saturating_sub(self.checkpoint);
            }
        }
        self.checkpoint = now;
    }

    /// Run a burst of rounds between pause checks.
    pub fn run_burst(&mut self, view: &GraphView, wid: usize, pool: &PacketPool) {
        for _ in 0..ROUNDS_PER_PAUSE_CHECK {
            self.schedule_once(view, wid, pool);
        }
    }

    pub fn wakeup_queue_len(&self) -> usize {
        self.wakeups.len()
    }

    pub fn default_rr(&self) -> Option<TcId> {
        self.default_rr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ModuleId;

    fn leaf_det(name: &str, arg: u64) -> DetachedTc {
        DetachedTc::leaf(
            name,
            Some(TaskSpec {
                module: ModuleId { idx: 0, gen: 0 },
                arg,
            }),
        )
    }

    #[test]
    fn first_orphan_becomes_root() {
        let mut s = Scheduler::new(SchedulerKind::Default);
        s.attach_orphan(leaf_det("l1", 0), 0);
        assert_eq!(s.num_tcs(), 1);
        assert!(s.default_rr().is_none());
        assert!(s.find("l1").is_some());
    }

    #[test]
    fn second_orphan_synthesizes_default_rr() {
        let mut s = Scheduler::new(SchedulerKind::Default);
        s.attach_orphan(leaf_det("l1", 0), 3);
        s.attach_orphan(leaf_det("l2", 1), 3);
        assert_eq!(s.num_tcs(), 3);
        let rr = s.default_rr().expect("default rr synthesized");
        assert_eq!(s.tree.get(rr).unwrap().name, "!default_rr_3");
        assert_eq!(s.tree.children_of(rr).len(), 2);

        // A third orphan joins the same rr root.
        s.attach_orphan(leaf_det("l3", 2), 3);
        assert_eq!(s.tree.children_of(rr).len(), 3);
    }

    #[test]
    fn default_rr_collapses_when_single_child_left() {
        let mut s = Scheduler::new(SchedulerKind::Default);
        s.attach_orphan(leaf_det("l1", 0), 0);
        s.attach_orphan(leaf_det("l2", 1), 0);
        assert!(s.default_rr().is_some());

        let det = s.detach_class("l2").expect("detach l2");
        drop(det);
        s.adjust_default();
        assert!(s.default_rr().is_none());
        assert_eq!(s.num_tcs(), 1);
        assert!(s.find("l1").is_some());
        assert!(s.find("!default_rr_0").is_none());
    }

    #[test]
    fn detach_root_empties_scheduler() {
        let mut s = Scheduler::new(SchedulerKind::Default);
        s.attach_orphan(leaf_det("l1", 0), 0);
        let det = s.detach_class("l1").unwrap();
        assert_eq!(det.name, "l1");
        assert_eq!(s.num_tcs(), 0);
        assert!(s.root().is_none());
    }
}
