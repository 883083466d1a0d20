//! Pinned worker threads and the pause/resume handshake.
//!
//! A worker is an OS thread pinned to one core, running its scheduler in
//! bursts of 256 rounds. Between bursts it checks for a pause request; when
//! one is pending it parks on an eventfd until the control plane writes an
//! unblock or quit signal. All structural reconfiguration happens while
//! every worker is parked, which is what lets workers read shared state
//! without locks.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use arc_swap::ArcSwap;
use log::{info, warn};

use crate::error::{ControlError, ControlResult};
use crate::graph::GraphView;
use crate::pool::PacketPool;
use crate::scheduler::{Scheduler, SchedulerKind};

pub const MAX_WORKERS: usize = 64;

/// Orphan placement hint meaning "any worker".
pub const ANY_WORKER: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum WorkerStatus {
    Pausing = 0,
    Paused = 1,
    Running = 2,
    Finished = 3,
}

impl WorkerStatus {
    fn from_u32(v: u32) -> WorkerStatus {
        match v {
            0 => WorkerStatus::Pausing,
            1 => WorkerStatus::Paused,
            2 => WorkerStatus::Running,
            _ => WorkerStatus::Finished,
        }
    }
}

const SIGNAL_UNBLOCK: u64 = 1;
const SIGNAL_QUIT: u64 = 2;

/// Check the sysfs cpu directory, the same way the kernel tools do.
pub fn is_cpu_present(core: usize) -> bool {
    std::path::Path::new(&format!("/sys/devices/system/cpu/cpu{core}")).exists()
}

/// NUMA node of a core; 0 when the topology is not exposed.
pub fn core_socket(core: usize) -> u32 {
    std::fs::read_to_string(format!(
        "/sys/devices/system/cpu/cpu{core}/topology/physical_package_id"
    ))
    .ok()
    .and_then(|s| s.trim().parse().ok())
    .unwrap_or(0)
}

fn pin_to_core(core: usize) {
    // SAFETY: cpu_set_t is a plain bitmask; CPU_ZERO/CPU_SET only write
    // into the local value.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            warn!(
                "[worker] failed to pin to core {core}: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

/// State shared between a worker thread and the control plane.
pub struct WorkerShared {
    pub wid: usize,
    pub core: usize,
    pub socket: u32,
    status: AtomicU32,
    event: OwnedFd,
    /// The scheduler, including the whole traffic-class tree. The worker
    /// holds the lock for one burst at a time; the control plane takes it
    /// only while the worker is parked (or briefly, for stat snapshots).
    pub sched: Mutex<Scheduler>,
}

impl WorkerShared {
    pub fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u32(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: WorkerStatus) {
        self.status.store(status as u32, Ordering::Release);
    }

    fn is_pause_requested(&self) -> bool {
        self.status() == WorkerStatus::Pausing
    }

    fn signal(&self, value: u64) -> ControlResult<()> {
        let buf = value.to_ne_bytes();
        let n = unsafe {
            libc::write(
                self.event.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if n != buf.len() as isize {
            return Err(ControlError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Park until the control plane signals. Returns true to keep running.
    fn block(&self) -> bool {
        self.set_status(WorkerStatus::Paused);
        let mut buf = [0u8; 8];
        let n = unsafe {
            libc::read(
                self.event.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n != 8 {
            warn!("[worker {}] eventfd read failed; quitting", self.wid);
            self.set_status(WorkerStatus::Finished);
            return false;
        }
        match u64::from_ne_bytes(buf) {
            SIGNAL_UNBLOCK => {
                self.set_status(WorkerStatus::Running);
                true
            }
            _ => {
                self.set_status(WorkerStatus::Finished);
                false
            }
        }
    }
}

fn worker_main(
    shared: Arc<WorkerShared>,
    graph: Arc<ArcSwap<GraphView>>,
    pool: Arc<PacketPool>,
) {
    pin_to_core(shared.core);
    info!(
        "[worker {}] running on core {} (socket {})",
        shared.wid, shared.core, shared.socket
    );
    shared.set_status(WorkerStatus::Pausing);

    loop {
        if shared.is_pause_requested() && !shared.block() {
            break;
        }
        let view = graph.load_full();
        let mut sched = shared.sched.lock().unwrap();
        sched.run_burst(&view, shared.wid, &pool);
    }

    info!(
        "[worker {}] quitting (core {}, socket {})",
        shared.wid, shared.core, shared.socket
    );
}

pub struct WorkerHandle {
    pub shared: Arc<WorkerShared>,
    join: Option<JoinHandle<()>>,
}

/// All workers, indexed by wid. Owned by the hub.
pub struct WorkerSet {
    workers: Vec<Option<WorkerHandle>>,
    next_any: usize,
}

impl Default for WorkerSet {
    fn default() -> Self {
        WorkerSet {
            workers: (0..MAX_WORKERS).map(|_| None).collect(),
            next_any: 0,
        }
    }
}

impl WorkerSet {
    pub fn new() -> WorkerSet {
        WorkerSet::default()
    }

    pub fn get(&self, wid: usize) -> Option<&WorkerHandle> {
        self.workers.get(wid).and_then(Option::as_ref)
    }

    pub fn num_workers(&self) -> usize {
        self.workers.iter().flatten().count()
    }

    pub fn active_wids(&self) -> Vec<usize> {
        self.workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.is_some())
            .map(|(wid, _)| wid)
            .collect()
    }

    pub fn is_running(&self, wid: usize) -> bool {
        self.get(wid)
            .map(|w| w.shared.status() == WorkerStatus::Running)
            .unwrap_or(false)
    }

    pub fn any_running(&self) -> bool {
        self.active_wids().iter().any(|&wid| self.is_running(wid))
    }

    /// Per-worker NUMA sockets, for constraint checking.
    pub fn sockets(&self) -> Vec<Option<u32>> {
        (0..MAX_WORKERS)
            .map(|wid| self.get(wid).map(|w| w.shared.socket))
            .collect()
    }

    /// Spawn a worker and wait until it parks in PAUSED.
    pub fn launch(
        &mut self,
        wid: usize,
        core: usize,
        kind: SchedulerKind,
        graph: Arc<ArcSwap<GraphView>>,
        pool: Arc<PacketPool>,
    ) -> ControlResult<()> {
        if wid >= MAX_WORKERS {
            return Err(ControlError::InvalidArgument(format!(
                "worker id {wid} out of range (max {MAX_WORKERS})"
            )));
        }
        if self.get(wid).is_some() {
            return Err(ControlError::AlreadyExists(format!("worker {wid}")));
        }
        if !is_cpu_present(core) {
            return Err(ControlError::InvalidArgument(format!(
                "core {core} is not present"
            )));
        }
        if self
            .active_wids()
            .iter()
            .any(|&w| self.get(w).unwrap().shared.core == core)
        {
            return Err(ControlError::Busy(format!("core {core}")));
        }

        let raw: RawFd = unsafe { libc::eventfd(0, 0) };
        if raw < 0 {
            return Err(ControlError::Io(std::io::Error::last_os_error()));
        }
        // SAFETY: raw is a freshly created, unowned eventfd.
        let event = unsafe { OwnedFd::from_raw_fd(raw) };

        let shared = Arc::new(WorkerShared {
            wid,
            core,
            socket: core_socket(core),
            status: AtomicU32::new(WorkerStatus::Pausing as u32),
            event,
            sched: Mutex::new(Scheduler::new(kind)),
        });

        let thread_shared = shared.clone();
        let join = std::thread::Builder::new()
            .name(format!("riffle-worker-{wid}"))
            .spawn(move || worker_main(thread_shared, graph, pool))
            .map_err(ControlError::Io)?;

        // Wait for the thread to reach its first park.
        while shared.status() != WorkerStatus::Paused {
            std::hint::spin_loop();
        }

        self.workers[wid] = Some(WorkerHandle {
            shared,
            join: Some(join),
        });
        Ok(())
    }

    /// RUNNING -> PAUSING, then spin until the worker parks.
    pub fn pause_worker(&self, wid: usize) {
        let Some(w) = self.get(wid) else { return };
        if w.shared
            .status
            .compare_exchange(
                WorkerStatus::Running as u32,
                WorkerStatus::Pausing as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            while w.shared.status() == WorkerStatus::Pausing {
                std::hint::spin_loop();
            }
        }
    }

    /// Pause every running worker; returns the set that was actually
    /// paused (so a scoped pauser resumes exactly those).
    pub fn pause_running(&self) -> Vec<usize> {
        let mut paused = Vec::new();
        for wid in self.active_wids() {
            if self.is_running(wid) {
                self.pause_worker(wid);
                paused.push(wid);
            }
        }
        paused
    }

    pub fn resume_worker(&self, wid: usize) -> ControlResult<()> {
        let Some(w) = self.get(wid) else {
            return Err(ControlError::NotFound(format!("worker {wid}")));
        };
        if w.shared.status() != WorkerStatus::Paused {
            return Ok(());
        }
        w.shared.signal(SIGNAL_UNBLOCK)?;
        while w.shared.status() == WorkerStatus::Paused {
            std::hint::spin_loop();
        }
        Ok(())
    }

    /// Pause, signal quit, wait for the thread to finish, drop the slot.
    /// The caller is responsible for rejecting destruction while traffic
    /// classes are still attached.
    pub fn destroy_worker(&mut self, wid: usize) -> ControlResult<()> {
        if self.get(wid).is_none() {
            return Err(ControlError::NotFound(format!("worker {wid}")));
        }
        self.pause_worker(wid);
        {
            let w = self.get(wid).unwrap();
            if w.shared.status() == WorkerStatus::Paused {
                w.shared.signal(SIGNAL_QUIT)?;
                while w.shared.status() == WorkerStatus::Paused {
                    std::hint::spin_loop();
                }
            }
        }
        if let Some(mut handle) = self.workers[wid].take() {
            if let Some(join) = handle.join.take() {
                let _ = join.join();
            }
        }
        Ok(())
    }

    /// Round-robin choice for orphans hinted to "any worker".
    pub fn next_active_worker(&mut self) -> Option<usize> {
        let active = self.active_wids();
        if active.is_empty() {
            return None;
        }
        let pick = active[self.next_any % active.len()];
        self.next_any = self.next_any.wrapping_add(1);
        Some(pick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps() -> (Arc<ArcSwap<GraphView>>, Arc<PacketPool>) {
        (
            Arc::new(ArcSwap::new(GraphView::empty())),
            Arc::new(PacketPool::new_plain("wtest", 128, 0)),
        )
    }

    #[test]
    fn launch_pause_resume_destroy() {
        let (graph, pool) = deps();
        let mut set = WorkerSet::new();
        set.launch(0, 0, SchedulerKind::Default, graph, pool)
            .unwrap();
        assert_eq!(set.get(0).unwrap().shared.status(), WorkerStatus::Paused);

        set.resume_worker(0).unwrap();
        assert_eq!(set.get(0).unwrap().shared.status(), WorkerStatus::Running);

        set.pause_worker(0);
        assert_eq!(set.get(0).unwrap().shared.status(), WorkerStatus::Paused);

        // Idempotent pause.
        set.pause_worker(0);
        assert_eq!(set.get(0).unwrap().shared.status(), WorkerStatus::Paused);

        set.destroy_worker(0).unwrap();
        assert_eq!(set.num_workers(), 0);
    }

    #[test]
    fn duplicate_wid_and_core_rejected() {
        let (graph, pool) = deps();
        let mut set = WorkerSet::new();
        set.launch(1, 0, SchedulerKind::Default, graph.clone(), pool.clone())
            .unwrap();
        assert!(matches!(
            set.launch(1, 0, SchedulerKind::Default, graph.clone(), pool.clone()),
            Err(ControlError::AlreadyExists(_))
        ));
        assert!(matches!(
            set.launch(2, 0, SchedulerKind::Default, graph, pool),
            Err(ControlError::Busy(_))
        ));
        set.destroy_worker(1).unwrap();
    }

    #[test]
    fn pause_running_reports_only_previously_running() {
        let (graph, pool) = deps();
        let mut set = WorkerSet::new();
        set.launch(0, 0, SchedulerKind::Default, graph, pool)
            .unwrap();
        // Worker parks immediately after launch: nothing was running.
        assert!(set.pause_running().is_empty());

        set.resume_worker(0).unwrap();
        assert_eq!(set.pause_running(), vec![0]);
        set.destroy_worker(0).unwrap();
    }
}
