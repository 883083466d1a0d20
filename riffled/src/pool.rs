//! Packet pools.
//!
//! A pool is a contiguous region of fixed-size packet buffers plus a
//! lock-free free list of buffer indices. Alloc/free are multi-producer,
//! multi-consumer and never block; the control plane only gets involved to
//! create pools and to report occupancy.
//!
//! Three backing variants:
//!   - plain:     anonymous pages; fine for tests, useless for DMA.
//!   - huge-page: anonymous mapping with MADV_HUGEPAGE and best-effort
//!     physical address resolution; the daemon default.
//!   - external:  a caller-provided mapping (hosting allocator, hugetlbfs
//!     file, test fixture).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use log::warn;
use memmap2::MmapMut;

use crate::batch::PacketBatch;
use crate::packet::{Packet, PacketData, PKT_DATA, PKT_DATA_OFF, PKT_SIZE};

/// Default per-pool capacity: 64k - 1 buffers.
pub const DEFAULT_POOL_CAPACITY: usize = (1 << 16) - 1;

/// The part of a pool that live packets point back into.
pub struct PoolShared {
    name: String,
    socket: u32,
    base: *mut u8,
    capacity: usize,
    freelist: ArrayQueue<u32>,
    physically_contiguous: bool,
    pinned: bool,
}

// SAFETY: `base` addresses a mapping owned by the enclosing PacketPool for
// the pool's whole lifetime; all mutation of buffer contents is governed by
// packet ownership, and the free list is lock-free.
unsafe impl Send for PoolShared {}
unsafe impl Sync for PoolShared {}

impl PoolShared {
    #[inline]
    fn buffer_at(&self, index: u32) -> *mut PacketData {
        debug_assert!((index as usize) < self.capacity);
        unsafe { self.base.add(index as usize * PKT_SIZE) as *mut PacketData }
    }
}

/// Decrement one reference per segment; buffers reaching zero go back to
/// their pool.
///
/// # Safety
/// `head` must point to a live pool-populated buffer and the caller must own
/// the reference being released.
pub(crate) unsafe fn free_raw(head: *mut PacketData) {
    let mut seg = head;
    while !seg.is_null() {
        let next = (*seg).next;
        if (*seg).refcnt.fetch_sub(1, Ordering::Release) == 1 {
            std::sync::atomic::fence(Ordering::Acquire);
            (*seg).next = std::ptr::null_mut();
            (*seg).nb_segs = 1;
            let pool = (*seg).pool as *const PoolShared;
            debug_assert!(!pool.is_null());
            // Push cannot fail: the queue holds exactly `capacity` slots and
            // each index is outstanding at most once.
            let _ = (*pool).freelist.push((*seg).index);
        }
        seg = next;
    }
}

enum Backing {
    Plain { layout: std::alloc::Layout, ptr: *mut u8 },
    Mapped(MmapMut),
}

/// A bounded pool of `PKT_SIZE` packet buffers.
pub struct PacketPool {
    shared: Arc<PoolShared>,
    backing: Backing,
    virtually_contiguous: bool,
}

// SAFETY: see PoolShared; the backing is only touched on drop.
unsafe impl Send for PacketPool {}
unsafe impl Sync for PacketPool {}

impl PacketPool {
    /// Plain-page pool. Not DMA-capable; packets report paddr == 0.
    pub fn new_plain(name: &str, capacity: usize, socket: u32) -> PacketPool {
        let layout =
            std::alloc::Layout::from_size_align(capacity * PKT_SIZE, 64).expect("pool layout");
        // SAFETY: layout has non-zero size for any capacity >= 1.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "pool allocation failed");
        let pool = PacketPool {
            shared: Arc::new(PoolShared {
                name: name.to_string(),
                socket,
                base: ptr,
                capacity,
                freelist: ArrayQueue::new(capacity),
                physically_contiguous: false,
                pinned: false,
            }),
            backing: Backing::Plain { layout, ptr },
            virtually_contiguous: true,
        };
        pool.populate(false);
        pool
    }

    /// Huge-page pool: anonymous mapping, MADV_HUGEPAGE requested, physical
    /// addresses resolved through the pagemap when the process is allowed
    /// to. This is the daemon default.
    pub fn new_hugepage(name: &str, capacity: usize, socket: u32) -> std::io::Result<PacketPool> {
        let len = capacity * PKT_SIZE;
        let map = MmapMut::map_anon(len)?;
        let base = map.as_ptr() as *mut u8;

        // Best-effort hint; the kernel may ignore it.
        let ret = unsafe { libc::madvise(base as *mut libc::c_void, len, libc::MADV_HUGEPAGE) };
        if ret != 0 {
            warn!(
                "[pool] MADV_HUGEPAGE failed for {name} ({}); continuing with base pages",
                std::io::Error::last_os_error()
            );
        }
        let pinned = unsafe { libc::mlock(base as *const libc::c_void, len) } == 0;
        if !pinned {
            warn!("[pool] mlock failed for {name}; physical addresses may change");
        }

        let pool = PacketPool {
            shared: Arc::new(PoolShared {
                name: name.to_string(),
                socket,
                base,
                capacity,
                freelist: ArrayQueue::new(capacity),
                physically_contiguous: false,
                pinned,
            }),
            backing: Backing::Mapped(map),
            virtually_contiguous: true,
        };
        pool.populate(true);
        Ok(pool)
    }

    /// Pool over a mapping owned by someone else's allocator.
    pub fn from_region(name: &str, region: MmapMut, socket: u32) -> PacketPool {
        let capacity = region.len() / PKT_SIZE;
        assert!(capacity > 0, "region too small for a single packet");
        let base = region.as_ptr() as *mut u8;
        let pool = PacketPool {
            shared: Arc::new(PoolShared {
                name: name.to_string(),
                socket,
                base,
                capacity,
                freelist: ArrayQueue::new(capacity),
                physically_contiguous: false,
                pinned: true,
            }),
            backing: Backing::Mapped(region),
            virtually_contiguous: true,
        };
        pool.populate(true);
        pool
    }

    fn populate(&self, resolve_phys: bool) {
        let mut pagemap = if resolve_phys { Pagemap::open() } else { None };
        for i in 0..self.shared.capacity {
            let p = self.shared.buffer_at(i as u32);
            // SAFETY: `p` addresses a zeroed, exclusively-owned buffer slot.
            unsafe {
                (*p).buf_addr = (p as *mut u8).add(crate::packet::PKT_HEADROOM_OFF);
                (*p).vaddr = p;
                (*p).paddr = pagemap
                    .as_mut()
                    .map(|pm| pm.phys_addr(p as u64))
                    .unwrap_or(0);
                (*p).socket = self.shared.socket;
                (*p).index = i as u32;
                (*p).pool = Arc::as_ptr(&self.shared);
                (*p).nb_segs = 1;
                (*p).next = std::ptr::null_mut();
                (*p).refcnt.store(0, Ordering::Relaxed);
            }
            let _ = self.shared.freelist.push(i as u32);
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn socket(&self) -> u32 {
        self.shared.socket
    }

    /// Total number of buffers in the pool.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Buffers currently free. Approximate while workers run.
    pub fn available(&self) -> usize {
        self.shared.freelist.len()
    }

    pub fn is_virtually_contiguous(&self) -> bool {
        self.virtually_contiguous
    }

    pub fn is_physically_contiguous(&self) -> bool {
        self.shared.physically_contiguous
    }

    pub fn is_pinned(&self) -> bool {
        self.shared.pinned
    }

    /// Allocate one packet with `len` bytes of (uninitialized) payload.
    pub fn alloc(&self, len: usize) -> Option<Packet> {
        debug_assert!(len <= PKT_DATA);
        let index = self.shared.freelist.pop()?;
        let p = self.shared.buffer_at(index);
        // SAFETY: popping the index grants exclusive ownership of the slot.
        unsafe {
            (*p).data_off = PKT_DATA_OFF as u16;
            (*p).data_len = len as u16;
            (*p).pkt_len = len as u32;
            (*p).nb_segs = 1;
            (*p).next = std::ptr::null_mut();
            (*p).refcnt.store(1, Ordering::Relaxed);
            Some(Packet::from_raw(NonNull::new_unchecked(p)))
        }
    }

    /// Allocate exactly `count` packets into `out`, or none at all.
    pub fn alloc_bulk(&self, out: &mut PacketBatch, count: usize, len: usize) -> bool {
        debug_assert!(count <= out.remaining());
        for i in 0..count {
            match self.alloc(len) {
                Some(pkt) => out.push(pkt),
                None => {
                    // Roll back; over-allocation must have no side effect.
                    for _ in 0..i {
                        drop(out.pop());
                    }
                    return false;
                }
            }
        }
        true
    }

    /// Copy a linear packet into a fresh buffer from this pool.
    pub fn copy_packet(&self, src: &Packet) -> Option<Packet> {
        debug_assert!(src.is_linear());
        let mut dst = self.alloc(src.data_len())?;
        dst.head_mut().copy_from_slice(src.head());
        Some(dst)
    }

    /// Handle for packets to find their way home; used by tests that need
    /// to compare identity.
    pub(crate) fn shared_ptr(&self) -> *const PoolShared {
        Arc::as_ptr(&self.shared)
    }
}

impl Drop for PacketPool {
    fn drop(&mut self) {
        if self.available() != self.capacity() {
            // Outstanding packets still point into the mapping. Leak it
            // rather than hand them a dangling pool.
            warn!(
                "[pool] dropping {} with {} buffers outstanding; leaking backing memory",
                self.shared.name,
                self.capacity() - self.available()
            );
            match std::mem::replace(
                &mut self.backing,
                Backing::Plain {
                    layout: std::alloc::Layout::new::<u8>(),
                    ptr: std::ptr::null_mut(),
                },
            ) {
                Backing::Mapped(map) => std::mem::forget(map),
                Backing::Plain { .. } => {}
            }
            return;
        }
        if let Backing::Plain { layout, ptr } = &self.backing {
            if !ptr.is_null() {
                // SAFETY: allocated with this exact layout in new_plain.
                unsafe { std::alloc::dealloc(*ptr, *layout) };
            }
        }
    }
}

/// Free every packet in `batch`. When all packets are simple (one segment,
/// one reference) and come from the same pool, the whole batch is returned
/// with plain stores instead of per-segment atomic RMWs; otherwise each
/// packet takes the generic free path.
pub fn free_bulk(batch: &mut PacketBatch) {
    let fast = !batch.is_empty() && {
        let first_pool = unsafe { (*batch.get(0).unwrap().raw()).pool };
        batch
            .iter()
            .all(|p| p.is_simple() && unsafe { (*p.raw()).pool } == first_pool)
    };
    if !fast {
        while let Some(pkt) = batch.pop() {
            drop(pkt);
        }
        return;
    }
    while let Some(pkt) = batch.pop() {
        let raw = pkt.into_raw();
        // SAFETY: is_simple() guaranteed refcnt == 1 and we own that
        // reference, so no other thread can observe the buffer.
        unsafe {
            (*raw).refcnt.store(0, Ordering::Release);
            (*raw).next = std::ptr::null_mut();
            (*raw).nb_segs = 1;
            let pool = (*raw).pool as *const PoolShared;
            let _ = (*pool).freelist.push((*raw).index);
        }
    }
}

/// Translates virtual to physical addresses via /proc/self/pagemap.
struct Pagemap {
    file: File,
    warned: bool,
}

impl Pagemap {
    fn open() -> Option<Pagemap> {
        match File::open("/proc/self/pagemap") {
            Ok(file) => Some(Pagemap {
                file,
                warned: false,
            }),
            Err(err) => {
                warn!("[pool] pagemap unavailable ({err}); packets will carry paddr=0");
                None
            }
        }
    }

    fn phys_addr(&mut self, virt: u64) -> u64 {
        const PAGE: u64 = 4096;
        let entry_off = (virt / PAGE) * 8;
        let mut buf = [0u8; 8];
        let ok = self
            .file
            .seek(SeekFrom::Start(entry_off))
            .and_then(|_| self.file.read_exact(&mut buf))
            .is_ok();
        if !ok {
            return 0;
        }
        let entry = u64::from_le_bytes(buf);
        let present = entry >> 63 != 0;
        let pfn = entry & ((1u64 << 55) - 1);
        if !present || pfn == 0 {
            if !self.warned {
                warn!("[pool] pagemap PFNs hidden (need CAP_SYS_ADMIN); paddr=0");
                self.warned = true;
            }
            return 0;
        }
        pfn * PAGE + virt % PAGE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_sets_invariants() {
        let pool = PacketPool::new_plain("t0", 64, 0);
        let pkt = pool.alloc(100).unwrap();
        assert_eq!(pkt.data_off() as usize, PKT_DATA_OFF);
        assert_eq!(pkt.data_len(), 100);
        assert_eq!(pkt.total_len(), 100);
        assert_eq!(pkt.nb_segs(), 1);
        assert_eq!(pkt.refcnt(), 1);
        assert_eq!(pool.available(), 63);
        drop(pkt);
        assert_eq!(pool.available(), 64);
    }

    #[test]
    fn alloc_bulk_is_all_or_nothing() {
        let pool = PacketPool::new_plain("t1", 8, 0);
        let mut batch = PacketBatch::new();
        assert!(!pool.alloc_bulk(&mut batch, 9, 60));
        assert_eq!(batch.len(), 0);
        assert_eq!(pool.available(), 8);

        assert!(pool.alloc_bulk(&mut batch, 8, 60));
        assert_eq!(batch.len(), 8);
        assert_eq!(pool.available(), 0);
        assert!(pool.alloc(60).is_none());
        free_bulk(&mut batch);
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn shared_packet_survives_one_free() {
        let pool = PacketPool::new_plain("t2", 4, 0);
        let pkt = pool.alloc(60).unwrap();
        let other = pkt.share();
        assert_eq!(pkt.refcnt(), 2);
        drop(pkt);
        // Still referenced: not back in the pool.
        assert_eq!(other.refcnt(), 1);
        assert_eq!(pool.available(), 3);
        drop(other);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn chained_segments_free_together() {
        let pool = PacketPool::new_plain("t3", 4, 0);
        let mut head = pool.alloc(60).unwrap();
        let seg = pool.alloc(40).unwrap();
        head.chain(seg);
        assert_eq!(head.nb_segs(), 2);
        assert_eq!(head.total_len(), 100);
        drop(head);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn prepend_and_adj() {
        let pool = PacketPool::new_plain("t4", 4, 0);
        let mut pkt = pool.alloc(60).unwrap();
        assert_eq!(pkt.headroom(), crate::packet::PKT_HEADROOM);
        assert!(pkt.prepend(14).is_some());
        assert_eq!(pkt.data_len(), 74);
        assert!(pkt.adj(14).is_some());
        assert_eq!(pkt.data_len(), 60);
        // Headroom is finite.
        assert!(pkt.prepend(crate::packet::PKT_HEADROOM + 1).is_none());
    }

    #[test]
    fn external_region_pool() {
        let region = MmapMut::map_anon(16 * PKT_SIZE).unwrap();
        let pool = PacketPool::from_region("ext0", region, 0);
        assert_eq!(pool.capacity(), 16);
        let pkt = pool.alloc(0).unwrap();
        assert_eq!(pkt.data_len(), 0);
        drop(pkt);
        assert_eq!(pool.available(), 16);
    }
}
