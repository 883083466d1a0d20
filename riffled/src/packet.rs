//! The fixed-layout packet buffer.
//!
//! Every packet is one 2,560-byte, 64-byte-aligned object. The layout is
//! part of the ABI: worker code and port drivers reinterpret the first 128
//! bytes as the underlying driver's message-buffer header, so field offsets
//! below are load-bearing and checked at compile time.
//!
//! Layout (byte offsets):
//!   - 0     128   driver header (buf_addr, data_off, refcnt, lengths, ...)
//!   - 128   64    immutable fields, set once at pool population
//!   - 192   128   metadata attributes, addressed via computed offsets
//!   - 320   64    scratchpad, private to modules/drivers
//!   - 384   128   headroom for header prepends
//!   - 512   2048  packet data
//!
//! A `Packet` handle owns one reference to the underlying buffer. Dropping
//! the handle decrements the refcount and returns the buffer to its pool at
//! zero; `share()` mints another reference for zero-copy fan-out. Handles
//! with a shared buffer must treat the contents as read-only.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, Ordering};

use crate::pool::PoolShared;

pub const PKT_DRIVER_HDR: usize = 128;
pub const PKT_IMMUTABLE: usize = 64;
pub const PKT_METADATA: usize = 128;
pub const PKT_SCRATCHPAD: usize = 64;
pub const PKT_HEADROOM: usize = 128;
pub const PKT_DATA: usize = 2048;

pub const PKT_IMMUTABLE_OFF: usize = PKT_DRIVER_HDR;
pub const PKT_METADATA_OFF: usize = PKT_IMMUTABLE_OFF + PKT_IMMUTABLE;
pub const PKT_SCRATCHPAD_OFF: usize = PKT_METADATA_OFF + PKT_METADATA;
pub const PKT_HEADROOM_OFF: usize = PKT_SCRATCHPAD_OFF + PKT_SCRATCHPAD;
pub const PKT_DATA_OFF: usize = PKT_HEADROOM_OFF + PKT_HEADROOM;
pub const PKT_SIZE: usize = PKT_DATA_OFF + PKT_DATA;

#[repr(C, align(64))]
pub struct PacketData {
    // driver header region, 0..128
    pub(crate) buf_addr: *mut u8,
    pub(crate) buf_phys: u64,
    pub(crate) data_off: u16,
    pub(crate) refcnt: AtomicU16,
    pub(crate) nb_segs: u16,
    _rsvd0: u16,
    _rsvd1: u64,
    _rsvd2: u32,
    pub(crate) pkt_len: u32,
    pub(crate) data_len: u16,
    _rsvd3: [u8; 22],
    pub(crate) next: *mut PacketData,
    pub(crate) pool: *const PoolShared,
    _rsvd4: [u8; 48],

    // immutable region, 128..192
    pub(crate) vaddr: *mut PacketData,
    pub(crate) paddr: u64,
    pub(crate) socket: u32,
    pub(crate) index: u32,
    _rsvd5: [u8; 40],

    // metadata region, 192..320
    pub(crate) metadata: [u8; PKT_METADATA],

    // scratchpad, 320..384
    pub(crate) scratchpad: [u8; PKT_SCRATCHPAD],

    // headroom + data, 384..2560
    pub(crate) headroom: [u8; PKT_HEADROOM],
    pub(crate) data: [u8; PKT_DATA],
}

// ABI checks. A driver that maps this as its own mbuf layout relies on every
// one of these.
const _: () = assert!(std::mem::offset_of!(PacketData, data_off) == 16);
const _: () = assert!(std::mem::offset_of!(PacketData, refcnt) == 18);
const _: () = assert!(std::mem::offset_of!(PacketData, nb_segs) == 20);
const _: () = assert!(std::mem::offset_of!(PacketData, pkt_len) == 36);
const _: () = assert!(std::mem::offset_of!(PacketData, data_len) == 40);
const _: () = assert!(std::mem::offset_of!(PacketData, next) == 64);
const _: () = assert!(std::mem::offset_of!(PacketData, vaddr) == PKT_IMMUTABLE_OFF);
const _: () = assert!(std::mem::offset_of!(PacketData, metadata) == PKT_METADATA_OFF);
const _: () = assert!(std::mem::offset_of!(PacketData, scratchpad) == PKT_SCRATCHPAD_OFF);
const _: () = assert!(std::mem::offset_of!(PacketData, headroom) == PKT_HEADROOM_OFF);
const _: () = assert!(std::mem::offset_of!(PacketData, data) == PKT_DATA_OFF);
const _: () = assert!(std::mem::size_of::<PacketData>() == PKT_SIZE);
const _: () = assert!(std::mem::align_of::<PacketData>() == 64);

/// An owned reference to one packet buffer.
pub struct Packet {
    ptr: NonNull<PacketData>,
}

// SAFETY: the buffer is plain bytes plus an atomic refcount; a handle is an
// exclusive capability that may move between worker threads.
unsafe impl Send for Packet {}

impl Packet {
    /// Wrap a raw buffer pointer. The caller must hold one reference that
    /// this handle takes over.
    ///
    /// # Safety
    /// `ptr` must point to a live, pool-owned `PacketData` whose refcount
    /// includes the reference being transferred.
    pub(crate) unsafe fn from_raw(ptr: NonNull<PacketData>) -> Packet {
        Packet { ptr }
    }

    pub(crate) fn raw(&self) -> *mut PacketData {
        self.ptr.as_ptr()
    }

    /// Forget the handle without touching the refcount, returning the raw
    /// buffer. Used by the pool free path.
    pub(crate) fn into_raw(self) -> *mut PacketData {
        let p = self.ptr.as_ptr();
        std::mem::forget(self);
        p
    }

    #[inline]
    pub fn data_off(&self) -> u16 {
        unsafe { (*self.raw()).data_off }
    }

    #[inline]
    pub fn data_len(&self) -> usize {
        unsafe { (*self.raw()).data_len as usize }
    }

    /// Total length across all segments.
    #[inline]
    pub fn total_len(&self) -> usize {
        unsafe { (*self.raw()).pkt_len as usize }
    }

    #[inline]
    pub fn nb_segs(&self) -> usize {
        unsafe { (*self.raw()).nb_segs as usize }
    }

    #[inline]
    pub fn refcnt(&self) -> u16 {
        unsafe { (*self.raw()).refcnt.load(Ordering::Relaxed) }
    }

    #[inline]
    pub fn socket(&self) -> u32 {
        unsafe { (*self.raw()).socket }
    }

    #[inline]
    pub fn pool_index(&self) -> u32 {
        unsafe { (*self.raw()).index }
    }

    #[inline]
    pub fn paddr(&self) -> u64 {
        unsafe { (*self.raw()).paddr }
    }

    /// Physical address of the first data byte, for DMA-capable pools.
    #[inline]
    pub fn dma_addr(&self) -> u64 {
        unsafe { (*self.raw()).paddr + (*self.raw()).data_off as u64 }
    }

    /// Single segment?
    #[inline]
    pub fn is_linear(&self) -> bool {
        self.nb_segs() == 1
    }

    /// Single segment with exactly one reference — eligible for the
    /// vectorized free path.
    #[inline]
    pub fn is_simple(&self) -> bool {
        self.is_linear() && self.refcnt() == 1
    }

    #[inline]
    pub fn head_data(&self) -> *const u8 {
        unsafe { (self.raw() as *const u8).add((*self.raw()).data_off as usize) }
    }

    #[inline]
    pub fn head_data_mut(&mut self) -> *mut u8 {
        unsafe { (self.raw() as *mut u8).add((*self.raw()).data_off as usize) }
    }

    /// The payload of this segment as a slice.
    pub fn head(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.head_data(), self.data_len()) }
    }

    pub fn head_mut(&mut self) -> &mut [u8] {
        let len = self.data_len();
        unsafe { std::slice::from_raw_parts_mut(self.head_data_mut(), len) }
    }

    pub fn metadata(&self) -> &[u8; PKT_METADATA] {
        unsafe { &(*self.raw()).metadata }
    }

    pub fn metadata_mut(&mut self) -> &mut [u8; PKT_METADATA] {
        unsafe { &mut (*self.raw()).metadata }
    }

    pub fn scratchpad_mut(&mut self) -> &mut [u8; PKT_SCRATCHPAD] {
        unsafe { &mut (*self.raw()).scratchpad }
    }

    /// Read a metadata attribute at the given assigned offset.
    #[inline]
    pub fn read_attr(&self, offset: i8, size: usize) -> Option<&[u8]> {
        if offset < 0 {
            return None;
        }
        let off = offset as usize;
        self.metadata().get(off..off + size)
    }

    /// Write a metadata attribute at the given assigned offset. A sentinel
    /// offset makes this a no-op.
    #[inline]
    pub fn write_attr(&mut self, offset: i8, value: &[u8]) {
        if offset < 0 {
            return;
        }
        let off = offset as usize;
        if let Some(dst) = self.metadata_mut().get_mut(off..off + value.len()) {
            dst.copy_from_slice(value);
        }
    }

    pub fn headroom(&self) -> usize {
        self.data_off() as usize - PKT_HEADROOM_OFF
    }

    pub fn tailroom(&self) -> usize {
        PKT_SIZE - (self.data_off() as usize + self.data_len())
    }

    /// Grow the packet at the front, into the headroom. Returns the new head
    /// pointer, or None if the headroom is exhausted.
    pub fn prepend(&mut self, len: usize) -> Option<*mut u8> {
        unsafe {
            let p = self.raw();
            if ((*p).data_off as usize) < PKT_HEADROOM_OFF + len {
                return None;
            }
            (*p).data_off -= len as u16;
            (*p).data_len += len as u16;
            (*p).pkt_len += len as u32;
        }
        Some(self.head_data_mut())
    }

    /// Remove bytes from the front. Returns the new head pointer, or None if
    /// the segment is shorter than `len`.
    pub fn adj(&mut self, len: usize) -> Option<*mut u8> {
        unsafe {
            let p = self.raw();
            if ((*p).data_len as usize) < len {
                return None;
            }
            (*p).data_off += len as u16;
            (*p).data_len -= len as u16;
            (*p).pkt_len -= len as u32;
        }
        Some(self.head_data_mut())
    }

    /// Grow the packet at the tail. Returns a pointer to the appended
    /// region, or None if the tailroom is exhausted.
    pub fn append(&mut self, len: usize) -> Option<*mut u8> {
        unsafe {
            let p = self.raw();
            let tail = (*p).data_off as usize + (*p).data_len as usize;
            if tail + len > PKT_SIZE {
                return None;
            }
            (*p).data_len += len as u16;
            (*p).pkt_len += len as u32;
            Some((p as *mut u8).add(tail))
        }
    }

    /// Shrink the packet at the tail.
    pub fn trim(&mut self, len: usize) -> bool {
        unsafe {
            let p = self.raw();
            if ((*p).data_len as usize) < len {
                return false;
            }
            (*p).data_len -= len as u16;
            (*p).pkt_len -= len as u32;
        }
        true
    }

    /// Set the length of a fresh single-segment packet.
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= PKT_DATA);
        unsafe {
            let p = self.raw();
            (*p).data_len = len as u16;
            (*p).pkt_len = len as u32;
        }
    }

    /// Chain `seg` after this packet's last segment.
    pub fn chain(&mut self, seg: Packet) {
        unsafe {
            let seg_len = seg.total_len() as u32;
            let seg_segs = seg.nb_segs() as u16;
            let seg_raw = seg.into_raw();
            let mut tail = self.raw();
            while !(*tail).next.is_null() {
                tail = (*tail).next;
            }
            (*tail).next = seg_raw;
            (*self.raw()).nb_segs += seg_segs;
            (*self.raw()).pkt_len += seg_len;
        }
    }

    /// Mint another reference to the same buffer. Contents must be treated
    /// as read-only while shared.
    pub fn share(&self) -> Packet {
        unsafe {
            (*self.raw()).refcnt.fetch_add(1, Ordering::Relaxed);
            Packet::from_raw(self.ptr)
        }
    }

    /// Human-readable summary for the debug endpoint.
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "packet idx={} refcnt={} segs={} data_off={} data_len={} pkt_len={}",
            self.pool_index(),
            self.refcnt(),
            self.nb_segs(),
            self.data_off(),
            self.data_len(),
            self.total_len(),
        );
        for (i, chunk) in self.head().chunks(16).take(8).enumerate() {
            let _ = write!(out, "  {:04x}: ", i * 16);
            for b in chunk {
                let _ = write!(out, "{b:02x} ");
            }
            let _ = writeln!(out);
        }
        out
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        // SAFETY: the handle holds one reference; the pool pointer was set
        // at population time and pools outlive their packets.
        unsafe {
            crate::pool::free_raw(self.ptr.as_ptr());
        }
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("index", &self.pool_index())
            .field("len", &self.total_len())
            .field("refcnt", &self.refcnt())
            .finish()
    }
}
