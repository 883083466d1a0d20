//! A batch of up to 32 packets, processed together through the graph.

use arrayvec::ArrayVec;

use crate::packet::Packet;

/// Maximum number of packets a module sees in one call.
pub const MAX_BURST: usize = 32;

#[derive(Default)]
pub struct PacketBatch {
    pkts: ArrayVec<Packet, MAX_BURST>,
}

impl PacketBatch {
    pub fn new() -> PacketBatch {
        PacketBatch {
            pkts: ArrayVec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pkts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pkts.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.pkts.is_full()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        MAX_BURST - self.pkts.len()
    }

    #[inline]
    pub fn push(&mut self, pkt: Packet) {
        self.pkts.push(pkt);
    }

    #[inline]
    pub fn pop(&mut self) -> Option<Packet> {
        self.pkts.pop()
    }

    /// Remove the packet at `idx`, preserving the order of the rest.
    pub fn remove(&mut self, idx: usize) -> Packet {
        self.pkts.remove(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.pkts.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Packet> {
        self.pkts.iter_mut()
    }

    pub fn get(&self, idx: usize) -> Option<&Packet> {
        self.pkts.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Packet> {
        self.pkts.get_mut(idx)
    }

    /// Move every packet out of `self` into `other`, in order. `other` must
    /// have room.
    pub fn transfer_to(&mut self, other: &mut PacketBatch) {
        for pkt in self.pkts.drain(..) {
            other.push(pkt);
        }
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Packet> + '_ {
        self.pkts.drain(..)
    }

    /// Sum of total_len over all packets, in bits. Used for task accounting.
    pub fn total_bits(&self) -> u64 {
        self.pkts.iter().map(|p| p.total_len() as u64 * 8).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PacketPool;

    #[test]
    fn batch_capacity_is_burst() {
        let pool = PacketPool::new_plain("b0", 64, 0);
        let mut batch = PacketBatch::new();
        for _ in 0..MAX_BURST {
            batch.push(pool.alloc(60).unwrap());
        }
        assert!(batch.is_full());
        assert_eq!(batch.remaining(), 0);
        assert_eq!(batch.total_bits(), (MAX_BURST * 60 * 8) as u64);
    }

    #[test]
    fn drop_returns_packets() {
        let pool = PacketPool::new_plain("b1", 8, 0);
        {
            let mut batch = PacketBatch::new();
            for _ in 0..4 {
                batch.push(pool.alloc(60).unwrap());
            }
        }
        assert_eq!(pool.available(), 8);
    }
}
