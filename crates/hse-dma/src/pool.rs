//! # Descriptor Pool
//!
//! Recycled descriptors, guarded by its own lock so that fan-out can return
//! descriptors without taking the channel lock.

use alloc::vec::Vec;
use core::fmt;

use hse_core::{ByteSize, DescriptorHandle, Result};

use crate::descriptor::Descriptor;

/// Pool statistics
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Descriptors created
    pub created: u64,
    /// Descriptors destroyed
    pub freed: u64,
    /// Allocations served from the free list
    pub reused: u64,
    /// Allocations that found the free list empty
    pub grown: u64,
}

impl PoolStats {
    /// Descriptors alive, free or in use
    pub fn live(&self) -> u64 {
        self.created - self.freed
    }
}

/// Free list of descriptors with dynamic growth
pub(crate) struct DescriptorPool {
    /// Free descriptors
    free: Vec<Descriptor>,
    /// Queue size of new descriptors
    compact_size: ByteSize,
    /// Next descriptor id
    next_id: u64,
    /// Statistics
    stats: PoolStats,
}

impl DescriptorPool {
    pub(crate) fn new(compact_size: ByteSize) -> Self {
        Self {
            free: Vec::new(),
            compact_size,
            next_id: 1,
            stats: PoolStats::default(),
        }
    }

    /// Fill the free list with up to `count` descriptors
    ///
    /// Failed allocations are skipped; returns how many were added.
    pub(crate) fn prealloc(&mut self, count: usize) -> usize {
        let mut added = 0;
        for _ in 0..count {
            match self.create() {
                Ok(desc) => {
                    self.free.push(desc);
                    added += 1;
                }
                Err(e) => log::warn!("pool: prealloc descriptor failed: {}", e),
            }
        }
        added
    }

    /// Take a descriptor, creating one if the free list is empty
    pub(crate) fn get(&mut self) -> Result<Descriptor> {
        if let Some(desc) = self.free.pop() {
            self.stats.reused += 1;
            return Ok(desc);
        }
        self.stats.grown += 1;
        log::warn!("pool: empty, growing (live={})", self.stats.live());
        self.create()
    }

    /// Return a descriptor for reuse
    pub(crate) fn put(&mut self, mut desc: Descriptor) {
        desc.recycle();
        self.free.push(desc);
    }

    /// Destroy a descriptor that will not be reused
    pub(crate) fn destroy(&mut self, desc: Descriptor) {
        drop(desc);
        self.stats.freed += 1;
    }

    /// Destroy every free descriptor
    pub(crate) fn drain(&mut self) -> usize {
        let n = self.free.len();
        self.free.clear();
        self.stats.freed += n as u64;
        n
    }

    pub(crate) fn available(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn stats(&self) -> PoolStats {
        self.stats.clone()
    }

    fn create(&mut self) -> Result<Descriptor> {
        let desc = Descriptor::new(DescriptorHandle::new(self.next_id), self.compact_size)?;
        self.next_id += 1;
        self.stats.created += 1;
        Ok(desc)
    }
}

impl fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("available", &self.free.len())
            .field("compact_size", &self.compact_size)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> DescriptorPool {
        DescriptorPool::new(ByteSize::from_bytes(64))
    }

    #[test]
    fn test_prealloc_then_reuse() {
        let mut p = pool();
        assert_eq!(p.prealloc(4), 4);
        assert_eq!(p.available(), 4);

        let d = p.get().unwrap();
        assert_eq!(p.available(), 3);
        p.put(d);
        assert_eq!(p.available(), 4);

        let stats = p.stats();
        assert_eq!(stats.created, 4);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.grown, 0);
    }

    #[test]
    fn test_empty_pool_grows() {
        let mut p = pool();
        let a = p.get().unwrap();
        let b = p.get().unwrap();
        assert_ne!(a.handle, b.handle);
        assert_eq!(p.stats().grown, 2);
        assert_eq!(p.stats().live(), 2);

        p.put(a);
        p.destroy(b);
        assert_eq!(p.stats().live(), 1);
        assert_eq!(p.drain(), 1);
        assert_eq!(p.stats().live(), 0);
    }

    #[test]
    fn test_put_recycles() {
        let mut p = pool();
        let mut d = p.get().unwrap();
        d.queue.append(&[1, 2]).unwrap();
        d.len = 32;
        p.put(d);
        let d = p.get().unwrap();
        assert!(d.queue.is_empty());
        assert_eq!(d.len, 0);
    }
}
