//! # DMA-Coherent Memory
//!
//! Buffers visible to both the CPU and the engine. A [`DmaRegion`] carries
//! the bus address programmed into the engine together with the CPU view of
//! the same memory as 32-bit words.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::mem::ManuallyDrop;
use core::sync::atomic::{AtomicU64, Ordering};

use hse_core::{ByteSize, DmaAddr, Error, Result};

// =============================================================================
// DMA REGION
// =============================================================================

/// DMA-coherent buffer
pub struct DmaRegion {
    /// Bus address of the first word
    phys: DmaAddr,
    /// CPU view
    words: Box<[u32]>,
}

impl DmaRegion {
    /// Wrap memory handed out by an allocator
    pub fn new(phys: DmaAddr, words: Box<[u32]>) -> Self {
        Self { phys, words }
    }

    /// Bus address
    #[inline]
    pub fn phys(&self) -> DmaAddr {
        self.phys
    }

    /// Size in bytes
    #[inline]
    pub fn size(&self) -> ByteSize {
        ByteSize::from_bytes(self.words.len() as u64 * 4)
    }

    /// CPU view
    #[inline]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Mutable CPU view
    #[inline]
    pub fn words_mut(&mut self) -> &mut [u32] {
        &mut self.words
    }
}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("phys", &self.phys)
            .field("size", &self.size())
            .finish()
    }
}

// =============================================================================
// ALLOCATOR TRAIT
// =============================================================================

/// Source of DMA-coherent memory
pub trait DmaAllocator: Send + Sync {
    /// Allocate a zeroed buffer of `size` bytes (rounded up to whole words)
    fn alloc_coherent(&self, size: ByteSize) -> Result<DmaRegion>;

    /// Return a buffer
    fn free_coherent(&self, region: DmaRegion);

    /// Make the first `len` bytes of `region` visible to the device
    fn sync_for_device(&self, region: &DmaRegion, len: usize);
}

// =============================================================================
// OWNED BUFFER
// =============================================================================

/// DMA-coherent buffer that returns itself to its allocator when dropped
pub struct DmaBuffer {
    region: ManuallyDrop<DmaRegion>,
    dma: Arc<dyn DmaAllocator>,
}

impl DmaBuffer {
    /// Allocate `size` bytes from `dma`
    pub fn alloc(dma: &Arc<dyn DmaAllocator>, size: ByteSize) -> Result<Self> {
        let region = dma.alloc_coherent(size)?;
        Ok(Self {
            region: ManuallyDrop::new(region),
            dma: dma.clone(),
        })
    }

    /// Allocate another buffer from the same allocator
    pub fn alloc_sibling(&self, size: ByteSize) -> Result<Self> {
        Self::alloc(&self.dma, size)
    }

    /// Bus address
    #[inline]
    pub fn phys(&self) -> DmaAddr {
        self.region.phys()
    }

    /// Size in bytes
    #[inline]
    pub fn size(&self) -> ByteSize {
        self.region.size()
    }

    /// CPU view
    #[inline]
    pub fn words(&self) -> &[u32] {
        self.region.words()
    }

    /// Mutable CPU view
    #[inline]
    pub fn words_mut(&mut self) -> &mut [u32] {
        self.region.words_mut()
    }

    /// Make the first `len` bytes visible to the device
    pub fn sync_for_device(&self, len: usize) {
        self.dma.sync_for_device(&self.region, len);
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        // SAFETY: region is never touched again after this point
        let region = unsafe { ManuallyDrop::take(&mut self.region) };
        self.dma.free_coherent(region);
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.region, f)
    }
}

// =============================================================================
// SYSTEM ALLOCATOR
// =============================================================================

/// Heap-backed allocator for hosts with identity-mapped, coherent DMA
///
/// The bus address is the CPU address of the buffer. An optional byte limit
/// makes allocation failures reproducible.
#[derive(Debug, Default)]
pub struct SystemDmaAllocator {
    /// Maximum bytes outstanding (0 = unlimited)
    limit: u64,
    /// Bytes currently allocated
    in_use: AtomicU64,
    /// Allocations performed
    allocs: AtomicU64,
    /// Frees performed
    frees: AtomicU64,
    /// Device syncs performed
    syncs: AtomicU64,
}

impl SystemDmaAllocator {
    /// Unlimited allocator
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator that fails once `limit` bytes are outstanding
    pub fn with_limit(limit: ByteSize) -> Self {
        Self {
            limit: limit.as_bytes(),
            ..Self::default()
        }
    }

    /// Bytes currently allocated
    pub fn in_use(&self) -> ByteSize {
        ByteSize::from_bytes(self.in_use.load(Ordering::Relaxed))
    }

    /// Allocations not yet freed
    pub fn outstanding(&self) -> u64 {
        self.allocs.load(Ordering::Relaxed) - self.frees.load(Ordering::Relaxed)
    }

    /// Number of device syncs
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }
}

impl DmaAllocator for SystemDmaAllocator {
    fn alloc_coherent(&self, size: ByteSize) -> Result<DmaRegion> {
        let bytes = size.align_up(4).as_bytes();
        if self.limit != 0 && self.in_use.load(Ordering::Relaxed) + bytes > self.limit {
            log::warn!("dma: allocation of {} refused, limit reached", size);
            return Err(Error::OutOfMemory);
        }

        let count = (bytes / 4) as usize;
        let mut words = Vec::new();
        words
            .try_reserve_exact(count)
            .map_err(|_| Error::OutOfMemory)?;
        words.resize(count, 0u32);
        let words = words.into_boxed_slice();

        self.in_use.fetch_add(bytes, Ordering::Relaxed);
        self.allocs.fetch_add(1, Ordering::Relaxed);

        let phys = DmaAddr::new(words.as_ptr() as u64);
        Ok(DmaRegion::new(phys, words))
    }

    fn free_coherent(&self, region: DmaRegion) {
        self.in_use
            .fetch_sub(region.size().as_bytes(), Ordering::Relaxed);
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    fn sync_for_device(&self, _region: &DmaRegion, _len: usize) {
        core::sync::atomic::fence(Ordering::Release);
        self.syncs.fetch_add(1, Ordering::Relaxed);
    }
}
