//! # Imported Buffers
//!
//! Per-session registry of client buffers. Commands name memory as a buffer
//! token plus offset; the registry checks access mode, range and contiguity
//! before handing out a bus address.

use core::fmt;

use bitflags::bitflags;
use hashbrown::HashMap;
use hse_core::{BufferHandle, DmaAddr, Error, Result};

bitflags! {
    /// Access mode of a buffer, or access needed by a command
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u32 {
        /// Engine reads
        const READ = 1 << 0;
        /// Engine writes
        const WRITE = 1 << 1;
        /// Both
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Description of a buffer being imported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    /// Bus address of the first segment
    pub phys: DmaAddr,
    /// Size in bytes
    pub len: u32,
    /// Access mode the buffer was opened with
    pub access: Access,
    /// Number of bus-address segments
    pub segments: u32,
}

impl BufferInfo {
    /// Physically contiguous buffer
    pub const fn contiguous(phys: DmaAddr, len: u32, access: Access) -> Self {
        Self {
            phys,
            len,
            access,
            segments: 1,
        }
    }
}

/// Location inside an imported buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRef {
    /// Buffer token
    pub buffer: BufferHandle,
    /// Byte offset
    pub offset: u32,
}

impl BufferRef {
    /// Reference at `offset` in `buffer`
    pub const fn new(buffer: BufferHandle, offset: u32) -> Self {
        Self { buffer, offset }
    }
}

/// Imported buffers of one session
pub struct BufferRegistry {
    buffers: HashMap<BufferHandle, BufferInfo>,
    next_id: u64,
}

impl BufferRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            next_id: 1,
        }
    }

    /// Register a buffer and return its token
    pub fn import(&mut self, info: BufferInfo) -> Result<BufferHandle> {
        if info.len == 0 || info.segments == 0 || info.access.is_empty() {
            return Err(Error::InvalidParameter);
        }
        let handle = BufferHandle::new(self.next_id);
        self.next_id += 1;
        self.buffers.insert(handle, info);
        log::debug!("buffer {:?}: imported {} bytes at {}", handle, info.len, info.phys);
        Ok(handle)
    }

    /// Forget a buffer
    pub fn release(&mut self, handle: BufferHandle) -> Result<BufferInfo> {
        self.buffers.remove(&handle).ok_or(Error::NotFound)
    }

    /// Look up a buffer without checks
    pub fn get(&self, handle: BufferHandle) -> Option<&BufferInfo> {
        self.buffers.get(&handle)
    }

    /// Bus address of `size` bytes at `at`, if the buffer allows `need`
    pub fn resolve(&self, at: BufferRef, need: Access, size: u32) -> Result<DmaAddr> {
        let Some(buf) = self.buffers.get(&at.buffer) else {
            log::debug!("buffer {:?}: no buffer", at.buffer);
            return Err(Error::NotFound);
        };

        if buf.access != Access::READ_WRITE && buf.access != need {
            log::debug!("buffer {:?}: no permission for {:?}", at.buffer, need);
            return Err(Error::AccessDenied);
        }

        let end = at.offset.checked_add(size).ok_or(Error::Overflow)?;
        if end > buf.len {
            log::debug!("buffer {:?}: {}+{} beyond {}", at.buffer, at.offset, size, buf.len);
            return Err(Error::NoBuffer);
        }

        if buf.segments != 1 {
            log::debug!("buffer {:?}: not contiguous", at.buffer);
            return Err(Error::NotContiguous);
        }

        Ok(buf.phys.offset(u64::from(at.offset)))
    }

    /// Number of imported buffers
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Check for imported buffers
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Drop every buffer, warning about each; returns how many there were
    pub fn release_all(&mut self) -> usize {
        let n = self.buffers.len();
        for (handle, info) in self.buffers.drain() {
            log::warn!("buffer {:?} at {}: not released", handle, info.phys);
        }
        n
    }
}

impl Default for BufferRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BufferRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRegistry")
            .field("buffers", &self.buffers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(info: BufferInfo) -> (BufferRegistry, BufferHandle) {
        let mut r = BufferRegistry::new();
        let h = r.import(info).unwrap();
        (r, h)
    }

    #[test]
    fn test_resolve_offsets_address() {
        let (r, h) = registry_with(BufferInfo::contiguous(DmaAddr::new(0x8000), 4096, Access::READ_WRITE));
        let addr = r.resolve(BufferRef::new(h, 0x100), Access::WRITE, 0x200).unwrap();
        assert_eq!(addr, DmaAddr::new(0x8100));
        // Whole buffer
        assert!(r.resolve(BufferRef::new(h, 0), Access::READ, 4096).is_ok());
    }

    #[test]
    fn test_access_modes() {
        let (r, h) = registry_with(BufferInfo::contiguous(DmaAddr::new(0x8000), 4096, Access::READ));
        assert!(r.resolve(BufferRef::new(h, 0), Access::READ, 16).is_ok());
        assert_eq!(r.resolve(BufferRef::new(h, 0), Access::WRITE, 16), Err(Error::AccessDenied));

        let (r, h) = registry_with(BufferInfo::contiguous(DmaAddr::new(0x8000), 4096, Access::WRITE));
        assert_eq!(r.resolve(BufferRef::new(h, 0), Access::READ, 16), Err(Error::AccessDenied));
    }

    #[test]
    fn test_range_checks() {
        let (r, h) = registry_with(BufferInfo::contiguous(DmaAddr::new(0x8000), 4096, Access::READ_WRITE));
        assert_eq!(r.resolve(BufferRef::new(h, 4000), Access::READ, 100), Err(Error::NoBuffer));
        assert_eq!(
            r.resolve(BufferRef::new(h, u32::MAX), Access::READ, 2),
            Err(Error::Overflow)
        );
    }

    #[test]
    fn test_scattered_buffer_rejected() {
        let info = BufferInfo {
            phys: DmaAddr::new(0x8000),
            len: 8192,
            access: Access::READ_WRITE,
            segments: 2,
        };
        let (r, h) = registry_with(info);
        assert_eq!(r.resolve(BufferRef::new(h, 0), Access::READ, 16), Err(Error::NotContiguous));
    }

    #[test]
    fn test_import_release() {
        let mut r = BufferRegistry::new();
        assert_eq!(
            r.import(BufferInfo::contiguous(DmaAddr::new(0), 0, Access::READ)),
            Err(Error::InvalidParameter)
        );
        let a = r.import(BufferInfo::contiguous(DmaAddr::new(0x1000), 64, Access::READ)).unwrap();
        let b = r.import(BufferInfo::contiguous(DmaAddr::new(0x2000), 64, Access::READ)).unwrap();
        assert_ne!(a, b);
        assert_eq!(r.len(), 2);

        assert_eq!(r.release(a).map(|i| i.phys), Ok(DmaAddr::new(0x1000)));
        assert_eq!(r.release(a), Err(Error::NotFound));
        assert_eq!(r.resolve(BufferRef::new(a, 0), Access::READ, 1), Err(Error::NotFound));

        assert_eq!(r.release_all(), 1);
        assert!(r.is_empty());
    }
}
