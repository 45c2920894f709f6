//! # Command Encoder
//!
//! Encode block operations into engine command words.
//!
//! [`encode`] produces the words of exactly one hardware command (at most
//! [`MAX_COMMAND_WORDS`]). [`encode_into`] appends a whole operation to a
//! queue and applies chip workarounds that need more than one command, such
//! as splitting misaligned copies on first-generation copy engines.
//!
//! Addresses above 4 GiB are carried in 4-bit high-address fields, either in
//! a trailing extension word (copy, fill, XOR) or in the first word (format
//! conversion, rotate).

use arrayvec::ArrayVec;
use bitflags::bitflags;
use hse_core::{DmaAddr, Error, Result};
use hse_hal::Quirks;

use crate::queue::CommandQueue;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Longest single command: XOR with five sources plus extension word
pub const MAX_COMMAND_WORDS: usize = 9;

/// Most XOR sources
pub const MAX_XOR_SOURCES: usize = 5;

/// Largest chunk of a split misaligned copy
pub const COPY_SIZE_MAX: u32 = 518_144;

/// Words of one encoded command
pub type CommandWords = ArrayVec<u32, MAX_COMMAND_WORDS>;

mod opcode {
    pub const COPY: u32 = 0x1;
    pub const YUY2_TO_NV16: u32 = 0x2;
    pub const ROTATE: u32 = 0x5;

    /// High-address extension word follows
    pub const EXT: u32 = 1 << 31;
    /// Copy: byte swap enable
    pub const SWAP_EN: u32 = 1 << 8;
    /// Copy: swap order field
    pub const SWAP_OPT_SHIFT: u32 = 9;
    /// Copy: two-dimensional
    pub const PICTURE: u32 = 1 << 14;
    /// Copy: fill with a constant
    pub const CONSTANT_FILL: u32 = 1 << 19;
    /// XOR: source count minus one
    pub const XOR_SRC_SHIFT: u32 = 16;
}

// =============================================================================
// FLAGS AND MODES
// =============================================================================

bitflags! {
    /// Copy options
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CopyFlags: u32 {
        /// Swap order selector (see [`CopyFlags::swap`])
        const SWAP_OPT_MASK = 0x1f;
        /// Enable byte swapping
        const SWAP_EN = 0x20;
    }
}

impl CopyFlags {
    /// Enable swapping with one of the 24 ARGB channel orders
    pub fn swap(order: u8) -> Result<Self> {
        if order >= 24 {
            return Err(Error::InvalidParameter);
        }
        Ok(Self::SWAP_EN | Self::from_bits_retain(order as u32))
    }

    fn swap_bits(self) -> u32 {
        if self.contains(Self::SWAP_EN) {
            opcode::SWAP_EN | ((self.bits() & Self::SWAP_OPT_MASK.bits()) << opcode::SWAP_OPT_SHIFT)
        } else {
            0
        }
    }
}

/// Rotation angle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RotateMode {
    /// 90 degrees
    Deg90 = 0,
    /// 180 degrees
    Deg180 = 1,
    /// 270 degrees
    Deg270 = 2,
}

/// Plane being rotated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RotatePlane {
    /// Luma
    Y = 0,
    /// Interleaved chroma
    CbCr = 1,
}

// =============================================================================
// OPERATIONS
// =============================================================================

/// A block operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Linear copy
    Copy {
        /// Destination
        dst: DmaAddr,
        /// Source
        src: DmaAddr,
        /// Bytes
        len: u32,
        /// Swap options
        flags: CopyFlags,
    },
    /// Two-dimensional copy
    PictureCopy {
        /// Destination
        dst: DmaAddr,
        /// Destination pitch in bytes
        dst_pitch: u16,
        /// Source
        src: DmaAddr,
        /// Source pitch in bytes
        src_pitch: u16,
        /// Width in bytes
        width: u16,
        /// Height in lines
        height: u16,
        /// Swap options
        flags: CopyFlags,
    },
    /// Fill with a 32-bit value
    ConstantFill {
        /// Destination
        dst: DmaAddr,
        /// Fill value
        value: u32,
        /// Bytes
        len: u32,
    },
    /// XOR of two to five sources
    Xor {
        /// Destination
        dst: DmaAddr,
        /// Sources
        srcs: ArrayVec<DmaAddr, MAX_XOR_SOURCES>,
        /// Bytes
        len: u32,
    },
    /// Packed YUY2 to semi-planar NV16
    Yuy2ToNv16 {
        /// Luma destination
        luma: DmaAddr,
        /// Chroma destination
        chroma: DmaAddr,
        /// Destination pitch in bytes
        dst_pitch: u16,
        /// Source
        src: DmaAddr,
        /// Source pitch in bytes
        src_pitch: u16,
        /// Width in pixels
        width: u16,
        /// Height in lines
        height: u16,
    },
    /// Plane rotation
    Rotate {
        /// Destination
        dst: DmaAddr,
        /// Destination pitch in bytes
        dst_pitch: u32,
        /// Source
        src: DmaAddr,
        /// Source pitch in bytes
        src_pitch: u32,
        /// Width in pixels
        width: u16,
        /// Height in lines
        height: u16,
        /// Angle
        mode: RotateMode,
        /// Plane
        plane: RotatePlane,
        /// 10-bit samples
        ten_bit: bool,
    },
}

impl Operation {
    /// XOR from a slice of sources
    pub fn xor(dst: DmaAddr, srcs: &[DmaAddr], len: u32) -> Result<Self> {
        let srcs = ArrayVec::try_from(srcs).map_err(|_| Error::InvalidParameter)?;
        Ok(Self::Xor { dst, srcs, len })
    }

    /// Bytes written to the destination
    pub fn byte_len(&self) -> u32 {
        match self {
            Self::Copy { len, .. } | Self::ConstantFill { len, .. } | Self::Xor { len, .. } => *len,
            Self::PictureCopy { width, height, .. } => u32::from(*width) * u32::from(*height),
            Self::Yuy2ToNv16 { width, height, .. } => u32::from(*width) * u32::from(*height) * 2,
            Self::Rotate { dst_pitch, height, .. } => dst_pitch.saturating_mul(u32::from(*height)),
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Copy { .. } => "copy",
            Self::PictureCopy { .. } => "picture-copy",
            Self::ConstantFill { .. } => "constant-fill",
            Self::Xor { .. } => "xor",
            Self::Yuy2ToNv16 { .. } => "yuy2-to-nv16",
            Self::Rotate { .. } => "rotate",
        }
    }
}

// =============================================================================
// ENCODING
// =============================================================================

/// Misaligned copies must be split on first-generation copy engines
#[inline]
pub fn needs_copy_workaround(quirks: Quirks) -> bool {
    !quirks.contains(Quirks::XOR_COPY_V2)
}

/// High-address bits of `addr`, checked against what the chip can address
fn addr_msb(addr: DmaAddr, quirks: Quirks) -> Result<u32> {
    let msb = addr.hi32();
    let limit = if quirks.contains(Quirks::SUPPORT_32GB_RAM) { 0xF } else { 0 };
    if msb > limit {
        log::error!("encoder: address {} beyond reach", addr);
        return Err(Error::InvalidParameter);
    }
    Ok(msb)
}

#[inline]
fn aligned(v: u64, a: u64) -> bool {
    v % a == 0
}

fn words<const N: usize>(w: [u32; N]) -> CommandWords {
    w.into_iter().collect()
}

fn copy_command(
    dst: DmaAddr,
    src: DmaAddr,
    len: u32,
    flags: CopyFlags,
    quirks: Quirks,
) -> Result<CommandWords> {
    let mut cmd = words([opcode::COPY | flags.swap_bits(), len, dst.lo32(), src.lo32()]);
    let ext = addr_msb(dst, quirks)? | (addr_msb(src, quirks)? << 4);
    if ext != 0 {
        cmd[0] |= opcode::EXT;
        cmd.push(ext);
    }
    Ok(cmd)
}

/// Encode one hardware command
///
/// Validates arguments and chip capabilities. Copies are encoded as a single
/// command; splitting is left to [`encode_into`].
pub fn encode(op: &Operation, quirks: Quirks) -> Result<CommandWords> {
    match op {
        Operation::Copy { dst, src, len, flags } => {
            if *len == 0 {
                return Err(Error::InvalidParameter);
            }
            copy_command(*dst, *src, *len, *flags, quirks)
        }

        Operation::PictureCopy {
            dst,
            dst_pitch,
            src,
            src_pitch,
            width,
            height,
            flags,
        } => {
            let valid = aligned(dst.raw(), 4)
                && aligned(*dst_pitch as u64, 4)
                && aligned(src.raw(), 4)
                && aligned(*src_pitch as u64, 4)
                && aligned(*width as u64, 4)
                && dst_pitch >= width
                && src_pitch >= width;
            if !valid {
                return Err(Error::InvalidParameter);
            }

            let mut cmd = words([
                opcode::COPY | flags.swap_bits() | opcode::PICTURE,
                *height as u32 | ((*width as u32) << 16),
                dst.lo32(),
                src.lo32(),
                *dst_pitch as u32 | ((*src_pitch as u32) << 16),
            ]);
            let ext = addr_msb(*dst, quirks)? | (addr_msb(*src, quirks)? << 4);
            if ext != 0 {
                cmd[0] |= opcode::EXT;
                cmd.push(ext);
            }
            Ok(cmd)
        }

        Operation::ConstantFill { dst, value, len } => {
            if needs_copy_workaround(quirks) {
                return Err(Error::NotSupported);
            }
            if *len == 0 {
                return Err(Error::InvalidParameter);
            }

            let mut cmd = words([opcode::COPY | opcode::CONSTANT_FILL, *len, dst.lo32(), *value]);
            let ext = addr_msb(*dst, quirks)?;
            if ext != 0 {
                cmd[0] |= opcode::EXT;
                cmd.push(ext);
            }
            Ok(cmd)
        }

        Operation::Xor { dst, srcs, len } => {
            if needs_copy_workaround(quirks) {
                return Err(Error::NotSupported);
            }
            if srcs.len() < 2 || *len == 0 {
                return Err(Error::InvalidParameter);
            }

            let mut cmd = words([
                opcode::COPY | ((srcs.len() as u32 - 1) << opcode::XOR_SRC_SHIFT),
                *len,
                dst.lo32(),
            ]);
            let mut ext = addr_msb(*dst, quirks)?;
            for (i, src) in srcs.iter().enumerate() {
                cmd.push(src.lo32());
                ext |= addr_msb(*src, quirks)? << ((i as u32 + 1) * 4);
            }
            if ext != 0 {
                cmd[0] |= opcode::EXT;
                cmd.push(ext);
            }
            Ok(cmd)
        }

        Operation::Yuy2ToNv16 {
            luma,
            chroma,
            dst_pitch,
            src,
            src_pitch,
            width,
            height,
        } => {
            // Source is two bytes per pixel
            let valid = aligned(luma.raw(), 2)
                && aligned(chroma.raw(), 2)
                && aligned(*dst_pitch as u64, 2)
                && dst_pitch >= width
                && aligned(src.raw(), 4)
                && aligned(*src_pitch as u64, 4)
                && (*src_pitch as u32) >= (*width as u32) * 2
                && aligned(*width as u64, 2);
            if !valid {
                return Err(Error::InvalidParameter);
            }

            let hi = (addr_msb(*luma, quirks)? << 16)
                | (addr_msb(*src, quirks)? << 20)
                | (addr_msb(*chroma, quirks)? << 24);
            Ok(words([
                opcode::YUY2_TO_NV16 | hi,
                *height as u32 | ((*width as u32) << 16),
                *dst_pitch as u32 | ((*src_pitch as u32) << 16),
                luma.lo32(),
                chroma.lo32(),
                src.lo32(),
            ]))
        }

        Operation::Rotate {
            dst,
            dst_pitch,
            src,
            src_pitch,
            width,
            height,
            mode,
            plane,
            ten_bit,
        } => {
            if *ten_bit && !quirks.contains(Quirks::SUPPORT_ROTATE_10BIT) {
                return Err(Error::NotSupported);
            }

            let hi = (addr_msb(*dst, quirks)? << 12) | (addr_msb(*src, quirks)? << 16);
            Ok(words([
                opcode::ROTATE
                    | ((*ten_bit as u32) << 8)
                    | ((*mode as u32) << 29)
                    | ((*plane as u32) << 31)
                    | hi,
                *height as u32 | ((*width as u32) << 16),
                (*dst_pitch & 0xffff) | (*src_pitch << 16),
                dst.lo32(),
                src.lo32(),
            ]))
        }
    }
}

/// Append a whole operation to `queue`
///
/// On first-generation copy engines a copy whose source, destination or
/// length is not 16-byte aligned is split into aligned pieces (see
/// [`CopySegments`]); such copies take no swap options.
pub fn encode_into(queue: &mut CommandQueue, op: &Operation, quirks: Quirks) -> Result<()> {
    match op {
        Operation::Copy { dst, src, len, flags } if needs_copy_workaround(quirks) => {
            if !flags.is_empty() {
                return Err(Error::InvalidParameter);
            }
            if *len == 0 {
                return Err(Error::InvalidParameter);
            }
            for (d, s, n) in CopySegments::new(*dst, *src, *len) {
                queue.append(&copy_command(d, s, n, CopyFlags::empty(), quirks)?)?;
            }
            Ok(())
        }
        _ => queue.append(&encode(op, quirks)?),
    }
}

// =============================================================================
// COPY SPLITTING
// =============================================================================

/// Pieces of a copy on an engine that mishandles misaligned transfers
///
/// Aligned copies pass through whole. A misaligned copy is cut into
/// [`COPY_SIZE_MAX`] chunks; what remains (if longer than 16 bytes) becomes a
/// head copy of `len & !(n - 1)` bytes and an overlapping tail copy of the
/// last `n` bytes, with `n` 16, 32 or 2048 depending on the remainder.
#[derive(Debug, Clone)]
pub struct CopySegments {
    dst: DmaAddr,
    src: DmaAddr,
    remaining: u32,
    misaligned: bool,
    tail: Option<(DmaAddr, DmaAddr, u32)>,
}

impl CopySegments {
    /// Plan a copy
    pub fn new(dst: DmaAddr, src: DmaAddr, len: u32) -> Self {
        let misaligned = !dst.is_aligned(16) || !src.is_aligned(16) || len % 16 != 0;
        Self {
            dst,
            src,
            remaining: len,
            misaligned,
            tail: None,
        }
    }

    fn split_unit(len: u32) -> u32 {
        if len <= 0x20 {
            0x10
        } else if len <= 0x800 {
            0x20
        } else {
            0x800
        }
    }
}

impl Iterator for CopySegments {
    /// (destination, source, length)
    type Item = (DmaAddr, DmaAddr, u32);

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(tail) = self.tail.take() {
            return Some(tail);
        }
        if self.remaining == 0 {
            return None;
        }

        if self.misaligned && self.remaining > COPY_SIZE_MAX {
            let chunk = (self.dst, self.src, COPY_SIZE_MAX);
            self.dst = self.dst + COPY_SIZE_MAX as u64;
            self.src = self.src + COPY_SIZE_MAX as u64;
            self.remaining -= COPY_SIZE_MAX;
            return Some(chunk);
        }

        let len = core::mem::take(&mut self.remaining);
        if self.misaligned && len > 16 {
            let n = Self::split_unit(len);
            let back = (len - n) as u64;
            self.tail = Some((self.dst + back, self.src + back, n));
            return Some((self.dst, self.src, len & !(n - 1)));
        }
        Some((self.dst, self.src, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use hse_core::ByteSize;
    use hse_hal::{DmaAllocator, SystemDmaAllocator};

    fn a(v: u64) -> DmaAddr {
        DmaAddr::new(v)
    }

    #[test]
    fn test_copy_words() {
        let cmd = encode(
            &Operation::Copy { dst: a(0x1000), src: a(0x2000), len: 64, flags: CopyFlags::empty() },
            Quirks::empty(),
        )
        .unwrap();
        assert_eq!(cmd.as_slice(), &[0x1, 64, 0x1000, 0x2000]);
    }

    #[test]
    fn test_copy_swap_and_extension() {
        let flags = CopyFlags::swap(5).unwrap();
        let cmd = encode(
            &Operation::Copy { dst: a(0x2_0000_1000), src: a(0x3_0000_2000), len: 64, flags },
            Quirks::SUPPORT_32GB_RAM,
        )
        .unwrap();
        assert_eq!(cmd[0], 0x1 | (1 << 8) | (5 << 9) | (1 << 31));
        assert_eq!(cmd[4], 0x2 | (0x3 << 4));
        assert_eq!(cmd.len(), 5);
        assert_eq!(CopyFlags::swap(24), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_high_address_needs_quirk() {
        let op = Operation::Copy { dst: a(0x1_0000_0000), src: a(0), len: 16, flags: CopyFlags::empty() };
        assert_eq!(encode(&op, Quirks::empty()), Err(Error::InvalidParameter));
        assert!(encode(&op, Quirks::SUPPORT_32GB_RAM).is_ok());
    }

    #[test]
    fn test_fill_and_xor_need_v2() {
        let fill = Operation::ConstantFill { dst: a(0x100), value: 0xdead_beef, len: 32 };
        assert_eq!(encode(&fill, Quirks::empty()), Err(Error::NotSupported));
        let cmd = encode(&fill, Quirks::XOR_COPY_V2).unwrap();
        assert_eq!(cmd.as_slice(), &[0x1 | (1 << 19), 32, 0x100, 0xdead_beef]);

        let xor = Operation::xor(a(0x100), &[a(0x200), a(0x300), a(0x400)], 64).unwrap();
        assert_eq!(encode(&xor, Quirks::empty()), Err(Error::NotSupported));
        let cmd = encode(&xor, Quirks::XOR_COPY_V2).unwrap();
        assert_eq!(cmd.as_slice(), &[0x1 | (2 << 16), 64, 0x100, 0x200, 0x300, 0x400]);
    }

    #[test]
    fn test_xor_source_count() {
        let one = Operation::xor(a(0), &[a(0x10)], 16).unwrap();
        assert_eq!(encode(&one, Quirks::XOR_COPY_V2), Err(Error::InvalidParameter));
        assert!(Operation::xor(a(0), &[a(0x10); 6], 16).is_err());

        let five = Operation::xor(a(0x1_0000_0000), &[a(0x1_0000_0000); 5], 16).unwrap();
        let quirks = Quirks::XOR_COPY_V2 | Quirks::SUPPORT_32GB_RAM;
        let cmd = encode(&five, quirks).unwrap();
        assert_eq!(cmd.len(), MAX_COMMAND_WORDS);
        assert_eq!(cmd[8], 0x11_1111);
    }

    #[test]
    fn test_picture_copy_validation() {
        let mut op = Operation::PictureCopy {
            dst: a(0x1000),
            dst_pitch: 256,
            src: a(0x2000),
            src_pitch: 256,
            width: 128,
            height: 4,
            flags: CopyFlags::empty(),
        };
        let cmd = encode(&op, Quirks::empty()).unwrap();
        assert_eq!(cmd[0], 0x1 | (1 << 14));
        assert_eq!(cmd[1], 4 | (128 << 16));
        assert_eq!(cmd[4], 256 | (256 << 16));

        if let Operation::PictureCopy { width, .. } = &mut op {
            *width = 512;
        }
        assert_eq!(encode(&op, Quirks::empty()), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_rotate_ten_bit() {
        let op = Operation::Rotate {
            dst: a(0x1000),
            dst_pitch: 64,
            src: a(0x2000),
            src_pitch: 128,
            width: 32,
            height: 16,
            mode: RotateMode::Deg270,
            plane: RotatePlane::CbCr,
            ten_bit: true,
        };
        assert_eq!(encode(&op, Quirks::empty()), Err(Error::NotSupported));
        let cmd = encode(&op, Quirks::SUPPORT_ROTATE_10BIT).unwrap();
        assert_eq!(cmd[0], 0x5 | (1 << 8) | (2 << 29) | (1 << 31));
        assert_eq!(cmd[2], 64 | (128 << 16));
    }

    #[test]
    fn test_yuy2_to_nv16() {
        let op = Operation::Yuy2ToNv16 {
            luma: a(0x1000),
            chroma: a(0x2000),
            dst_pitch: 64,
            src: a(0x3000),
            src_pitch: 128,
            width: 64,
            height: 8,
        };
        let cmd = encode(&op, Quirks::empty()).unwrap();
        assert_eq!(cmd.as_slice(), &[0x2, 8 | (64 << 16), 64 | (128 << 16), 0x1000, 0x2000, 0x3000]);
    }

    #[test]
    fn test_aligned_copy_is_one_segment() {
        let segs: Vec<_> = CopySegments::new(a(0x1000), a(0x2000), 0x10_0000).collect();
        assert_eq!(segs, [(a(0x1000), a(0x2000), 0x10_0000)]);
    }

    #[test]
    fn test_misaligned_copy_split() {
        let segs: Vec<_> = CopySegments::new(a(0x1001), a(0x2000), 100).collect();
        assert_eq!(
            segs,
            [
                (a(0x1001), a(0x2000), 96),
                (a(0x1001 + 68), a(0x2000 + 68), 32),
            ]
        );

        let segs: Vec<_> = CopySegments::new(a(0x1000), a(0x2000), 10).collect();
        assert_eq!(segs, [(a(0x1000), a(0x2000), 10)]);
    }

    #[test]
    fn test_misaligned_copy_large_chunks() {
        let len = COPY_SIZE_MAX * 2 + 3000;
        let segs: Vec<_> = CopySegments::new(a(0x3), a(0x5), len).collect();
        assert_eq!(segs.len(), 4);
        assert_eq!(segs[0].2, COPY_SIZE_MAX);
        assert_eq!(segs[1], (a(0x3 + COPY_SIZE_MAX as u64), a(0x5 + COPY_SIZE_MAX as u64), COPY_SIZE_MAX));
        assert_eq!(segs[2].2, 3000 & !0x7ff);
        assert_eq!(segs[3].2, 0x800);
        let end = segs[3].0.raw() + segs[3].2 as u64;
        assert_eq!(end, 0x3 + len as u64);
    }

    #[test]
    fn test_encode_into_applies_workaround() {
        let dma: Arc<dyn DmaAllocator> = Arc::new(SystemDmaAllocator::new());
        let mut q = CommandQueue::normal(&dma).unwrap();
        let op = Operation::Copy { dst: a(0x1001), src: a(0x2000), len: 100, flags: CopyFlags::empty() };

        encode_into(&mut q, &op, Quirks::empty()).unwrap();
        assert_eq!(q.words().len(), 8);

        q.reset();
        encode_into(&mut q, &op, Quirks::XOR_COPY_V2).unwrap();
        assert_eq!(q.words(), &[0x1, 100, 0x1001, 0x2000]);

        let swapped = Operation::Copy {
            dst: a(0x1001),
            src: a(0x2000),
            len: 100,
            flags: CopyFlags::swap(1).unwrap(),
        };
        assert_eq!(encode_into(&mut q, &swapped, Quirks::empty()), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_encode_into_compact_full() {
        let mut q = CommandQueue::compact(ByteSize::from_bytes(32)).unwrap();
        let op = Operation::Copy { dst: a(0x1000), src: a(0x2000), len: 64, flags: CopyFlags::empty() };
        assert!(encode_into(&mut q, &op, Quirks::empty()).is_ok());
        assert_eq!(encode_into(&mut q, &op, Quirks::empty()), Err(Error::QueueFull));
    }
}
