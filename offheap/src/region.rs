use core::fmt;
use core::mem;
use core::ptr::NonNull;

use crate::freelist::{FreeBlock, FREE_BLOCK_SIZE};
use crate::smallblock::NUM_SIZE_CLASSES;

/// Position of a byte inside a region. Offset 0 is the canonical null and
/// never addresses payload data.
pub type Offset = u32;

pub(crate) const MAGIC_FIXED: u32 = 0xe5f6_f1c4;
pub(crate) const MAGIC_MOVEABLE: u32 = 0xc5f6_f1c4;
/// Low magic bit, set when the small-block tier is enabled.
pub(crate) const MAGIC_SMALL: u32 = 0x1;
const MAGIC_KIND_MASK: u32 = !MAGIC_SMALL;

/// Region header. Lives at offset 0 of every region, all fields host-endian.
#[repr(C)]
pub(crate) struct Header {
    pub magic: u32,
    /// Offset of the main message payload, 0 if unset.
    pub message: Offset,
    /// High-water mark, one past the highest offset the allocator has written.
    pub hwm: u32,
    /// Total region size in bytes.
    pub full_size: u32,
    /// Offset of the first free block, 0 if the arena is exhausted.
    pub free_list: Offset,
    /// Offset of the metadata blob, 0 if unset.
    pub metadata: Offset,
    /// Per size class, offset of the vector of bitmap-run offsets.
    pub bitmaps: [Offset; NUM_SIZE_CLASSES],
}

pub(crate) const HEADER_SIZE: u32 = mem::size_of::<Header>() as u32;
/// A moveable region reserves one machine word after the header for the
/// resizer handle. The handle points at heap memory outside the region; a
/// callable stored in the moved bytes would invalidate itself on relocation.
pub(crate) const RESIZER_SLOT_SIZE: u32 = mem::size_of::<usize>() as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The request cannot be satisfied, even after growing.
    OutOfMemory { requested: u32, available: u32 },
    /// The header magic is unrecognised. No recovery path.
    InvalidRegion,
    /// An offset or span falls outside `[0, full_size)`.
    OutOfRange { offset: Offset },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "allocation failed: requested {} bytes, {} free",
                requested, available
            ),
            Self::InvalidRegion => write!(f, "region magic is unrecognised"),
            Self::OutOfRange { offset } => write!(f, "offset {} is out of range", offset),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Marker for types that can be stored in region memory by plain byte copy.
///
/// # Safety
/// Every bit pattern of the underlying bytes must be a valid value, and the
/// type must not own or borrow anything outside the copied bytes.
pub unsafe trait Plain: Copy {}

unsafe impl Plain for u8 {}
unsafe impl Plain for u16 {}
unsafe impl Plain for u32 {}
unsafe impl Plain for u64 {}
unsafe impl Plain for i8 {}
unsafe impl Plain for i16 {}
unsafe impl Plain for i32 {}
unsafe impl Plain for i64 {}
unsafe impl Plain for f32 {}
unsafe impl Plain for f64 {}

/// Region construction options.
#[derive(Debug, Clone, Copy)]
pub struct RegionOptions {
    pub(crate) small_blocks: bool,
}

impl Default for RegionOptions {
    fn default() -> Self {
        Self { small_blocks: true }
    }
}

impl RegionOptions {
    pub const fn new() -> Self {
        Self { small_blocks: true }
    }

    /// Enable or disable the small-block bitmap tier.
    pub const fn with_small_blocks(self, enabled: bool) -> Self {
        Self {
            small_blocks: enabled,
        }
    }
}

/// Handle to a region of payload memory.
///
/// The handle is the unique mutator of its region. Any method taking
/// `&mut self` may relocate the underlying bytes and rewrite the base in
/// place; offsets stay valid across relocation, byte views do not outlive
/// the borrow that produced them.
pub struct Region {
    base: NonNull<u8>,
}

impl Region {
    /// Initialize a fixed-size region over caller-provided memory.
    ///
    /// # Safety
    /// `base` must be valid for reads and writes of `size` bytes, at least
    /// 8-aligned, and must not be mutated through any other path while the
    /// returned handle is live.
    pub unsafe fn init_fixed(
        base: NonNull<u8>,
        size: u32,
        opts: RegionOptions,
    ) -> Result<Region, Error> {
        unsafe { Self::init(base, size, MAGIC_FIXED, opts) }
    }

    /// Initialize a moveable region over caller-provided memory, installing
    /// `resizer` as its growth callback.
    ///
    /// # Safety
    /// Same as [`Region::init_fixed`]; additionally the memory must be
    /// reallocatable by `resizer`, and the resizer handle must be released
    /// exactly once, by dropping an [`crate::OwnedRegion`] or by calling
    /// [`Region::release_resizer`].
    pub unsafe fn init_moveable(
        base: NonNull<u8>,
        size: u32,
        resizer: crate::Resizer,
        opts: RegionOptions,
    ) -> Result<Region, Error> {
        let mut region = unsafe { Self::init(base, size, MAGIC_MOVEABLE, opts)? };
        region.set_resizer(resizer);
        Ok(region)
    }

    unsafe fn init(
        base: NonNull<u8>,
        size: u32,
        kind: u32,
        opts: RegionOptions,
    ) -> Result<Region, Error> {
        let framing = if kind == MAGIC_MOVEABLE {
            HEADER_SIZE + RESIZER_SLOT_SIZE
        } else {
            HEADER_SIZE
        };
        // The buffer must hold the framing plus at least one free block.
        if size < framing + FREE_BLOCK_SIZE {
            return Err(Error::OutOfMemory {
                requested: framing + FREE_BLOCK_SIZE,
                available: size,
            });
        }
        let mut region = Region { base };
        unsafe {
            let hdr = region.hdr();
            (*hdr).magic = kind | if opts.small_blocks { MAGIC_SMALL } else { 0 };
            (*hdr).message = 0;
            (*hdr).hwm = 0;
            (*hdr).full_size = size;
            (*hdr).free_list = 0;
            (*hdr).metadata = 0;
            (*hdr).bitmaps = [0; NUM_SIZE_CLASSES];
        }
        region.init_free_list();
        Ok(region)
    }

    /// Attach to memory already initialized as a region.
    ///
    /// # Safety
    /// `base` must be at least 8-aligned and valid for reads and writes of
    /// the `full_size` recorded in the header; the handle becomes the unique
    /// mutator of that memory. Attaching to a moveable region takes over
    /// its resizer handle, which must still be released exactly once via
    /// [`Region::release_resizer`] or by the owning [`crate::OwnedRegion`].
    pub unsafe fn attach(base: NonNull<u8>) -> Result<Region, Error> {
        let region = Region { base };
        if !region.is_valid() {
            return Err(Error::InvalidRegion);
        }
        Ok(region)
    }

    #[inline]
    pub(crate) fn hdr(&self) -> *mut Header {
        self.base.as_ptr().cast()
    }

    #[inline]
    pub fn base_ptr(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub(crate) fn set_base(&mut self, base: NonNull<u8>) {
        self.base = base;
    }

    #[inline]
    pub fn magic(&self) -> u32 {
        unsafe { (*self.hdr()).magic }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        let kind = self.magic() & MAGIC_KIND_MASK;
        kind == MAGIC_FIXED || kind == MAGIC_MOVEABLE
    }

    #[inline]
    pub fn is_moveable(&self) -> bool {
        self.magic() & MAGIC_KIND_MASK == MAGIC_MOVEABLE
    }

    #[inline]
    pub fn small_blocks_enabled(&self) -> bool {
        self.is_valid() && self.magic() & MAGIC_SMALL != 0
    }

    #[inline]
    pub fn full_size(&self) -> u32 {
        unsafe { (*self.hdr()).full_size }
    }

    #[inline]
    pub(crate) fn set_full_size(&mut self, size: u32) {
        unsafe { (*self.hdr()).full_size = size }
    }

    /// High-water mark, one past the highest offset the allocator has
    /// touched. Never decreases within a region lifetime.
    #[inline]
    pub fn hwm(&self) -> u32 {
        unsafe { (*self.hdr()).hwm }
    }

    #[inline]
    pub(crate) fn bump_hwm(&mut self, end: u32) {
        unsafe {
            if end > (*self.hdr()).hwm {
                (*self.hdr()).hwm = end;
            }
        }
    }

    #[inline]
    pub(crate) fn free_list(&self) -> Offset {
        unsafe { (*self.hdr()).free_list }
    }

    #[inline]
    pub(crate) fn set_free_list(&mut self, off: Offset) {
        unsafe { (*self.hdr()).free_list = off }
    }

    #[inline]
    pub(crate) fn bitmap_vec(&self, class: usize) -> Offset {
        unsafe { (*self.hdr()).bitmaps[class] }
    }

    #[inline]
    pub(crate) fn set_bitmap_vec(&mut self, class: usize, off: Offset) {
        unsafe { (*self.hdr()).bitmaps[class] = off }
    }

    /// Offset of the first arena byte. Everything below it is framing.
    #[inline]
    pub(crate) fn arena_base(&self) -> u32 {
        if self.is_moveable() {
            HEADER_SIZE + RESIZER_SLOT_SIZE
        } else {
            HEADER_SIZE
        }
    }

    /// Arena size in bytes, excluding header and resizer slot.
    #[inline]
    pub fn arena_size(&self) -> u32 {
        self.full_size() - self.arena_base()
    }

    pub(crate) fn init_free_list(&mut self) {
        let start = self.arena_base();
        let length = self.full_size() - start;
        self.set_free_block(start, FreeBlock { length, next: 0 });
        self.set_free_list(start);
        unsafe { (*self.hdr()).hwm = start }
    }

    /// Translate an offset to an address, validating magic and that
    /// `offset..offset + size` lies inside the region. Null and invalid
    /// offsets translate to `None`.
    #[inline]
    pub fn to_addr(&self, offset: Offset, size: u32) -> Option<NonNull<u8>> {
        if offset == 0 || !self.is_valid() {
            return None;
        }
        let full = self.full_size();
        let end = offset.checked_add(size)?;
        if offset >= full || end > full {
            return None;
        }
        // Offset is in bounds of the region allocation.
        Some(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset as usize)) })
    }

    /// Translate an address back to an offset. Null, the region base and
    /// anything out of range all map to 0.
    #[inline]
    pub fn to_offset(&self, addr: *const u8) -> Offset {
        if addr.is_null() || !self.is_valid() {
            return 0;
        }
        let base = self.base.as_ptr() as usize;
        let addr = addr as usize;
        if addr <= base || addr >= base + self.full_size() as usize {
            return 0;
        }
        (addr - base) as Offset
    }

    /// Unchecked typed read at `off`. The caller guarantees bounds.
    #[inline]
    pub(crate) unsafe fn raw_read<T: Copy>(&self, off: Offset) -> T {
        unsafe { self.base.as_ptr().add(off as usize).cast::<T>().read_unaligned() }
    }

    /// Unchecked typed write at `off`. The caller guarantees bounds.
    #[inline]
    pub(crate) unsafe fn raw_write<T: Copy>(&mut self, off: Offset, v: T) {
        unsafe {
            self.base
                .as_ptr()
                .add(off as usize)
                .cast::<T>()
                .write_unaligned(v)
        }
    }

    #[inline]
    pub(crate) fn zero(&mut self, off: Offset, len: u32) {
        unsafe {
            self.base
                .as_ptr()
                .add(off as usize)
                .write_bytes(0, len as usize)
        }
    }

    /// Bounds-checked typed read at `offset`.
    #[inline]
    pub fn read_at<T: Plain>(&self, offset: Offset) -> Option<T> {
        self.to_addr(offset, mem::size_of::<T>() as u32)?;
        Some(unsafe { self.raw_read(offset) })
    }

    /// Bounds-checked typed write at `offset`.
    #[inline]
    pub fn write_at<T: Plain>(&mut self, offset: Offset, v: T) -> Result<(), Error> {
        self.to_addr(offset, mem::size_of::<T>() as u32)
            .ok_or(Error::OutOfRange { offset })?;
        unsafe { self.raw_write(offset, v) };
        Ok(())
    }

    /// True when the offset slot at `offset` holds a null offset, or cannot
    /// be read at all.
    #[inline]
    pub fn is_null_at(&self, offset: Offset) -> bool {
        self.read_at::<Offset>(offset).map_or(true, |v| v == 0)
    }

    /// Borrow `len` bytes starting at `offset`.
    #[inline]
    pub fn bytes(&self, offset: Offset, len: u32) -> Option<&[u8]> {
        let p = self.to_addr(offset, len)?;
        Some(unsafe { core::slice::from_raw_parts(p.as_ptr(), len as usize) })
    }

    /// Mutably borrow `len` bytes starting at `offset`.
    #[inline]
    pub fn bytes_mut(&mut self, offset: Offset, len: u32) -> Option<&mut [u8]> {
        let p = self.to_addr(offset, len)?;
        Some(unsafe { core::slice::from_raw_parts_mut(p.as_ptr(), len as usize) })
    }

    /// Allocate the main message payload and record its offset in the
    /// header's message slot.
    pub fn alloc_main_message(&mut self, size: u32) -> Result<Offset, Error> {
        let msg = self.alloc_with(size, 8, true, true)?;
        unsafe { (*self.hdr()).message = msg }
        Ok(msg)
    }

    /// Offset of the main message payload, 0 if unset.
    #[inline]
    pub fn message(&self) -> Offset {
        unsafe { (*self.hdr()).message }
    }

    /// Allocate a message payload and store its offset in the slot at
    /// `slot`. The slot must already be allocated region memory.
    pub fn alloc_message_at(&mut self, size: u32, slot: Offset) -> Result<Offset, Error> {
        self.read_at::<Offset>(slot)
            .ok_or(Error::OutOfRange { offset: slot })?;
        let msg = self.alloc_with(size, 8, true, true)?;
        unsafe { self.raw_write(slot, msg) };
        Ok(msg)
    }

    /// Copy a metadata blob into the region and record its offset. An empty
    /// blob clears the slot.
    pub fn set_metadata(&mut self, bytes: &[u8]) -> Result<Offset, Error> {
        if bytes.is_empty() {
            unsafe { (*self.hdr()).metadata = 0 }
            return Ok(0);
        }
        let len = bytes.len() as u32;
        let off = self.alloc_with(len, 1, false, true)?;
        self.bytes_mut(off, len)
            .ok_or(Error::OutOfRange { offset: off })?
            .copy_from_slice(bytes);
        unsafe { (*self.hdr()).metadata = off }
        Ok(off)
    }

    /// Borrow the metadata blob. The returned length is the recorded block
    /// length, which may exceed the stored blob when the allocator handed
    /// out an oversized block.
    pub fn metadata(&self) -> Option<&[u8]> {
        let off = unsafe { (*self.hdr()).metadata };
        if off == 0 {
            return None;
        }
        let len = self.block_capacity(off);
        self.bytes(off, len)
    }

    /// Set presence bit `bit` in the bitmap starting at `offset`.
    pub fn set_presence_bit(&mut self, bit: u32, offset: Offset) -> Result<(), Error> {
        let (woff, mask) = presence_word(bit, offset).ok_or(Error::OutOfRange { offset })?;
        let w = self
            .read_at::<u32>(woff)
            .ok_or(Error::OutOfRange { offset: woff })?;
        unsafe { self.raw_write(woff, w | mask) };
        Ok(())
    }

    /// Clear presence bit `bit` in the bitmap starting at `offset`.
    pub fn clear_presence_bit(&mut self, bit: u32, offset: Offset) -> Result<(), Error> {
        let (woff, mask) = presence_word(bit, offset).ok_or(Error::OutOfRange { offset })?;
        let w = self
            .read_at::<u32>(woff)
            .ok_or(Error::OutOfRange { offset: woff })?;
        unsafe { self.raw_write(woff, w & !mask) };
        Ok(())
    }

    /// Test presence bit `bit` in the bitmap starting at `offset`.
    pub fn presence_bit(&self, bit: u32, offset: Offset) -> Option<bool> {
        let (woff, mask) = presence_word(bit, offset)?;
        Some(self.read_at::<u32>(woff)? & mask != 0)
    }
}

#[inline]
fn presence_word(bit: u32, offset: Offset) -> Option<(Offset, u32)> {
    let woff = offset.checked_add((bit / 32).checked_mul(4)?)?;
    Some((woff, 1 << (bit % 32)))
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return f
                .debug_struct("Region")
                .field("magic", &format_args!("{:#x} (invalid)", self.magic()))
                .finish();
        }
        let kind = if self.is_moveable() { "moveable" } else { "fixed" };
        f.debug_struct("Region")
            .field("kind", &kind)
            .field("small_blocks", &self.small_blocks_enabled())
            .field("hwm", &self.hwm())
            .field("full_size", &self.full_size())
            .field("message", &self.message())
            .field("metadata", &unsafe { (*self.hdr()).metadata })
            .field("free", &FreeListFmt(self))
            .finish()
    }
}

struct FreeListFmt<'a>(&'a Region);

impl fmt::Debug for FreeListFmt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.0.free_blocks().map(|(off, b)| (off, b.length)))
            .finish()
    }
}
