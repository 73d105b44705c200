use alloc::alloc::{alloc as host_alloc, dealloc as host_dealloc, realloc as host_realloc};
use alloc::alloc::{handle_alloc_error, Layout};
use alloc::boxed::Box;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use crate::region::{Error, Region, RegionOptions, HEADER_SIZE};

/// Growth callback of a moveable region. Receives the current base, the
/// current size and the requested size; produces a buffer of the new size
/// whose leading `old_size` bytes are a byte-exact copy of the region,
/// releases the old buffer as appropriate and returns the new base. It does
/// not touch the allocator structures inside the region.
pub type ResizerFn = dyn FnMut(NonNull<u8>, usize, usize) -> NonNull<u8>;

/// Boxed resizer, stored on the host heap. The region keeps only a thin
/// pointer to it in the slot after the header, because a callable living in
/// the moved bytes would invalidate itself during the move.
pub type Resizer = Box<ResizerFn>;

/// Backing buffers are allocated with this alignment, which also aligns the
/// header.
pub(crate) const REGION_ALIGN: usize = 8;

/// The default resizer: reallocates the backing buffer on the host heap.
pub fn heap_resizer() -> Resizer {
    Box::new(|base, old_size, new_size| {
        let layout = region_layout(old_size as u32);
        // The region owns this buffer and old_size is its live layout.
        let p = unsafe { host_realloc(base.as_ptr(), layout, new_size) };
        match NonNull::new(p) {
            Some(p) => p,
            None => handle_alloc_error(region_layout(new_size as u32)),
        }
    })
}

fn region_layout(size: u32) -> Layout {
    // size is non-zero and far below the isize::MAX bound.
    Layout::from_size_align(size as usize, REGION_ALIGN).expect("region layout")
}

impl Region {
    pub(crate) fn resizer_ptr(&self) -> Option<*mut Resizer> {
        if !self.is_moveable() {
            return None;
        }
        let raw: usize = unsafe { self.raw_read(HEADER_SIZE) };
        if raw == 0 {
            return None;
        }
        Some(raw as *mut Resizer)
    }

    pub(crate) fn set_resizer(&mut self, r: Resizer) {
        let handle: *mut Resizer = Box::into_raw(Box::new(r));
        unsafe { self.raw_write(HEADER_SIZE, handle as usize) };
    }

    /// Release the resizer handle of a moveable region and null its slot.
    ///
    /// Dropping an [`OwnedRegion`] does this automatically. Callers that
    /// construct moveable regions over their own memory through
    /// [`Region::init_moveable`] or [`Region::attach`] must call it before
    /// discarding the region, or the boxed resizer leaks.
    ///
    /// # Safety
    /// The slot must hold a handle installed by this crate that no other
    /// region handle will release. After the call the region can no longer
    /// grow.
    pub unsafe fn release_resizer(&mut self) {
        if let Some(handle) = self.resizer_ptr() {
            drop(unsafe { Box::from_raw(handle) });
            unsafe { self.raw_write::<usize>(HEADER_SIZE, 0) };
        }
    }
}

/// A region plus ownership of its backing buffer on the host heap.
///
/// Dropping releases the resizer handle and the buffer. This is the safe
/// entry point; [`Region::init_fixed`] and friends exist for callers that
/// bring their own memory.
pub struct OwnedRegion {
    region: Region,
}

impl OwnedRegion {
    /// A fixed region of `size` bytes. Allocation failure inside it is
    /// terminal.
    pub fn new_fixed(size: u32) -> Result<Self, Error> {
        Self::fixed_with(size, RegionOptions::default())
    }

    pub fn fixed_with(size: u32, opts: RegionOptions) -> Result<Self, Error> {
        let base = host_buffer(size)?;
        match unsafe { Region::init_fixed(base, size, opts) } {
            Ok(region) => Ok(Self { region }),
            Err(e) => {
                unsafe { host_dealloc(base.as_ptr(), region_layout(size)) };
                Err(e)
            }
        }
    }

    /// A moveable region of `initial_size` bytes that doubles through the
    /// host heap on exhaustion.
    pub fn new_moveable(initial_size: u32) -> Result<Self, Error> {
        Self::moveable_with(initial_size, RegionOptions::default())
    }

    pub fn moveable_with(initial_size: u32, opts: RegionOptions) -> Result<Self, Error> {
        // The default resizer keeps the buffer on the host heap, which is
        // what `Drop` assumes.
        unsafe { Self::with_resizer(initial_size, opts, heap_resizer()) }
    }

    /// A moveable region with a caller-provided resizer.
    ///
    /// # Safety
    /// The resizer must uphold the [`ResizerFn`] contract and must keep the
    /// buffer allocated on the host heap with [`REGION_ALIGN`] alignment,
    /// since dropping the `OwnedRegion` deallocates it there.
    pub unsafe fn with_resizer(
        initial_size: u32,
        opts: RegionOptions,
        resizer: Resizer,
    ) -> Result<Self, Error> {
        let base = host_buffer(initial_size)?;
        match unsafe { Region::init_moveable(base, initial_size, resizer, opts) } {
            Ok(region) => Ok(Self { region }),
            Err(e) => {
                unsafe { host_dealloc(base.as_ptr(), region_layout(initial_size)) };
                Err(e)
            }
        }
    }
}

fn host_buffer(size: u32) -> Result<NonNull<u8>, Error> {
    if size == 0 {
        return Err(Error::OutOfMemory {
            requested: 0,
            available: 0,
        });
    }
    let layout = region_layout(size);
    let p = unsafe { host_alloc(layout) };
    match NonNull::new(p) {
        Some(p) => Ok(p),
        None => handle_alloc_error(layout),
    }
}

impl Deref for OwnedRegion {
    type Target = Region;

    #[inline]
    fn deref(&self) -> &Region {
        &self.region
    }
}

impl DerefMut for OwnedRegion {
    #[inline]
    fn deref_mut(&mut self) -> &mut Region {
        &mut self.region
    }
}

impl core::fmt::Debug for OwnedRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(&self.region, f)
    }
}

impl Drop for OwnedRegion {
    fn drop(&mut self) {
        let size = self.region.full_size();
        unsafe {
            self.region.release_resizer();
            host_dealloc(self.region.base_ptr().as_ptr(), region_layout(size));
        }
    }
}
