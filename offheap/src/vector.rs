use core::mem;

use crate::freelist::LEN_WORD;
use crate::region::{Error, Offset, Plain, Region};
use crate::smallblock;

/// Locator of a growable array of homogeneous elements. `data` points at
/// an allocated block whose length word gives the current capacity in
/// bytes; `len` counts populated elements.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VecHeader {
    pub len: u32,
    pub data: Offset,
}

unsafe impl Plain for VecHeader {}

pub(crate) const VEC_HEADER_SIZE: u32 = mem::size_of::<VecHeader>() as u32;

impl Region {
    fn vec_header(&self, hdr: Offset) -> Option<VecHeader> {
        self.read_at(hdr)
    }

    /// Number of populated elements in the vector at `hdr`.
    #[inline]
    pub fn vec_len(&self, hdr: Offset) -> u32 {
        self.vec_header(hdr).map_or(0, |h| h.len)
    }

    /// Capacity in bytes of the allocated block at `data`, decoding either
    /// length-word variant. A block that cannot be read counts as empty.
    pub(crate) fn block_capacity(&self, data: Offset) -> u32 {
        let Some(word) = data
            .checked_sub(LEN_WORD)
            .and_then(|off| self.read_at::<u32>(off))
        else {
            return 0;
        };
        match smallblock::decode(word) {
            Some(r) => r.size,
            None => word,
        }
    }

    /// Append `v` to the vector at `hdr`, doubling the data block when it
    /// is full. An out-of-memory push leaves the vector unchanged.
    pub fn vec_push<T: Plain>(&mut self, hdr: Offset, v: T) -> Result<(), Error> {
        self.vec_push_in(hdr, v, true)
    }

    pub(crate) fn vec_push_in<T: Plain>(
        &mut self,
        hdr: Offset,
        v: T,
        small_ok: bool,
    ) -> Result<(), Error> {
        let elem = mem::size_of::<T>() as u32;
        let h = self.vec_header(hdr).ok_or(Error::OutOfRange { offset: hdr })?;
        let total = h
            .len
            .checked_mul(elem)
            .ok_or(Error::OutOfRange { offset: hdr })?;
        let mut data = h.data;
        if data == 0 {
            // Empty vector, start with room for two elements.
            data = self.alloc_with(2 * elem, 8, true, small_ok)?;
        } else if total as u64 + elem as u64 > self.block_capacity(data) as u64 {
            // The granted block can be a few bytes larger than requested,
            // so "full" means no room for one more element, not capacity
            // equality.
            let grown = (2 * total as u64).max(2 * elem as u64);
            let grown = u32::try_from(grown).map_err(|_| Error::OutOfMemory {
                requested: u32::MAX,
                available: self.free_bytes(),
            })?;
            data = self.realloc_with(data, grown, 8, true, small_ok)?;
        }
        let slot = data
            .checked_add(total)
            .ok_or(Error::OutOfRange { offset: hdr })?;
        self.write_at(slot, v)?;
        unsafe {
            self.raw_write(
                hdr,
                VecHeader {
                    len: h.len + 1,
                    data,
                },
            )
        };
        Ok(())
    }

    /// Element `index` of the vector at `hdr`, `None` when out of range.
    pub fn vec_get<T: Plain>(&self, hdr: Offset, index: usize) -> Option<T> {
        let h = self.vec_header(hdr)?;
        if index as u64 >= h.len as u64 || h.data == 0 {
            return None;
        }
        let elem = mem::size_of::<T>() as u64;
        let off = u32::try_from(h.data as u64 + index as u64 * elem).ok()?;
        self.read_at(off)
    }

    /// Ensure capacity for at least `n` elements without touching `len`.
    pub fn vec_reserve<T: Plain>(&mut self, hdr: Offset, n: usize) -> Result<(), Error> {
        let elem = mem::size_of::<T>() as u32;
        let h = self.vec_header(hdr).ok_or(Error::OutOfRange { offset: hdr })?;
        let want = u32::try_from(n)
            .ok()
            .and_then(|n| n.checked_mul(elem))
            .ok_or(Error::OutOfMemory {
                requested: u32::MAX,
                available: self.free_bytes(),
            })?;
        if want == 0 {
            return Ok(());
        }
        let data = if h.data == 0 {
            self.alloc_with(want, 8, false, true)?
        } else if self.block_capacity(h.data) < want {
            self.realloc_with(h.data, want, 8, false, true)?
        } else {
            return Ok(());
        };
        unsafe { self.raw_write(hdr, VecHeader { data, ..h }) };
        Ok(())
    }

    /// Grow capacity if needed and set `len` to `n`. New elements are
    /// zeroed.
    pub fn vec_resize<T: Plain>(&mut self, hdr: Offset, n: usize) -> Result<(), Error> {
        let elem = mem::size_of::<T>() as u32;
        let h = self.vec_header(hdr).ok_or(Error::OutOfRange { offset: hdr })?;
        let want = u32::try_from(n)
            .ok()
            .and_then(|n| n.checked_mul(elem))
            .ok_or(Error::OutOfMemory {
                requested: u32::MAX,
                available: self.free_bytes(),
            })?;
        let mut data = h.data;
        if want > 0 {
            if data == 0 {
                data = self.alloc_with(want, 8, true, true)?;
            } else if self.block_capacity(data) < want {
                data = self.realloc_with(data, want, 8, true, true)?;
            }
        }
        unsafe {
            self.raw_write(
                hdr,
                VecHeader {
                    len: n as u32,
                    data,
                },
            )
        };
        Ok(())
    }

    /// Free the data block and reset the header.
    pub fn vec_clear(&mut self, hdr: Offset) {
        let Some(h) = self.vec_header(hdr) else {
            return;
        };
        if h.data != 0 {
            self.free(h.data);
        }
        unsafe { self.raw_write(hdr, VecHeader::default()) };
    }
}
