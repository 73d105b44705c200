use crate::freelist::LEN_WORD;
use crate::region::{Error, Offset, Region};

// A string cell is a 32-bit little-endian length followed by the raw bytes,
// with the enclosing block padded to 4 bytes. A string header is a single
// offset slot holding the cell's offset, 0 while unset.

impl Region {
    /// Store `s` in the cell addressed by the header slot at `hdr`,
    /// reallocating a previous cell in place where possible. Returns the
    /// cell offset. On failure the header keeps its prior value.
    pub fn set_string(&mut self, hdr: Offset, s: &[u8]) -> Result<Offset, Error> {
        let len = u32::try_from(s.len()).map_err(|_| Error::OutOfMemory {
            requested: u32::MAX,
            available: self.free_bytes(),
        })?;
        let cell = self.string_cell(hdr, len, false)?;
        self.bytes_mut(cell + LEN_WORD, len)
            .ok_or(Error::OutOfRange { offset: cell })?
            .copy_from_slice(s);
        Ok(cell)
    }

    /// Size a cell for `len` bytes and return its payload for direct
    /// fill-in, without copying anything.
    pub fn alloc_string(
        &mut self,
        hdr: Offset,
        len: u32,
        clear: bool,
    ) -> Result<&mut [u8], Error> {
        let cell = self.string_cell(hdr, len, clear)?;
        self.bytes_mut(cell + LEN_WORD, len)
            .ok_or(Error::OutOfRange { offset: cell })
    }

    /// Allocate or reallocate the cell behind `hdr` for `len` bytes, write
    /// the length prefix and rewrite the header slot.
    fn string_cell(&mut self, hdr: Offset, len: u32, clear: bool) -> Result<Offset, Error> {
        let current: Offset = self.read_at(hdr).ok_or(Error::OutOfRange { offset: hdr })?;
        let bytes = len.checked_add(LEN_WORD).ok_or(Error::OutOfMemory {
            requested: len,
            available: self.free_bytes(),
        })?;
        let cell = if current != 0 {
            self.realloc_with(current, bytes, 4, clear, true)?
        } else {
            self.alloc_with(bytes, 4, clear, true)?
        };
        unsafe { self.raw_write(cell, len.to_le()) };
        // The region may have moved; the header slot offset has not.
        unsafe { self.raw_write(hdr, cell) };
        Ok(cell)
    }

    /// View of the string behind the header slot at `hdr`. An unset header
    /// yields `None`.
    pub fn str_view(&self, hdr: Offset) -> Option<&[u8]> {
        let cell: Offset = self.read_at(hdr)?;
        if cell == 0 {
            return None;
        }
        let len = u32::from_le(self.read_at::<u32>(cell)?);
        self.bytes(cell + LEN_WORD, len)
    }

    /// Length of the string behind `hdr`, 0 when unset.
    pub fn str_len(&self, hdr: Offset) -> u32 {
        self.str_view(hdr).map_or(0, |s| s.len() as u32)
    }

    /// Free the cell behind `hdr` and reset the header slot to null.
    pub fn clear_string(&mut self, hdr: Offset) {
        let Some(cell) = self.read_at::<Offset>(hdr) else {
            return;
        };
        if cell != 0 {
            self.free(cell);
            unsafe { self.raw_write::<Offset>(hdr, 0) };
        }
    }
}
