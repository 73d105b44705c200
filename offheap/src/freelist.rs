use alloc::vec::Vec;
use core::mem;

use crate::numeric::align_up;
use crate::region::{Error, Offset, Plain, Region};
use crate::smallblock::{self, MAX_SMALL};

/// Header of a free block, stored at the block's base. `length` includes
/// the header itself; `next` is the offset of the next free block, 0 for
/// end of list. The list is kept in strictly ascending address order.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    pub length: u32,
    pub next: Offset,
}

unsafe impl Plain for FreeBlock {}

pub(crate) const FREE_BLOCK_SIZE: u32 = mem::size_of::<FreeBlock>() as u32;
/// Every allocated block is preceded by a 32-bit length word.
pub(crate) const LEN_WORD: u32 = mem::size_of::<u32>() as u32;

impl Region {
    #[inline]
    pub(crate) fn free_block(&self, off: Offset) -> FreeBlock {
        unsafe { self.raw_read(off) }
    }

    #[inline]
    pub(crate) fn set_free_block(&mut self, off: Offset, b: FreeBlock) {
        unsafe { self.raw_write(off, b) }
    }

    /// Point the predecessor link at `to`. A zero `prev` means the list
    /// head.
    #[inline]
    fn relink(&mut self, prev: Offset, to: Offset) {
        if prev == 0 {
            self.set_free_list(to);
        } else {
            let b = self.free_block(prev);
            self.set_free_block(prev, FreeBlock { next: to, ..b });
        }
    }

    /// Allocate `n` bytes with the default policy: 8-byte size alignment,
    /// zeroed, small-block tier eligible.
    pub fn alloc(&mut self, n: u32) -> Result<Offset, Error> {
        self.alloc_with(n, 8, true, true)
    }

    /// Allocate `n` bytes. `align` rounds the block size, `clear` zeroes
    /// the payload, `small_ok` permits the bitmap tier for requests up to
    /// the largest size class. Returns the payload offset; the 4 bytes
    /// before it hold the length word and must never be overwritten.
    pub fn alloc_with(
        &mut self,
        n: u32,
        align: u32,
        clear: bool,
        small_ok: bool,
    ) -> Result<Offset, Error> {
        if !self.is_valid() {
            return Err(Error::InvalidRegion);
        }
        if n == 0 {
            return Err(Error::OutOfMemory {
                requested: 0,
                available: self.free_bytes(),
            });
        }
        if small_ok && self.small_blocks_enabled() && n <= MAX_SMALL {
            return self.alloc_small(n, clear);
        }
        self.alloc_large(n, align, clear)
    }

    pub(crate) fn alloc_large(&mut self, n: u32, align: u32, clear: bool) -> Result<Offset, Error> {
        // A block below 4 payload bytes could not hold a free-block header
        // once freed.
        let n = align_up(n, align).max(LEN_WORD);
        let full = n.checked_add(LEN_WORD).ok_or(Error::OutOfMemory {
            requested: n,
            available: self.free_bytes(),
        })?;
        loop {
            if let Some((prev, block)) = self.find_fit(full) {
                let granted = self.carve(block, prev, n, full);
                unsafe { self.raw_write::<u32>(block, granted) };
                let payload = block + LEN_WORD;
                if clear {
                    self.zero(payload, granted);
                }
                return Ok(payload);
            }
            self.grow(full)?;
        }
    }

    /// First-fit walk. Returns the predecessor (0 for head) and the first
    /// block large enough to hold `full` bytes.
    fn find_fit(&self, full: u32) -> Option<(Offset, Offset)> {
        let mut prev = 0;
        let mut cur = self.free_list();
        while cur != 0 {
            let blk = self.free_block(cur);
            if blk.length >= full {
                return Some((prev, cur));
            }
            prev = cur;
            cur = blk.next;
        }
        None
    }

    /// Take the start of the free block at `block`. When the remainder can
    /// hold a free-block header it stays on the list; otherwise the whole
    /// block is taken and the granted payload size grows to cover it.
    fn carve(&mut self, block: Offset, prev: Offset, n: u32, full: u32) -> u32 {
        let blk = self.free_block(block);
        let rem = blk.length - full;
        if rem >= FREE_BLOCK_SIZE {
            let residual = block + full;
            self.set_free_block(
                residual,
                FreeBlock {
                    length: rem,
                    next: blk.next,
                },
            );
            self.relink(prev, residual);
            self.bump_hwm(residual + FREE_BLOCK_SIZE);
            n
        } else {
            self.relink(prev, blk.next);
            self.bump_hwm(block + blk.length);
            blk.length - LEN_WORD
        }
    }

    /// Grow a moveable region so that a block of `required` bytes fits.
    /// Relocates the bytes through the resizer, rewrites the base in place
    /// and splices the new tail into the free list.
    fn grow(&mut self, required: u32) -> Result<(), Error> {
        let Some(resizer) = self.resizer_ptr() else {
            return Err(Error::OutOfMemory {
                requested: required,
                available: self.free_bytes(),
            });
        };
        let old_size = self.full_size();
        let needed = old_size.checked_add(required).ok_or(Error::OutOfMemory {
            requested: required,
            available: self.free_bytes(),
        })?;
        let new_size = old_size.saturating_mul(2).max(needed);

        #[cfg(feature = "tracing")]
        tracing::debug!(old_size, new_size, "growing region");

        // The resizer produces a byte-exact copy of the first old_size
        // bytes in a buffer of new_size bytes; the old base is dead after
        // this call.
        let new_base = unsafe { (*resizer)(self.base_ptr(), old_size as usize, new_size as usize) };
        self.set_base(new_base);
        self.set_full_size(new_size);
        self.splice_tail(old_size, new_size);
        Ok(())
    }

    /// Link `[old_size, new_size)` into the free list. When the last free
    /// block ends exactly at `old_size` it is extended, otherwise a new
    /// tail block is appended.
    fn splice_tail(&mut self, old_size: u32, new_size: u32) {
        let mut prev = 0;
        let mut cur = self.free_list();
        while cur != 0 {
            prev = cur;
            cur = self.free_block(cur).next;
        }
        if prev != 0 {
            let last = self.free_block(prev);
            if prev + last.length == old_size {
                self.set_free_block(
                    prev,
                    FreeBlock {
                        length: last.length + (new_size - old_size),
                        next: 0,
                    },
                );
                return;
            }
        }
        self.set_free_block(
            old_size,
            FreeBlock {
                length: new_size - old_size,
                next: 0,
            },
        );
        self.relink(prev, old_size);
    }

    /// Return the block at `payload` to the allocator. Freeing the null
    /// offset is a no-op. The length word preceding the payload selects
    /// between the free list and the bitmap tier.
    pub fn free(&mut self, payload: Offset) {
        if payload == 0 || !self.is_valid() {
            return;
        }
        if payload < self.arena_base() + LEN_WORD || payload >= self.full_size() {
            return;
        }
        let word: u32 = unsafe { self.raw_read(payload - LEN_WORD) };
        if let Some(small) = smallblock::decode(word) {
            self.free_small(small);
            return;
        }

        let block = payload - LEN_WORD;
        let Some(freed_len) = word.checked_add(LEN_WORD) else {
            return;
        };
        match block.checked_add(freed_len) {
            Some(end) if end <= self.full_size() => {}
            _ => return,
        }
        let (prev, succ) = self.find_insert_pos(block);
        let merged = if succ != 0 && block + freed_len == succ {
            // Coalesce with the adjacent block above.
            let up = self.free_block(succ);
            FreeBlock {
                length: freed_len + up.length,
                next: up.next,
            }
        } else {
            FreeBlock {
                length: freed_len,
                next: succ,
            }
        };
        self.set_free_block(block, merged);
        self.relink(prev, block);
        if prev != 0 {
            self.merge_down(prev, block);
        }
    }

    /// Find the insertion point for a block at `block`: the last free block
    /// below it (0 for none) and the first above it (0 for none).
    fn find_insert_pos(&self, block: Offset) -> (Offset, Offset) {
        let mut prev = 0;
        let mut cur = self.free_list();
        while cur != 0 && cur < block {
            prev = cur;
            cur = self.free_block(cur).next;
        }
        (prev, cur)
    }

    /// Coalesce `block` into `prev` when the two are contiguous.
    fn merge_down(&mut self, prev: Offset, block: Offset) {
        let pb = self.free_block(prev);
        if prev + pb.length == block {
            let b = self.free_block(block);
            self.set_free_block(
                prev,
                FreeBlock {
                    length: pb.length + b.length,
                    next: b.next,
                },
            );
        }
    }

    /// Resize the block at `payload` to `n` bytes with the default policy.
    pub fn realloc(&mut self, payload: Offset, n: u32) -> Result<Offset, Error> {
        self.realloc_with(payload, n, 8, true, true)
    }

    /// Resize the block at `payload` to `n` bytes. Grows in place into an
    /// adjacent free block when possible, otherwise moves the payload.
    /// Reallocating the null offset allocates.
    pub fn realloc_with(
        &mut self,
        payload: Offset,
        n: u32,
        align: u32,
        clear: bool,
        small_ok: bool,
    ) -> Result<Offset, Error> {
        if payload == 0 {
            return self.alloc_with(n, align, clear, small_ok);
        }
        if !self.is_valid() {
            return Err(Error::InvalidRegion);
        }
        if payload < self.arena_base() + LEN_WORD || payload >= self.full_size() {
            return Err(Error::OutOfRange { offset: payload });
        }
        let word: u32 = unsafe { self.raw_read(payload - LEN_WORD) };
        if let Some(small) = smallblock::decode(word) {
            return self.realloc_small(payload, small, n, align, clear, small_ok);
        }
        let orig = word;
        if payload as u64 + orig as u64 > self.full_size() as u64 {
            return Err(Error::OutOfRange { offset: payload });
        }
        let n = align_up(n, 8);
        if n == orig {
            return Ok(payload);
        }
        if n < orig {
            self.shrink_block(payload, orig, n);
            return Ok(payload);
        }

        let diff = n - orig;
        let block = payload - LEN_WORD;
        let mut prev_prev = 0;
        let mut prev = 0;
        let mut cur = self.free_list();
        while cur != 0 && cur < block {
            prev_prev = prev;
            prev = cur;
            cur = self.free_block(cur).next;
        }

        // Free block adjacent above with room for the growth and a
        // residual header: expand in place.
        if cur != 0 && payload + orig == cur {
            let fb = self.free_block(cur);
            if fb.length >= diff + FREE_BLOCK_SIZE {
                let residual = cur + diff;
                self.set_free_block(
                    residual,
                    FreeBlock {
                        length: fb.length - diff,
                        next: fb.next,
                    },
                );
                self.relink(prev, residual);
                unsafe { self.raw_write::<u32>(block, n) };
                self.bump_hwm(residual + FREE_BLOCK_SIZE);
                if clear {
                    self.zero(payload + orig, diff);
                }
                return Ok(payload);
            }
        }

        // Free block adjacent below with enough room: move the payload
        // down into the combined span.
        if prev != 0 && prev + self.free_block(prev).length == block {
            let pb = self.free_block(prev);
            if pb.length >= diff {
                let residual = pb.length - diff;
                let new_payload = prev + LEN_WORD;
                unsafe {
                    core::ptr::copy(
                        self.base_ptr().as_ptr().add(payload as usize),
                        self.base_ptr().as_ptr().add(new_payload as usize),
                        orig as usize,
                    );
                }
                if residual >= FREE_BLOCK_SIZE {
                    let tail = prev + LEN_WORD + n;
                    // The tail ends where the old block ended; when a free
                    // block sits right there, fold it in to keep free
                    // blocks non-adjacent.
                    let (length, next) = if pb.next != 0 && tail + residual == pb.next {
                        let up = self.free_block(pb.next);
                        (residual + up.length, up.next)
                    } else {
                        (residual, pb.next)
                    };
                    unsafe { self.raw_write::<u32>(prev, n) };
                    self.set_free_block(tail, FreeBlock { length, next });
                    self.relink(prev_prev, tail);
                    if clear {
                        self.zero(new_payload + orig, n - orig);
                    }
                    self.bump_hwm(tail + FREE_BLOCK_SIZE);
                } else {
                    // Residual too small for a header, absorb the whole
                    // lower block into the allocation.
                    let granted = pb.length + orig;
                    unsafe { self.raw_write::<u32>(prev, granted) };
                    self.relink(prev_prev, pb.next);
                    if clear {
                        self.zero(new_payload + orig, granted - orig);
                    }
                }
                return Ok(new_payload);
            }
        }

        // No adjacent room: allocate elsewhere, copy, free the old block.
        let newp = self.alloc_with(n, align, false, small_ok)?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.base_ptr().as_ptr().add(payload as usize),
                self.base_ptr().as_ptr().add(newp as usize),
                orig as usize,
            );
        }
        if clear {
            self.zero(newp + orig, n - orig);
        }
        self.free(payload);
        Ok(newp)
    }

    /// Trim the block at `payload` from `orig` to `new_len` bytes. When the
    /// tail cannot hold a free-block header the block keeps its size.
    fn shrink_block(&mut self, payload: Offset, orig: u32, new_len: u32) {
        let rem = orig - new_len;
        if rem >= FREE_BLOCK_SIZE {
            unsafe { self.raw_write::<u32>(payload - LEN_WORD, new_len) };
            let tail_payload = payload + new_len + LEN_WORD;
            unsafe { self.raw_write::<u32>(tail_payload - LEN_WORD, rem - LEN_WORD) };
            self.free(tail_payload);
        }
    }

    /// Allocate `count` individually freeable blocks of `size` bytes each.
    /// On failure every block granted so far is freed again.
    pub fn alloc_many(
        &mut self,
        size: u32,
        count: u32,
        align: u32,
        clear: bool,
    ) -> Result<Vec<Offset>, Error> {
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match self.alloc_with(size, align, clear, true) {
                Ok(off) => out.push(off),
                Err(e) => {
                    for off in out {
                        self.free(off);
                    }
                    return Err(e);
                }
            }
        }
        Ok(out)
    }

    /// Iterate the free list in address order.
    pub fn free_blocks(&self) -> FreeBlocks<'_> {
        FreeBlocks {
            region: self,
            cur: self.free_list(),
        }
    }

    /// Total free bytes on the free list.
    pub fn free_bytes(&self) -> u32 {
        self.free_blocks().map(|(_, b)| b.length).sum()
    }

    /// Walk the free list and check its structural invariants: in-bounds
    /// blocks, strictly ascending addresses, no two adjacent blocks.
    pub fn verify_free_list(&self) -> Result<(), Error> {
        let mut prev: Option<(Offset, FreeBlock)> = None;
        let mut cur = self.free_list();
        while cur != 0 {
            let b = self
                .read_at::<FreeBlock>(cur)
                .ok_or(Error::OutOfRange { offset: cur })?;
            if cur < self.arena_base() || b.length < FREE_BLOCK_SIZE {
                return Err(Error::InvalidRegion);
            }
            match cur.checked_add(b.length) {
                Some(end) if end <= self.full_size() => {}
                _ => return Err(Error::OutOfRange { offset: cur }),
            }
            if let Some((poff, pb)) = prev {
                if cur <= poff || poff + pb.length == cur {
                    return Err(Error::InvalidRegion);
                }
            }
            prev = Some((cur, b));
            cur = b.next;
        }
        Ok(())
    }
}

/// Iterator over `(offset, header)` pairs of the free list. Stops early if
/// the chain leaves bounds or stops ascending, so it terminates even on a
/// corrupted list.
pub struct FreeBlocks<'a> {
    region: &'a Region,
    cur: Offset,
}

impl Iterator for FreeBlocks<'_> {
    type Item = (Offset, FreeBlock);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur == 0 {
            return None;
        }
        let off = self.cur;
        let b = self.region.read_at::<FreeBlock>(off)?;
        self.cur = if b.next > off { b.next } else { 0 };
        Some((off, b))
    }
}
