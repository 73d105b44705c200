use core::mem;

use crate::freelist::LEN_WORD;
use crate::region::{Error, Offset, Region};
use crate::vector::VEC_HEADER_SIZE;

// Fragmentation and walk cost of the free list are dominated by small
// allocations, so requests up to the largest class are served from bitmap
// runs of fixed-size slots instead. Each run is one free-list block holding
// a header plus `num` slots of `size + 4` bytes; the spare 4 bytes in front
// of every slot carry the encoded length word.

pub(crate) const NUM_SIZE_CLASSES: usize = 4;
pub(crate) const SIZE_CLASSES: [u32; NUM_SIZE_CLASSES] = [16, 32, 64, 128];
pub(crate) const RUN_SLOTS: [u32; NUM_SIZE_CLASSES] = [20, 10, 6, 2];
pub(crate) const MAX_SMALL: u32 = SIZE_CLASSES[NUM_SIZE_CLASSES - 1];

/// Header of one run. The slot memory follows immediately.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct BitMapRun {
    /// One bit per slot, set while the slot is occupied.
    pub bits: u32,
    /// Slot payload size in bytes.
    pub size: u8,
    /// Number of slots in the run.
    pub num: u8,
    /// Number of unoccupied slots.
    pub free: u8,
}

pub(crate) const RUN_HEADER_SIZE: u32 = mem::size_of::<BitMapRun>() as u32;

// A small block's length word has the top bit set, which a free-list length
// can never have since sizes are bounded by the region size. The rest of
// the word locates the slot without any search:
//   bits 30..26  bit number within the run bitmap
//   bits 25..8   index into the class's run vector
//   bits  7..0   logical (requested) block size
const SMALL_FLAG: u32 = 1 << 31;
const BIT_NUM_SHIFT: u32 = 26;
const BIT_NUM_MASK: u32 = 0x1f;
const RUN_INDEX_SHIFT: u32 = 8;
pub(crate) const RUN_INDEX_MASK: u32 = 0x3ffff;
const SIZE_MASK: u32 = 0xff;

/// Decoded form of a small-block length word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SmallRef {
    pub bit: u32,
    pub run: u32,
    pub size: u32,
}

pub(crate) const fn encode(r: SmallRef) -> u32 {
    SMALL_FLAG
        | (r.bit & BIT_NUM_MASK) << BIT_NUM_SHIFT
        | (r.run & RUN_INDEX_MASK) << RUN_INDEX_SHIFT
        | (r.size & SIZE_MASK)
}

pub(crate) const fn decode(word: u32) -> Option<SmallRef> {
    if word & SMALL_FLAG == 0 {
        return None;
    }
    Some(SmallRef {
        bit: (word >> BIT_NUM_SHIFT) & BIT_NUM_MASK,
        run: (word >> RUN_INDEX_SHIFT) & RUN_INDEX_MASK,
        size: word & SIZE_MASK,
    })
}

/// The smallest class whose slot size covers `n`, if any.
pub(crate) const fn class_index(n: u32) -> Option<usize> {
    let mut i = 0;
    while i < NUM_SIZE_CLASSES {
        if n <= SIZE_CLASSES[i] {
            return Some(i);
        }
        i += 1;
    }
    None
}

impl Region {
    #[inline]
    fn run_header(&self, run_off: Offset) -> BitMapRun {
        unsafe { self.raw_read(run_off) }
    }

    #[inline]
    fn set_run_header(&mut self, run_off: Offset, run: BitMapRun) {
        unsafe { self.raw_write(run_off, run) }
    }

    /// Serve a request of `n <= MAX_SMALL` bytes from the bitmap tier.
    pub(crate) fn alloc_small(&mut self, n: u32, clear: bool) -> Result<Offset, Error> {
        let Some(class) = class_index(n) else {
            return self.alloc_large(n, 8, clear);
        };
        let vec = self.run_vector(class)?;

        // Newest runs are the most likely to have capacity.
        let len = self.vec_len(vec);
        for i in (0..len).rev() {
            let Some(run_off) = self.vec_get::<Offset>(vec, i as usize) else {
                continue;
            };
            if self.run_header(run_off).free > 0 {
                return Ok(self.take_slot(run_off, i, n, clear));
            }
        }

        let run_off = self.new_run(class, vec)?;
        let index = self.vec_len(vec) - 1;
        Ok(self.take_slot(run_off, index, n, clear))
    }

    /// The run vector for `class`, created on first use.
    fn run_vector(&mut self, class: usize) -> Result<Offset, Error> {
        let off = self.bitmap_vec(class);
        if off != 0 {
            return Ok(off);
        }
        let off = self.alloc_large(VEC_HEADER_SIZE, 8, true)?;
        self.set_bitmap_vec(class, off);
        Ok(off)
    }

    /// Allocate a fresh run for `class` and append it to the class vector.
    /// The run memory comes from the general allocator with the small path
    /// disabled, so the tier cannot recurse into itself.
    fn new_run(&mut self, class: usize, vec: Offset) -> Result<Offset, Error> {
        let size = SIZE_CLASSES[class];
        let num = RUN_SLOTS[class];
        let bytes = RUN_HEADER_SIZE + num * (size + LEN_WORD);
        if self.vec_len(vec) > RUN_INDEX_MASK {
            return Err(Error::OutOfMemory {
                requested: bytes,
                available: self.free_bytes(),
            });
        }
        let run_off = self.alloc_large(bytes, 8, true)?;
        self.set_run_header(
            run_off,
            BitMapRun {
                bits: 0,
                size: size as u8,
                num: num as u8,
                free: num as u8,
            },
        );
        if let Err(e) = self.vec_push_in::<Offset>(vec, run_off, false) {
            self.free(run_off);
            return Err(e);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(class, run_off, "new small-block run");

        Ok(run_off)
    }

    /// Take the lowest clear bit of a run known to have capacity.
    fn take_slot(&mut self, run_off: Offset, run_index: u32, n: u32, clear: bool) -> Offset {
        let mut run = self.run_header(run_off);
        let mut bit = 0;
        while bit < run.num as u32 && run.bits & (1 << bit) != 0 {
            bit += 1;
        }
        debug_assert!(bit < run.num as u32);
        run.bits |= 1 << bit;
        run.free -= 1;
        let slot = run_off + RUN_HEADER_SIZE + bit * (run.size as u32 + LEN_WORD);
        self.set_run_header(run_off, run);
        unsafe {
            self.raw_write(
                slot,
                encode(SmallRef {
                    bit,
                    run: run_index,
                    size: n,
                }),
            )
        };
        let payload = slot + LEN_WORD;
        if clear {
            self.zero(payload, n);
        }
        payload
    }

    /// Release a small block. O(1): the decoded length word names the run
    /// and bit directly, no search.
    pub(crate) fn free_small(&mut self, r: SmallRef) {
        let Some(class) = class_index(r.size) else {
            return;
        };
        let vec = self.bitmap_vec(class);
        if vec == 0 {
            return;
        }
        let Some(run_off) = self.vec_get::<Offset>(vec, r.run as usize) else {
            return;
        };
        if self.to_addr(run_off, RUN_HEADER_SIZE).is_none() {
            return;
        }
        let mut run = self.run_header(run_off);
        if run.bits & (1 << r.bit) == 0 {
            return;
        }
        run.bits &= !(1 << r.bit);
        run.free += 1;
        self.set_run_header(run_off, run);
    }

    /// Resize a small block. While the request stays in the slot's own
    /// class only the recorded logical size changes; otherwise the payload
    /// moves out.
    pub(crate) fn realloc_small(
        &mut self,
        payload: Offset,
        r: SmallRef,
        n: u32,
        align: u32,
        clear: bool,
        small_ok: bool,
    ) -> Result<Offset, Error> {
        if let Some(class) = class_index(r.size) {
            // The length word has no class field; free recovers the class
            // from the logical size. A resident resize must therefore keep
            // the request in the slot's own class. Shrinking across a
            // class boundary moves out just like growth.
            let resident = n > 0
                && class_index(n) == Some(class)
                && small_ok
                && self.small_blocks_enabled()
                && self.to_addr(payload, SIZE_CLASSES[class]).is_some();
            if resident {
                let slot = payload - LEN_WORD;
                unsafe { self.raw_write(slot, encode(SmallRef { size: n, ..r })) };
                if clear && n > r.size {
                    self.zero(payload + r.size, n - r.size);
                }
                return Ok(payload);
            }
        }

        let newp = self.alloc_with(n, align, false, small_ok)?;
        let keep = r.size.min(n).min(self.full_size().saturating_sub(payload));
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.base_ptr().as_ptr().add(payload as usize),
                self.base_ptr().as_ptr().add(newp as usize),
                keep as usize,
            );
        }
        if clear && n > keep {
            self.zero(newp + keep, n - keep);
        }
        self.free(payload);
        Ok(newp)
    }

    /// Pre-allocate one empty run for the class covering `size`, so the
    /// first allocation in that class pays no growth cost.
    pub fn prime_small_blocks(&mut self, size: u32) -> Result<(), Error> {
        if !self.is_valid() {
            return Err(Error::InvalidRegion);
        }
        let Some(class) = class_index(size) else {
            return Err(Error::OutOfRange { offset: size });
        };
        let vec = self.run_vector(class)?;
        self.new_run(class, vec)?;
        Ok(())
    }
}
