use offheap::{Offset, OwnedRegion, RegionOptions};

pub const REGION_SIZE: u32 = 2 * 1024 * 1024;

/// Allocate and free mixed sizes in `[1, 128]` with a sprinkling of
/// block-sized payloads, the shape a message arena sees in practice.
/// Returns the final high-water mark so callers can compare footprints.
pub fn mixed_churn(small_blocks: bool, rounds: usize) -> u32 {
    fastrand::seed(0x7ead);
    let mut pb = OwnedRegion::fixed_with(
        REGION_SIZE,
        RegionOptions::new().with_small_blocks(small_blocks),
    )
    .unwrap();

    let mut small: Vec<Offset> = Vec::new();
    let mut big: Vec<Offset> = Vec::new();
    for _ in 0..rounds {
        for _ in 0..40 {
            small.push(pb.alloc(fastrand::u32(1..=128)).unwrap());
        }
        for _ in 0..4 {
            big.push(pb.alloc_with(512, 8, false, true).unwrap());
        }
        for _ in 0..small.len() / 2 {
            let i = fastrand::usize(0..small.len());
            pb.free(small.swap_remove(i));
        }
        for _ in 0..big.len() / 2 {
            let i = fastrand::usize(0..big.len());
            pb.free(big.swap_remove(i));
        }
    }
    pb.hwm()
}

/// Best case for the bitmap tier: primed runs, fixed sizes, immediate
/// reuse.
pub fn primed_cycle(small_blocks: bool) -> u32 {
    let mut pb = OwnedRegion::fixed_with(
        REGION_SIZE,
        RegionOptions::new().with_small_blocks(small_blocks),
    )
    .unwrap();
    if small_blocks {
        for size in [16, 32, 64, 128] {
            pb.prime_small_blocks(size).unwrap();
        }
    }

    let mut blocks: Vec<Offset> = Vec::with_capacity(60);
    for _ in 0..100 {
        for _ in 0..32 {
            blocks.push(pb.alloc_with(10, 8, false, small_blocks).unwrap());
        }
        for _ in 0..16 {
            blocks.push(pb.alloc_with(28, 8, false, small_blocks).unwrap());
        }
        for _ in 0..8 {
            blocks.push(pb.alloc_with(60, 8, false, small_blocks).unwrap());
        }
        for _ in 0..4 {
            blocks.push(pb.alloc_with(120, 8, false, small_blocks).unwrap());
        }
        for off in blocks.drain(..) {
            pb.free(off);
        }
    }
    pb.hwm()
}
