#![cfg(test)]

use crate::{Offset, OwnedRegion, Region, RegionOptions};

mod resize;
mod strings;
mod vector;

#[inline]
pub(crate) fn tracing_init() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub(crate) fn fixed(size: u32) -> OwnedRegion {
    OwnedRegion::new_fixed(size).unwrap()
}

/// A fixed region with the small-block tier disabled, so everything goes
/// through the free list.
pub(crate) fn fixed_plain(size: u32) -> OwnedRegion {
    OwnedRegion::fixed_with(size, RegionOptions::new().with_small_blocks(false)).unwrap()
}

pub(crate) fn fill(region: &mut Region, off: Offset, len: u32, tag: u8) {
    region.bytes_mut(off, len).unwrap().fill(tag);
}

pub(crate) fn holds(region: &Region, off: Offset, len: u32, tag: u8) -> bool {
    region.bytes(off, len).unwrap().iter().all(|&b| b == tag)
}
