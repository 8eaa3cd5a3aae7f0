//! Reaction detection
//!
//! Exact comparison: a single differing pixel (any channel) inside the region
//! counts as a reaction. There is no tolerance, so compositor noise inside the
//! region (blinking cursor, dithering) shows up as a reaction too.

use crate::region::{PixelBuffer, WatchRegion};

/// True if any pixel of `region` differs between `reference` and `current`
///
/// `region` is in buffer coordinates and must lie inside both buffers.
pub fn has_reacted(reference: &PixelBuffer, current: &PixelBuffer, region: &WatchRegion) -> bool {
    debug_assert!(region.fits_within(reference.width(), reference.height()));
    debug_assert!(region.fits_within(current.width(), current.height()));

    (region.y..region.y + region.height).any(|y| {
        (region.x..region.x + region.width).any(|x| reference.pixel(x, y) != current.pixel(x, y))
    })
}

/// Compare two readbacks of the watched region over their whole extent
pub fn region_changed(reference: &PixelBuffer, current: &PixelBuffer) -> bool {
    let whole = WatchRegion::new(0, 0, reference.width(), reference.height());
    has_reacted(reference, current, &whole)
}
