//! Watched screen region and the pixel buffers read back from it

use crate::error::FatalError;

/// Rectangle of the output that is read back and compared every frame
///
/// Fixed for the whole run (comes from the command line).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl WatchRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Whether the region lies entirely inside a `width`x`height` image
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        u64::from(self.x) + u64::from(self.width) <= u64::from(width)
            && u64::from(self.y) + u64::from(self.height) <= u64::from(height)
    }
}

/// Reference image of the region plus the buffer each frame is read into
#[derive(Debug)]
pub struct RegionBuffers {
    pub reference: PixelBuffer,
    pub current: PixelBuffer,
}

impl RegionBuffers {
    pub fn allocate(region: &WatchRegion) -> Result<Self, FatalError> {
        Ok(Self {
            reference: PixelBuffer::for_region(region)?,
            current: PixelBuffer::for_region(region)?,
        })
    }
}

/// Row-major RGBA8 image, one `u32` per pixel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    pixels: Vec<u32>,
}

impl PixelBuffer {
    /// Zero-filled buffer of the given size; fails instead of aborting
    /// when the allocation can't be satisfied
    pub fn new(width: u32, height: u32) -> Result<Self, FatalError> {
        let failed = || FatalError::Allocation { width, height };
        let len = (width as usize)
            .checked_mul(height as usize)
            .ok_or_else(failed)?;

        let mut pixels = Vec::new();
        pixels.try_reserve_exact(len).map_err(|_| failed())?;
        pixels.resize(len, 0);

        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Buffer sized to hold one readback of `region`
    pub fn for_region(region: &WatchRegion) -> Result<Self, FatalError> {
        Self::new(region.width, region.height)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel(&self, x: u32, y: u32) -> u32 {
        self.pixels[self.index(x, y)]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, value: u32) {
        let index = self.index(x, y);
        self.pixels[index] = value;
    }

    /// Raw RGBA bytes, used as the glReadPixels destination
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.pixels)
    }

    /// Overwrite this buffer with `other` (same dimensions)
    pub fn copy_from(&mut self, other: &PixelBuffer) {
        debug_assert_eq!((self.width, self.height), (other.width, other.height));
        self.pixels.copy_from_slice(&other.pixels);
    }

    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }
}
