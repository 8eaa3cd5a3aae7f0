//! Frame descriptions delivered by the screen export protocol
//!
//! A capture arrives as `describe` -> `object` x planes -> `ready | cancel`.
//! [`FrameAssembler`] collects those events for the single capture in flight
//! and owns the transferred dmabuf descriptors until the frame is consumed.
//! Dropping a [`FrameDescriptor`] closes every descriptor it holds.

use std::os::fd::OwnedFd;

use tracing::{debug, warn};

use crate::error::FatalError;

/// Largest plane count a frame may declare
pub const MAX_PLANES: u32 = 3;

/// One dmabuf plane of a captured frame
#[derive(Debug)]
pub struct PlaneObject {
    pub fd: OwnedFd,
    pub offset: u32,
    pub stride: u32,
}

/// Geometry, format and per-plane buffers of one captured frame
#[derive(Debug)]
pub struct FrameDescriptor {
    pub width: u32,
    pub height: u32,
    /// DRM fourcc
    pub format: u32,
    /// Format modifier shared by every plane
    pub modifier: u64,
    planes: Vec<Option<PlaneObject>>,
}

impl FrameDescriptor {
    /// Start describing a frame; fails if the plane count is out of range
    pub fn new(
        width: u32,
        height: u32,
        format: u32,
        modifier: u64,
        plane_count: u32,
    ) -> Result<Self, FatalError> {
        if plane_count > MAX_PLANES {
            return Err(FatalError::TooManyPlanes(plane_count));
        }

        Ok(Self {
            width,
            height,
            format,
            modifier,
            planes: (0..plane_count).map(|_| None).collect(),
        })
    }

    pub fn plane_count(&self) -> u32 {
        self.planes.len() as u32
    }

    /// Attach the buffer for plane `index`
    ///
    /// On error the descriptor is dropped (closed) right away.
    pub fn set_plane(&mut self, index: u32, plane: PlaneObject) -> Result<(), FatalError> {
        let planes = self.plane_count();
        let slot = self
            .planes
            .get_mut(index as usize)
            .ok_or(FatalError::PlaneIndexOutOfRange { index, planes })?;

        if slot.is_some() {
            warn!("Plane {} delivered twice, replacing previous buffer", index);
        }
        *slot = Some(plane);
        Ok(())
    }

    /// Fails with the first declared plane that never arrived
    pub fn ensure_complete(&self) -> Result<(), FatalError> {
        match self.planes.iter().position(Option::is_none) {
            Some(missing) => Err(FatalError::IncompleteFrame(missing as u32)),
            None => Ok(()),
        }
    }

    /// Delivered planes in index order
    pub fn planes(&self) -> impl Iterator<Item = &PlaneObject> {
        self.planes.iter().flatten()
    }
}

/// Collects the lifecycle events of the one capture currently in flight
#[derive(Debug, Default)]
pub struct FrameAssembler {
    pending: Option<FrameDescriptor>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle `describe`; combines the split modifier halves
    pub fn describe(
        &mut self,
        width: u32,
        height: u32,
        format: u32,
        mod_high: u32,
        mod_low: u32,
        plane_count: u32,
    ) -> Result<(), FatalError> {
        if self.pending.take().is_some() {
            warn!("New frame description before the previous one completed");
        }

        let modifier = (u64::from(mod_high) << 32) | u64::from(mod_low);
        debug!(
            "Frame {}x{} format=0x{:08x} modifier=0x{:016x} planes={}",
            width, height, format, modifier, plane_count
        );
        self.pending = Some(FrameDescriptor::new(width, height, format, modifier, plane_count)?);
        Ok(())
    }

    /// Handle `object`; takes ownership of `fd` in every case
    pub fn object(
        &mut self,
        index: u32,
        fd: OwnedFd,
        offset: u32,
        stride: u32,
    ) -> Result<(), FatalError> {
        let frame = self
            .pending
            .as_mut()
            .ok_or(FatalError::UnexpectedFrameEvent("object"))?;
        frame.set_plane(index, PlaneObject { fd, offset, stride })
    }

    /// Handle `ready`; hands over the completed frame
    pub fn ready(&mut self) -> Result<FrameDescriptor, FatalError> {
        let frame = self
            .pending
            .take()
            .ok_or(FatalError::UnexpectedFrameEvent("ready"))?;
        frame.ensure_complete()?;
        Ok(frame)
    }

    /// Drop whatever was collected for the current capture (closes its fds)
    pub fn discard(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::OFlag;
    use nix::unistd::{pipe2, read};

    /// Fresh descriptor backed by /dev/null
    fn null_fd() -> OwnedFd {
        OwnedFd::from(std::fs::File::open("/dev/null").unwrap())
    }

    /// Non-blocking pipe: (read end, write end)
    fn pipe() -> (OwnedFd, OwnedFd) {
        pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).unwrap()
    }

    /// A pipe reads EOF only once every write end is closed
    fn writer_closed(read_end: &OwnedFd) -> bool {
        let mut byte = [0u8; 1];
        matches!(read(read_end, &mut byte), Ok(0))
    }

    #[test]
    fn test_modifier_halves_combined() {
        let mut asm = FrameAssembler::new();
        asm.describe(1920, 1080, 0x34325258, 0x0100_0000, 0x0000_0004, 1).unwrap();
        asm.object(0, null_fd(), 0, 7680).unwrap();
        let frame = asm.ready().unwrap();
        assert_eq!(frame.modifier, 0x0100_0000_0000_0004);
        assert_eq!(frame.plane_count(), 1);
        assert!(matches!(asm.ready(), Err(FatalError::UnexpectedFrameEvent("ready"))));
    }

    #[test]
    fn test_plane_count_bound() {
        let mut asm = FrameAssembler::new();
        assert!(asm.describe(8, 8, 0, 0, 0, 3).is_ok());
        assert!(matches!(
            asm.describe(8, 8, 0, 0, 0, 4),
            Err(FatalError::TooManyPlanes(4))
        ));
        // Nothing left to import after the violation
        assert!(matches!(asm.ready(), Err(FatalError::UnexpectedFrameEvent("ready"))));
    }

    #[test]
    fn test_out_of_range_object_closes_fd() {
        let mut asm = FrameAssembler::new();
        asm.describe(8, 8, 0, 0, 0, 1).unwrap();

        let (read_end, write_end) = pipe();
        let err = asm.object(1, write_end, 0, 32).unwrap_err();
        assert!(matches!(err, FatalError::PlaneIndexOutOfRange { index: 1, planes: 1 }));
        assert!(writer_closed(&read_end));
    }

    #[test]
    fn test_missing_plane_is_incomplete() {
        let mut asm = FrameAssembler::new();
        asm.describe(8, 8, 0, 0, 0, 2).unwrap();
        asm.object(0, null_fd(), 0, 32).unwrap();
        assert!(matches!(asm.ready(), Err(FatalError::IncompleteFrame(1))));
    }

    #[test]
    fn test_discard_closes_fds() {
        let mut asm = FrameAssembler::new();
        asm.describe(8, 8, 0, 0, 0, 2).unwrap();

        let (read_end, write_end) = pipe();
        asm.object(0, write_end, 0, 32).unwrap();
        assert!(!writer_closed(&read_end));

        asm.discard();
        assert!(matches!(asm.ready(), Err(FatalError::UnexpectedFrameEvent("ready"))));
        assert!(writer_closed(&read_end));
    }

    #[test]
    fn test_object_without_describe() {
        let mut asm = FrameAssembler::new();
        assert!(matches!(
            asm.object(0, null_fd(), 0, 0),
            Err(FatalError::UnexpectedFrameEvent("object"))
        ));
    }
}
