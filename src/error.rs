//! Fatal conditions of the measurement engine
//!
//! Every variant stops the run: the event loop notices the flagged error on its
//! next iteration, unwinds (closing descriptors and GPU handles on the way) and
//! the process exits non-zero.

use thiserror::Error;

/// Unrecoverable conditions detected while capturing, importing or measuring
#[derive(Debug, Error)]
pub enum FatalError {
    /// Compositor described a frame with more planes than the importer handles
    #[error("Too many planes: frame declares {0}, at most 3 are supported")]
    TooManyPlanes(u32),

    /// `object` event referenced a plane the frame never declared
    #[error("Unexpected object index {index} for a frame with {planes} plane(s)")]
    PlaneIndexOutOfRange { index: u32, planes: u32 },

    /// `ready` arrived before every declared plane was delivered
    #[error("Frame ready with plane {0} missing")]
    IncompleteFrame(u32),

    /// Frame lifecycle event without a preceding `describe`
    #[error("Frame event '{0}' received outside of a capture")]
    UnexpectedFrameEvent(&'static str),

    /// Compositor cancelled the capture
    #[error("Received cancel from frame ({0})")]
    CaptureCancelled(String),

    /// Readback buffers for the watched region could not be allocated
    #[error("Failed to allocate memory for a {width}x{height} region")]
    Allocation { width: u32, height: u32 },

    /// Watched region does not fit inside the captured frame
    #[error("Region does not fit inside the {width}x{height} frame")]
    RegionOutOfBounds { width: u32, height: u32 },

    /// eglCreateImage rejected the dmabuf description
    #[error("Failed to create EGL image: {0}")]
    ImageImport(String),

    /// GL reported an error while binding or reading back the frame
    #[error("{op} failed with GL error 0x{code:04x}")]
    Gl { op: &'static str, code: u32 },

    /// Watched region changed while no key press was pending
    #[error("Got a reaction before pressing a key")]
    EarlyReaction,

    /// Watched region returned to the reference while no erase was pending
    #[error("Got a clear before pressing backspace")]
    EarlyClear,

    /// Virtual keyboard object is no longer usable
    #[error("Virtual keyboard is gone")]
    InjectorGone,

    /// Latency sample could not be written
    #[error("Failed to write latency sample: {0}")]
    Output(#[from] std::io::Error),

    /// Display connection failed while reading, writing or dispatching
    #[error("Display connection error: {0}")]
    Connection(String),
}
