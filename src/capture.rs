//! Frame source: one-shot `wlr-export-dmabuf` captures of the watched output
//!
//! Exactly one capture is in flight at any time. Its events feed the
//! [`FrameAssembler`](crate::frame::FrameAssembler); on `ready` the engine gets
//! the frame, the frame object is destroyed and the next capture is requested
//! right away unless a fatal error has been flagged.

use tracing::{debug, trace};
use wayland_client::protocol::wl_output::WlOutput;
use wayland_client::{Connection, Dispatch, QueueHandle, WEnum};
use wayland_protocols_wlr::export_dmabuf::v1::client::{
    zwlr_export_dmabuf_frame_v1::{self, ZwlrExportDmabufFrameV1},
    zwlr_export_dmabuf_manager_v1::ZwlrExportDmabufManagerV1,
};

use crate::App;
use crate::error::FatalError;
use crate::event_loop::LoopHandler;

/// Export manager bound to the output being watched
pub struct CaptureSource {
    manager: ZwlrExportDmabufManagerV1,
    output: WlOutput,
    overlay_cursor: bool,
}

impl CaptureSource {
    pub fn new(manager: ZwlrExportDmabufManagerV1, output: WlOutput, overlay_cursor: bool) -> Self {
        Self {
            manager,
            output,
            overlay_cursor,
        }
    }

    /// Ask for the next frame of the output
    pub fn request(&self, qh: &QueueHandle<App>) -> ZwlrExportDmabufFrameV1 {
        trace!("Requesting capture");
        self.manager
            .capture_output(i32::from(self.overlay_cursor), &self.output, qh, ())
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.manager.destroy();
    }
}

fn cancel_reason(reason: WEnum<zwlr_export_dmabuf_frame_v1::CancelReason>) -> String {
    match reason {
        WEnum::Value(reason) => format!("{:?}", reason).to_lowercase(),
        WEnum::Unknown(raw) => format!("unknown reason {}", raw),
    }
}

impl Dispatch<ZwlrExportDmabufFrameV1, ()> for App {
    fn event(
        app: &mut Self,
        frame: &ZwlrExportDmabufFrameV1,
        event: zwlr_export_dmabuf_frame_v1::Event,
        _: &(),
        _: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        use zwlr_export_dmabuf_frame_v1::Event;

        // Ok(true) once the frame reached a successful terminal event
        let result = match event {
            Event::Frame {
                width,
                height,
                format,
                mod_high,
                mod_low,
                num_objects,
                ..
            } => app
                .assembler
                .describe(width, height, format, mod_high, mod_low, num_objects)
                .map(|()| false),
            Event::Object {
                index,
                fd,
                offset,
                stride,
                ..
            } => app.assembler.object(index, fd, offset, stride).map(|()| false),
            Event::Ready { .. } => app
                .assembler
                .ready()
                .and_then(|described| app.engine.frame_ready(&described, &mut app.gpu))
                .map(|()| true),
            Event::Cancel { reason } => Err(FatalError::CaptureCancelled(cancel_reason(reason))),
            other => {
                debug!("Ignoring frame event {:?}", other);
                Ok(false)
            }
        };

        match result {
            Ok(false) => {}
            Ok(true) => {
                frame.destroy();
                if !app.has_failed() {
                    app.capture.request(qh);
                }
            }
            Err(err) => {
                app.assembler.discard();
                frame.destroy();
                app.flag_error(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_reasons() {
        use zwlr_export_dmabuf_frame_v1::CancelReason;
        assert_eq!(cancel_reason(WEnum::Value(CancelReason::Permanent)), "permanent");
        assert_eq!(cancel_reason(WEnum::Value(CancelReason::Resizing)), "resizing");
        assert_eq!(cancel_reason(WEnum::Unknown(9)), "unknown reason 9");
    }
}
