//! Wayland session setup
//!
//! Connects to the compositor, binds the globals typometer depends on, picks
//! the output to watch and prepares the virtual keyboard. Everything here runs
//! once before the event loop starts; any failure is a setup error.

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};
use wayland_client::globals::{GlobalListContents, registry_queue_init};
use wayland_client::protocol::wl_output::{self, WlOutput};
use wayland_client::protocol::wl_registry::{self, WlRegistry};
use wayland_client::protocol::wl_seat::WlSeat;
use wayland_client::{Connection, Dispatch, Proxy, QueueHandle, delegate_noop};
use wayland_protocols_misc::zwp_virtual_keyboard_v1::client::{
    zwp_virtual_keyboard_manager_v1::ZwpVirtualKeyboardManagerV1,
    zwp_virtual_keyboard_v1::ZwpVirtualKeyboardV1,
};
use wayland_protocols_wlr::export_dmabuf::v1::client::zwlr_export_dmabuf_manager_v1::{
    ZwlrExportDmabufManagerV1,
};

use crate::capture::CaptureSource;
use crate::config::Config;
use crate::keyboard::VirtualKeyboard;

/// Highest `wl_output` version we bind (version 4 adds `name`)
const OUTPUT_VERSION: u32 = 4;

/// Connected compositor with everything the measurement needs
pub struct Session {
    pub conn: Connection,
    pub capture: CaptureSource,
    pub keyboard: VirtualKeyboard,
}

/// Output advertised by the compositor
#[derive(Debug)]
struct OutputInfo {
    output: WlOutput,
    name: Option<String>,
    description: Option<String>,
}

/// State of the setup queue
#[derive(Default)]
struct Discovery {
    outputs: Vec<OutputInfo>,
}

impl Session {
    /// Connect using `WAYLAND_DISPLAY` and prepare capture and injection
    pub fn connect(config: &Config) -> Result<Self> {
        let conn = Connection::connect_to_env().context("Failed to connect to Wayland display")?;
        let (globals, mut queue) =
            registry_queue_init::<Discovery>(&conn).context("Failed to list Wayland globals")?;
        let qh = queue.handle();
        let mut discovery = Discovery::default();

        let export_manager: ZwlrExportDmabufManagerV1 = globals
            .bind(&qh, 1..=1, ())
            .context("Compositor doesn't support wlr-export-dmabuf-unstable-v1")?;
        let keyboard_manager: ZwpVirtualKeyboardManagerV1 = globals
            .bind(&qh, 1..=1, ())
            .context("Compositor doesn't support virtual-keyboard-unstable-v1")?;
        let seat: WlSeat = globals
            .bind(&qh, 1..=1, ())
            .context("No seat found")?;

        let advertised: Vec<(u32, u32)> = globals.contents().with_list(|list| {
            list.iter()
                .filter(|global| global.interface == WlOutput::interface().name)
                .map(|global| (global.name, global.version))
                .collect()
        });
        for (index, (name, version)) in advertised.into_iter().enumerate() {
            let output = globals
                .registry()
                .bind::<WlOutput, _, _>(name, version.min(OUTPUT_VERSION), &qh, index);
            discovery.outputs.push(OutputInfo {
                output,
                name: None,
                description: None,
            });
        }
        if discovery.outputs.is_empty() {
            bail!("No output found");
        }

        // Output names arrive as events
        queue
            .roundtrip(&mut discovery)
            .context("Failed to query outputs")?;

        let names: Vec<Option<&str>> = discovery
            .outputs
            .iter()
            .map(|info| info.name.as_deref())
            .collect();
        let selected = select_output(&names, config.capture.output.as_deref())?;
        let info = &discovery.outputs[selected];
        info!(
            "Watching output {} ({})",
            info.name.as_deref().unwrap_or("unnamed"),
            info.description.as_deref().unwrap_or("no description")
        );
        let capture = CaptureSource::new(
            export_manager,
            info.output.clone(),
            config.capture.overlay_cursor,
        );

        let keyboard =
            VirtualKeyboard::new(keyboard_manager.create_virtual_keyboard(&seat, &qh, ()));
        let keymap_fd = keyboard.upload_keymap(&config.keys.character)?;
        // The keymap fd must stay open until the compositor has read it
        queue
            .roundtrip(&mut discovery)
            .context("Failed to upload keymap")?;
        drop(keymap_fd);

        Ok(Self {
            conn,
            capture,
            keyboard,
        })
    }
}

/// Index of the output to watch
///
/// A configured name must match one of the outputs; without one the first
/// output is used.
fn select_output(names: &[Option<&str>], wanted: Option<&str>) -> Result<usize> {
    if names.is_empty() {
        bail!("No output found");
    }

    let Some(wanted) = wanted else {
        return Ok(0);
    };

    match names.iter().position(|name| *name == Some(wanted)) {
        Some(index) => Ok(index),
        None => {
            let known: Vec<&str> = names.iter().flatten().copied().collect();
            bail!("Output {:?} not found (available: {})", wanted, known.join(", "))
        }
    }
}

impl Dispatch<WlRegistry, GlobalListContents> for Discovery {
    fn event(
        _: &mut Self,
        _: &WlRegistry,
        event: wl_registry::Event,
        _: &GlobalListContents,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        // Globals appearing later are of no interest
        if let wl_registry::Event::GlobalRemove { name } = event {
            debug!("Global {} removed", name);
        }
    }
}

impl Dispatch<WlOutput, usize> for Discovery {
    fn event(
        state: &mut Self,
        _: &WlOutput,
        event: wl_output::Event,
        index: &usize,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let Some(info) = state.outputs.get_mut(*index) else {
            warn!("Event for unknown output #{}", index);
            return;
        };

        match event {
            wl_output::Event::Name { name } => info.name = Some(name),
            wl_output::Event::Description { description } => info.description = Some(description),
            wl_output::Event::Mode { width, height, refresh, .. } => {
                debug!("Output #{} mode {}x{}@{}mHz", index, width, height, refresh);
            }
            _ => {}
        }
    }
}

delegate_noop!(Discovery: ignore WlSeat);
delegate_noop!(Discovery: ZwlrExportDmabufManagerV1);
delegate_noop!(Discovery: ZwpVirtualKeyboardManagerV1);
delegate_noop!(Discovery: ZwpVirtualKeyboardV1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_output_by_default() {
        assert_eq!(select_output(&[Some("DP-1"), Some("HDMI-A-1")], None).unwrap(), 0);
        assert_eq!(select_output(&[None], None).unwrap(), 0);
    }

    #[test]
    fn test_output_by_name() {
        let names = [Some("DP-1"), None, Some("HDMI-A-1")];
        assert_eq!(select_output(&names, Some("HDMI-A-1")).unwrap(), 2);
    }

    #[test]
    fn test_unknown_output_name() {
        let err = select_output(&[Some("DP-1")], Some("eDP-1")).unwrap_err();
        assert!(err.to_string().contains("available: DP-1"));
    }

    #[test]
    fn test_no_outputs() {
        assert!(select_output(&[], None).is_err());
    }
}
