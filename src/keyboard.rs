//! Virtual keyboard used to inject the measured key strokes
//!
//! The compositor only accepts key events from a virtual keyboard after a
//! keymap was uploaded. Ours describes a keyboard with exactly two keys: the
//! reactive character key and BackSpace.

use anyhow::{Context, Result};
use nix::sys::memfd::{MemFdCreateFlag, memfd_create};
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsFd, OwnedFd};
use std::time::Instant;
use tracing::{debug, info};
use wayland_client::Proxy;
use wayland_client::protocol::wl_keyboard;
use wayland_protocols_misc::zwp_virtual_keyboard_v1::client::zwp_virtual_keyboard_v1::{
    ZwpVirtualKeyboardV1,
};

use crate::error::FatalError;

/// Keysym of the erase key
pub const ERASE_KEYSYM: &str = "BackSpace";

/// Logical keys the engine presses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    /// Key that makes a character appear in the watched region
    Character,
    /// Key that removes it again
    Erase,
}

impl Key {
    /// Evdev keycode sent on the wire (xkb keycode minus 8)
    pub fn keycode(self) -> u32 {
        match self {
            Key::Character => 1,
            Key::Erase => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Pressed,
    Released,
}

impl From<KeyState> for wl_keyboard::KeyState {
    fn from(state: KeyState) -> Self {
        match state {
            KeyState::Pressed => wl_keyboard::KeyState::Pressed,
            KeyState::Released => wl_keyboard::KeyState::Released,
        }
    }
}

/// Sink for synthetic key events
pub trait KeyInjector {
    fn send(&mut self, key: Key, state: KeyState) -> Result<(), FatalError>;
}

/// XKB text keymap with `<K1>` (keycode 9) = `character`, `<K2>` (10) = BackSpace
pub fn keymap(character: &str) -> String {
    format!(
        r#"xkb_keymap {{
    xkb_keycodes "(unnamed)" {{
        minimum = 8;
        maximum = 11;

        <K1> = 9;
        <K2> = 10;
    }};

    xkb_types "(unnamed)" {{ include "complete" }};
    xkb_compatibility "(unnamed)" {{ include "complete" }};

    xkb_symbols "(unnamed)" {{
        key <K1> {{[{character}]}};
        key <K2> {{[{ERASE_KEYSYM}]}};
    }};
}};
"#
    )
}

/// Write `keymap` (plus the trailing NUL the compositor expects) to a memfd
///
/// Returns the descriptor and the size to announce.
pub fn keymap_memfd(keymap: &str) -> Result<(OwnedFd, u32)> {
    let fd = memfd_create(c"typometer-keymap", MemFdCreateFlag::MFD_CLOEXEC)
        .context("Failed to create keymap memfd")?;
    let mut file = File::from(fd);

    let mut contents = keymap.as_bytes().to_vec();
    contents.push(0);
    file.write_all(&contents).context("Failed to write keymap")?;

    let size = u32::try_from(contents.len()).context("Keymap too large")?;
    Ok((OwnedFd::from(file), size))
}

/// `zwp_virtual_keyboard_v1` with the two-key layout
pub struct VirtualKeyboard {
    keyboard: ZwpVirtualKeyboardV1,
    epoch: Instant,
}

impl VirtualKeyboard {
    pub fn new(keyboard: ZwpVirtualKeyboardV1) -> Self {
        Self {
            keyboard,
            epoch: Instant::now(),
        }
    }

    /// Send the keymap request
    ///
    /// The returned descriptor must stay open until the request has reached
    /// the compositor (the caller does a roundtrip before dropping it).
    pub fn upload_keymap(&self, character: &str) -> Result<OwnedFd> {
        let (fd, size) = keymap_memfd(&keymap(character))?;
        self.keyboard.keymap(
            wl_keyboard::KeymapFormat::XkbV1.into(),
            fd.as_fd(),
            size,
        );
        info!("Uploaded two-key keymap ({} and {})", character, ERASE_KEYSYM);
        Ok(fd)
    }
}

impl KeyInjector for VirtualKeyboard {
    fn send(&mut self, key: Key, state: KeyState) -> Result<(), FatalError> {
        if !self.keyboard.is_alive() {
            return Err(FatalError::InjectorGone);
        }

        // Wrapping millisecond clock, as the protocol requires
        let time = self.epoch.elapsed().as_millis() as u32;
        self.keyboard
            .key(time, key.keycode(), wl_keyboard::KeyState::from(state).into());
        debug!("Key {:?} {:?} at {}ms", key, state, time);
        Ok(())
    }
}

impl Drop for VirtualKeyboard {
    fn drop(&mut self) {
        self.keyboard.destroy();
    }
}
