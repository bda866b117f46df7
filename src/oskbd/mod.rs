//! Low level keyboard input/output on Linux evdev.

mod keyboard;
mod multiplex;
mod uinput;

pub use keyboard::{KbdState, Keyboard, KeyboardError};
pub use multiplex::Multiplexer;
pub use uinput::{UinputKeyboard, DEFAULT_EVENT_DELAY_US, VIRTUAL_KEYBOARD_NAME};

use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use evdev::{Device, EventType, InputEvent, Key};
use log::{debug, info};

/// One kernel input event. Field for field this is `struct input_event`,
/// which also makes it the payload of the macro daemon wire format.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub time_sec: i64,
    pub time_usec: i64,
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

impl KeyEvent {
    pub fn key(code: u16, value: i32) -> Self {
        Self {
            kind: EventType::KEY.0,
            code,
            value,
            ..Default::default()
        }
    }

    pub fn syn_report() -> Self {
        Self {
            kind: EventType::SYNCHRONIZATION.0,
            ..Default::default()
        }
    }

    pub fn is_key(&self) -> bool {
        self.kind == EventType::KEY.0
    }
}

impl From<InputEvent> for KeyEvent {
    fn from(ev: InputEvent) -> Self {
        let (time_sec, time_usec) = match ev.timestamp().duration_since(UNIX_EPOCH) {
            Ok(d) => (d.as_secs() as i64, i64::from(d.subsec_micros())),
            Err(_) => (0, 0),
        };
        Self {
            time_sec,
            time_usec,
            kind: ev.event_type().0,
            code: ev.code(),
            value: ev.value(),
        }
    }
}

impl From<KeyEvent> for InputEvent {
    fn from(ev: KeyEvent) -> Self {
        InputEvent::new(EventType(ev.kind), ev.code, ev.value)
    }
}

const QWERTY_ROW: [Key; 6] = [
    Key::KEY_Q,
    Key::KEY_W,
    Key::KEY_E,
    Key::KEY_R,
    Key::KEY_T,
    Key::KEY_Y,
];
const TYPING_KEYS: [Key; 3] = [Key::KEY_SPACE, Key::KEY_A, Key::KEY_Z];

/// Scans `/dev/input` for devices that look like real keyboards, skipping
/// our own virtual device so the daemon never grabs its own output.
pub fn detect_keyboards() -> Vec<PathBuf> {
    let mut found = Vec::new();
    for (path, dev) in evdev::enumerate() {
        let name = dev.name().unwrap_or("unknown");
        if name.contains(VIRTUAL_KEYBOARD_NAME) {
            continue;
        }
        if is_keyboard(&dev) {
            info!("detected keyboard: {} @ {}", name, path.display());
            found.push(path);
        } else {
            debug!("skipping non-keyboard device: {name}");
        }
    }
    found
}

fn is_keyboard(dev: &Device) -> bool {
    let Some(keys) = dev.supported_keys() else {
        return false;
    };
    QWERTY_ROW.iter().all(|&k| keys.contains(k)) && TYPING_KEYS.iter().all(|&k| keys.contains(k))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_event_converts_to_input_event_and_back() {
        let ev = KeyEvent::key(30, 1);
        let raw: InputEvent = ev.into();
        assert_eq!(raw.event_type(), EventType::KEY);
        assert_eq!(raw.code(), 30);
        assert_eq!(raw.value(), 1);

        let back = KeyEvent::from(raw);
        assert_eq!(back.kind, ev.kind);
        assert_eq!(back.code, ev.code);
        assert_eq!(back.value, ev.value);
    }

    #[test]
    fn syn_report_is_not_a_key() {
        assert!(!KeyEvent::syn_report().is_key());
        assert!(KeyEvent::key(57, 0).is_key());
    }
}
