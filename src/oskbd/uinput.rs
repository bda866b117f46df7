//! Synthetic output keyboard backed by uinput.

use std::io;
use std::thread;
use std::time::Duration;

use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AttributeSet, BusType, InputId, Key};
use log::warn;

use super::KeyEvent;

type HashSet<T> = rustc_hash::FxHashSet<T>;

pub const VIRTUAL_KEYBOARD_NAME: &str = "hawck-inputd";

/// Default pacing between synthetic events, in microseconds. Some
/// compositors drop keys that are delivered less than ~1 ms apart.
pub const DEFAULT_EVENT_DELAY_US: u64 = 3800;

/// Buffered events past this point force a flush.
const FLUSH_HIGH_WATER: usize = 128;

/// The virtual keyboard every event ultimately leaves through, whether it
/// came straight from a grabbed device or from the macro daemon. Tracks
/// which key codes it has written as pressed so that the error paths can
/// manufacture matching releases.
pub struct UinputKeyboard {
    device: VirtualDevice,
    buffer: Vec<KeyEvent>,
    held: HashSet<u16>,
    event_delay: Duration,
}

impl UinputKeyboard {
    pub fn new(event_delay_us: u64) -> io::Result<Self> {
        let mut keys = AttributeSet::new();
        for code in 0..0x2ff_u16 {
            keys.insert(Key(code));
        }
        let device = VirtualDeviceBuilder::new()?
            .name(VIRTUAL_KEYBOARD_NAME)
            .input_id(InputId::new(BusType::BUS_USB, 1, 1, 1))
            .with_keys(&keys)?
            .build()?;
        Ok(Self {
            device,
            buffer: Vec::with_capacity(FLUSH_HIGH_WATER),
            held: HashSet::default(),
            event_delay: Duration::from_micros(event_delay_us),
        })
    }

    /// Queues one event, flushing if the buffer hits the high-water mark.
    pub fn emit(&mut self, event: KeyEvent) -> io::Result<()> {
        self.buffer.push(event);
        if self.buffer.len() >= FLUSH_HIGH_WATER {
            self.flush()?;
        }
        Ok(())
    }

    /// Writes the buffer in submission order, pacing successive writes by
    /// the configured delay. The held-keys set is updated per write, so a
    /// failure partway through leaves it consistent with what the kernel
    /// actually saw; the unwritten tail stays buffered.
    pub fn flush(&mut self) -> io::Result<()> {
        let mut written = 0;
        while written < self.buffer.len() {
            let event = self.buffer[written];
            if let Err(first) = self.device.emit(&[event.into()]) {
                warn!("uinput write failed, retrying once: {first}");
                if let Err(second) = self.device.emit(&[event.into()]) {
                    self.buffer.drain(..written);
                    return Err(second);
                }
            }
            track_written(&mut self.held, &event);
            written += 1;
            if written < self.buffer.len() {
                thread::sleep(self.event_delay);
            }
        }
        self.buffer.clear();
        Ok(())
    }

    /// Queues a release for every key the synthetic device currently holds.
    /// Nothing reaches the kernel until the next `flush`.
    pub fn release_all(&mut self) {
        self.buffer.extend(release_events(&self.held));
    }

    pub fn set_event_delay(&mut self, micros: u64) {
        self.event_delay = Duration::from_micros(micros);
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

fn track_written(held: &mut HashSet<u16>, event: &KeyEvent) {
    if !event.is_key() {
        return;
    }
    match event.value {
        1 => {
            held.insert(event.code);
        }
        0 => {
            held.remove(&event.code);
        }
        _ => {}
    }
}

fn release_events(held: &HashSet<u16>) -> Vec<KeyEvent> {
    let mut codes: Vec<u16> = held.iter().copied().collect();
    codes.sort_unstable();
    codes
        .into_iter()
        .flat_map(|code| [KeyEvent::key(code, 0), KeyEvent::syn_report()])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn held_after(events: &[KeyEvent]) -> HashSet<u16> {
        let mut held = HashSet::default();
        for ev in events {
            track_written(&mut held, ev);
        }
        held
    }

    #[test]
    fn press_holds_and_release_clears() {
        let held = held_after(&[KeyEvent::key(30, 1), KeyEvent::key(31, 1), KeyEvent::key(30, 0)]);
        assert!(!held.contains(&30));
        assert!(held.contains(&31));
    }

    #[test]
    fn autorepeat_does_not_change_held_state() {
        let held = held_after(&[KeyEvent::key(30, 1), KeyEvent::key(30, 2)]);
        assert!(held.contains(&30));
        let held = held_after(&[KeyEvent::key(30, 2)]);
        assert!(!held.contains(&30));
    }

    #[test]
    fn non_key_events_are_ignored_by_the_tracker() {
        let held = held_after(&[KeyEvent::syn_report()]);
        assert!(held.is_empty());
    }

    #[test]
    fn release_events_cover_every_held_key_in_order() {
        let held = held_after(&[KeyEvent::key(42, 1), KeyEvent::key(30, 1)]);
        let evs = release_events(&held);
        assert_eq!(
            evs,
            vec![
                KeyEvent::key(30, 0),
                KeyEvent::syn_report(),
                KeyEvent::key(42, 0),
                KeyEvent::syn_report(),
            ]
        );
    }

    #[test]
    fn releases_drain_the_tracker() {
        let mut held = held_after(&[KeyEvent::key(30, 1), KeyEvent::key(42, 1)]);
        for ev in release_events(&held.clone()) {
            track_written(&mut held, &ev);
        }
        assert!(held.is_empty());
        // A second pass generates nothing.
        assert!(release_events(&held).is_empty());
    }
}
