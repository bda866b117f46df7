//! Exclusive access to one evdev keyboard node.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use evdev::Device;
use nix::errno::Errno;
use thiserror::Error;

use super::KeyEvent;

#[derive(Debug, Error)]
pub enum KeyboardError {
    #[error("device is grabbed by another process")]
    DeviceBusy,
    #[error("device went away")]
    DeviceGone,
    #[error("node does not match the remembered device identity")]
    IdentityMismatch,
    #[error("keyboard i/o failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KbdState {
    Open,
    Locked,
    Disabled,
}

/// A grabbed (or grabbable) keyboard. The handle outlives the device node:
/// when the node disappears the descriptor is dropped but the identity is
/// kept so the hotplug tracker can recognize the keyboard when it returns.
pub struct Keyboard {
    dev: Option<Device>,
    path: PathBuf,
    name: String,
    phys: String,
    state: KbdState,
    queue: VecDeque<KeyEvent>,
}

impl Keyboard {
    pub fn open(path: &Path) -> Result<Self, KeyboardError> {
        let dev = Device::open(path)?;
        let name = dev.name().unwrap_or("unknown").to_string();
        let phys = dev.physical_path().unwrap_or("").to_string();
        Ok(Self {
            dev: Some(dev),
            path: path.to_owned(),
            name,
            phys,
            state: KbdState::Open,
            queue: VecDeque::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phys(&self) -> &str {
        &self.phys
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> KbdState {
        self.state
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.dev.as_ref().map(|d| d.as_raw_fd())
    }

    /// Whether events read earlier are still waiting to be consumed.
    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Takes the exclusive grab. A second call while locked is a no-op.
    pub fn lock(&mut self) -> Result<(), KeyboardError> {
        if self.state == KbdState::Locked {
            return Ok(());
        }
        let dev = self.dev.as_mut().ok_or(KeyboardError::DeviceGone)?;
        dev.grab().map_err(grab_error)?;
        self.state = KbdState::Locked;
        Ok(())
    }

    pub fn unlock(&mut self) -> Result<(), KeyboardError> {
        if self.state != KbdState::Locked {
            return Ok(());
        }
        let dev = self.dev.as_mut().ok_or(KeyboardError::DeviceGone)?;
        dev.ungrab()?;
        self.state = KbdState::Open;
        Ok(())
    }

    /// Blocking read of the next event. The kernel hands over whole report
    /// batches; the remainder is queued and drained on later calls. Any
    /// read failure other than EAGAIN disables the handle and surfaces
    /// `DeviceGone`.
    pub fn read_one(&mut self) -> Result<KeyEvent, KeyboardError> {
        loop {
            if let Some(ev) = self.queue.pop_front() {
                return Ok(ev);
            }
            let dev = self.dev.as_mut().ok_or(KeyboardError::DeviceGone)?;
            let result = dev.fetch_events().map(|events| {
                events.map(KeyEvent::from).collect::<Vec<KeyEvent>>()
            });
            match result {
                Ok(batch) => {
                    self.queue.extend(batch);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(_) => {
                    self.disable();
                    return Err(KeyboardError::DeviceGone);
                }
            }
        }
    }

    /// Whether the node at `path` reports the same identity as this handle.
    pub fn matches(&self, path: &Path) -> bool {
        match Device::open(path) {
            Ok(dev) => {
                dev.name().unwrap_or("unknown") == self.name
                    && dev.physical_path().unwrap_or("") == self.phys
            }
            Err(_) => false,
        }
    }

    /// Re-opens the handle at a new node after a replug. The node must
    /// report the identity remembered from the original open.
    pub fn reset(&mut self, path: &Path) -> Result<(), KeyboardError> {
        let dev = Device::open(path).map_err(|_| KeyboardError::DeviceGone)?;
        if dev.name().unwrap_or("unknown") != self.name
            || dev.physical_path().unwrap_or("") != self.phys
        {
            return Err(KeyboardError::IdentityMismatch);
        }
        self.dev = Some(dev);
        self.path = path.to_owned();
        self.state = KbdState::Open;
        self.queue.clear();
        Ok(())
    }

    /// Drops the descriptor but keeps the identity for replug matching.
    pub fn disable(&mut self) {
        self.dev = None;
        self.state = KbdState::Disabled;
        self.queue.clear();
    }
}

fn grab_error(e: io::Error) -> KeyboardError {
    match e.raw_os_error() {
        Some(code) if code == Errno::EBUSY as i32 => KeyboardError::DeviceBusy,
        Some(code) if code == Errno::ENODEV as i32 => KeyboardError::DeviceGone,
        _ => KeyboardError::Io(e),
    }
}
