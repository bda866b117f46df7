//! The event-dispatch loop and device hotplug tracking.
//!
//! Keyboard handles live in an arena for the process lifetime; the active
//! and pending-replug lists hold indices into it. The event loop owns
//! dispatch, the watcher threads own passthrough reload and hotplug, and
//! no thread ever holds more than one of the shared locks at a time.

use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use nix::unistd::Group;
use parking_lot::Mutex;

use crate::comm::PeerChannel;
use crate::file_watcher::{FsEvent, FsEventKind, FsWatcher};
use crate::oskbd::{
    self, KbdState, KeyEvent, Keyboard, KeyboardError, Multiplexer, UinputKeyboard,
};
use crate::passthrough::PassthroughRegistry;
use crate::ValidatedArgs;

const MULTIPLEX_TIMEOUT: Duration = Duration::from_millis(64);
const DEVICE_DIR: &str = "/dev/input";

/// Replugged nodes briefly appear owned root:root with restrictive
/// permissions until udev has applied its rules; poll in small steps
/// until the node is usable, within a fixed budget.
const NODE_WAIT_STEP: Duration = Duration::from_micros(100);
const NODE_WAIT_BUDGET: Duration = Duration::from_secs(5);

pub struct InputDaemon {
    kbds: Arc<Mutex<Vec<Keyboard>>>,
    active: Arc<Mutex<Vec<usize>>>,
    pending: Arc<Mutex<Vec<usize>>>,
    passthrough: Arc<PassthroughRegistry>,
    emitter: UinputKeyboard,
    peer: PeerChannel,
    mux: Multiplexer,
    keys_fsw: FsWatcher,
    input_fsw: FsWatcher,
    keys_dir: PathBuf,
    socket_timeout: Duration,
}

impl InputDaemon {
    pub fn new(args: &ValidatedArgs) -> Result<Self> {
        let paths = if args.devices.is_empty() {
            oskbd::detect_keyboards()
        } else {
            args.devices.clone()
        };
        if paths.is_empty() {
            bail!(
                "no keyboard devices found; pass --kbd-device or check that \
                 the daemon user is in the `input` group"
            );
        }

        let mut kbds = Vec::with_capacity(paths.len());
        for path in &paths {
            match Keyboard::open(path) {
                Ok(kbd) => {
                    info!("registered keyboard: {} @ {}", kbd.name(), kbd.phys());
                    kbds.push(kbd);
                }
                Err(e) => error!("failed to open {}: {e}", path.display()),
            }
        }
        if kbds.is_empty() {
            bail!("could not open any of the configured keyboard devices");
        }

        let emitter = UinputKeyboard::new(args.event_delay).context(
            "failed to create the uinput device; check that the daemon user \
             is in the `uinput` group",
        )?;
        let peer = PeerChannel::connect(&args.socket_path).with_context(|| {
            format!(
                "failed to reach the macro daemon at {}",
                args.socket_path.display()
            )
        })?;

        Ok(Self {
            kbds: Arc::new(Mutex::new(kbds)),
            active: Arc::new(Mutex::new(Vec::new())),
            pending: Arc::new(Mutex::new(Vec::new())),
            passthrough: Arc::new(PassthroughRegistry::new()),
            emitter,
            peer,
            mux: Multiplexer::new()?,
            keys_fsw: FsWatcher::new()?,
            input_fsw: FsWatcher::new()?,
            keys_dir: args.keys_dir.clone(),
            socket_timeout: Duration::from_millis(args.socket_timeout),
        })
    }

    pub fn run(&mut self) -> Result<()> {
        self.grab_all();
        self.start_passthrough_watch();
        self.start_hotplug_watch();
        sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;
        info!("entering the event loop");
        loop {
            self.dispatch_one()?;
        }
    }

    fn grab_all(&mut self) {
        let mut kbds = self.kbds.lock();
        let mut active = Vec::new();
        let mut pending = Vec::new();
        for (idx, kbd) in kbds.iter_mut().enumerate() {
            info!(
                "attempting to get a lock on device: {} @ {}",
                kbd.name(),
                kbd.phys()
            );
            match kbd.lock() {
                Ok(()) => {}
                Err(KeyboardError::DeviceBusy) => warn!(
                    "{} is grabbed elsewhere, will lock it on its first event",
                    kbd.name()
                ),
                Err(e) => {
                    error!("failed to grab {}: {e}", kbd.name());
                    kbd.disable();
                }
            }
            if kbd.state() == KbdState::Disabled {
                pending.push(idx);
            } else {
                active.push(idx);
            }
        }
        drop(kbds);
        *self.active.lock() = active;
        *self.pending.lock() = pending;
    }

    fn start_passthrough_watch(&mut self) {
        let registry = self.passthrough.clone();
        self.keys_fsw.begin(move |ev: FsEvent| {
            if ev.path.extension().map_or(true, |ext| ext != "csv") {
                return;
            }
            info!("passthrough file change on: {}", ev.path.display());
            match ev.kind {
                FsEventKind::Created | FsEventKind::Modified => registry.load(&ev.path),
                FsEventKind::Removed => registry.unload(&ev.path),
            }
        });
        if let Err(e) = self.keys_fsw.add_from(&self.keys_dir) {
            warn!(
                "cannot watch passthrough directory {}: {e}; no keys will reach the macro daemon",
                self.keys_dir.display()
            );
        }
    }

    fn start_hotplug_watch(&mut self) {
        let kbds = self.kbds.clone();
        let active = self.active.clone();
        let pending = self.pending.clone();
        let input_gid = match Group::from_name("input") {
            Ok(Some(group)) => Some(group.gid.as_raw()),
            _ => {
                warn!("no `input` group on this system, skipping the group check on hotplug");
                None
            }
        };
        self.input_fsw.begin(move |ev: FsEvent| {
            if ev.kind != FsEventKind::Created || ev.path.as_os_str() == DEVICE_DIR {
                return;
            }
            if pending.lock().is_empty() {
                return;
            }
            info!("input device hotplug event on: {}", ev.path.display());
            if !wait_for_node(&ev.path, input_gid) {
                return;
            }
            let candidates: Vec<usize> = pending.lock().clone();
            for idx in candidates {
                let mut kbds_guard = kbds.lock();
                let kbd = &mut kbds_guard[idx];
                if !kbd.matches(&ev.path) {
                    continue;
                }
                if let Err(e) = kbd.reset(&ev.path) {
                    warn!("cannot take over {}: {e}", ev.path.display());
                    continue;
                }
                if let Err(e) = kbd.lock() {
                    error!("unable to lock replugged keyboard {}: {e}", kbd.name());
                    continue;
                }
                info!("keyboard was plugged back in: {}", kbd.name());
                drop(kbds_guard);
                active.lock().push(idx);
                pending.lock().retain(|&i| i != idx);
                break;
            }
        });
        if let Err(e) = self.input_fsw.add(Path::new(DEVICE_DIR)) {
            warn!("cannot watch {DEVICE_DIR}, replugged keyboards will stay dead: {e}");
        }
    }

    fn dispatch_one(&mut self) -> Result<()> {
        let snapshot: Vec<usize> = self.active.lock().clone();
        let mut fds = Vec::with_capacity(snapshot.len());
        let mut queued = None;
        {
            let kbds = self.kbds.lock();
            for &idx in &snapshot {
                if queued.is_none() && kbds[idx].has_queued() {
                    queued = Some(idx);
                }
                if let Some(fd) = kbds[idx].fd() {
                    fds.push((idx, fd));
                }
            }
        }
        let ready = match queued {
            Some(idx) => Some(idx),
            None => {
                let raw: Vec<_> = fds.iter().map(|&(_, fd)| fd).collect();
                self.mux
                    .wait(&raw, MULTIPLEX_TIMEOUT)?
                    .map(|pos| fds[pos].0)
            }
        };
        let Some(idx) = ready else {
            return Ok(());
        };

        let read = {
            let mut kbds = self.kbds.lock();
            let kbd = &mut kbds[idx];
            match kbd.read_one() {
                Ok(ev) => Ok((ev, kbd.state())),
                Err(e) => Err((e, kbd.name().to_string())),
            }
        };
        let (event, state) = match read {
            Ok(ok) => ok,
            Err((e, name)) => {
                error!("read error on {name}, assuming it was unplugged: {e}");
                self.retire(idx);
                return Ok(());
            }
        };

        // An event that arrives before the grab is in place was seen by
        // other consumers too; discard it and take the lock instead.
        if state != KbdState::Locked {
            let mut kbds = self.kbds.lock();
            match kbds[idx].lock() {
                Ok(()) => info!("locked keyboard: {}", kbds[idx].name()),
                Err(KeyboardError::DeviceBusy) => {
                    warn!("{} is still grabbed elsewhere", kbds[idx].name())
                }
                Err(e) => {
                    error!("cannot lock {}: {e}", kbds[idx].name());
                    kbds[idx].disable();
                    drop(kbds);
                    self.retire(idx);
                }
            }
            return Ok(());
        }

        if !self.passthrough.contains(event.code) {
            self.emitter.emit(event)?;
            self.emitter.flush()?;
            return Ok(());
        }

        match self.peer.exchange(event, self.socket_timeout) {
            Ok(replies) if replies.is_empty() => {
                debug!("macro daemon swallowed the event");
            }
            Ok(replies) => {
                for reply in replies {
                    self.emitter.emit(reply)?;
                }
                self.emitter.flush()?;
            }
            Err(e) => {
                warn!("lost contact with the macro daemon: {e}");
                self.recover(event)?;
            }
        }
        Ok(())
    }

    /// Moves a dead keyboard out of the active set and onto the replug list.
    fn retire(&self, idx: usize) {
        self.active.lock().retain(|&i| i != idx);
        self.pending.lock().push(idx);
    }

    /// The connection died mid-exchange. Emit the event that triggered the
    /// exchange so the keystroke is not lost, release everything the
    /// synthetic device still holds, and hand the raw devices back to the
    /// user while the connection is re-dialed. Whatever happens here, the
    /// user must end up able to type with no synthetic key stuck down.
    fn recover(&mut self, original: KeyEvent) -> Result<()> {
        self.emitter.emit(original)?;
        self.emitter.release_all();
        self.emitter.flush()?;
        // Second round of releases: some compositors coalesce the first.
        self.emitter.release_all();
        self.emitter.flush()?;

        let snapshot: Vec<usize> = self.active.lock().clone();
        {
            let mut kbds = self.kbds.lock();
            for &idx in &snapshot {
                info!(
                    "unlocking keyboard during reconnect: {} @ {}",
                    kbds[idx].name(),
                    kbds[idx].phys()
                );
                if let Err(e) = kbds[idx].unlock() {
                    error!("unable to unlock {}: {e}", kbds[idx].name());
                    kbds[idx].disable();
                }
            }
        }

        self.peer
            .reconnect()
            .context("could not re-establish the macro daemon connection")?;

        let mut lost = Vec::new();
        {
            let mut kbds = self.kbds.lock();
            for &idx in &snapshot {
                if kbds[idx].state() == KbdState::Disabled {
                    lost.push(idx);
                    continue;
                }
                if let Err(e) = kbds[idx].lock() {
                    error!("unable to re-lock {}: {e}", kbds[idx].name());
                    kbds[idx].disable();
                    lost.push(idx);
                }
            }
        }
        for idx in lost {
            self.retire(idx);
        }
        Ok(())
    }
}

fn wait_for_node(path: &Path, input_gid: Option<u32>) -> bool {
    let start = Instant::now();
    loop {
        thread::sleep(NODE_WAIT_STEP);
        if let Ok(md) = fs::metadata(path) {
            if !md.file_type().is_char_device() {
                debug!("{} is not a character device", path.display());
                return false;
            }
            let group_rw = md.mode() & 0o060 == 0o060;
            let group_ok = input_gid.map_or(true, |gid| md.gid() == gid);
            if group_rw && group_ok {
                return true;
            }
        }
        if start.elapsed() > NODE_WAIT_BUDGET {
            error!(
                "timed out waiting for usable permissions on {}",
                path.display()
            );
            return false;
        }
    }
}
