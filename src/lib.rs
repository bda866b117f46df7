//! hawck-inputd: the privileged keyboard half of the Hawck input
//! automation system.
//!
//! The daemon grabs evdev keyboard devices exclusively, filters their
//! events through a CSV-defined passthrough allow-list, round-trips
//! whitelisted events to the unprivileged macro daemon over a Unix socket
//! and re-emits the results on a synthetic uinput keyboard. Keys outside
//! the allow-list never leave this process.

use std::path::PathBuf;

pub mod comm;
pub mod daemon;
pub mod file_watcher;
pub mod oskbd;
pub mod passthrough;

pub use daemon::InputDaemon;

pub struct ValidatedArgs {
    pub devices: Vec<PathBuf>,
    pub socket_path: PathBuf,
    pub keys_dir: PathBuf,
    pub event_delay: u64,
    pub socket_timeout: u64,
    pub nodelay: bool,
}
