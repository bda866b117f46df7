//! Merged allow-list of the key codes that may cross to the macro daemon.
//!
//! Every CSV file in the keys directory contributes one source of codes;
//! the registry answers point queries against the union of all live
//! sources. Files are re-read on change and forgotten on delete.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use log::{error, info};
use nix::unistd::Uid;
use parking_lot::Mutex;

type HashMap<K, V> = rustc_hash::FxHashMap<K, V>;
type HashSet<T> = rustc_hash::FxHashSet<T>;

const KEY_CODE_COLUMN: &str = "key_code";

/// Whitelist files must be plainly readable but only writable by the
/// daemon user itself, so no other account can widen the set of keys that
/// reach the scripting side.
const REQUIRED_MODE: u32 = 0o644;

#[derive(Default)]
pub struct PassthroughRegistry {
    inner: Mutex<Sources>,
}

#[derive(Default)]
struct Sources {
    sources: HashMap<PathBuf, HashSet<u16>>,
    merged: HashSet<u16>,
}

impl Sources {
    fn remove(&mut self, path: &Path) {
        if self.sources.remove(path).is_some() {
            info!("removing passthrough keys from: {}", path.display());
            // Re-union the survivors; a code listed by another file stays.
            self.merged = self.sources.values().flatten().copied().collect();
        }
    }

    fn install(&mut self, path: PathBuf, codes: HashSet<u16>) {
        self.merged.extend(codes.iter().copied());
        self.sources.insert(path, codes);
    }
}

impl PassthroughRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads (or reloads) one whitelist file. A reload replaces the file's
    /// previous contribution outright. Rejected or unreadable files are
    /// logged and skipped; they never take the daemon down.
    pub fn load(&self, path: &Path) {
        let path = match fs::canonicalize(path) {
            Ok(p) => p,
            Err(e) => {
                error!("unable to resolve '{}': {e}", path.display());
                return;
            }
        };
        let mut inner = self.inner.lock();
        inner.remove(&path);
        match permissions_ok(&path) {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    "invalid permissions for '{}': require mode 0644 and daemon-user ownership",
                    path.display()
                );
                return;
            }
            Err(e) => {
                error!("unable to stat '{}': {e}", path.display());
                return;
            }
        }
        match parse_key_codes(&path) {
            Ok(codes) => {
                info!(
                    "loaded {} passthrough keys from: {}",
                    codes.len(),
                    path.display()
                );
                inner.install(path, codes);
            }
            Err(e) => error!("unable to load key codes from '{}': {e}", path.display()),
        }
    }

    pub fn unload(&self, path: &Path) {
        let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_owned());
        self.inner.lock().remove(&path);
    }

    pub fn contains(&self, code: u16) -> bool {
        self.inner.lock().merged.contains(&code)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().merged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn permissions_ok(path: &Path) -> std::io::Result<bool> {
    let md = fs::metadata(path)?;
    Ok(md.mode() & 0o7777 == REQUIRED_MODE && md.uid() == Uid::current().as_raw())
}

fn parse_key_codes(path: &Path) -> Result<HashSet<u16>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)?;
    let Some(column) = rdr
        .headers()?
        .iter()
        .position(|h| h == KEY_CODE_COLUMN)
    else {
        bail!("no '{KEY_CODE_COLUMN}' column");
    };
    let mut codes = HashSet::default();
    for record in rdr.records() {
        let record = record?;
        let Some(cell) = record.get(column) else {
            continue;
        };
        // Cells that don't parse are skipped rather than failing the file.
        let Ok(value) = cell.parse::<i32>() else {
            continue;
        };
        if (0..=i32::from(u16::MAX)).contains(&value) {
            codes.insert(value as u16);
        }
    }
    Ok(codes)
}
