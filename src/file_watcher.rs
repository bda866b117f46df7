//! Filesystem watching for passthrough files and device hotplug.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::error;
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Clone)]
pub struct FsEvent {
    pub path: PathBuf,
    pub kind: FsEventKind,
}

/// A watcher plus the thread that delivers its events. Watched paths and
/// the initial directory scan feed one channel, so callers register files
/// the same way whether they existed at startup or appeared later.
pub struct FsWatcher {
    watcher: RecommendedWatcher,
    tx: Sender<FsEvent>,
    rx: Option<Receiver<FsEvent>>,
    #[allow(dead_code)] // keeps the delivery thread alive for the process lifetime
    worker: Option<JoinHandle<()>>,
}

impl FsWatcher {
    pub fn new() -> notify::Result<Self> {
        let (tx, rx) = unbounded();
        let event_tx = tx.clone();
        let watcher = recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let kind = match event.kind {
                    EventKind::Create(_) => FsEventKind::Created,
                    EventKind::Modify(_) => FsEventKind::Modified,
                    EventKind::Remove(_) => FsEventKind::Removed,
                    _ => return,
                };
                for path in event.paths {
                    let _ = event_tx.send(FsEvent { path, kind });
                }
            }
            Err(e) => error!("filesystem watch failed: {e}"),
        })?;
        Ok(Self {
            watcher,
            tx,
            rx: Some(rx),
            worker: None,
        })
    }

    pub fn add(&mut self, path: &Path) -> notify::Result<()> {
        self.watcher.watch(path, RecursiveMode::NonRecursive)
    }

    /// Watches `dir` and reports every entry already in it as a synthetic
    /// `Created` event.
    pub fn add_from(&mut self, dir: &Path) -> anyhow::Result<()> {
        let dir = fs::canonicalize(dir)?;
        self.watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_file() {
                let _ = self.tx.send(FsEvent {
                    path,
                    kind: FsEventKind::Created,
                });
            }
        }
        Ok(())
    }

    /// Starts delivering events to `callback` on a dedicated thread. The
    /// callback is responsible for its own synchronization.
    pub fn begin<F>(&mut self, mut callback: F)
    where
        F: FnMut(FsEvent) + Send + 'static,
    {
        let rx = self.rx.take().expect("watcher already started");
        self.worker = Some(thread::spawn(move || {
            for event in rx.iter() {
                callback(event);
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    fn tempdir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("hawck-fsw-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn collecting_watcher() -> (FsWatcher, Receiver<FsEvent>) {
        let mut fsw = FsWatcher::new().unwrap();
        let (tx, rx) = unbounded();
        fsw.begin(move |ev| {
            let _ = tx.send(ev);
        });
        (fsw, rx)
    }

    fn wait_for(rx: &Receiver<FsEvent>, mut pred: impl FnMut(&FsEvent) -> bool) -> bool {
        let deadline = Duration::from_secs(2);
        while let Ok(ev) = rx.recv_timeout(deadline) {
            if pred(&ev) {
                return true;
            }
        }
        false
    }

    #[test]
    fn initial_scan_reports_existing_entries_as_created() {
        let dir = tempdir("scan");
        fs::write(dir.join("a.csv"), "key_code\n").unwrap();
        fs::write(dir.join("b.csv"), "key_code\n").unwrap();

        let (mut fsw, rx) = collecting_watcher();
        fsw.add_from(&dir).unwrap();

        let mut seen = HashSet::new();
        for _ in 0..2 {
            let ev = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(ev.kind, FsEventKind::Created);
            seen.insert(ev.path.file_name().unwrap().to_owned());
        }
        assert!(seen.contains(std::ffi::OsStr::new("a.csv")));
        assert!(seen.contains(std::ffi::OsStr::new("b.csv")));
    }

    #[test]
    fn live_create_and_remove_are_observed() {
        let dir = tempdir("live");
        let (mut fsw, rx) = collecting_watcher();
        fsw.add_from(&dir).unwrap();

        let file = dir.join("c.csv");
        fs::write(&file, "key_code\n42\n").unwrap();
        assert!(wait_for(&rx, |ev| {
            ev.kind == FsEventKind::Created && ev.path.file_name().unwrap() == "c.csv"
        }));

        fs::remove_file(&file).unwrap();
        assert!(wait_for(&rx, |ev| {
            ev.kind == FsEventKind::Removed && ev.path.file_name().unwrap() == "c.csv"
        }));
    }
}
