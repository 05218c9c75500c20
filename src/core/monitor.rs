//! Volume activity monitor: one per attached volume.
//!
//! `start` installs a recursive OS watch on the volume root and spawns a drain
//! thread that owns the [`ActivityLog`]. The notify callback only classifies
//! events and sizes files; the drain thread is the single writer of the log
//! and the byte counter. `stop` tears the watch down, joins the drain thread
//! and hands back the final log text.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{Local, TimeDelta};
use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error, info, warn};

use super::activity::{ActivityLog, FsEvent, FsEventKind};
use crate::error::{Result, TrackerError};
use crate::logging::LogThrottle;

/// Live counters published by the drain thread. Read-only for everyone else.
#[derive(Debug, Default)]
pub struct MonitorStats {
    bytes_transferred: AtomicU64,
    log_lines: AtomicU64,
}

impl MonitorStats {
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    pub fn log_lines(&self) -> u64 {
        self.log_lines.load(Ordering::Relaxed)
    }

    fn publish(&self, log: &ActivityLog) {
        self.bytes_transferred
            .store(log.total_transferred(), Ordering::Relaxed);
        self.log_lines
            .store(log.line_count() as u64, Ordering::Relaxed);
    }
}

/// Messages from the notify callback to the drain thread.
#[derive(Debug)]
enum WatchMsg {
    Fs(FsEvent),
    MovedFrom(PathBuf),
    MovedTo(FsEvent),
    Moved { from: PathBuf, to: PathBuf },
    Error(String),
    Shutdown,
}

enum State {
    Idle,
    Watching(Running),
    Stopped,
}

struct Running {
    watcher: RecommendedWatcher,
    control: mpsc::Sender<WatchMsg>,
    drain: JoinHandle<ActivityLog>,
}

pub struct VolumeMonitor {
    mount_id: String,
    window: TimeDelta,
    state: State,
    stats: Arc<MonitorStats>,
}

impl std::fmt::Debug for VolumeMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeMonitor")
            .field("mount_id", &self.mount_id)
            .field("state", &self.state_name())
            .finish()
    }
}

impl VolumeMonitor {
    pub fn new(mount_id: impl Into<String>, window: Duration) -> Self {
        Self {
            mount_id: mount_id.into(),
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::seconds(5)),
            state: State::Idle,
            stats: Arc::new(MonitorStats::default()),
        }
    }

    pub fn mount_id(&self) -> &str {
        &self.mount_id
    }

    pub fn stats(&self) -> Arc<MonitorStats> {
        self.stats.clone()
    }

    pub fn state_name(&self) -> &'static str {
        match self.state {
            State::Idle => "idle",
            State::Watching(_) => "watching",
            State::Stopped => "stopped",
        }
    }

    fn invalid(&self, action: &'static str) -> TrackerError {
        TrackerError::MonitorInvalidState {
            mount: self.mount_id.clone(),
            state: self.state_name(),
            action,
        }
    }

    /// Idle -> Watching. Begins a recursive watch on `root` with an empty log.
    pub fn start(&mut self, root: &Path) -> Result<()> {
        if !matches!(self.state, State::Idle) {
            return Err(self.invalid("start"));
        }

        let watch_err = |source: notify::Error| TrackerError::Watch {
            path: root.to_path_buf(),
            source,
        };

        let (tx, rx) = mpsc::channel();
        let callback_tx = tx.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for msg in classify(event) {
                        // Receiver gone means the monitor is shutting down
                        let _ = callback_tx.send(msg);
                    }
                }
                Err(e) => {
                    let _ = callback_tx.send(WatchMsg::Error(e.to_string()));
                }
            },
            Config::default(),
        )
        .map_err(watch_err)?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(watch_err)?;

        let window = self.window;
        let stats = self.stats.clone();
        stats.publish(&ActivityLog::new(window));
        let mount = self.mount_id.clone();

        let drain = std::thread::Builder::new()
            .name(format!("watch-{}", self.mount_id))
            .spawn(move || drain_loop(rx, window, stats, mount))
            .map_err(|e| watch_err(notify::Error::io(e)))?;

        info!(mount = %self.mount_id, root = %root.display(), "Monitoring started");

        self.state = State::Watching(Running {
            watcher,
            control: tx,
            drain,
        });
        Ok(())
    }

    /// Watching -> Stopped. Blocks until the drain thread has processed every
    /// queued event, then returns the newline-joined log.
    pub fn stop(&mut self) -> Result<String> {
        let running = match std::mem::replace(&mut self.state, State::Stopped) {
            State::Watching(running) => running,
            other => {
                self.state = other;
                return Err(self.invalid("stop"));
            }
        };

        let log = shutdown(running, &self.mount_id);
        info!(
            mount = %self.mount_id,
            bytes = log.total_transferred(),
            entries = log.events().len(),
            "Monitoring stopped"
        );
        Ok(log.render())
    }
}

impl Drop for VolumeMonitor {
    fn drop(&mut self) {
        if let State::Watching(running) = std::mem::replace(&mut self.state, State::Stopped) {
            debug!(mount = %self.mount_id, "Monitor dropped while watching");
            shutdown(running, &self.mount_id);
        }
    }
}

fn shutdown(running: Running, mount: &str) -> ActivityLog {
    let Running {
        watcher,
        control,
        drain,
    } = running;

    // Dropping the watcher ends OS delivery; Shutdown marks the end of the queue.
    drop(watcher);
    let _ = control.send(WatchMsg::Shutdown);
    drop(control);

    match drain.join() {
        Ok(log) => log,
        Err(_) => {
            error!(mount = %mount, "Watch drain thread panicked, activity log lost");
            ActivityLog::new(TimeDelta::zero())
        }
    }
}

fn drain_loop(
    rx: mpsc::Receiver<WatchMsg>,
    window: TimeDelta,
    stats: Arc<MonitorStats>,
    mount: String,
) -> ActivityLog {
    let mut log = ActivityLog::new(window);
    let mut renames = RenamePairer::default();
    let mut throttle = LogThrottle::new(Duration::from_secs(5));

    while let Ok(msg) = rx.recv() {
        let events = match msg {
            WatchMsg::Shutdown => break,
            WatchMsg::Error(e) => {
                if let Some(suppressed) = throttle.admit() {
                    warn!(mount = %mount, error = %e, suppressed, "Watch error");
                }
                continue;
            }
            other => renames.feed(other),
        };

        let now = Local::now();
        for event in events {
            log.record(event, now);
        }
        stats.publish(&log);
    }

    if let Some(event) = renames.flush() {
        log.record(event, Local::now());
        stats.publish(&log);
    }

    log
}

/// Turns split rename notifications into single rename events.
///
/// Some backends report a rename as `From` then `To`, others add a combined
/// `Both` after the halves. A `From` with no matching `To` left the volume and
/// counts as a delete; a lone `To` came from outside and counts as a create.
#[derive(Debug, Default)]
struct RenamePairer {
    pending_from: Option<PathBuf>,
    last_pair: Option<(PathBuf, PathBuf)>,
}

impl RenamePairer {
    fn feed(&mut self, msg: WatchMsg) -> Vec<FsEvent> {
        let mut out = Vec::new();
        match msg {
            WatchMsg::MovedFrom(path) => {
                out.extend(self.flush());
                self.pending_from = Some(path);
            }
            WatchMsg::MovedTo(event) => match self.pending_from.take() {
                Some(from) => {
                    self.last_pair = Some((from.clone(), event.path.clone()));
                    out.push(rename(from, event.path));
                }
                None => out.push(FsEvent {
                    kind: FsEventKind::Create {
                        is_dir: matches!(event.kind, FsEventKind::Create { is_dir: true }),
                    },
                    ..event
                }),
            },
            WatchMsg::Moved { from, to } => {
                let pair = (from, to);
                if self.last_pair.as_ref() != Some(&pair) {
                    out.extend(self.flush());
                    out.push(rename(pair.0, pair.1));
                }
                self.last_pair = None;
            }
            WatchMsg::Fs(event) => {
                out.extend(self.flush());
                self.last_pair = None;
                out.push(event);
            }
            WatchMsg::Error(_) | WatchMsg::Shutdown => {}
        }
        out
    }

    fn flush(&mut self) -> Option<FsEvent> {
        self.pending_from.take().map(|path| FsEvent {
            kind: FsEventKind::Remove,
            path,
            size: None,
        })
    }
}

fn rename(from: PathBuf, to: PathBuf) -> FsEvent {
    FsEvent {
        kind: FsEventKind::Rename { to },
        path: from,
        size: None,
    }
}

/// Size and directory flag of a path right now; `None` if it is already gone.
fn stat(path: &Path) -> Option<(u64, bool)> {
    std::fs::metadata(path).ok().map(|m| (m.len(), m.is_dir()))
}

fn classify(event: Event) -> Vec<WatchMsg> {
    let mut paths = event.paths.into_iter();

    match event.kind {
        EventKind::Create(kind) => paths
            .map(|path| {
                let meta = stat(&path);
                let is_dir = match kind {
                    CreateKind::Folder => true,
                    CreateKind::File => false,
                    _ => meta.map(|(_, d)| d).unwrap_or(false),
                };
                WatchMsg::Fs(FsEvent {
                    kind: FsEventKind::Create { is_dir },
                    size: meta.map(|(s, _)| s),
                    path,
                })
            })
            .collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => paths.map(WatchMsg::MovedFrom).collect(),
            RenameMode::To => paths
                .map(|path| {
                    let meta = stat(&path);
                    WatchMsg::MovedTo(FsEvent {
                        kind: FsEventKind::Create {
                            is_dir: meta.map(|(_, d)| d).unwrap_or(false),
                        },
                        size: meta.map(|(s, _)| s),
                        path,
                    })
                })
                .collect(),
            _ => match (paths.next(), paths.next()) {
                (Some(from), Some(to)) => vec![WatchMsg::Moved { from, to }],
                (Some(path), None) => match stat(&path) {
                    Some((size, is_dir)) => vec![WatchMsg::Fs(FsEvent {
                        kind: FsEventKind::Create { is_dir },
                        path,
                        size: Some(size),
                    })],
                    None => vec![WatchMsg::Fs(FsEvent {
                        kind: FsEventKind::Remove,
                        path,
                        size: None,
                    })],
                },
                _ => Vec::new(),
            },
        },
        EventKind::Modify(_) => paths
            .map(|path| {
                let meta = stat(&path);
                WatchMsg::Fs(FsEvent {
                    kind: FsEventKind::Modify {
                        is_dir: meta.map(|(_, d)| d).unwrap_or(false),
                    },
                    size: meta.map(|(s, _)| s),
                    path,
                })
            })
            .collect(),
        EventKind::Remove(_) => paths
            .map(|path| {
                WatchMsg::Fs(FsEvent {
                    kind: FsEventKind::Remove,
                    path,
                    size: None,
                })
            })
            .collect(),
        // Final size of a copy is only known once the writer closes it
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => paths
            .filter_map(|path| {
                let (size, is_dir) = stat(&path)?;
                (!is_dir).then(|| {
                    WatchMsg::Fs(FsEvent {
                        kind: FsEventKind::WriteClosed,
                        path,
                        size: Some(size),
                    })
                })
            })
            .collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn moved_to(path: &str) -> WatchMsg {
        WatchMsg::MovedTo(FsEvent {
            kind: FsEventKind::Create { is_dir: false },
            path: PathBuf::from(path),
            size: Some(10),
        })
    }

    #[test]
    fn test_stop_without_start_is_invalid_state() {
        let mut monitor = VolumeMonitor::new("E:", Duration::from_secs(5));
        let err = monitor.stop().unwrap_err();
        assert!(matches!(
            err,
            TrackerError::MonitorInvalidState { action: "stop", state: "idle", .. }
        ));
    }

    #[test]
    fn test_stop_twice_and_restart_are_invalid() {
        let temp = tempdir().unwrap();
        let mut monitor = VolumeMonitor::new("E:", Duration::from_secs(5));

        monitor.start(temp.path()).unwrap();
        assert_eq!(monitor.state_name(), "watching");
        assert!(matches!(
            monitor.start(temp.path()),
            Err(TrackerError::MonitorInvalidState { state: "watching", .. })
        ));

        monitor.stop().unwrap();
        assert!(matches!(
            monitor.stop(),
            Err(TrackerError::MonitorInvalidState { state: "stopped", .. })
        ));
        assert!(matches!(
            monitor.start(temp.path()),
            Err(TrackerError::MonitorInvalidState { action: "start", .. })
        ));
    }

    #[test]
    fn test_start_on_missing_root_fails() {
        let temp = tempdir().unwrap();
        let mut monitor = VolumeMonitor::new("F:", Duration::from_secs(5));

        let result = monitor.start(&temp.path().join("not-mounted"));

        assert!(matches!(result, Err(TrackerError::Watch { .. })));
        assert_eq!(monitor.state_name(), "idle");
    }

    #[test]
    fn test_idle_session_yields_empty_log() {
        let temp = tempdir().unwrap();
        let mut monitor = VolumeMonitor::new("E:", Duration::from_secs(5));

        monitor.start(temp.path()).unwrap();
        let log = monitor.stop().unwrap();

        assert_eq!(log, "");
    }

    #[test]
    fn test_records_file_created_on_volume() {
        let temp = tempdir().unwrap();
        let mut monitor = VolumeMonitor::new("E:", Duration::from_secs(5));
        monitor.start(temp.path()).unwrap();

        let file = temp.path().join("report.pdf");
        fs::write(&file, vec![0u8; 4096]).unwrap();
        std::thread::sleep(Duration::from_millis(500));

        let log = monitor.stop().unwrap();
        assert!(
            log.contains(&format!("Created: {}", file.display())),
            "unexpected log: {log}"
        );
        assert!(log.contains("Total transferred:"));
    }

    #[test]
    fn test_copied_file_logs_its_final_size() {
        use std::io::Write;

        let temp = tempdir().unwrap();
        let mut monitor = VolumeMonitor::new("E:", Duration::from_secs(5));
        monitor.start(temp.path()).unwrap();

        let path = temp.path().join("file");
        let mut file = fs::File::create(&path).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        let chunk = vec![0u8; 1024 * 1024];
        for _ in 0..40 {
            file.write_all(&chunk).unwrap();
        }
        drop(file);
        std::thread::sleep(Duration::from_millis(500));

        let log = monitor.stop().unwrap();
        assert!(
            log.contains(&format!("Created: {}, Size: 40.0 MB", path.display())),
            "unexpected log: {log}"
        );
        assert!(log.ends_with("Total transferred: 40.0 MB"), "unexpected log: {log}");
        assert_eq!(monitor.stats().bytes_transferred(), 40 * 1024 * 1024);
    }

    #[test]
    fn test_close_write_is_classified() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("done.bin");
        fs::write(&path, vec![0u8; 512]).unwrap();

        let msgs = classify(
            Event::new(EventKind::Access(AccessKind::Close(AccessMode::Write))).add_path(path.clone()),
        );

        assert!(matches!(
            msgs.as_slice(),
            [WatchMsg::Fs(FsEvent { kind: FsEventKind::WriteClosed, size: Some(512), .. })]
        ));
        let reads = classify(
            Event::new(EventKind::Access(AccessKind::Close(AccessMode::Read))).add_path(path),
        );
        assert!(reads.is_empty());
    }

    #[test]
    fn test_pairer_joins_from_and_to() {
        let mut pairer = RenamePairer::default();

        assert!(pairer.feed(WatchMsg::MovedFrom(PathBuf::from("/m/a"))).is_empty());
        let out = pairer.feed(moved_to("/m/b"));
        // Combined notification for the same rename is swallowed
        let dup = pairer.feed(WatchMsg::Moved {
            from: PathBuf::from("/m/a"),
            to: PathBuf::from("/m/b"),
        });

        assert_eq!(out, vec![rename(PathBuf::from("/m/a"), PathBuf::from("/m/b"))]);
        assert!(dup.is_empty());
    }

    #[test]
    fn test_pairer_unmatched_halves() {
        let mut pairer = RenamePairer::default();

        let lone_to = pairer.feed(moved_to("/m/incoming"));
        assert!(matches!(lone_to[0].kind, FsEventKind::Create { is_dir: false }));

        pairer.feed(WatchMsg::MovedFrom(PathBuf::from("/m/outgoing")));
        let next = pairer.feed(WatchMsg::Fs(FsEvent {
            kind: FsEventKind::Remove,
            path: PathBuf::from("/m/other"),
            size: None,
        }));
        assert_eq!(next.len(), 2);
        assert_eq!(next[0].kind, FsEventKind::Remove);
        assert_eq!(next[0].path, PathBuf::from("/m/outgoing"));

        pairer.feed(WatchMsg::MovedFrom(PathBuf::from("/m/last")));
        assert_eq!(pairer.flush().map(|e| e.path), Some(PathBuf::from("/m/last")));
    }

    #[test]
    fn test_stats_follow_log() {
        let mut log = ActivityLog::new(TimeDelta::seconds(5));
        log.record(
            FsEvent {
                kind: FsEventKind::Create { is_dir: false },
                path: PathBuf::from("/m/x"),
                size: Some(2048),
            },
            Local::now(),
        );
        let stats = MonitorStats::default();
        stats.publish(&log);

        assert_eq!(stats.bytes_transferred(), 2048);
        assert_eq!(stats.log_lines(), 2);
    }
}
