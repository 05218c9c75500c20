//! Coalescing activity log for one volume session.
//!
//! Raw filesystem notifications are noisy: a single copy produces a create
//! followed by several flush-modifies and, on backends that report it, a
//! close-after-write. `ActivityLog` folds those into one meaningful line each
//! and keeps a running byte total. It is pure: callers supply the observation
//! time and the file size read at event time.
//!
//! A Created entry stays unsettled until its writer closes the file. Until
//! then, flushes inside the coalescing window and the final close update the
//! entry's size in place instead of producing new lines.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, TimeDelta};

use super::format::format_size;

/// Raw event as delivered by the watch thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub kind: FsEventKind,
    pub path: PathBuf,
    /// Size observed when the event was handled; `None` if the path was gone.
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEventKind {
    Create { is_dir: bool },
    Modify { is_dir: bool },
    Remove,
    Rename { to: PathBuf },
    /// A writer closed the file; `size` is final.
    WriteClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Created,
    CreatedDirectory,
    Modified,
    Deleted,
    Renamed,
}

/// One logged line (plus running total for byte-accounted kinds).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEvent {
    pub timestamp: DateTime<Local>,
    pub kind: ActivityKind,
    pub path: PathBuf,
    pub dest: Option<PathBuf>,
    pub size: Option<u64>,
    /// Running total after this event, for Created/Modified.
    pub total_after: Option<u64>,
}

impl ActivityEvent {
    fn render(&self, out: &mut Vec<String>) {
        let ts = self.timestamp.format("%Y-%m-%d %H:%M:%S");
        let path = self.path.display();
        let line = match self.kind {
            ActivityKind::Created => format!(
                "[{}] Created: {}, Size: {}",
                ts,
                path,
                format_size(self.size.unwrap_or(0))
            ),
            ActivityKind::Modified => format!(
                "[{}] Modified: {}, Size: {}",
                ts,
                path,
                format_size(self.size.unwrap_or(0))
            ),
            ActivityKind::CreatedDirectory => format!("[{}] Created directory: {}", ts, path),
            ActivityKind::Deleted => format!("[{}] Deleted: {}", ts, path),
            ActivityKind::Renamed => format!(
                "[{}] Changed: from {} to {}",
                ts,
                path,
                self.dest
                    .as_ref()
                    .map(|d| d.display().to_string())
                    .unwrap_or_default()
            ),
        };
        out.push(line);

        if let Some(total) = self.total_after {
            out.push(format!("Total transferred: {}", format_size(total)));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Seen {
    Created,
    Modified,
}

#[derive(Debug, Clone, Copy)]
struct Tracked {
    at: DateTime<Local>,
    size: u64,
    seen: Seen,
    /// Index of the Created entry whose size is not final yet.
    unsettled: Option<usize>,
}

#[derive(Debug)]
pub struct ActivityLog {
    window: TimeDelta,
    total: u64,
    events: Vec<ActivityEvent>,
    tracked: HashMap<PathBuf, Tracked>,
}

impl ActivityLog {
    /// `window` is how long after a create further writes count as part of it.
    pub fn new(window: TimeDelta) -> Self {
        Self {
            window,
            total: 0,
            events: Vec::new(),
            tracked: HashMap::new(),
        }
    }

    pub fn total_transferred(&self) -> u64 {
        self.total
    }

    pub fn events(&self) -> &[ActivityEvent] {
        &self.events
    }

    /// Number of text lines the log currently renders to.
    pub fn line_count(&self) -> usize {
        self.events
            .iter()
            .map(|e| if e.total_after.is_some() { 2 } else { 1 })
            .sum()
    }

    /// Classify and coalesce one raw event. Returns true if it produced a log entry.
    pub fn record(&mut self, event: FsEvent, now: DateTime<Local>) -> bool {
        match event.kind {
            FsEventKind::Create { is_dir: true } => {
                self.push(now, ActivityKind::CreatedDirectory, event.path, None, None);
                true
            }
            FsEventKind::Create { is_dir: false } => {
                let size = event.size.unwrap_or(0);
                self.on_create(event.path, size, now)
            }
            FsEventKind::Modify { is_dir: true } => false,
            FsEventKind::Modify { is_dir: false } => match event.size {
                Some(size) => self.on_modify(event.path, size, now),
                // vanished before it could be sized; the delete will follow
                None => false,
            },
            FsEventKind::Remove => {
                self.tracked.remove(&event.path);
                self.push(now, ActivityKind::Deleted, event.path, None, None);
                true
            }
            FsEventKind::Rename { to } => {
                if let Some(tracked) = self.tracked.remove(&event.path) {
                    self.tracked.insert(to.clone(), tracked);
                }
                self.push(now, ActivityKind::Renamed, event.path, Some(to), None);
                true
            }
            FsEventKind::WriteClosed => {
                if let Some(size) = event.size {
                    self.on_write_closed(&event.path, size);
                }
                false
            }
        }
    }

    fn on_create(&mut self, path: PathBuf, size: u64, now: DateTime<Local>) -> bool {
        if let Some(prev) = self.tracked.get(&path).copied() {
            if prev.seen == Seen::Created && now - prev.at < self.window {
                // Second stage of the same write
                if prev.size == size {
                    return false;
                }
                self.account(ActivityKind::Modified, path, size, now);
                return true;
            }
        }

        self.total += size;
        self.tracked.insert(
            path.clone(),
            Tracked {
                at: now,
                size,
                seen: Seen::Created,
                unsettled: Some(self.events.len()),
            },
        );
        self.push(now, ActivityKind::Created, path, None, Some(size));
        true
    }

    fn on_modify(&mut self, path: PathBuf, size: u64, now: DateTime<Local>) -> bool {
        if let Some(prev) = self.tracked.get(&path).copied() {
            let flush_after_create = prev.seen == Seen::Created && now - prev.at < self.window;
            if flush_after_create {
                // Window stays anchored at the create
                if let Some(index) = prev.unsettled {
                    self.settle(index, prev.size, size);
                }
                self.tracked.insert(path, Tracked { size, ..prev });
                return false;
            }
            if prev.size == size {
                return false;
            }
        }

        self.account(ActivityKind::Modified, path, size, now);
        true
    }

    fn on_write_closed(&mut self, path: &Path, size: u64) {
        let Some(tracked) = self.tracked.get_mut(path) else {
            return;
        };
        let Some(index) = tracked.unsettled.take() else {
            return;
        };
        let previous = tracked.size;
        tracked.size = size;
        self.settle(index, previous, size);
    }

    /// Replace the size of the Created entry at `index`, shifting the running
    /// total of it and of every accounted entry after it.
    fn settle(&mut self, index: usize, previous: u64, size: u64) {
        if previous == size {
            return;
        }
        self.total = self.total - previous + size;
        if let Some(created) = self.events.get_mut(index) {
            created.size = Some(size);
        }
        for event in &mut self.events[index..] {
            if let Some(total) = event.total_after.as_mut() {
                *total = *total - previous + size;
            }
        }
    }

    fn account(&mut self, kind: ActivityKind, path: PathBuf, size: u64, now: DateTime<Local>) {
        self.total += size;
        self.tracked.insert(
            path.clone(),
            Tracked {
                at: now,
                size,
                seen: Seen::Modified,
                unsettled: None,
            },
        );
        self.push(now, kind, path, None, Some(size));
    }

    fn push(
        &mut self,
        timestamp: DateTime<Local>,
        kind: ActivityKind,
        path: PathBuf,
        dest: Option<PathBuf>,
        size: Option<u64>,
    ) {
        let total_after = size.map(|_| self.total);
        self.events.push(ActivityEvent {
            timestamp,
            kind,
            path,
            dest,
            size,
            total_after,
        });
    }

    /// Newline-joined text of every entry, in arrival order.
    pub fn render(&self) -> String {
        let mut lines = Vec::with_capacity(self.line_count());
        for event in &self.events {
            event.render(&mut lines);
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const MB: u64 = 1024 * 1024;

    fn t0() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn secs(n: i64) -> DateTime<Local> {
        t0() + TimeDelta::seconds(n)
    }

    fn log() -> ActivityLog {
        ActivityLog::new(TimeDelta::seconds(5))
    }

    fn create(path: &str, size: u64) -> FsEvent {
        FsEvent {
            kind: FsEventKind::Create { is_dir: false },
            path: PathBuf::from(path),
            size: Some(size),
        }
    }

    fn modify(path: &str, size: u64) -> FsEvent {
        FsEvent {
            kind: FsEventKind::Modify { is_dir: false },
            path: PathBuf::from(path),
            size: Some(size),
        }
    }

    #[test]
    fn test_create_logs_size_and_total() {
        let mut log = log();
        assert!(log.record(create("/media/usb0/file", 40 * MB), t0()));

        assert_eq!(
            log.render(),
            "[2024-05-01 10:00:00] Created: /media/usb0/file, Size: 40.0 MB\n\
             Total transferred: 40.0 MB"
        );
        assert_eq!(log.total_transferred(), 40 * MB);
    }

    #[test]
    fn test_directory_create_has_no_byte_accounting() {
        let mut log = log();
        log.record(
            FsEvent {
                kind: FsEventKind::Create { is_dir: true },
                path: PathBuf::from("/m/photos"),
                size: Some(4096),
            },
            t0(),
        );

        assert_eq!(log.render(), "[2024-05-01 10:00:00] Created directory: /m/photos");
        assert_eq!(log.total_transferred(), 0);
    }

    #[test]
    fn test_modify_within_window_of_create_is_suppressed() {
        let mut log = log();
        log.record(create("/m/a.bin", 100), t0());
        let lines = log.line_count();

        assert!(!log.record(modify("/m/a.bin", 2048), secs(3)));

        assert_eq!(log.line_count(), lines);
        // The flush belongs to the create and settles its size
        assert_eq!(log.total_transferred(), 2048);
        assert_eq!(log.events()[0].size, Some(2048));
    }

    #[test]
    fn test_growing_file_stays_folded_into_create() {
        let mut log = log();
        log.record(create("/m/big.iso", 0), t0());

        assert!(!log.record(modify("/m/big.iso", 10 * MB), secs(1)));
        assert!(!log.record(modify("/m/big.iso", 20 * MB), secs(4)));
        // Window is measured from the create, not the last flush
        assert!(log.record(modify("/m/big.iso", 30 * MB), secs(6)));
    }

    fn closed(path: &str, size: u64) -> FsEvent {
        FsEvent {
            kind: FsEventKind::WriteClosed,
            path: PathBuf::from(path),
            size: Some(size),
        }
    }

    #[test]
    fn test_copy_settles_created_size_on_close() {
        let mut log = log();
        log.record(create("/media/usb0/file", 0), t0());
        log.record(modify("/media/usb0/file", 8 * MB), secs(1));
        assert!(!log.record(closed("/media/usb0/file", 40 * MB), secs(2)));

        assert_eq!(
            log.render(),
            "[2024-05-01 10:00:00] Created: /media/usb0/file, Size: 40.0 MB\n\
             Total transferred: 40.0 MB"
        );
        assert_eq!(log.total_transferred(), 40 * MB);
    }

    #[test]
    fn test_settling_shifts_later_totals() {
        let mut log = log();
        log.record(create("/m/a.bin", 0), t0());
        log.record(create("/m/b.bin", MB), secs(1));
        log.record(closed("/m/a.bin", 2 * MB), secs(2));

        let text = log.render();
        assert!(text.contains("Created: /m/a.bin, Size: 2.0 MB\nTotal transferred: 2.0 MB"));
        assert!(text.ends_with("Created: /m/b.bin, Size: 1.0 MB\nTotal transferred: 3.0 MB"));
        assert_eq!(log.total_transferred(), 3 * MB);
    }

    #[test]
    fn test_close_after_settled_or_untracked_is_ignored() {
        let mut log = log();
        log.record(create("/m/a.bin", 100), t0());
        log.record(closed("/m/a.bin", 100), secs(1));
        // Rewritten later: the Modified entry carries the size, not the create
        log.record(modify("/m/a.bin", 300), secs(30));
        log.record(closed("/m/a.bin", 300), secs(30));
        log.record(closed("/m/never-created", 999), secs(31));

        assert_eq!(log.total_transferred(), 400);
        assert_eq!(log.events().len(), 2);
        assert_eq!(log.events()[0].size, Some(100));
    }

    #[test]
    fn test_modify_with_unchanged_size_is_suppressed() {
        let mut log = log();
        log.record(create("/m/a.bin", 100), t0());
        log.record(modify("/m/a.bin", 100), secs(10));
        let lines = log.line_count();

        assert!(!log.record(modify("/m/a.bin", 100), secs(20)));
        assert_eq!(log.line_count(), lines);
    }

    #[test]
    fn test_genuine_modify_is_logged() {
        let mut log = log();
        log.record(create("/m/a.bin", 1024), t0());

        assert!(log.record(modify("/m/a.bin", 2048), secs(30)));

        assert_eq!(log.total_transferred(), 3072);
        let text = log.render();
        assert!(text.contains("Modified: /m/a.bin, Size: 2.0 KB"));
        assert!(text.ends_with("Total transferred: 3.0 KB"));
    }

    #[test]
    fn test_untracked_modify_is_logged() {
        let mut log = log();
        assert!(log.record(modify("/m/existing.doc", 1536), t0()));
        assert!(log.render().contains("Modified: /m/existing.doc, Size: 1.5 KB"));
    }

    #[test]
    fn test_repeated_create_with_same_size_is_one_line() {
        let mut log = log();
        log.record(create("/m/video.mp4", 40 * MB), t0());
        assert!(!log.record(create("/m/video.mp4", 40 * MB), secs(2)));

        let text = log.render();
        assert_eq!(text.matches("Created:").count(), 1);
        assert_eq!(log.total_transferred(), 40 * MB);
    }

    #[test]
    fn test_repeated_create_with_new_size_counts_as_modify() {
        let mut log = log();
        log.record(create("/m/video.mp4", 10 * MB), t0());
        assert!(log.record(create("/m/video.mp4", 40 * MB), secs(2)));

        let text = log.render();
        assert_eq!(text.matches("Created:").count(), 1);
        assert!(text.contains("Modified: /m/video.mp4, Size: 40.0 MB"));
        assert_eq!(log.total_transferred(), 50 * MB);
    }

    #[test]
    fn test_delete_drops_tracking() {
        let mut log = log();
        log.record(create("/m/a.bin", 100), t0());
        log.record(
            FsEvent {
                kind: FsEventKind::Remove,
                path: PathBuf::from("/m/a.bin"),
                size: None,
            },
            secs(1),
        );

        // Recreated straight away: tracked state is gone, so this is a fresh create
        assert!(log.record(create("/m/a.bin", 100), secs(2)));
        assert_eq!(log.render().matches("Created:").count(), 2);
        assert!(log.render().contains("Deleted: /m/a.bin"));
    }

    #[test]
    fn test_rename_carries_bookkeeping() {
        let mut log = log();
        log.record(create("/m/tmp.part", 500), t0());
        log.record(
            FsEvent {
                kind: FsEventKind::Rename {
                    to: PathBuf::from("/m/final.iso"),
                },
                path: PathBuf::from("/m/tmp.part"),
                size: None,
            },
            secs(1),
        );

        // Flush on the new name is still inside the create window
        assert!(!log.record(modify("/m/final.iso", 900), secs(2)));
        assert!(log.render().contains("Changed: from /m/tmp.part to /m/final.iso"));
    }

    #[test]
    fn test_vanished_file_modify_is_ignored() {
        let mut log = log();
        assert!(!log.record(
            FsEvent {
                kind: FsEventKind::Modify { is_dir: false },
                path: PathBuf::from("/m/gone"),
                size: None,
            },
            t0(),
        ));
        assert!(log.events().is_empty());
    }
}
