//! Directory tree snapshots taken when a volume attaches.
//!
//! The snapshot is a plain text rendering:
//!
//! ```text
//! E:
//! ├── DCIM
//! │   └── 100CANON
//! │       └── IMG_0001.JPG
//! └── notes.txt
//! ```
//!
//! Entries are sorted by name so the same directory state always renders the
//! same string. Symlinks are leaves and are never followed. A subtree that
//! cannot be listed is rendered as present but empty and the walk continues.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::TrackerError;

const BRANCH: &str = "├── ";
const LAST_BRANCH: &str = "└── ";
const PIPE: &str = "│   ";
const SPACE: &str = "    ";

/// Result of a tree walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeSnapshot {
    pub text: String,
    /// Directories that could not be listed; rendered as empty.
    pub unreadable: Vec<PathBuf>,
}

impl TreeSnapshot {
    pub fn is_partial(&self) -> bool {
        !self.unreadable.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Snapshotter {
    reserved: Vec<String>,
}

impl Default for Snapshotter {
    fn default() -> Self {
        Self::new(vec!["System Volume Information".to_string()])
    }
}

struct Entry {
    name: String,
    path: PathBuf,
    is_dir: bool,
}

impl Snapshotter {
    pub fn new(reserved: Vec<String>) -> Self {
        Self { reserved }
    }

    /// Snapshot `root`, using its display form as the root line.
    pub fn snapshot(&self, root: &Path) -> String {
        self.snapshot_as(root, &root.display().to_string()).text
    }

    /// Snapshot `root` with `label` (usually the mount identifier) as the root line.
    pub fn snapshot_as(&self, root: &Path, label: &str) -> TreeSnapshot {
        let mut text = format!("{}\n", label);
        let mut unreadable = Vec::new();

        self.render_children(root, "", &mut text, &mut unreadable);

        if !unreadable.is_empty() {
            warn!(
                root = %root.display(),
                unreadable = unreadable.len(),
                "Tree snapshot is partial"
            );
        }

        TreeSnapshot { text, unreadable }
    }

    fn render_children(
        &self,
        dir: &Path,
        indent: &str,
        out: &mut String,
        unreadable: &mut Vec<PathBuf>,
    ) {
        let entries = match self.list(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, "Rendering unreadable directory as empty");
                unreadable.push(dir.to_path_buf());
                return;
            }
        };

        let count = entries.len();
        for (i, entry) in entries.into_iter().enumerate() {
            let is_last = i + 1 == count;

            out.push_str(indent);
            out.push_str(if is_last { LAST_BRANCH } else { BRANCH });
            out.push_str(&entry.name);
            out.push('\n');

            if entry.is_dir {
                let child_indent = format!("{}{}", indent, if is_last { SPACE } else { PIPE });
                self.render_children(&entry.path, &child_indent, out, unreadable);
            }
        }
    }

    fn list(&self, dir: &Path) -> Result<Vec<Entry>, TrackerError> {
        let partial = |e: std::io::Error| TrackerError::SnapshotPartial {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        };

        let mut entries = Vec::new();
        for entry in fs::read_dir(dir).map_err(partial)? {
            let entry = entry.map_err(partial)?;
            let name = entry.file_name().to_string_lossy().into_owned();

            if self.is_reserved(&name) {
                continue;
            }

            // file_type() does not follow symlinks
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);

            entries.push(Entry {
                name,
                path: entry.path(),
                is_dir,
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn is_reserved(&self, name: &str) -> bool {
        self.reserved.iter().any(|r| r == name)
    }
}
