//! Append-only log of finished and failed imports

use crate::data::feed::FeedFormat;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub created_at: DateTime<Utc>,
    pub file_type: FeedFormat,
    pub imported: usize,
    pub updated: usize,
    pub deactivated: usize,
    pub skipped: usize,
    pub status: ImportStatus,
    pub message: String,
}

impl HistoryEntry {
    pub fn error(file_type: FeedFormat, message: String) -> Self {
        Self {
            created_at: Utc::now(),
            file_type,
            imported: 0,
            updated: 0,
            deactivated: 0,
            skipped: 0,
            status: ImportStatus::Error,
            message,
        }
    }
}

/// One JSON document per line
#[derive(Debug, Clone)]
pub struct ImportHistory {
    path: PathBuf,
}

impl ImportHistory {
    pub const FILE_NAME: &'static str = "import_history.jsonl";

    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(Self::FILE_NAME),
        }
    }

    pub fn append(&self, entry: &HistoryEntry) -> io::Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)
    }

    /// Newest first
    pub fn latest(&self, limit: usize) -> io::Result<Vec<HistoryEntry>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e),
        };

        let lines: Vec<&str> = content.lines().collect();
        let mut entries = vec![];
        for (index, line) in lines.into_iter().enumerate().rev() {
            if entries.len() >= limit {
                break;
            }
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(line = index + 1, error = %e, "skipping unreadable history entry"),
            }
        }

        Ok(entries)
    }
}
