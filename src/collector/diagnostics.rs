//! File log for conversations whose transcript could not be analyzed.
//!
//! Unusable transcripts are expected during normal operation (transcription
//! lag, expired file URLs) and must not fail a collection run, but they do
//! need a durable trace for manual re-collection. Every run in a process
//! appends per-salesperson batches, each with a summary header, to one file
//! timestamped at process start under the log directory.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;

#[derive(Debug)]
pub struct DiagEntry {
    pub conversation_id: String,
    pub open_user_id: String,
    pub reason: String,
    pub detail: String,
}

pub struct DiagnosticsLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DiagnosticsLog {
    /// Pick a timestamped file name under `log_dir`. The file itself is only
    /// created on the first append.
    pub fn new(log_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        let path = log_dir.join(format!(
            "invalid_transcripts_{}.log",
            Utc::now().timestamp_millis()
        ));
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one salesperson's failed transcripts with a summary header.
    pub fn append_batch(
        &self,
        open_user_id: &str,
        total_conversations: usize,
        succeeded: usize,
        entries: &[DiagEntry],
    ) -> std::io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        // Per-reason counts in first-seen order.
        let mut reasons: Vec<(&str, usize)> = Vec::new();
        for entry in entries {
            match reasons.iter_mut().find(|(r, _)| *r == entry.reason) {
                Some((_, count)) => *count += 1,
                None => reasons.push((&entry.reason, 1)),
            }
        }

        let timestamp = Utc::now().to_rfc3339();
        let mut block = String::new();
        let _ = writeln!(block, "{}", "=".repeat(80));
        let _ = writeln!(block, "transcript diagnostics - {}", timestamp);
        let _ = writeln!(block, "salesperson: {}", open_user_id);
        let _ = writeln!(block, "conversations: {}", total_conversations);
        let _ = writeln!(block, "transcripts retrieved: {}", succeeded);
        let _ = writeln!(block, "transcripts unavailable: {}", entries.len());
        let _ = writeln!(block);
        let _ = writeln!(block, "failure reasons:");
        for (reason, count) in &reasons {
            let _ = writeln!(block, "  - {}: {}", reason, count);
        }
        let _ = writeln!(block, "{}", "=".repeat(80));
        for entry in entries {
            let _ = writeln!(
                block,
                "[{}] conversation: {}, salesperson: {}, reason: {}, detail: {}",
                timestamp, entry.conversation_id, entry.open_user_id, entry.reason, entry.detail
            );
        }
        let _ = writeln!(block);

        let _guard = self.lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(block.as_bytes())
    }
}
