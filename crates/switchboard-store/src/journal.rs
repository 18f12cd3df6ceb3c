use crate::store::StateStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use switchboard_core::SwitchboardResult;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One line of a fallback journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// State store key the record was meant for.
    pub key: String,
    /// Serialized value.
    pub value: String,
    /// When the record was journaled.
    pub recorded_at: DateTime<Utc>,
}

/// Outcome of replaying a journal into a recovered store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Records written to the store.
    pub applied: usize,
    /// Records whose key already existed.
    pub skipped: usize,
    /// Lines that could not be parsed.
    pub malformed: usize,
    /// Where the replayed journal was moved.
    pub archived_to: Option<PathBuf>,
}

/// Append-only JSON-lines file used while the state store is unreachable.
///
/// Only creations are journaled, so replay is create-only: a record is
/// written when its key is still absent and skipped otherwise. A record can
/// never overwrite a newer one, and replaying twice is harmless.
pub struct Journal {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Journal {
    /// Create a journal backed by the file at `path`. Nothing is written
    /// until the first [`Journal::append`].
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Location of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the journal holds records that have not been replayed yet.
    pub async fn has_pending(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Append one record for `key`.
    pub async fn append(&self, key: &str, value: &str) -> SwitchboardResult<()> {
        let record = JournalRecord {
            key: key.to_string(),
            value: value.to_string(),
            recorded_at: Utc::now(),
        };
        let line = format!("{}\n", serde_json::to_string(&record)?);

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        warn!(key = %key, journal = %self.path.display(), "State store unavailable; record journaled");
        Ok(())
    }

    /// Read every well-formed record. Returns the records and the number of
    /// lines that could not be parsed.
    pub async fn read_all(&self) -> SwitchboardResult<(Vec<JournalRecord>, usize)> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        let mut malformed = 0;
        for (lineno, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    malformed += 1;
                    warn!(line = lineno + 1, error = %e, "Skipping malformed journal line");
                }
            }
        }
        Ok((records, malformed))
    }

    /// Apply the journal to `store`, then archive the file.
    ///
    /// Stops at the first store error and leaves the journal in place so a
    /// later replay can pick up where this one failed.
    pub async fn replay_into(&self, store: &dyn StateStore) -> SwitchboardResult<ReplayReport> {
        let _guard = self.write_lock.lock().await;
        let (records, malformed) = self.read_all().await?;
        let mut report = ReplayReport {
            malformed,
            ..ReplayReport::default()
        };
        if records.is_empty() && malformed == 0 {
            return Ok(report);
        }

        for record in &records {
            if apply(store, record).await? {
                report.applied += 1;
            } else {
                report.skipped += 1;
            }
        }

        let archived = self.path.with_extension(format!(
            "replayed-{}.jsonl",
            Utc::now().format("%Y%m%dT%H%M%S%.3f")
        ));
        tokio::fs::rename(&self.path, &archived).await?;
        info!(
            applied = report.applied,
            skipped = report.skipped,
            archive = %archived.display(),
            "Journal replayed"
        );
        report.archived_to = Some(archived);
        Ok(report)
    }
}

async fn apply(store: &dyn StateStore, record: &JournalRecord) -> SwitchboardResult<bool> {
    match store
        .compare_and_swap(&record.key, None, record.value.clone())
        .await
    {
        Ok(_) => Ok(true),
        Err(e) if e.is_conflict() => {
            debug!(key = %record.key, "Journal record already stored; skipping");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
