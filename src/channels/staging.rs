//! Staging directory as a persistent work queue.
//!
//! One `<id>.mail` file per message. A worker claims a file by renaming it to
//! `<id>.processing`; the rename either succeeds for exactly one claimant or
//! fails because the file is gone. Retries rename back, terminal outcomes
//! retire the claimed file (archive or remove).

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StagingError;

pub const MAIL_EXT: &str = "mail";
pub const PROCESSING_EXT: &str = "processing";

/// Longest id accepted from a filename.
const MAX_ID_LEN: usize = 128;

/// A `.mail` file found in staging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    /// Time since the file was last modified.
    pub age: Duration,
}

/// Check that an id is a plain, non-hidden filename stem.
pub fn validate_id(id: &str) -> Result<(), StagingError> {
    let ok = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && !id.starts_with('.')
        && !id.contains("..")
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(StagingError::MalformedName(id.to_string()))
    }
}

/// Map a path in staging to its message id, if it is a `.mail` file.
///
/// `Ok(None)` for files that are not queue entries (other extensions, hidden
/// files, temp files); `Err` for `.mail` files with an unusable name.
pub fn id_from_path(path: &Path) -> Result<Option<String>, StagingError> {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(None);
    };
    if name.starts_with('.') {
        return Ok(None);
    }
    let Some(stem) = name.strip_suffix(&format!(".{MAIL_EXT}")) else {
        return Ok(None);
    };
    validate_id(stem)?;
    Ok(Some(stem.to_string()))
}

/// New opaque id: arrival time in microseconds plus 16 random hex digits.
pub fn new_id() -> String {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or_default();
    let random = Uuid::new_v4().simple().to_string();
    format!("{micros}.{}", &random[..16])
}

#[derive(Debug, Clone)]
pub struct StagingQueue {
    dir: PathBuf,
    archive_dir: Option<PathBuf>,
}

impl StagingQueue {
    pub fn new(dir: impl Into<PathBuf>, archive_dir: Option<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            archive_dir,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn mail_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{MAIL_EXT}"))
    }

    pub fn processing_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{PROCESSING_EXT}"))
    }

    /// Create the staging (and archive) directories.
    pub async fn ensure_dirs(&self) -> Result<(), StagingError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        if let Some(archive) = &self.archive_dir {
            tokio::fs::create_dir_all(archive).await?;
        }
        Ok(())
    }

    /// Write a new message into staging and return its id.
    ///
    /// The bytes go to a hidden temp file first and are renamed into place, so
    /// the watcher never sees a partial `.mail` file.
    pub async fn stage(&self, raw: &[u8]) -> Result<String, StagingError> {
        let id = new_id();
        let tmp = self.dir.join(format!(".{id}.tmp"));
        tokio::fs::write(&tmp, raw).await?;

        let written = tokio::fs::metadata(&tmp).await?.len();
        if written != raw.len() as u64 {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StagingError::Io(std::io::Error::other(format!(
                "size mismatch staging {id}: expected {}, wrote {written}",
                raw.len()
            ))));
        }

        tokio::fs::rename(&tmp, self.mail_path(&id)).await?;
        debug!(id = %id, bytes = raw.len(), "Message staged");
        Ok(id)
    }

    /// All `.mail` entries, oldest first. Malformed names are logged and skipped.
    pub async fn list_pending(&self) -> Result<Vec<PendingEntry>, StagingError> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        let now = SystemTime::now();

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let id = match id_from_path(&path) {
                Ok(Some(id)) => id,
                Ok(None) => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping staged file");
                    continue;
                }
            };
            let Ok(meta) = entry.metadata().await else {
                // Vanished between listing and stat.
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            entries.push(PendingEntry { id, age });
        }

        entries.sort_by(|a, b| b.age.cmp(&a.age).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }

    /// Age of one `.mail` entry, `None` if it is not (or no longer) staged.
    pub async fn age_of(&self, id: &str) -> Option<Duration> {
        let meta = tokio::fs::metadata(self.mail_path(id)).await.ok()?;
        let modified = meta.modified().ok()?;
        Some(
            SystemTime::now()
                .duration_since(modified)
                .unwrap_or_default(),
        )
    }

    /// Claim `<id>.mail` by renaming it to `<id>.processing`.
    ///
    /// `Ok(None)` means the file is gone: another claimant got it, or it was
    /// already retired.
    pub async fn claim(&self, id: &str) -> Result<Option<PathBuf>, StagingError> {
        validate_id(id)?;
        let processing = self.processing_path(id);
        match tokio::fs::rename(self.mail_path(id), &processing).await {
            Ok(()) => Ok(Some(processing)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Give a claim back so a later pass picks the message up again.
    pub async fn release(&self, id: &str) -> Result<(), StagingError> {
        match tokio::fs::rename(self.processing_path(id), self.mail_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StagingError::Vanished(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a claimed message from staging after its terminal action.
    ///
    /// Archives to the delivered directory when one is configured. An archive
    /// failure falls back to removal, since the message is already delivered.
    pub async fn retire(&self, id: &str) -> Result<(), StagingError> {
        let processing = self.processing_path(id);

        if let Some(archive) = &self.archive_dir {
            let target = archive.join(format!("{id}.{MAIL_EXT}"));
            match tokio::fs::rename(&processing, &target).await {
                Ok(()) => {
                    debug!(id, "Archived delivered message");
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StagingError::Vanished(id.to_string()));
                }
                Err(e) => {
                    warn!(id, error = %e, "Archive failed, removing staged copy");
                }
            }
        }

        match tokio::fs::remove_file(&processing).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StagingError::Vanished(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a claimed message without archiving it.
    pub async fn discard(&self, id: &str) -> Result<(), StagingError> {
        match tokio::fs::remove_file(self.processing_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StagingError::Vanished(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Rename `.processing` files left by a crash back to `.mail`.
    pub async fn recover_orphans(&self) -> Result<usize, StagingError> {
        let mut restored = 0;
        let mut dir = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(id) = name.strip_suffix(&format!(".{PROCESSING_EXT}")) else {
                continue;
            };
            if validate_id(id).is_err() {
                warn!(file = name, "Ignoring malformed claimed file");
                continue;
            }
            match tokio::fs::rename(&path, self.mail_path(id)).await {
                Ok(()) => restored += 1,
                Err(e) => warn!(id, error = %e, "Failed to restore orphaned claim"),
            }
        }

        if restored > 0 {
            info!(restored, "Restored orphaned claims to staging");
        }
        Ok(restored)
    }

    /// Number of `.mail` files waiting.
    pub async fn count_pending(&self) -> Result<usize, StagingError> {
        Ok(self.list_pending().await?.len())
    }
}
