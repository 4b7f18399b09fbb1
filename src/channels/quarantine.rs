//! Quarantine store: a Maildir folder the user can inspect from their client.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::DeliveryError;

/// Permissions applied to quarantined files.
pub const QUARANTINE_MODE: u32 = 0o660;

/// Maildir `cur` directory that receives quarantined messages.
#[derive(Debug, Clone)]
pub struct QuarantineStore {
    cur_dir: PathBuf,
}

impl QuarantineStore {
    pub fn new(cur_dir: impl Into<PathBuf>) -> Self {
        Self {
            cur_dir: cur_dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.cur_dir
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.cur_dir.join(id)
    }

    /// Create `cur` plus its sibling `new` and `tmp` so the folder is a valid
    /// Maildir.
    pub async fn ensure_dirs(&self) -> Result<(), DeliveryError> {
        tokio::fs::create_dir_all(&self.cur_dir).await?;
        if let Some(parent) = self.cur_dir.parent() {
            tokio::fs::create_dir_all(parent.join("new")).await?;
            tokio::fs::create_dir_all(parent.join("tmp")).await?;
        }
        Ok(())
    }

    /// Move a claimed staging file into quarantine under the same id.
    ///
    /// A plain rename when source and target share a filesystem; otherwise the
    /// bytes are copied to a temp name in the quarantine folder, renamed into
    /// place, and the source removed.
    pub async fn admit(&self, id: &str, source: &Path) -> Result<PathBuf, DeliveryError> {
        let target = self.path_for(id);

        match tokio::fs::rename(source, &target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
                self.copy_across(id, source, &target).await?;
            }
            Err(e) => {
                return Err(DeliveryError::Quarantine {
                    id: id.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        // The move already happened; a permission failure must not undo it.
        if let Err(e) = set_mode(&target).await {
            warn!(id, error = %e, "Failed to normalize quarantine permissions");
        }

        info!(id, path = %target.display(), "Message moved to quarantine");
        Ok(target)
    }

    async fn copy_across(&self, id: &str, source: &Path, target: &Path) -> Result<(), DeliveryError> {
        let tmp = self.cur_dir.join(format!(".{id}.tmp"));
        let placed = async {
            tokio::fs::copy(source, &tmp).await?;
            tokio::fs::rename(&tmp, target).await
        }
        .await;

        if let Err(e) = placed {
            // The rename into place is the last fallible step, so only the
            // temp copy can be left behind.
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(DeliveryError::Quarantine {
                id: id.to_string(),
                reason: e.to_string(),
            });
        }

        // The quarantined copy is in place; the message must not be released
        // for another verdict just because its staging copy lingers.
        if let Err(e) = tokio::fs::remove_file(source).await {
            warn!(id, error = %e, "Quarantined, but failed to remove staging copy");
        }
        Ok(())
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(QUARANTINE_MODE)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admit_moves_file_and_keeps_id() {
        let tmp = tempfile::tempdir().unwrap();
        let store = QuarantineStore::new(tmp.path().join("alice/.Quarantine/cur"));
        store.ensure_dirs().await.unwrap();
        assert!(tmp.path().join("alice/.Quarantine/new").is_dir());
        assert!(tmp.path().join("alice/.Quarantine/tmp").is_dir());

        let source = tmp.path().join("123.abc.processing");
        tokio::fs::write(&source, b"phish").await.unwrap();

        let target = store.admit("123.abc", &source).await.unwrap();
        assert_eq!(target, store.path_for("123.abc"));
        assert!(!source.exists());
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"phish");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn admit_normalizes_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let store = QuarantineStore::new(tmp.path().join("q/cur"));
        store.ensure_dirs().await.unwrap();
        let source = tmp.path().join("m.processing");
        tokio::fs::write(&source, b"x").await.unwrap();
        tokio::fs::set_permissions(&source, std::fs::Permissions::from_mode(0o600))
            .await
            .unwrap();

        let target = store.admit("m", &source).await.unwrap();
        let mode = tokio::fs::metadata(target).await.unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o660);
    }

    #[tokio::test]
    async fn failed_copy_leaves_nothing_in_quarantine() {
        let tmp = tempfile::tempdir().unwrap();
        let store = QuarantineStore::new(tmp.path().join("q/cur"));
        store.ensure_dirs().await.unwrap();

        let err = store
            .copy_across("gone", &tmp.path().join("gone.processing"), &store.path_for("gone"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Quarantine { .. }));
        assert_eq!(std::fs::read_dir(store.dir()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn copy_counts_as_moved_when_source_cannot_be_removed() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let store = QuarantineStore::new(tmp.path().join("q/cur"));
        store.ensure_dirs().await.unwrap();
        let locked = tmp.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        let source = locked.join("m.processing");
        std::fs::write(&source, b"phish").unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();

        // Privileged users ignore directory permissions; nothing to check then.
        let writable = std::fs::write(locked.join("canary"), b"").is_ok();
        if !writable {
            store
                .copy_across("m", &source, &store.path_for("m"))
                .await
                .unwrap();
            assert_eq!(std::fs::read(store.path_for("m")).unwrap(), b"phish");
            assert!(source.exists());
        }

        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn missing_source_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = QuarantineStore::new(tmp.path().join("q/cur"));
        store.ensure_dirs().await.unwrap();
        let err = store
            .admit("gone", &tmp.path().join("gone.processing"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Quarantine { .. }));
    }
}
