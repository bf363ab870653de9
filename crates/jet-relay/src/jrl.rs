//! Revocation list storage.
//!
//! Readers take an `Arc` of the current snapshot and only ever wait on a
//! pointer swap. Pushes are serialized among themselves and persisted before
//! they are published, with no lock on the snapshot held during disk I/O.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use jet_token::{JrlClaims, JrlSnapshot};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JrlError {
    #[error("Revocation list issued at {pushed} is not newer than the current one ({current})")]
    StaleRevocationList { current: i64, pushed: i64 },
    #[error("Failed to persist revocation list: {0}")]
    Persist(#[from] std::io::Error),
    #[error("Corrupt revocation list file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Identity of the current revocation list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JrlInfo {
    pub jti: Option<Uuid>,
    pub iat: i64,
}

impl From<&JrlSnapshot> for JrlInfo {
    fn from(snapshot: &JrlSnapshot) -> Self {
        Self {
            jti: snapshot.jti,
            iat: snapshot.iat,
        }
    }
}

pub struct JrlStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<JrlSnapshot>>,
    push_lock: Mutex<()>,
}

impl JrlStore {
    /// In-memory store with an empty list
    pub fn in_memory() -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(JrlSnapshot::default())),
            push_lock: Mutex::new(()),
        }
    }

    /// Load the list persisted at `path`. A missing file yields an empty list.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, JrlError> {
        let path = path.into();
        let snapshot = match std::fs::read(&path) {
            Ok(content) => serde_json::from_slice::<JrlSnapshot>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No revocation list on disk, starting empty");
                JrlSnapshot::default()
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            path = %path.display(),
            iat = snapshot.iat,
            entries = snapshot.entry_count(),
            "Loaded revocation list"
        );

        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(snapshot)),
            push_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn current(&self) -> Arc<JrlSnapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn info(&self) -> JrlInfo {
        JrlInfo::from(self.current.read().as_ref())
    }

    /// Replace the current list if `claims` was issued strictly later
    pub async fn push(&self, claims: JrlClaims) -> Result<JrlInfo, JrlError> {
        let snapshot = JrlSnapshot::from(claims);

        let _push = self.push_lock.lock().await;
        let current_iat = self.current().iat;
        if snapshot.iat <= current_iat {
            warn!(current = current_iat, pushed = snapshot.iat, "Rejected stale revocation list");
            return Err(JrlError::StaleRevocationList {
                current: current_iat,
                pushed: snapshot.iat,
            });
        }

        if let Some(path) = &self.path {
            persist(path, &snapshot).await?;
        }

        let info = JrlInfo::from(&snapshot);
        info!(
            jti = ?info.jti,
            iat = info.iat,
            entries = snapshot.entry_count(),
            "Revocation list updated"
        );
        *self.current.write() = Arc::new(snapshot);
        Ok(info)
    }
}

async fn persist(path: &Path, snapshot: &JrlSnapshot) -> Result<(), JrlError> {
    let content = serde_json::to_vec_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn claims(iat: i64, banned: Uuid) -> JrlClaims {
        JrlClaims {
            jti: Uuid::new_v4(),
            iat,
            jrl: HashMap::from([("jti".to_owned(), vec![json!(banned)])]),
        }
    }

    #[tokio::test]
    async fn test_push_requires_newer_iat() {
        let store = JrlStore::in_memory();
        let info = store.push(claims(100, Uuid::new_v4())).await.unwrap();
        assert_eq!(info.iat, 100);

        assert!(matches!(
            store.push(claims(100, Uuid::new_v4())).await,
            Err(JrlError::StaleRevocationList { current: 100, pushed: 100 })
        ));
        assert!(store.push(claims(50, Uuid::new_v4())).await.is_err());
        assert_eq!(store.info().iat, 100);

        store.push(claims(101, Uuid::new_v4())).await.unwrap();
        assert_eq!(store.current().iat, 101);
    }

    #[tokio::test]
    async fn test_readers_keep_their_snapshot() {
        let store = JrlStore::in_memory();
        let before = store.current();
        store.push(claims(1, Uuid::new_v4())).await.unwrap();
        assert_eq!(before.iat, 0);
        assert_eq!(store.current().iat, 1);
    }

    #[tokio::test]
    async fn test_persisted_list_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jrl.json");
        let banned = Uuid::new_v4();

        let store = JrlStore::load(&path).unwrap();
        assert_eq!(store.info(), JrlInfo { jti: None, iat: 0 });
        let pushed = store.push(claims(42, banned)).await.unwrap();

        let reloaded = JrlStore::load(&path).unwrap();
        assert_eq!(reloaded.info(), pushed);
        let payload = json!({ "jti": banned });
        assert_eq!(
            reloaded.current().find_revoked(payload.as_object().unwrap()),
            Some("jti")
        );
        assert!(!dir.path().join("jrl.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jrl.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(JrlStore::load(&path), Err(JrlError::Corrupt(_))));
    }

    /// A push stuck writing its file must not hold up token validation
    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_readers_proceed_while_push_persists() {
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jrl.json");
        let tmp = dir.path().join("jrl.json.tmp");
        // opening a fifo for writing blocks until someone reads it
        let status = std::process::Command::new("mkfifo").arg(&tmp).status().unwrap();
        assert!(status.success());

        let store = Arc::new(JrlStore::load(&path).unwrap());
        let push = tokio::spawn({
            let store = Arc::clone(&store);
            async move { store.push(claims(7, Uuid::new_v4())).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!push.is_finished());

        let reader = tokio::task::spawn_blocking({
            let store = Arc::clone(&store);
            move || (store.current().iat, store.info().iat)
        });
        let seen = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("reader blocked behind the push")
            .unwrap();
        assert_eq!(seen, (0, 0));

        let written = tokio::task::spawn_blocking(move || std::fs::read(tmp)).await.unwrap().unwrap();
        assert!(!written.is_empty());
        let info = tokio::time::timeout(Duration::from_secs(2), push)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(info.iat, 7);
        assert_eq!(store.current().iat, 7);
    }

    #[tokio::test]
    async fn test_concurrent_pushes_keep_the_newest() {
        let store = Arc::new(JrlStore::in_memory());
        let pushes: Vec<_> = (1..=8)
            .map(|iat| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.push(claims(iat, Uuid::new_v4())).await })
            })
            .collect();
        for push in pushes {
            let _ = push.await.unwrap();
        }
        assert_eq!(store.current().iat, 8);
    }
}
