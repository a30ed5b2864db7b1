//! Durable key handles.
//!
//! One blob per (participant, address). A refresh replaces the blob; on
//! startup a participant reloads everything it owns.
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    engine::KeyShare,
    types::{ConfigMessage, ParticipantId, SessionId},
    RelayError, Result,
};

/// A persisted key share plus the session that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHandle {
    pub session_id: SessionId,
    pub key: KeyShare,
}

impl KeyHandle {
    pub fn address(&self) -> String {
        self.key.address()
    }

    pub fn config(&self) -> ConfigMessage {
        ConfigMessage {
            address: self.address(),
            participants: self.key.participants.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

pub trait KeyStore: Send + Sync {
    /// Stores `handle`, replacing any handle with the same address.
    fn save(&self, handle: &KeyHandle) -> Result<()>;

    fn load_all(&self) -> Result<Vec<KeyHandle>>;
}

/// Keys as JSON files under `<root>/participant-<id>/<address>`.
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    /// Fails if `participant` could name a path outside `root`.
    pub fn new(root: impl AsRef<Path>, participant: &ParticipantId) -> Result<Self> {
        let id = participant.as_str();
        if id.is_empty() || id.contains(['/', '\\', '\0']) || id.contains("..") {
            return Err(RelayError::InvalidRequest(format!(
                "participant id {:?} is not usable as a directory name",
                id
            )));
        }
        Ok(Self {
            dir: root.as_ref().join(format!("participant-{}", id)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl KeyStore for FileKeyStore {
    fn save(&self, handle: &KeyHandle) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let address = handle.address();
        let bytes = serde_json::to_vec_pretty(handle)?;
        // write-then-rename so a crash never leaves half a key behind
        let tmp = self.dir.join(format!(".{}.tmp", address));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, self.dir.join(&address))?;
        debug!("stored key {} in {}", address, self.dir.display());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<KeyHandle>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut handles = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let hidden = path
                .file_name()
                .and_then(|name| name.to_str())
                .map_or(true, |name| name.starts_with('.'));
            if hidden || !path.is_file() {
                continue;
            }
            let handle = fs::read(&path)
                .map_err(|err| err.to_string())
                .and_then(|bytes| {
                    serde_json::from_slice::<KeyHandle>(&bytes).map_err(|err| err.to_string())
                });
            match handle {
                Ok(handle) => handles.push(handle),
                Err(err) => warn!("skipping unreadable key file {}: {}", path.display(), err),
            }
        }
        Ok(handles)
    }
}

/// Keys that live as long as the process.
#[derive(Default)]
pub struct MemoryKeyStore {
    handles: Mutex<BTreeMap<String, KeyHandle>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn save(&self, handle: &KeyHandle) -> Result<()> {
        let mut handles = self.handles.lock().expect("got lock");
        handles.insert(handle.address(), handle.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<KeyHandle>> {
        let handles = self.handles.lock().expect("got lock");
        Ok(handles.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::keygen;

    async fn handles() -> Vec<KeyHandle> {
        keygen(&["a", "b"], 1)
            .await
            .into_values()
            .map(|key| KeyHandle {
                session_id: SessionId::new("kg"),
                key,
            })
            .collect()
    }

    #[tokio::test]
    async fn saved_keys_reload() {
        let root = tempfile::tempdir().unwrap();
        let handle = handles().await.remove(0);
        let store = FileKeyStore::new(root.path(), &handle.key.me).unwrap();

        assert!(store.load_all().unwrap().is_empty());
        store.save(&handle).unwrap();
        assert!(store.dir().join(handle.address()).is_file());
        assert_eq!(store.load_all().unwrap(), vec![handle]);
    }

    #[tokio::test]
    async fn save_replaces_by_address() {
        let root = tempfile::tempdir().unwrap();
        let handle = handles().await.remove(0);
        let store = FileKeyStore::new(root.path(), &handle.key.me).unwrap();
        store.save(&handle).unwrap();

        let mut refreshed = handle.clone();
        refreshed.session_id = SessionId::new("rf");
        store.save(&refreshed).unwrap();

        assert_eq!(store.load_all().unwrap(), vec![refreshed]);
    }

    #[tokio::test]
    async fn unreadable_files_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        let handle = handles().await.remove(0);
        let store = FileKeyStore::new(root.path(), &handle.key.me).unwrap();
        store.save(&handle).unwrap();
        fs::write(store.dir().join("0xgarbage"), b"not json").unwrap();

        assert_eq!(store.load_all().unwrap(), vec![handle]);
    }

    #[tokio::test]
    async fn participants_do_not_share_directories() {
        let root = tempfile::tempdir().unwrap();
        let all = handles().await;
        for handle in &all {
            FileKeyStore::new(root.path(), &handle.key.me)
                .unwrap()
                .save(handle)
                .unwrap();
        }
        for handle in &all {
            let loaded = FileKeyStore::new(root.path(), &handle.key.me)
                .unwrap()
                .load_all()
                .unwrap();
            assert_eq!(loaded, vec![handle.clone()]);
        }
    }

    #[test]
    fn ids_that_escape_the_root_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        for id in ["", "..", "../x", "a/b", "a\\b", "a\0b"] {
            let err = FileKeyStore::new(root.path(), &id.into()).err();
            assert!(
                matches!(err, Some(RelayError::InvalidRequest(_))),
                "{:?} accepted",
                id
            );
        }
        let store = FileKeyStore::new(root.path(), &"alice.v2".into()).unwrap();
        assert_eq!(store.dir(), root.path().join("participant-alice.v2"));
    }

    #[tokio::test]
    async fn memory_store_replaces_by_address() {
        let store = MemoryKeyStore::new();
        let handle = handles().await.remove(0);
        store.save(&handle).unwrap();
        store.save(&handle).unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);
        assert_eq!(handle.config().address, handle.address());
    }
}
