//! Sealed storage for session snapshots
//!
//! Lets a restarted process resume its channels without re-attesting:
//! - one sealed JSON file per peer, named by the SHA256 of the peer name
//! - a sealed index recording each peer's highest saved counters
//! - AES-256-GCM under a caller-provided [`SealingKey`], peer name bound as AAD
//!
//! Each peer's index entry names the session it belongs to. Within one session,
//! saving or loading a snapshot whose counters are behind the index is refused as
//! a rollback: resuming from it would make the peer accept replays, or make us
//! reuse sequence numbers. A snapshot of a newer session replaces the entry, and
//! loading a record from any other session than the indexed one is a rollback.

use crate::tee::session::SessionSnapshot;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

pub const SEALING_KEY_SIZE: usize = 32;
const SEAL_NONCE_SIZE: usize = 12;
const INDEX_FILE: &str = "index.sealed.json";
const INDEX_LABEL: &str = "enclave-mail store index v1";
const RECORD_LABEL: &str = "enclave-mail session record v1";

/// Key under which snapshots are sealed, zeroized on drop
#[derive(Clone)]
pub struct SealingKey(Zeroizing<[u8; SEALING_KEY_SIZE]>);

impl SealingKey {
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; SEALING_KEY_SIZE]);
        OsRng.fill_bytes(&mut key[..]);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; SEALING_KEY_SIZE]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0[..]))
    }
}

impl std::fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealingKey([REDACTED])")
    }
}

/// Highest counters ever saved for one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighWaterMark {
    pub file: String,
    /// [`SessionSnapshot::session_id`] of the saved session
    pub session_id: String,
    pub local_seq: u64,
    pub peer_seq: Option<u64>,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreIndex {
    records: BTreeMap<String, HighWaterMark>,
    last_updated: Option<DateTime<Utc>>,
}

/// On-disk form of anything sealed by the store
#[derive(Serialize, Deserialize)]
struct SealedBlob {
    #[serde(with = "crate::encoding::hex_array")]
    nonce: [u8; SEAL_NONCE_SIZE],
    #[serde(with = "crate::encoding::hex_vec")]
    ciphertext: Vec<u8>,
    sealed_at: DateTime<Utc>,
}

pub struct SessionStore {
    dir: PathBuf,
    key: SealingKey,
    index: StoreIndex,
}

impl SessionStore {
    /// Open or create a store in `dir`
    pub fn open(dir: impl AsRef<Path>, key: SealingKey) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let index_path = dir.join(INDEX_FILE);
        let index = if index_path.exists() {
            let plaintext = unseal_file(&key, &index_path, INDEX_LABEL.as_bytes())?;
            serde_json::from_slice(&plaintext)?
        } else {
            StoreIndex::default()
        };

        log::info!(
            "Session store opened at {}: {} sessions",
            dir.display(),
            index.records.len()
        );
        Ok(Self { dir, key, index })
    }

    /// Seal `snapshot` as the saved session for `peer`
    pub fn save(&mut self, peer: &str, snapshot: &SessionSnapshot) -> Result<(), StoreError> {
        let session_id = snapshot.session_id();
        match self.index.records.get(peer) {
            Some(mark) if mark.session_id == session_id => check_not_behind(peer, mark, snapshot)?,
            Some(_) => log::info!("Replacing saved session for '{}' with a new session", peer),
            None => {}
        }

        let file = record_file_name(peer);
        let plaintext = Zeroizing::new(serde_json::to_vec(snapshot)?);
        seal_file(
            &self.key,
            &self.dir.join(&file),
            &record_aad(peer),
            &plaintext,
        )?;

        let now = Utc::now();
        self.index.records.insert(
            peer.to_string(),
            HighWaterMark {
                file,
                session_id,
                local_seq: snapshot.local_seq,
                peer_seq: snapshot.peer_seq,
                saved_at: now,
            },
        );
        self.index.last_updated = Some(now);
        self.save_index()?;

        log::info!(
            "Saved session for '{}': local_seq={}, peer_seq={:?}",
            peer,
            snapshot.local_seq,
            snapshot.peer_seq
        );
        Ok(())
    }

    /// Unseal the saved session for `peer`
    pub fn load(&self, peer: &str) -> Result<SessionSnapshot, StoreError> {
        let mark = self
            .index
            .records
            .get(peer)
            .ok_or_else(|| StoreError::NotFound(peer.to_string()))?;

        let plaintext = unseal_file(&self.key, &self.dir.join(&mark.file), &record_aad(peer))?;
        let snapshot: SessionSnapshot = serde_json::from_slice(&plaintext)?;
        if snapshot.session_id() != mark.session_id {
            log::warn!("Rollback refused for '{}': record belongs to another session", peer);
            return Err(StoreError::Rollback {
                peer: peer.to_string(),
            });
        }
        check_not_behind(peer, mark, &snapshot)?;
        Ok(snapshot)
    }

    /// Forget the session for `peer`
    pub fn remove(&mut self, peer: &str) -> Result<bool, StoreError> {
        let Some(mark) = self.index.records.remove(peer) else {
            return Ok(false);
        };
        match std::fs::remove_file(self.dir.join(&mark.file)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.index.last_updated = Some(Utc::now());
        self.save_index()?;
        Ok(true)
    }

    pub fn high_water_mark(&self, peer: &str) -> Option<&HighWaterMark> {
        self.index.records.get(peer)
    }

    pub fn peers(&self) -> Vec<&str> {
        self.index.records.keys().map(String::as_str).collect()
    }

    pub fn count(&self) -> usize {
        self.index.records.len()
    }

    /// Get summary
    pub fn summary(&self) -> String {
        format!(
            "SessionStore: {} sessions, dir={}",
            self.index.records.len(),
            self.dir.display(),
        )
    }

    // --- File persistence ---

    fn save_index(&self) -> Result<(), StoreError> {
        let plaintext = serde_json::to_vec(&self.index)?;
        seal_file(
            &self.key,
            &self.dir.join(INDEX_FILE),
            INDEX_LABEL.as_bytes(),
            &plaintext,
        )
    }
}

fn check_not_behind(
    peer: &str,
    mark: &HighWaterMark,
    snapshot: &SessionSnapshot,
) -> Result<(), StoreError> {
    // None sorts before Some, so "nothing accepted" is behind any accepted sequence
    if snapshot.local_seq < mark.local_seq || snapshot.peer_seq < mark.peer_seq {
        log::warn!(
            "Rollback refused for '{}': snapshot ({}, {:?}) behind recorded ({}, {:?})",
            peer,
            snapshot.local_seq,
            snapshot.peer_seq,
            mark.local_seq,
            mark.peer_seq
        );
        return Err(StoreError::Rollback {
            peer: peer.to_string(),
        });
    }
    Ok(())
}

fn record_file_name(peer: &str) -> String {
    format!("{}.sealed.json", hex::encode(Sha256::digest(peer.as_bytes())))
}

fn record_aad(peer: &str) -> Vec<u8> {
    [RECORD_LABEL.as_bytes(), peer.as_bytes()].concat()
}

fn seal_file(key: &SealingKey, path: &Path, aad: &[u8], plaintext: &[u8]) -> Result<(), StoreError> {
    let mut nonce = [0u8; SEAL_NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = key
        .cipher()
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| StoreError::Sealing(format!("encrypt {}", path.display())))?;

    let blob = SealedBlob {
        nonce,
        ciphertext,
        sealed_at: Utc::now(),
    };
    // Write then rename so a crash never leaves a torn file
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(&blob)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn unseal_file(key: &SealingKey, path: &Path, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, StoreError> {
    let json = std::fs::read(path)?;
    let blob: SealedBlob = serde_json::from_slice(&json)?;
    key.cipher()
        .decrypt(
            Nonce::from_slice(&blob.nonce),
            Payload {
                msg: &blob.ciphertext,
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| StoreError::Integrity(format!("{} failed authentication", path.display())))
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Sealing failed: {0}")]
    Sealing(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Snapshot for '{peer}' is older than the last saved state")]
    Rollback { peer: String },

    #[error("No saved session for '{0}'")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tee::session::{paired_sessions, Session};

    fn advanced(session: &mut Session, sends: u64, accepted: Option<u64>) -> SessionSnapshot {
        for _ in 0..sends {
            session.next_local_seq();
        }
        if let Some(seq) = accepted {
            if session.is_fresh(seq) {
                session.accept_peer_seq(seq);
            }
        }
        session.snapshot()
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, _) = paired_sessions();
        let snapshot = advanced(&mut host, 3, Some(1));

        let mut store = SessionStore::open(dir.path(), SealingKey::generate()).unwrap();
        store.save("enclave-a", &snapshot).unwrap();
        let loaded = store.load("enclave-a").unwrap();
        assert_eq!(loaded.local_seq, 3);
        assert_eq!(loaded.peer_seq, Some(1));
        assert_eq!(loaded.peer, snapshot.peer);
        assert!(matches!(store.load("other"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = SealingKey::generate();
        let (mut host, _) = paired_sessions();
        {
            let mut store = SessionStore::open(dir.path(), key.clone()).unwrap();
            store.save("peer", &advanced(&mut host, 2, None)).unwrap();
        }

        let store = SessionStore::open(dir.path(), key).unwrap();
        assert_eq!(store.count(), 1);
        assert_eq!(store.load("peer").unwrap().local_seq, 2);
        assert_eq!(store.high_water_mark("peer").unwrap().local_seq, 2);
    }

    #[test]
    fn test_no_plaintext_key_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, _) = paired_sessions();
        let snapshot = advanced(&mut host, 1, None);
        let key_hex = serde_json::to_value(&snapshot).unwrap()["session_key"]
            .as_str()
            .unwrap()
            .to_string();

        let mut store = SessionStore::open(dir.path(), SealingKey::generate()).unwrap();
        store.save("peer", &snapshot).unwrap();
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let contents = std::fs::read_to_string(entry.unwrap().path()).unwrap();
            assert!(!contents.contains(&key_hex));
            assert!(!contents.contains("peer_seq"));
        }
    }

    #[test]
    fn test_rollback_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, _) = paired_sessions();
        let old = host.snapshot();
        let new = advanced(&mut host, 5, Some(4));

        let mut store = SessionStore::open(dir.path(), SealingKey::generate()).unwrap();
        store.save("peer", &new).unwrap();
        assert!(matches!(
            store.save("peer", &old),
            Err(StoreError::Rollback { .. })
        ));
        // Equal counters are fine
        store.save("peer", &new).unwrap();
    }

    #[test]
    fn test_new_session_replaces_old() {
        let dir = tempfile::tempdir().unwrap();
        let (mut old, _) = paired_sessions();
        let (mut fresh, _) = paired_sessions();

        let mut store = SessionStore::open(dir.path(), SealingKey::generate()).unwrap();
        store.save("enclave", &advanced(&mut old, 5, Some(3))).unwrap();

        // Re-established session starts from zero again
        let fresh_snapshot = fresh.snapshot();
        store.save("enclave", &fresh_snapshot).unwrap();
        let mark = store.high_water_mark("enclave").unwrap();
        assert_eq!(mark.session_id, fresh_snapshot.session_id());
        assert_eq!(mark.local_seq, 0);
        assert_eq!(store.load("enclave").unwrap().local_seq, 0);

        // The new session is still protected against its own rollback
        store.save("enclave", &advanced(&mut fresh, 2, None)).unwrap();
        assert!(matches!(
            store.save("enclave", &fresh_snapshot),
            Err(StoreError::Rollback { .. })
        ));
    }

    #[test]
    fn test_old_session_record_put_back() {
        let dir = tempfile::tempdir().unwrap();
        let (mut old, _) = paired_sessions();
        let (mut fresh, _) = paired_sessions();
        let file = record_file_name("enclave");

        let mut store = SessionStore::open(dir.path(), SealingKey::generate()).unwrap();
        store.save("enclave", &advanced(&mut old, 9, None)).unwrap();
        let old_copy = std::fs::read(dir.path().join(&file)).unwrap();
        store.save("enclave", &advanced(&mut fresh, 1, None)).unwrap();

        std::fs::write(dir.path().join(&file), old_copy).unwrap();
        assert!(matches!(
            store.load("enclave"),
            Err(StoreError::Rollback { .. })
        ));
    }

    #[test]
    fn test_rollback_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let key = SealingKey::generate();
        let (mut host, _) = paired_sessions();
        let file = record_file_name("peer");

        let mut store = SessionStore::open(dir.path(), key.clone()).unwrap();
        store.save("peer", &advanced(&mut host, 1, None)).unwrap();
        let stale_copy = std::fs::read(dir.path().join(&file)).unwrap();
        store.save("peer", &advanced(&mut host, 4, Some(2))).unwrap();

        // An attacker puts the older sealed file back
        std::fs::write(dir.path().join(&file), stale_copy).unwrap();
        assert!(matches!(
            store.load("peer"),
            Err(StoreError::Rollback { .. })
        ));
    }

    #[test]
    fn test_wrong_key_and_swapped_files() {
        let dir = tempfile::tempdir().unwrap();
        let key = SealingKey::generate();
        let (mut host, _) = paired_sessions();

        let mut store = SessionStore::open(dir.path(), key.clone()).unwrap();
        store.save("alice", &advanced(&mut host, 1, None)).unwrap();
        store.save("bob", &advanced(&mut host, 1, None)).unwrap();

        assert!(matches!(
            SessionStore::open(dir.path(), SealingKey::generate()),
            Err(StoreError::Integrity(_))
        ));

        // Bob's sealed record under Alice's name fails authentication
        std::fs::copy(
            dir.path().join(record_file_name("bob")),
            dir.path().join(record_file_name("alice")),
        )
        .unwrap();
        assert!(matches!(store.load("alice"), Err(StoreError::Integrity(_))));
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, _) = paired_sessions();
        let mut store = SessionStore::open(dir.path(), SealingKey::generate()).unwrap();
        store.save("peer", &advanced(&mut host, 1, None)).unwrap();
        assert!(store.remove("peer").unwrap());
        assert!(!store.remove("peer").unwrap());
        assert_eq!(store.count(), 0);
        assert!(!dir.path().join(record_file_name("peer")).exists());
    }
}
