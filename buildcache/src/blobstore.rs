use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use log::{error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::digest::Digest;
use crate::error::CacheError;

/// A scratch area into which blobs are written before being atomically committed into the blob
/// namespace. Owned by the caller of `new_ingest_session` until `complete_ingest_session` or
/// `cancel_ingest_session` consumes it.
#[derive(Debug, Clone)]
pub struct IngestSession {
    pub id: String,
}

/// The protocol the cache engine consumes from an external content-addressed blob store.
/// `get`/`delete` read and reclaim committed blobs; the ingest-session calls stage new ones
/// for atomic commit.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, digest: &Digest) -> Result<Option<Vec<u8>>, CacheError>;

    async fn delete(&self, digests: &[Digest]) -> Result<(Vec<Digest>, u64), CacheError>;

    async fn new_ingest_session(&self) -> Result<IngestSession, CacheError>;

    async fn write(&self, session: &IngestSession, bytes: &[u8]) -> Result<(u64, Digest), CacheError>;

    async fn create(
        &self,
        session: &IngestSession,
        object: &serde_json::Value,
    ) -> Result<(u64, Digest), CacheError>;

    async fn complete_ingest_session(&self, session: IngestSession) -> Result<Vec<Digest>, CacheError>;

    async fn cancel_ingest_session(&self, session: IngestSession) -> Result<(), CacheError>;
}

struct SessionState {
    dir: PathBuf,
    // scratch file path -> digest it was written under
    pending: Vec<(PathBuf, Digest)>,
}

/// Filesystem-backed reference `BlobStore`. Committed blobs live at `<root>/blobs/<algo>/<hex>`,
/// the same two-level layout `peoci::ocidir::load_layers_from_oci` reads back. Ingest scratch
/// files live under `<root>/ingest/<session-id>/`.
pub struct FsBlobStore {
    root: PathBuf,
    sessions: Mutex<HashMap<String, SessionState>>,
    session_counter: AtomicU64,
}

impl FsBlobStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("blobs")).await?;
        tokio::fs::create_dir_all(root.join("ingest")).await?;
        Ok(Self {
            root,
            sessions: Mutex::new(HashMap::new()),
            session_counter: AtomicU64::new(0),
        })
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("blobs").join(digest.as_blob_path())
    }

    fn ingest_dir(&self, session_id: &str) -> PathBuf {
        self.root.join("ingest").join(session_id)
    }

    async fn stage(
        &self,
        session: &IngestSession,
        bytes: &[u8],
    ) -> Result<(u64, Digest), CacheError> {
        let digest = Digest::sha256(bytes);
        let dir = self.ingest_dir(&session.id);
        let scratch_path = dir.join(hex::encode(digest.bytes()));

        let mut file = tokio::fs::File::create(&scratch_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;

        let mut sessions = self.sessions.lock().await;
        let state = sessions
            .get_mut(&session.id)
            .ok_or(CacheError::ItemNotFound)?;
        state.pending.push((scratch_path, digest.clone()));

        Ok((bytes.len() as u64, digest))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, digest: &Digest) -> Result<Option<Vec<u8>>, CacheError> {
        match tokio::fs::read(self.blob_path(digest)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, digests: &[Digest]) -> Result<(Vec<Digest>, u64), CacheError> {
        let mut deleted = Vec::with_capacity(digests.len());
        let mut bytes_freed = 0u64;
        for digest in digests {
            let path = self.blob_path(digest);
            match tokio::fs::metadata(&path).await {
                Ok(meta) => {
                    let size = meta.len();
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => {
                            bytes_freed += size;
                            deleted.push(digest.clone());
                        }
                        Err(e) => warn!("blob delete {} failed: {:?}", digest, e),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // race-tolerant: re-delete of an absent digest is a no-op, not an error
                }
                Err(e) => error!("blob stat {} failed: {:?}", digest, e),
            }
        }
        Ok((deleted, bytes_freed))
    }

    async fn new_ingest_session(&self) -> Result<IngestSession, CacheError> {
        let n = self.session_counter.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}-{}", std::process::id(), n);
        let dir = self.ingest_dir(&id);
        tokio::fs::create_dir_all(&dir).await?;

        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            id.clone(),
            SessionState {
                dir,
                pending: Vec::new(),
            },
        );
        Ok(IngestSession { id })
    }

    async fn write(&self, session: &IngestSession, bytes: &[u8]) -> Result<(u64, Digest), CacheError> {
        self.stage(session, bytes).await
    }

    async fn create(
        &self,
        session: &IngestSession,
        object: &serde_json::Value,
    ) -> Result<(u64, Digest), CacheError> {
        let bytes = serde_json::to_vec(object)?;
        self.stage(session, &bytes).await
    }

    async fn complete_ingest_session(&self, session: IngestSession) -> Result<Vec<Digest>, CacheError> {
        let state = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(&session.id).ok_or(CacheError::ItemNotFound)?
        };

        let mut digests = Vec::with_capacity(state.pending.len());
        for (scratch_path, digest) in &state.pending {
            let dest = self.blob_path(digest);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(scratch_path, &dest).await?;
            digests.push(digest.clone());
        }

        let _ = tokio::fs::remove_dir_all(&state.dir).await;
        info!("ingest session {} committed {} blobs", session.id, digests.len());
        Ok(digests)
    }

    async fn cancel_ingest_session(&self, session: IngestSession) -> Result<(), CacheError> {
        let state = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(&session.id)
        };
        if let Some(state) = state {
            let _ = tokio::fs::remove_dir_all(&state.dir).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_commit_makes_blob_gettable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();

        let session = store.new_ingest_session().await.unwrap();
        let (size, digest) = store.write(&session, b"hello").await.unwrap();
        assert_eq!(size, 5);
        assert!(store.get(&digest).await.unwrap().is_none());

        let committed = store.complete_ingest_session(session).await.unwrap();
        assert_eq!(committed, vec![digest.clone()]);
        assert_eq!(store.get(&digest).await.unwrap().unwrap(), b"hello");
    }

    #[tokio::test]
    async fn cancel_discards_pending_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();

        let session = store.new_ingest_session().await.unwrap();
        let (_, digest) = store.write(&session, b"discarded").await.unwrap();
        store.cancel_ingest_session(session).await.unwrap();

        assert!(store.get(&digest).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent_on_absent_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();
        let digest = Digest::sha256(b"never written");
        let (deleted, freed) = store.delete(&[digest]).await.unwrap();
        assert!(deleted.is_empty());
        assert_eq!(freed, 0);
    }
}
