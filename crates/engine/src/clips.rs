//! Clip storage for recorded agent turns.
//!
//! A single keyspace keyed by message id. Existence of a clip is the sole
//! "can replay locally" predicate; storage failure disables replay without
//! affecting the session.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("clip storage unavailable")]
    Unavailable,
    #[error("clip storage i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("clip metadata: {0}")]
    Meta(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClipMeta {
    pub sample_rate: u32,
    pub channels: u16,
    pub duration_ms: u64,
}

/// One recorded reply clip, written once per completed recording.
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub id: Uuid,
    pub blob: Bytes,
    pub created_at: DateTime<Utc>,
    pub meta: ClipMeta,
}

impl AudioClip {
    pub fn new(id: Uuid, blob: Bytes, meta: ClipMeta) -> Self {
        Self {
            id,
            blob,
            created_at: Utc::now(),
            meta,
        }
    }

    pub fn byte_size(&self) -> usize {
        self.blob.len()
    }
}

/// Async key→clip store over a single namespace.
#[async_trait]
pub trait ClipStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<AudioClip>, CacheError>;
    async fn put(&self, clip: AudioClip) -> Result<(), CacheError>;
}

/// In-memory clip store.
pub struct MemoryClipStore {
    clips: RwLock<HashMap<Uuid, AudioClip>>,
}

impl MemoryClipStore {
    pub fn new() -> Self {
        Self {
            clips: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.clips.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clips.read().await.is_empty()
    }
}

impl Default for MemoryClipStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClipStore for MemoryClipStore {
    async fn get(&self, id: Uuid) -> Result<Option<AudioClip>, CacheError> {
        Ok(self.clips.read().await.get(&id).cloned())
    }

    async fn put(&self, clip: AudioClip) -> Result<(), CacheError> {
        self.clips.write().await.insert(clip.id, clip);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct StoredMeta {
    created_at: DateTime<Utc>,
    meta: ClipMeta,
}

/// Filesystem-backed clip store: `<id>.pcm` next to a `<id>.json` sidecar.
pub struct FsClipStore {
    dir: PathBuf,
}

impl FsClipStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn blob_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.pcm"))
    }

    fn meta_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl ClipStore for FsClipStore {
    async fn get(&self, id: Uuid) -> Result<Option<AudioClip>, CacheError> {
        let blob = match tokio::fs::read(self.blob_path(id)).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let raw_meta = tokio::fs::read_to_string(self.meta_path(id)).await?;
        let stored: StoredMeta = serde_json::from_str(&raw_meta)?;
        Ok(Some(AudioClip {
            id,
            blob,
            created_at: stored.created_at,
            meta: stored.meta,
        }))
    }

    async fn put(&self, clip: AudioClip) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let stored = StoredMeta {
            created_at: clip.created_at,
            meta: clip.meta.clone(),
        };
        tokio::fs::write(self.meta_path(clip.id), serde_json::to_vec(&stored)?).await?;
        tokio::fs::write(self.blob_path(clip.id), &clip.blob).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_clip() -> AudioClip {
        AudioClip::new(
            Uuid::new_v4(),
            Bytes::from_static(&[1, 2, 3, 4]),
            ClipMeta {
                sample_rate: 24_000,
                channels: 1,
                duration_ms: 83,
            },
        )
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryClipStore::new();
        let clip = sample_clip();
        let id = clip.id;

        assert!(store.get(id).await.unwrap().is_none());
        store.put(clip).await.unwrap();

        let loaded = store.get(id).await.unwrap().expect("clip present");
        assert_eq!(loaded.byte_size(), 4);
        assert_eq!(loaded.meta.sample_rate, 24_000);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn memory_store_overwrites_same_id() {
        let store = MemoryClipStore::new();
        let clip = sample_clip();
        let id = clip.id;
        store.put(clip.clone()).await.unwrap();
        store.put(clip).await.unwrap();
        assert_eq!(store.len().await, 1);
        let _ = store.get(id).await.unwrap();
    }

    #[tokio::test]
    async fn fs_store_round_trip() {
        let dir = std::env::temp_dir().join(format!("parla-clips-{}", Uuid::new_v4()));
        let store = FsClipStore::new(&dir);
        let clip = sample_clip();
        let id = clip.id;
        let created_at = clip.created_at;

        assert!(store.get(id).await.unwrap().is_none());
        store.put(clip).await.unwrap();

        let loaded = store.get(id).await.unwrap().expect("clip present");
        assert_eq!(loaded.blob.as_ref(), &[1, 2, 3, 4]);
        assert_eq!(loaded.meta.duration_ms, 83);
        assert_eq!(loaded.created_at, created_at);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn fs_store_missing_clip_is_none() {
        let dir = std::env::temp_dir().join(format!("parla-clips-{}", Uuid::new_v4()));
        let store = FsClipStore::new(&dir);
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }
}
