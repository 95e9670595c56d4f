//! Per-thread checkpoint persistence.
//!
//! The executor writes a [`Checkpoint`] after every stage, so a thread can be
//! resumed from the last completed stage by any later request. Two stores are
//! provided: an in-memory map (state is lost on restart) and a directory of
//! JSON files, one per thread.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hitl_types::{Checkpoint, HitlError, Result, StateUpdate};
use tokio::sync::RwLock;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>>;

    async fn put(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Merge `update` into a stored thread's state without moving its cursor.
    async fn update(&self, thread_id: &str, update: StateUpdate) -> Result<Checkpoint> {
        let mut checkpoint = self
            .get(thread_id)
            .await?
            .ok_or_else(|| HitlError::ThreadNotFound {
                thread_id: thread_id.to_string(),
            })?;
        checkpoint.state.apply(update);
        checkpoint.touch();
        self.put(&checkpoint).await?;
        Ok(checkpoint)
    }

    /// Thread ids with a stored checkpoint, sorted.
    async fn list(&self) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// MemoryCheckpointStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryCheckpointStore {
    threads: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.threads.read().await.get(thread_id).cloned())
    }

    async fn put(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.threads
            .write()
            .await
            .insert(checkpoint.thread_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.threads.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// FileCheckpointStore
// ---------------------------------------------------------------------------

/// Stores each thread at `<root>/<thread_id>.json`. Writes go to a temporary
/// file first and are renamed into place.
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, thread_id: &str) -> Result<PathBuf> {
        let valid = !thread_id.is_empty()
            && thread_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(HitlError::ThreadNotFound {
                thread_id: thread_id.to_string(),
            });
        }
        Ok(self.root.join(format!("{thread_id}.json")))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let Ok(path) = self.path_for(thread_id) else {
            return Ok(None);
        };
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let json = tokio::fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    async fn put(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.path_for(&checkpoint.thread_id)?;
        tokio::fs::create_dir_all(&self.root).await?;
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(checkpoint)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(path = %path.display(), step = checkpoint.step, "Checkpoint saved");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        if !tokio::fs::try_exists(&self.root).await? {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
