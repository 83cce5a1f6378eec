//! Artifact storage.
//!
//! Artifacts are binary blobs (screenshots) produced while a task runs. They
//! are stored separately from task records; a record only carries
//! `ArtifactRef`s. The reaper deletes a record's artifacts when it evicts it.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::ArtifactError;

/// Pointer to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: Uuid,
    pub content_type: String,
    /// Step that produced the artifact, when it belongs to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    pub size_bytes: u64,
}

impl ArtifactRef {
    /// Attribute the artifact to a step.
    pub fn for_step(mut self, index: usize) -> Self {
        self.step_index = Some(index);
        self
    }
}

/// A stored artifact's bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Artifact storage backend.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store bytes under a fresh id.
    async fn put(&self, content_type: &str, data: Vec<u8>) -> Result<ArtifactRef, ArtifactError>;

    /// Fetch an artifact.
    async fn get(&self, id: Uuid) -> Result<Artifact, ArtifactError>;

    /// Delete an artifact. Deleting a missing artifact is not an error.
    async fn delete(&self, id: Uuid) -> Result<(), ArtifactError>;
}

/// Keeps artifacts in process memory.
#[derive(Default)]
pub struct MemoryArtifactStore {
    items: RwLock<HashMap<Uuid, Artifact>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored artifacts.
    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, content_type: &str, data: Vec<u8>) -> Result<ArtifactRef, ArtifactError> {
        let reference = ArtifactRef {
            id: Uuid::new_v4(),
            content_type: content_type.to_string(),
            step_index: None,
            size_bytes: data.len() as u64,
        };
        self.items.write().await.insert(
            reference.id,
            Artifact {
                content_type: content_type.to_string(),
                data,
            },
        );
        Ok(reference)
    }

    async fn get(&self, id: Uuid) -> Result<Artifact, ArtifactError> {
        self.items
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ArtifactError::NotFound { id })
    }

    async fn delete(&self, id: Uuid) -> Result<(), ArtifactError> {
        self.items.write().await.remove(&id);
        Ok(())
    }
}

/// Known content types and the file extension each is stored under.
const EXTENSIONS: &[(&str, &str)] = &[
    ("image/png", "png"),
    ("image/jpeg", "jpg"),
    ("application/octet-stream", "bin"),
];

fn extension_for(content_type: &str) -> &'static str {
    EXTENSIONS
        .iter()
        .find(|(ct, _)| *ct == content_type)
        .map(|(_, ext)| *ext)
        .unwrap_or("bin")
}

/// Writes artifacts as `{id}.{ext}` files in one directory.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Open (and create if needed) the artifact directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path(&self, id: Uuid, ext: &str) -> PathBuf {
        self.root.join(format!("{id}.{ext}"))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, content_type: &str, data: Vec<u8>) -> Result<ArtifactRef, ArtifactError> {
        let id = Uuid::new_v4();
        let ext = extension_for(content_type);
        let size_bytes = data.len() as u64;
        tokio::fs::write(self.path(id, ext), data).await?;
        Ok(ArtifactRef {
            id,
            content_type: EXTENSIONS
                .iter()
                .find(|(_, e)| *e == ext)
                .map(|(ct, _)| ct.to_string())
                .unwrap_or_else(|| content_type.to_string()),
            step_index: None,
            size_bytes,
        })
    }

    async fn get(&self, id: Uuid) -> Result<Artifact, ArtifactError> {
        for (content_type, ext) in EXTENSIONS {
            match tokio::fs::read(self.path(id, ext)).await {
                Ok(data) => {
                    return Ok(Artifact {
                        content_type: content_type.to_string(),
                        data,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ArtifactError::NotFound { id })
    }

    async fn delete(&self, id: Uuid) -> Result<(), ArtifactError> {
        for (_, ext) in EXTENSIONS {
            match tokio::fs::remove_file(self.path(id, ext)).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
