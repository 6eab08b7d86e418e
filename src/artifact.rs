//! Stage output artifacts and the object store they may live in.
//!
//! Checkpoints only ever hold small inline JSON or a reference; anything
//! large is written through an `ArtifactStore` and referenced by URI.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::stage::StageName;

pub const JSON_MEDIA_TYPE: &str = "application/json";
const FILE_SCHEME: &str = "file://";

/// Opaque output of a stage, consumed by later stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifact {
    Inline {
        value: serde_json::Value,
    },
    Reference {
        uri: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha256: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
}

impl Artifact {
    pub fn inline(value: serde_json::Value) -> Self {
        Self::Inline { value }
    }

    pub fn reference(uri: impl Into<String>) -> Self {
        Self::Reference {
            uri: uri.into(),
            sha256: None,
            media_type: None,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Reference { .. })
    }

    fn declares_json(&self) -> bool {
        match self {
            Self::Inline { .. } => true,
            Self::Reference { media_type, .. } => {
                media_type.as_deref().is_some_and(|m| m == JSON_MEDIA_TYPE)
            }
        }
    }
}

/// Hex-encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// External object storage for large stage outputs.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` for a run's stage and return a reference to them.
    /// Writing the same stage twice replaces the previous object.
    async fn put(
        &self,
        run_id: &str,
        stage: StageName,
        name: &str,
        bytes: Vec<u8>,
        media_type: &str,
    ) -> Result<Artifact>;

    /// Fetch the raw bytes behind an artifact.
    async fn load(&self, artifact: &Artifact) -> Result<Vec<u8>>;

    /// Remove every object belonging to a run.
    async fn delete_run(&self, run_id: &str) -> Result<()>;

    /// Re-fetch and deserialize an artifact to prove it is still usable.
    ///
    /// Inline values are re-serialized; references are loaded, hash-checked,
    /// and parsed when they declare a JSON media type.
    async fn verify(&self, artifact: &Artifact) -> Result<()> {
        let bytes = self.load(artifact).await?;
        if artifact.declares_json() {
            serde_json::from_slice::<serde_json::Value>(&bytes)
                .context("Artifact content is not valid JSON")?;
        }
        Ok(())
    }
}

/// Artifact store backed by a local directory, addressed with `file://` URIs.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, run_id: &str, stage: StageName, name: &str) -> PathBuf {
        self.root.join(run_id).join(stage.as_str()).join(name)
    }

    fn path_for(&self, uri: &str) -> Result<PathBuf> {
        let Some(path) = uri.strip_prefix(FILE_SCHEME) else {
            bail!("Unsupported artifact URI scheme: {}", uri);
        };
        Ok(PathBuf::from(path))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(
        &self,
        run_id: &str,
        stage: StageName,
        name: &str,
        bytes: Vec<u8>,
        media_type: &str,
    ) -> Result<Artifact> {
        let path = self.object_path(run_id, stage, name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create artifact directory: {}", parent.display()))?;
        }

        let digest = sha256_hex(&bytes);
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("Failed to write artifact: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to finalize artifact: {}", path.display()))?;

        Ok(Artifact::Reference {
            uri: format!("{}{}", FILE_SCHEME, path.display()),
            sha256: Some(digest),
            media_type: Some(media_type.to_string()),
        })
    }

    async fn load(&self, artifact: &Artifact) -> Result<Vec<u8>> {
        match artifact {
            Artifact::Inline { value } => {
                serde_json::to_vec(value).context("Failed to serialize inline artifact")
            }
            Artifact::Reference { uri, sha256, .. } => {
                let path = self.path_for(uri)?;
                let bytes = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("Failed to read artifact: {}", path.display()))?;
                if let Some(expected) = sha256 {
                    let actual = sha256_hex(&bytes);
                    if &actual != expected {
                        bail!(
                            "Artifact checksum mismatch for {}: expected {}, found {}",
                            uri,
                            expected,
                            actual
                        );
                    }
                }
                Ok(bytes)
            }
        }
    }

    async fn delete_run(&self, run_id: &str) -> Result<()> {
        let dir = self.root.join(run_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove artifacts: {}", dir.display())),
        }
    }
}
