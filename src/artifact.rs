use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{PipelineError, Result};

/// Content-addressed reference to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub digest: String,
    pub location: String,
    pub size: u64,
}

/// Append-only, content-addressed blob storage.
///
/// Writing the same bytes twice yields the same reference and leaves the
/// stored blob untouched, so concurrent writers need no coordination.
pub trait ArtifactStore: Send + Sync {
    fn put(&self, name: &str, data: &[u8]) -> Result<ArtifactRef>;
    fn get(&self, digest: &str) -> Result<Vec<u8>>;
    fn contains(&self, digest: &str) -> bool;

    fn put_file(&self, name: &str, path: &Path) -> Result<ArtifactRef> {
        let data = fs::read(path).map_err(|err| {
            PipelineError::system(format!("failed to read {}: {err}", path.display()))
        })?;
        self.put(name, &data)
    }
}

pub fn digest_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Compute the SHA256 digest of the file at `path` without loading it whole.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|err| {
        PipelineError::system(format!(
            "failed to open file for hashing {}: {err}",
            path.display()
        ))
    })?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Default, Clone)]
pub struct MemoryArtifactStore {
    blobs: Arc<RwLock<HashMap<String, Arc<Vec<u8>>>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn put(&self, name: &str, data: &[u8]) -> Result<ArtifactRef> {
        let digest = digest_bytes(data);
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| PipelineError::system("artifact store lock poisoned"))?;
        blobs
            .entry(digest.clone())
            .or_insert_with(|| Arc::new(data.to_vec()));
        Ok(ArtifactRef {
            name: name.to_string(),
            location: format!("memory://{digest}"),
            digest,
            size: data.len() as u64,
        })
    }

    fn get(&self, digest: &str) -> Result<Vec<u8>> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| PipelineError::system("artifact store lock poisoned"))?;
        blobs
            .get(digest)
            .map(|blob| blob.as_ref().clone())
            .ok_or_else(|| PipelineError::system(format!("artifact {digest} not found")))
    }

    fn contains(&self, digest: &str) -> bool {
        self.blobs
            .read()
            .map(|b| b.contains_key(digest))
            .unwrap_or(false)
    }
}

/// Filesystem store laid out as `<root>/sha256/<aa>/<digest>`.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("sha256")).map_err(|err| {
            PipelineError::system(format!(
                "artifact store unavailable at {}: {err}",
                root.display()
            ))
        })?;
        Ok(Self { root })
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        let shard = digest.get(..2).unwrap_or("00");
        self.root.join("sha256").join(shard).join(digest)
    }
}

impl FsArtifactStore {
    /// Place a blob under `digest` unless it is already stored. `write` fills a
    /// unique temp file that is then renamed into place.
    fn install(
        &self,
        name: &str,
        digest: String,
        size: u64,
        write: impl FnOnce(&Path) -> std::io::Result<()>,
    ) -> Result<ArtifactRef> {
        let path = self.blob_path(&digest);
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
            if let Err(err) = write(&tmp) {
                let _ = fs::remove_file(&tmp);
                return Err(err.into());
            }
            if let Err(err) = fs::rename(&tmp, &path) {
                let _ = fs::remove_file(&tmp);
                if !path.exists() {
                    return Err(err.into());
                }
            }
            debug!(%digest, name, size, "Artifact stored");
        }
        Ok(ArtifactRef {
            name: name.to_string(),
            location: path.to_string_lossy().to_string(),
            digest,
            size,
        })
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put(&self, name: &str, data: &[u8]) -> Result<ArtifactRef> {
        self.install(name, digest_bytes(data), data.len() as u64, |tmp| {
            fs::write(tmp, data)
        })
    }

    /// Hashes the file as a stream and copies it into place, so large build
    /// outputs never sit in memory.
    fn put_file(&self, name: &str, path: &Path) -> Result<ArtifactRef> {
        let size = fs::metadata(path)
            .map_err(|err| {
                PipelineError::system(format!("failed to read {}: {err}", path.display()))
            })?
            .len();
        let digest = compute_sha256(path)?;
        self.install(name, digest, size, |tmp| fs::copy(path, tmp).map(|_| ()))
    }

    fn get(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        fs::read(&path).map_err(|err| {
            PipelineError::system(format!("artifact {digest} unavailable: {err}"))
        })
    }

    fn contains(&self, digest: &str) -> bool {
        self.blob_path(digest).is_file()
    }
}
