use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid blob key: {0}")]
    InvalidKey(String),

    #[error("blob io error: {0}")]
    Io(#[from] io::Error),

    #[error("blob store unavailable: {0}")]
    Unavailable(String),
}

/// Content-addressable object storage behind a string key.
///
/// Implementations are called outside any database transaction.
pub trait BlobStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BlobError>;

    fn get(&self, key: &str) -> Result<Vec<u8>, BlobError>;

    /// Deleting a missing key succeeds.
    fn delete(&self, key: &str) -> Result<(), BlobError>;
}

/// Keys are `/`-separated segments of `[A-Za-z0-9._-]`, no empty or dot-only segments.
pub fn validate_key(key: &str) -> Result<(), BlobError> {
    let ok = !key.is_empty()
        && key.split('/').all(|seg| {
            !seg.is_empty()
                && seg != "."
                && seg != ".."
                && seg
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        });
    if ok {
        Ok(())
    } else {
        Err(BlobError::InvalidKey(key.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs.lock().map(|b| b.contains_key(key)).unwrap_or(false)
    }

    pub fn keys(&self) -> Vec<String> {
        self.blobs
            .lock()
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>, BlobError> {
        self.blobs
            .lock()
            .map_err(|_| BlobError::Unavailable("memory blob store poisoned".into()))
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BlobError> {
        validate_key(key)?;
        self.locked()?.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        self.locked()?
            .get(key)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }

    fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.locked()?.remove(key);
        Ok(())
    }
}

/// Blobs as files under a root directory, written with temp file + fsync + rename.
#[derive(Debug, Clone)]
pub struct DirBlobStore {
    root: PathBuf,
}

impl DirBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BlobError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

impl BlobStore for DirBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BlobError> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| BlobError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(parent)?;

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BlobError::NotFound(key.to_string())),
            Err(e) => Err(BlobError::Io(e)),
        }
    }

    fn delete(&self, key: &str) -> Result<(), BlobError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobError::Io(e)),
        }
    }
}
