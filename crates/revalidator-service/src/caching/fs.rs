use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::fs::{self, File};
use tokio::io::{self, AsyncWriteExt};

use super::{CacheBackend, CacheBackendError};

/// The number of bytes in front of every file holding the expiry timestamp.
const HEADER_LEN: usize = 8;

/// A backend storing one file per key below a directory.
///
/// Several processes may share the directory, e.g. on a network mount. Files are written to a
/// temporary file first and then moved into place, so readers never observe partial writes.
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    path: PathBuf,
}

impl FilesystemBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The file holding `key`.
    ///
    /// Keys are arbitrary strings, so they are hashed into a safe file name.
    fn item_path(&self, key: &str) -> PathBuf {
        let hash = format!("{:x}", Sha256::digest(key.as_bytes()));
        self.path.join(&hash[..2]).join(&hash[2..])
    }

    async fn load(&self, key: &str) -> Result<Option<Bytes>, CacheBackendError> {
        let item_path = self.item_path(key);
        let contents = match fs::read(&item_path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let Some((expires_at, data)) = split_header(&contents) else {
            tracing::warn!(path = %item_path.display(), "Truncated cache file");
            return Ok(None);
        };

        if expires_at.is_some_and(|expires_at| expires_at <= SystemTime::now()) {
            tracing::trace!(path = %item_path.display(), "Removing expired cache file");
            self.delete(key).await?;
            return Ok(None);
        }

        Ok(Some(Bytes::copy_from_slice(data)))
    }

    async fn store(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), CacheBackendError> {
        let item_path = self.item_path(key);
        let parent_dir = item_path
            .parent()
            .ok_or_else(|| CacheBackendError::Unavailable("cache directory not found".into()))?;
        let temp_dir = self.path.join(".tmp");
        fs::create_dir_all(parent_dir).await?;
        fs::create_dir_all(&temp_dir).await?;

        let temp_file = NamedTempFile::new_in(&temp_dir)?;
        let mut dest = File::from_std(temp_file.reopen()?);

        let expires_at = ttl.map(|ttl| SystemTime::now() + ttl);
        dest.write_all(&encode_header(expires_at)).await?;
        dest.write_all(&value).await?;
        dest.flush().await?;

        temp_file
            .persist(&item_path)
            .map_err(|err| CacheBackendError::Io(err.error))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheBackendError> {
        match fs::remove_file(self.item_path(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Encodes the expiry as seconds since the unix epoch, `0` meaning no expiry.
fn encode_header(expires_at: Option<SystemTime>) -> [u8; HEADER_LEN] {
    let secs = expires_at
        .and_then(|time| time.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map_or(0, |since_epoch| since_epoch.as_secs().max(1));
    secs.to_be_bytes()
}

fn split_header(contents: &[u8]) -> Option<(Option<SystemTime>, &[u8])> {
    if contents.len() < HEADER_LEN {
        return None;
    }
    let (header, data) = contents.split_at(HEADER_LEN);
    let secs = u64::from_be_bytes(header.try_into().ok()?);
    let expires_at = (secs > 0).then(|| SystemTime::UNIX_EPOCH + Duration::from_secs(secs));
    Some((expires_at, data))
}

impl CacheBackend for FilesystemBackend {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, CacheBackendError>> {
        Box::pin(self.load(key))
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), CacheBackendError>> {
        Box::pin(self.store(key, value, ttl))
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), CacheBackendError>> {
        Box::pin(self.delete(key))
    }
}
