use log::debug;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncRead;

use crate::cryptography;
use crate::pathkey::{cas_path_transform, PathKey, PathTransform};
use crate::KEY_SIZE;

pub const DEFAULT_ROOT: &str = "store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("file ({key}) does not exist on disk")]
    NotFound { key: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct StoreConfig {
    pub root: PathBuf,
    pub path_transform: PathTransform,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            path_transform: cas_path_transform,
        }
    }
}

/// Disk-backed store addressing files at `<root>/<owner-id>/<derived path>`.
///
/// A file is always stored under the id of the node that produced it, so a
/// replica holding copies for several owners keeps them in disjoint subtrees.
pub struct Store {
    root: PathBuf,
    path_transform: PathTransform,
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            root: config.root,
            path_transform: config.path_transform,
        }
    }

    pub async fn has(&self, id: &str, key: &str) -> bool {
        let path_key = (self.path_transform)(key);
        fs::metadata(self.full_path(id, &path_key)).await.is_ok()
    }

    /// Streams `src` to EOF into the file for `(id, key)`, creating parent
    /// directories as needed and truncating any previous content.
    ///
    /// Returns the number of bytes copied.
    pub async fn write<R>(&self, id: &str, key: &str, src: &mut R) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut file = self.create(id, key).await?;
        let n = tokio::io::copy(src, &mut file).await?;

        debug!("wrote {} bytes for key ({}) under id ({})", n, key, id);
        Ok(n)
    }

    /// As `write`, but the bytes flowing into the file pass through the
    /// decrypt pipeline: `src` must start with the 16-byte IV.
    ///
    /// Returns the number of plaintext bytes written to disk.
    pub async fn write_decrypt<R>(
        &self,
        encrypt_key: &[u8; KEY_SIZE],
        id: &str,
        key: &str,
        src: &mut R,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut file = self.create(id, key).await?;
        let n = cryptography::copy_decrypt(encrypt_key, src, &mut file).await?;

        debug!("decrypted {} bytes for key ({}) under id ({})", n, key, id);
        Ok(n)
    }

    /// Opens the file for `(id, key)` and stats it.
    ///
    /// The caller owns the returned handle; it closes on drop.
    pub async fn read(&self, id: &str, key: &str) -> Result<(u64, File), StoreError> {
        let path_key = (self.path_transform)(key);
        let path = self.full_path(id, &path_key);

        let file = File::open(&path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound {
                    key: key.to_string(),
                }
            } else {
                StoreError::Io(e)
            }
        })?;
        let size = file.metadata().await?.len();

        Ok((size, file))
    }

    /// Removes the whole top-level subtree the key hashes into. Deleting a
    /// key that was never stored is not an error.
    pub async fn delete(&self, id: &str, key: &str) -> Result<(), StoreError> {
        let path_key = (self.path_transform)(key);
        let path = self.root.join(id).join(path_key.first_segment());

        match fs::remove_dir_all(&path).await {
            Ok(()) => {
                debug!("deleted [{}] from disk", path_key.full_path());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the store root and everything under it.
    pub async fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, id: &str, key: &str) -> Result<File, StoreError> {
        let path_key = (self.path_transform)(key);

        let dir = self.root.join(id).join(&path_key.path_name);
        fs::create_dir_all(&dir).await?;

        Ok(File::create(self.full_path(id, &path_key)).await?)
    }

    fn full_path(&self, id: &str, path_key: &PathKey) -> PathBuf {
        self.root.join(id).join(path_key.full_path())
    }
}
