//! Filesystem-backed blob store.
//!
//! One directory per `{prefix}{user}` bucket under a configurable root;
//! objects are plain files named by their content checksum (or the fixed
//! digest key).

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;

use sbx_core::constants::ENV_STORAGE_BUCKET_PREFIX;
use sbx_core::error::{Error, Result};
use sbx_core::store::BlobStore;

pub struct FsStore {
    root: PathBuf,
    bucket_prefix: String,
}

impl FsStore {
    pub fn new(root: PathBuf, bucket_prefix: String) -> Self {
        Self {
            root,
            bucket_prefix,
        }
    }

    /// Root from the caller, bucket prefix from the environment.
    pub fn from_env(root: PathBuf) -> Self {
        let bucket_prefix = std::env::var(ENV_STORAGE_BUCKET_PREFIX).unwrap_or_default();
        Self::new(root, bucket_prefix)
    }

    fn bucket_path(&self, user: &str) -> PathBuf {
        self.root.join(format!("{}{user}", self.bucket_prefix))
    }

    fn object_path(&self, user: &str, name: &str) -> Result<PathBuf> {
        // object names are decimal checksums or the digest key; anything
        // path-like would escape the bucket
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(Error::storage(format!("invalid object name {name:?}")));
        }
        Ok(self.bucket_path(user).join(name))
    }
}

#[async_trait]
impl BlobStore for FsStore {
    async fn create_bucket(&self, user: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.bucket_path(user))
            .await
            .map_err(Into::into)
    }

    async fn create_object(&self, user: &str, name: &str, content: &[u8]) -> Result<()> {
        let path = self.object_path(user, name)?;
        tokio::fs::write(path, content).await.map_err(Into::into)
    }

    async fn get_object(&self, user: &str, name: &str) -> Result<Vec<u8>> {
        let path = self.object_path(user, name)?;
        match tokio::fs::read(path).await {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(Error::NoSuchKey(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_object(&self, user: &str, name: &str) -> Result<()> {
        let path = self.object_path(user, name)?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
