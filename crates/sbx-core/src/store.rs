//! Blob store contract.
//!
//! Content-addressed object I/O with a per-user namespace. The server keeps
//! one object per distinct content checksum (named by the checksum's decimal
//! num-string) plus the persisted digest under a fixed key. "No such key" is
//! a recoverable outcome - it marks a first sync, not a failure.

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Ensure the per-user namespace exists. Idempotent.
    async fn create_bucket(&self, user: &str) -> Result<()>;

    /// Store (or overwrite) an object.
    async fn create_object(&self, user: &str, name: &str, content: &[u8]) -> Result<()>;

    /// Fetch an object's bytes. Absent objects fail with
    /// [`crate::Error::NoSuchKey`].
    async fn get_object(&self, user: &str, name: &str) -> Result<Vec<u8>>;

    /// Remove an object. Removing an absent object is not an error.
    async fn delete_object(&self, user: &str, name: &str) -> Result<()>;
}
