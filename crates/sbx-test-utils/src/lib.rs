//! Shared test fixtures: an in-memory blob store, a recording syncer, and
//! loopback peer pairs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use sbx_core::error::{Error, Result};
use sbx_core::store::BlobStore;
use sbx_core::sync::{walk_sub_dir, Syncer, WalkAction};
use sbx_core::transport::{Hub, Peer};
use sbx_core::tree::{Dir, File};

/// Blob store backed by nested hash maps. Mirrors the contract of the real
/// store including the recoverable "no such key" outcome.
#[derive(Default)]
pub struct MemoryStore {
    buckets: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_names(&self, user: &str) -> Vec<String> {
        let buckets = self.buckets.lock().unwrap();
        let mut names: Vec<String> = buckets
            .get(user)
            .map(|bucket| bucket.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn object_count(&self, user: &str) -> usize {
        self.buckets
            .lock()
            .unwrap()
            .get(user)
            .map(|bucket| bucket.len())
            .unwrap_or(0)
    }

    pub fn contains(&self, user: &str, name: &str) -> bool {
        self.buckets
            .lock()
            .unwrap()
            .get(user)
            .is_some_and(|bucket| bucket.contains_key(name))
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn create_bucket(&self, user: &str) -> Result<()> {
        self.buckets
            .lock()
            .unwrap()
            .entry(user.to_string())
            .or_default();
        Ok(())
    }

    async fn create_object(&self, user: &str, name: &str, content: &[u8]) -> Result<()> {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .get_mut(user)
            .ok_or_else(|| Error::storage(format!("no bucket for {user}")))?;
        bucket.insert(name.to_string(), content.to_vec());
        Ok(())
    }

    async fn get_object(&self, user: &str, name: &str) -> Result<Vec<u8>> {
        self.buckets
            .lock()
            .unwrap()
            .get(user)
            .and_then(|bucket| bucket.get(name))
            .cloned()
            .ok_or_else(|| Error::NoSuchKey(name.to_string()))
    }

    async fn delete_object(&self, user: &str, name: &str) -> Result<()> {
        if let Some(bucket) = self.buckets.lock().unwrap().get_mut(user) {
            bucket.remove(name);
        }
        Ok(())
    }
}

/// One operation a [`RecordingSyncer`] observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOp {
    AddFile { unroot_path: String, checksum: String },
    DeleteFile { unroot_path: String, checksum: String },
    AddDir { unroot_path: String },
    DeleteDir { unroot_path: String },
}

/// Syncer that records what the diff engine emits, recursing into subtrees
/// the way the real agents do.
#[derive(Default)]
pub struct RecordingSyncer {
    ops: Mutex<Vec<SyncOp>>,
}

impl RecordingSyncer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<SyncOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn added_files(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                SyncOp::AddFile { unroot_path, .. } => Some(unroot_path),
                _ => None,
            })
            .collect()
    }

    pub fn deleted_files(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                SyncOp::DeleteFile { unroot_path, .. } => Some(unroot_path),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Syncer for RecordingSyncer {
    async fn add_file(
        &self,
        _root_path: &str,
        unroot_path: &str,
        file: &File,
        _peer: &Peer,
    ) -> Result<()> {
        self.ops.lock().unwrap().push(SyncOp::AddFile {
            unroot_path: unroot_path.to_string(),
            checksum: file.checksum().to_num_string(),
        });
        Ok(())
    }

    async fn delete_file(
        &self,
        _root_path: &str,
        unroot_path: &str,
        file: &File,
        _peer: &Peer,
    ) -> Result<()> {
        self.ops.lock().unwrap().push(SyncOp::DeleteFile {
            unroot_path: unroot_path.to_string(),
            checksum: file.checksum().to_num_string(),
        });
        Ok(())
    }

    async fn add_dir(
        &self,
        root_path: &str,
        unroot_path: &str,
        dir: &Dir,
        peer: &Peer,
    ) -> Result<()> {
        self.ops.lock().unwrap().push(SyncOp::AddDir {
            unroot_path: unroot_path.to_string(),
        });
        walk_sub_dir(root_path, dir, peer, self, WalkAction::Add).await
    }

    async fn delete_dir(
        &self,
        root_path: &str,
        unroot_path: &str,
        dir: &Dir,
        peer: &Peer,
    ) -> Result<()> {
        self.ops.lock().unwrap().push(SyncOp::DeleteDir {
            unroot_path: unroot_path.to_string(),
        });
        walk_sub_dir(root_path, dir, peer, self, WalkAction::Delete).await
    }
}

/// A connected pair of peers over a loopback socket, with their request
/// streams. The listener is ephemeral; nothing else is bound.
pub async fn loopback_peers() -> (
    Arc<Peer>,
    mpsc::Receiver<Vec<u8>>,
    Arc<Peer>,
    mpsc::Receiver<Vec<u8>>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let (accepted_stream, remote_addr) = accepted.unwrap();

    let (dial_hub, dial_requests) = Hub::spawn(dialed.unwrap());
    let (accept_hub, accept_requests) = Hub::spawn(accepted_stream);

    let dial_peer = Arc::new(Peer::new(dial_hub, addr, false));
    let accept_peer = Arc::new(Peer::new(accept_hub, remote_addr, false));
    (dial_peer, dial_requests, accept_peer, accept_requests)
}

/// Lay out `files` as `(relative path, content)` pairs under `root`.
pub fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (rel, content) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use sbx_core::sync::compare;
    use sbx_core::tree::build;

    #[tokio::test]
    async fn memory_store_honors_the_contract() {
        let store = MemoryStore::new();
        store.create_bucket("alice").await.unwrap();
        store.create_object("alice", "1", b"one").await.unwrap();

        assert_eq!(store.get_object("alice", "1").await.unwrap(), b"one");
        assert!(store
            .get_object("alice", "2")
            .await
            .unwrap_err()
            .is_no_such_key());

        store.delete_object("alice", "1").await.unwrap();
        store.delete_object("alice", "1").await.unwrap();
        assert_eq!(store.object_count("alice"), 0);

        // writing into an absent bucket is a hard storage error
        assert!(store.create_object("bob", "1", b"x").await.is_err());
    }

    #[tokio::test]
    async fn recording_syncer_sees_a_whole_new_subtree() {
        let old_root = tempfile::tempdir().unwrap();
        write_tree(old_root.path(), &[("a.txt", "A")]);
        let new_root = tempfile::tempdir().unwrap();
        write_tree(
            new_root.path(),
            &[("a.txt", "A"), ("sub/b.txt", "B"), ("gone-soon.txt", "C")],
        );

        let old = build(old_root.path()).unwrap();
        let new = build(new_root.path()).unwrap();

        let (peer, _requests, _other_peer, _other_requests) = loopback_peers().await;
        let syncer = RecordingSyncer::new();
        compare(&old, &new, &syncer, &peer).await.unwrap();

        let mut added = syncer.added_files();
        added.sort();
        assert_eq!(added, vec!["/gone-soon.txt", "/sub/b.txt"]);
        assert!(syncer.deleted_files().is_empty());
        assert!(syncer
            .ops()
            .contains(&SyncOp::AddDir {
                unroot_path: "/sub".into()
            }));
    }
}
