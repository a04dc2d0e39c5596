//! Directory diff engine and the syncer contract.
//!
//! [`compare`] walks two snapshots and turns their difference into the
//! minimal set of add/delete operations, emitted through a [`Syncer`]. The
//! engine has no idea which side it runs on; the client and the server both
//! implement the contract.

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::Result;
use crate::transport::Peer;
use crate::tree::{Dir, File};

/// The four-operation contract the diff engine emits against.
///
/// Directory callbacks are expected to recurse into [`walk_sub_dir`], so the
/// engine only ever names the root of an added or deleted subtree.
#[async_trait]
pub trait Syncer: Send + Sync {
    async fn add_file(&self, root_path: &str, unroot_path: &str, file: &File, peer: &Peer)
        -> Result<()>;

    async fn delete_file(
        &self,
        root_path: &str,
        unroot_path: &str,
        file: &File,
        peer: &Peer,
    ) -> Result<()>;

    async fn add_dir(&self, root_path: &str, unroot_path: &str, dir: &Dir, peer: &Peer)
        -> Result<()>;

    async fn delete_dir(
        &self,
        root_path: &str,
        unroot_path: &str,
        dir: &Dir,
        peer: &Peer,
    ) -> Result<()>;
}

/// Which operation a [`walk_sub_dir`] pass applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkAction {
    Add,
    Delete,
}

/// Strip a node's owning root prefix so the same relative layout can be
/// replayed on a peer's filesystem.
pub fn unroot(root_path: &str, path: &str) -> String {
    path.strip_prefix(root_path).unwrap_or(path).to_string()
}

/// Compare two snapshots and emit the difference via `syncer`.
///
/// Children are matched by content checksum at each level. A child present
/// on both sides under the same checksum but a different name is replayed as
/// delete-old + add-new, so a content-preserving rename moves its reference
/// without re-transferring bytes. Deletes are emitted before adds.
///
/// Every walked marker in both trees is cleared again before this returns,
/// on success and on error alike.
pub async fn compare(old: &Dir, new: &Dir, syncer: &dyn Syncer, peer: &Peer) -> Result<()> {
    let old_root = old.object.path.clone();
    let new_root = new.object.path.clone();
    let result = compare_dirs(&old_root, &new_root, old, new, syncer, peer).await;
    old.reset_walked();
    new.reset_walked();
    result
}

fn compare_dirs<'a>(
    old_root: &'a str,
    new_root: &'a str,
    old: &'a Dir,
    new: &'a Dir,
    syncer: &'a dyn Syncer,
    peer: &'a Peer,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        if old.checksum() == new.checksum() {
            return Ok(());
        }

        // old-side walk: everything missing (or renamed) on the new side is
        // a delete; matches are marked walked so the add pass skips them
        for (checksum, old_sub) in &old.dirs {
            match new.dirs.get(checksum) {
                Some(new_sub) if new_sub.object.name == old_sub.object.name => {
                    new_sub.object.mark_walked();
                    compare_dirs(old_root, new_root, old_sub, new_sub, syncer, peer).await?;
                }
                _ => {
                    let unrooted = unroot(old_root, &old_sub.object.path);
                    syncer.delete_dir(old_root, &unrooted, old_sub, peer).await?;
                }
            }
        }
        for (checksum, old_file) in &old.files {
            match new.files.get(checksum) {
                Some(new_file) if new_file.object.name == old_file.object.name => {
                    new_file.object.mark_walked();
                }
                _ => {
                    let unrooted = unroot(old_root, &old_file.object.path);
                    syncer
                        .delete_file(old_root, &unrooted, old_file, peer)
                        .await?;
                }
            }
        }

        // new-side walk: anything not reached above is an add
        for new_sub in new.dirs.values() {
            if !new_sub.object.is_walked() {
                let unrooted = unroot(new_root, &new_sub.object.path);
                syncer.add_dir(new_root, &unrooted, new_sub, peer).await?;
            }
        }
        for new_file in new.files.values() {
            if !new_file.object.is_walked() {
                let unrooted = unroot(new_root, &new_file.object.path);
                syncer.add_file(new_root, &unrooted, new_file, peer).await?;
            }
        }

        Ok(())
    })
}

/// Apply `action` to every immediate child of `dir`, directories first then
/// files. Directory callbacks recurse back into this walk, so one call
/// covers the whole subtree.
pub async fn walk_sub_dir(
    root_path: &str,
    dir: &Dir,
    peer: &Peer,
    syncer: &dyn Syncer,
    action: WalkAction,
) -> Result<()> {
    for sub in dir.dirs.values() {
        let unrooted = unroot(root_path, &sub.object.path);
        match action {
            WalkAction::Add => syncer.add_dir(root_path, &unrooted, sub, peer).await?,
            WalkAction::Delete => syncer.delete_dir(root_path, &unrooted, sub, peer).await?,
        }
    }
    for file in dir.files.values() {
        let unrooted = unroot(root_path, &file.object.path);
        match action {
            WalkAction::Add => syncer.add_file(root_path, &unrooted, file, peer).await?,
            WalkAction::Delete => syncer.delete_file(root_path, &unrooted, file, peer).await?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::Mutex;

    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::error::Error;
    use crate::transport::Hub;
    use crate::tree::build;

    /// Records every emitted operation, recursing like a real syncer.
    #[derive(Default)]
    struct Recorder {
        ops: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    impl Recorder {
        fn record(&self, op: &str, unroot_path: &str) -> Result<()> {
            if self.fail_on.as_deref() == Some(unroot_path) {
                return Err(Error::protocol(format!("injected failure at {unroot_path}")));
            }
            self.ops.lock().unwrap().push(format!("{op} {unroot_path}"));
            Ok(())
        }

        fn ops(&self) -> Vec<String> {
            let mut ops = self.ops.lock().unwrap().clone();
            ops.sort();
            ops
        }
    }

    #[async_trait]
    impl Syncer for Recorder {
        async fn add_file(
            &self,
            _root: &str,
            unroot_path: &str,
            _file: &File,
            _peer: &Peer,
        ) -> Result<()> {
            self.record("add-file", unroot_path)
        }

        async fn delete_file(
            &self,
            _root: &str,
            unroot_path: &str,
            _file: &File,
            _peer: &Peer,
        ) -> Result<()> {
            self.record("delete-file", unroot_path)
        }

        async fn add_dir(
            &self,
            root: &str,
            unroot_path: &str,
            dir: &Dir,
            peer: &Peer,
        ) -> Result<()> {
            self.record("add-dir", unroot_path)?;
            walk_sub_dir(root, dir, peer, self, WalkAction::Add).await
        }

        async fn delete_dir(
            &self,
            root: &str,
            unroot_path: &str,
            dir: &Dir,
            peer: &Peer,
        ) -> Result<()> {
            self.record("delete-dir", unroot_path)?;
            walk_sub_dir(root, dir, peer, self, WalkAction::Delete).await
        }
    }

    async fn idle_peer() -> Arc<Peer> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stream, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let _held = accepted.unwrap();
        let (hub, _requests) = Hub::spawn(stream.unwrap());
        Arc::new(Peer::new(hub, addr, false))
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn equal_trees_emit_nothing() {
        let scratch = tempfile::tempdir().unwrap();
        write(scratch.path(), "a.txt", "A");
        let old = build(scratch.path()).unwrap();
        let new = build(scratch.path()).unwrap();

        let recorder = Recorder::default();
        let peer = idle_peer().await;
        compare(&old, &new, &recorder, &peer).await.unwrap();
        assert!(recorder.ops().is_empty());
    }

    #[tokio::test]
    async fn one_add_and_one_delete_per_changed_node() {
        let old_dir = tempfile::tempdir().unwrap();
        write(old_dir.path(), "keep.txt", "same");
        write(old_dir.path(), "gone.txt", "old only");
        let new_dir = tempfile::tempdir().unwrap();
        write(new_dir.path(), "keep.txt", "same");
        write(new_dir.path(), "fresh.txt", "new only");

        let old = build(old_dir.path()).unwrap();
        let new = build(new_dir.path()).unwrap();

        let recorder = Recorder::default();
        let peer = idle_peer().await;
        compare(&old, &new, &recorder, &peer).await.unwrap();
        assert_eq!(
            recorder.ops(),
            vec!["add-file /fresh.txt", "delete-file /gone.txt"]
        );
    }

    #[tokio::test]
    async fn new_subtree_adds_every_descendant_once() {
        let old_dir = tempfile::tempdir().unwrap();
        write(old_dir.path(), "a.txt", "A");
        let new_dir = tempfile::tempdir().unwrap();
        write(new_dir.path(), "a.txt", "A");
        write(new_dir.path(), "sub/b.txt", "B");
        write(new_dir.path(), "sub/deeper/c.txt", "C");

        let old = build(old_dir.path()).unwrap();
        let new = build(new_dir.path()).unwrap();

        let recorder = Recorder::default();
        let peer = idle_peer().await;
        compare(&old, &new, &recorder, &peer).await.unwrap();
        assert_eq!(
            recorder.ops(),
            vec![
                "add-dir /sub",
                "add-dir /sub/deeper",
                "add-file /sub/b.txt",
                "add-file /sub/deeper/c.txt",
            ]
        );
    }

    #[tokio::test]
    async fn change_inside_a_nested_directory_recurses() {
        let old_dir = tempfile::tempdir().unwrap();
        write(old_dir.path(), "top.txt", "same");
        write(old_dir.path(), "sub/inner.txt", "before");
        let new_dir = tempfile::tempdir().unwrap();
        write(new_dir.path(), "top.txt", "same");
        write(new_dir.path(), "sub/inner.txt", "after");

        let old = build(old_dir.path()).unwrap();
        let new = build(new_dir.path()).unwrap();

        let recorder = Recorder::default();
        let peer = idle_peer().await;
        compare(&old, &new, &recorder, &peer).await.unwrap();
        // the sub directory itself matched by name but not checksum, so it
        // is replayed whole: the old subtree deleted, the new one added
        assert_eq!(
            recorder.ops(),
            vec![
                "add-dir /sub",
                "add-file /sub/inner.txt",
                "delete-dir /sub",
                "delete-file /sub/inner.txt",
            ]
        );
    }

    #[tokio::test]
    async fn rename_is_a_delete_plus_an_add_at_the_same_checksum() {
        let old_dir = tempfile::tempdir().unwrap();
        write(old_dir.path(), "a.txt", "A");
        write(old_dir.path(), "b.txt", "B");
        let new_dir = tempfile::tempdir().unwrap();
        write(new_dir.path(), "c.txt", "A");
        write(new_dir.path(), "b.txt", "B");

        let old = build(old_dir.path()).unwrap();
        let new = build(new_dir.path()).unwrap();

        let recorder = Recorder::default();
        let peer = idle_peer().await;
        compare(&old, &new, &recorder, &peer).await.unwrap();
        assert_eq!(
            recorder.ops(),
            vec!["add-file /c.txt", "delete-file /a.txt"]
        );
    }

    #[tokio::test]
    async fn walked_markers_reset_on_success() {
        let old_dir = tempfile::tempdir().unwrap();
        write(old_dir.path(), "a.txt", "A");
        write(old_dir.path(), "sub/b.txt", "B");
        let new_dir = tempfile::tempdir().unwrap();
        write(new_dir.path(), "a.txt", "A");
        write(new_dir.path(), "sub/b.txt", "B");
        write(new_dir.path(), "x.txt", "X");

        let old = build(old_dir.path()).unwrap();
        let new = build(new_dir.path()).unwrap();

        let recorder = Recorder::default();
        let peer = idle_peer().await;
        compare(&old, &new, &recorder, &peer).await.unwrap();
        assert!(!old.any_walked());
        assert!(!new.any_walked());
    }

    #[tokio::test]
    async fn walked_markers_reset_on_error() {
        let old_dir = tempfile::tempdir().unwrap();
        write(old_dir.path(), "a.txt", "A");
        let new_dir = tempfile::tempdir().unwrap();
        write(new_dir.path(), "a.txt", "A");
        write(new_dir.path(), "boom.txt", "kaboom");
        write(new_dir.path(), "sub/b.txt", "B");

        let old = build(old_dir.path()).unwrap();
        let new = build(new_dir.path()).unwrap();

        let recorder = Recorder {
            fail_on: Some("/boom.txt".into()),
            ..Default::default()
        };
        let peer = idle_peer().await;
        assert!(compare(&old, &new, &recorder, &peer).await.is_err());
        assert!(!old.any_walked());
        assert!(!new.any_walked());
    }

    #[tokio::test]
    async fn unroot_strips_only_the_owning_prefix() {
        assert_eq!(unroot("/watch/root", "/watch/root/sub/a.txt"), "/sub/a.txt");
        assert_eq!(unroot("", "/abs/path"), "/abs/path");
        assert_eq!(unroot("/other", "/abs/path"), "/abs/path");
    }
}
