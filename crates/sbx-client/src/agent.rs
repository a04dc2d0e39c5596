//! The client agent.
//!
//! Periodically scans the watched root, uploads a digest when the tree
//! changed, and answers server-initiated requests: mirrored digests are
//! applied to the local filesystem, sync pulls serve file bytes back, and
//! file pushes land remote content on disk.
//!
//! `file_ops` counts in-flight remote-driven file changes; the scanner
//! refuses to run while it is non-zero so a half-applied remote update is
//! not misread as local divergence.

use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use sbx_core::constants::{DEFAULT_SERVER_PORT, DIGEST_FILE_NAME, SCAN_PERIOD};
use sbx_core::error::{Error, Result};
use sbx_core::protocol::{
    Action, DigestPayload, FilePayload, Identity, IdentityPayload, Request, Response, SyncPayload,
};
use sbx_core::sync::{compare, walk_sub_dir, Syncer, WalkAction};
use sbx_core::transport::{run_request_loop, Hub, Peer, RequestProcessor, RetryPolicy};
use sbx_core::tree::{self, Dir, File};

/// Immutable agent settings, built once from CLI + environment.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub root_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub server_host: String,
    pub server_port: u16,
    pub identity: Identity,
    pub scan_period: Duration,
    pub retry: RetryPolicy,
}

impl ClientConfig {
    pub fn new(root_dir: PathBuf, tmp_dir: PathBuf, server_host: String, identity: Identity) -> Self {
        Self {
            root_dir,
            tmp_dir,
            server_host,
            server_port: DEFAULT_SERVER_PORT,
            identity,
            scan_period: SCAN_PERIOD,
            retry: RetryPolicy::default(),
        }
    }
}

/// The last scanned and last acknowledged trees.
struct Trees {
    old_dir: Dir,
    new_dir: Dir,
}

pub struct Client {
    config: ClientConfig,
    peer: RwLock<Option<Arc<Peer>>>,
    trees: Mutex<Trees>,
    /// In-flight remote-driven file changes; gates the scanner.
    file_ops: AtomicI64,
}

impl Client {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            peer: RwLock::new(None),
            trees: Mutex::new(Trees {
                old_dir: Dir::empty(),
                new_dir: Dir::empty(),
            }),
            file_ops: AtomicI64::new(0),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Run the agent: connect, then scan forever. Returns only on a fatal
    /// error (connection lost beyond the retry budget).
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.reset_tmp_dir().await?;
        Arc::clone(&self).dial().await?;

        let mut ticker = tokio::time::interval(self.config.scan_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !self.could_scan() {
                debug!(
                    in_flight = self.file_ops.load(Ordering::SeqCst),
                    "remote update in progress, skipping scan"
                );
                continue;
            }
            if let Err(err) = Arc::clone(&self).scan().await {
                if err.is_peer_closed() {
                    return Err(err);
                }
                // a failed scan retries next cycle
                warn!(error = %err, "scan failed");
            }
        }
    }

    /// Dial the server, wire up a fresh hub/peer, and start the request
    /// loop for server-initiated traffic.
    pub async fn dial(self: Arc<Self>) -> Result<Arc<Peer>> {
        let stream = TcpStream::connect((
            self.config.server_host.as_str(),
            self.config.server_port,
        ))
        .await?;
        let addr: SocketAddr = stream.peer_addr()?;
        let (hub, requests) = Hub::spawn(stream);
        let peer = Arc::new(Peer::new(hub, addr, false));
        *self.peer.write().unwrap() = Some(Arc::clone(&peer));

        let client = Arc::clone(&self);
        let loop_peer = Arc::clone(&peer);
        tokio::spawn(async move {
            if let Err(err) = run_request_loop(Arc::clone(&loop_peer), requests, client).await {
                error!(error = %err, "request loop failed");
            }
            loop_peer.hub().fail_waiters();
            info!("connection to server closed");
        });
        info!(server = %addr, "connected");

        // introduce ourselves so the server can create the user row
        if let Err(err) = peer
            .send_identity_request(&self.config.identity, &self.config.identity.username)
            .await
        {
            warn!(error = %err, "identity request failed");
        }
        Ok(peer)
    }

    fn peer(&self) -> Result<Arc<Peer>> {
        self.peer
            .read()
            .unwrap()
            .clone()
            .ok_or(Error::PeerClosed)
    }

    fn could_scan(&self) -> bool {
        self.file_ops.load(Ordering::SeqCst) == 0
    }

    fn enter_file_op(&self) {
        self.file_ops.fetch_add(1, Ordering::SeqCst);
    }

    fn exit_file_op(&self) {
        self.file_ops.fetch_sub(1, Ordering::SeqCst);
    }

    /// One scan cycle: rebuild the tree, and if its root checksum moved,
    /// persist the digest and upload it.
    pub async fn scan(self: Arc<Self>) -> Result<()> {
        let digest_path = self.config.root_dir.join(DIGEST_FILE_NAME);
        let old_dir = match std::fs::read(&digest_path) {
            Ok(bytes) => Some(Dir::from_json(&bytes)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        let new_dir = tree::build(&self.config.root_dir)?;

        if let Some(old) = &old_dir {
            if old.checksum() == new_dir.checksum() {
                return Ok(());
            }
        }
        info!(checksum = %new_dir.checksum(), "tree changed, uploading digest");

        self.write_digest(&new_dir)?;
        {
            let mut trees = self.trees.lock().unwrap();
            trees.old_dir = old_dir.unwrap_or_else(Dir::empty);
            trees.new_dir = new_dir.clone();
        }

        let response = Arc::clone(&self).send_digest_with_retry(&new_dir).await?;
        debug!(status = response.status, "digest acknowledged");
        Ok(())
    }

    /// Upload `dir`, re-dialing before the next attempt when the connection
    /// looks gone.
    async fn send_digest_with_retry(self: Arc<Self>, dir: &Dir) -> Result<Response> {
        let policy = self.config.retry;
        let mut last = Error::PeerClosed;
        for attempt in 1..=policy.attempts {
            let result = match self.peer() {
                Ok(peer) => peer.send_digest_request(&self.config.identity, dir).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(response) => return Ok(response),
                Err(err) => {
                    warn!(attempt, error = %err, "digest upload failed");
                    last = err;
                }
            }
            if !policy.has_next(attempt) {
                break;
            }
            tokio::time::sleep(policy.delay).await;
            if last.is_peer_closed() {
                if let Err(err) = Arc::clone(&self).dial().await {
                    warn!(error = %err, "redial failed");
                }
            }
        }
        Err(last)
    }

    fn write_digest(&self, dir: &Dir) -> Result<()> {
        let path = self.config.root_dir.join(DIGEST_FILE_NAME);
        std::fs::write(path, dir.to_json()?)?;
        Ok(())
    }

    /// Rebuild an absolute path under our own root from a peer-relative one.
    fn reborn_path(&self, unroot_path: &str) -> PathBuf {
        self.config
            .root_dir
            .join(unroot_path.trim_start_matches('/'))
    }

    /// Where a content sits in the scratch dir, keyed by checksum so a
    /// delete followed by an add (a move or rename) reclaims the bytes
    /// without a transfer.
    fn tmp_path(&self, file: &File) -> PathBuf {
        self.config
            .tmp_dir
            .join(file.checksum().to_num_string())
    }

    async fn reset_tmp_dir(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.config.tmp_dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        tokio::fs::create_dir_all(&self.config.tmp_dir).await?;
        Ok(())
    }
}

#[async_trait]
impl RequestProcessor for Client {
    /// The client trusts the server's identity.
    async fn process_identity(&self, request: Request, peer: Arc<Peer>) -> Result<()> {
        let _payload: IdentityPayload = request.decode()?;
        peer.accept(&request).await
    }

    /// The server is mirroring a newer tree: apply the difference locally,
    /// then adopt it as our own view so the next scan does not bounce the
    /// same digest back (ping-pong).
    async fn process_digest(&self, request: Request, peer: Arc<Peer>) -> Result<()> {
        let payload: DigestPayload = request.decode()?;
        let server_dir = payload.dir;

        let local_dir = self.trees.lock().unwrap().new_dir.clone();
        compare(&local_dir, &server_dir, self, &peer).await?;

        self.reset_tmp_dir().await?;
        {
            let mut trees = self.trees.lock().unwrap();
            trees.old_dir = server_dir.clone();
            trees.new_dir = server_dir.clone();
        }
        self.write_digest(&server_dir)?;

        peer.accept(&request).await
    }

    /// The server wants our bytes for a content it has not stored yet.
    async fn process_sync(&self, request: Request, peer: Arc<Peer>) -> Result<()> {
        let payload: SyncPayload = request.decode()?;
        match payload.action {
            Action::Get => {
                let path = self.reborn_path(&payload.unroot_path);
                let content = tokio::fs::read(&path).await?;
                peer.accept(&request).await?;
                let response = peer
                    .send_file_request(
                        &self.config.identity,
                        &payload.unroot_path,
                        &payload.file,
                        &content,
                    )
                    .await?;
                debug!(
                    status = response.status,
                    path = %path.display(),
                    "content delivered"
                );
                Ok(())
            }
            _ => peer.accept(&request).await,
        }
    }

    /// Content we asked for has arrived: write it with its declared mode and
    /// release the scanner gate.
    async fn process_file(&self, request: Request, peer: Arc<Peer>) -> Result<()> {
        let payload: FilePayload = request.decode()?;
        let path = self.reborn_path(&payload.unroot_path);
        let written: Result<()> = async {
            tokio::fs::write(&path, &payload.content).await?;
            tokio::fs::set_permissions(
                &path,
                std::fs::Permissions::from_mode(payload.file.object.mode),
            )
            .await?;
            Ok(())
        }
        .await;
        // release the scanner gate even when the write fails
        self.exit_file_op();
        written?;
        debug!(path = %path.display(), bytes = payload.content.len(), "content written");
        peer.accept(&request).await
    }
}

#[async_trait]
impl Syncer for Client {
    /// Place a file locally: reclaim the bytes from the scratch dir when a
    /// recent delete stashed them there, otherwise pull from the server.
    async fn add_file(
        &self,
        _root_path: &str,
        unroot_path: &str,
        file: &File,
        peer: &Peer,
    ) -> Result<()> {
        self.enter_file_op();
        let target = self.reborn_path(unroot_path);
        match tokio::fs::rename(self.tmp_path(file), &target).await {
            Ok(()) => {
                debug!(path = unroot_path, "content reclaimed from scratch dir");
                self.exit_file_op();
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let result = peer
                    .send_sync_request(&self.config.identity, Action::Get, unroot_path, file)
                    .await;
                match result {
                    Ok(response) => {
                        // the gate stays up until the file payload lands
                        debug!(status = response.status, path = unroot_path, "content requested");
                        Ok(())
                    }
                    Err(err) => {
                        self.exit_file_op();
                        Err(err)
                    }
                }
            }
            Err(err) => {
                self.exit_file_op();
                Err(err.into())
            }
        }
    }

    /// Stash the bytes in the scratch dir keyed by checksum so a following
    /// add can reclaim them.
    async fn delete_file(
        &self,
        _root_path: &str,
        unroot_path: &str,
        file: &File,
        _peer: &Peer,
    ) -> Result<()> {
        self.enter_file_op();
        let source = self.reborn_path(unroot_path);
        let result = tokio::fs::rename(&source, self.tmp_path(file)).await;
        self.exit_file_op();
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn add_dir(
        &self,
        root_path: &str,
        unroot_path: &str,
        dir: &Dir,
        peer: &Peer,
    ) -> Result<()> {
        match tokio::fs::create_dir(self.reborn_path(unroot_path)).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err.into()),
        }
        walk_sub_dir(root_path, dir, peer, self, WalkAction::Add).await
    }

    async fn delete_dir(
        &self,
        root_path: &str,
        unroot_path: &str,
        dir: &Dir,
        peer: &Peer,
    ) -> Result<()> {
        walk_sub_dir(root_path, dir, peer, self, WalkAction::Delete).await?;
        match tokio::fs::remove_dir_all(self.reborn_path(unroot_path)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
