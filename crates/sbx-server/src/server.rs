//! The server agent.
//!
//! Accepts connections, reconciles per-user digests with newest-tree-wins,
//! serves and ingests blobs, keeps the reference rows honest, and garbage
//! collects contents whose last placement dropped.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info};

use sbx_core::constants::{
    ANY_ADDR, DEFAULT_SERVER_PORT, DIGEST_FILE_NAME, SERVER_DEVICE, SERVER_PASSWORD,
    SERVER_USERNAME,
};
use sbx_core::error::{Error, Result};
use sbx_core::protocol::{
    Action, DigestPayload, FilePayload, Identity, IdentityPayload, Request, SyncPayload,
};
use sbx_core::store::BlobStore;
use sbx_core::sync::{compare, walk_sub_dir, Syncer, WalkAction};
use sbx_core::transport::{run_request_loop, Hub, Peer, RequestProcessor};
use sbx_core::tree::{Dir, File};

use crate::db::{AddOutcome, Db};
use crate::ref_graph::RefGraph;

/// Runtime settings for the server agent.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    /// Accept a mid-connection identity change instead of rejecting it.
    pub allow_identity_rebind: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: ANY_ADDR.parse().expect("any-address literal parses"),
            port: DEFAULT_SERVER_PORT,
            allow_identity_rebind: false,
        }
    }
}

pub struct Server {
    db: Db,
    storage: Arc<dyn BlobStore>,
    config: ServerConfig,
    /// Credentials presented on server-initiated requests.
    identity: Identity,
    /// Live peers keyed by remote address; entries leave exactly once, when
    /// the connection's request loop ends.
    clients: AsyncMutex<HashMap<SocketAddr, Arc<Peer>>>,
    /// Lazily-built per-peer reference graphs, dropped with the connection.
    graphs: AsyncMutex<HashMap<SocketAddr, Arc<RefGraph>>>,
    /// Per-user lock serializing concurrent digest reconciliations.
    merge_locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Server {
    pub fn new(db: Db, storage: Arc<dyn BlobStore>, config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            db,
            storage,
            config,
            identity: Identity {
                username: SERVER_USERNAME.to_string(),
                password: SERVER_PASSWORD.to_string(),
                device: SERVER_DEVICE.to_string(),
            },
            clients: AsyncMutex::new(HashMap::new()),
            graphs: AsyncMutex::new(HashMap::new()),
            merge_locks: AsyncMutex::new(HashMap::new()),
        })
    }

    /// Bind the configured address. Split from [`Self::serve`] so tests can
    /// bind port 0 and read the ephemeral address back.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind((self.config.bind_addr, self.config.port)).await?;
        info!(addr = %listener.local_addr()?, "server listening");
        Ok(listener)
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!(%addr, "accepted connection");
            Arc::clone(&self).attach(stream, addr).await;
        }
    }

    pub async fn listen(self: Arc<Self>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Wrap a fresh connection in a hub/peer, register it, and start its
    /// request loop.
    pub async fn attach(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Arc<Peer> {
        let (hub, requests) = Hub::spawn(stream);
        let peer = Arc::new(Peer::new(hub, addr, self.config.allow_identity_rebind));
        self.clients.lock().await.insert(addr, Arc::clone(&peer));

        let server = Arc::clone(&self);
        let loop_peer = Arc::clone(&peer);
        tokio::spawn(async move {
            if let Err(err) = run_request_loop(Arc::clone(&loop_peer), requests, server.clone()).await
            {
                server.handle_error(err);
            }
            server.detach(addr).await;
        });
        peer
    }

    /// Remove a closed connection's state. Runs exactly once per peer.
    async fn detach(&self, addr: SocketAddr) {
        let removed = self.clients.lock().await.remove(&addr);
        self.graphs.lock().await.remove(&addr);
        if let Some(peer) = removed {
            peer.hub().fail_waiters();
            debug!(%addr, "connection closed");
        }
    }

    /// Number of live connections. Test support.
    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Fetch (building on first use) the reference graph for this peer.
    async fn ref_graph(&self, request: &Request, peer: &Peer) -> Result<Arc<RefGraph>> {
        let mut graphs = self.graphs.lock().await;
        if let Some(graph) = graphs.get(&peer.address()) {
            return Ok(Arc::clone(graph));
        }
        let graph = Arc::new(
            RefGraph::load(self.db.clone(), &request.username, &request.password).await?,
        );
        graphs.insert(peer.address(), Arc::clone(&graph));
        Ok(graph)
    }

    /// The already-built graph for a peer mid-reconciliation.
    async fn graph_for(&self, peer: &Peer) -> Result<Arc<RefGraph>> {
        self.graphs
            .lock()
            .await
            .get(&peer.address())
            .cloned()
            .ok_or_else(|| Error::protocol("no reference graph bound to this connection"))
    }

    async fn merge_lock(&self, username: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.merge_locks.lock().await;
        Arc::clone(locks.entry(username.to_string()).or_default())
    }

    /// The persisted authoritative tree, or an empty one on first sync.
    async fn load_server_dir(&self, username: &str) -> Result<Dir> {
        match self.storage.get_object(username, DIGEST_FILE_NAME).await {
            Ok(bytes) => Dir::from_json(&bytes),
            Err(err) if err.is_no_such_key() => Ok(Dir::empty()),
            Err(err) => Err(err),
        }
    }

    async fn persist_digest(&self, username: &str, dir: &Dir) -> Result<()> {
        self.storage
            .create_object(username, DIGEST_FILE_NAME, &dir.to_json()?)
            .await
    }

    /// Mirror `dir` to every other live connection of the same user.
    async fn broadcast_digest(&self, username: &str, origin: SocketAddr, dir: &Dir) {
        let others: Vec<Arc<Peer>> = {
            let clients = self.clients.lock().await;
            clients
                .iter()
                .filter(|(addr, peer)| {
                    **addr != origin && peer.username().as_deref() == Some(username)
                })
                .map(|(_, peer)| Arc::clone(peer))
                .collect()
        };
        for other in others {
            debug!(to = %other.address(), "mirroring digest");
            if let Err(err) = other.send_digest_request(&self.identity, dir).await {
                error!(to = %other.address(), error = %err, "digest mirror failed");
            }
        }
    }

    /// Block until an object shows up in the store, bounded by the response
    /// timeout.
    async fn await_object(&self, username: &str, name: &str) -> Result<()> {
        for _ in 0..100 {
            match self.storage.get_object(username, name).await {
                Ok(_) => return Ok(()),
                Err(err) if err.is_no_such_key() => {
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::Timeout)
    }

    /// Delete contents whose last placement dropped: blob first, then row.
    async fn collect_garbage(&self, graph: &RefGraph, username: &str) -> Result<()> {
        let orphans = graph.no_ref_files().await?;
        for record in &orphans {
            self.storage.delete_object(username, &record.checksum).await?;
            graph.delete_file_record(record).await?;
        }
        if !orphans.is_empty() {
            info!(count = orphans.len(), "collected unreferenced contents");
        }
        Ok(())
    }
}

#[async_trait]
impl RequestProcessor for Server {
    async fn process_identity(&self, request: Request, peer: Arc<Peer>) -> Result<()> {
        let payload: IdentityPayload = request.decode()?;
        self.ref_graph(&request, &peer).await?;
        debug!(username = %payload.username, "identity affirmed");
        peer.accept(&request).await
    }

    async fn process_digest(&self, request: Request, peer: Arc<Peer>) -> Result<()> {
        let payload: DigestPayload = request.decode()?;
        let client_dir = payload.dir;
        let username = request.username.clone();

        let graph = self.ref_graph(&request, &peer).await?;
        let lock = self.merge_lock(&username).await;
        let _reconciling = lock.lock().await;

        self.storage.create_bucket(&username).await?;
        let server_dir = self.load_server_dir(&username).await?;

        // unblock the client before the potentially slow diff
        peer.accept(&request).await?;

        if client_dir.mod_time() > server_dir.mod_time() {
            // client holds the newer tree: pull its changes, then fan out
            compare(&server_dir, &client_dir, self, &peer).await?;
            self.broadcast_digest(&username, peer.address(), &client_dir)
                .await;
            self.persist_digest(&username, &client_dir).await?;
        } else {
            // server holds the newer tree: converge the sender instead
            debug!(%username, "client tree is stale, mirroring server view back");
            peer.send_digest_request(&self.identity, &server_dir).await?;
            self.persist_digest(&username, &server_dir).await?;
        }

        self.collect_garbage(&graph, &username).await
    }

    async fn process_sync(&self, request: Request, peer: Arc<Peer>) -> Result<()> {
        let payload: SyncPayload = request.decode()?;
        match payload.action {
            Action::Get => {
                let name = payload.file.checksum().to_num_string();
                let content = self.storage.get_object(&request.username, &name).await?;
                peer.accept(&request).await?;
                let response = peer
                    .send_file_request(
                        &self.identity,
                        &payload.unroot_path,
                        &payload.file,
                        &content,
                    )
                    .await?;
                debug!(status = response.status, object = %name, "content pushed to peer");
                Ok(())
            }
            _ => peer.accept(&request).await,
        }
    }

    async fn process_file(&self, request: Request, peer: Arc<Peer>) -> Result<()> {
        let payload: FilePayload = request.decode()?;
        let name = payload.file.checksum().to_num_string();
        self.storage
            .create_object(&request.username, &name, &payload.content)
            .await?;
        debug!(object = %name, bytes = payload.content.len(), "content ingested");
        peer.accept(&request).await
    }

    fn handle_error(&self, error: Error) {
        if error.is_peer_closed() {
            info!("{error}");
        } else {
            error!(error = %error, "request handler failed");
        }
    }
}

#[async_trait]
impl Syncer for Server {
    /// Record a placement, pulling the bytes from the client only when the
    /// content is new for this user.
    async fn add_file(
        &self,
        _root_path: &str,
        unroot_path: &str,
        file: &File,
        peer: &Peer,
    ) -> Result<()> {
        let graph = self.graph_for(peer).await?;
        let outcome = graph.add_file_record(file).await?;
        if outcome == AddOutcome::Inserted {
            let response = peer
                .send_sync_request(&self.identity, Action::Get, unroot_path, file)
                .await?;
            debug!(
                status = response.status,
                path = unroot_path,
                "requested content from peer"
            );
            // the peer acknowledges the pull before the file payload lands;
            // wait for ingestion so mirrored devices can fetch immediately
            let username = peer.username().unwrap_or_default();
            self.await_object(&username, &file.checksum().to_num_string())
                .await?;
        } else {
            debug!(path = unroot_path, "content already stored, skipping transfer");
        }
        let device = peer.device().unwrap_or_default();
        graph.add_file_ref_record(file, unroot_path, &device).await?;
        Ok(())
    }

    async fn delete_file(
        &self,
        _root_path: &str,
        unroot_path: &str,
        file: &File,
        peer: &Peer,
    ) -> Result<()> {
        let graph = self.graph_for(peer).await?;
        let removed = graph.delete_file_ref_records(file).await?;
        debug!(path = unroot_path, removed, "placement dropped");
        Ok(())
    }

    async fn add_dir(
        &self,
        root_path: &str,
        _unroot_path: &str,
        dir: &Dir,
        peer: &Peer,
    ) -> Result<()> {
        walk_sub_dir(root_path, dir, peer, self, WalkAction::Add).await
    }

    async fn delete_dir(
        &self,
        root_path: &str,
        _unroot_path: &str,
        dir: &Dir,
        peer: &Peer,
    ) -> Result<()> {
        walk_sub_dir(root_path, dir, peer, self, WalkAction::Delete).await
    }
}
