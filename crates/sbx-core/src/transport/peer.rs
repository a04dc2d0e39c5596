//! Peer: a logical endpoint on one connection.
//!
//! A peer holds a shared handle to its hub plus the identity lazily bound by
//! the first request received on the connection. Their lifetimes equal the
//! connection's.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::error::{Error, Result};
use crate::protocol::{
    Action, DataType, DigestPayload, FilePayload, Identity, IdentityPayload, Request, Response,
    SyncPayload,
};
use crate::transport::Hub;
use crate::tree::{Dir, File};

pub struct Peer {
    hub: Arc<Hub>,
    address: SocketAddr,
    identity: Mutex<Option<Identity>>,
    allow_rebind: bool,
}

impl Peer {
    pub fn new(hub: Arc<Hub>, address: SocketAddr, allow_rebind: bool) -> Self {
        Self {
            hub,
            address,
            identity: Mutex::new(None),
            allow_rebind,
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.lock().unwrap().clone()
    }

    pub fn username(&self) -> Option<String> {
        self.identity().map(|id| id.username)
    }

    pub fn device(&self) -> Option<String> {
        self.identity().map(|id| id.device)
    }

    /// Bind or reaffirm the identity carried by `request`.
    ///
    /// The first request on a connection establishes who the peer is. A
    /// later request carrying a different (username, device) is rejected
    /// unless rebinding was explicitly allowed.
    pub fn bind_identity(&self, request: &Request) -> Result<()> {
        let incoming = Identity {
            username: request.username.clone(),
            password: request.password.clone(),
            device: request.device.clone(),
        };
        let mut bound = self.identity.lock().unwrap();
        match bound.as_ref() {
            None => {
                *bound = Some(incoming);
                Ok(())
            }
            Some(current)
                if current.username == incoming.username && current.device == incoming.device =>
            {
                *bound = Some(incoming);
                Ok(())
            }
            Some(current) if self.allow_rebind => {
                info!(
                    from = %current.username,
                    to = %incoming.username,
                    "peer identity rebound"
                );
                *bound = Some(incoming);
                Ok(())
            }
            Some(current) => Err(Error::IdentityRebind(format!(
                "({}, {}) -> ({}, {})",
                current.username, current.device, incoming.username, incoming.device
            ))),
        }
    }

    pub async fn send_identity_request(
        &self,
        identity: &Identity,
        username: &str,
    ) -> Result<Response> {
        let payload = serde_json::to_vec(&IdentityPayload {
            username: username.to_string(),
        })?;
        let request = Request::new(identity, DataType::Identity, payload);
        self.hub.send_request_for_response(&request).await
    }

    pub async fn send_digest_request(&self, identity: &Identity, dir: &Dir) -> Result<Response> {
        let payload = serde_json::to_vec(&DigestPayload { dir: dir.clone() })?;
        let request = Request::new(identity, DataType::Digest, payload);
        self.hub.send_request_for_response(&request).await
    }

    pub async fn send_sync_request(
        &self,
        identity: &Identity,
        action: Action,
        unroot_path: &str,
        file: &File,
    ) -> Result<Response> {
        let payload = serde_json::to_vec(&SyncPayload {
            action,
            file: file.clone(),
            unroot_path: unroot_path.to_string(),
        })?;
        let request = Request::new(identity, DataType::SyncRequest, payload);
        self.hub.send_request_for_response(&request).await
    }

    pub async fn send_file_request(
        &self,
        identity: &Identity,
        unroot_path: &str,
        file: &File,
        content: &[u8],
    ) -> Result<Response> {
        let payload = serde_json::to_vec(&FilePayload {
            file: file.clone(),
            unroot_path: unroot_path.to_string(),
            content: content.to_vec(),
        })?;
        let request = Request::new(identity, DataType::File, payload);
        self.hub.send_request_for_response(&request).await
    }

    /// Acknowledge `request` with 200 ACCEPT.
    pub async fn accept(&self, request: &Request) -> Result<()> {
        self.hub.send_response(&Response::accept(request)).await
    }

    /// Refuse `request` with 400 DENY.
    pub async fn deny(&self, request: &Request) -> Result<()> {
        self.hub.send_response(&Response::deny(request)).await
    }
}
