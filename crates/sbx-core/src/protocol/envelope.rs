//! Request/response envelopes and the four payload variants.
//!
//! A message on the wire is one prefix byte (`q` = request, `s` = response)
//! followed by the UTF-8 JSON envelope and a trailing 0x04 delimiter. The
//! envelope's `data` field carries the JSON-encoded variant payload; binary
//! fields travel base64-encoded.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{
    MESSAGE_ACCEPT, MESSAGE_DENY, STATUS_BAD, STATUS_OK, TYPE_DIGEST, TYPE_FILE, TYPE_IDENTITY,
    TYPE_SYNC_REQUEST,
};
use crate::error::{Error, Result};
use crate::tree::{Dir, File};

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// The (username, password hash, device) triple carried by every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub password: String,
    pub device: String,
}

/// The kind of payload a request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Identity,
    Digest,
    SyncRequest,
    File,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Identity => TYPE_IDENTITY,
            DataType::Digest => TYPE_DIGEST,
            DataType::SyncRequest => TYPE_SYNC_REQUEST,
            DataType::File => TYPE_FILE,
        }
    }
}

/// Request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: String,
    pub username: String,
    pub password: String,
    pub device: String,
    pub data_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Request {
    /// Build a request with a fresh UUID and the given payload bytes.
    pub fn new(identity: &Identity, data_type: DataType, data: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            username: identity.username.clone(),
            password: identity.password.clone(),
            device: identity.device.clone(),
            data_type: data_type.as_str().to_string(),
            data,
        }
    }

    /// Resolve the wire data type string to the closed enum.
    ///
    /// Anything outside the known set is a protocol violation and tears the
    /// connection down.
    pub fn kind(&self) -> Result<DataType> {
        match self.data_type.as_str() {
            TYPE_IDENTITY => Ok(DataType::Identity),
            TYPE_DIGEST => Ok(DataType::Digest),
            TYPE_SYNC_REQUEST => Ok(DataType::SyncRequest),
            TYPE_FILE => Ok(DataType::File),
            other => Err(Error::UnknownRequestType(other.to_string())),
        }
    }

    /// Decode the variant payload carried in `data`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.data).map_err(Into::into)
    }
}

/// Response envelope, correlated to its request by `requestId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub request_id: String,
    pub status: u16,
    pub message: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Response {
    pub fn accept(request: &Request) -> Self {
        Self {
            request_id: request.id.clone(),
            status: STATUS_OK,
            message: MESSAGE_ACCEPT.to_string(),
            data: Vec::new(),
        }
    }

    pub fn deny(request: &Request) -> Self {
        Self {
            request_id: request.id.clone(),
            status: STATUS_BAD,
            message: MESSAGE_DENY.to_string(),
            data: Vec::new(),
        }
    }

    pub fn is_accept(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// File operation verbs. Only `get` drives a transfer today; the others are
/// reserved wire literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Add,
    Delete,
    Rename,
    Update,
    Get,
}

/// Payload of an IDENTITY request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityPayload {
    pub username: String,
}

/// Payload of a DIGEST request: a whole tree snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestPayload {
    pub dir: Dir,
}

/// Payload of a SYNC-REQUEST: an action on one file placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    pub action: Action,
    pub file: File,
    pub unroot_path: String,
}

/// Payload of a FILE request: file bytes plus their placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePayload {
    pub file: File,
    pub unroot_path: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}
