//! Wire protocol: packet framing and message envelopes.

pub mod envelope;
pub mod packet;

pub use envelope::{
    Action, DataType, DigestPayload, FilePayload, Identity, IdentityPayload, Request, Response,
    SyncPayload,
};
pub use packet::{MessageId, Packet};
