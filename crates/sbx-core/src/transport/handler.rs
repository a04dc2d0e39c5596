//! The per-connection request loop.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::error;

use crate::error::{Error, Result};
use crate::protocol::{DataType, Request};
use crate::transport::Peer;

/// Dispatch target for inbound requests, implemented by the client and the
/// server agents.
#[async_trait]
pub trait RequestProcessor: Send + Sync + 'static {
    async fn process_identity(&self, request: Request, peer: Arc<Peer>) -> Result<()>;
    async fn process_digest(&self, request: Request, peer: Arc<Peer>) -> Result<()>;
    async fn process_sync(&self, request: Request, peer: Arc<Peer>) -> Result<()>;
    async fn process_file(&self, request: Request, peer: Arc<Peer>) -> Result<()>;

    /// Non-fatal errors surfaced by spawned handlers.
    fn handle_error(&self, error: Error) {
        error!(error = %error, "request handler failed");
    }
}

/// Drive the request side of a connection until the peer goes away.
///
/// Each request runs on its own task so a slow handler never stalls packet
/// reassembly. Envelope decode failures are reported and skipped; an unknown
/// data type or a rejected identity rebind is a protocol violation and
/// returns the error, which tears the connection down.
pub async fn run_request_loop<P>(
    peer: Arc<Peer>,
    mut requests: mpsc::Receiver<Vec<u8>>,
    processor: Arc<P>,
) -> Result<()>
where
    P: RequestProcessor,
{
    while let Some(body) = requests.recv().await {
        let request: Request = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(err) => {
                processor.handle_error(err.into());
                continue;
            }
        };
        let kind = request.kind()?;
        peer.bind_identity(&request)?;

        let processor = Arc::clone(&processor);
        let peer = Arc::clone(&peer);
        tokio::spawn(async move {
            let result = match kind {
                DataType::Identity => processor.process_identity(request, peer).await,
                DataType::Digest => processor.process_digest(request, peer).await,
                DataType::SyncRequest => processor.process_sync(request, peer).await,
                DataType::File => processor.process_file(request, peer).await,
            };
            if let Err(err) = result {
                processor.handle_error(err);
            }
        });
    }
    Ok(())
}
