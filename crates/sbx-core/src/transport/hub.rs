//! The per-connection transport hub.
//!
//! A hub owns one TCP connection. The receive side is a pipeline of three
//! tasks wired by bounded channels:
//!
//! 1. packet reader - reads exactly one 1056-byte frame at a time and
//!    reassembles interleaved messages by message id
//! 2. message router - strips the trailing delimiter and splits the stream
//!    into requests and responses by prefix byte
//! 3. response dispatcher - correlates responses to waiting senders by
//!    request id
//!
//! The request stream is handed to the owning agent, whose request loop is
//! the connection's fourth task (see [`super::handler`]).

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::constants::{
    BYTE_DELIM, PACKET_TOTAL_SIZE, PROGRESS_PACKET_THRESHOLD, PROGRESS_STEP_PERCENT,
    REQUEST_PREFIX, RESPONSE_PREFIX, RESPONSE_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::protocol::packet::{self, MessageId, Packet};
use crate::protocol::{Request, Response};

/// Channel depth between the receive pipeline stages.
const PIPELINE_DEPTH: usize = 64;

/// Per-connection reader/writer and response correlation registry.
pub struct Hub {
    writer: AsyncMutex<OwnedWriteHalf>,
    waiters: Mutex<HashMap<String, oneshot::Sender<Response>>>,
    response_timeout: Duration,
}

impl Hub {
    /// Take ownership of `stream` and start the receive pipeline.
    ///
    /// Returns the hub handle plus the stream of reassembled request bodies
    /// for the owning agent's request loop.
    pub fn spawn(stream: TcpStream) -> (Arc<Hub>, mpsc::Receiver<Vec<u8>>) {
        Self::spawn_with_timeout(stream, RESPONSE_TIMEOUT)
    }

    pub fn spawn_with_timeout(
        stream: TcpStream,
        response_timeout: Duration,
    ) -> (Arc<Hub>, mpsc::Receiver<Vec<u8>>) {
        let (read_half, write_half) = stream.into_split();
        let hub = Arc::new(Hub {
            writer: AsyncMutex::new(write_half),
            waiters: Mutex::new(HashMap::new()),
            response_timeout,
        });

        let (message_tx, message_rx) = mpsc::channel(PIPELINE_DEPTH);
        let (request_tx, request_rx) = mpsc::channel(PIPELINE_DEPTH);
        let (response_tx, response_rx) = mpsc::channel(PIPELINE_DEPTH);

        tokio::spawn(read_packets(read_half, message_tx));
        tokio::spawn(route_messages(message_rx, request_tx, response_tx));
        tokio::spawn(Arc::clone(&hub).dispatch_responses(response_rx));

        (hub, request_rx)
    }

    pub async fn send_request(&self, request: &Request) -> Result<()> {
        self.send_message(REQUEST_PREFIX, &serde_json::to_vec(request)?)
            .await
    }

    pub async fn send_response(&self, response: &Response) -> Result<()> {
        self.send_message(RESPONSE_PREFIX, &serde_json::to_vec(response)?)
            .await
    }

    /// Send `request` and wait for its correlated response.
    ///
    /// The waiter is registered before the first byte goes out so a fast
    /// responder cannot race the registration. On timeout the waiter is
    /// removed; a response that still arrives afterwards is discarded by the
    /// dispatcher with a debug log line.
    pub async fn send_request_for_response(&self, request: &Request) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap()
            .insert(request.id.clone(), tx);

        if let Err(err) = self.send_request(request).await {
            self.waiters.lock().unwrap().remove(&request.id);
            return Err(err);
        }

        match timeout(self.response_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // sender dropped: the connection was torn down under us
            Ok(Err(_)) => Err(Error::PeerClosed),
            Err(_) => {
                self.waiters.lock().unwrap().remove(&request.id);
                Err(Error::Timeout)
            }
        }
    }

    /// Fail every waiter still pending. Called on connection teardown so
    /// in-flight `send_request_for_response` calls error out instead of
    /// sitting until their timeout.
    pub fn fail_waiters(&self) {
        let drained: Vec<_> = {
            let mut waiters = self.waiters.lock().unwrap();
            waiters.drain().collect()
        };
        if !drained.is_empty() {
            debug!(
                count = drained.len(),
                "failing pending waiters on closed connection"
            );
        }
        // dropping the senders wakes each waiter with a peer-closed error
    }

    /// Number of outstanding waiters. Test support.
    pub fn pending_waiters(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }

    async fn send_message(&self, prefix: u8, body: &[u8]) -> Result<()> {
        let mut framed = Vec::with_capacity(body.len() + 2);
        framed.push(prefix);
        framed.extend_from_slice(body);
        framed.push(BYTE_DELIM);

        let packets = packet::serialize(&framed)?;
        let mut writer = self.writer.lock().await;
        for packet in &packets {
            writer.write_all(&packet.to_bytes()).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    async fn dispatch_responses(self: Arc<Self>, mut responses: mpsc::Receiver<Vec<u8>>) {
        while let Some(body) = responses.recv().await {
            let response: Response = match serde_json::from_slice(&body) {
                Ok(response) => response,
                Err(err) => {
                    warn!(error = %err, "dropping undecodable response");
                    continue;
                }
            };
            let waiter = self
                .waiters
                .lock()
                .unwrap()
                .remove(&response.request_id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => debug!(
                    request_id = %response.request_id,
                    "no waiter for response, discarding"
                ),
            }
        }
        self.fail_waiters();
    }
}

/// Reassembly state for one in-flight message. Packets are keyed by
/// sequence so memory grows with what actually arrived, whatever the
/// declared total claims.
struct Assembly {
    total: usize,
    packets: BTreeMap<usize, Packet>,
    last_logged_step: usize,
}

async fn read_packets(mut reader: OwnedReadHalf, messages: mpsc::Sender<Vec<u8>>) {
    let mut pending: HashMap<MessageId, Assembly> = HashMap::new();
    let mut frame = [0u8; PACKET_TOTAL_SIZE];

    loop {
        if let Err(err) = reader.read_exact(&mut frame).await {
            if is_disconnect(&err) {
                debug!("peer socket closed");
            } else {
                error!(error = %err, "packet read failed, tearing down connection");
            }
            break;
        }

        let packet = match Packet::from_bytes(&frame) {
            Ok(packet) => packet,
            Err(err) => {
                error!(error = %err, "malformed packet, tearing down connection");
                break;
            }
        };

        let message_id = packet.message_id();
        let total = packet.total() as usize;
        let sequence = packet.sequence() as usize;

        let complete = {
            let assembly = pending.entry(message_id).or_insert_with(|| Assembly {
                total,
                packets: BTreeMap::new(),
                last_logged_step: 0,
            });
            if assembly.total != total {
                error!(
                    %message_id,
                    "inconsistent packet count within one message, tearing down connection"
                );
                break;
            }
            assembly.packets.insert(sequence, packet);
            log_progress(&message_id, assembly);
            assembly.packets.len() == total
        };

        if complete {
            let assembly = pending
                .remove(&message_id)
                .expect("completed assembly is present");
            let packets: Vec<Packet> = assembly.packets.into_values().collect();
            let body = packet::deserialize(&packets);
            if messages.send(body).await.is_err() {
                break;
            }
        }
    }
    // dropping `messages` unwinds the router and dispatcher stages
}

fn log_progress(message_id: &MessageId, assembly: &mut Assembly) {
    if assembly.total <= PROGRESS_PACKET_THRESHOLD {
        return;
    }
    let percent = assembly.packets.len() * 100 / assembly.total;
    let step = percent / PROGRESS_STEP_PERCENT * PROGRESS_STEP_PERCENT;
    if step > assembly.last_logged_step {
        assembly.last_logged_step = step;
        info!(
            %message_id,
            received = assembly.packets.len(),
            total = assembly.total,
            "reassembling large message: {step}%"
        );
    }
}

async fn route_messages(
    mut messages: mpsc::Receiver<Vec<u8>>,
    requests: mpsc::Sender<Vec<u8>>,
    responses: mpsc::Sender<Vec<u8>>,
) {
    while let Some(mut message) = messages.recv().await {
        match message.last() {
            Some(&BYTE_DELIM) => {
                message.pop();
            }
            _ => {
                warn!("message missing trailing delimiter, dropping");
                continue;
            }
        }
        if message.is_empty() {
            warn!("empty message, dropping");
            continue;
        }
        let body = message.split_off(1);
        match message[0] {
            REQUEST_PREFIX => {
                if requests.send(body).await.is_err() {
                    break;
                }
            }
            RESPONSE_PREFIX => {
                if responses.send(body).await.is_err() {
                    break;
                }
            }
            other => warn!(prefix = other, "unknown message prefix, dropping"),
        }
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}
