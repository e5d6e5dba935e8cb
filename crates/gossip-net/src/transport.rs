//! Transport boundary
//!
//! A gossip connection is a pair of channels: the dialing side sends
//! requests and receives responses, the accepting side the reverse. The TCP
//! transport bridges those channels onto a framed socket with two pump tasks;
//! the in-memory transport in [`crate::memory`] hands the channels over
//! directly. Dropping the sending half closes the connection.

use crate::framing::{Frame, FrameCodec, FrameError, FrameType};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use gossip_core::{GossipRequest, GossipResponse, NodeAddr};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Network name for TCP addresses
pub const TCP_NETWORK: &str = "tcp";

/// Default per-direction channel depth
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),
    #[error("Unable to resolve {addr}: {reason}")]
    Unresolvable { addr: String, reason: String },
    #[error("Unsupported network {network:?} for {addr}")]
    UnsupportedNetwork { network: String, addr: String },
}

impl TransportError {
    /// Whether the error is an ordinary end of stream rather than a fault.
    pub fn is_closed_connection(&self) -> bool {
        match self {
            TransportError::ConnectionClosed => true,
            TransportError::Io(e) | TransportError::Frame(FrameError::Io(e)) => matches!(
                e.kind(),
                ErrorKind::UnexpectedEof
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Dialing side of a gossip stream.
#[derive(Debug)]
pub struct ClientConnection {
    pub requests: mpsc::Sender<GossipRequest>,
    pub responses: mpsc::Receiver<GossipResponse>,
}

/// Accepting side of a gossip stream.
#[derive(Debug)]
pub struct ServerConnection {
    /// Remote address as seen by the listener
    pub remote: String,
    pub requests: mpsc::Receiver<GossipRequest>,
    pub responses: mpsc::Sender<GossipResponse>,
}

/// Dial and resolve primitives consumed by the gossip node.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a bidirectional gossip stream to `addr`.
    async fn dial(&self, addr: &NodeAddr) -> Result<ClientConnection, TransportError>;

    /// Check that `addr` resolves. The result is not used for dialing.
    async fn resolve(&self, addr: &NodeAddr) -> Result<(), TransportError>;
}

/// Gossip over framed TCP
#[derive(Debug, Clone)]
pub struct TcpTransport {
    capacity: usize,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Set the per-direction channel depth
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Bind `addr` and accept gossip streams until `cancel` fires.
    ///
    /// Returns the bound address (useful with port 0) and the stream of
    /// accepted connections.
    pub async fn listen(
        &self,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<(SocketAddr, mpsc::Receiver<ServerConnection>), TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Listening on {}", local_addr);

        let (accepted_tx, accepted_rx) = mpsc::channel(self.capacity);
        let capacity = self.capacity;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = listener.accept() => match result {
                        Ok((stream, remote)) => {
                            debug!("Accepted connection from {}", remote);
                            let _ = stream.set_nodelay(true);
                            let (responses, requests) = bridge::<GossipResponse, GossipRequest>(
                                stream,
                                FrameType::GossipResponse,
                                FrameType::GossipRequest,
                                capacity,
                            );
                            let conn = ServerConnection {
                                remote: remote.to_string(),
                                requests,
                                responses,
                            };
                            if accepted_tx.send(conn).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Accept error: {}", e),
                    }
                }
            }
            debug!("Listener on {} stopped", local_addr);
        });

        Ok((local_addr, accepted_rx))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, addr: &NodeAddr) -> Result<ClientConnection, TransportError> {
        check_network(addr)?;
        let stream = TcpStream::connect(addr.address.as_str()).await?;
        let _ = stream.set_nodelay(true);
        let (requests, responses) = bridge::<GossipRequest, GossipResponse>(
            stream,
            FrameType::GossipRequest,
            FrameType::GossipResponse,
            self.capacity,
        );
        Ok(ClientConnection {
            requests,
            responses,
        })
    }

    async fn resolve(&self, addr: &NodeAddr) -> Result<(), TransportError> {
        check_network(addr)?;
        let unresolvable = |reason: String| TransportError::Unresolvable {
            addr: addr.address.clone(),
            reason,
        };
        let mut resolved = tokio::net::lookup_host(addr.address.as_str())
            .await
            .map_err(|e| unresolvable(e.to_string()))?;
        match resolved.next() {
            Some(_) => Ok(()),
            None => Err(unresolvable("no addresses".to_string())),
        }
    }
}

fn check_network(addr: &NodeAddr) -> Result<(), TransportError> {
    if addr.network != TCP_NETWORK {
        return Err(TransportError::UnsupportedNetwork {
            network: addr.network.clone(),
            addr: addr.address.clone(),
        });
    }
    Ok(())
}

/// Pump messages between a framed socket and a pair of channels.
///
/// The writer stops when the outbound sender is dropped, which shuts down the
/// write half. The reader stops on EOF, on a decode error, or once the inbound
/// receiver is dropped.
fn bridge<Out, In>(
    stream: TcpStream,
    out_type: FrameType,
    in_type: FrameType,
    capacity: usize,
) -> (mpsc::Sender<Out>, mpsc::Receiver<In>)
where
    Out: Serialize + Send + 'static,
    In: DeserializeOwned + Send + 'static,
{
    let (read, write) = stream.into_split();
    let mut reader = FramedRead::new(read, FrameCodec::new());
    let mut writer = FramedWrite::new(write, FrameCodec::new());
    let (out_tx, mut out_rx) = mpsc::channel::<Out>(capacity);
    let (in_tx, in_rx) = mpsc::channel::<In>(capacity);

    tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let frame = match Frame::encode(out_type, &message) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Dropping connection, failed to encode {:?}: {}", out_type, e);
                    break;
                }
            };
            if let Err(e) = writer.send(frame).await {
                debug!("Write failed: {}", e);
                break;
            }
        }
    });

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = in_tx.closed() => break,
                next = reader.next() => match next {
                    Some(Ok(frame)) if frame.frame_type == in_type => match frame.decode::<In>() {
                        Ok(message) => {
                            if in_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Dropping connection, undecodable {:?}: {}", in_type, e);
                            break;
                        }
                    },
                    Some(Ok(frame)) => {
                        warn!("Dropping connection, unexpected {:?} frame", frame.frame_type);
                        break;
                    }
                    Some(Err(e)) => {
                        debug!("Read failed: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    });

    (out_tx, in_rx)
}
