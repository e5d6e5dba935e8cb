//! In-process transport
//!
//! Nodes in the same process listen on string addresses of the `mem` network
//! and dial each other without sockets. Used for multi-node tests and
//! simulations; the channel semantics match the TCP transport.

use crate::transport::{
    ClientConnection, ServerConnection, Transport, TransportError, DEFAULT_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use gossip_core::NodeAddr;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Network name for in-memory addresses
pub const MEMORY_NETWORK: &str = "mem";

/// Registry of in-memory listeners
#[derive(Default)]
pub struct MemoryNetwork {
    listeners: Mutex<HashMap<String, mpsc::Sender<ServerConnection>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Address on this network
    pub fn addr(address: &str) -> NodeAddr {
        NodeAddr::new(MEMORY_NETWORK, address)
    }

    /// Start accepting connections on `address`, replacing any previous
    /// listener there.
    pub fn listen(&self, address: &str) -> mpsc::Receiver<ServerConnection> {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        self.listeners.lock().insert(address.to_string(), tx);
        rx
    }

    /// Stop accepting on `address`. Established connections are unaffected.
    pub fn unlisten(&self, address: &str) {
        self.listeners.lock().remove(address);
    }

    /// Transport that dials into this network
    pub fn transport(self: &Arc<Self>) -> Arc<dyn Transport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
        })
    }

    fn listener(&self, address: &str) -> Option<mpsc::Sender<ServerConnection>> {
        self.listeners.lock().get(address).cloned()
    }
}

/// Dialer bound to a [`MemoryNetwork`]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(&self, addr: &NodeAddr) -> Result<ClientConnection, TransportError> {
        let listener = self
            .network
            .listener(&addr.address)
            .ok_or_else(|| TransportError::ConnectionRefused(addr.address.clone()))?;

        let (request_tx, request_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let (response_tx, response_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let server_side = ServerConnection {
            remote: format!("{}-peer", addr.address),
            requests: request_rx,
            responses: response_tx,
        };
        listener
            .send(server_side)
            .await
            .map_err(|_| TransportError::ConnectionRefused(addr.address.clone()))?;

        Ok(ClientConnection {
            requests: request_tx,
            responses: response_rx,
        })
    }

    async fn resolve(&self, addr: &NodeAddr) -> Result<(), TransportError> {
        if self.network.listener(&addr.address).is_some() {
            Ok(())
        } else {
            Err(TransportError::Unresolvable {
                addr: addr.address.clone(),
                reason: "no such in-memory listener".to_string(),
            })
        }
    }
}
