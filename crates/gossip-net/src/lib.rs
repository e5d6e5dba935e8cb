//! Networking for cluster gossip
//!
//! This crate provides:
//! - The transport boundary the gossip node dials through
//! - A framed TCP transport and an in-process transport
//! - Length-prefixed message framing
//! - Per-address dial circuit breakers

pub mod breaker;
pub mod framing;
pub mod memory;
pub mod transport;

pub use breaker::{BreakerError, BreakerRegistry, BreakerSettings, BreakerState, CircuitBreaker};
pub use framing::{Frame, FrameCodec, FrameError, FrameType};
pub use memory::{MemoryNetwork, MEMORY_NETWORK};
pub use transport::{ClientConnection, ServerConnection, TcpTransport, Transport, TransportError};
