//! Gossip core library
//!
//! The data side of cluster gossip: the info store with its newer-wins merge
//! rule and high-water stamps, the key-pattern subscription registry, and the
//! wire message types. Nothing here does I/O or spawns tasks.
//!
//! # Modules
//!
//! - [`types`]: node identity, infos, request/response messages
//! - [`info_store`]: versioned key/value table, deltas and merging
//! - [`callback`]: key-pattern subscriptions
//! - [`canonical`]: postcard encoding helpers
//! - [`checksum`]: value checksums
//! - [`error`]: Error types

pub mod callback;
pub mod canonical;
pub mod checksum;
pub mod error;
pub mod info_store;
pub mod types;

pub use callback::{CallbackRegistry, Subscription};
pub use error::{Error, Result};
pub use info_store::{CombineOutcome, InfoStore};
pub use types::*;
