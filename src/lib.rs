//! Statelink - shared versioned state for cooperating processes on one host
//!
//! Statelink replicates a single opaque byte payload, tagged with a
//! monotonically increasing 64-bit version, between processes on the same
//! machine. Exactly one process holds the leader role at a time; everyone
//! else attaches as a follower over a unix domain socket. Reads are served
//! locally, writes are serialized through the leader, and accepted writes
//! are broadcast to every follower.
//!
//! # Key Features
//!
//! - **Single writer, local reads**: the leader applies all writes in one
//!   total order; followers answer reads from their local mirror
//! - **Optimistic concurrency**: every write names the version it expects;
//!   stale writes are rejected instead of silently overwriting
//! - **Opportunistic failover**: no election protocol, no quorum. If the
//!   leader exits, the first follower to reclaim the rendezvous socket
//!   becomes the new leader
//! - **Pluggable storage**: nodes are generic over a [`Datastore`]; an
//!   in-memory store and an append-only file store ship in the box
//! - **Watchable**: any process can subscribe to state updates
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use statelink::{MemoryStore, Supervisor};
//!
//! # async fn run() -> statelink::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//!
//! // Every cooperating process points its supervisor at the same directory.
//! let state = Supervisor::new("/var/run/myapp", store.clone(), store);
//! state.open().await?;
//!
//! // Read the current state and write on top of it.
//! let current = state.current()?;
//! current.update(b"hello".to_vec()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! The supervisor tries to bind `<dir>/interstate.sock`; the socket's
//! existence is the leader presence marker, so a second process finds it
//! taken and dials it as a follower instead. Followers bootstrap from the
//! snapshot the leader sends on every new connection, then apply broadcast
//! updates as they arrive. A follower that loses its connection tells its
//! supervisor to re-run acquisition, removing the socket first when nobody
//! is listening behind it.
//!
//! The types you will work with:
//! - [`Supervisor`] - owns role acquisition, failover, and subscriptions
//! - [`Version`] - an immutable `(version, bytes)` view with optimistic
//!   [`Version::update`]
//! - [`Datastore`] - the storage contract; [`MemoryStore`] and [`AppendLog`]
//!   implement it
//!
//! # Non-goals
//!
//! Statelink intentionally does NOT provide:
//! - Replication between hosts
//! - Consensus or leader election
//! - Authentication or access control
//! - More than one logical state value per socket
//! - Durability beyond what the chosen datastore offers

pub mod appendlog;
pub mod error;
pub mod follower;
pub mod leader;
pub mod message;
pub mod store;
pub mod supervisor;
pub mod version;

pub use appendlog::AppendLog;
pub use error::{Error, Result};
pub use store::{Datastore, MemoryStore};
pub use supervisor::Supervisor;
pub use version::Version;

#[cfg(test)]
mod tests;
