//! # Murmur
//!
//! Asynchronous point-to-point messaging for fixed-size process groups,
//! built on a collective all-to-all transport.
//!
//! N peers each hold a rank in `[0, N)`. Senders enqueue variable-length
//! messages addressed to a peer; a background flusher periodically runs a
//! collective exchange that moves everything in flight; receivers drain
//! whole messages from per-source queues without blocking. The staging
//! path is lock-free (CAS reservations into a double-buffered mmap
//! window), per-source FIFO order is preserved, and shutdown is agreed
//! across the group so no rank is stranded inside a collective.
//!
//! - [`comm`]: the messaging layer ([`GroupComm`], config, framing)
//! - [`transport`]: the [`Collective`](transport::Collective) contract
//!   and the in-process [`LocalGroup`](transport::LocalGroup) reference
//!   transport
//! - [`error`]: crate-wide error type

pub mod comm;
pub mod error;
pub mod transport;

pub use comm::{CommConfig, GroupComm};
pub use error::{MurmurError, MurmurResult};
