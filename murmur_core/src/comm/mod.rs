//! # Collective messaging layer
//!
//! Point-to-point framed messaging between the N ranks of a peer group,
//! carried by a bulk all-to-all transport.
//!
//! The moving parts, leaves first:
//!
//! - [`frame`]: wire frame (length header + element padding)
//! - `send_window`: double-buffered mmap staging windows with lock-free
//!   CAS reservations
//! - `recv_queue`: per-source byte queues with framed reassembly
//! - [`config`]: window/flusher tunables
//! - [`group_comm`]: the [`GroupComm`] object tying it together, with its
//!   background flusher and the distributed termination protocol
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use murmur_core::comm::{CommConfig, GroupComm};
//! use murmur_core::transport::LocalGroup;
//!
//! // two ranks in one process, one comm per thread
//! let mut transports = LocalGroup::create(2);
//! let t1 = transports.pop().unwrap();
//! let t0 = transports.pop().unwrap();
//!
//! let peer = std::thread::spawn(move || {
//!     let comm = GroupComm::new(t1, CommConfig::default()).unwrap();
//!     loop {
//!         if let Some((source, payload)) = comm.receive() {
//!             assert_eq!((source, payload.as_slice()), (0, &b"hello"[..]));
//!             break;
//!         }
//!     }
//!     comm.close().unwrap();
//! });
//!
//! let comm = GroupComm::new(t0, CommConfig::default()).unwrap();
//! comm.send(1, b"hello").unwrap();
//! comm.flush().unwrap();
//! comm.close().unwrap();
//! peer.join().unwrap();
//! ```

pub mod config;
pub mod frame;
pub mod group_comm;
pub(crate) mod recv_queue;
pub(crate) mod send_window;

pub use config::CommConfig;
pub use group_comm::GroupComm;
