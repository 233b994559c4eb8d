//! # keel-client: session client for the Keel replication protocol
//!
//! This crate implements the application side of the replication protocol:
//! a [`Client`] that registers a session with the cluster and then issues
//! linearizable requests, one inflight at a time, each hash-chained to the
//! reply before it.
//!
//! ## Guarantees
//!
//! - **Linearizability chain**: every accepted reply's `parent` equals the
//!   checksum of the request that elicited it, and every request carries
//!   the checksum of the last accepted reply.
//! - **At-most-one inflight**: the head of the request queue is the only
//!   request sent but not yet retired.
//! - **Idempotent retransmission**: a resent request is byte-identical to
//!   its first send.
//! - **Liveness under failover**: timeouts rotate retransmissions past
//!   suspected-dead leaders; pings keep an idle client's view current.
//!
//! ## Key components
//!
//! - [`Client`]: the session state machine
//! - [`MessageBus`]: the transport abstraction the client drives
//! - [`MessagePool`] / [`MessageHandle`]: refcounted message buffers
//! - [`Timeout`]: tick-driven timeouts with multiplicative backoff
//! - [`RecordingBus`]: a test transport that records every send
//!
//! ## Example
//!
//! ```ignore
//! use keel_client::{Client, RecordingBus};
//! use keel_wire::Operation;
//!
//! let mut client = Client::new(cluster_id, replica_count, bus);
//!
//! let message = client.get_message().expect("pool exhausted");
//! message.borrow_mut().body_mut().extend_from_slice(b"...");
//! client.request(user_data, callback, Operation::new(1), message, 3);
//!
//! loop {
//!     client.tick();
//!     // deliver inbound messages via client.on_message(&message);
//! }
//! ```

pub mod bus;
pub mod client;
pub mod error;
pub mod pool;
pub mod timeout;

pub use bus::{MessageBus, RecordingBus, SentMessage};
pub use client::{Client, RequestCallback, TICK_MS};
pub use error::RequestError;
pub use pool::{Message, MessageHandle, MessagePool};
pub use timeout::Timeout;

#[cfg(test)]
mod tests;
