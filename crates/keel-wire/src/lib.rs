//! # keel-wire: wire types for the Keel replication protocol
//!
//! This crate defines the types every protocol participant agrees on:
//!
//! - [`Header`]: the fixed 128-byte message header
//! - [`Command`]: protocol command dispatch
//! - [`Operation`]: state machine operation, with the reserved
//!   [`Operation::REGISTER`] value
//! - [`checksum`]: the 128-bit BLAKE3-derived checksum used for headers,
//!   bodies, and the session hash chain
//!
//! ## Hash chain
//!
//! A client's session is hash-chained: each request carries the checksum of
//! the last accepted reply in its `parent` field, and each reply carries the
//! checksum of the request that elicited it. Reordering or omission anywhere
//! in the chain is therefore detectable from the header alone.
//!
//! ```text
//! request₀ ──checksum──► reply₀ ──checksum──► request₁ ──► ...
//!     ▲                     │
//!     └──────── parent ─────┘
//! ```

pub mod checksum;
pub mod error;
pub mod header;

pub use checksum::checksum;
pub use error::{WireError, WireResult};
pub use header::{
    Command, HEADER_SIZE, Header, MESSAGE_SIZE_MAX, Operation, PROTOCOL_VERSION,
};
