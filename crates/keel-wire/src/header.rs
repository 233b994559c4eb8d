//! The fixed-size message header shared by every protocol message.
//!
//! A message is a 128-byte header followed by an optional body. The header
//! carries two 128-bit checksums (header and body), the hash-chain `parent`
//! link, and the routing fields the client and replicas dispatch on.
//!
//! Field layout (all integers little-endian):
//!
//! ```text
//! offset  size  field
//!      0    16  checksum        covers bytes 16..128
//!     16    16  checksum_body   covers the body
//!     32    16  parent          hash-chain link
//!     48    16  client          client id, 0 for cluster broadcasts
//!     64     8  context         session number on requests, 0 on replies
//!     72     8  op              state machine op number
//!     80     8  commit          commit number (session on register replies)
//!     88     4  request         per-client monotonic request number
//!     92     4  cluster         cluster id
//!     96     4  view            leader epoch
//!    100     4  size            total message size including header
//!    104     1  command
//!    105     1  operation
//!    106     1  version
//!    107    21  reserved        must be zero
//! ```

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::checksum::checksum;
use crate::error::{WireError, WireResult};

/// Size of the message header in bytes.
pub const HEADER_SIZE: usize = 128;

/// Maximum total message size (header + body) in bytes.
pub const MESSAGE_SIZE_MAX: u32 = 1024 * 1024;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

const RESERVED_SIZE: usize = 21;

// ============================================================================
// Command
// ============================================================================

/// Protocol command, dispatched on by every participant.
///
/// The client only originates `Ping` and `Request` and only consumes `Pong`
/// and `Reply`; the remaining commands flow between replicas and are listed
/// here so that dispatch is exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Command {
    /// Liveness probe, client → all replicas.
    Ping = 1,
    /// Liveness response, replica → everyone (not client-targeted).
    Pong = 2,
    /// Client operation to be replicated.
    Request = 3,
    /// Committed result of a request, leader → client.
    Reply = 4,
    /// Leader → backup replication (ignored by clients).
    Prepare = 5,
    /// Backup → leader acknowledgment (ignored by clients).
    PrepareOk = 6,
    /// Leader → backup commit notification (ignored by clients).
    Commit = 7,
    /// View change initiation (ignored by clients).
    StartViewChange = 8,
    /// View change state transfer (ignored by clients).
    DoViewChange = 9,
    /// View change completion (ignored by clients).
    StartView = 10,
}

impl Command {
    /// Returns a human-readable name for the command.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Command::Ping => "Ping",
            Command::Pong => "Pong",
            Command::Request => "Request",
            Command::Reply => "Reply",
            Command::Prepare => "Prepare",
            Command::PrepareOk => "PrepareOk",
            Command::Commit => "Commit",
            Command::StartViewChange => "StartViewChange",
            Command::DoViewChange => "DoViewChange",
            Command::StartView => "StartView",
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = WireError;

    fn try_from(value: u8) -> WireResult<Self> {
        match value {
            1 => Ok(Command::Ping),
            2 => Ok(Command::Pong),
            3 => Ok(Command::Request),
            4 => Ok(Command::Reply),
            5 => Ok(Command::Prepare),
            6 => Ok(Command::PrepareOk),
            7 => Ok(Command::Commit),
            8 => Ok(Command::StartViewChange),
            9 => Ok(Command::DoViewChange),
            10 => Ok(Command::StartView),
            other => Err(WireError::UnknownCommand(other)),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Operation
// ============================================================================

/// A state machine operation.
///
/// The operation space belongs to the replicated state machine, which is
/// external to this crate; only [`Operation::REGISTER`] is reserved by the
/// protocol for session registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Operation(pub u8);

impl Operation {
    /// The reserved session registration operation.
    pub const REGISTER: Operation = Operation(0);

    /// Creates an operation from its wire discriminant.
    #[must_use]
    pub fn new(op: u8) -> Self {
        Self(op)
    }

    /// Returns the wire discriminant.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// Returns true if this is the reserved register operation.
    #[must_use]
    pub fn is_register(self) -> bool {
        self == Self::REGISTER
    }
}

impl From<u8> for Operation {
    fn from(op: u8) -> Self {
        Self(op)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_register() {
            f.write_str("register")
        } else {
            write!(f, "op({})", self.0)
        }
    }
}

// ============================================================================
// Header
// ============================================================================

/// The fixed-size message header.
///
/// A freshly created header has both checksums unset (zero); senders call
/// [`Header::set_checksum_body`] and then [`Header::set_checksum`] as the
/// final step before transmission, and receivers verify both before acting
/// on any other field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Checksum over bytes 16..128 of the encoded header.
    pub checksum: u128,
    /// Checksum over the message body.
    pub checksum_body: u128,
    /// Hash-chain link: the checksum of the predecessor in the session.
    pub parent: u128,
    /// Originating client id, or 0 for cluster-wide messages.
    pub client: u128,
    /// The session number on a request; 0 on a reply.
    pub context: u64,
    /// State machine op number; on a reply, must equal `commit`.
    pub op: u64,
    /// Commit number; on a register reply, carries the session number.
    pub commit: u64,
    /// Per-client monotonic request number.
    pub request: u32,
    /// Cluster id.
    pub cluster: u32,
    /// Leader epoch.
    pub view: u32,
    /// Total message size including this header.
    pub size: u32,
    /// Protocol command.
    pub command: Command,
    /// State machine operation.
    pub operation: Operation,
    /// Protocol version.
    pub version: u8,
}

impl Header {
    /// Creates a header for the given command with all other fields zeroed.
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            checksum: 0,
            checksum_body: 0,
            parent: 0,
            client: 0,
            context: 0,
            op: 0,
            commit: 0,
            request: 0,
            cluster: 0,
            view: 0,
            size: HEADER_SIZE as u32,
            command,
            operation: Operation::REGISTER,
            version: PROTOCOL_VERSION,
        }
    }

    /// Encodes the header into `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u128_le(self.checksum);
        buf.put_u128_le(self.checksum_body);
        buf.put_u128_le(self.parent);
        buf.put_u128_le(self.client);
        buf.put_u64_le(self.context);
        buf.put_u64_le(self.op);
        buf.put_u64_le(self.commit);
        buf.put_u32_le(self.request);
        buf.put_u32_le(self.cluster);
        buf.put_u32_le(self.view);
        buf.put_u32_le(self.size);
        buf.put_u8(self.command as u8);
        buf.put_u8(self.operation.as_u8());
        buf.put_u8(self.version);
        buf.put_bytes(0, RESERVED_SIZE);
    }

    /// Encodes the header to a fixed-size byte array.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        let mut cursor = &mut bytes[..];
        self.encode(&mut cursor);
        bytes
    }

    /// Decodes a header from `buf`.
    ///
    /// Consumes exactly [`HEADER_SIZE`] bytes on success. Checksum
    /// verification is separate; see [`Header::valid_checksum`].
    pub fn decode(buf: &mut impl Buf) -> WireResult<Self> {
        if buf.remaining() < HEADER_SIZE {
            return Err(WireError::TruncatedHeader(buf.remaining()));
        }

        let checksum = buf.get_u128_le();
        let checksum_body = buf.get_u128_le();
        let parent = buf.get_u128_le();
        let client = buf.get_u128_le();
        let context = buf.get_u64_le();
        let op = buf.get_u64_le();
        let commit = buf.get_u64_le();
        let request = buf.get_u32_le();
        let cluster = buf.get_u32_le();
        let view = buf.get_u32_le();
        let size = buf.get_u32_le();
        let command = Command::try_from(buf.get_u8())?;
        let operation = Operation::from(buf.get_u8());
        let version = buf.get_u8();

        let mut reserved = [0u8; RESERVED_SIZE];
        buf.copy_to_slice(&mut reserved);
        if reserved != [0u8; RESERVED_SIZE] {
            return Err(WireError::NonZeroReserved);
        }

        Ok(Self {
            checksum,
            checksum_body,
            parent,
            client,
            context,
            op,
            commit,
            request,
            cluster,
            view,
            size,
            command,
            operation,
            version,
        })
    }

    /// Computes the header checksum over the encoded bytes after the
    /// checksum field itself.
    #[must_use]
    pub fn calculate_checksum(&self) -> u128 {
        checksum(&self.to_bytes()[16..])
    }

    /// Sets the header checksum. Must be the last field written.
    pub fn set_checksum(&mut self) {
        self.checksum = self.calculate_checksum();
    }

    /// Sets the body checksum for the given body.
    pub fn set_checksum_body(&mut self, body: &[u8]) {
        self.checksum_body = checksum(body);
    }

    /// Returns true if the header checksum covers the header contents.
    #[must_use]
    pub fn valid_checksum(&self) -> bool {
        self.checksum == self.calculate_checksum()
    }

    /// Returns true if the body checksum covers `body`.
    #[must_use]
    pub fn valid_checksum_body(&self, body: &[u8]) -> bool {
        self.checksum_body == checksum(body)
    }

    /// Validates the size and version fields.
    pub fn validate(&self) -> WireResult<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(self.version));
        }
        if self.size < HEADER_SIZE as u32 || self.size > MESSAGE_SIZE_MAX {
            return Err(WireError::SizeOutOfBounds {
                size: self.size,
                min: HEADER_SIZE as u32,
                max: MESSAGE_SIZE_MAX,
            });
        }
        Ok(())
    }

    /// Returns the body size implied by the size field.
    #[must_use]
    pub fn body_size(&self) -> usize {
        self.size as usize - HEADER_SIZE
    }
}
