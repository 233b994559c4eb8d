//! Error types for wire format encoding and decoding.

/// Errors that can occur while decoding or validating a message header.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The buffer is too short to contain a complete header.
    #[error("truncated header: got {0} of 128 bytes")]
    TruncatedHeader(usize),

    /// The command discriminant is not a known protocol command.
    #[error("unknown command: {0}")]
    UnknownCommand(u8),

    /// The protocol version does not match ours.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The size field is smaller than the header or larger than the maximum.
    #[error("message size out of bounds: {size} (must be {min}..={max})")]
    SizeOutOfBounds { size: u32, min: u32, max: u32 },

    /// Reserved header bytes must be zero.
    #[error("reserved header bytes are not zero")]
    NonZeroReserved,

    /// The header checksum does not cover the header contents.
    #[error("header checksum mismatch")]
    ChecksumMismatch,

    /// The body checksum does not cover the body contents.
    #[error("body checksum mismatch")]
    BodyChecksumMismatch,
}

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;
