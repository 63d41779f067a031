//! # Error Types
//!
//! Error handling for the transport.
//!
//! Every failure a connection can run into is expressed as a [`ProtocolError`].
//! The connection layer turns transport, protocol and handshake faults into a
//! `kill` with the error's display text as the reason; handler faults are only
//! logged.
//!
//! ## Error Categories
//! - **Transport faults**: socket errors, remote close, address resolution
//! - **Protocol faults**: unregistered packet types, malformed envelopes,
//!   empty or undecryptable bodies
//! - **Handshake faults**: RSA failures, key digest mismatch
//! - **Configuration errors**: invalid TOML or out-of-range values
//!
//! ## Example Usage
//! ```rust
//! use peerwire::error::{ProtocolError, Result};
//!
//! fn check_length(len: usize) -> Result<()> {
//!     if len > 1024 {
//!         return Err(ProtocolError::OversizedPacket(len));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_length(2048).is_err());
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Lock-related error messages
    pub const ERR_HANDLER_WRITE_LOCK: &str = "Failed to acquire write lock on handler map";
    pub const ERR_HANDLER_READ_LOCK: &str = "Failed to acquire read lock on handler map";
    pub const ERR_REGISTRY_LOCK: &str = "Failed to acquire packet registry lock";
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed by remote peer";
    pub const ERR_NOT_ATTACHED: &str = "Transit has no socket attached";

    /// Cryptographic errors
    pub const ERR_EMPTY_DECRYPT: &str = "Decryption produced an empty body";
    pub const ERR_BODY_TOO_SHORT: &str = "Body shorter than its fixed prefix";

    /// Handshake-specific errors
    pub const ERR_SYSTEM_TIME: &str = "System time error: time went backwards";
    pub const ERR_RSA_KEYGEN: &str = "Failed to generate RSA key pair";
    pub const ERR_RSA_ENCODE: &str = "Failed to encode RSA public key";
    pub const ERR_RSA_DECODE: &str = "Failed to decode peer RSA public key";
    pub const ERR_RSA_WRAP: &str = "Failed to wrap symmetric key";
    pub const ERR_RSA_UNWRAP: &str = "Failed to unwrap symmetric key";
    pub const ERR_KEY_LENGTH: &str = "Unwrapped symmetric key has the wrong length";
    pub const ERR_KEY_MISMATCH: &str = "Line secured confirmation does not match the exchanged key";
    pub const ERR_LINE_REJECTED: &str = "Peer rejected the key exchange";
    pub const ERR_NO_PENDING_KEY: &str = "No key exchange in progress";
    pub const ERR_RANDOM: &str = "Failed to gather random bytes";
}

/// ProtocolError is the primary error type for all transport operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Address resolution failed: {0}")]
    AddressResolution(String),

    #[error("Invalid envelope header")]
    InvalidHeader,

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("No packet registered for type {packet_type} subtype {subtype}")]
    UnregisteredPacket { packet_type: i32, subtype: i32 },

    #[error("Packet type {packet_type} subtype {subtype} is already registered")]
    DuplicateRegistration { packet_type: i32, subtype: i32 },

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Unexpected message type")]
    UnexpectedMessage,

    #[error("Connection is not secured")]
    NotSecured,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
