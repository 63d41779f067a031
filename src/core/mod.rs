//! # Core Framing Components
//!
//! Envelope framing, reassembly and the packet body pipeline.
//!
//! ## Components
//! - **Envelope**: fixed 13-byte header and flag bits
//! - **Cursor**: incremental reassembly of envelopes from arbitrary chunks
//! - **Codec**: tokio-util codec over the cursor, plus datagram decoding
//! - **Packet**: logical packet and the body contract
//! - **Body**: id/timestamp prefix, compression and encryption
//!
//! ## Wire Format
//! ```text
//! [Length(4)] [Type(4)] [Subtype(4)] [Flags(1)] [Body(Length)]
//! ```
//! All integers little-endian. The body is
//! `[PacketId(8)] [SentAtMs(8)] [Payload]` before compression and encryption.
//!
//! ## Security
//! - Body length is checked against the configured maximum before allocation
//! - Decrypted bodies shorter than the prefix are rejected

pub mod body;
pub mod codec;
pub mod cursor;
pub mod envelope;
pub mod packet;
