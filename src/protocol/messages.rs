//! Core packet types.
//!
//! Negative type ids are reserved for the transport itself; application
//! packets use positive ids and may namespace themselves with a subtype.

use crate::core::packet::ReplyCode;
use serde::{Deserialize, Serialize};

pub const GENERIC_REPLY: i32 = -1;
pub const ACK: i32 = -2;
pub const CLOCK_SYNC: i32 = -3;
pub const HELLO: i32 = -4;
pub const KEY_EXCHANGE: i32 = -5;
pub const LINE_SECURED: i32 = -6;
pub const LOGIN_REQUEST: i32 = -7;
pub const LOGIN_RESULT: i32 = -8;
pub const NAT_INFO: i32 = -9;
pub const UDP_PROBE: i32 = -10;
pub const NAT_POKE: i32 = -11;
pub const STREAM_CHUNK: i32 = -12;

/// What the initiating side intends to do with the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionKind {
    #[default]
    Player,
    /// Server-to-server link inside a cluster.
    Cluster,
    Admin,
}

/// Delivery acknowledgement for a packet that carried `NEEDS_ACK`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub acked_id: u64,
    pub acked_type: i32,
    pub acked_subtype: i32,
}

/// One clock round trip. The initiator fills `local_sent_ms`; the responder
/// echoes it back with its own clock in `remote_ms`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSyncBody {
    pub local_sent_ms: i64,
    pub remote_ms: i64,
    pub is_response: bool,
}

/// First packet from the listening side: its RSA public key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub connection_id: u64,
    /// PKCS#1 DER encoded RSA public key.
    pub public_key: Vec<u8>,
}

/// Initiator's reply to [`Hello`]: the symmetric key wrapped for the listener.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchange {
    pub encrypted_key: Vec<u8>,
    pub public_key: Vec<u8>,
}

/// Listener's confirmation that it unwrapped the key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSecured {
    pub result: ReplyCode,
    /// SHA-256 of the unwrapped key.
    pub key_digest: [u8; 32],
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub account_name: String,
    pub password: String,
    pub new_account: bool,
    pub kind: ConnectionKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResult {
    pub result: ReplyCode,
    pub message: String,
    pub roles: Vec<String>,
}

/// Sent by the listener once a login succeeds: where to probe UDP and the
/// token identifying this connection on the UDP port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatInfo {
    pub udp_port: u16,
    pub token: u64,
}

/// First datagram from the initiator. Travels unencrypted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpProbe {
    pub token: u64,
}

/// Chunk of a file stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub stream_id: u64,
    pub description: String,
    pub initial: bool,
    pub last: bool,
    /// Bytes sent so far including this chunk.
    pub total_length: u64,
    pub data: Vec<u8>,
}
