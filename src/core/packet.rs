//! Logical packets and the body contract.
//!
//! A [`Packet`] is what handlers see: the envelope fields, the id and send
//! timestamp assigned by the sending connection, and a typed body. Bodies are
//! opaque to the transport; anything that implements `serde`'s traits is a
//! [`PacketBody`] and travels as bincode.

use crate::core::envelope::PacketFlags;
use crate::error::Result;
use crate::protocol::messages::GENERIC_REPLY;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

/// Serialize/deserialize contract for packet bodies.
pub trait PacketBody: Any + Send + Sync + fmt::Debug {
    fn encode_body(&self) -> Result<Vec<u8>>;

    /// Overwrite `self` from the wire representation.
    fn decode_body(&mut self, bytes: &[u8]) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

impl<T> PacketBody for T
where
    T: Serialize + DeserializeOwned + Any + Send + Sync + fmt::Debug,
{
    fn encode_body(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn decode_body(&mut self, bytes: &[u8]) -> Result<()> {
        *self = bincode::deserialize(bytes)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Result code carried by replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReplyCode {
    #[default]
    Unknown,
    Ok,
    Failure,
    /// The request's authorization ticket has expired; the peer may retry.
    AuthorizationExpired,
    InvalidRequest,
    Unauthorized,
    ServerError,
}

impl ReplyCode {
    pub fn is_ok(self) -> bool {
        self == ReplyCode::Ok
    }
}

/// Body of a standard reply. Points back at the request it answers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub reply_to_id: u64,
    pub reply_to_type: i32,
    pub reply_to_subtype: i32,
    pub result: ReplyCode,
    pub message: String,
}

#[derive(Debug)]
pub struct Packet {
    pub packet_type: i32,
    pub subtype: i32,
    pub flags: PacketFlags,
    /// Assigned by the sending connection; zero until sent.
    pub packet_id: u64,
    /// Sender's UTC milliseconds at send time.
    pub sent_at_ms: i64,
    body: Box<dyn PacketBody>,
}

impl Packet {
    pub fn new<B: PacketBody>(packet_type: i32, subtype: i32, body: B) -> Self {
        Self::from_boxed(packet_type, subtype, Box::new(body))
    }

    pub fn from_boxed(packet_type: i32, subtype: i32, body: Box<dyn PacketBody>) -> Self {
        Self {
            packet_type,
            subtype,
            flags: PacketFlags::empty(),
            packet_id: 0,
            sent_at_ms: 0,
            body,
        }
    }

    /// Add `flags` to the packet's current flags.
    pub fn with_flags(mut self, flags: PacketFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn key(&self) -> (i32, i32) {
        (self.packet_type, self.subtype)
    }

    pub fn body<B: PacketBody>(&self) -> Option<&B> {
        (*self.body).as_any().downcast_ref::<B>()
    }

    pub fn body_dyn(&self) -> &dyn PacketBody {
        self.body.as_ref()
    }

    pub fn needs_ack(&self) -> bool {
        self.flags.contains(PacketFlags::NEEDS_ACK)
    }

    pub fn needs_reply(&self) -> bool {
        self.flags.contains(PacketFlags::NEEDS_REPLY)
    }

    pub fn is_udp(&self) -> bool {
        self.flags.contains(PacketFlags::UDP)
    }

    pub fn is_critical(&self) -> bool {
        self.flags.contains(PacketFlags::CRITICAL)
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags.contains(PacketFlags::ENCRYPTED)
    }

    pub fn is_reply(&self) -> bool {
        self.flags.contains(PacketFlags::IS_REPLY)
    }

    /// Reply body, if this packet is a standard reply.
    pub fn as_reply(&self) -> Option<&Reply> {
        if self.packet_type == GENERIC_REPLY {
            self.body::<Reply>()
        } else {
            None
        }
    }

    /// Build a standard reply to this packet. The reply keeps the request's
    /// encryption and transport flags.
    pub fn reply(&self, result: ReplyCode, message: impl Into<String>) -> Packet {
        let inherited = self.flags & (PacketFlags::ENCRYPTED | PacketFlags::UDP);
        Packet::new(
            GENERIC_REPLY,
            0,
            Reply {
                reply_to_id: self.packet_id,
                reply_to_type: self.packet_type,
                reply_to_subtype: self.subtype,
                result,
                message: message.into(),
            },
        )
        .with_flags(inherited | PacketFlags::IS_REPLY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Move {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_body_downcast() {
        let packet = Packet::new(10, 0, Move { x: 1, y: -1 });
        assert_eq!(packet.body::<Move>(), Some(&Move { x: 1, y: -1 }));
        assert!(packet.body::<Reply>().is_none());
    }

    #[test]
    fn test_reply_points_back_at_request() {
        let mut request = Packet::new(10, 3, Move::default())
            .with_flags(PacketFlags::ENCRYPTED | PacketFlags::NEEDS_REPLY);
        request.packet_id = 77;

        let reply = request.reply(ReplyCode::Ok, "done");
        assert!(reply.is_reply());
        assert!(reply.is_encrypted());
        assert!(!reply.needs_reply());
        let body = reply.as_reply().unwrap();
        assert_eq!(body.reply_to_id, 77);
        assert_eq!((body.reply_to_type, body.reply_to_subtype), (10, 3));
        assert_eq!(body.message, "done");
    }

    #[test]
    fn test_serde_body_roundtrip_through_trait() {
        let body = Move { x: 4, y: 2 };
        let bytes = body.encode_body().unwrap();
        let mut decoded = Move::default();
        decoded.decode_body(&bytes).unwrap();
        assert_eq!(decoded, body);
    }
}
