//! Body pipeline between a [`Packet`] and a wire [`Frame`].
//!
//! Outbound: `[packet_id: u64][sent_at_ms: i64][payload]` -> compress (if
//! flagged) -> encrypt (if flagged) -> envelope. Inbound runs the same steps in
//! reverse, instantiating the body through the packet registry.

use crate::core::cursor::Frame;
use crate::core::envelope::{Envelope, PacketFlags};
use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::registry;
use crate::utils::compression::{self, CompressionKind};
use crate::utils::crypto::Crypto;

/// Length of the id/timestamp prefix inside every plaintext body.
pub const BODY_PREFIX_LEN: usize = 16;

/// Transforms applied to bodies on one connection.
#[derive(Debug, Clone, Copy)]
pub struct Pipeline<'a> {
    pub cipher: Option<&'a Crypto>,
    pub compression: CompressionKind,
}

impl<'a> Pipeline<'a> {
    pub fn plain() -> Self {
        Self {
            cipher: None,
            compression: CompressionKind::None,
        }
    }

    pub fn new(cipher: Option<&'a Crypto>, compression: CompressionKind) -> Self {
        Self {
            cipher,
            compression,
        }
    }
}

/// Split a plaintext body into `(packet_id, sent_at_ms, payload)`.
pub fn split_prefix(plain: &[u8]) -> Result<(u64, i64, &[u8])> {
    if plain.len() < BODY_PREFIX_LEN {
        return Err(ProtocolError::Custom(constants::ERR_BODY_TOO_SHORT.into()));
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&plain[0..8]);
    let mut sent = [0u8; 8];
    sent.copy_from_slice(&plain[8..16]);
    Ok((
        u64::from_le_bytes(id),
        i64::from_le_bytes(sent),
        &plain[BODY_PREFIX_LEN..],
    ))
}

pub fn encode_packet(packet: &Packet, pipeline: Pipeline<'_>) -> Result<Frame> {
    let payload = packet.body_dyn().encode_body()?;

    let mut body = Vec::with_capacity(BODY_PREFIX_LEN + payload.len());
    body.extend_from_slice(&packet.packet_id.to_le_bytes());
    body.extend_from_slice(&packet.sent_at_ms.to_le_bytes());
    body.extend_from_slice(&payload);

    if packet.flags.contains(PacketFlags::COMPRESSED) {
        body = compression::compress(&body, pipeline.compression)?;
    }
    if packet.flags.contains(PacketFlags::ENCRYPTED) {
        let cipher = pipeline.cipher.ok_or(ProtocolError::NotSecured)?;
        body = cipher.seal(&body)?;
    }

    Ok(Frame {
        envelope: Envelope::new(
            packet.packet_type,
            packet.subtype,
            packet.flags,
            body.len() as u32,
        ),
        body,
    })
}

pub fn decode_frame(frame: Frame, pipeline: Pipeline<'_>) -> Result<Packet> {
    let Frame { envelope, body } = frame;
    let mut target = registry::construct(envelope.packet_type, envelope.subtype)?;

    let mut plain = body;
    if envelope.flags.contains(PacketFlags::ENCRYPTED) {
        let cipher = pipeline.cipher.ok_or(ProtocolError::NotSecured)?;
        plain = cipher.open(&plain)?;
        if plain.is_empty() {
            return Err(ProtocolError::Custom(constants::ERR_EMPTY_DECRYPT.into()));
        }
    }
    if envelope.flags.contains(PacketFlags::COMPRESSED) {
        plain = compression::decompress(&plain, pipeline.compression)?;
    }

    let (packet_id, sent_at_ms, payload) = split_prefix(&plain)?;
    target.decode_body(payload)?;

    let mut packet = Packet::from_boxed(envelope.packet_type, envelope.subtype, target);
    packet.flags = envelope.flags;
    packet.packet_id = packet_id;
    packet.sent_at_ms = sent_at_ms;
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::{ReplyCode, Reply};
    use crate::protocol::messages::{Ack, LoginRequest, ACK, LOGIN_REQUEST};

    #[test]
    fn test_plain_roundtrip_keeps_id_and_timestamp() {
        let mut packet = Packet::new(
            ACK,
            0,
            Ack {
                acked_id: 9,
                acked_type: 3,
                acked_subtype: 1,
            },
        );
        packet.packet_id = 41;
        packet.sent_at_ms = 1_700_000_000_000;

        let frame = encode_packet(&packet, Pipeline::plain()).unwrap();
        assert_eq!(frame.envelope.length as usize, frame.body.len());

        let decoded = decode_frame(frame, Pipeline::plain()).unwrap();
        assert_eq!(decoded.packet_id, 41);
        assert_eq!(decoded.sent_at_ms, 1_700_000_000_000);
        assert_eq!(decoded.body::<Ack>().unwrap().acked_id, 9);
    }

    #[test]
    fn test_encrypted_compressed_roundtrip() {
        let crypto = Crypto::new(&[9u8; 32]);
        let pipeline = Pipeline::new(Some(&crypto), CompressionKind::Lz4);
        let packet = Packet::new(
            LOGIN_REQUEST,
            0,
            LoginRequest {
                account_name: "ranger".into(),
                password: "hunter2".into(),
                ..Default::default()
            },
        )
        .with_flags(PacketFlags::ENCRYPTED | PacketFlags::COMPRESSED);

        let frame = encode_packet(&packet, pipeline).unwrap();
        assert!(!frame.body.windows(7).any(|w| w == b"hunter2"));

        let decoded = decode_frame(frame, pipeline).unwrap();
        assert_eq!(decoded.body::<LoginRequest>().unwrap().password, "hunter2");
    }

    #[test]
    fn test_encrypted_without_key_is_rejected() {
        let packet = Packet::new(-1, 0, Reply::default()).with_flags(PacketFlags::ENCRYPTED);
        assert!(matches!(
            encode_packet(&packet, Pipeline::plain()),
            Err(ProtocolError::NotSecured)
        ));
    }

    #[test]
    fn test_unregistered_type_fails_decode() {
        let packet = Packet::new(-1, 0, Reply { result: ReplyCode::Ok, ..Default::default() });
        let mut frame = encode_packet(&packet, Pipeline::plain()).unwrap();
        frame.envelope.packet_type = 987_654;
        assert!(matches!(
            decode_frame(frame, Pipeline::plain()),
            Err(ProtocolError::UnregisteredPacket { .. })
        ));
    }

    #[test]
    fn test_short_body_fails_decode() {
        let frame = Frame {
            envelope: Envelope::new(ACK, 0, PacketFlags::empty(), 4),
            body: vec![0u8; 4],
        };
        assert!(decode_frame(frame, Pipeline::plain()).is_err());
    }
}
