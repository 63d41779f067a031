//! Edge case tests for framing and the body pipeline
//!
//! Malformed envelopes, truncated bodies, missing keys and unknown packet
//! types must all fail cleanly without poisoning later frames.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use peerwire::core::body::{decode_frame, encode_packet, Pipeline, BODY_PREFIX_LEN};
use peerwire::core::codec::EnvelopeCodec;
use peerwire::core::cursor::{Frame, ReassemblyCursor};
use peerwire::core::envelope::{Envelope, PacketFlags, ENVELOPE_LEN};
use peerwire::core::packet::{Packet, PacketBody, Reply, ReplyCode};
use peerwire::error::{constants, ProtocolError};
use peerwire::protocol::messages::{Ack, ACK, GENERIC_REPLY, NAT_POKE};
use peerwire::protocol::registry::{self, PacketRegistry};
use peerwire::utils::compression::{decompress, CompressionKind};
use peerwire::utils::crypto::Crypto;
use serde::{Deserialize, Serialize};
use tokio_util::codec::Decoder;

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
struct Emote {
    id: u16,
}

fn ack_packet() -> Packet {
    Packet::new(
        ACK,
        0,
        Ack {
            acked_id: 1,
            acked_type: 2,
            acked_subtype: 3,
        },
    )
}

#[test]
fn test_oversized_length_rejected_before_body_arrives() {
    let envelope = Envelope::new(ACK, 0, PacketFlags::empty(), 10_000);
    let mut buf = BytesMut::from(&envelope.to_bytes()[..]);

    let mut codec = EnvelopeCodec::new(1024);
    let result = codec.decode(&mut buf);
    assert!(matches!(result, Err(ProtocolError::OversizedPacket(10_000))));
}

#[test]
fn test_cursor_recovers_after_oversized_frame() {
    let mut cursor = ReassemblyCursor::new(16);
    let mut frames = Vec::new();

    let bad = Envelope::new(1, 0, PacketFlags::empty(), 17).to_bytes();
    assert!(cursor.feed(&bad, &mut frames).is_err());
    assert!(cursor.is_idle());

    let mut good = Envelope::new(2, 0, PacketFlags::empty(), 3).to_bytes().to_vec();
    good.extend_from_slice(b"abc");
    assert_eq!(cursor.feed(&good, &mut frames).unwrap(), 1);
    assert_eq!(frames[0].envelope.packet_type, 2);
}

#[test]
fn test_zero_length_frame() {
    let bytes = Envelope::new(NAT_POKE, 0, PacketFlags::UDP, 0).to_bytes();
    let mut codec = EnvelopeCodec::new(1024);
    let frame = codec.decode_datagram(&bytes).unwrap();
    assert!(frame.body.is_empty());
    assert!(frame.envelope.flags.contains(PacketFlags::UDP));
}

#[test]
fn test_short_datagram_rejected() {
    let bytes = Envelope::new(ACK, 0, PacketFlags::empty(), 8).to_bytes();
    let mut codec = EnvelopeCodec::new(1024);
    assert!(codec.decode_datagram(&bytes[..ENVELOPE_LEN - 1]).is_err());
    // header complete but body missing
    assert!(codec.decode_datagram(&bytes).is_err());
}

#[test]
fn test_body_shorter_than_prefix() {
    let frame = Frame {
        envelope: Envelope::new(ACK, 0, PacketFlags::empty(), (BODY_PREFIX_LEN - 1) as u32),
        body: vec![0u8; BODY_PREFIX_LEN - 1],
    };
    match decode_frame(frame, Pipeline::plain()) {
        Err(ProtocolError::Custom(msg)) => assert_eq!(msg, constants::ERR_BODY_TOO_SHORT),
        other => panic!("expected short body error, got {:?}", other),
    }
}

#[test]
fn test_encrypted_frame_without_cipher() {
    let crypto = Crypto::new(&[5u8; 32]);
    let packet = ack_packet().with_flags(PacketFlags::ENCRYPTED);
    let frame = encode_packet(&packet, Pipeline::new(Some(&crypto), CompressionKind::None)).unwrap();

    assert!(matches!(
        decode_frame(frame, Pipeline::plain()),
        Err(ProtocolError::NotSecured)
    ));
}

#[test]
fn test_empty_plaintext_after_decrypt_rejected() {
    let crypto = Crypto::new(&[5u8; 32]);
    let sealed = crypto.seal(&[]).unwrap();
    let frame = Frame {
        envelope: Envelope::new(ACK, 0, PacketFlags::ENCRYPTED, sealed.len() as u32),
        body: sealed,
    };

    match decode_frame(frame, Pipeline::new(Some(&crypto), CompressionKind::None)) {
        Err(ProtocolError::Custom(msg)) => assert_eq!(msg, constants::ERR_EMPTY_DECRYPT),
        other => panic!("expected empty decrypt error, got {:?}", other),
    }
}

#[test]
fn test_tampered_ciphertext_rejected() {
    let crypto = Crypto::new(&[5u8; 32]);
    let packet = ack_packet().with_flags(PacketFlags::ENCRYPTED);
    let pipeline = Pipeline::new(Some(&crypto), CompressionKind::None);
    let mut frame = encode_packet(&packet, pipeline).unwrap();
    let last = frame.body.len() - 1;
    frame.body[last] ^= 0xFF;

    assert!(matches!(
        decode_frame(frame, pipeline),
        Err(ProtocolError::DecryptionFailure)
    ));
}

#[test]
fn test_garbage_compressed_body_rejected() {
    let packet = ack_packet().with_flags(PacketFlags::COMPRESSED);
    let mut frame = encode_packet(&packet, Pipeline::new(None, CompressionKind::Lz4)).unwrap();
    frame.body = vec![0xFF; 32];
    frame.envelope.length = 32;

    assert!(decode_frame(frame, Pipeline::new(None, CompressionKind::Lz4)).is_err());
    assert!(decompress(&[0xFF; 32], CompressionKind::Zstd).is_err());
}

#[test]
fn test_unregistered_type_rejected() {
    let mut frame = encode_packet(&ack_packet(), Pipeline::plain()).unwrap();
    frame.envelope.packet_type = 424_242;

    match decode_frame(frame, Pipeline::plain()) {
        Err(ProtocolError::UnregisteredPacket {
            packet_type,
            subtype,
        }) => {
            assert_eq!(packet_type, 424_242);
            assert_eq!(subtype, 0);
        }
        other => panic!("expected unregistered packet error, got {:?}", other),
    }
}

#[test]
fn test_subtype_falls_back_to_type_entry() {
    let mut registry = PacketRegistry::new();
    registry.register::<Emote>(900, 0).unwrap();
    assert!(registry.is_registered(900, 7));
    assert!(!registry.is_registered(901, 0));
}

#[test]
fn test_duplicate_registration_keeps_first() {
    let mut registry = PacketRegistry::new();
    registry.register::<Emote>(901, 2).unwrap();
    assert!(matches!(
        registry.register::<Reply>(901, 2),
        Err(ProtocolError::DuplicateRegistration {
            packet_type: 901,
            subtype: 2
        })
    ));

    let body = registry.construct(901, 2).unwrap();
    assert!((*body).as_any().downcast_ref::<Emote>().is_some());
}

#[test]
fn test_application_body_through_global_registry() {
    registry::register::<Emote>(902, 0).unwrap();

    let mut packet = Packet::new(902, 4, Emote { id: 77 });
    packet.packet_id = 5;
    let frame = encode_packet(&packet, Pipeline::plain()).unwrap();
    let decoded = decode_frame(frame, Pipeline::plain()).unwrap();
    assert_eq!(decoded.subtype, 4);
    assert_eq!(decoded.body::<Emote>(), Some(&Emote { id: 77 }));
}

#[test]
fn test_core_packets_cannot_be_overridden() {
    assert!(matches!(
        registry::register::<Emote>(ACK, 0),
        Err(ProtocolError::DuplicateRegistration { .. })
    ));
}

#[test]
fn test_reply_inherits_transport_flags() {
    let mut request = ack_packet().with_flags(PacketFlags::ENCRYPTED | PacketFlags::UDP | PacketFlags::NEEDS_REPLY);
    request.packet_id = 12;

    let reply = request.reply(ReplyCode::Unauthorized, "nope");
    assert_eq!(reply.packet_type, GENERIC_REPLY);
    assert!(reply.is_reply());
    assert!(reply.is_encrypted());
    assert!(reply.is_udp());
    assert!(!reply.needs_reply());

    let body = reply.as_reply().unwrap();
    assert_eq!(body.reply_to_id, 12);
    assert_eq!(body.reply_to_type, ACK);
    assert_eq!(body.result, ReplyCode::Unauthorized);
    assert!(!body.result.is_ok());
}
