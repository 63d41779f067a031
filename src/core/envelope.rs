//! Fixed-size envelope that precedes every packet body on the wire.
//!
//! ```text
//! [length: u32][type: i32][subtype: i32][flags: u8]   (13 bytes, little-endian)
//! ```
//!
//! `length` is the body length after compression and encryption have been
//! applied.

use bitflags::bitflags;
use bytes::{Buf, BufMut};

/// Size of the encoded envelope in bytes.
pub const ENVELOPE_LEN: usize = 13;

bitflags! {
    /// Per-packet delivery and transform flags. Bit positions are part of the
    /// wire format and must not change within a deployment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u8 {
        const ENCRYPTED   = 0b0000_0001;
        const COMPRESSED  = 0b0000_0010;
        const CRITICAL    = 0b0000_0100;
        const NEEDS_ACK   = 0b0000_1000;
        const UDP         = 0b0001_0000;
        const NEEDS_REPLY = 0b0010_0000;
        const IS_REPLY    = 0b0100_0000;
    }
}

/// Decoded envelope fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub length: u32,
    pub packet_type: i32,
    pub subtype: i32,
    pub flags: PacketFlags,
}

impl Envelope {
    pub fn new(packet_type: i32, subtype: i32, flags: PacketFlags, length: u32) -> Self {
        Self {
            length,
            packet_type,
            subtype,
            flags,
        }
    }

    /// Append the 13 header bytes to `dst`.
    #[inline]
    pub fn write_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_u32_le(self.length);
        dst.put_i32_le(self.packet_type);
        dst.put_i32_le(self.subtype);
        dst.put_u8(self.flags.bits());
    }

    pub fn to_bytes(&self) -> [u8; ENVELOPE_LEN] {
        let mut out = [0u8; ENVELOPE_LEN];
        let mut slice = &mut out[..];
        self.write_to(&mut slice);
        out
    }

    /// Parse a complete header. Unknown flag bits are preserved.
    #[inline]
    pub fn from_bytes(header: &[u8; ENVELOPE_LEN]) -> Self {
        let mut src = &header[..];
        let length = src.get_u32_le();
        let packet_type = src.get_i32_le();
        let subtype = src.get_i32_le();
        let flags = PacketFlags::from_bits_retain(src.get_u8());
        Self {
            length,
            packet_type,
            subtype,
            flags,
        }
    }

    /// Total encoded size, header included.
    pub fn frame_len(&self) -> usize {
        ENVELOPE_LEN + self.length as usize
    }
}
