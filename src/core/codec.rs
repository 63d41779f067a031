use crate::core::cursor::{Frame, ReassemblyCursor};
use crate::core::envelope::{Envelope, ENVELOPE_LEN};
use crate::error::{ProtocolError, Result};
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Envelope codec over a [`ReassemblyCursor`].
///
/// Used to encode outbound frames into pooled write buffers and to decode
/// whole datagrams, where the cursor is fed a complete buffer at once.
#[derive(Debug)]
pub struct EnvelopeCodec {
    cursor: ReassemblyCursor,
    max_body: usize,
}

impl EnvelopeCodec {
    pub fn new(max_body: usize) -> Self {
        Self {
            cursor: ReassemblyCursor::new(max_body),
            max_body,
        }
    }

    /// Decode one datagram that must contain exactly one frame.
    pub fn decode_datagram(&mut self, datagram: &[u8]) -> Result<Frame> {
        self.cursor.reset();
        let step = self.cursor.advance(datagram)?;
        match step.frame {
            Some(frame) if step.consumed == datagram.len() => Ok(frame),
            _ => {
                self.cursor.reset();
                Err(ProtocolError::InvalidHeader)
            }
        }
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        while !src.is_empty() {
            let step = self.cursor.advance(&src[..])?;
            src.advance(step.consumed);
            if step.frame.is_some() {
                return Ok(step.frame);
            }
        }
        Ok(None)
    }
}

impl Encoder<Frame> for EnvelopeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        <Self as Encoder<&Frame>>::encode(self, &frame, dst)
    }
}

impl<'a> Encoder<&'a Frame> for EnvelopeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: &'a Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.body.len() > self.max_body {
            return Err(ProtocolError::OversizedPacket(frame.body.len()));
        }
        let envelope = Envelope {
            length: frame.body.len() as u32,
            ..frame.envelope
        };
        dst.reserve(ENVELOPE_LEN + frame.body.len());
        envelope.write_to(dst);
        dst.extend_from_slice(&frame.body);
        Ok(())
    }
}
