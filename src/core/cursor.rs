//! Incremental reassembly of envelopes and bodies from a byte stream.
//!
//! A [`ReassemblyCursor`] is fed arbitrary chunks as they come off the socket.
//! A single chunk may complete zero, one or many frames and a single frame may
//! span many chunks. The cursor only ever buffers the one in-flight frame;
//! the caller keeps the rest of the chunk and feeds it again.

use crate::core::envelope::{Envelope, ENVELOPE_LEN};
use crate::error::{ProtocolError, Result};

/// One fully reassembled frame: the envelope plus exactly `length` body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub envelope: Envelope,
    pub body: Vec<u8>,
}

/// Outcome of a single [`ReassemblyCursor::advance`] step.
#[derive(Debug)]
pub struct Progress {
    /// Bytes taken from the front of the input.
    pub consumed: usize,
    /// A frame completed by this step, if any.
    pub frame: Option<Frame>,
}

#[derive(Debug)]
pub struct ReassemblyCursor {
    header: [u8; ENVELOPE_LEN],
    header_filled: usize,
    envelope: Option<Envelope>,
    body: Vec<u8>,
    body_filled: usize,
    max_body: usize,
}

impl ReassemblyCursor {
    pub fn new(max_body: usize) -> Self {
        Self {
            header: [0u8; ENVELOPE_LEN],
            header_filled: 0,
            envelope: None,
            body: Vec::new(),
            body_filled: 0,
            max_body,
        }
    }

    /// True while the envelope of the current frame is not yet complete.
    pub fn awaiting_header(&self) -> bool {
        self.envelope.is_none()
    }

    /// True when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        self.header_filled == 0 && self.envelope.is_none()
    }

    /// Bytes of the in-flight frame buffered so far, header included.
    pub fn buffered(&self) -> usize {
        self.header_filled + self.body_filled
    }

    /// Decoded envelope of the in-flight frame, once the header is complete.
    pub fn envelope(&self) -> Option<&Envelope> {
        self.envelope.as_ref()
    }

    pub fn reset(&mut self) {
        self.header_filled = 0;
        self.envelope = None;
        self.body = Vec::new();
        self.body_filled = 0;
    }

    /// Take as many bytes from `input` as the current frame needs.
    ///
    /// Stops at the end of the first frame completed so the caller can reset
    /// and continue with the remainder.
    pub fn advance(&mut self, input: &[u8]) -> Result<Progress> {
        let mut consumed = 0;

        if self.envelope.is_none() {
            let want = ENVELOPE_LEN - self.header_filled;
            let take = want.min(input.len());
            self.header[self.header_filled..self.header_filled + take]
                .copy_from_slice(&input[..take]);
            self.header_filled += take;
            consumed += take;

            if self.header_filled < ENVELOPE_LEN {
                return Ok(Progress {
                    consumed,
                    frame: None,
                });
            }

            let envelope = Envelope::from_bytes(&self.header);
            let length = envelope.length as usize;
            if length > self.max_body {
                self.reset();
                return Err(ProtocolError::OversizedPacket(length));
            }
            self.body = vec![0u8; length];
            self.body_filled = 0;
            self.envelope = Some(envelope);
        }

        let remaining = &input[consumed..];
        let want = self.body.len() - self.body_filled;
        let take = want.min(remaining.len());
        self.body[self.body_filled..self.body_filled + take].copy_from_slice(&remaining[..take]);
        self.body_filled += take;
        consumed += take;

        if self.body_filled < self.body.len() {
            return Ok(Progress {
                consumed,
                frame: None,
            });
        }

        // body complete (possibly zero-length)
        let frame = match self.envelope.take() {
            Some(envelope) => Frame {
                envelope,
                body: std::mem::take(&mut self.body),
            },
            None => return Err(ProtocolError::InvalidHeader),
        };
        self.reset();

        Ok(Progress {
            consumed,
            frame: Some(frame),
        })
    }

    /// Feed a whole chunk, pushing every completed frame into `out`.
    ///
    /// Returns the number of frames produced.
    pub fn feed(&mut self, mut chunk: &[u8], out: &mut Vec<Frame>) -> Result<usize> {
        let before = out.len();
        while !chunk.is_empty() {
            let step = self.advance(chunk)?;
            chunk = &chunk[step.consumed..];
            if let Some(frame) = step.frame {
                out.push(frame);
            }
        }
        Ok(out.len() - before)
    }
}
