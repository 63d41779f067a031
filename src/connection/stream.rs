//! File streaming over a connection.
//!
//! A file travels as a run of `StreamChunk` packets sharing a stream id. The
//! receiver spools chunks into a temporary file and hands the finished file
//! to the stream listeners once the last chunk arrives.

use super::Connection;
use crate::core::envelope::PacketFlags;
use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::protocol::messages::{StreamChunk, STREAM_CHUNK};
use crate::transport::{lock, SendStatus};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Payload bytes per chunk.
pub const STREAM_CHUNK_SIZE: usize = 16 * 1024;

/// A completely received file stream.
#[derive(Debug)]
pub struct ReceivedStream {
    pub stream_id: u64,
    pub description: String,
    pub length: u64,
    /// Spooled contents; deleted when dropped unless persisted.
    pub file: NamedTempFile,
}

type StreamListener = Arc<dyn Fn(&Connection, &ReceivedStream) + Send + Sync>;

struct IncomingStream {
    description: String,
    file: NamedTempFile,
    received: u64,
}

#[derive(Default)]
pub(super) struct StreamState {
    next_id: AtomicU64,
    incoming: Mutex<HashMap<u64, IncomingStream>>,
    listeners: Mutex<Vec<StreamListener>>,
}

impl StreamState {
    pub(super) fn clear(&self) {
        if let Ok(mut incoming) = self.incoming.lock() {
            incoming.clear();
        }
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.clear();
        }
    }
}

fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

impl Connection {
    /// Called with every fully received stream.
    pub fn on_stream<F>(&self, listener: F)
    where
        F: Fn(&Connection, &ReceivedStream) + Send + Sync + 'static,
    {
        if let Ok(mut listeners) = self.inner.streams.listeners.lock() {
            listeners.push(Arc::new(listener));
        }
    }

    /// Stream the file at `path` to the peer. Returns the stream id.
    pub fn send_file(&self, path: impl AsRef<Path>, description: &str) -> Result<u64> {
        let mut file = File::open(path.as_ref())?;
        let total = file.metadata()?.len();
        let stream_id = self.inner.streams.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        let mut flags = PacketFlags::COMPRESSED | PacketFlags::NEEDS_ACK;
        if self.is_secured() {
            flags |= PacketFlags::ENCRYPTED;
        }

        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        let mut sent: u64 = 0;
        let mut initial = true;
        loop {
            let n = read_full(&mut file, &mut buf)?;
            sent += n as u64;
            let last = n < buf.len() || sent >= total;

            let chunk = StreamChunk {
                stream_id,
                description: if initial { description.to_string() } else { String::new() },
                initial,
                last,
                total_length: sent,
                data: buf[..n].to_vec(),
            };
            if self.send(Packet::new(STREAM_CHUNK, 0, chunk).with_flags(flags)) == SendStatus::Dropped {
                return Err(ProtocolError::ConnectionClosed);
            }

            initial = false;
            if last {
                break;
            }
        }

        info!(conn_id = self.id(), stream_id, bytes = sent, "File stream sent");
        Ok(stream_id)
    }
}

pub(super) fn on_stream_chunk(conn: &Connection, packet: &Packet) -> Result<Option<Packet>> {
    let chunk = packet
        .body::<StreamChunk>()
        .ok_or(ProtocolError::UnexpectedMessage)?;

    let finished = {
        let mut incoming = lock(&conn.inner.streams.incoming)?;
        if chunk.initial {
            incoming.insert(
                chunk.stream_id,
                IncomingStream {
                    description: chunk.description.clone(),
                    file: NamedTempFile::new()?,
                    received: 0,
                },
            );
        }

        let Some(stream) = incoming.get_mut(&chunk.stream_id) else {
            warn!(conn_id = conn.id(), stream_id = chunk.stream_id, "Chunk for unknown stream");
            return Ok(None);
        };

        stream.file.write_all(&chunk.data)?;
        stream.received += chunk.data.len() as u64;
        if stream.received != chunk.total_length {
            let received = stream.received;
            incoming.remove(&chunk.stream_id);
            return Err(ProtocolError::Custom(format!(
                "stream {} length mismatch: received {received}, sender reports {}",
                chunk.stream_id, chunk.total_length
            )));
        }

        if !chunk.last {
            return Ok(None);
        }
        incoming.remove(&chunk.stream_id)
    };

    let Some(mut stream) = finished else {
        return Ok(None);
    };
    stream.file.flush()?;
    let received = ReceivedStream {
        stream_id: chunk.stream_id,
        description: stream.description,
        length: stream.received,
        file: stream.file,
    };
    debug!(conn_id = conn.id(), stream_id = received.stream_id, bytes = received.length, "File stream received");

    let listeners = lock(&conn.inner.streams.listeners)?.clone();
    for listener in listeners {
        listener(conn, &received);
    }
    Ok(None)
}
