//! Caller-pumped transit.
//!
//! Nothing happens on its own: the host drives `process_receive` and
//! `process_send` (usually through `Connection::pump`). The socket stays
//! non-blocking; a write that would block keeps its offset and resumes on the
//! next pump.

use super::{lock, SendStatus, Transit, TransitCore, TransitSink};
use crate::config::TransitKind;
use crate::core::cursor::Frame;
use crate::error::{constants, Result};
use crate::utils::buffer_pool::{Lease, PoolClass};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

struct PendingWrite {
    lease: Lease,
    offset: usize,
}

pub struct PollingTransit {
    core: Arc<TransitCore>,
    reader: Mutex<Option<(TcpStream, Lease)>>,
    writer: Mutex<Option<TcpStream>>,
    queue: Mutex<VecDeque<PendingWrite>>,
    listening: AtomicBool,
    detached: AtomicBool,
}

impl PollingTransit {
    pub fn new(core: Arc<TransitCore>) -> Self {
        Self {
            core,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            listening: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        }
    }
}

impl Transit for PollingTransit {
    fn kind(&self) -> TransitKind {
        TransitKind::Polling
    }

    fn core(&self) -> &TransitCore {
        &self.core
    }

    fn attach(&self, stream: TcpStream, sink: Weak<dyn TransitSink>) -> Result<()> {
        stream.set_nonblocking(true)?;
        let writer = stream.try_clone()?;
        let lease = self.core.pool().acquire(PoolClass::Read);

        self.core.set_sink(sink);
        *lock(&self.reader)? = Some((stream, lease));
        *lock(&self.writer)? = Some(writer);
        Ok(())
    }

    fn listen_for_data(&self) -> Result<()> {
        self.listening.store(true, Ordering::Release);
        Ok(())
    }

    fn send_tcp(&self, frame: Frame) -> SendStatus {
        if self.detached.load(Ordering::Acquire) {
            return SendStatus::Dropped;
        }
        let lease = match self.core.encode(&frame) {
            Ok(lease) => lease,
            Err(e) => {
                warn!(conn_id = self.core.conn_id(), error = %e, "Failed to encode frame");
                return SendStatus::Dropped;
            }
        };
        match lock(&self.queue) {
            Ok(mut queue) => {
                queue.push_back(PendingWrite { lease, offset: 0 });
                SendStatus::Queued
            }
            Err(_) => SendStatus::Dropped,
        }
    }

    fn process_send(&self) -> Result<usize> {
        let mut writer = lock(&self.writer)?;
        let Some(stream) = writer.as_mut() else {
            return Ok(0);
        };

        let mut written = 0;
        let mut completed = Vec::new();
        let mut failure = None;
        {
            let mut queue = lock(&self.queue)?;
            while let Some(pending) = queue.front_mut() {
                let total = pending.lease.buffer().len();
                match stream.write(&pending.lease.buffer()[pending.offset..]) {
                    Ok(0) => {
                        failure = Some(constants::ERR_CONNECTION_CLOSED.to_string());
                        break;
                    }
                    Ok(n) => {
                        pending.offset += n;
                        written += n;
                        if pending.offset == total {
                            completed.push(total);
                            queue.pop_front();
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        failure = Some(format!("socket write failed: {e}"));
                        break;
                    }
                }
            }
        }
        drop(writer);

        for total in completed {
            self.core.report_sent(total, false);
        }
        if let Some(reason) = failure {
            self.core.fault(reason);
        }
        Ok(written)
    }

    fn process_receive(&self) -> Result<usize> {
        if !self.listening.load(Ordering::Acquire) {
            return Ok(0);
        }
        // Taken out while frames are delivered so a handler may kill or
        // detach without deadlocking on the reader.
        let Some((mut stream, mut lease)) = lock(&self.reader)?.take() else {
            return Ok(0);
        };

        let mut total = 0;
        let outcome = loop {
            match stream.read(lease.prepare_read()) {
                Ok(0) => break Err(constants::ERR_CONNECTION_CLOSED.to_string()),
                Ok(n) => {
                    total += n;
                    if let Err(e) = self.core.deliver(&mut lease, n) {
                        break Err(format!("protocol fault: {e}"));
                    }
                    if self.detached.load(Ordering::Acquire) {
                        break Ok(());
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => break Err(format!("socket read failed: {e}")),
            }
        };

        match outcome {
            Ok(()) => {
                if !self.detached.load(Ordering::Acquire) {
                    *lock(&self.reader)? = Some((stream, lease));
                }
            }
            Err(reason) => self.core.fault(reason),
        }
        Ok(total)
    }

    fn has_queued_packets(&self) -> bool {
        lock(&self.queue).map(|queue| !queue.is_empty()).unwrap_or(false)
    }

    fn detach(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        self.listening.store(false, Ordering::Release);

        if let Ok(mut reader) = self.reader.lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.writer.lock() {
            if let Some(stream) = writer.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
        debug!(conn_id = self.core.conn_id(), "Polling transit detached");
        self.core.detach();
    }
}
