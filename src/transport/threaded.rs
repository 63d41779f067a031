//! Thread-per-direction transit.
//!
//! A receive thread blocks on the socket with a short read timeout so it can
//! raise idle ticks; a send thread drains a channel of encoded frames.

use super::{lock, SendStatus, Transit, TransitCore, TransitSink};
use crate::config::{TransitKind, IDLE_TICK};
use crate::core::cursor::Frame;
use crate::error::{constants, ProtocolError, Result};
use crate::utils::buffer_pool::{Lease, PoolClass};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, warn};

pub struct ThreadedTransit {
    core: Arc<TransitCore>,
    stream: Mutex<Option<TcpStream>>,
    sender: Mutex<Option<mpsc::Sender<Lease>>>,
    pending: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadedTransit {
    pub fn new(core: Arc<TransitCore>) -> Self {
        Self {
            core,
            stream: Mutex::new(None),
            sender: Mutex::new(None),
            pending: Arc::new(AtomicUsize::new(0)),
            stop: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        }
    }

    fn spawn(&self, name: String, body: impl FnOnce() + Send + 'static) -> Result<()> {
        let handle = thread::Builder::new().name(name).spawn(body)?;
        lock(&self.threads)?.push(handle);
        Ok(())
    }
}

fn send_loop(
    core: Arc<TransitCore>,
    mut writer: TcpStream,
    frames: mpsc::Receiver<Lease>,
    pending: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
) {
    for lease in frames {
        let result = writer.write_all(lease.buffer());
        pending.fetch_sub(1, Ordering::AcqRel);
        match result {
            Ok(()) => core.report_sent(lease.buffer().len(), false),
            Err(e) => {
                if !stop.load(Ordering::Acquire) {
                    core.fault(format!("socket write failed: {e}"));
                }
                break;
            }
        }
    }
    pending.store(0, Ordering::Release);
}

fn receive_loop(core: Arc<TransitCore>, mut reader: TcpStream, stop: Arc<AtomicBool>) {
    let mut lease = core.pool().acquire(PoolClass::Read);
    let mut last_idle = Instant::now();

    while !stop.load(Ordering::Acquire) {
        match reader.read(lease.prepare_read()) {
            Ok(0) => {
                if !stop.load(Ordering::Acquire) {
                    core.fault(constants::ERR_CONNECTION_CLOSED);
                }
                break;
            }
            Ok(n) => {
                if let Err(e) = core.deliver(&mut lease, n) {
                    core.fault(format!("protocol fault: {e}"));
                    break;
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                if !stop.load(Ordering::Acquire) {
                    core.fault(format!("socket read failed: {e}"));
                }
                break;
            }
        }

        if last_idle.elapsed() >= IDLE_TICK {
            last_idle = Instant::now();
            core.idle();
        }
    }
    debug!(conn_id = core.conn_id(), "Receive thread finished");
}

impl Transit for ThreadedTransit {
    fn kind(&self) -> TransitKind {
        TransitKind::Threaded
    }

    fn core(&self) -> &TransitCore {
        &self.core
    }

    fn attach(&self, stream: TcpStream, sink: Weak<dyn TransitSink>) -> Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(IDLE_TICK))?;
        let writer = stream.try_clone()?;

        self.core.set_sink(sink);
        let conn_id = self.core.conn_id();

        let (tx, rx) = mpsc::channel();
        let core = Arc::clone(&self.core);
        let pending = Arc::clone(&self.pending);
        let stop = Arc::clone(&self.stop);
        self.spawn(format!("peerwire-send-{conn_id}"), move || {
            send_loop(core, writer, rx, pending, stop)
        })?;

        *lock(&self.sender)? = Some(tx);
        *lock(&self.stream)? = Some(stream);
        Ok(())
    }

    fn listen_for_data(&self) -> Result<()> {
        let reader = lock(&self.stream)?
            .as_ref()
            .ok_or_else(|| ProtocolError::Custom(constants::ERR_NOT_ATTACHED.into()))?
            .try_clone()?;

        let core = Arc::clone(&self.core);
        let stop = Arc::clone(&self.stop);
        self.spawn(format!("peerwire-recv-{}", self.core.conn_id()), move || {
            receive_loop(core, reader, stop)
        })
    }

    fn send_tcp(&self, frame: Frame) -> SendStatus {
        if self.stop.load(Ordering::Acquire) {
            return SendStatus::Dropped;
        }
        let lease = match self.core.encode(&frame) {
            Ok(lease) => lease,
            Err(e) => {
                warn!(conn_id = self.core.conn_id(), error = %e, "Failed to encode frame");
                return SendStatus::Dropped;
            }
        };

        let Ok(sender) = lock(&self.sender) else {
            return SendStatus::Dropped;
        };
        let Some(sender) = sender.as_ref() else {
            return SendStatus::Dropped;
        };

        self.pending.fetch_add(1, Ordering::AcqRel);
        if sender.send(lease).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return SendStatus::Dropped;
        }
        SendStatus::Queued
    }

    fn has_queued_packets(&self) -> bool {
        self.pending.load(Ordering::Acquire) > 0
    }

    fn detach(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        if let Ok(mut stream) = self.stream.lock() {
            if let Some(stream) = stream.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        self.core.detach();

        let handles: Vec<JoinHandle<()>> = match self.threads.lock() {
            Ok(mut threads) => threads.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        let current = thread::current().id();
        for handle in handles {
            // Detach may run on one of our own threads (a fault inside a read)
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        debug!("Threaded transit detached");
    }
}
