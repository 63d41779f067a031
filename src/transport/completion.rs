//! Completion-driven transit on the tokio runtime.
//!
//! One read is always armed. Writes are chained: the first send spawns a
//! write task, later sends queue behind it and the task drains the queue as
//! each write completes, so at most one write is outstanding per socket.

use super::{lock, SendStatus, Transit, TransitCore, TransitSink};
use crate::config::{TransitKind, IDLE_TICK};
use crate::core::cursor::Frame;
use crate::error::{constants, ProtocolError, Result};
use crate::utils::buffer_pool::{Lease, PoolClass};
use std::collections::VecDeque;
use std::net::TcpStream as StdTcpStream;
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

#[derive(Default)]
struct WriteQueue {
    in_flight: bool,
    queue: VecDeque<Lease>,
}

struct CompletionIo {
    reader: Option<OwnedReadHalf>,
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    shutdown: watch::Sender<bool>,
    handle: Handle,
}

pub struct CompletionTransit {
    core: Arc<TransitCore>,
    io: Mutex<Option<CompletionIo>>,
    writes: Arc<Mutex<WriteQueue>>,
}

impl CompletionTransit {
    pub fn new(core: Arc<TransitCore>) -> Self {
        Self {
            core,
            io: Mutex::new(None),
            writes: Arc::new(Mutex::new(WriteQueue::default())),
        }
    }
}

async fn read_loop(core: Arc<TransitCore>, mut reader: OwnedReadHalf, mut shutdown: watch::Receiver<bool>) {
    let mut lease = core.pool().acquire(PoolClass::Read);
    let mut idle = tokio::time::interval(IDLE_TICK);
    idle.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let read = tokio::select! {
            _ = shutdown.changed() => break,
            _ = idle.tick() => {
                core.idle();
                continue;
            }
            read = reader.read(lease.prepare_read()) => read,
        };

        match read {
            Ok(0) => {
                core.fault(constants::ERR_CONNECTION_CLOSED);
                break;
            }
            Ok(n) => {
                trace!(conn_id = core.conn_id(), bytes = n, "Read completed");
                if let Err(e) = core.deliver(&mut lease, n) {
                    core.fault(format!("protocol fault: {e}"));
                    break;
                }
            }
            Err(e) => {
                core.fault(format!("socket read failed: {e}"));
                break;
            }
        }
    }
    debug!(conn_id = core.conn_id(), "Read loop finished");
}

async fn write_chain(
    core: Arc<TransitCore>,
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    writes: Arc<Mutex<WriteQueue>>,
    mut lease: Lease,
) {
    loop {
        let result = {
            let mut writer = writer.lock().await;
            writer.write_all(lease.buffer()).await
        };

        if let Err(e) = result {
            if let Ok(mut writes) = writes.lock() {
                writes.in_flight = false;
                writes.queue.clear();
            }
            core.fault(format!("socket write failed: {e}"));
            return;
        }
        core.report_sent(lease.buffer().len(), false);

        let next = match writes.lock() {
            Ok(mut writes) => match writes.queue.pop_front() {
                Some(next) => next,
                None => {
                    writes.in_flight = false;
                    return;
                }
            },
            Err(_) => return,
        };
        lease = next;
    }
}

impl Transit for CompletionTransit {
    fn kind(&self) -> TransitKind {
        TransitKind::Completion
    }

    fn core(&self) -> &TransitCore {
        &self.core
    }

    fn attach(&self, stream: StdTcpStream, sink: Weak<dyn TransitSink>) -> Result<()> {
        let handle = Handle::try_current()
            .map_err(|_| ProtocolError::Custom("completion transit requires a tokio runtime".into()))?;

        stream.set_nonblocking(true)?;
        let stream = {
            let _guard = handle.enter();
            TcpStream::from_std(stream)?
        };
        let (reader, writer) = stream.into_split();
        let (shutdown, _) = watch::channel(false);

        self.core.set_sink(sink);
        *lock(&self.io)? = Some(CompletionIo {
            reader: Some(reader),
            writer: Arc::new(AsyncMutex::new(writer)),
            shutdown,
            handle,
        });
        Ok(())
    }

    fn listen_for_data(&self) -> Result<()> {
        let mut io = lock(&self.io)?;
        let io = io
            .as_mut()
            .ok_or_else(|| ProtocolError::Custom(constants::ERR_NOT_ATTACHED.into()))?;

        let Some(reader) = io.reader.take() else {
            return Ok(());
        };
        io.handle
            .spawn(read_loop(Arc::clone(&self.core), reader, io.shutdown.subscribe()));
        Ok(())
    }

    fn send_tcp(&self, frame: Frame) -> SendStatus {
        let lease = match self.core.encode(&frame) {
            Ok(lease) => lease,
            Err(e) => {
                warn!(conn_id = self.core.conn_id(), error = %e, "Failed to encode frame");
                return SendStatus::Dropped;
            }
        };

        let (writer, handle) = match lock(&self.io) {
            Ok(io) => match io.as_ref() {
                Some(io) => (Arc::clone(&io.writer), io.handle.clone()),
                None => return SendStatus::Dropped,
            },
            Err(_) => return SendStatus::Dropped,
        };

        let Ok(mut writes) = lock(&self.writes) else {
            return SendStatus::Dropped;
        };
        if writes.in_flight {
            writes.queue.push_back(lease);
            return SendStatus::Queued;
        }
        writes.in_flight = true;
        drop(writes);

        handle.spawn(write_chain(
            Arc::clone(&self.core),
            writer,
            Arc::clone(&self.writes),
            lease,
        ));
        SendStatus::Sent
    }

    fn has_queued_packets(&self) -> bool {
        lock(&self.writes)
            .map(|writes| writes.in_flight || !writes.queue.is_empty())
            .unwrap_or(false)
    }

    fn detach(&self) {
        let io = lock(&self.io).ok().and_then(|mut io| io.take());
        if let Some(io) = io {
            io.shutdown.send_replace(true);
            let writer = io.writer;
            io.handle.spawn(async move {
                let _ = writer.lock().await.shutdown().await;
            });
            debug!(conn_id = self.core.conn_id(), "Completion transit detached");
        }

        if let Ok(mut writes) = self.writes.lock() {
            writes.queue.clear();
        }
        self.core.detach();
    }
}
