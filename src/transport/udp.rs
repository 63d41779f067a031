//! UDP endpoint shared by many connections.
//!
//! Datagrams are demultiplexed by source address. An address that is not
//! routed yet may only send an unencrypted `UdpProbe` carrying a token the
//! listener handed out in `NatInfo`; a matching probe maps the address to the
//! waiting connection.

use super::{lock, TransitSink, UdpRoute};
use crate::config::{TransitKind, IDLE_TICK};
use crate::core::body::split_prefix;
use crate::core::codec::EnvelopeCodec;
use crate::core::cursor::Frame;
use crate::core::envelope::PacketFlags;
use crate::error::{ProtocolError, Result};
use crate::protocol::messages::{UdpProbe, UDP_PROBE};
use crate::utils::metrics::global_metrics;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Extra room over the datagram limit so oversize datagrams are seen and
/// rejected rather than silently truncated.
const RECV_BUFFER: usize = 64 * 1024;

pub struct UdpListener {
    socket: Arc<UdpSocket>,
    kind: TransitKind,
    max_body: usize,
    routes: RwLock<HashMap<SocketAddr, Weak<dyn TransitSink>>>,
    pending: Mutex<HashMap<u64, Weak<dyn TransitSink>>>,
    stop: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

fn probe_token(frame: &Frame) -> Result<u64> {
    let (_, _, body) = split_prefix(&frame.body)?;
    let probe: UdpProbe = bincode::deserialize(body)?;
    Ok(probe.token)
}

impl UdpListener {
    pub fn bind(addr: impl ToSocketAddrs, kind: TransitKind, max_body: usize) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr)?;
        let (shutdown, _) = watch::channel(false);
        debug!(local_addr = ?socket.local_addr().ok(), ?kind, "UDP endpoint bound");

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            kind,
            max_body,
            routes: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            stop: Arc::new(AtomicBool::new(false)),
            shutdown,
            worker: Mutex::new(None),
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn kind(&self) -> TransitKind {
        self.kind
    }

    /// Begin receiving. Polling endpoints only switch to non-blocking mode;
    /// the host drains them with [`poll`](Self::poll).
    pub fn start(self: &Arc<Self>) -> Result<()> {
        match self.kind {
            TransitKind::Completion => {
                let handle = Handle::try_current()
                    .map_err(|_| ProtocolError::Custom("completion UDP requires a tokio runtime".into()))?;
                let std_socket = self.socket.try_clone()?;
                std_socket.set_nonblocking(true)?;
                let socket = {
                    let _guard = handle.enter();
                    tokio::net::UdpSocket::from_std(std_socket)?
                };

                let endpoint = Arc::downgrade(self);
                let mut shutdown = self.shutdown.subscribe();
                handle.spawn(async move {
                    let mut buf = vec![0u8; RECV_BUFFER];
                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            received = socket.recv_from(&mut buf) => {
                                let Some(endpoint) = endpoint.upgrade() else { break };
                                match received {
                                    Ok((n, from)) => endpoint.handle_datagram(&buf[..n], from),
                                    Err(e) => debug!(error = %e, "UDP receive failed"),
                                }
                            }
                        }
                    }
                });
            }
            TransitKind::Threaded => {
                self.socket.set_read_timeout(Some(IDLE_TICK))?;
                let endpoint = Arc::downgrade(self);
                let socket = Arc::clone(&self.socket);
                let stop = Arc::clone(&self.stop);
                let handle = thread::Builder::new()
                    .name("peerwire-udp".into())
                    .spawn(move || {
                        let mut buf = vec![0u8; RECV_BUFFER];
                        while !stop.load(Ordering::Acquire) {
                            match socket.recv_from(&mut buf) {
                                Ok((n, from)) => match endpoint.upgrade() {
                                    Some(endpoint) => endpoint.handle_datagram(&buf[..n], from),
                                    None => break,
                                },
                                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                                Err(e) => debug!(error = %e, "UDP receive failed"),
                            }
                        }
                    })?;
                *lock(&self.worker)? = Some(handle);
            }
            TransitKind::Polling => self.socket.set_nonblocking(true)?,
        }
        info!(local_addr = ?self.socket.local_addr().ok(), "UDP endpoint started");
        Ok(())
    }

    /// Drain every datagram currently waiting. For polling endpoints.
    pub fn poll(&self) -> Result<usize> {
        let mut buf = vec![0u8; RECV_BUFFER];
        let mut count = 0;
        while !self.stop.load(Ordering::Acquire) {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    self.handle_datagram(&buf[..n], from);
                    count += 1;
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(count)
    }

    fn routed(&self, from: &SocketAddr) -> Option<Arc<dyn TransitSink>> {
        self.routes.read().ok()?.get(from)?.upgrade()
    }

    pub fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let frame = match EnvelopeCodec::new(self.max_body).decode_datagram(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(%from, error = %e, "Discarding malformed datagram");
                global_metrics().udp_dropped();
                return;
            }
        };

        if let Some(sink) = self.routed(&from) {
            trace!(%from, conn_id = sink.conn_id(), "Datagram routed");
            sink.on_bytes_received(datagram.len());
            sink.on_frame(frame);
            return;
        }

        let plain = !frame
            .envelope
            .flags
            .intersects(PacketFlags::ENCRYPTED | PacketFlags::COMPRESSED);
        if frame.envelope.packet_type == UDP_PROBE && plain {
            match probe_token(&frame) {
                Ok(token) => {
                    let sink = lock(&self.pending)
                        .ok()
                        .and_then(|mut pending| pending.remove(&token))
                        .and_then(|weak| weak.upgrade());
                    if let Some(sink) = sink {
                        info!(%from, conn_id = sink.conn_id(), "UDP probe accepted");
                        self.route(from, Arc::downgrade(&sink));
                        sink.on_udp_bound(self.route_to(from));
                        sink.on_bytes_received(datagram.len());
                        sink.on_frame(frame);
                        return;
                    }
                    debug!(%from, token, "UDP probe with unknown token");
                }
                Err(e) => debug!(%from, error = %e, "Malformed UDP probe"),
            }
        } else {
            debug!(%from, packet_type = frame.envelope.packet_type, "Datagram from unmapped endpoint");
        }
        global_metrics().udp_dropped();
    }

    pub fn route(&self, addr: SocketAddr, sink: Weak<dyn TransitSink>) {
        if let Ok(mut routes) = self.routes.write() {
            routes.insert(addr, sink);
        }
    }

    pub fn unroute(&self, addr: &SocketAddr) {
        if let Ok(mut routes) = self.routes.write() {
            routes.remove(addr);
        }
    }

    pub fn is_routed(&self, addr: &SocketAddr) -> bool {
        self.routed(addr).is_some()
    }

    /// Remember which connection owns `token` until its probe arrives.
    pub fn expect_probe(&self, token: u64, sink: Weak<dyn TransitSink>) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(token, sink);
        }
    }

    pub fn forget_probe(&self, token: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&token);
        }
    }

    pub fn route_to(&self, peer: SocketAddr) -> UdpRoute {
        UdpRoute::new(Arc::clone(&self.socket), peer)
    }

    pub fn send_to(&self, datagram: &[u8], peer: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(datagram, peer)?)
    }

    pub fn stop(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);

        let worker = lock(&self.worker).ok().and_then(|mut worker| worker.take());
        if let Some(worker) = worker {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!("UDP receive thread panicked");
            }
        }

        if let Ok(mut routes) = self.routes.write() {
            routes.clear();
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
        debug!("UDP endpoint stopped");
    }
}

impl Drop for UdpListener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.shutdown.send_replace(true);
    }
}
