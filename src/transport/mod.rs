//! # Transport Layer
//!
//! Moves frames between a connection and its sockets.
//!
//! A [`Transit`] owns the TCP socket of one connection and optionally a UDP
//! route. Three strategies implement it and differ only in how I/O is
//! scheduled:
//! - **Completion**: tokio tasks; one read always armed, at most one write in
//!   flight, further writes queued and chained from the write completion
//! - **Polling**: the host calls `process_receive` / `process_send` from its
//!   own loop
//! - **Threaded**: a dedicated receive thread and send thread per connection
//!
//! Routing decisions shared by all three live in [`TransitCore`]: UDP frames
//! are capped at [`MAX_UDP_DATAGRAM`] bytes (oversize frames lose their UDP
//! flag and go over TCP) and UDP sends before UDP is enabled are dropped.
//!
//! Everything a transit observes is reported back through [`TransitSink`].

pub mod completion;
pub mod listener;
pub mod polling;
pub mod threaded;
pub mod udp;

use crate::config::{TransitKind, MAX_UDP_DATAGRAM};
use crate::core::codec::EnvelopeCodec;
use crate::core::cursor::Frame;
use crate::core::envelope::PacketFlags;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::messages::Ack;
use crate::utils::buffer_pool::{Lease, PoolClass, SocketPool};
use crate::utils::metrics::global_metrics;
use crate::utils::time::now_ms;
use std::fmt;
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tokio_util::codec::Encoder;
use tracing::{debug, trace, warn};

/// Outcome of handing a frame to a transit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Waiting behind other writes
    Queued,
    /// Handed to the socket
    Sent,
    /// Discarded (UDP not ready, socket gone, or encoding failed)
    Dropped,
}

/// Where UDP frames for one connection go.
#[derive(Clone)]
pub struct UdpRoute {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpRoute {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn send(&self, datagram: &[u8]) -> std::io::Result<usize> {
        self.socket.send_to(datagram, self.peer)
    }
}

impl fmt::Debug for UdpRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpRoute").field("peer", &self.peer).finish()
    }
}

/// Callbacks from a transit into its connection.
pub trait TransitSink: Send + Sync {
    fn conn_id(&self) -> u64;

    /// A complete frame arrived (TCP or UDP).
    fn on_frame(&self, frame: Frame);

    fn on_bytes_sent(&self, n: usize);

    fn on_bytes_received(&self, n: usize);

    fn on_packet_sent(&self, via_udp: bool);

    /// The socket failed or the peer closed it.
    fn on_transport_fault(&self, reason: String);

    /// Periodic wake-up from the I/O loop.
    fn on_idle(&self);

    /// A UDP endpoint has been mapped to this connection.
    fn on_udp_bound(&self, _route: UdpRoute) {}
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))
}

/// How a frame will travel.
#[derive(Debug)]
pub enum Route {
    Tcp,
    Udp(UdpRoute),
    Dropped,
}

/// State and decisions shared by every transit strategy.
pub struct TransitCore {
    pool: SocketPool,
    max_body: usize,
    sink: RwLock<Option<Weak<dyn TransitSink>>>,
    udp: RwLock<Option<UdpRoute>>,
    last_udp_ack_ms: AtomicI64,
}

impl TransitCore {
    pub fn new(pool: SocketPool, max_body: usize) -> Self {
        Self {
            pool,
            max_body,
            sink: RwLock::new(None),
            udp: RwLock::new(None),
            last_udp_ack_ms: AtomicI64::new(0),
        }
    }

    pub fn pool(&self) -> &SocketPool {
        &self.pool
    }

    pub fn max_body(&self) -> usize {
        self.max_body
    }

    pub fn set_sink(&self, sink: Weak<dyn TransitSink>) {
        if let Ok(mut slot) = self.sink.write() {
            *slot = Some(sink);
        }
    }

    pub fn sink(&self) -> Option<Arc<dyn TransitSink>> {
        self.sink.read().ok()?.as_ref()?.upgrade()
    }

    pub fn conn_id(&self) -> u64 {
        self.sink().map(|s| s.conn_id()).unwrap_or(0)
    }

    pub fn enable_udp(&self, route: UdpRoute) {
        debug!(conn_id = self.conn_id(), peer = %route.peer(), "UDP enabled");
        self.last_udp_ack_ms.store(now_ms(), Ordering::Relaxed);
        if let Ok(mut udp) = self.udp.write() {
            *udp = Some(route);
        }
    }

    pub fn disable_udp(&self) {
        if let Ok(mut udp) = self.udp.write() {
            if udp.take().is_some() {
                debug!(conn_id = self.conn_id(), "UDP disabled");
            }
        }
    }

    pub fn udp_enabled(&self) -> bool {
        self.udp.read().map(|udp| udp.is_some()).unwrap_or(false)
    }

    pub fn udp_route(&self) -> Option<UdpRoute> {
        self.udp.read().ok()?.clone()
    }

    pub fn record_ack(&self, ack: &Ack, via_udp: bool) {
        trace!(acked_id = ack.acked_id, via_udp, "ACK received");
        if via_udp {
            self.last_udp_ack_ms.store(now_ms(), Ordering::Relaxed);
        }
    }

    /// UTC milliseconds of the last ACK that arrived over UDP (or of UDP
    /// enablement, whichever is later).
    pub fn last_udp_ack_ms(&self) -> i64 {
        self.last_udp_ack_ms.load(Ordering::Relaxed)
    }

    /// Decide how `frame` travels. Clears the UDP flag when the datagram
    /// would exceed [`MAX_UDP_DATAGRAM`].
    pub fn route(&self, frame: &mut Frame) -> Route {
        if !frame.envelope.flags.contains(PacketFlags::UDP) {
            return Route::Tcp;
        }

        let Some(route) = self.udp_route() else {
            global_metrics().udp_dropped();
            debug!(
                conn_id = self.conn_id(),
                packet_type = frame.envelope.packet_type,
                "UDP send before UDP is enabled, dropping"
            );
            return Route::Dropped;
        };

        let datagram_len = crate::core::envelope::ENVELOPE_LEN + frame.body.len();
        if datagram_len > MAX_UDP_DATAGRAM {
            global_metrics().udp_redirected();
            debug!(
                conn_id = self.conn_id(),
                datagram_len,
                "UDP frame exceeds datagram limit, sending over TCP"
            );
            frame.envelope.flags.remove(PacketFlags::UDP);
            return Route::Tcp;
        }

        Route::Udp(route)
    }

    /// Encode `frame` into a pooled write buffer.
    pub fn encode(&self, frame: &Frame) -> Result<Lease> {
        let mut lease = self.pool.acquire(PoolClass::Write);
        let mut codec = EnvelopeCodec::new(self.max_body);
        codec.encode(frame, lease.buffer_mut())?;
        Ok(lease)
    }

    pub fn send_udp(&self, route: &UdpRoute, frame: &Frame) -> SendStatus {
        let lease = match self.encode(frame) {
            Ok(lease) => lease,
            Err(e) => {
                warn!(conn_id = self.conn_id(), error = %e, "Failed to encode UDP frame");
                return SendStatus::Dropped;
            }
        };

        match route.send(lease.buffer()) {
            Ok(n) => {
                self.report_sent(n, true);
                SendStatus::Sent
            }
            Err(e) => {
                // UDP is best effort; a failed datagram does not fault the line
                debug!(conn_id = self.conn_id(), error = %e, "UDP send failed");
                SendStatus::Dropped
            }
        }
    }

    /// Feed `n` freshly read bytes at the front of a read lease through its
    /// cursor and hand every completed frame to the sink.
    pub fn deliver(&self, lease: &mut Lease, n: usize) -> Result<usize> {
        let sink = self.sink();
        if let Some(sink) = &sink {
            sink.on_bytes_received(n);
        }

        let (buffer, cursor) = lease.parts_mut();
        let cursor = cursor.ok_or_else(|| ProtocolError::Custom(constants::ERR_NOT_ATTACHED.into()))?;
        let mut frames = Vec::new();
        cursor.feed(&buffer[..n], &mut frames)?;

        let count = frames.len();
        if let Some(sink) = sink {
            for frame in frames {
                sink.on_frame(frame);
            }
        }
        Ok(count)
    }

    pub fn report_sent(&self, n: usize, via_udp: bool) {
        if let Some(sink) = self.sink() {
            sink.on_bytes_sent(n);
            sink.on_packet_sent(via_udp);
        }
    }

    pub fn fault(&self, reason: impl Into<String>) {
        if let Some(sink) = self.sink() {
            sink.on_transport_fault(reason.into());
        }
    }

    pub fn idle(&self) {
        if let Some(sink) = self.sink() {
            sink.on_idle();
        }
    }

    pub fn detach(&self) {
        self.disable_udp();
        if let Ok(mut sink) = self.sink.write() {
            *sink = None;
        }
    }
}

impl fmt::Debug for TransitCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitCore")
            .field("max_body", &self.max_body)
            .field("udp_enabled", &self.udp_enabled())
            .finish()
    }
}

/// Socket I/O strategy for one connection.
pub trait Transit: Send + Sync {
    fn kind(&self) -> TransitKind;

    fn core(&self) -> &TransitCore;

    /// Take ownership of the connected TCP socket.
    fn attach(&self, stream: TcpStream, sink: Weak<dyn TransitSink>) -> Result<()>;

    /// Start receiving.
    fn listen_for_data(&self) -> Result<()>;

    /// Queue or write an already encoded TCP frame.
    fn send_tcp(&self, frame: Frame) -> SendStatus;

    /// Route and send one frame.
    fn send(&self, mut frame: Frame) -> SendStatus {
        match self.core().route(&mut frame) {
            Route::Dropped => SendStatus::Dropped,
            Route::Udp(route) => self.core().send_udp(&route, &frame),
            Route::Tcp => self.send_tcp(frame),
        }
    }

    /// Flush queued writes. Only meaningful for caller-pumped transits.
    fn process_send(&self) -> Result<usize> {
        Ok(0)
    }

    /// Read whatever is available. Only meaningful for caller-pumped transits.
    fn process_receive(&self) -> Result<usize> {
        Ok(0)
    }

    fn on_ack_received(&self, ack: &Ack, via_udp: bool) {
        self.core().record_ack(ack, via_udp);
    }

    /// True while bytes are waiting to be written.
    fn has_queued_packets(&self) -> bool;

    fn enable_udp(&self, route: UdpRoute) {
        self.core().enable_udp(route);
    }

    fn disable_udp(&self) {
        self.core().disable_udp();
    }

    fn udp_enabled(&self) -> bool {
        self.core().udp_enabled()
    }

    /// Close the socket and stop all I/O. Idempotent.
    fn detach(&self);
}

/// Build the transit strategy selected in configuration.
pub fn create_transit(kind: TransitKind, pool: SocketPool, max_body: usize) -> Box<dyn Transit> {
    let core = Arc::new(TransitCore::new(pool, max_body));
    match kind {
        TransitKind::Completion => Box::new(completion::CompletionTransit::new(core)),
        TransitKind::Polling => Box::new(polling::PollingTransit::new(core)),
        TransitKind::Threaded => Box::new(threaded::ThreadedTransit::new(core)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::core::envelope::Envelope;

    fn core() -> TransitCore {
        TransitCore::new(SocketPool::new(&PoolConfig::default(), 1 << 20), 1 << 20)
    }

    fn udp_frame(body_len: usize) -> Frame {
        Frame {
            envelope: Envelope::new(7, 0, PacketFlags::UDP, body_len as u32),
            body: vec![0u8; body_len],
        }
    }

    fn loopback_route() -> UdpRoute {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer = socket.local_addr().unwrap();
        UdpRoute::new(Arc::new(socket), peer)
    }

    #[test]
    fn test_udp_before_enable_is_dropped() {
        let core = core();
        let mut frame = udp_frame(500);
        assert!(matches!(core.route(&mut frame), Route::Dropped));
    }

    #[test]
    fn test_small_udp_frame_stays_udp() {
        let core = core();
        core.enable_udp(loopback_route());
        let mut frame = udp_frame(500);
        assert!(matches!(core.route(&mut frame), Route::Udp(_)));
        assert!(frame.envelope.flags.contains(PacketFlags::UDP));
    }

    #[test]
    fn test_oversize_udp_frame_goes_tcp_without_flag() {
        let core = core();
        core.enable_udp(loopback_route());
        let mut frame = udp_frame(2000);
        assert!(matches!(core.route(&mut frame), Route::Tcp));
        assert!(!frame.envelope.flags.contains(PacketFlags::UDP));
    }

    #[test]
    fn test_datagram_limit_counts_header() {
        let core = core();
        core.enable_udp(loopback_route());
        let limit = MAX_UDP_DATAGRAM - crate::core::envelope::ENVELOPE_LEN;
        assert!(matches!(core.route(&mut udp_frame(limit)), Route::Udp(_)));
        assert!(matches!(core.route(&mut udp_frame(limit + 1)), Route::Tcp));
    }

    #[test]
    fn test_disable_udp_drops_again() {
        let core = core();
        core.enable_udp(loopback_route());
        core.disable_udp();
        assert!(matches!(core.route(&mut udp_frame(10)), Route::Dropped));
    }
}
