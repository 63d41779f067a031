//! # Connections
//!
//! A [`Connection`] is one end of a peer-to-peer line: it owns a transit,
//! runs the key exchange and login, and dispatches inbound packets to
//! registered handlers.
//!
//! ## Lifecycle
//! ```text
//! Idle -> Resolving -> Connecting -> Connected -> HandshakeInProgress
//!      -> Secured -> Authenticating -> LoggedIn -> ShuttingDown -> Killed
//! ```
//! The listening side enters at `Connected`. Any fault kills the connection;
//! a kill is final and runs its listeners exactly once.
//!
//! ## Delivery
//! - `NEEDS_ACK` packets are acknowledged before dispatch, with a plain ACK
//!   over the transport they arrived on
//! - Recently seen TCP packet ids are suppressed (re-acknowledged, not
//!   dispatched)
//! - A reply produced by a handler is sent only if the request asked for one

mod auth;
mod handlers;
pub mod stream;

pub use auth::{AllowAll, Authenticator, Credentials};
pub use stream::ReceivedStream;

use crate::config::{NetworkConfig, DEDUP_WINDOW, KILL_FLUSH_INTERVAL, KILL_FLUSH_MAX_CHECKS};
use crate::core::body::{encode_packet, decode_frame, Pipeline};
use crate::core::codec::EnvelopeCodec;
use crate::core::cursor::Frame;
use crate::core::envelope::PacketFlags;
use crate::core::packet::{Packet, PacketBody, ReplyCode};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::clock::ClockSync;
use crate::protocol::dedup::DedupWindow;
use crate::protocol::dispatcher::{HandlerId, HandlerMap};
use crate::protocol::handshake::{RsaIdentity, SessionKey};
use crate::protocol::messages::{Ack, ACK};
use crate::transport::udp::UdpListener;
use crate::transport::{create_transit, lock, SendStatus, Transit, TransitSink, UdpRoute};
use crate::utils::buffer_pool::{Lease, PoolClass, SocketPool};
use crate::utils::crypto::Crypto;
use crate::utils::metrics::{global_metrics, ConnectionStats, ConnectionStatsSnapshot};
use crate::utils::time::now_ms;
use bytes::BytesMut;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::thread;
use tokio::runtime::Handle;
use tokio_util::codec::Encoder;
use tracing::{debug, error, info, instrument, trace, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Which side of the line this connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Listener,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    Idle,
    Resolving,
    Connecting,
    Connected,
    HandshakeInProgress,
    Secured,
    Authenticating,
    LoggedIn,
    ShuttingDown,
    Killed,
}

impl ConnectionState {
    fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::ShuttingDown | ConnectionState::Killed)
    }
}

/// Traffic observed on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficEvent {
    BytesSent(usize),
    BytesReceived(usize),
    PacketSent { via_udp: bool },
    PacketReceived,
}

type KillListener = Arc<dyn Fn(&Connection, &str) + Send + Sync>;
type TrafficListener = Arc<dyn Fn(&Connection, TrafficEvent) + Send + Sync>;

/// Everything the listening side shares between accepted connections.
#[derive(Clone)]
pub struct AcceptContext {
    pub config: Arc<NetworkConfig>,
    pub identity: Arc<RsaIdentity>,
    pub pool: SocketPool,
    pub udp: Option<Arc<UdpListener>>,
    pub authenticator: Arc<dyn Authenticator>,
}

#[derive(Default)]
struct UdpState {
    endpoint: Option<Arc<UdpListener>>,
    /// The initiator binds its own endpoint; the listener shares one.
    owns_endpoint: bool,
    peer: Option<SocketAddr>,
    token: Option<u64>,
    enabled_at_ms: i64,
    last_poke_ms: i64,
    last_probe_ms: i64,
    probes_sent: u32,
}

#[derive(Default)]
struct Listeners {
    kill: Vec<KillListener>,
    traffic: Vec<TrafficListener>,
}

pub(crate) struct ConnectionInner {
    id: u64,
    role: Role,
    config: Arc<NetworkConfig>,
    state: Mutex<ConnectionState>,
    kill_started: AtomicBool,
    killed: AtomicBool,
    established: AtomicBool,
    connect_attempted: AtomicBool,
    transit: Box<dyn Transit>,
    crypto: RwLock<Option<Crypto>>,
    pending_key: Mutex<Option<SessionKey>>,
    identity: OnceLock<Arc<RsaIdentity>>,
    peer_public_key: Mutex<Option<Vec<u8>>>,
    credentials: Mutex<Option<Credentials>>,
    authenticator: Arc<dyn Authenticator>,
    account: RwLock<Option<String>>,
    handlers: HandlerMap,
    dedup: Mutex<DedupWindow>,
    /// Ids sent with `NEEDS_ACK` and not acknowledged yet
    pending_acks: Mutex<HashSet<u64>>,
    next_packet_id: AtomicU64,
    clock: Mutex<ClockSync>,
    udp: Mutex<UdpState>,
    stats: ConnectionStats,
    listeners: Mutex<Listeners>,
    streams: stream::StreamState,
    inbound: Mutex<VecDeque<Packet>>,
    remote_addr: Mutex<Option<SocketAddr>>,
    /// Listener admission slot, returned to the pool at teardown
    accept_slot: Mutex<Option<Lease>>,
    self_weak: Weak<ConnectionInner>,
}

/// Handle to a connection. Cheap to clone; all clones refer to the same line.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

/// Packet id of an encoded frame whose body prefix is still in the clear.
fn raw_packet_id(frame: &Frame) -> Option<u64> {
    if frame
        .envelope
        .flags
        .intersects(PacketFlags::ENCRYPTED | PacketFlags::COMPRESSED)
    {
        return None;
    }
    let prefix: [u8; 8] = frame.body.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(prefix))
}

fn pick_address(addrs: Vec<SocketAddr>, prefer_ipv6: bool, host: &str) -> Result<SocketAddr> {
    addrs
        .iter()
        .find(|addr| addr.is_ipv6() == prefer_ipv6)
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ProtocolError::AddressResolution(host.to_string()))
}

impl Connection {
    fn build(
        role: Role,
        config: Arc<NetworkConfig>,
        pool: SocketPool,
        identity: Option<Arc<RsaIdentity>>,
        authenticator: Arc<dyn Authenticator>,
        udp: Option<Arc<UdpListener>>,
    ) -> Result<Self> {
        let transit = create_transit(
            config.connection.transit,
            pool,
            config.connection.max_body_size,
        );
        let clock = ClockSync::new(&config.clock);
        let identity_slot = OnceLock::new();
        if let Some(identity) = identity {
            let _ = identity_slot.set(identity);
        }

        let inner = Arc::new_cyclic(|weak| ConnectionInner {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            role,
            config,
            state: Mutex::new(ConnectionState::Idle),
            kill_started: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            established: AtomicBool::new(false),
            connect_attempted: AtomicBool::new(false),
            transit,
            crypto: RwLock::new(None),
            pending_key: Mutex::new(None),
            identity: identity_slot,
            peer_public_key: Mutex::new(None),
            credentials: Mutex::new(None),
            authenticator,
            account: RwLock::new(None),
            handlers: HandlerMap::new(),
            dedup: Mutex::new(DedupWindow::new(DEDUP_WINDOW)),
            pending_acks: Mutex::new(HashSet::new()),
            next_packet_id: AtomicU64::new(1),
            clock: Mutex::new(clock),
            udp: Mutex::new(UdpState {
                endpoint: udp,
                ..UdpState::default()
            }),
            stats: ConnectionStats::new(),
            listeners: Mutex::new(Listeners::default()),
            streams: stream::StreamState::default(),
            inbound: Mutex::new(VecDeque::new()),
            remote_addr: Mutex::new(None),
            accept_slot: Mutex::new(None),
            self_weak: weak.clone(),
        });

        let conn = Connection { inner };
        handlers::register_core(&conn)?;
        Ok(conn)
    }

    /// Create the initiating end of a line. Nothing happens until
    /// [`begin_connect`](Self::begin_connect).
    pub fn initiator(config: NetworkConfig) -> Result<Self> {
        config.validate_strict()?;
        let pool = SocketPool::new(&config.pool, config.connection.max_body_size);
        Self::initiator_with_pool(config, pool)
    }

    pub fn initiator_with_pool(config: NetworkConfig, pool: SocketPool) -> Result<Self> {
        Self::build(
            Role::Initiator,
            Arc::new(config),
            pool,
            None,
            Arc::new(AllowAll),
            None,
        )
    }

    /// Create an initiator that offers `identity` in the key exchange instead
    /// of generating one while connecting.
    pub fn initiator_with_identity(config: NetworkConfig, identity: Arc<RsaIdentity>) -> Result<Self> {
        config.validate_strict()?;
        let pool = SocketPool::new(&config.pool, config.connection.max_body_size);
        Self::build(
            Role::Initiator,
            Arc::new(config),
            pool,
            Some(identity),
            Arc::new(AllowAll),
            None,
        )
    }

    /// Wrap a freshly accepted socket. Register handlers, then call
    /// [`start`](Self::start) to send the hello.
    pub fn accept(stream: TcpStream, ctx: &AcceptContext) -> Result<Self> {
        let conn = Self::build(
            Role::Listener,
            Arc::clone(&ctx.config),
            ctx.pool.clone(),
            Some(Arc::clone(&ctx.identity)),
            Arc::clone(&ctx.authenticator),
            ctx.udp.clone(),
        )?;
        *lock(&conn.inner.accept_slot)? = Some(ctx.pool.acquire(PoolClass::Accept));
        conn.attach_stream(stream)?;
        Ok(conn)
    }

    /// Begin receiving and open the handshake on an accepted connection.
    #[instrument(skip(self), fields(conn_id = self.id()))]
    pub fn start(&self) -> Result<()> {
        let identity = self
            .inner
            .identity
            .get()
            .filter(|_| self.inner.role == Role::Listener)
            .cloned()
            .ok_or_else(|| ProtocolError::Custom("only accepted connections can start a handshake".into()))?;

        self.inner.transit.listen_for_data()?;
        self.advance(ConnectionState::HandshakeInProgress);
        global_metrics().handshake_attempt();

        let hello = crate::protocol::handshake::listener_hello(&identity, self.id());
        self.send(Packet::new(crate::protocol::messages::HELLO, 0, hello));
        debug!("Hello sent");
        Ok(())
    }

    /// Resolve `host` and connect in the background. A second call, or a
    /// call on a connection that is already alive, does nothing.
    #[instrument(skip(self, credentials), fields(conn_id = self.id()))]
    pub fn begin_connect(&self, host: &str, port: u16, credentials: Credentials) -> Result<()> {
        if self.inner.role != Role::Initiator {
            return Err(ProtocolError::Custom("only initiating connections can connect".into()));
        }
        if self.is_alive() || self.inner.connect_attempted.swap(true, Ordering::AcqRel) {
            debug!("Connect already attempted");
            return Ok(());
        }

        *lock(&self.inner.credentials)? = Some(credentials);
        self.advance(ConnectionState::Resolving);

        let host = host.to_string();
        let prefer_ipv6 = self.inner.config.connection.use_ipv6;
        let conn = self.clone();

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let result = async {
                        let preparing = conn.clone();
                        tokio::task::spawn_blocking(move || preparing.rsa_identity().map(|_| ()))
                            .await
                            .map_err(|e| ProtocolError::Custom(format!("key generation task failed: {e}")))??;
                        let addrs: Vec<SocketAddr> =
                            tokio::net::lookup_host((host.as_str(), port)).await?.collect();
                        let addr = pick_address(addrs, prefer_ipv6, &host)?;
                        conn.advance(ConnectionState::Connecting);
                        let stream = tokio::net::TcpStream::connect(addr).await?;
                        Ok::<_, ProtocolError>(stream.into_std()?)
                    }
                    .await;

                    match result {
                        Ok(stream) => conn.on_connected(stream),
                        Err(e) => {
                            global_metrics().connection_error();
                            conn.kill(format!("connect failed: {e}"), false);
                        }
                    }
                });
            }
            Err(_) => {
                thread::Builder::new()
                    .name(format!("peerwire-connect-{}", self.id()))
                    .spawn(move || {
                        let result = (|| {
                            conn.rsa_identity()?;
                            let addrs: Vec<SocketAddr> = (host.as_str(), port).to_socket_addrs()?.collect();
                            let addr = pick_address(addrs, prefer_ipv6, &host)?;
                            conn.advance(ConnectionState::Connecting);
                            Ok::<_, ProtocolError>(TcpStream::connect(addr)?)
                        })();

                        match result {
                            Ok(stream) => conn.on_connected(stream),
                            Err(e) => {
                                global_metrics().connection_error();
                                conn.kill(format!("connect failed: {e}"), false);
                            }
                        }
                    })?;
            }
        }
        Ok(())
    }

    fn on_connected(&self, stream: TcpStream) {
        if self.inner.kill_started.load(Ordering::Acquire) {
            return;
        }
        let started = self
            .attach_stream(stream)
            .and_then(|_| self.inner.transit.listen_for_data());
        if let Err(e) = started {
            global_metrics().connection_error();
            self.kill(format!("connect failed: {e}"), false);
            return;
        }

        self.advance(ConnectionState::HandshakeInProgress);
        global_metrics().handshake_attempt();
        info!(conn_id = self.id(), remote = ?self.remote_addr(), "Connected, awaiting hello");
    }

    fn attach_stream(&self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(self.inner.config.connection.no_delay)?;
        let remote = stream.peer_addr()?;
        *lock(&self.inner.remote_addr)? = Some(remote);

        let sink: Weak<dyn TransitSink> = self.inner.self_weak.clone();
        self.inner.transit.attach(stream, sink)?;

        self.inner.established.store(true, Ordering::Release);
        global_metrics().connection_established();
        self.advance(ConnectionState::Connected);
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// RSA identity offered in the key exchange. An initiator created
    /// without one generates it here on first use.
    pub(crate) fn rsa_identity(&self) -> Result<Arc<RsaIdentity>> {
        if let Some(identity) = self.inner.identity.get() {
            return Ok(Arc::clone(identity));
        }
        let generated = Arc::new(RsaIdentity::generate(self.inner.config.connection.rsa_bits)?);
        debug!(conn_id = self.inner.id, "Generated initiator RSA identity");
        Ok(Arc::clone(self.inner.identity.get_or_init(|| generated)))
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner
            .state
            .lock()
            .map(|state| *state)
            .unwrap_or(ConnectionState::Killed)
    }

    /// Move forward in the lifecycle. Once shutting down, only `Killed` is
    /// accepted.
    pub(crate) fn advance(&self, next: ConnectionState) {
        if let Ok(mut state) = self.inner.state.lock() {
            if state.is_terminal() && next != ConnectionState::Killed {
                return;
            }
            trace!(conn_id = self.inner.id, from = ?*state, to = ?next, "State change");
            *state = next;
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr.lock().ok().and_then(|addr| *addr)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self.state(), ConnectionState::Resolving | ConnectionState::Connecting)
    }

    pub fn is_connected(&self) -> bool {
        let state = self.state();
        state >= ConnectionState::Connected && !state.is_terminal()
    }

    pub fn is_alive(&self) -> bool {
        self.is_connecting() || self.is_connected()
    }

    pub fn is_secured(&self) -> bool {
        let state = self.state();
        state >= ConnectionState::Secured && !state.is_terminal()
    }

    pub fn is_logged_in(&self) -> bool {
        self.state() == ConnectionState::LoggedIn
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state() == ConnectionState::ShuttingDown
    }

    pub fn is_killed(&self) -> bool {
        self.inner.killed.load(Ordering::Acquire)
    }

    /// Account name accepted at login.
    pub fn account_name(&self) -> Option<String> {
        self.inner.account.read().ok().and_then(|account| account.clone())
    }

    /// Public key the peer offered during the key exchange, if any.
    pub fn peer_public_key(&self) -> Option<Vec<u8>> {
        self.inner.peer_public_key.lock().ok().and_then(|key| key.clone())
    }

    /// PKCS#1 DER public key this side offers in the key exchange, once it
    /// has an identity.
    pub fn public_key(&self) -> Option<Vec<u8>> {
        self.inner
            .identity
            .get()
            .map(|identity| identity.public_key_der().to_vec())
    }

    /// Packets sent with `NEEDS_ACK` that have not been acknowledged yet.
    pub fn awaiting_acks(&self) -> u64 {
        self.inner
            .pending_acks
            .lock()
            .map(|pending| pending.len() as u64)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> ConnectionStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn udp_enabled(&self) -> bool {
        self.inner.transit.udp_enabled()
    }

    /// Current estimate of `peer clock - local clock` in milliseconds.
    pub fn clock_delta_ms(&self) -> f64 {
        lock(&self.inner.clock).map(|clock| clock.delta_ms()).unwrap_or(0.0)
    }

    /// Completed clock sampling cycles.
    pub fn clock_cycles(&self) -> u64 {
        lock(&self.inner.clock).map(|clock| clock.cycles_completed()).unwrap_or(0)
    }

    /// Local UTC milliseconds shifted onto the peer's clock.
    pub fn synchronized_time_ms(&self) -> i64 {
        let now = now_ms();
        lock(&self.inner.clock)
            .map(|clock| clock.synchronized_ms(now))
            .unwrap_or(now)
    }

    /// Build a packet with the requested body transforms.
    pub fn create_packet<B: PacketBody>(
        &self,
        packet_type: i32,
        subtype: i32,
        body: B,
        encrypt: bool,
        compress: bool,
    ) -> Packet {
        let mut flags = PacketFlags::empty();
        flags.set(PacketFlags::ENCRYPTED, encrypt);
        flags.set(PacketFlags::COMPRESSED, compress);
        Packet::new(packet_type, subtype, body).with_flags(flags)
    }

    fn stamp(&self, packet: &mut Packet) {
        packet.packet_id = self.inner.next_packet_id.fetch_add(1, Ordering::Relaxed);
        packet.sent_at_ms = now_ms();
    }

    fn encode(&self, packet: &Packet) -> Result<Frame> {
        let crypto = self
            .inner
            .crypto
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))?;
        encode_packet(
            packet,
            Pipeline::new(crypto.as_ref(), self.inner.config.connection.compression),
        )
    }

    /// Assign an id and timestamp, run the body pipeline and hand the frame
    /// to the transit. Retries that must keep their id go through
    /// [`resend`](Self::resend).
    pub fn send(&self, mut packet: Packet) -> SendStatus {
        if self.is_killed() {
            return SendStatus::Dropped;
        }
        if packet.packet_type == ACK {
            packet.flags.remove(PacketFlags::NEEDS_ACK);
        }
        self.stamp(&mut packet);
        self.transmit(&packet)
    }

    /// Send a packet again under the id and timestamp it already carries, so
    /// a peer suppressing duplicates recognises the repeat. A packet that was
    /// never stamped (id 0) is dropped.
    pub fn resend(&self, packet: &Packet) -> SendStatus {
        if self.is_killed() {
            return SendStatus::Dropped;
        }
        if packet.packet_id == 0 {
            debug!(conn_id = self.id(), packet_type = packet.packet_type, "Refusing to resend an unstamped packet");
            return SendStatus::Dropped;
        }
        self.transmit(packet)
    }

    fn transmit(&self, packet: &Packet) -> SendStatus {
        let frame = match self.encode(packet) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    conn_id = self.id(),
                    packet_type = packet.packet_type,
                    error = %e,
                    "Failed to encode packet"
                );
                return SendStatus::Dropped;
            }
        };

        let status = self.inner.transit.send(frame);
        if status != SendStatus::Dropped && packet.needs_ack() && packet.packet_type != ACK {
            self.track_ack(packet.packet_id);
        }
        trace!(
            conn_id = self.id(),
            packet_id = packet.packet_id,
            packet_type = packet.packet_type,
            ?status,
            "Packet sent"
        );
        status
    }

    /// Send an already encoded frame as-is. Its acknowledgement is only
    /// tracked when the packet id is readable, i.e. the body is neither
    /// encrypted nor compressed.
    pub fn send_raw(&self, frame: Frame) -> SendStatus {
        if self.is_killed() {
            return SendStatus::Dropped;
        }
        let tracked = raw_packet_id(&frame).filter(|_| frame.envelope.flags.contains(PacketFlags::NEEDS_ACK));
        let status = self.inner.transit.send(frame);
        if status != SendStatus::Dropped {
            if let Some(packet_id) = tracked {
                self.track_ack(packet_id);
            }
        }
        status
    }

    fn track_ack(&self, packet_id: u64) {
        if let Ok(mut pending) = self.inner.pending_acks.lock() {
            pending.insert(packet_id);
        }
    }

    /// Clear an acknowledged id. False when nothing was waiting on it.
    pub(crate) fn settle_ack(&self, packet_id: u64) -> bool {
        self.inner
            .pending_acks
            .lock()
            .map(|mut pending| pending.remove(&packet_id))
            .unwrap_or(false)
    }

    pub fn register_handler<F>(&self, packet_type: i32, subtype: i32, handler: F) -> Result<HandlerId>
    where
        F: Fn(&Connection, &Packet) -> Result<Option<Packet>> + Send + Sync + 'static,
    {
        self.inner.handlers.register(packet_type, subtype, handler)
    }

    pub fn unregister_handler(&self, packet_type: i32, subtype: i32, id: HandlerId) -> Result<bool> {
        self.inner.handlers.unregister(packet_type, subtype, id)
    }

    /// Handle standard replies answering requests of `(request_type,
    /// request_subtype)`.
    pub fn register_reply_handler<F>(&self, request_type: i32, request_subtype: i32, handler: F) -> Result<HandlerId>
    where
        F: Fn(&Connection, &Packet) -> Result<Option<Packet>> + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .register_reply(request_type, request_subtype, handler)
    }

    pub fn unregister_reply_handler(&self, request_type: i32, request_subtype: i32, id: HandlerId) -> Result<bool> {
        self.inner
            .handlers
            .unregister_reply(request_type, request_subtype, id)
    }

    /// Called once with the kill reason.
    pub fn on_kill<F>(&self, listener: F)
    where
        F: Fn(&Connection, &str) + Send + Sync + 'static,
    {
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.kill.push(Arc::new(listener));
        }
    }

    pub fn on_traffic<F>(&self, listener: F)
    where
        F: Fn(&Connection, TrafficEvent) + Send + Sync + 'static,
    {
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.traffic.push(Arc::new(listener));
        }
    }

    fn traffic(&self, event: TrafficEvent) {
        let listeners = match self.inner.listeners.lock() {
            Ok(listeners) if !listeners.traffic.is_empty() => listeners.traffic.clone(),
            _ => return,
        };
        for listener in listeners {
            listener(self, event);
        }
    }

    /// Shut the connection down. With `allow_flush`, teardown waits (bounded)
    /// for queued writes to drain. Only the first call has any effect.
    pub fn kill(&self, reason: impl Into<String>, allow_flush: bool) {
        let reason = reason.into();
        if self
            .inner
            .kill_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.advance(ConnectionState::ShuttingDown);
        info!(conn_id = self.id(), %reason, allow_flush, "Killing connection");

        if allow_flush && self.inner.transit.has_queued_packets() {
            self.defer_teardown(reason);
        } else {
            self.teardown(&reason);
        }
    }

    fn defer_teardown(&self, reason: String) {
        let weak = Arc::downgrade(&self.inner);
        let finish = move |weak: &Weak<ConnectionInner>| {
            if let Some(inner) = weak.upgrade() {
                Connection { inner }.teardown(&reason);
            }
        };
        let drained = |weak: &Weak<ConnectionInner>| match weak.upgrade() {
            Some(inner) => !inner.transit.has_queued_packets(),
            None => true,
        };

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for _ in 0..KILL_FLUSH_MAX_CHECKS {
                        tokio::time::sleep(KILL_FLUSH_INTERVAL).await;
                        if drained(&weak) {
                            break;
                        }
                    }
                    finish(&weak);
                });
            }
            Err(_) => {
                let spawned = thread::Builder::new()
                    .name(format!("peerwire-flush-{}", self.id()))
                    .spawn(move || {
                        for _ in 0..KILL_FLUSH_MAX_CHECKS {
                            thread::sleep(KILL_FLUSH_INTERVAL);
                            if drained(&weak) {
                                break;
                            }
                        }
                        finish(&weak);
                    });
                if let Err(e) = spawned {
                    warn!(conn_id = self.id(), error = %e, "Could not defer teardown, closing now");
                    self.teardown("flush thread unavailable");
                }
            }
        }
    }

    fn teardown(&self, reason: &str) {
        if self.inner.killed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.advance(ConnectionState::Killed);
        self.inner.release();

        let listeners = match self.inner.listeners.lock() {
            Ok(mut listeners) => {
                listeners.traffic.clear();
                std::mem::take(&mut listeners.kill)
            }
            Err(_) => Vec::new(),
        };
        for listener in listeners {
            listener(self, reason);
        }
        debug!(conn_id = self.id(), "Connection torn down");
    }

    /// Run one inbound packet through acknowledgement, duplicate suppression,
    /// handlers and reply handling.
    pub(crate) fn dispatch(&self, packet: Packet) {
        if self.is_killed() || !self.before_dispatch(&packet) {
            return;
        }

        let handlers = match self.inner.handlers.resolve(&packet) {
            Ok(handlers) => handlers,
            Err(e) => {
                error!(conn_id = self.id(), error = %e, "Handler lookup failed");
                return;
            }
        };
        if handlers.is_empty() {
            debug!(
                conn_id = self.id(),
                packet_type = packet.packet_type,
                subtype = packet.subtype,
                "No handler registered"
            );
        }

        let mut reply: Option<Packet> = None;
        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(self, &packet))) {
                Ok(Ok(Some(offered))) => {
                    if reply.is_none() {
                        reply = Some(offered);
                    } else {
                        debug!(conn_id = self.id(), "Discarding additional reply");
                    }
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    global_metrics().handler_error();
                    warn!(
                        conn_id = self.id(),
                        packet_type = packet.packet_type,
                        error = %e,
                        "Handler failed"
                    );
                }
                Err(_) => {
                    global_metrics().handler_error();
                    error!(conn_id = self.id(), packet_type = packet.packet_type, "Handler panicked");
                }
            }
        }

        self.after_dispatch(&packet, reply);
    }

    fn before_dispatch(&self, packet: &Packet) -> bool {
        let via_udp = packet.is_udp();

        if self.inner.config.connection.suppress_duplicates && !via_udp && packet.packet_type != ACK {
            let duplicate = match self.inner.dedup.lock() {
                Ok(mut window) => window.check_and_insert(packet.packet_id),
                Err(_) => false,
            };
            if duplicate {
                global_metrics().duplicate_suppressed();
                debug!(conn_id = self.id(), packet_id = packet.packet_id, "Duplicate packet suppressed");
                if packet.needs_ack() {
                    self.send_ack(packet);
                }
                return false;
            }
        }

        if packet.needs_ack() {
            if via_udp && !self.inner.transit.udp_enabled() {
                debug!(conn_id = self.id(), packet_id = packet.packet_id, "Withholding UDP ACK until UDP is enabled");
            } else {
                self.send_ack(packet);
            }
        }
        true
    }

    fn send_ack(&self, packet: &Packet) {
        let mut ack = Packet::new(
            ACK,
            0,
            Ack {
                acked_id: packet.packet_id,
                acked_type: packet.packet_type,
                acked_subtype: packet.subtype,
            },
        );
        if packet.is_udp() {
            ack = ack.with_flags(PacketFlags::UDP);
        }
        self.send(ack);
    }

    fn after_dispatch(&self, packet: &Packet, reply: Option<Packet>) {
        if let Some(received) = packet.as_reply() {
            if packet.is_critical() && !received.result.is_ok() {
                self.kill(format!("critical request failed: {}", received.message), true);
                return;
            }
        }

        let Some(reply) = reply else {
            return;
        };
        let outcome = reply
            .as_reply()
            .map(|body| (body.result, body.message.clone()));

        if matches!(outcome, Some((ReplyCode::AuthorizationExpired, _))) && !packet.is_udp() {
            // Let the peer retry the same packet id once re-authorized
            if let Ok(mut window) = self.inner.dedup.lock() {
                window.remove(packet.packet_id);
            }
        }

        if !packet.needs_reply() {
            debug!(conn_id = self.id(), packet_id = packet.packet_id, "Reply discarded, request did not ask for one");
            return;
        }

        let critical = reply.is_critical();
        self.send(reply);
        if let Some((result, message)) = outcome {
            if critical && !result.is_ok() {
                self.kill(format!("critical reply failed: {message}"), true);
            }
        }
    }

    /// Dispatch packets held back while `process_immediately` is off.
    pub fn pump_inbound(&self) -> usize {
        let mut count = 0;
        loop {
            let next = match self.inner.inbound.lock() {
                Ok(mut inbound) => inbound.pop_front(),
                Err(_) => None,
            };
            let Some(packet) = next else {
                break;
            };
            self.dispatch(packet);
            count += 1;
        }
        count
    }

    /// Drive a caller-pumped connection: receive, dispatch, run timers and
    /// flush writes. Harmless on other transits. Returns bytes received.
    pub fn pump(&self) -> Result<usize> {
        let received = self.inner.transit.process_receive()?;

        let endpoint = lock(&self.inner.udp)?
            .endpoint
            .as_ref()
            .filter(|endpoint| endpoint.kind() == crate::config::TransitKind::Polling)
            .cloned();
        if let Some(endpoint) = endpoint {
            endpoint.poll()?;
        }

        self.pump_inbound();
        self.tick();
        self.inner.transit.process_send()?;
        Ok(received)
    }

    /// Periodic work: clock sampling and UDP keep-alive.
    pub(crate) fn tick(&self) {
        if !self.is_connected() {
            return;
        }
        let now = now_ms();

        let due = lock(&self.inner.clock)
            .map(|mut clock| clock.poll_due(now))
            .unwrap_or(false);
        if due {
            handlers::request_clock_sample(self, now);
        }

        if self.inner.role == Role::Initiator {
            self.udp_tick(now);
        }
    }

    fn udp_tick(&self, now: i64) {
        let cfg = &self.inner.config.connection;
        let Ok(mut udp) = lock(&self.inner.udp) else {
            return;
        };

        if !self.inner.transit.udp_enabled() {
            // Probe again until the listener acknowledges over UDP
            let retry = udp.peer.is_some()
                && udp.probes_sent < handlers::MAX_UDP_PROBES
                && now - udp.last_probe_ms >= handlers::UDP_PROBE_RETRY_MS;
            drop(udp);
            if retry {
                if let Err(e) = self.send_udp_probe() {
                    debug!(conn_id = self.id(), error = %e, "UDP probe failed");
                }
            }
            return;
        }

        if !cfg.udp_keepalive {
            return;
        }
        let interval = cfg.udp_keepalive_interval.as_millis() as i64;
        let last_ack = self
            .inner
            .transit
            .core()
            .last_udp_ack_ms()
            .max(udp.enabled_at_ms);

        if now - last_ack > 3 * interval {
            drop(udp);
            self.inner.transit.disable_udp();
            warn!(conn_id = self.id(), "No UDP acknowledgement for three keep-alive intervals, falling back to TCP");
            return;
        }

        if now - udp.last_poke_ms >= interval {
            udp.last_poke_ms = now;
            drop(udp);
            self.send(
                Packet::new(crate::protocol::messages::NAT_POKE, 0, ())
                    .with_flags(PacketFlags::UDP | PacketFlags::NEEDS_ACK),
            );
        }
    }

    /// Send the unencrypted UDP probe straight through the initiator's own
    /// endpoint; the transit only routes UDP once it is enabled.
    fn send_udp_probe(&self) -> Result<()> {
        let (endpoint, peer, token) = {
            let mut udp = lock(&self.inner.udp)?;
            let (Some(endpoint), Some(peer), Some(token)) = (udp.endpoint.clone(), udp.peer, udp.token) else {
                return Err(ProtocolError::Custom("UDP endpoint not bound".into()));
            };
            udp.probes_sent += 1;
            udp.last_probe_ms = now_ms();
            (endpoint, peer, token)
        };

        let mut probe = Packet::new(
            crate::protocol::messages::UDP_PROBE,
            0,
            crate::protocol::messages::UdpProbe { token },
        )
        .with_flags(PacketFlags::UDP | PacketFlags::NEEDS_ACK);
        self.stamp(&mut probe);

        let frame = encode_packet(&probe, Pipeline::plain())?;
        let mut datagram = BytesMut::new();
        EnvelopeCodec::new(self.inner.config.connection.max_body_size).encode(&frame, &mut datagram)?;

        let sent = endpoint.send_to(&datagram, peer)?;
        self.track_ack(probe.packet_id);
        self.inner.on_bytes_sent(sent);
        self.inner.on_packet_sent(true);
        debug!(conn_id = self.id(), %peer, "UDP probe sent");
        Ok(())
    }
}

impl ConnectionInner {
    fn handle(&self) -> Option<Connection> {
        self.self_weak.upgrade().map(|inner| Connection { inner })
    }

    /// Close sockets and drop per-line state. Safe to call more than once.
    fn release(&self) {
        self.transit.detach();

        if let Ok(mut clock) = self.clock.lock() {
            clock.stop();
        }
        if let Ok(mut udp) = self.udp.lock() {
            if let Some(endpoint) = udp.endpoint.take() {
                if udp.owns_endpoint {
                    endpoint.stop();
                } else {
                    if let Some(peer) = udp.peer {
                        endpoint.unroute(&peer);
                    }
                    if let Some(token) = udp.token {
                        endpoint.forget_probe(token);
                    }
                }
            }
        }
        if let Ok(mut inbound) = self.inbound.lock() {
            inbound.clear();
        }
        self.streams.clear();
        if let Ok(mut slot) = self.accept_slot.lock() {
            slot.take();
        }

        if self.established.swap(false, Ordering::AcqRel) {
            global_metrics().connection_closed();
        }
    }
}

impl TransitSink for ConnectionInner {
    fn conn_id(&self) -> u64 {
        self.id
    }

    fn on_frame(&self, frame: Frame) {
        let Some(conn) = self.handle() else {
            return;
        };
        if conn.is_killed() {
            return;
        }
        self.stats.record_packet_received();
        conn.traffic(TrafficEvent::PacketReceived);

        let decoded = match self.crypto.read() {
            Ok(crypto) => decode_frame(
                frame,
                Pipeline::new(crypto.as_ref(), self.config.connection.compression),
            ),
            Err(_) => Err(ProtocolError::Custom(constants::ERR_LOCK_POISONED.into())),
        };

        match decoded {
            Ok(packet) => {
                if self.config.connection.process_immediately {
                    conn.dispatch(packet);
                } else if let Ok(mut inbound) = self.inbound.lock() {
                    inbound.push_back(packet);
                }
            }
            Err(e) => {
                global_metrics().protocol_error();
                conn.kill(format!("protocol fault: {e}"), false);
            }
        }
    }

    fn on_bytes_sent(&self, n: usize) {
        self.stats.record_bytes_sent(n, now_ms());
        if let Some(conn) = self.handle() {
            conn.traffic(TrafficEvent::BytesSent(n));
        }
    }

    fn on_bytes_received(&self, n: usize) {
        self.stats.record_bytes_received(n, now_ms());
        if let Some(conn) = self.handle() {
            conn.traffic(TrafficEvent::BytesReceived(n));
        }
    }

    fn on_packet_sent(&self, via_udp: bool) {
        self.stats.record_packet_sent(via_udp);
        if let Some(conn) = self.handle() {
            conn.traffic(TrafficEvent::PacketSent { via_udp });
        }
    }

    fn on_transport_fault(&self, reason: String) {
        if let Some(conn) = self.handle() {
            if !conn.inner.kill_started.load(Ordering::Acquire) {
                global_metrics().connection_error();
            }
            conn.kill(reason, false);
        }
    }

    fn on_idle(&self) {
        if let Some(conn) = self.handle() {
            conn.tick();
        }
    }

    fn on_udp_bound(&self, route: UdpRoute) {
        let now = now_ms();
        if let Ok(mut udp) = self.udp.lock() {
            udp.peer = Some(route.peer());
            udp.enabled_at_ms = now;
        }
        info!(conn_id = self.id, peer = %route.peer(), "UDP endpoint mapped");
        self.transit.enable_udp(route);
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if !self.killed.load(Ordering::Acquire) {
            self.release();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .field("remote_addr", &self.remote_addr())
            .finish()
    }
}
