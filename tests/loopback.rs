//! End-to-end tests over loopback sockets
//!
//! A real listener and real initiators run the full handshake, login and
//! packet exchange on 127.0.0.1 for every transit strategy.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use peerwire::config::{NetworkConfig, TransitKind, MAX_BODY_SIZE};
use peerwire::connection::{Connection, ConnectionState, Credentials};
use peerwire::core::body::{decode_frame, encode_packet, Pipeline};
use peerwire::core::codec::EnvelopeCodec;
use peerwire::core::cursor::{Frame, ReassemblyCursor};
use peerwire::core::envelope::PacketFlags;
use peerwire::core::packet::{Packet, ReplyCode};
use peerwire::error::constants;
use peerwire::protocol::handshake::{listener_hello, RsaIdentity};
use peerwire::protocol::messages::{
    KeyExchange, LineSecured, LoginRequest, LoginResult, HELLO, KEY_EXCHANGE, LINE_SECURED, LOGIN_REQUEST,
};
use peerwire::protocol::registry;
use peerwire::transport::listener::Listener;
use peerwire::transport::SendStatus;
use peerwire::utils::buffer_pool::PoolClass;
use peerwire::utils::compression::CompressionKind;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Encoder;

const CHAT: i32 = 100;
const RAW: i32 = 101;
const QUERY: i32 = 102;
const CRITICAL_OP: i32 = 103;
const POSITION: i32 = 104;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct Chat {
    text: String,
}

fn chat(text: impl Into<String>) -> Chat {
    Chat { text: text.into() }
}

fn register_bodies() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        for packet_type in [CHAT, RAW, QUERY, CRITICAL_OP, POSITION] {
            registry::register::<Chat>(packet_type, 0).unwrap();
        }
    });
}

fn identity() -> Arc<RsaIdentity> {
    static IDENTITY: OnceLock<Arc<RsaIdentity>> = OnceLock::new();
    Arc::clone(IDENTITY.get_or_init(|| Arc::new(RsaIdentity::generate(1024).unwrap())))
}

fn client_identity() -> Arc<RsaIdentity> {
    static IDENTITY: OnceLock<Arc<RsaIdentity>> = OnceLock::new();
    Arc::clone(IDENTITY.get_or_init(|| Arc::new(RsaIdentity::generate(1024).unwrap())))
}

fn listener_config() -> NetworkConfig {
    NetworkConfig::default_with_overrides(|c| {
        c.listener.address = "127.0.0.1:0".into();
        c.listener.shutdown_timeout = Duration::from_secs(2);
        c.connection.rsa_bits = 1024;
        c.clock.sample_count = 0;
    })
}

fn client_config() -> NetworkConfig {
    NetworkConfig::default_with_overrides(|c| {
        c.clock.sample_count = 0;
    })
}

fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

struct Harness {
    listener: Arc<Listener>,
    shutdown: mpsc::Sender<()>,
    serving: JoinHandle<peerwire::Result<()>>,
    accepted: Arc<Mutex<Vec<Connection>>>,
}

impl Harness {
    async fn start(config: NetworkConfig) -> Self {
        Self::start_with(config, |_| {}).await
    }

    async fn start_with<F>(config: NetworkConfig, on_accept: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        let listener = Listener::bind_with_identity(config, identity()).await.unwrap();
        Self::serve(listener, on_accept)
    }

    fn serve<F>(listener: Listener, on_accept: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        register_bodies();
        let listener = Arc::new(listener);
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let (shutdown, shutdown_rx) = mpsc::channel(1);

        let serving = {
            let listener = Arc::clone(&listener);
            let accepted = Arc::clone(&accepted);
            tokio::spawn(async move {
                listener
                    .serve_with_shutdown(
                        move |conn: &Connection| {
                            on_accept(conn);
                            accepted.lock().unwrap().push(conn.clone());
                        },
                        shutdown_rx,
                    )
                    .await
            })
        };

        Self {
            listener,
            shutdown,
            serving,
            accepted,
        }
    }

    fn port(&self) -> u16 {
        self.listener.local_addr().port()
    }

    async fn server(&self) -> Connection {
        wait_for("an accepted connection", || !self.accepted.lock().unwrap().is_empty()).await;
        self.accepted.lock().unwrap()[0].clone()
    }

    async fn stop(self) {
        self.shutdown.send(()).await.unwrap();
        self.serving.await.unwrap().unwrap();
    }
}

fn connect(config: NetworkConfig, port: u16, credentials: Credentials) -> Connection {
    connect_watched(config, port, credentials).0
}

/// Connect with a kill listener registered before anything can fail.
fn connect_watched(
    config: NetworkConfig,
    port: u16,
    credentials: Credentials,
) -> (Connection, Arc<Mutex<Option<String>>>) {
    register_bodies();
    let client = Connection::initiator_with_identity(config, client_identity()).unwrap();
    let reason = kill_reason(&client);
    client.begin_connect("127.0.0.1", port, credentials).unwrap();
    (client, reason)
}

fn kill_reason(conn: &Connection) -> Arc<Mutex<Option<String>>> {
    let reason = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&reason);
    conn.on_kill(move |_, why| {
        *slot.lock().unwrap() = Some(why.to_string());
    });
    reason
}

async fn logged_in_pair(harness: &Harness, config: NetworkConfig) -> (Connection, Connection) {
    let client = connect(config, harness.port(), Credentials::new("player", "secret"));
    let server = harness.server().await;
    wait_for("login", || client.is_logged_in() && server.is_logged_in()).await;
    (client, server)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handshake_reaches_logged_in() {
    let harness = Harness::start(listener_config()).await;
    let (client, server) = logged_in_pair(&harness, client_config()).await;

    assert_eq!(client.state(), ConnectionState::LoggedIn);
    assert!(client.is_secured());
    assert_eq!(server.account_name().as_deref(), Some("player"));
    assert_eq!(client.account_name().as_deref(), Some("player"));
    assert_eq!(
        client.peer_public_key().as_deref(),
        Some(identity().public_key_der())
    );
    let offered = server.peer_public_key().unwrap();
    assert!(!offered.is_empty());
    assert_eq!(offered, client_identity().public_key_der());
    assert_eq!(client.public_key(), Some(offered));
    assert_eq!(harness.listener.active_connections(), 1);

    harness.stop().await;
    wait_for("client to notice shutdown", || client.is_killed()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn encrypted_chat_round_trip() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&received);
    let harness = Harness::start_with(listener_config(), move |conn| {
        let seen = Arc::clone(&seen);
        conn.register_handler(CHAT, 0, move |_: &Connection, packet: &Packet| {
            let body = packet.body::<Chat>().unwrap();
            seen.lock().unwrap().push((body.text.clone(), packet.is_encrypted()));
            Ok(None)
        })
        .unwrap();
    })
    .await;
    let (client, _server) = logged_in_pair(&harness, client_config()).await;

    let status = client.send(client.create_packet(CHAT, 0, chat("hello"), true, true));
    assert_ne!(status, SendStatus::Dropped);
    client.send(client.create_packet(CHAT, 0, chat("plain"), false, false));

    wait_for("chat delivery", || received.lock().unwrap().len() == 2).await;
    assert_eq!(
        *received.lock().unwrap(),
        vec![("hello".to_string(), true), ("plain".to_string(), false)]
    );
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn held_packets_are_acknowledged_when_pumped() {
    let mut config = listener_config();
    config.connection.process_immediately = false;
    let harness = Harness::start(config).await;

    let client = connect(client_config(), harness.port(), Credentials::new("player", "secret"));
    let server = harness.server().await;
    wait_for("login with a pumped listener", || {
        server.pump_inbound();
        client.is_logged_in()
    })
    .await;

    let before = server.stats().packets_received;
    for i in 0..5 {
        let packet = client
            .create_packet(CHAT, 0, chat(format!("m{i}")), true, false)
            .with_flags(PacketFlags::NEEDS_ACK);
        client.send(packet);
    }
    wait_for("frames to reach the listener", || server.stats().packets_received >= before + 5).await;
    assert_eq!(client.awaiting_acks(), 5);

    assert_eq!(server.pump_inbound(), 5);
    wait_for("acknowledgements", || client.awaiting_acks() == 0).await;
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_ids_are_suppressed_within_window() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mut config = listener_config();
    config.connection.suppress_duplicates = true;
    let harness = Harness::start_with(config, move |conn| {
        let counter = Arc::clone(&counter);
        conn.register_handler(RAW, 0, move |_: &Connection, _: &Packet| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .unwrap();
    })
    .await;
    let (client, _server) = logged_in_pair(&harness, client_config()).await;

    let packets: Vec<Packet> = (1..=26u64)
        .map(|id| {
            let mut packet = client
                .create_packet(RAW, 0, chat("raw"), true, false)
                .with_flags(PacketFlags::NEEDS_ACK);
            packet.packet_id = 1_000_000 + id;
            packet
        })
        .collect();

    for packet in &packets {
        assert_ne!(client.resend(packet), SendStatus::Dropped);
    }
    // the first id has aged out of the 25-entry window, the last has not
    client.resend(&packets[0]);
    client.resend(&packets[25]);

    wait_for("every copy to be acknowledged", || client.awaiting_acks() == 0).await;
    wait_for("handlers to settle", || calls.load(Ordering::SeqCst) >= 27).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 27);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_ids_dispatch_again_by_default() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let harness = Harness::start_with(listener_config(), move |conn| {
        let counter = Arc::clone(&counter);
        conn.register_handler(RAW, 0, move |_: &Connection, _: &Packet| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .unwrap();
    })
    .await;
    let (client, server) = logged_in_pair(&harness, client_config()).await;
    assert!(!server.config().connection.suppress_duplicates);

    let mut packet = client
        .create_packet(RAW, 0, chat("again"), true, false)
        .with_flags(PacketFlags::NEEDS_ACK);
    packet.packet_id = 5_000;
    client.resend(&packet);
    client.resend(&packet);

    wait_for("both copies to dispatch", || calls.load(Ordering::SeqCst) == 2).await;
    wait_for("acknowledgements", || client.awaiting_acks() == 0).await;
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn accepted_connection_holds_an_accept_slot() {
    let harness = Harness::start(listener_config()).await;
    let pool = harness.listener.pool().clone();
    let capacity = pool.capacity(PoolClass::Accept);
    assert_eq!(pool.available(PoolClass::Accept), capacity);

    let (client, server) = logged_in_pair(&harness, client_config()).await;
    assert_eq!(pool.available(PoolClass::Accept), capacity - 1);

    client.kill("leaving", false);
    wait_for("the listener side to close", || server.is_killed()).await;
    wait_for("the accept slot to return", || pool.available(PoolClass::Accept) == capacity).await;
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reply_only_when_requested() {
    let harness = Harness::start_with(listener_config(), |conn| {
        conn.register_handler(QUERY, 0, |_: &Connection, packet: &Packet| {
            let question = &packet.body::<Chat>().unwrap().text;
            Ok(Some(packet.reply(ReplyCode::Ok, format!("re: {question}"))))
        })
        .unwrap();
    })
    .await;
    let (client, _server) = logged_in_pair(&harness, client_config()).await;

    let replies = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&replies);
    client
        .register_reply_handler(QUERY, 0, move |_: &Connection, packet: &Packet| {
            let reply = packet.as_reply().unwrap();
            sink.lock().unwrap().push((reply.result, reply.message.clone(), packet.is_encrypted()));
            Ok(None)
        })
        .unwrap();

    client.send(client.create_packet(QUERY, 0, chat("silent"), true, false));
    client.send(
        client
            .create_packet(QUERY, 0, chat("loud"), true, false)
            .with_flags(PacketFlags::NEEDS_REPLY),
    );

    wait_for("the reply", || !replies.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        *replies.lock().unwrap(),
        vec![(ReplyCode::Ok, "re: loud".to_string(), true)]
    );
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn critical_failure_kills_both_ends() {
    let harness = Harness::start_with(listener_config(), |conn| {
        conn.register_handler(CRITICAL_OP, 0, |_: &Connection, packet: &Packet| {
            Ok(Some(
                packet
                    .reply(ReplyCode::Failure, "denied")
                    .with_flags(PacketFlags::CRITICAL),
            ))
        })
        .unwrap();
    })
    .await;
    let (client, server) = logged_in_pair(&harness, client_config()).await;
    let reason = kill_reason(&client);

    client.send(
        client
            .create_packet(CRITICAL_OP, 0, chat("do it"), true, false)
            .with_flags(PacketFlags::NEEDS_REPLY),
    );

    wait_for("both ends to die", || client.is_killed() && server.is_killed()).await;
    let reason = reason.lock().unwrap().clone().unwrap();
    assert!(reason.contains("critical request failed: denied"), "{reason}");
    wait_for("listener bookkeeping", || harness.listener.active_connections() == 0).await;
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejected_login_kills_the_line() {
    let listener = Listener::bind_with_identity(listener_config(), identity())
        .await
        .unwrap()
        .with_authenticator(|_: &Connection, request: &LoginRequest| LoginResult {
            result: if request.password == "secret" {
                ReplyCode::Ok
            } else {
                ReplyCode::Unauthorized
            },
            message: "bad password".into(),
            roles: Vec::new(),
        });
    let harness = Harness::serve(listener, |_| {});

    let (client, reason) = connect_watched(client_config(), harness.port(), Credentials::new("player", "guess"));

    wait_for("the rejection", || client.is_killed()).await;
    assert!(!client.is_logged_in());
    let reason = reason.lock().unwrap().clone().unwrap();
    assert!(reason.contains("login rejected: bad password"), "{reason}");
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn udp_is_enabled_after_probe() {
    let mut config = listener_config();
    config.listener.udp_port = free_udp_port();

    let positions = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&positions);
    let harness = Harness::start_with(config, move |conn| {
        let seen = Arc::clone(&seen);
        conn.register_handler(POSITION, 0, move |_: &Connection, packet: &Packet| {
            let text_len = packet.body::<Chat>().unwrap().text.len();
            seen.lock().unwrap().push((text_len, packet.is_udp()));
            Ok(None)
        })
        .unwrap();
    })
    .await;

    let mut client_cfg = client_config();
    client_cfg.connection.udp_enabled = true;
    let (client, server) = logged_in_pair(&harness, client_cfg).await;
    wait_for("UDP on both ends", || client.udp_enabled() && server.udp_enabled()).await;

    client.send(
        client
            .create_packet(POSITION, 0, chat("x".repeat(10)), true, false)
            .with_flags(PacketFlags::UDP),
    );
    // too big for one datagram, travels over TCP instead
    client.send(
        client
            .create_packet(POSITION, 0, chat("y".repeat(2000)), false, false)
            .with_flags(PacketFlags::UDP),
    );

    wait_for("both positions", || positions.lock().unwrap().len() == 2).await;
    let mut got = positions.lock().unwrap().clone();
    got.sort();
    assert_eq!(got, vec![(10, true), (2000, false)]);
    assert!(client.stats().udp_packets_sent >= 2);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn clock_sync_converges_on_loopback() {
    let harness = Harness::start(listener_config()).await;

    let config = NetworkConfig::default_with_overrides(|c| {
        c.clock.sample_count = 3;
        c.clock.sample_window = Duration::from_millis(300);
        c.clock.sync_interval = Duration::from_millis(500);
    });
    let (client, _server) = logged_in_pair(&harness, config).await;

    wait_for("a full sampling cycle", || client.clock_cycles() >= 1).await;
    // same host clock on both ends
    assert!(client.clock_delta_ms().abs() < 250.0, "delta {}", client.clock_delta_ms());
    let skew = (client.synchronized_time_ms() - peerwire::utils::time::now_ms()).abs();
    assert!(skew < 250, "skew {skew}");
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn file_stream_arrives_intact() {
    let contents: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
    let mut source = tempfile::NamedTempFile::new().unwrap();
    source.write_all(&contents).unwrap();
    source.flush().unwrap();

    let received = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&received);
    let harness = Harness::start_with(listener_config(), move |conn| {
        let slot = Arc::clone(&slot);
        conn.on_stream(move |_, stream| {
            let bytes = std::fs::read(stream.file.path()).unwrap();
            *slot.lock().unwrap() = Some((stream.description.clone(), stream.length, bytes));
        });
    })
    .await;
    let (client, _server) = logged_in_pair(&harness, client_config()).await;

    client.send_file(source.path(), "replay.bin").unwrap();
    wait_for("the stream", || received.lock().unwrap().is_some()).await;

    let (description, length, bytes) = received.lock().unwrap().take().unwrap();
    assert_eq!(description, "replay.bin");
    assert_eq!(length, contents.len() as u64);
    assert_eq!(bytes, contents);
    wait_for("chunk acknowledgements", || client.awaiting_acks() == 0).await;
    harness.stop().await;
}

async fn exchange_over(kind: TransitKind) {
    let harness = Harness::start_with(listener_config(), |conn| {
        conn.register_handler(QUERY, 0, |_: &Connection, packet: &Packet| {
            Ok(Some(packet.reply(ReplyCode::Ok, "pong")))
        })
        .unwrap();
    })
    .await;

    let mut config = client_config();
    config.connection.transit = kind;
    let client = connect(config, harness.port(), Credentials::new("player", "secret"));

    let pongs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pongs);
    client
        .register_reply_handler(QUERY, 0, move |_: &Connection, _: &Packet| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .unwrap();

    // harmless for transits that drive themselves
    let pump = |conn: &Connection| {
        conn.pump().unwrap();
    };

    wait_for("login", || {
        pump(&client);
        client.is_logged_in()
    })
    .await;

    for _ in 0..3 {
        client.send(
            client
                .create_packet(QUERY, 0, chat("ping"), true, true)
                .with_flags(PacketFlags::NEEDS_REPLY | PacketFlags::NEEDS_ACK),
        );
    }
    wait_for("three pongs", || {
        pump(&client);
        pongs.load(Ordering::SeqCst) == 3 && client.awaiting_acks() == 0
    })
    .await;

    client.kill("done", true);
    wait_for("client teardown", || {
        pump(&client);
        client.is_killed()
    })
    .await;
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn polling_transit_exchange() {
    exchange_over(TransitKind::Polling).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn threaded_transit_exchange() {
    exchange_over(TransitKind::Threaded).await;
}

/// Minimal hand-driven listener used to feed the initiator crafted replies.
struct RawPeer {
    stream: std::net::TcpStream,
    cursor: ReassemblyCursor,
    frames: VecDeque<Frame>,
}

impl RawPeer {
    fn new(stream: std::net::TcpStream) -> Self {
        Self {
            stream,
            cursor: ReassemblyCursor::new(MAX_BODY_SIZE),
            frames: VecDeque::new(),
        }
    }

    fn send(&mut self, packet: Packet) {
        let frame = encode_packet(&packet, Pipeline::plain()).unwrap();
        let mut buf = BytesMut::new();
        EnvelopeCodec::new(MAX_BODY_SIZE).encode(frame, &mut buf).unwrap();
        self.stream.write_all(&buf).unwrap();
    }

    fn recv(&mut self) -> Option<Frame> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.frames.pop_front() {
                return Some(frame);
            }
            let n = self.stream.read(&mut buf).ok()?;
            if n == 0 {
                return None;
            }
            let mut out = Vec::new();
            self.cursor.feed(&buf[..n], &mut out).unwrap();
            self.frames.extend(out);
        }
    }
}

/// Run the listener half of the handshake by hand. With `tamper`, the line
/// confirmation carries the wrong key digest. Returns the login request the
/// initiator sent, if it got that far.
fn raw_listener(tamper: bool) -> (u16, std::thread::JoinHandle<Option<LoginRequest>>) {
    register_bodies();
    let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = socket.local_addr().unwrap().port();

    let handle = std::thread::spawn(move || {
        let (stream, _) = socket.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let mut peer = RawPeer::new(stream);
        let identity = identity();

        peer.send(Packet::new(HELLO, 0, listener_hello(&identity, 7)));

        let frame = peer.recv()?;
        assert_eq!(frame.envelope.packet_type, KEY_EXCHANGE);
        let packet = decode_frame(frame, Pipeline::plain()).unwrap();
        let exchange = packet.body::<KeyExchange>().unwrap();
        let key = identity.unwrap_key(&exchange.encrypted_key).unwrap();

        let mut digest = key.digest();
        if tamper {
            digest[0] ^= 0xFF;
        }
        peer.send(Packet::new(
            LINE_SECURED,
            0,
            LineSecured {
                result: ReplyCode::Ok,
                key_digest: digest,
            },
        ));

        let frame = peer.recv()?;
        assert_eq!(frame.envelope.packet_type, LOGIN_REQUEST);
        assert!(frame.envelope.flags.contains(PacketFlags::ENCRYPTED));
        let cipher = key.cipher();
        let packet = decode_frame(frame, Pipeline::new(Some(&cipher), CompressionKind::Lz4)).unwrap();
        packet.body::<LoginRequest>().cloned()
    });
    (port, handle)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn login_travels_encrypted_after_confirmation() {
    let (port, peer) = raw_listener(false);
    let client = connect(client_config(), port, Credentials::new("ranger", "hunter2"));

    let request = tokio::task::spawn_blocking(move || peer.join().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.account_name, "ranger");
    assert_eq!(request.password, "hunter2");
    client.kill("test over", false);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mismatched_key_digest_kills_initiator() {
    let (port, peer) = raw_listener(true);
    let (client, reason) = connect_watched(client_config(), port, Credentials::new("ranger", "hunter2"));

    wait_for("the initiator to give up", || client.is_killed()).await;
    let reason = reason.lock().unwrap().clone().unwrap();
    assert!(reason.contains(constants::ERR_KEY_MISMATCH), "{reason}");

    // the raw peer sees the socket close instead of a login request
    let request = tokio::task::spawn_blocking(move || peer.join().unwrap())
        .await
        .unwrap();
    assert!(request.is_none());
}
