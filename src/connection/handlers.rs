//! Handlers for the reserved core packets.
//!
//! These run through the same dispatch path as application handlers. Faults
//! that must end the line (handshake or login failures) kill the connection
//! here and return `Ok(None)`; everything else is left to the dispatcher's
//! logging.

use super::{Connection, ConnectionState, Role};
use crate::core::envelope::PacketFlags;
use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake::{
    decode_public_key, initiator_key_exchange, initiator_verify, listener_accept_key,
};
use crate::protocol::messages::*;
use crate::transport::lock;
use crate::transport::udp::UdpListener;
use crate::transport::{SendStatus, TransitSink};
use crate::utils::metrics::{global_metrics, Timer};
use crate::utils::time::now_ms;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

/// Probes sent before the initiator gives up on UDP.
pub(super) const MAX_UDP_PROBES: u32 = 5;

pub(super) const UDP_PROBE_RETRY_MS: i64 = 1_000;

const SECURE: PacketFlags = PacketFlags::ENCRYPTED.union(PacketFlags::COMPRESSED);

fn body<'a, B: crate::core::packet::PacketBody>(packet: &'a Packet) -> Result<&'a B> {
    packet.body::<B>().ok_or(ProtocolError::UnexpectedMessage)
}

pub(super) fn register_core(conn: &Connection) -> Result<()> {
    let handlers = &conn.inner.handlers;
    handlers.register(ACK, 0, on_ack)?;
    handlers.register(CLOCK_SYNC, 0, on_clock_sync)?;
    handlers.register(STREAM_CHUNK, 0, super::stream::on_stream_chunk)?;
    handlers.register(UDP_PROBE, 0, |conn: &Connection, packet: &Packet| {
        debug!(conn_id = conn.id(), via_udp = packet.is_udp(), "UDP probe received");
        Ok(None)
    })?;
    handlers.register(NAT_POKE, 0, |conn: &Connection, _packet: &Packet| {
        trace!(conn_id = conn.id(), "NAT poke received");
        Ok(None)
    })?;

    match conn.inner.role {
        Role::Initiator => {
            handlers.register(HELLO, 0, on_hello)?;
            handlers.register(LINE_SECURED, 0, on_line_secured)?;
            handlers.register(LOGIN_RESULT, 0, on_login_result)?;
            handlers.register(NAT_INFO, 0, on_nat_info)?;
        }
        Role::Listener => {
            handlers.register(KEY_EXCHANGE, 0, on_key_exchange)?;
            handlers.register(LOGIN_REQUEST, 0, on_login_request)?;
        }
    }
    Ok(())
}

fn on_hello(conn: &Connection, packet: &Packet) -> Result<Option<Packet>> {
    let hello = body::<Hello>(packet)?;
    debug!(conn_id = conn.id(), peer_conn_id = hello.connection_id, "Hello received");

    let exchanged = conn
        .rsa_identity()
        .and_then(|identity| initiator_key_exchange(hello, identity.public_key_der()));
    match exchanged {
        Ok((key, exchange)) => {
            *lock(&conn.inner.peer_public_key)? = Some(hello.public_key.clone());
            *lock(&conn.inner.pending_key)? = Some(key);
            conn.send(Packet::new(KEY_EXCHANGE, 0, exchange));
        }
        Err(e) => {
            global_metrics().handshake_failed();
            conn.kill(format!("handshake failed: {e}"), false);
        }
    }
    Ok(None)
}

fn on_key_exchange(conn: &Connection, packet: &Packet) -> Result<Option<Packet>> {
    let exchange = body::<KeyExchange>(packet)?;
    let Some(identity) = conn.inner.identity.get() else {
        conn.kill(constants::ERR_NO_PENDING_KEY, false);
        return Ok(None);
    };

    let accepted = {
        let _timer = Timer::start("key_unwrap");
        listener_accept_key(identity, exchange)
    };

    match accepted {
        Ok((key, secured)) => {
            if !exchange.public_key.is_empty() {
                match decode_public_key(&exchange.public_key) {
                    Ok(_) => *lock(&conn.inner.peer_public_key)? = Some(exchange.public_key.clone()),
                    Err(e) => debug!(conn_id = conn.id(), error = %e, "Ignoring unreadable initiator key"),
                }
            }
            *conn
                .inner
                .crypto
                .write()
                .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))? = Some(key.cipher());
            conn.advance(ConnectionState::Secured);
            global_metrics().handshake_success();
            info!(conn_id = conn.id(), "Line secured");
            conn.send(Packet::new(LINE_SECURED, 0, secured));
        }
        Err((e, rejection)) => {
            global_metrics().handshake_failed();
            conn.send(Packet::new(LINE_SECURED, 0, rejection));
            conn.kill(format!("handshake failed: {e}"), true);
        }
    }
    Ok(None)
}

fn on_line_secured(conn: &Connection, packet: &Packet) -> Result<Option<Packet>> {
    let secured = body::<LineSecured>(packet)?;
    let Some(key) = lock(&conn.inner.pending_key)?.take() else {
        conn.kill(format!("handshake failed: {}", constants::ERR_NO_PENDING_KEY), false);
        return Ok(None);
    };

    if let Err(e) = initiator_verify(&key, secured) {
        global_metrics().handshake_failed();
        conn.kill(e.to_string(), false);
        return Ok(None);
    }

    *conn
        .inner
        .crypto
        .write()
        .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))? = Some(key.cipher());
    conn.advance(ConnectionState::Secured);
    global_metrics().handshake_success();
    info!(conn_id = conn.id(), "Line secured");

    let request = lock(&conn.inner.credentials)?
        .as_ref()
        .map(|credentials| credentials.to_request())
        .unwrap_or_default();
    conn.advance(ConnectionState::Authenticating);
    conn.send(Packet::new(LOGIN_REQUEST, 0, request).with_flags(SECURE | PacketFlags::CRITICAL));
    Ok(None)
}

fn on_login_request(conn: &Connection, packet: &Packet) -> Result<Option<Packet>> {
    let request = body::<LoginRequest>(packet)?;
    if !packet.is_encrypted() || !conn.is_secured() {
        conn.kill("login request on an unsecured line", false);
        return Ok(None);
    }

    conn.advance(ConnectionState::Authenticating);
    let result = conn.inner.authenticator.authenticate(conn, request);
    let accepted = result.result.is_ok();
    let message = result.message.clone();
    conn.send(Packet::new(LOGIN_RESULT, 0, result).with_flags(SECURE | PacketFlags::CRITICAL));

    if !accepted {
        warn!(conn_id = conn.id(), account = %request.account_name, %message, "Login rejected");
        conn.kill(format!("login rejected: {message}"), true);
        return Ok(None);
    }

    if let Ok(mut account) = conn.inner.account.write() {
        *account = Some(request.account_name.clone());
    }
    conn.advance(ConnectionState::LoggedIn);
    info!(conn_id = conn.id(), account = %request.account_name, kind = ?request.kind, "Login accepted");

    if let Err(e) = offer_udp(conn) {
        warn!(conn_id = conn.id(), error = %e, "Could not offer UDP");
    }
    Ok(None)
}

/// Hand the initiator a token for the shared UDP endpoint.
fn offer_udp(conn: &Connection) -> Result<()> {
    let mut udp = lock(&conn.inner.udp)?;
    let Some(endpoint) = udp.endpoint.clone() else {
        return Ok(());
    };

    let token: u64 = rand::random();
    let sink: Weak<dyn TransitSink> = conn.inner.self_weak.clone();
    endpoint.expect_probe(token, sink);
    udp.token = Some(token);
    drop(udp);

    let udp_port = endpoint.local_addr()?.port();
    conn.send(Packet::new(NAT_INFO, 0, NatInfo { udp_port, token }).with_flags(SECURE));
    debug!(conn_id = conn.id(), udp_port, "NAT info sent");
    Ok(())
}

fn on_login_result(conn: &Connection, packet: &Packet) -> Result<Option<Packet>> {
    let result = body::<LoginResult>(packet)?;
    if !result.result.is_ok() {
        conn.kill(format!("login rejected: {}", result.message), false);
        return Ok(None);
    }

    if let Some(account) = lock(&conn.inner.credentials)?
        .as_ref()
        .map(|credentials| credentials.account_name.clone())
    {
        if let Ok(mut slot) = conn.inner.account.write() {
            *slot = Some(account);
        }
    }
    conn.advance(ConnectionState::LoggedIn);
    lock(&conn.inner.clock)?.start(now_ms());
    info!(conn_id = conn.id(), roles = ?result.roles, "Logged in");
    Ok(None)
}

fn on_nat_info(conn: &Connection, packet: &Packet) -> Result<Option<Packet>> {
    let info = body::<NatInfo>(packet)?;
    if !conn.inner.config.connection.udp_enabled {
        debug!(conn_id = conn.id(), "UDP disabled locally, ignoring NAT info");
        return Ok(None);
    }
    if let Err(e) = open_udp(conn, info) {
        warn!(conn_id = conn.id(), error = %e, "UDP setup failed, staying on TCP");
    }
    Ok(None)
}

/// Bind the initiator's endpoint, map the listener's UDP address and send
/// the first probe.
fn open_udp(conn: &Connection, info: &NatInfo) -> Result<()> {
    let remote = conn.remote_addr().ok_or(ProtocolError::ConnectionClosed)?;
    let peer = SocketAddr::new(remote.ip(), info.udp_port);
    let bind = if peer.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };

    let cfg = &conn.inner.config.connection;
    let endpoint = UdpListener::bind(bind, cfg.transit, cfg.max_body_size)?;
    let sink: Weak<dyn TransitSink> = conn.inner.self_weak.clone();
    endpoint.route(peer, sink);
    endpoint.start()?;

    {
        let mut udp = lock(&conn.inner.udp)?;
        if let Some(previous) = udp.endpoint.replace(Arc::clone(&endpoint)) {
            if udp.owns_endpoint {
                previous.stop();
            }
        }
        udp.owns_endpoint = true;
        udp.peer = Some(peer);
        udp.token = Some(info.token);
        udp.probes_sent = 0;
    }
    conn.send_udp_probe()
}

fn on_ack(conn: &Connection, packet: &Packet) -> Result<Option<Packet>> {
    let ack = body::<Ack>(packet)?;
    let via_udp = packet.is_udp();

    if !conn.settle_ack(ack.acked_id) {
        debug!(conn_id = conn.id(), acked_id = ack.acked_id, "Acknowledgement for an id not awaiting one");
    }
    global_metrics().ack_received();
    conn.inner.transit.on_ack_received(ack, via_udp);

    if ack.acked_type == UDP_PROBE
        && via_udp
        && conn.inner.role == Role::Initiator
        && !conn.inner.transit.udp_enabled()
    {
        let now = now_ms();
        let route = {
            let mut udp = lock(&conn.inner.udp)?;
            let (Some(endpoint), Some(peer)) = (udp.endpoint.clone(), udp.peer) else {
                return Ok(None);
            };
            udp.enabled_at_ms = now;
            udp.last_poke_ms = now;
            endpoint.route_to(peer)
        };
        info!(conn_id = conn.id(), peer = %route.peer(), "UDP enabled");
        conn.inner.transit.enable_udp(route);
    }
    Ok(None)
}

/// Ask the peer for its clock. A request that never left gives up its
/// in-flight slot so the next one is scheduled.
pub(super) fn request_clock_sample(conn: &Connection, now: i64) -> SendStatus {
    let flags = if conn.is_secured() {
        PacketFlags::ENCRYPTED
    } else {
        PacketFlags::empty()
    };
    let status = conn.send(
        Packet::new(
            CLOCK_SYNC,
            0,
            ClockSyncBody {
                local_sent_ms: now,
                remote_ms: 0,
                is_response: false,
            },
        )
        .with_flags(flags),
    );

    if status == SendStatus::Dropped {
        debug!(conn_id = conn.id(), "Clock sample request dropped, rescheduling");
        if let Ok(mut clock) = lock(&conn.inner.clock) {
            clock.abandon_request(now);
        }
    }
    status
}

fn on_clock_sync(conn: &Connection, packet: &Packet) -> Result<Option<Packet>> {
    let sync = body::<ClockSyncBody>(packet)?;
    let now = now_ms();

    if sync.is_response {
        let mut clock = lock(&conn.inner.clock)?;
        if clock.is_running() {
            let sample = clock.record(sync.local_sent_ms, now, sync.remote_ms);
            trace!(
                conn_id = conn.id(),
                latency_ms = sample.latency_ms,
                delta_ms = sample.delta_ms,
                "Clock sample"
            );
        }
        return Ok(None);
    }

    conn.send(
        Packet::new(
            CLOCK_SYNC,
            0,
            ClockSyncBody {
                local_sent_ms: sync.local_sent_ms,
                remote_ms: now,
                is_response: true,
            },
        )
        .with_flags(packet.flags & PacketFlags::ENCRYPTED),
    );
    Ok(None)
}
