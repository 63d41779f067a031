//! Concurrency tests for shared pool, registry and handler state

#![allow(clippy::expect_used, clippy::unwrap_used)]

use peerwire::config::{NetworkConfig, PoolConfig};
use peerwire::connection::Connection;
use peerwire::core::body::{decode_frame, encode_packet, Pipeline};
use peerwire::core::envelope::PacketFlags;
use peerwire::core::packet::Packet;
use peerwire::protocol::dispatcher::HandlerMap;
use peerwire::protocol::messages::{StreamChunk, STREAM_CHUNK};
use peerwire::utils::buffer_pool::{PoolClass, SocketPool};
use peerwire::utils::compression::CompressionKind;
use peerwire::utils::crypto::Crypto;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_pipeline_heavy() {
    let iterations = 2_000usize;
    let payload_sizes = [0usize, 64, 512, 4096, 65536];
    let crypto = Arc::new(Crypto::new(&[3u8; 32]));

    let mut tasks = JoinSet::new();
    for &size in &payload_sizes {
        let crypto = Arc::clone(&crypto);
        tasks.spawn(async move {
            let pipeline = Pipeline::new(Some(crypto.as_ref()), CompressionKind::Lz4);
            for i in 0..iterations {
                let chunk = StreamChunk {
                    stream_id: i as u64,
                    data: vec![((i + size) & 0xFF) as u8; size],
                    ..Default::default()
                };
                let packet = Packet::new(STREAM_CHUNK, 0, chunk)
                    .with_flags(PacketFlags::ENCRYPTED | PacketFlags::COMPRESSED);
                let frame = encode_packet(&packet, pipeline).unwrap();
                let decoded = decode_frame(frame, pipeline).unwrap();
                assert_eq!(decoded.body::<StreamChunk>().unwrap().data.len(), size);
            }
        });
    }

    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }
}

#[test]
fn concurrent_pool_leases_return_home() {
    let config = PoolConfig {
        buffer_size: 1024,
        read_slots: 4,
        write_slots: 4,
        accept_slots: 1,
        headroom: 2,
    };
    let pool = SocketPool::new(&config, 64 * 1024);
    let capacity = pool.capacity(PoolClass::Write);

    let handles: Vec<_> = (0..16)
        .map(|t| {
            let pool = pool.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    let class = if (t + i) % 2 == 0 { PoolClass::Write } else { PoolClass::Read };
                    let mut lease = pool.acquire(class);
                    lease.buffer_mut().extend_from_slice(&[t as u8; 64]);
                    assert_eq!(lease.class(), class);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // ad-hoc overflow leases are freed, pooled ones all come back
    assert_eq!(pool.available(PoolClass::Write), capacity);
    assert_eq!(pool.available(PoolClass::Read), pool.capacity(PoolClass::Read));
}

#[test]
fn exhausted_pool_hands_out_adhoc_leases() {
    let config = PoolConfig {
        buffer_size: 256,
        read_slots: 1,
        write_slots: 1,
        accept_slots: 1,
        headroom: 0,
    };
    let pool = SocketPool::new(&config, 1024);

    let first = pool.acquire(PoolClass::Accept);
    let second = pool.acquire(PoolClass::Accept);
    assert!(first.is_returnable());
    assert!(!second.is_returnable());
    assert_eq!(pool.adhoc_leases(), 1);

    drop(second);
    assert_eq!(pool.available(PoolClass::Accept), 0);
    drop(first);
    assert_eq!(pool.available(PoolClass::Accept), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn registration_during_dispatch() {
    let conn = Connection::initiator(NetworkConfig::default()).unwrap();
    let handlers = Arc::new(HandlerMap::new());
    let calls = Arc::new(AtomicUsize::new(0));

    {
        let calls = Arc::clone(&calls);
        handlers
            .register(500, 0, move |_: &Connection, _: &Packet| {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            })
            .unwrap();
    }

    let registrar = {
        let handlers = Arc::clone(&handlers);
        std::thread::spawn(move || {
            for i in 0..1_000 {
                let id = handlers
                    .register(500, 1 + (i % 3), |_: &Connection, _: &Packet| Ok(None))
                    .unwrap();
                if i % 2 == 0 {
                    handlers.unregister(500, 1 + (i % 3), id).unwrap();
                }
            }
        })
    };

    let packet = Packet::new(500, 0, ());
    for _ in 0..1_000 {
        for handler in handlers.resolve(&packet).unwrap() {
            handler(&conn, &packet).unwrap();
        }
    }
    registrar.join().unwrap();

    // subtype registrations never shadow the type-level callback for subtype 0
    assert_eq!(calls.load(Ordering::Relaxed), 1_000);
    assert!(handlers.is_registered(500, 2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handler_may_register_on_its_own_connection() {
    let conn = Connection::initiator(NetworkConfig::default()).unwrap();
    let handlers = Arc::new(HandlerMap::new());

    {
        let inner = Arc::clone(&handlers);
        handlers
            .register(501, 0, move |_: &Connection, _: &Packet| {
                inner.register(502, 0, |_: &Connection, _: &Packet| Ok(None))?;
                Ok(None)
            })
            .unwrap();
    }

    let packet = Packet::new(501, 0, ());
    for handler in handlers.resolve(&packet).unwrap() {
        handler(&conn, &packet).unwrap();
    }
    assert!(handlers.is_registered(502, 0));
}
