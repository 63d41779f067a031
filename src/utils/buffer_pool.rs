//! # Socket Resource Pool
//!
//! Preallocated I/O buffers per usage class (read, write, accept), carved from
//! one contiguous arena per class so steady-state traffic does not fragment the
//! heap.
//!
//! ## Behaviour
//! - Each class owns `slots + headroom` buffers of `buffer_size` bytes
//! - Acquiring past capacity hands out an ad-hoc lease that is freed on drop
//!   instead of being returned
//! - Read leases carry a [`ReassemblyCursor`], reset whenever the lease goes
//!   back to the pool
//!
//! ## Usage
//! ```rust,no_run
//! use peerwire::config::PoolConfig;
//! use peerwire::utils::buffer_pool::{PoolClass, SocketPool};
//!
//! let pool = SocketPool::new(&PoolConfig::default(), 16 * 1024 * 1024);
//! let mut lease = pool.acquire(PoolClass::Write);
//! lease.buffer_mut().extend_from_slice(b"frame bytes");
//! // Buffer returned to the pool on drop
//! ```

use crate::config::PoolConfig;
use crate::core::cursor::ReassemblyCursor;
use bytes::BytesMut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Buffers that grew past this multiple of the slot size are freed rather
/// than returned.
const MAX_GROWTH_FACTOR: usize = 4;

/// What a lease is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolClass {
    Read,
    Write,
    Accept,
}

struct Slot {
    buffer: BytesMut,
    cursor: Option<ReassemblyCursor>,
}

struct ClassPool {
    free: Mutex<Vec<Slot>>,
    capacity: usize,
}

struct PoolInner {
    buffer_size: usize,
    max_body: usize,
    read: ClassPool,
    write: ClassPool,
    accept: ClassPool,
    adhoc_leases: AtomicU64,
}

impl PoolInner {
    fn class(&self, class: PoolClass) -> &ClassPool {
        match class {
            PoolClass::Read => &self.read,
            PoolClass::Write => &self.write,
            PoolClass::Accept => &self.accept,
        }
    }

    fn fresh_slot(&self, class: PoolClass, buffer: BytesMut) -> Slot {
        Slot {
            buffer,
            cursor: (class == PoolClass::Read).then(|| ReassemblyCursor::new(self.max_body)),
        }
    }
}

/// A buffer (and, for reads, a reassembly cursor) borrowed from a
/// [`SocketPool`]. Returned to the pool when dropped.
pub struct Lease {
    class: PoolClass,
    slot: Slot,
    returnable: bool,
    pool: Arc<PoolInner>,
}

impl Lease {
    pub fn class(&self) -> PoolClass {
        self.class
    }

    /// False for ad-hoc leases handed out while the class was exhausted.
    pub fn is_returnable(&self) -> bool {
        self.returnable
    }

    pub fn buffer(&self) -> &[u8] {
        &self.slot.buffer[..]
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.slot.buffer
    }

    /// Reassembly cursor of a read lease.
    pub fn cursor_mut(&mut self) -> Option<&mut ReassemblyCursor> {
        self.slot.cursor.as_mut()
    }

    /// Split borrow of the buffer and the cursor for read loops.
    pub fn parts_mut(&mut self) -> (&mut BytesMut, Option<&mut ReassemblyCursor>) {
        (&mut self.slot.buffer, self.slot.cursor.as_mut())
    }

    /// Size the buffer to one slot of zeroed, readable bytes.
    pub fn prepare_read(&mut self) -> &mut [u8] {
        let size = self.pool.buffer_size;
        let buffer = &mut self.slot.buffer;
        buffer.clear();
        buffer.resize(size, 0);
        &mut buffer[..]
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.returnable || self.slot.buffer.capacity() > self.pool.buffer_size * MAX_GROWTH_FACTOR {
            return;
        }

        let mut slot = std::mem::replace(
            &mut self.slot,
            Slot {
                buffer: BytesMut::new(),
                cursor: None,
            },
        );
        slot.buffer.clear();
        if let Some(cursor) = slot.cursor.as_mut() {
            cursor.reset();
        }
        if let Ok(mut free) = self.pool.class(self.class).free.lock() {
            free.push(slot);
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("class", &self.class)
            .field("returnable", &self.returnable)
            .field("len", &self.buffer().len())
            .finish()
    }
}

/// Thread-safe pool of I/O buffers shared by many connections.
#[derive(Clone)]
pub struct SocketPool {
    inner: Arc<PoolInner>,
}

fn carve(arena: &mut BytesMut, count: usize, buffer_size: usize) -> Vec<BytesMut> {
    let mut slots = Vec::with_capacity(count);
    for _ in 0..count {
        let mut slot = arena.split_to(buffer_size);
        slot.clear();
        slots.push(slot);
    }
    slots
}

impl SocketPool {
    pub fn new(config: &PoolConfig, max_body: usize) -> Self {
        let buffer_size = config.buffer_size.max(1);
        let read_count = config.read_slots + config.headroom;
        let write_count = config.write_slots + config.headroom;
        let accept_count = config.accept_slots + config.headroom;

        // One arena per class, sized buffer_size * (slots + headroom)
        let mut read_arena = BytesMut::zeroed(buffer_size * read_count);
        let mut write_arena = BytesMut::zeroed(buffer_size * write_count);
        let mut accept_arena = BytesMut::zeroed(buffer_size * accept_count);

        let inner = Arc::new(PoolInner {
            buffer_size,
            max_body,
            read: ClassPool {
                free: Mutex::new(Vec::new()),
                capacity: read_count,
            },
            write: ClassPool {
                free: Mutex::new(Vec::new()),
                capacity: write_count,
            },
            accept: ClassPool {
                free: Mutex::new(Vec::new()),
                capacity: accept_count,
            },
            adhoc_leases: AtomicU64::new(0),
        });

        for (class, arena, count) in [
            (PoolClass::Read, &mut read_arena, read_count),
            (PoolClass::Write, &mut write_arena, write_count),
            (PoolClass::Accept, &mut accept_arena, accept_count),
        ] {
            let slots: Vec<Slot> = carve(arena, count, buffer_size)
                .into_iter()
                .map(|buffer| inner.fresh_slot(class, buffer))
                .collect();
            if let Ok(mut free) = inner.class(class).free.lock() {
                *free = slots;
            }
        }

        debug!(buffer_size, read_count, write_count, accept_count, "Socket pool allocated");
        Self { inner }
    }

    /// Borrow a buffer of `class`, or an ad-hoc one if the class is exhausted.
    pub fn acquire(&self, class: PoolClass) -> Lease {
        let pooled = self
            .inner
            .class(class)
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop());

        match pooled {
            Some(slot) => Lease {
                class,
                slot,
                returnable: true,
                pool: Arc::clone(&self.inner),
            },
            None => {
                self.inner.adhoc_leases.fetch_add(1, Ordering::Relaxed);
                debug!(?class, "Socket pool exhausted, handing out ad-hoc lease");
                Lease {
                    class,
                    slot: self
                        .inner
                        .fresh_slot(class, BytesMut::with_capacity(self.inner.buffer_size)),
                    returnable: false,
                    pool: Arc::clone(&self.inner),
                }
            }
        }
    }

    /// Buffers of `class` currently sitting in the pool.
    pub fn available(&self, class: PoolClass) -> usize {
        self.inner
            .class(class)
            .free
            .lock()
            .map(|free| free.len())
            .unwrap_or(0)
    }

    pub fn capacity(&self, class: PoolClass) -> usize {
        self.inner.class(class).capacity
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Ad-hoc leases handed out since the pool was created.
    pub fn adhoc_leases(&self) -> u64 {
        self.inner.adhoc_leases.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for SocketPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("read_available", &self.available(PoolClass::Read))
            .field("write_available", &self.available(PoolClass::Write))
            .field("accept_available", &self.available(PoolClass::Accept))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool() -> SocketPool {
        SocketPool::new(
            &PoolConfig {
                buffer_size: 128,
                read_slots: 2,
                write_slots: 2,
                accept_slots: 1,
                headroom: 1,
            },
            1024,
        )
    }

    #[test]
    fn test_pool_capacity_includes_headroom() {
        let pool = small_pool();
        assert_eq!(pool.available(PoolClass::Read), 3);
        assert_eq!(pool.available(PoolClass::Write), 3);
        assert_eq!(pool.available(PoolClass::Accept), 2);
    }

    #[test]
    fn test_lease_returns_on_drop() {
        let pool = small_pool();
        let mut lease = pool.acquire(PoolClass::Write);
        assert_eq!(pool.available(PoolClass::Write), 2);

        lease.buffer_mut().extend_from_slice(b"abc");
        assert_eq!(lease.buffer(), b"abc");
        drop(lease);

        assert_eq!(pool.available(PoolClass::Write), 3);
        let lease = pool.acquire(PoolClass::Write);
        assert!(lease.buffer().is_empty());
    }

    #[test]
    fn test_exhaustion_falls_back_to_adhoc() {
        let pool = small_pool();
        let held: Vec<Lease> = (0..3).map(|_| pool.acquire(PoolClass::Read)).collect();
        assert!(held.iter().all(Lease::is_returnable));

        let extra = pool.acquire(PoolClass::Read);
        assert!(!extra.is_returnable());
        assert_eq!(pool.adhoc_leases(), 1);

        drop(extra);
        assert_eq!(pool.available(PoolClass::Read), 0);
        drop(held);
        assert_eq!(pool.available(PoolClass::Read), 3);
    }

    #[test]
    fn test_read_lease_cursor_reset_on_release() {
        let pool = SocketPool::new(
            &PoolConfig {
                buffer_size: 64,
                read_slots: 1,
                write_slots: 1,
                accept_slots: 0,
                headroom: 0,
            },
            1024,
        );

        let mut lease = pool.acquire(PoolClass::Read);
        let cursor = lease.cursor_mut().unwrap();
        let mut frames = Vec::new();
        cursor.feed(&[5, 0, 0, 0, 1], &mut frames).unwrap();
        assert!(!cursor.is_idle());
        drop(lease);

        let mut lease = pool.acquire(PoolClass::Read);
        assert!(lease.cursor_mut().unwrap().is_idle());
        assert!(pool.acquire(PoolClass::Write).cursor_mut().is_none());
    }

    #[test]
    fn test_prepare_read_sizes_buffer() {
        let pool = small_pool();
        let mut lease = pool.acquire(PoolClass::Read);
        assert_eq!(lease.prepare_read().len(), 128);
    }
}
