//! # Utility Modules
//!
//! Supporting utilities shared by the framing, protocol and transport layers.
//!
//! ## Components
//! - **Buffer Pool**: preallocated socket buffers per usage class
//! - **Compression**: pluggable LZ4 / Zstd step with size limits
//! - **Crypto**: XChaCha20-Poly1305 body cipher
//! - **Logging**: tracing-subscriber setup from configuration
//! - **Metrics**: process-wide and per-connection counters
//! - **Time**: UTC millisecond helpers
//!
//! ## Security
//! - Cryptographically secure RNG (getrandom)
//! - Decompression bomb protection (16MB limit)

pub mod buffer_pool;
pub mod compression;
pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod time;

pub use buffer_pool::{Lease, PoolClass, SocketPool};
