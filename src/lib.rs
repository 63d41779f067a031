//! # peerwire
//!
//! Peer-to-peer game transport over TCP with optional UDP.
//!
//! Two peers exchange packets framed by a 13-byte little-endian envelope. The
//! listening side opens with its RSA public key, the initiator answers with a
//! wrapped XChaCha20-Poly1305 session key, and once the line is secured the
//! initiator logs in. From then on either side sends typed packets that may
//! be compressed, encrypted, acknowledged, answered with a reply, or (once a
//! UDP route is established) carried in a datagram.
//!
//! ## Layers
//! - [`core`]: envelope, reassembly, codec and the body pipeline
//! - [`protocol`]: packet registry, handlers, handshake, clock sync, dedup
//! - [`transport`]: completion, polling and threaded transits; UDP endpoint;
//!   TCP listener
//! - [`connection`]: per-line state machine tying the layers together
//! - [`utils`]: buffer pool, compression, cipher, logging, metrics, time
//!
//! ## Example
//! ```rust,no_run
//! use peerwire::config::NetworkConfig;
//! use peerwire::connection::{Connection, Credentials};
//!
//! # async fn run() -> peerwire::error::Result<()> {
//! let conn = Connection::initiator(NetworkConfig::default())?;
//! conn.register_handler(100, 0, |_conn, packet| {
//!     println!("chat: {:?}", packet.body::<String>());
//!     Ok(None)
//! })?;
//! conn.begin_connect("127.0.0.1", 7700, Credentials::new("player", "secret"))?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use connection::{Connection, ConnectionState, Credentials};
pub use crate::core::envelope::PacketFlags;
pub use crate::core::packet::{Packet, PacketBody, ReplyCode};
pub use error::{ProtocolError, Result};
pub use transport::listener::Listener;
pub use transport::SendStatus;
