//! # Protocol Layer
//!
//! Everything above raw framing that both peers must agree on.
//!
//! ## Components
//! - **Registry**: process-wide `(type, subtype)` to body constructor table
//! - **Dispatcher**: per-connection handler map with multicast callbacks
//! - **Messages**: the reserved core packet types and their bodies
//! - **Handshake**: RSA-wrapped session key exchange
//! - **Clock**: round-trip clock sampling and outlier rejection
//! - **Dedup**: bounded window of recently processed packet ids

pub mod clock;
pub mod dedup;
pub mod dispatcher;
pub mod handshake;
pub mod messages;
pub mod registry;
