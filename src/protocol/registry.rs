//! Process-wide packet constructor table.
//!
//! Maps `(type, subtype)` to a constructor producing a default body that the
//! inbound pipeline then deserializes into. Subtype `0` is the type-level
//! entry and serves as the fallback for any subtype without its own entry.
//! Entries are write-once: registering a key twice fails and keeps the first.

use crate::core::packet::{PacketBody, Reply};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::messages::*;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use tracing::debug;

pub type Constructor = fn() -> Box<dyn PacketBody>;

fn construct_default<B: PacketBody + Default>() -> Box<dyn PacketBody> {
    Box::new(B::default())
}

#[derive(Default)]
pub struct PacketRegistry {
    by_type: HashMap<i32, Constructor>,
    by_subtype: HashMap<(i32, i32), Constructor>,
}

impl PacketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the transport's own packets.
    pub fn with_core_packets() -> Self {
        let mut registry = Self::new();
        let core: [(i32, Constructor); 12] = [
            (GENERIC_REPLY, construct_default::<Reply>),
            (ACK, construct_default::<Ack>),
            (CLOCK_SYNC, construct_default::<ClockSyncBody>),
            (HELLO, construct_default::<Hello>),
            (KEY_EXCHANGE, construct_default::<KeyExchange>),
            (LINE_SECURED, construct_default::<LineSecured>),
            (LOGIN_REQUEST, construct_default::<LoginRequest>),
            (LOGIN_RESULT, construct_default::<LoginResult>),
            (NAT_INFO, construct_default::<NatInfo>),
            (UDP_PROBE, construct_default::<UdpProbe>),
            (NAT_POKE, construct_default::<()>),
            (STREAM_CHUNK, construct_default::<StreamChunk>),
        ];
        for (packet_type, constructor) in core {
            registry.by_type.insert(packet_type, constructor);
        }
        registry
    }

    pub fn register_constructor(
        &mut self,
        packet_type: i32,
        subtype: i32,
        constructor: Constructor,
    ) -> Result<()> {
        let duplicate = if subtype == 0 {
            self.by_type.contains_key(&packet_type)
        } else {
            self.by_subtype.contains_key(&(packet_type, subtype))
        };
        if duplicate {
            return Err(ProtocolError::DuplicateRegistration {
                packet_type,
                subtype,
            });
        }

        if subtype == 0 {
            self.by_type.insert(packet_type, constructor);
        } else {
            self.by_subtype.insert((packet_type, subtype), constructor);
        }
        debug!(packet_type, subtype, "Packet constructor registered");
        Ok(())
    }

    pub fn register<B: PacketBody + Default>(&mut self, packet_type: i32, subtype: i32) -> Result<()> {
        self.register_constructor(packet_type, subtype, construct_default::<B>)
    }

    /// Subtype entry first, then the type-level entry.
    pub fn lookup(&self, packet_type: i32, subtype: i32) -> Option<Constructor> {
        if subtype != 0 {
            if let Some(constructor) = self.by_subtype.get(&(packet_type, subtype)) {
                return Some(*constructor);
            }
        }
        self.by_type.get(&packet_type).copied()
    }

    pub fn construct(&self, packet_type: i32, subtype: i32) -> Result<Box<dyn PacketBody>> {
        self.lookup(packet_type, subtype)
            .map(|constructor| constructor())
            .ok_or(ProtocolError::UnregisteredPacket {
                packet_type,
                subtype,
            })
    }

    pub fn is_registered(&self, packet_type: i32, subtype: i32) -> bool {
        self.lookup(packet_type, subtype).is_some()
    }
}

static REGISTRY: OnceLock<RwLock<PacketRegistry>> = OnceLock::new();

/// The process-wide registry, populated with core packets on first use.
pub fn global() -> &'static RwLock<PacketRegistry> {
    REGISTRY.get_or_init(|| RwLock::new(PacketRegistry::with_core_packets()))
}

/// Register an application body in the process-wide registry.
pub fn register<B: PacketBody + Default>(packet_type: i32, subtype: i32) -> Result<()> {
    global()
        .write()
        .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_LOCK.into()))?
        .register::<B>(packet_type, subtype)
}

/// Construct an empty body for `(type, subtype)` from the process-wide registry.
pub fn construct(packet_type: i32, subtype: i32) -> Result<Box<dyn PacketBody>> {
    global()
        .read()
        .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_LOCK.into()))?
        .construct(packet_type, subtype)
}

pub fn is_registered(packet_type: i32, subtype: i32) -> bool {
    global()
        .read()
        .map(|registry| registry.is_registered(packet_type, subtype))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Chat {
        text: String,
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Whisper {
        to: String,
    }

    #[test]
    fn test_subtype_falls_back_to_type_level() {
        let mut registry = PacketRegistry::new();
        registry.register::<Chat>(100, 0).unwrap();
        registry.register::<Whisper>(100, 2).unwrap();

        let body = registry.construct(100, 2).unwrap();
        assert!((*body).as_any().is::<Whisper>());
        let body = registry.construct(100, 9).unwrap();
        assert!((*body).as_any().is::<Chat>());
    }

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let mut registry = PacketRegistry::new();
        registry.register::<Chat>(5, 1).unwrap();
        let err = registry.register::<Whisper>(5, 1).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::DuplicateRegistration {
                packet_type: 5,
                subtype: 1
            }
        ));
        assert!((*registry.construct(5, 1).unwrap()).as_any().is::<Chat>());
    }

    #[test]
    fn test_unregistered_lookup_fails() {
        let registry = PacketRegistry::new();
        assert!(matches!(
            registry.construct(42, 0),
            Err(ProtocolError::UnregisteredPacket { packet_type: 42, subtype: 0 })
        ));
    }

    #[test]
    fn test_global_has_core_packets() {
        assert!(is_registered(ACK, 0));
        assert!(is_registered(LINE_SECURED, 0));
        assert!((*construct(GENERIC_REPLY, 0).unwrap()).as_any().is::<Reply>());
    }
}
