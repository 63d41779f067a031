use crate::connection::Connection;
use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Packet callback. Returning `Ok(Some(reply))` offers a reply to the packet;
/// only the first reply offered during one dispatch is kept.
pub type Handler = Arc<dyn Fn(&Connection, &Packet) -> Result<Option<Packet>> + Send + Sync + 'static>;

/// Identifies one registered callback so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct HandlerTable {
    by_type: HashMap<i32, Vec<(HandlerId, Handler)>>,
    by_subtype: HashMap<(i32, i32), Vec<(HandlerId, Handler)>>,
}

impl HandlerTable {
    fn slot(&mut self, packet_type: i32, subtype: i32) -> &mut Vec<(HandlerId, Handler)> {
        if subtype == 0 {
            self.by_type.entry(packet_type).or_default()
        } else {
            self.by_subtype.entry((packet_type, subtype)).or_default()
        }
    }

    fn remove(&mut self, packet_type: i32, subtype: i32, id: HandlerId) -> bool {
        let list = if subtype == 0 {
            self.by_type.get_mut(&packet_type)
        } else {
            self.by_subtype.get_mut(&(packet_type, subtype))
        };
        let Some(list) = list else {
            return false;
        };

        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;

        if list.is_empty() {
            if subtype == 0 {
                self.by_type.remove(&packet_type);
            } else {
                self.by_subtype.remove(&(packet_type, subtype));
            }
        }
        removed
    }

    /// Subtype-specific callbacks if any exist, otherwise the type-level ones.
    fn lookup(&self, packet_type: i32, subtype: i32) -> Vec<Handler> {
        if subtype != 0 {
            if let Some(list) = self.by_subtype.get(&(packet_type, subtype)) {
                return list.iter().map(|(_, h)| Arc::clone(h)).collect();
            }
        }
        self.by_type
            .get(&packet_type)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    fn contains(&self, packet_type: i32, subtype: i32) -> bool {
        (subtype != 0 && self.by_subtype.contains_key(&(packet_type, subtype)))
            || self.by_type.contains_key(&packet_type)
    }
}

/// Per-connection packet routing.
///
/// Two tables: one keyed by the inbound packet's `(type, subtype)`, and one
/// keyed by the `(type, subtype)` of the request a standard reply answers.
/// Registering a second callback under an existing key adds to it; callbacks
/// run in registration order. Dispatch snapshots the callback list under the
/// read lock and invokes it after the lock is released, so a callback may
/// register or unregister handlers on its own connection.
pub struct HandlerMap {
    handlers: RwLock<HandlerTable>,
    reply_handlers: RwLock<HandlerTable>,
    next_id: AtomicU64,
}

impl Default for HandlerMap {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerMap {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HandlerTable::default()),
            reply_handlers: RwLock::new(HandlerTable::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register<F>(&self, packet_type: i32, subtype: i32, handler: F) -> Result<HandlerId>
    where
        F: Fn(&Connection, &Packet) -> Result<Option<Packet>> + Send + Sync + 'static,
    {
        self.register_arc(packet_type, subtype, Arc::new(handler))
    }

    pub fn register_arc(&self, packet_type: i32, subtype: i32, handler: Handler) -> Result<HandlerId> {
        let mut table = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_HANDLER_WRITE_LOCK.into()))?;

        let id = self.next_id();
        table.slot(packet_type, subtype).push((id, handler));
        Ok(id)
    }

    pub fn unregister(&self, packet_type: i32, subtype: i32, id: HandlerId) -> Result<bool> {
        let mut table = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_HANDLER_WRITE_LOCK.into()))?;
        Ok(table.remove(packet_type, subtype, id))
    }

    /// Register a callback for standard replies answering requests of
    /// `(request_type, request_subtype)`.
    pub fn register_reply<F>(&self, request_type: i32, request_subtype: i32, handler: F) -> Result<HandlerId>
    where
        F: Fn(&Connection, &Packet) -> Result<Option<Packet>> + Send + Sync + 'static,
    {
        let mut table = self
            .reply_handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_HANDLER_WRITE_LOCK.into()))?;

        let id = self.next_id();
        table
            .slot(request_type, request_subtype)
            .push((id, Arc::new(handler)));
        Ok(id)
    }

    pub fn unregister_reply(&self, request_type: i32, request_subtype: i32, id: HandlerId) -> Result<bool> {
        let mut table = self
            .reply_handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_HANDLER_WRITE_LOCK.into()))?;
        Ok(table.remove(request_type, request_subtype, id))
    }

    pub fn handlers_for(&self, packet_type: i32, subtype: i32) -> Result<Vec<Handler>> {
        let table = self
            .handlers
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_HANDLER_READ_LOCK.into()))?;
        Ok(table.lookup(packet_type, subtype))
    }

    pub fn reply_handlers_for(&self, request_type: i32, request_subtype: i32) -> Result<Vec<Handler>> {
        let table = self
            .reply_handlers
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_HANDLER_READ_LOCK.into()))?;
        Ok(table.lookup(request_type, request_subtype))
    }

    /// Everything that should see `packet`: reply callbacks for the request
    /// it answers (if it is a standard reply), then its own callbacks.
    pub fn resolve(&self, packet: &Packet) -> Result<Vec<Handler>> {
        let mut resolved = match packet.as_reply() {
            Some(reply) => self.reply_handlers_for(reply.reply_to_type, reply.reply_to_subtype)?,
            None => Vec::new(),
        };
        resolved.extend(self.handlers_for(packet.packet_type, packet.subtype)?);
        Ok(resolved)
    }

    pub fn is_registered(&self, packet_type: i32, subtype: i32) -> bool {
        self.handlers
            .read()
            .map(|table| table.contains(packet_type, subtype))
            .unwrap_or(false)
    }
}
