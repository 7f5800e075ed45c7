//! Client session registry.
//!
//! Session ids count up from one and are never reused while the process
//! lives, so a freed slot cannot be confused with its previous occupant.
//! The registry owns each session's writer half; reader halves live in the
//! per-connection reader tasks.

use std::collections::HashMap;

use tokio::net::tcp::OwnedWriteHalf;

use crate::store::NO_LOCATION;

/// Identifier handed to the client in `RES_CONN`.
pub type SessionId = u64;

/// One accepted client connection.
#[derive(Debug)]
pub struct ClientSession {
    pub id: SessionId,
    pub writer: OwnedWriteHalf,
    /// Location declared via `REQ_CONN`, if the client sent one.
    pub location: Option<i32>,
}

impl ClientSession {
    /// Context reported for movement-in events and removal notices.
    pub fn location_context(&self) -> i32 {
        self.location.unwrap_or(NO_LOCATION)
    }
}

/// All currently connected clients, capped at the configured limit.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, ClientSession>,
    next_id: SessionId,
    capacity: usize,
}

impl SessionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            next_id: 1,
            capacity,
        }
    }

    pub fn at_capacity(&self) -> bool {
        self.sessions.len() >= self.capacity
    }

    pub fn insert(&mut self, writer: OwnedWriteHalf) -> SessionId {
        let id = self.next_id;
        self.next_id += 1;
        self.sessions.insert(id, ClientSession { id, writer, location: None });
        id
    }

    pub fn get(&self, id: SessionId) -> Option<&ClientSession> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut ClientSession> {
        self.sessions.get_mut(&id)
    }

    pub fn remove(&mut self, id: SessionId) -> Option<ClientSession> {
        self.sessions.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Take every session out of the registry, for shutdown teardown.
    pub fn drain(&mut self) -> Vec<ClientSession> {
        self.sessions.drain().map(|(_, session)| session).collect()
    }
}
