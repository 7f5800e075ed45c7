//! In-memory tables for the two roles.
//!
//! Pure data, no I/O: records live in an append-only arena with a uid index
//! in front, so lookups stay O(1) and capacity is a protocol-level error
//! instead of a property of the container. Nothing here is shared; the node
//! core owns both tables outright.

use std::collections::HashMap;

use crate::protocol::Uid;

/// Location value meaning "not present anywhere".
pub const NO_LOCATION: i32 = -1;

/// Outcome of a user upsert, selecting the created/updated success code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Updated,
}

/// Rejection when the identity table is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityExceeded;

#[derive(Debug)]
struct UserRecord {
    uid: Uid,
    special: bool,
}

/// The user node's table: identities and their special-permission flag.
#[derive(Debug)]
pub struct UserDirectory {
    records: Vec<UserRecord>,
    index: HashMap<Uid, usize>,
    capacity: usize,
}

impl UserDirectory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            index: HashMap::new(),
            capacity,
        }
    }

    /// Register a user or update its flag. The capacity limit only applies
    /// to new identities; updates always go through.
    pub fn upsert(&mut self, uid: Uid, special: bool) -> Result<Upsert, CapacityExceeded> {
        if let Some(&slot) = self.index.get(&uid) {
            self.records[slot].special = special;
            return Ok(Upsert::Updated);
        }
        if self.records.len() >= self.capacity {
            return Err(CapacityExceeded);
        }
        let slot = self.records.len();
        self.index.insert(uid.clone(), slot);
        self.records.push(UserRecord { uid, special });
        Ok(Upsert::Created)
    }

    pub fn contains(&self, uid: &Uid) -> bool {
        self.index.contains_key(uid)
    }

    pub fn is_special(&self, uid: &Uid) -> Option<bool> {
        self.index.get(uid).map(|&slot| self.records[slot].special)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Registered identities in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Uid, bool)> {
        self.records.iter().map(|record| (&record.uid, record.special))
    }
}

#[derive(Debug)]
struct LocationRecord {
    uid: Uid,
    location: i32,
}

/// The location node's table: where each identity currently is.
///
/// Uids are only ever added, never removed; a user who left everywhere is a
/// record holding [`NO_LOCATION`]. Bounded in practice by the user node's
/// identity cap, so this table carries no limit of its own.
#[derive(Debug, Default)]
pub struct LocationBoard {
    records: Vec<LocationRecord>,
    index: HashMap<Uid, usize>,
}

impl LocationBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a movement and return the location the user was at before,
    /// [`NO_LOCATION`] the first time a uid is seen.
    pub fn record(&mut self, uid: Uid, location: i32) -> i32 {
        if let Some(&slot) = self.index.get(&uid) {
            std::mem::replace(&mut self.records[slot].location, location)
        } else {
            let slot = self.records.len();
            self.index.insert(uid.clone(), slot);
            self.records.push(LocationRecord { uid, location });
            NO_LOCATION
        }
    }

    pub fn location_of(&self, uid: &Uid) -> Option<i32> {
        self.index.get(uid).map(|&slot| self.records[slot].location)
    }

    /// Uids currently at `location`, in first-report order.
    pub fn occupants_of(&self, location: i32) -> Vec<Uid> {
        self.records
            .iter()
            .filter(|record| record.location == location)
            .map(|record| record.uid.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
