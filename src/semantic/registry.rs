//! Room registry: `room_id -> RoomEntry` plus the inverse `slot -> room_id`.
//!
//! The registry follows the same compacting removal as
//! [`VectorIndex`](super::VectorIndex): removing a room moves the owner of
//! the tail slot into the freed slot and rewrites its entry.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomEntry {
    pub room_id: String,
    pub room_name: String,
    pub slot: usize,
}

/// Result of removing a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRemoval {
    /// The removed entry, with the slot it held
    pub entry: RoomEntry,
    /// Slot the relocated room came from, if one was relocated
    pub moved_from: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomRegistry {
    rooms: HashMap<String, RoomEntry>,
    /// owners[slot] = room_id
    owners: Vec<String>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from persisted entries.
    ///
    /// The slots must be exactly `0..entries.len()` with no duplicates.
    pub fn from_entries(entries: Vec<RoomEntry>) -> Result<Self, RegistryError> {
        let len = entries.len();
        let mut owners: Vec<Option<String>> = vec![None; len];
        let mut rooms = HashMap::with_capacity(len);

        for entry in entries {
            if entry.slot >= len {
                return Err(RegistryError::InvalidSlots(format!(
                    "room '{}' has slot {} but there are {} rooms",
                    entry.room_id, entry.slot, len
                )));
            }
            if let Some(other) = &owners[entry.slot] {
                return Err(RegistryError::InvalidSlots(format!(
                    "slot {} is claimed by both '{}' and '{}'",
                    entry.slot, other, entry.room_id
                )));
            }
            if rooms.contains_key(&entry.room_id) {
                return Err(RegistryError::Duplicate(entry.room_id));
            }

            owners[entry.slot] = Some(entry.room_id.clone());
            rooms.insert(entry.room_id.clone(), entry);
        }

        // every slot is claimed once: len entries, each in range, no duplicates
        let owners = owners.into_iter().flatten().collect();

        Ok(Self { rooms, owners })
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    #[cfg(test)]
    pub fn get(&self, room_id: &str) -> Option<&RoomEntry> {
        self.rooms.get(room_id)
    }

    /// Resolve a slot to the room that owns it.
    pub fn resolve(&self, slot: usize) -> Option<&RoomEntry> {
        self.owners.get(slot).and_then(|id| self.rooms.get(id))
    }

    /// Entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &RoomEntry> {
        self.owners.iter().filter_map(|id| self.rooms.get(id))
    }

    /// Register a room at the next free slot.
    ///
    /// `slot` is what the index returned for the room's vector; it must be
    /// the registry's current length or the two structures have diverged.
    pub fn insert(
        &mut self,
        room_id: String,
        room_name: String,
        slot: usize,
    ) -> Result<&RoomEntry, RegistryError> {
        if self.rooms.contains_key(&room_id) {
            return Err(RegistryError::Duplicate(room_id));
        }
        if slot != self.owners.len() {
            return Err(RegistryError::SlotMisaligned {
                expected: self.owners.len(),
                got: slot,
            });
        }

        self.owners.push(room_id.clone());
        let entry = self.rooms.entry(room_id.clone()).or_insert(RoomEntry {
            room_id,
            room_name,
            slot,
        });

        Ok(entry)
    }

    /// Remove a room, relocating the tail slot's owner into the freed slot.
    pub fn remove(&mut self, room_id: &str) -> Option<RegistryRemoval> {
        let entry = self.rooms.remove(room_id)?;
        let slot = entry.slot;
        let last = self.owners.len() - 1;

        self.owners.swap_remove(slot);

        let moved_from = if slot != last {
            let moved_id = &self.owners[slot];
            if let Some(moved) = self.rooms.get_mut(moved_id) {
                moved.slot = slot;
            }
            Some(last)
        } else {
            None
        };

        Some(RegistryRemoval { entry, moved_from })
    }

    /// Undo a [`remove`](Self::remove). The entry returns to its old slot and
    /// whichever room now sits there goes back to the tail.
    pub fn restore(&mut self, entry: RoomEntry) -> Result<(), RegistryError> {
        if self.rooms.contains_key(&entry.room_id) {
            return Err(RegistryError::Duplicate(entry.room_id));
        }
        let len = self.owners.len();
        if entry.slot > len {
            return Err(RegistryError::SlotMisaligned {
                expected: len,
                got: entry.slot,
            });
        }

        if entry.slot == len {
            self.owners.push(entry.room_id.clone());
        } else {
            let displaced =
                std::mem::replace(&mut self.owners[entry.slot], entry.room_id.clone());
            if let Some(moved) = self.rooms.get_mut(&displaced) {
                moved.slot = len;
            }
            self.owners.push(displaced);
        }

        self.rooms.insert(entry.room_id.clone(), entry);
        Ok(())
    }

    /// Drop the room at the tail slot. Used to undo an [`insert`](Self::insert).
    pub fn pop(&mut self) -> Option<RoomEntry> {
        let room_id = self.owners.pop()?;
        self.rooms.remove(&room_id)
    }

    /// Check that the forward and inverse maps agree.
    #[cfg(test)]
    pub fn is_consistent(&self) -> bool {
        self.rooms.len() == self.owners.len()
            && self
                .owners
                .iter()
                .enumerate()
                .all(|(slot, id)| self.rooms.get(id).is_some_and(|e| e.slot == slot))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("room '{0}' already exists")]
    Duplicate(String),

    #[error("slot misaligned: expected {expected}, got {got}")]
    SlotMisaligned { expected: usize, got: usize },

    #[error("invalid slot layout: {0}")]
    InvalidSlots(String),
}
