//! Change tracker recording per-entity state between commits.

use crate::errors::{Result, StorageError};
use crate::storage::entity::EntityState;
use serde_json::Value;
use std::collections::BTreeMap;

/// A staged change ready to be written by a session backend.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub set: &'static str,
    pub key: String,
    pub state: EntityState,
    /// Value to write; for deletions, the last known value.
    pub value: Value,
    /// Value as it was when the entity was loaded, if it was loaded.
    pub original: Option<Value>,
}

#[derive(Debug, Clone)]
struct Entry {
    state: EntityState,
    current: Value,
    original: Option<Value>,
}

type EntryKey = (&'static str, String);

/// Tracks the entities a session has loaded or staged.
///
/// Entries are ordered by `(set, key)` so backends write in a stable order.
#[derive(Debug)]
pub struct ChangeTracker {
    entries: BTreeMap<EntryKey, Entry>,
    auto_detect: bool,
}

impl Default for ChangeTracker {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            auto_detect: true,
        }
    }
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_detect(&self) -> bool {
        self.auto_detect
    }

    pub fn set_auto_detect(&mut self, value: bool) {
        self.auto_detect = value;
    }

    /// Record a value read from the store. Returns the value the caller should
    /// observe: the tracked one when the entity is already tracked.
    pub fn attach(&mut self, set: &'static str, key: String, value: Value) -> Option<Value> {
        match self.entries.get(&(set, key.clone())) {
            Some(entry) if entry.state == EntityState::Deleted => None,
            Some(entry) => Some(entry.current.clone()),
            None => {
                self.entries.insert(
                    (set, key),
                    Entry {
                        state: EntityState::Unchanged,
                        current: value.clone(),
                        original: Some(value.clone()),
                    },
                );
                Some(value)
            }
        }
    }

    /// Staged inserts of one set, as `(key, value)` pairs in key order.
    pub fn added(&self, set: &'static str) -> Vec<(String, Value)> {
        self.entries
            .iter()
            .filter(|((entry_set, _), entry)| {
                *entry_set == set && entry.state == EntityState::Added
            })
            .map(|((_, key), entry)| (key.clone(), entry.current.clone()))
            .collect()
    }

    /// The staged value of one inserted entity.
    pub fn added_value(&self, set: &'static str, key: &str) -> Option<Value> {
        self.entries
            .get(&(set, key.to_string()))
            .filter(|entry| entry.state == EntityState::Added)
            .map(|entry| entry.current.clone())
    }

    pub fn add(&mut self, set: &'static str, key: String, value: Value) -> Result<()> {
        let entry_key = (set, key);
        match self.entries.get_mut(&entry_key) {
            None => {
                self.entries.insert(
                    entry_key,
                    Entry {
                        state: EntityState::Added,
                        current: value,
                        original: None,
                    },
                );
                Ok(())
            }
            // Re-adding a deleted row writes it back as a modification.
            Some(entry) if entry.state == EntityState::Deleted => {
                entry.state = EntityState::Modified;
                entry.current = value;
                Ok(())
            }
            Some(_) => Err(StorageError::InvalidData(format!(
                "{}/{} is already tracked",
                entry_key.0, entry_key.1
            ))),
        }
    }

    pub fn update(&mut self, set: &'static str, key: String, value: Value) -> Result<()> {
        let auto_detect = self.auto_detect;
        let entry_key = (set, key);
        match self.entries.get_mut(&entry_key) {
            None => {
                self.entries.insert(
                    entry_key,
                    Entry {
                        state: EntityState::Modified,
                        current: value,
                        original: None,
                    },
                );
                Ok(())
            }
            Some(entry) => match entry.state {
                EntityState::Deleted => Err(StorageError::InvalidData(format!(
                    "{}/{} is staged for deletion",
                    entry_key.0, entry_key.1
                ))),
                EntityState::Added => {
                    entry.current = value;
                    Ok(())
                }
                _ => {
                    let unchanged = auto_detect && entry.original.as_ref() == Some(&value);
                    entry.state = if unchanged {
                        EntityState::Unchanged
                    } else {
                        EntityState::Modified
                    };
                    entry.current = value;
                    Ok(())
                }
            },
        }
    }

    pub fn remove(&mut self, set: &'static str, key: String, value: Value) {
        let entry_key = (set, key);
        match self.entries.get(&entry_key).map(|entry| entry.state) {
            Some(EntityState::Added) => {
                self.entries.remove(&entry_key);
            }
            Some(_) => {
                if let Some(entry) = self.entries.get_mut(&entry_key) {
                    entry.state = EntityState::Deleted;
                }
            }
            None => {
                self.entries.insert(
                    entry_key,
                    Entry {
                        state: EntityState::Deleted,
                        current: value,
                        original: None,
                    },
                );
            }
        }
    }

    /// Assign an explicit state, as decided by a graph classifier.
    pub fn set_state(&mut self, set: &'static str, key: String, value: Value, state: EntityState) {
        let entry_key = (set, key);
        if state == EntityState::Detached {
            self.entries.remove(&entry_key);
            return;
        }
        let original = match state {
            EntityState::Unchanged => Some(value.clone()),
            _ => self
                .entries
                .get(&entry_key)
                .and_then(|entry| entry.original.clone()),
        };
        self.entries.insert(
            entry_key,
            Entry {
                state,
                current: value,
                original,
            },
        );
    }

    pub fn state_of(&self, set: &'static str, key: &str) -> EntityState {
        self.entries
            .get(&(set, key.to_string()))
            .map(|entry| entry.state)
            .unwrap_or(EntityState::Detached)
    }

    pub fn pending(&self) -> Vec<PendingChange> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.state.is_pending())
            .map(|((set, key), entry)| PendingChange {
                set: *set,
                key: key.clone(),
                state: entry.state,
                value: entry.current.clone(),
                original: entry.original.clone(),
            })
            .collect()
    }

    /// Mark written changes as persisted.
    pub fn accept(&mut self, written: &[PendingChange]) {
        for change in written {
            let entry_key = (change.set, change.key.clone());
            if change.state == EntityState::Deleted {
                self.entries.remove(&entry_key);
            } else if let Some(entry) = self.entries.get_mut(&entry_key) {
                entry.state = EntityState::Unchanged;
                entry.original = Some(entry.current.clone());
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
