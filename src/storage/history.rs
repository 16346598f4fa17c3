//! Automatic change history rows written alongside a commit.

use crate::errors::Result;
use crate::storage::entity::{Entity, EntityState, to_value};
use crate::storage::tracker::PendingChange;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One audited change of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeHistory {
    pub id: Uuid,
    pub entity_set: String,
    pub entity_key: String,
    pub state: EntityState,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub recorded_at: DateTime<Utc>,
}

impl Entity for ChangeHistory {
    const SET: &'static str = "change_history";

    fn key(&self) -> String {
        self.id.to_string()
    }
}

impl ChangeHistory {
    pub fn from_change(change: &PendingChange) -> Self {
        let (before, after) = match change.state {
            EntityState::Added => (None, Some(change.value.clone())),
            EntityState::Deleted => (Some(change.value.clone()), None),
            _ => (change.original.clone(), Some(change.value.clone())),
        };
        Self {
            id: Uuid::new_v4(),
            entity_set: change.set.to_string(),
            entity_key: change.key.clone(),
            state: change.state,
            before,
            after,
            recorded_at: Utc::now(),
        }
    }
}

/// History rows for a batch of pending changes. History rows never audit
/// themselves.
pub(crate) fn history_rows(pending: &[PendingChange]) -> Result<Vec<PendingChange>> {
    pending
        .iter()
        .filter(|change| change.set != ChangeHistory::SET)
        .map(|change| {
            let history = ChangeHistory::from_change(change);
            Ok(PendingChange {
                set: ChangeHistory::SET,
                key: history.key(),
                state: EntityState::Added,
                value: to_value(&history)?,
                original: None,
            })
        })
        .collect()
}
