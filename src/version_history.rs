// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Version histories and the comparisons the processor runs against them.
//!
//! A version history is a branch of `(event_id, version)` checkpoints. Only
//! the points where the version changed are recorded, so the version of an
//! arbitrary event is implied by the *next* checkpoint at or after it.
//!
//! ```text
//! branch: (10, v1) ── (25, v3) ── (40, v7)
//!
//! events 1..=10  → v1
//! events 11..=25 → v3
//! events 26..=40 → v7
//! ```
//!
//! Two lookups are exposed:
//!
//! - [`VersionHistory::version_at`]: **exact** checkpoint match. Used by the
//!   activity consistency check, where the scheduled event must itself be a
//!   checkpoint on the current branch.
//! - [`VersionHistory::contains_item`]: **range** containment. Used to find
//!   the branch that produced a batch of history events.
//!
//! Every lookup validates the branch first; a branch whose event IDs do not
//! strictly increase is reported as
//! [`ReplicationError::InvalidVersionHistory`] instead of being searched.

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};

/// First event ID of every workflow history.
pub const FIRST_EVENT_ID: i64 = 1;

/// Placeholder event ID for "not yet happened" (e.g. an activity that has
/// been scheduled but not started).
pub const EMPTY_EVENT_ID: i64 = -23;

/// A single `(event_id, version)` checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionHistoryItem {
    pub event_id: i64,
    pub version: i64,
}

impl VersionHistoryItem {
    pub fn new(event_id: i64, version: i64) -> Self {
        Self { event_id, version }
    }
}

/// One branch of an execution's history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistory {
    /// Opaque token addressing the branch in the history store.
    #[serde(default)]
    pub branch_token: Vec<u8>,
    /// Checkpoints, strictly increasing in `event_id`.
    pub items: Vec<VersionHistoryItem>,
}

impl VersionHistory {
    pub fn new(branch_token: Vec<u8>, items: Vec<VersionHistoryItem>) -> Self {
        Self {
            branch_token,
            items,
        }
    }

    /// Check that event IDs strictly increase along the branch.
    pub fn validate(&self) -> Result<()> {
        for pair in self.items.windows(2) {
            if pair[1].event_id <= pair[0].event_id {
                return Err(ReplicationError::InvalidVersionHistory(format!(
                    "event id {} does not follow {}",
                    pair[1].event_id, pair[0].event_id
                )));
            }
        }
        Ok(())
    }

    /// Version recorded at exactly `event_id`, if that event is a checkpoint.
    pub fn version_at(&self, event_id: i64) -> Result<Option<i64>> {
        self.validate()?;
        Ok(self
            .items
            .binary_search_by_key(&event_id, |item| item.event_id)
            .ok()
            .map(|idx| self.items[idx].version))
    }

    /// Whether `item` was produced by this branch.
    ///
    /// True when some checkpoint carries `item.version` and `item.event_id`
    /// falls in `(previous checkpoint, that checkpoint]`.
    pub fn contains_item(&self, item: &VersionHistoryItem) -> Result<bool> {
        self.validate()?;

        let mut prev_event_id = FIRST_EVENT_ID - 1;
        for current in &self.items {
            if item.version == current.version {
                if prev_event_id < item.event_id && item.event_id <= current.event_id {
                    return Ok(true);
                }
            } else if item.version < current.version {
                return Ok(false);
            }
            prev_event_id = current.event_id;
        }
        Ok(false)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// All branches of one execution plus which one is current.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistories {
    pub current_version_history_index: usize,
    pub histories: Vec<VersionHistory>,
}

impl VersionHistories {
    /// A set with a single branch, which is current.
    pub fn single(history: VersionHistory) -> Self {
        Self {
            current_version_history_index: 0,
            histories: vec![history],
        }
    }

    /// The current branch.
    pub fn current(&self) -> Result<&VersionHistory> {
        self.get(self.current_version_history_index)
    }

    /// The branch at `index`.
    pub fn get(&self, index: usize) -> Result<&VersionHistory> {
        self.histories.get(index).ok_or_else(|| {
            ReplicationError::InvalidVersionHistory(format!(
                "branch index {} out of range ({} branches)",
                index,
                self.histories.len()
            ))
        })
    }

    /// Index of the first branch containing `item` (range semantics).
    pub fn find_first_containing(&self, item: &VersionHistoryItem) -> Result<Option<usize>> {
        for (idx, history) in self.histories.iter().enumerate() {
            if history.contains_item(item)? {
                return Ok(Some(idx));
            }
        }
        Ok(None)
    }
}

/// Version at `event_id` on the current branch (exact checkpoint match).
pub fn version_at(histories: &VersionHistories, event_id: i64) -> Result<Option<i64>> {
    histories.current()?.version_at(event_id)
}

/// Outcome of checking a recorded version against the current branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    /// The branch records `event_id` with the expected version.
    Match,
    /// The branch has no checkpoint at `event_id`.
    Missing,
    /// The branch records a different version at `event_id`.
    Mismatch { recorded: i64 },
}

impl VersionCheck {
    pub fn is_match(&self) -> bool {
        matches!(self, VersionCheck::Match)
    }
}

/// Compare `expected_version` with the checkpoint at `event_id` on the
/// current branch.
pub fn check_version(
    histories: &VersionHistories,
    event_id: i64,
    expected_version: i64,
) -> Result<VersionCheck> {
    Ok(match version_at(histories, event_id)? {
        None => VersionCheck::Missing,
        Some(recorded) if recorded == expected_version => VersionCheck::Match,
        Some(recorded) => VersionCheck::Mismatch { recorded },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(event_id: i64, version: i64) -> VersionHistoryItem {
        VersionHistoryItem::new(event_id, version)
    }

    fn branch(items: &[(i64, i64)]) -> VersionHistory {
        VersionHistory::new(
            b"branch".to_vec(),
            items.iter().map(|&(e, v)| item(e, v)).collect(),
        )
    }

    #[test]
    fn test_version_at_exact_match() {
        let history = branch(&[(10, 1), (25, 3), (40, 7)]);
        assert_eq!(history.version_at(10).unwrap(), Some(1));
        assert_eq!(history.version_at(25).unwrap(), Some(3));
        assert_eq!(history.version_at(40).unwrap(), Some(7));
    }

    #[test]
    fn test_version_at_is_not_a_range_lookup() {
        let history = branch(&[(10, 1), (25, 3)]);
        // 20 lies inside the v3 range but is not a checkpoint
        assert_eq!(history.version_at(20).unwrap(), None);
        assert_eq!(history.version_at(0).unwrap(), None);
        assert_eq!(history.version_at(26).unwrap(), None);
    }

    #[test]
    fn test_version_at_empty_branch() {
        let history = VersionHistory::default();
        assert_eq!(history.version_at(1).unwrap(), None);
        assert!(history.is_empty());
    }

    #[test]
    fn test_non_monotonic_branch_rejected() {
        let history = branch(&[(10, 1), (10, 2)]);
        assert!(matches!(
            history.version_at(10),
            Err(ReplicationError::InvalidVersionHistory(_))
        ));

        let history = branch(&[(30, 1), (20, 2)]);
        assert!(history.validate().is_err());
        assert!(history.contains_item(&item(20, 2)).is_err());
    }

    #[test]
    fn test_current_selects_indexed_branch() {
        let histories = VersionHistories {
            current_version_history_index: 1,
            histories: vec![branch(&[(144, 100)]), branch(&[(144, 333)])],
        };
        assert_eq!(version_at(&histories, 144).unwrap(), Some(333));
    }

    #[test]
    fn test_current_index_out_of_range() {
        let histories = VersionHistories {
            current_version_history_index: 3,
            histories: vec![branch(&[(1, 1)])],
        };
        let err = histories.current().unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_check_version_outcomes() {
        let histories = VersionHistories::single(branch(&[(144, 333)]));
        assert_eq!(check_version(&histories, 144, 333).unwrap(), VersionCheck::Match);
        assert_eq!(
            check_version(&histories, 144, 334).unwrap(),
            VersionCheck::Mismatch { recorded: 333 }
        );
        assert_eq!(check_version(&histories, 145, 333).unwrap(), VersionCheck::Missing);
        assert!(check_version(&histories, 144, 333).unwrap().is_match());
    }

    #[test]
    fn test_contains_item_ranges() {
        let history = branch(&[(10, 1), (25, 3), (40, 7)]);

        assert!(history.contains_item(&item(1, 1)).unwrap());
        assert!(history.contains_item(&item(10, 1)).unwrap());
        assert!(!history.contains_item(&item(11, 1)).unwrap());

        assert!(history.contains_item(&item(11, 3)).unwrap());
        assert!(history.contains_item(&item(25, 3)).unwrap());
        assert!(!history.contains_item(&item(26, 3)).unwrap());

        assert!(history.contains_item(&item(40, 7)).unwrap());
        assert!(!history.contains_item(&item(41, 7)).unwrap());

        // Version never used on this branch
        assert!(!history.contains_item(&item(12, 2)).unwrap());
        assert!(!history.contains_item(&item(0, 1)).unwrap());
    }

    #[test]
    fn test_find_first_containing_diverged_branches() {
        // Both branches share events 1..=10 at v1, then diverge
        let histories = VersionHistories {
            current_version_history_index: 1,
            histories: vec![branch(&[(10, 1), (20, 2)]), branch(&[(10, 1), (15, 5)])],
        };

        assert_eq!(histories.find_first_containing(&item(5, 1)).unwrap(), Some(0));
        assert_eq!(histories.find_first_containing(&item(18, 2)).unwrap(), Some(0));
        assert_eq!(histories.find_first_containing(&item(12, 5)).unwrap(), Some(1));
        assert_eq!(histories.find_first_containing(&item(18, 5)).unwrap(), None);
    }

    #[test]
    fn test_serde_field_names() {
        let history = branch(&[(144, 333)]);
        let json = serde_json::to_value(&history).unwrap();
        assert_eq!(json["items"][0]["event_id"], 144);
        assert_eq!(json["items"][0]["version"], 333);
    }
}
