//! Fuzz target for version history lookups.
//!
//! This tests that branch lookups never panic, whatever the checkpoints look
//! like (unordered, duplicated, negative), and that malformed branches are
//! rejected instead of searched.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replication_task_processor::version_history::check_version;
use replication_task_processor::{VersionHistories, VersionHistory, VersionHistoryItem};

fuzz_target!(|data: (Vec<(i64, i64)>, usize, i64, i64)| {
    let (checkpoints, current, event_id, version) = data;

    let items: Vec<VersionHistoryItem> = checkpoints
        .iter()
        .map(|&(e, v)| VersionHistoryItem::new(e, v))
        .collect();
    let branch = VersionHistory::new(b"fuzz".to_vec(), items);
    let valid = branch.validate().is_ok();

    let probe = VersionHistoryItem::new(event_id, version);
    let contained = branch.contains_item(&probe);
    let exact = branch.version_at(event_id);
    assert_eq!(contained.is_ok(), valid);
    assert_eq!(exact.is_ok(), valid);

    let histories = VersionHistories {
        current_version_history_index: current % 3,
        histories: vec![branch],
    };
    let _ = histories.find_first_containing(&probe);
    let _ = check_version(&histories, event_id, version);
});
