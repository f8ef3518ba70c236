use std::collections::HashSet;

use crate::models::{PendingMessage, RoomMessage, TimelineEntry};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// Union of server history and surviving local records, oldest first.
    pub timeline: Vec<TimelineEntry>,
    /// Local records the server already holds; their queue and blob entries
    /// should be removed by the caller.
    pub reaped: Vec<PendingMessage>,
}

/// Merges authoritative room history with locally pending records.
///
/// Identity is the server id, or the temporary id the server echoes back for
/// client-originated messages. When both sides hold the same message the server
/// copy wins. The result is sorted by creation time with a stable sort, so
/// repeated calls over the same inputs yield the same order.
pub fn merge_room_history(server: &[RoomMessage], pending: &[PendingMessage]) -> MergeOutcome {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut timeline = Vec::with_capacity(server.len() + pending.len());

    for message in server {
        if seen.insert(message.id.as_str()) {
            timeline.push(TimelineEntry::Confirmed(message.clone()));
        }
    }

    let known: HashSet<&str> = server
        .iter()
        .flat_map(|message| std::iter::once(message.id.as_str()).chain(message.temporary_id.as_deref()))
        .collect();

    let mut reaped = Vec::new();
    for record in pending {
        if known.contains(record.temporary_id.as_str()) || known.contains(record.canonical_id.as_str()) {
            reaped.push(record.clone());
            continue;
        }
        if seen.insert(record.temporary_id.as_str()) {
            timeline.push(TimelineEntry::Local(record.clone()));
        }
    }

    timeline.sort_by_key(|entry| entry.created_at());

    MergeOutcome { timeline, reaped }
}
