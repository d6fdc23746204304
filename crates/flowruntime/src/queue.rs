//! Queue ordering: highest priority first, then oldest, never an item
//! scheduled in the future.

use chrono::{DateTime, Utc};
use flowcore::{ExecutionId, ExecutionQueueItem};
use std::cmp::Ordering;

/// Dispatch order between two ready items.
pub fn dispatch_order(a: &ExecutionQueueItem, b: &ExecutionQueueItem) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
}

/// The execution whose queue item should be claimed next, if any.
pub fn pick_next<'a>(
    items: impl IntoIterator<Item = &'a ExecutionQueueItem>,
    now: DateTime<Utc>,
) -> Option<ExecutionId> {
    items
        .into_iter()
        .filter(|item| item.is_ready(now))
        .min_by(|a, b| dispatch_order(a, b))
        .map(|item| item.execution_id)
}
