//! Manual ordering used by the table, kanban and list views.

use crate::models::DemandRecord;
use std::collections::BTreeMap;

/// One renumbering write produced by a reorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderUpdate {
    pub id: String,
    pub order: i64,
}

/// A group of records sharing the same `order` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTie {
    pub order: i64,
    pub ids: Vec<String>,
}

/// Stable ascending sort by `order`; equal values keep their relative position.
pub fn sort_by_order(records: &mut [DemandRecord]) {
    records.sort_by_key(|record| record.order);
}

pub fn sorted(records: &[DemandRecord]) -> Vec<DemandRecord> {
    let mut records = records.to_vec();
    sort_by_order(&mut records);
    records
}

/// Order assigned to a newly created record.
pub fn next_order(collection_size: usize) -> i64 {
    i64::try_from(collection_size).unwrap_or(i64::MAX)
}

/// Moves `dragged` immediately before `target` within `visible` and renumbers
/// the visible subset from zero.
///
/// Only records whose order actually changes are returned. Records outside
/// `visible` are never touched, even when that leaves duplicate orders behind.
/// Returns `None` when either id is not visible or both are the same record.
pub fn plan_reorder(visible: &[DemandRecord], dragged: &str, target: &str) -> Option<Vec<OrderUpdate>> {
    if dragged == target {
        return None;
    }
    let mut sequence = sorted(visible);
    let from = sequence.iter().position(|record| record.id == dragged)?;
    if !sequence.iter().any(|record| record.id == target) {
        return None;
    }
    let moved = sequence.remove(from);
    let to = sequence.iter().position(|record| record.id == target)?;
    sequence.insert(to, moved);

    Some(
        sequence
            .iter()
            .enumerate()
            .filter_map(|(index, record)| {
                let order = index as i64;
                (record.order != order).then(|| OrderUpdate {
                    id: record.id.clone(),
                    order,
                })
            })
            .collect(),
    )
}

/// Applies planned updates to a local copy, for previews and tests.
pub fn apply_updates(records: &mut [DemandRecord], updates: &[OrderUpdate]) {
    for update in updates {
        if let Some(record) = records.iter_mut().find(|record| record.id == update.id) {
            record.order = update.order;
        }
    }
    sort_by_order(records);
}

/// Duplicate `order` values across the loaded records.
pub fn detect_drift(records: &[DemandRecord]) -> Vec<OrderTie> {
    let mut by_order: BTreeMap<i64, Vec<String>> = BTreeMap::new();
    for record in records {
        by_order.entry(record.order).or_default().push(record.id.clone());
    }
    by_order
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(order, ids)| OrderTie { order, ids })
        .collect()
}
