//! Read-side helpers over a cache snapshot: filtered lists, tag pickers and
//! the next sequential demand id.

use crate::errors::{AppError, AppResult};
use crate::models::{DemandRecord, DemandStatus};
use crate::order::sort_by_order;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

static DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("valid digits regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StatusTab {
    #[serde(rename = "TODAS")]
    All,
    #[default]
    #[serde(rename = "EM CURSO")]
    Active,
    #[serde(rename = "CONCLUÍDAS")]
    Completed,
    /// Weekly board; shows every status.
    #[serde(rename = "SEMANA")]
    Week,
}

impl StatusTab {
    pub fn admits(self, status: DemandStatus) -> bool {
        match self {
            Self::All | Self::Week => true,
            Self::Active => matches!(status, DemandStatus::Open | DemandStatus::InProgress),
            Self::Completed => status == DemandStatus::Completed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewFilter {
    pub tab: StatusTab,
    pub responsible: Option<String>,
    pub contract: Option<String>,
    /// Case-insensitive match on title or id.
    pub search: String,
}

impl ViewFilter {
    pub fn matches(&self, record: &DemandRecord) -> bool {
        let needle = self.search.to_lowercase();
        let matches_search = needle.is_empty()
            || record.title.to_lowercase().contains(&needle)
            || record.id.to_lowercase().contains(&needle);
        matches_search
            && self.tab.admits(record.status)
            && label_matches(self.responsible.as_deref(), record.responsible.as_deref())
            && label_matches(self.contract.as_deref(), record.contract.as_deref())
    }

    /// The visible subset, in display order.
    pub fn apply(&self, records: &[DemandRecord]) -> Vec<DemandRecord> {
        let mut visible = records
            .iter()
            .filter(|record| self.matches(record))
            .cloned()
            .collect::<Vec<_>>();
        sort_by_order(&mut visible);
        visible
    }
}

fn label_matches(wanted: Option<&str>, actual: Option<&str>) -> bool {
    match wanted.filter(|wanted| !wanted.is_empty()) {
        Some(wanted) => actual == Some(wanted),
        None => true,
    }
}

/// Distinct labels already in use, for the record form pickers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagOptions {
    pub requesters: Vec<String>,
    pub responsibles: Vec<String>,
    pub contracts: Vec<String>,
}

impl TagOptions {
    pub fn collect(records: &[DemandRecord]) -> Self {
        let distinct = |pick: fn(&DemandRecord) -> Option<&String>| {
            records
                .iter()
                .filter_map(pick)
                .filter(|label| !label.is_empty())
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect::<Vec<_>>()
        };
        Self {
            requesters: distinct(|record| record.requester.as_ref()),
            responsibles: distinct(|record| record.responsible.as_ref()),
            contracts: distinct(|record| record.contract.as_ref()),
        }
    }
}

/// `DEM-` followed by the highest number found in any id plus one.
///
/// Fails once an id already carries `u64::MAX`.
pub fn next_demand_id(records: &[DemandRecord]) -> AppResult<String> {
    let max = records
        .iter()
        .filter_map(|record| DIGITS.find(&record.id))
        .filter_map(|digits| digits.as_str().parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    let next = max
        .checked_add(1)
        .ok_or_else(|| AppError::InvalidState(format!("no demand id left after DEM-{}", max)))?;
    Ok(format!("DEM-{:03}", next))
}
