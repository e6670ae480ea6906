//! List request parameters and the paginated result envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

use crate::entities::Collection;
use crate::filter::compare_values;

pub const DEFAULT_PER_PAGE: u32 = 30;
pub const MAX_PER_PAGE: u32 = 1000;

/// Query string of `GET /api/collections/{collection}/records`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub sort: Option<String>,
    pub filter: Option<String>,
    pub expand: Option<String>,
    pub skip_total: Option<bool>,
}

impl ListParams {
    pub fn page(&self) -> u32 {
        self.page.filter(|p| *p > 0).unwrap_or(1)
    }

    pub fn per_page(&self) -> u32 {
        match self.per_page {
            Some(0) | None => DEFAULT_PER_PAGE,
            Some(n) => n.min(MAX_PER_PAGE),
        }
    }
}

/// One page of a list. `revision` is the store revision the page was read at;
/// client stores ignore pushed events at or below it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResult<T> {
    pub page: u32,
    pub per_page: u32,
    pub total_items: i64,
    pub total_pages: i64,
    pub items: Vec<T>,
    #[serde(default)]
    pub revision: u64,
}

impl<T> ListResult<T> {
    /// Convert the items, keeping paging and revision.
    pub fn try_map<U, E>(self, f: impl FnMut(T) -> Result<U, E>) -> Result<ListResult<U>, E> {
        Ok(ListResult {
            page: self.page,
            per_page: self.per_page,
            total_items: self.total_items,
            total_pages: self.total_pages,
            items: self.items.into_iter().map(f).collect::<Result<_, _>>()?,
            revision: self.revision,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryError(pub String);

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for QueryError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

/// `-created,title` → [created desc, title asc]. Unknown fields are rejected.
pub fn parse_sort(spec: &str, collection: Collection) -> Result<Vec<SortKey>, QueryError> {
    let allowed = collection.sortable_fields();
    let mut keys = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (field, descending) = match part.strip_prefix('-') {
            Some(rest) => (rest, true),
            None => (part.strip_prefix('+').unwrap_or(part), false),
        };
        if !allowed.contains(&field) {
            return Err(QueryError(format!("invalid sort field `{field}` for {collection}")));
        }
        keys.push(SortKey { field: field.to_string(), descending });
    }
    Ok(keys)
}

/// Stable sort of record JSON by the given keys; ties fall back to `id`.
pub fn sort_records(items: &mut [Value], keys: &[SortKey]) {
    items.sort_by(|a, b| {
        for key in keys {
            let ord = compare_values(&a[key.field.as_str()], &b[key.field.as_str()]);
            let ord = if key.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        compare_values(&a["id"], &b["id"])
    });
}

/// Cut one page out of the full, already sorted result.
pub fn paginate<T>(items: Vec<T>, page: u32, per_page: u32, skip_total: bool, revision: u64) -> ListResult<T> {
    let total = items.len() as i64;
    let start = (page.saturating_sub(1) as usize).saturating_mul(per_page as usize);
    let items: Vec<T> = items.into_iter().skip(start).take(per_page as usize).collect();
    let (total_items, total_pages) = if skip_total {
        (-1, -1)
    } else {
        (total, (total + per_page as i64 - 1) / per_page as i64)
    };
    ListResult { page, per_page, total_items, total_pages, items, revision }
}

// ── Tests ──────────────────────────────────────────────────────
