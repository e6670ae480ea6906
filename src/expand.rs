//! `expand=assignees,departments` and dotted paths like `sender.roles`.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::entities::{Collection, Record};
use crate::world::World;

pub const MAX_DEPTH: usize = 6;

/// Target collection of a relation field and whether it holds many ids.
pub fn relation_target(collection: Collection, field: &str) -> Option<(Collection, bool)> {
    match (collection, field) {
        (Collection::Tasks, "assignees") => Some((Collection::Users, true)),
        (Collection::Tasks, "departments") => Some((Collection::Departments, true)),
        (Collection::Tasks, "createdBy" | "updatedBy") => Some((Collection::Users, false)),
        (Collection::Feedbacks, "sender") => Some((Collection::Users, false)),
        (Collection::Feedbacks, "task") => Some((Collection::Tasks, false)),
        (Collection::Users, "roles") => Some((Collection::Roles, true)),
        (Collection::OAuthSessions, "user") => Some((Collection::Users, false)),
        _ => None,
    }
}

/// Split `a,b.c` into paths, dropping segments past the depth limit.
pub fn parse_expand(spec: &str) -> Vec<Vec<String>> {
    spec.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| p.split('.').take(MAX_DEPTH).map(str::to_string).collect())
        .collect()
}

/// JSON view of `record` with the requested relations inlined under `expand`.
pub fn expand_record(world: &World, record: &Record, spec: Option<&str>) -> Value {
    let mut json = record.to_json();
    if let Some(spec) = spec {
        let paths = parse_expand(spec);
        if !paths.is_empty() {
            expand_value(world, record.collection(), &mut json, &paths);
        }
    }
    json
}

fn expand_value(world: &World, collection: Collection, json: &mut Value, paths: &[Vec<String>]) {
    // Group by first segment: `sender,sender.roles` → sender: [[], [roles]]
    let mut by_field: BTreeMap<&str, Vec<Vec<String>>> = BTreeMap::new();
    for path in paths {
        if let Some((first, rest)) = path.split_first() {
            let nested = by_field.entry(first.as_str()).or_default();
            if !rest.is_empty() {
                nested.push(rest.to_vec());
            }
        }
    }

    let mut expanded = Map::new();
    for (field, nested) in by_field {
        let Some((target, many)) = relation_target(collection, field) else {
            continue;
        };
        let ids: Vec<Uuid> = match &json[field] {
            Value::String(s) => s.parse().ok().into_iter().collect(),
            Value::Array(items) => items
                .iter()
                .filter_map(|v| v.as_str().and_then(|s| s.parse().ok()))
                .collect(),
            _ => Vec::new(),
        };

        let related: Vec<Value> = ids
            .into_iter()
            .filter_map(|id| world.get(target, id))
            .filter(|r| r.collection().is_public())
            .map(|r| {
                let mut value = r.to_json();
                if !nested.is_empty() {
                    expand_value(world, target, &mut value, &nested);
                }
                value
            })
            .collect();

        if many {
            if !related.is_empty() {
                expanded.insert(field.to_string(), Value::Array(related));
            }
        } else if let Some(first) = related.into_iter().next() {
            expanded.insert(field.to_string(), first);
        }
    }

    if !expanded.is_empty() {
        if let Value::Object(map) = json {
            map.insert("expand".to_string(), Value::Object(expanded));
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────
