//! Record merge policies
//!
//! A [`RecordMerger`] combines an incoming record with the stored one and
//! reports exactly which fields changed. The changed set drives change
//! notifications, so it must neither over- nor under-report.
//!
//! - [`DefaultRecordMerger`]: incoming fields overwrite, absent fields are kept
//! - [`FieldPolicyRecordMerger`]: per-field [`FieldMerger`] overrides on top of
//!   the default behavior (e.g. [`AppendListMerger`] for pagination)

use crate::{qualified_key, ChangedKeys, Record, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Merges an incoming record into an existing one
pub trait RecordMerger: Send + Sync {
    /// Merge `incoming` into `existing`
    ///
    /// # Returns
    /// The merged record and the qualified keys of every field whose value
    /// is new or structurally different
    fn merge(&self, existing: Option<&Record>, incoming: Record) -> (Record, ChangedKeys);
}

/// Field presence in the incoming record wins; other fields are left untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRecordMerger;

impl RecordMerger for DefaultRecordMerger {
    fn merge(&self, existing: Option<&Record>, incoming: Record) -> (Record, ChangedKeys) {
        merge_fields(existing, incoming, |_, _, incoming| incoming)
    }
}

/// Combines the stored and incoming value of a single field
pub trait FieldMerger: Send + Sync {
    fn merge_field(&self, existing: &Value, incoming: Value) -> Value;
}

/// Appends incoming list items to the stored list
///
/// Non-list values fall back to overwriting.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendListMerger;

impl FieldMerger for AppendListMerger {
    fn merge_field(&self, existing: &Value, incoming: Value) -> Value {
        match (existing, incoming) {
            (Value::List(old), Value::List(new)) => {
                let mut items = old.clone();
                items.extend(new);
                Value::List(items)
            }
            (_, incoming) => incoming,
        }
    }
}

/// Default merge semantics with per-field overrides
///
/// Overrides are looked up by field name, i.e. the storage key without its
/// argument suffix, so `friends({"first":10})` uses the policy for `friends`.
#[derive(Clone, Default)]
pub struct FieldPolicyRecordMerger {
    policies: HashMap<String, Arc<dyn FieldMerger>>,
}

impl FieldPolicyRecordMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `merger` for every field named `field_name`
    pub fn with_field(
        mut self,
        field_name: impl Into<String>,
        merger: impl FieldMerger + 'static,
    ) -> Self {
        self.policies.insert(field_name.into(), Arc::new(merger));
        self
    }

    /// Whether any override is registered for `field_name`
    pub fn has_policy(&self, field_name: &str) -> bool {
        self.policies.contains_key(field_name)
    }
}

impl std::fmt::Debug for FieldPolicyRecordMerger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut fields: Vec<_> = self.policies.keys().collect();
        fields.sort();
        f.debug_struct("FieldPolicyRecordMerger")
            .field("fields", &fields)
            .finish()
    }
}

impl RecordMerger for FieldPolicyRecordMerger {
    fn merge(&self, existing: Option<&Record>, incoming: Record) -> (Record, ChangedKeys) {
        merge_fields(existing, incoming, |storage_key, old, new| {
            match self.policies.get(field_name(storage_key)) {
                Some(policy) => policy.merge_field(old, new),
                None => new,
            }
        })
    }
}

/// Field name part of a storage key: `hero({"episode":"JEDI"})` → `hero`
pub fn field_name(storage_key: &str) -> &str {
    storage_key
        .split_once('(')
        .map_or(storage_key, |(name, _)| name)
}

fn merge_fields<F>(existing: Option<&Record>, incoming: Record, combine: F) -> (Record, ChangedKeys)
where
    F: Fn(&str, &Value, Value) -> Value,
{
    let Some(existing) = existing else {
        let changed = incoming.field_keys();
        return (incoming, changed);
    };

    let mut merged = existing.clone();
    merged.key = incoming.key;
    let mut changed = ChangedKeys::new();

    for (field, value) in incoming.fields {
        let value = match merged.fields.get(&field) {
            Some(old) => {
                let value = combine(&field, old, value);
                if *old == value {
                    continue;
                }
                value
            }
            None => value,
        };
        changed.insert(qualified_key(&merged.key, &field));
        merged.fields.insert(field, value);
    }

    (merged, changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheKey;
    use std::collections::BTreeMap;

    fn record(fields: &[(&str, Value)]) -> Record {
        let mut record = Record::new(CacheKey::new("Human:1000"));
        for (k, v) in fields {
            record.insert(*k, v.clone());
        }
        record
    }

    #[test]
    fn test_merge_into_nothing_changes_every_field() {
        let incoming = record(&[("name", Value::from("Luke")), ("id", Value::from("1000"))]);
        let (merged, changed) = DefaultRecordMerger.merge(None, incoming.clone());
        assert_eq!(merged, incoming);
        assert_eq!(changed, incoming.field_keys());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let incoming = record(&[("name", Value::from("Luke"))]);
        let (merged, _) = DefaultRecordMerger.merge(None, incoming.clone());
        let (again, changed) = DefaultRecordMerger.merge(Some(&merged), incoming);
        assert!(changed.is_empty());
        assert_eq!(again, merged);
    }

    #[test]
    fn test_merge_reports_exactly_the_changed_field() {
        let existing = record(&[
            ("name", Value::from("Luke")),
            ("homePlanet", Value::from("Tatooine")),
        ]);
        let incoming = record(&[
            ("name", Value::from("Luke")),
            ("homePlanet", Value::from("Dagobah")),
        ]);
        let (merged, changed) = DefaultRecordMerger.merge(Some(&existing), incoming);
        assert_eq!(changed.len(), 1);
        assert!(changed.contains("Human:1000.homePlanet"));
        assert_eq!(merged.get("homePlanet"), Some(&Value::from("Dagobah")));
    }

    #[test]
    fn test_absent_fields_are_untouched() {
        let existing = record(&[("name", Value::from("Luke")), ("mass", Value::from(77_i64))]);
        let incoming = record(&[("name", Value::from("Luke Skywalker"))]);
        let (merged, changed) = DefaultRecordMerger.merge(Some(&existing), incoming);
        assert_eq!(merged.get("mass"), Some(&Value::from(77_i64)));
        assert_eq!(changed.len(), 1);
    }

    #[test]
    fn test_nested_structural_equality() {
        let mut inner = BTreeMap::new();
        inner.insert("lat".to_string(), Value::from(1_i64));
        let existing = record(&[("position", Value::Object(inner.clone()))]);

        let (_, changed) =
            DefaultRecordMerger.merge(Some(&existing), record(&[("position", Value::Object(inner.clone()))]));
        assert!(changed.is_empty());

        inner.insert("lat".to_string(), Value::from(2_i64));
        let (_, changed) =
            DefaultRecordMerger.merge(Some(&existing), record(&[("position", Value::Object(inner))]));
        assert!(changed.contains("Human:1000.position"));
    }

    #[test]
    fn test_append_list_policy() {
        let merger = FieldPolicyRecordMerger::new().with_field("friends", AppendListMerger);
        assert!(merger.has_policy("friends"));

        let existing = record(&[(
            "friends({\"first\":2})",
            Value::List(vec![Value::from(CacheKey::new("Human:1"))]),
        )]);
        let incoming = record(&[
            (
                "friends({\"first\":2})",
                Value::List(vec![Value::from(CacheKey::new("Human:2"))]),
            ),
            ("name", Value::from("Luke")),
        ]);

        let (merged, changed) = merger.merge(Some(&existing), incoming);
        assert_eq!(
            merged.get("friends({\"first\":2})"),
            Some(&Value::List(vec![
                Value::from(CacheKey::new("Human:1")),
                Value::from(CacheKey::new("Human:2")),
            ]))
        );
        assert_eq!(changed.len(), 2);
    }

    #[test]
    fn test_append_of_empty_page_is_not_a_change() {
        let merger = FieldPolicyRecordMerger::new().with_field("friends", AppendListMerger);
        let existing = record(&[("friends", Value::List(vec![Value::from("a")]))]);
        let incoming = record(&[("friends", Value::List(vec![]))]);
        let (_, changed) = merger.merge(Some(&existing), incoming);
        assert!(changed.is_empty());
    }

    #[test]
    fn test_field_name() {
        assert_eq!(field_name("hero"), "hero");
        assert_eq!(field_name("hero({\"episode\":\"JEDI\"})"), "hero");
    }
}
