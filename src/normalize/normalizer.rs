//! Response tree → records

use super::JsonObject;
use crate::resolver::{CacheKeyResolver, KeyContext};
use crate::selection::{collect_fields, CollectedField, Selection, Variables};
use crate::{CacheError, Result};
use graphcache_records::{CacheKey, Record, Value};
use std::collections::BTreeMap;

/// Flattens response data into records
///
/// Objects the key resolver identifies become their own record and are
/// replaced by a reference; all other objects are embedded in their parent.
pub struct Normalizer<'a> {
    key_resolver: &'a dyn CacheKeyResolver,
    variables: &'a Variables,
    records: BTreeMap<CacheKey, Record>,
}

impl<'a> Normalizer<'a> {
    pub fn new(key_resolver: &'a dyn CacheKeyResolver, variables: &'a Variables) -> Self {
        Self {
            key_resolver,
            variables,
            records: BTreeMap::new(),
        }
    }

    /// Normalize `data` selected by `selections` into records
    ///
    /// `data` is stored under `root_key` (always present in the result, even if
    /// empty), typed as `root_type`.
    pub fn normalize(
        mut self,
        data: &JsonObject,
        selections: &[Selection],
        root_key: CacheKey,
        root_type: &str,
    ) -> Result<BTreeMap<CacheKey, Record>> {
        let selections: Vec<&Selection> = selections.iter().collect();
        let mut path = Vec::new();
        let fields = self.build_fields(data, &selections, root_type, &mut path)?;
        self.add_record(root_key, fields);

        tracing::trace!(records = self.records.len(), "Normalized response");
        Ok(self.records)
    }

    fn build_fields(
        &mut self,
        object: &JsonObject,
        selections: &[&Selection],
        typename: &str,
        path: &mut Vec<String>,
    ) -> Result<BTreeMap<String, Value>> {
        let mut fields = BTreeMap::new();

        for collected in collect_fields(selections.iter().copied(), typename, self.variables) {
            // Fields absent from the data (e.g. deferred or skipped) are not written
            let Some(json) = object.get(collected.response_name()) else {
                continue;
            };

            let storage_key = collected.field.storage_key(self.variables);
            path.push(storage_key.clone());
            let value = self.normalize_value(json, &collected, path)?;
            path.pop();

            let value = match fields.remove(&storage_key) {
                Some(existing) => merge_values(existing, value),
                None => value,
            };
            fields.insert(storage_key, value);
        }

        Ok(fields)
    }

    fn normalize_value(
        &mut self,
        json: &serde_json::Value,
        collected: &CollectedField<'_>,
        path: &mut Vec<String>,
    ) -> Result<Value> {
        if !collected.is_composite() {
            return Ok(Value::from_json(json));
        }

        match json {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    path.push(index.to_string());
                    values.push(self.normalize_value(item, collected, path)?);
                    path.pop();
                }
                Ok(Value::List(values))
            }
            serde_json::Value::Object(object) => self.normalize_object(object, collected, path),
            other => Err(CacheError::type_mismatch(path, "object", json_kind(other))),
        }
    }

    fn normalize_object(
        &mut self,
        object: &JsonObject,
        collected: &CollectedField<'_>,
        path: &mut Vec<String>,
    ) -> Result<Value> {
        let typename = object
            .get("__typename")
            .and_then(serde_json::Value::as_str)
            .or(collected.field.type_name.as_deref())
            .unwrap_or_default();

        let fields = self.build_fields(object, &collected.selections, typename, path)?;

        let key_fields = collect_fields(collected.selections.iter().copied(), typename, self.variables)
            .into_iter()
            .filter_map(|c| {
                object
                    .get(c.response_name())
                    .map(|value| (c.field.name.as_str(), value))
            })
            .collect();
        let ctx = KeyContext {
            typename,
            fields: key_fields,
            path: path.as_slice(),
        };

        let key = match self.key_resolver.resolve(&ctx) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(
                    typename,
                    path = %path.join("."),
                    error = %e,
                    "Cache key resolution failed, embedding object"
                );
                None
            }
        };

        match key {
            Some(key) if key.is_root() || key.as_str().is_empty() => Err(CacheError::Resolver(
                format!(
                    "key resolver returned '{}' for a nested {} at {}",
                    key,
                    typename,
                    path.join(".")
                ),
            )),
            Some(key) => {
                self.add_record(key.clone(), fields);
                Ok(Value::Reference(key))
            }
            None => Ok(Value::Object(fields)),
        }
    }

    /// Add a record, combining it with an earlier occurrence of the same entity
    fn add_record(&mut self, key: CacheKey, fields: BTreeMap<String, Value>) {
        match self.records.get_mut(&key) {
            Some(existing) => {
                for (name, value) in fields {
                    let value = match existing.fields.remove(&name) {
                        Some(old) => merge_values(old, value),
                        None => value,
                    };
                    existing.fields.insert(name, value);
                }
            }
            None => {
                self.records.insert(key.clone(), Record::with_fields(key, fields));
            }
        }
    }
}

/// Combine two values written to the same place in one response
///
/// Embedded objects (and same-length lists of them) are merged so that two
/// aliases selecting different sub-fields both end up stored.
fn merge_values(existing: Value, incoming: Value) -> Value {
    match (existing, incoming) {
        (Value::Object(mut old), Value::Object(new)) => {
            for (name, value) in new {
                let value = match old.remove(&name) {
                    Some(previous) => merge_values(previous, value),
                    None => value,
                };
                old.insert(name, value);
            }
            Value::Object(old)
        }
        (Value::List(old), Value::List(new)) if old.len() == new.len() => Value::List(
            old.into_iter()
                .zip(new)
                .map(|(a, b)| merge_values(a, b))
                .collect(),
        ),
        (_, incoming) => incoming,
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "list",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::TypePolicyKeyResolver;
    use crate::selection::{CompiledArgument, CompiledField};
    use serde_json::json;

    fn resolver() -> TypePolicyKeyResolver {
        TypePolicyKeyResolver::new()
            .with_type_policy("Human", ["id"])
            .with_type_policy("Droid", ["id"])
    }

    fn object(value: serde_json::Value) -> JsonObject {
        value.as_object().cloned().unwrap()
    }

    fn hero_selections() -> Vec<Selection> {
        vec![CompiledField::object("hero", "Character")
            .with_selections(vec![
                Selection::field("__typename"),
                Selection::field("id"),
                Selection::field("name"),
            ])
            .into()]
    }

    fn normalize(
        data: serde_json::Value,
        selections: &[Selection],
        variables: &Variables,
    ) -> BTreeMap<CacheKey, Record> {
        let resolver = resolver();
        Normalizer::new(&resolver, variables)
            .normalize(&object(data), selections, CacheKey::root(), "Query")
            .unwrap()
    }

    #[test]
    fn test_hero_is_normalized_into_its_own_record() {
        let records = normalize(
            json!({"hero": {"__typename": "Human", "id": "1000", "name": "Luke"}}),
            &hero_selections(),
            &Variables::new(),
        );

        assert_eq!(records.len(), 2);
        let root = &records[&CacheKey::root()];
        assert_eq!(
            root.get("hero"),
            Some(&Value::Reference(CacheKey::new("Human:1000")))
        );

        let luke = &records[&CacheKey::new("Human:1000")];
        assert_eq!(luke.get("__typename"), Some(&Value::from("Human")));
        assert_eq!(luke.get("id"), Some(&Value::from("1000")));
        assert_eq!(luke.get("name"), Some(&Value::from("Luke")));
    }

    #[test]
    fn test_objects_without_key_are_embedded() {
        let records = normalize(
            json!({"hero": {"__typename": "Wookiee", "id": "9", "name": "Chewie"}}),
            &hero_selections(),
            &Variables::new(),
        );
        assert_eq!(records.len(), 1);
        let Some(Value::Object(hero)) = records[&CacheKey::root()].get("hero") else {
            panic!("expected embedded hero");
        };
        assert_eq!(hero.get("name"), Some(&Value::from("Chewie")));
    }

    #[test]
    fn test_unselected_key_field_falls_back_to_embedding() {
        let selections = vec![CompiledField::object("hero", "Human")
            .with_selections(vec![Selection::field("name")])
            .into()];
        let records = normalize(json!({"hero": {"name": "Luke"}}), &selections, &Variables::new());
        assert!(matches!(
            records[&CacheKey::root()].get("hero"),
            Some(Value::Object(_))
        ));
    }

    #[test]
    fn test_failing_resolver_falls_back_to_embedding() {
        let failing = |_: &KeyContext<'_>| -> Result<Option<CacheKey>> {
            Err(CacheError::Resolver("boom".to_string()))
        };
        let vars = Variables::new();
        let records = Normalizer::new(&failing, &vars)
            .normalize(
                &object(json!({"hero": {"__typename": "Human", "id": "1", "name": "Luke"}})),
                &hero_selections(),
                CacheKey::root(),
                "Query",
            )
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_nested_root_key_is_rejected() {
        let rooted = |_: &KeyContext<'_>| -> Result<Option<CacheKey>> { Ok(Some(CacheKey::root())) };
        let vars = Variables::new();
        let err = Normalizer::new(&rooted, &vars)
            .normalize(
                &object(json!({"hero": {"__typename": "Human", "id": "1"}})),
                &hero_selections(),
                CacheKey::root(),
                "Query",
            )
            .unwrap_err();
        assert!(matches!(err, CacheError::Resolver(_)));
    }

    #[test]
    fn test_argument_sensitive_storage_keys() {
        let height = |unit: &str| -> Selection {
            CompiledField::new("height")
                .with_alias(unit.to_lowercase())
                .with_argument(CompiledArgument::literal("unit", json!(unit)))
                .into()
        };
        let selections = vec![CompiledField::object("hero", "Human")
            .with_selections(vec![Selection::field("id"), height("FOOT"), height("METER")])
            .into()];

        let records = normalize(
            json!({"hero": {"id": "1000", "foot": 5.9, "meter": 1.8}}),
            &selections,
            &Variables::new(),
        );

        let luke = &records[&CacheKey::new("Human:1000")];
        assert_eq!(
            luke.get(r#"height({"unit":"FOOT"})"#),
            Some(&Value::Number(serde_json::Number::from_f64(5.9).unwrap()))
        );
        assert_eq!(
            luke.get(r#"height({"unit":"METER"})"#),
            Some(&Value::Number(serde_json::Number::from_f64(1.8).unwrap()))
        );
        assert!(luke.get("height").is_none());
    }

    #[test]
    fn test_heterogeneous_list_keying() {
        let selections = vec![CompiledField::object("characters", "Character")
            .with_selections(vec![Selection::field("__typename"), Selection::field("id")])
            .into()];
        let records = normalize(
            json!({"characters": [
                {"__typename": "Human", "id": "1000"},
                {"__typename": "Ewok", "id": "7"},
                null
            ]}),
            &selections,
            &Variables::new(),
        );

        let Some(Value::List(items)) = records[&CacheKey::root()].get("characters") else {
            panic!("expected list");
        };
        assert_eq!(items[0], Value::Reference(CacheKey::new("Human:1000")));
        assert!(matches!(items[1], Value::Object(_)));
        assert_eq!(items[2], Value::Null);
    }

    #[test]
    fn test_unselected_subtype_data_is_dropped() {
        let selections = vec![CompiledField::object("hero", "Character")
            .with_selections(vec![
                Selection::field("__typename"),
                Selection::field("id"),
                Selection::fragment(["Droid"], vec![Selection::field("primaryFunction")]),
            ])
            .into()];
        let records = normalize(
            json!({"hero": {"__typename": "Human", "id": "1000", "primaryFunction": "x", "extra": 1}}),
            &selections,
            &Variables::new(),
        );
        let luke = &records[&CacheKey::new("Human:1000")];
        assert_eq!(luke.fields.len(), 2);
    }

    #[test]
    fn test_nested_lists_of_entities() {
        let friend = CompiledField::object("friends", "Character").with_selections(vec![
            Selection::field("__typename"),
            Selection::field("id"),
            Selection::field("name"),
        ]);
        let selections = vec![CompiledField::object("hero", "Character")
            .with_selections(vec![
                Selection::field("__typename"),
                Selection::field("id"),
                friend.into(),
            ])
            .into()];

        let records = normalize(
            json!({"hero": {
                "__typename": "Human", "id": "1000",
                "friends": [{"__typename": "Human", "id": "1002", "name": "Han"}]
            }}),
            &selections,
            &Variables::new(),
        );
        assert_eq!(records.len(), 3);
        let han = &records[&CacheKey::new("Human:1002")];
        assert_eq!(han.get("name"), Some(&Value::from("Han")));
    }

    #[test]
    fn test_aliases_to_same_storage_key_are_merged() {
        let selections = vec![
            CompiledField::object("hero", "Character")
                .with_alias("a")
                .with_selections(vec![Selection::field("name")])
                .into(),
            CompiledField::object("hero", "Character")
                .with_alias("b")
                .with_selections(vec![Selection::field("appearsIn")])
                .into(),
        ];
        let records = normalize(
            json!({"a": {"name": "R2"}, "b": {"appearsIn": ["NEWHOPE"]}}),
            &selections,
            &Variables::new(),
        );
        let Some(Value::Object(hero)) = records[&CacheKey::root()].get("hero") else {
            panic!("expected embedded hero");
        };
        assert_eq!(hero.len(), 2);
    }

    #[test]
    fn test_normalization_is_deterministic() {
        let data = json!({"hero": {"__typename": "Human", "id": "1000", "name": "Luke"}});
        let first = normalize(data.clone(), &hero_selections(), &Variables::new());
        let second = normalize(data, &hero_selections(), &Variables::new());
        for (key, record) in &first {
            assert_eq!(record.to_blob().unwrap(), second[key].to_blob().unwrap());
        }
    }

    #[test]
    fn test_scalar_where_object_expected() {
        let resolver = resolver();
        let vars = Variables::new();
        let err = Normalizer::new(&resolver, &vars)
            .normalize(&object(json!({"hero": "Luke"})), &hero_selections(), CacheKey::root(), "Query")
            .unwrap_err();
        assert!(matches!(err, CacheError::TypeMismatch { .. }));
    }
}
