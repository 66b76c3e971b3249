//! Records → response tree

use super::{JsonObject, RecordSource};
use crate::error::CacheMiss;
use crate::resolver::{CacheResolver, ResolverContext};
use crate::selection::{collect_fields, CollectedField, Selection, Variables};
use crate::{CacheError, Result};
use graphcache_records::{CacheKey, Value};
use std::collections::BTreeMap;

/// Rebuilds response data from records
///
/// Fails fast: the first missing field or record, in selection order, is
/// returned as [`CacheError::Miss`].
pub struct Denormalizer<'a> {
    source: &'a dyn RecordSource,
    resolver: &'a dyn CacheResolver,
    variables: &'a Variables,
}

impl<'a> Denormalizer<'a> {
    pub fn new(
        source: &'a dyn RecordSource,
        resolver: &'a dyn CacheResolver,
        variables: &'a Variables,
    ) -> Self {
        Self {
            source,
            resolver,
            variables,
        }
    }

    /// Read `selections` starting at the record `root_key`
    ///
    /// `root_type` is used when the record carries no `__typename`.
    pub fn read(
        &self,
        root_key: &CacheKey,
        selections: &[Selection],
        root_type: &str,
    ) -> Result<JsonObject> {
        let mut path = Vec::new();
        let record = self
            .source
            .load_record(root_key)?
            .ok_or_else(|| CacheMiss::record(root_key.clone(), Vec::new()))?;

        let typename = record
            .typename()
            .or(root_key.typename())
            .unwrap_or(root_type);
        let selections: Vec<&Selection> = selections.iter().collect();
        self.read_object(&record.key, &record.fields, &selections, typename, &mut path)
    }

    fn read_object(
        &self,
        key: &CacheKey,
        fields: &BTreeMap<String, Value>,
        selections: &[&Selection],
        typename: &str,
        path: &mut Vec<String>,
    ) -> Result<JsonObject> {
        let mut out = JsonObject::new();

        for collected in collect_fields(selections.iter().copied(), typename, self.variables) {
            path.push(collected.response_name().to_string());

            let ctx = ResolverContext {
                key,
                fields,
                field: collected.field,
                parent_type: typename,
                variables: self.variables,
                path: path.as_slice(),
            };
            let value = self.resolver.resolve(&ctx)?.ok_or_else(|| {
                CacheMiss::field(
                    key.clone(),
                    collected.field.storage_key(self.variables),
                    path.clone(),
                )
            })?;

            let json = self.read_value(key, &value, &collected, path)?;
            path.pop();
            out.insert(collected.response_name().to_string(), json);
        }

        Ok(out)
    }

    fn read_value(
        &self,
        key: &CacheKey,
        value: &Value,
        collected: &CollectedField<'_>,
        path: &mut Vec<String>,
    ) -> Result<serde_json::Value> {
        if !collected.is_composite() {
            return value
                .to_json()
                .ok_or_else(|| CacheError::type_mismatch(path, "scalar", value.kind()));
        }

        match value {
            Value::Null => Ok(serde_json::Value::Null),
            Value::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    path.push(index.to_string());
                    out.push(self.read_value(key, item, collected, path)?);
                    path.pop();
                }
                Ok(serde_json::Value::Array(out))
            }
            Value::Reference(target) => {
                let record = self
                    .source
                    .load_record(target)?
                    .ok_or_else(|| CacheMiss::record(target.clone(), path.clone()))?;
                let typename = record
                    .typename()
                    .or(target.typename())
                    .or(collected.field.type_name.as_deref())
                    .unwrap_or_default();
                let object = self.read_object(
                    &record.key,
                    &record.fields,
                    &collected.selections,
                    typename,
                    path,
                )?;
                Ok(serde_json::Value::Object(object))
            }
            Value::Object(fields) => {
                let typename = fields
                    .get("__typename")
                    .and_then(Value::as_str)
                    .or(collected.field.type_name.as_deref())
                    .unwrap_or_default();
                let object = self.read_object(key, fields, &collected.selections, typename, path)?;
                Ok(serde_json::Value::Object(object))
            }
            other => Err(CacheError::type_mismatch(path, "object", other.kind())),
        }
    }
}
