//! Cache key resolution
//!
//! Maps an object in a response to the [`CacheKey`] of its record, or to
//! `None` to embed it inside its parent.

use crate::Result;
use graphcache_records::CacheKey;
use std::collections::{BTreeMap, HashMap};

/// What a key resolver sees of an object being normalized
#[derive(Debug, Clone)]
pub struct KeyContext<'a> {
    /// Runtime typename of the object
    pub typename: &'a str,

    /// Selected fields available at this position, by field name (not alias)
    pub fields: BTreeMap<&'a str, &'a serde_json::Value>,

    /// Storage-key path from the operation root
    pub path: &'a [String],
}

/// Policy mapping typed objects to cache keys
pub trait CacheKeyResolver: Send + Sync {
    /// Resolve the key of an object
    ///
    /// # Returns
    /// `Ok(None)` to embed the object in its parent record
    fn resolve(&self, ctx: &KeyContext<'_>) -> Result<Option<CacheKey>>;
}

impl<F> CacheKeyResolver for F
where
    F: Fn(&KeyContext<'_>) -> Result<Option<CacheKey>> + Send + Sync,
{
    fn resolve(&self, ctx: &KeyContext<'_>) -> Result<Option<CacheKey>> {
        self(ctx)
    }
}

/// Keys objects by declared key fields per type
///
/// An object of a type with key fields `[id]` is stored as `Typename:<id>`.
/// Types without a policy, and objects that do not carry every key field with a
/// scalar value, are embedded.
#[derive(Debug, Clone, Default)]
pub struct TypePolicyKeyResolver {
    key_fields: HashMap<String, Vec<String>>,
}

impl TypePolicyKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a map of typename → key field names
    pub fn from_policies(policies: HashMap<String, Vec<String>>) -> Self {
        Self {
            key_fields: policies,
        }
    }

    /// Declare the key fields of a type
    pub fn with_type_policy<I, S>(mut self, typename: impl Into<String>, key_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_fields.insert(
            typename.into(),
            key_fields.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Declared key fields of a type
    pub fn key_fields(&self, typename: &str) -> Option<&[String]> {
        self.key_fields.get(typename).map(Vec::as_slice)
    }
}

impl CacheKeyResolver for TypePolicyKeyResolver {
    fn resolve(&self, ctx: &KeyContext<'_>) -> Result<Option<CacheKey>> {
        let Some(key_fields) = self.key_fields.get(ctx.typename) else {
            return Ok(None);
        };

        let mut values = Vec::with_capacity(key_fields.len());
        for name in key_fields {
            match ctx.fields.get(name.as_str()).and_then(|v| key_part(v)) {
                Some(part) => values.push(part),
                None => {
                    tracing::debug!(
                        typename = ctx.typename,
                        key_field = %name,
                        path = %ctx.path.join("."),
                        "Key field not available, embedding object"
                    );
                    return Ok(None);
                }
            }
        }

        Ok(Some(CacheKey::typed(ctx.typename, values)))
    }
}

/// String form of a scalar used as part of a key; `None` for null and composites
pub(crate) fn key_part(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolve(
        resolver: &dyn CacheKeyResolver,
        typename: &str,
        object: &serde_json::Value,
    ) -> Option<CacheKey> {
        let fields = object
            .as_object()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .collect();
        let ctx = KeyContext {
            typename,
            fields,
            path: &[],
        };
        resolver.resolve(&ctx).unwrap()
    }

    #[test]
    fn test_declared_key_fields() {
        let resolver = TypePolicyKeyResolver::new().with_type_policy("Human", ["id"]);
        let key = resolve(&resolver, "Human", &json!({"id": "1000", "name": "Luke"}));
        assert_eq!(key, Some(CacheKey::new("Human:1000")));
    }

    #[test]
    fn test_composite_key_fields() {
        let resolver = TypePolicyKeyResolver::new().with_type_policy("Book", ["isbn", "edition"]);
        let key = resolve(&resolver, "Book", &json!({"isbn": "abc", "edition": 2}));
        assert_eq!(key, Some(CacheKey::new("Book:abc+2")));
    }

    #[test]
    fn test_undeclared_type_embeds() {
        let resolver = TypePolicyKeyResolver::new().with_type_policy("Human", ["id"]);
        assert_eq!(resolve(&resolver, "Starship", &json!({"id": "3000"})), None);
    }

    #[test]
    fn test_missing_or_null_key_field_embeds() {
        let resolver = TypePolicyKeyResolver::new().with_type_policy("Human", ["id"]);
        assert_eq!(resolve(&resolver, "Human", &json!({"name": "Luke"})), None);
        assert_eq!(resolve(&resolver, "Human", &json!({"id": null})), None);
        assert_eq!(resolve(&resolver, "Human", &json!({"id": {"nested": 1}})), None);
    }

    #[test]
    fn test_closure_resolver() {
        let resolver = |ctx: &KeyContext<'_>| -> Result<Option<CacheKey>> {
            Ok(ctx
                .fields
                .get("uuid")
                .and_then(|v| v.as_str())
                .map(CacheKey::new))
        };
        let key = resolve(&resolver, "Anything", &json!({"uuid": "u-1"}));
        assert_eq!(key, Some(CacheKey::new("u-1")));
    }
}
