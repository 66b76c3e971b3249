//! Read-time field resolution

use super::key_part;
use crate::selection::{CompiledField, Variables};
use crate::{CacheError, Result};
use graphcache_records::{CacheKey, Value};
use std::collections::{BTreeMap, HashMap};

/// What a cache resolver sees of the field being read
#[derive(Debug, Clone, Copy)]
pub struct ResolverContext<'a> {
    /// Key of the record owning the fields (for embedded objects, the enclosing record)
    pub key: &'a CacheKey,

    /// Fields of the object being read
    pub fields: &'a BTreeMap<String, Value>,

    pub field: &'a CompiledField,

    /// Runtime typename of the object being read
    pub parent_type: &'a str,

    pub variables: &'a Variables,

    /// Response path to this field
    pub path: &'a [String],
}

/// Policy producing the raw stored value of a field during a read
pub trait CacheResolver: Send + Sync {
    /// Resolve a field
    ///
    /// # Returns
    /// `Ok(None)` if the field is not in the cache
    fn resolve(&self, ctx: &ResolverContext<'_>) -> Result<Option<Value>>;
}

/// Looks fields up by storage key
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCacheResolver;

impl CacheResolver for DefaultCacheResolver {
    fn resolve(&self, ctx: &ResolverContext<'_>) -> Result<Option<Value>> {
        Ok(ctx.fields.get(&ctx.field.storage_key(ctx.variables)).cloned())
    }
}

/// Synthesizes references from key arguments
///
/// With a policy `Query.book: [id]`, reading `book(id: "42")` resolves to a
/// reference to `Book:42` whether or not this field was ever written, so an
/// entity normalized by one query can be read through another. A list-valued
/// key argument (`books(ids: [..])`) resolves to a list of references.
/// Fields without a policy, or with a key argument missing, use
/// [`DefaultCacheResolver`].
#[derive(Debug, Clone, Default)]
pub struct FieldPolicyCacheResolver {
    policies: HashMap<(String, String), Vec<String>>,
}

impl FieldPolicyCacheResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the key arguments of `parent_type.field`
    pub fn with_field_policy<I, S>(
        mut self,
        parent_type: impl Into<String>,
        field: impl Into<String>,
        key_args: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.policies.insert(
            (parent_type.into(), field.into()),
            key_args.into_iter().map(Into::into).collect(),
        );
        self
    }

    fn synthesize(&self, ctx: &ResolverContext<'_>, key_args: &[String]) -> Result<Option<Value>> {
        let field = ctx.field;
        let target = field.type_name.as_deref().ok_or_else(|| {
            CacheError::Resolver(format!(
                "field policy on {}.{} requires a declared type",
                ctx.parent_type, field.name
            ))
        })?;

        let arguments = field.resolve_arguments(ctx.variables);
        let mut values = Vec::with_capacity(key_args.len());
        for name in key_args {
            match arguments.get(name) {
                Some(value) if !value.is_null() => values.push(value),
                _ => return Ok(None),
            }
        }

        if let [serde_json::Value::Array(items)] = values.as_slice() {
            let references = items
                .iter()
                .map(|item| {
                    key_part(item)
                        .map(|part| Value::Reference(CacheKey::typed(target, [part])))
                        .ok_or_else(|| invalid_key_argument(ctx, item))
                })
                .collect::<Result<Vec<_>>>()?;
            return Ok(Some(Value::List(references)));
        }

        let parts = values
            .into_iter()
            .map(|value| key_part(value).ok_or_else(|| invalid_key_argument(ctx, value)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(Value::Reference(CacheKey::typed(target, parts))))
    }
}

fn invalid_key_argument(ctx: &ResolverContext<'_>, value: &serde_json::Value) -> CacheError {
    CacheError::Resolver(format!(
        "key argument of {}.{} is not a scalar: {}",
        ctx.parent_type, ctx.field.name, value
    ))
}

impl CacheResolver for FieldPolicyCacheResolver {
    fn resolve(&self, ctx: &ResolverContext<'_>) -> Result<Option<Value>> {
        let policy = self
            .policies
            .get(&(ctx.parent_type.to_string(), ctx.field.name.clone()));

        if let Some(key_args) = policy {
            if let Some(value) = self.synthesize(ctx, key_args)? {
                tracing::trace!(
                    parent = ctx.parent_type,
                    field = %ctx.field.name,
                    "Resolved field from key arguments"
                );
                return Ok(Some(value));
            }
        }

        DefaultCacheResolver.resolve(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::CompiledArgument;
    use serde_json::json;

    fn read(
        resolver: &dyn CacheResolver,
        fields: &BTreeMap<String, Value>,
        field: &CompiledField,
        variables: &Variables,
    ) -> Result<Option<Value>> {
        let key = CacheKey::root();
        let ctx = ResolverContext {
            key: &key,
            fields,
            field,
            parent_type: "Query",
            variables,
            path: &[],
        };
        resolver.resolve(&ctx)
    }

    #[test]
    fn test_default_lookup_by_storage_key() {
        let mut fields = BTreeMap::new();
        fields.insert(r#"height({"unit":"FOOT"})"#.to_string(), Value::from("5.9"));

        let foot = CompiledField::new("height")
            .with_argument(CompiledArgument::literal("unit", json!("FOOT")));
        let meter = CompiledField::new("height")
            .with_argument(CompiledArgument::literal("unit", json!("METER")));

        let vars = Variables::new();
        assert_eq!(
            read(&DefaultCacheResolver, &fields, &foot, &vars).unwrap(),
            Some(Value::from("5.9"))
        );
        assert_eq!(read(&DefaultCacheResolver, &fields, &meter, &vars).unwrap(), None);
    }

    #[test]
    fn test_field_policy_synthesizes_reference() {
        let resolver = FieldPolicyCacheResolver::new().with_field_policy("Query", "book", ["id"]);
        let field = CompiledField::object("book", "Book")
            .with_argument(CompiledArgument::variable("id", "bookId"));
        let vars = json!({"bookId": 42}).as_object().cloned().unwrap();

        let value = read(&resolver, &BTreeMap::new(), &field, &vars).unwrap();
        assert_eq!(value, Some(Value::Reference(CacheKey::new("Book:42"))));
    }

    #[test]
    fn test_field_policy_with_list_argument() {
        let resolver = FieldPolicyCacheResolver::new().with_field_policy("Query", "books", ["ids"]);
        let field = CompiledField::object("books", "Book")
            .with_argument(CompiledArgument::literal("ids", json!(["1", "2"])));

        let value = read(&resolver, &BTreeMap::new(), &field, &Variables::new()).unwrap();
        assert_eq!(
            value,
            Some(Value::List(vec![
                Value::Reference(CacheKey::new("Book:1")),
                Value::Reference(CacheKey::new("Book:2")),
            ]))
        );
    }

    #[test]
    fn test_field_policy_falls_back_without_arguments() {
        let resolver = FieldPolicyCacheResolver::new().with_field_policy("Query", "book", ["id"]);
        let field = CompiledField::object("book", "Book")
            .with_argument(CompiledArgument::variable("id", "bookId"));

        let mut fields = BTreeMap::new();
        fields.insert("book".to_string(), Value::Reference(CacheKey::new("Book:7")));

        let value = read(&resolver, &fields, &field, &Variables::new()).unwrap();
        assert_eq!(value, Some(Value::Reference(CacheKey::new("Book:7"))));
    }

    #[test]
    fn test_field_policy_requires_declared_type() {
        let resolver = FieldPolicyCacheResolver::new().with_field_policy("Query", "book", ["id"]);
        let field =
            CompiledField::new("book").with_argument(CompiledArgument::literal("id", json!("1")));
        let err = read(&resolver, &BTreeMap::new(), &field, &Variables::new()).unwrap_err();
        assert!(matches!(err, CacheError::Resolver(_)));
    }
}
