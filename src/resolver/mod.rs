//! Identity and read policies
//!
//! - [`CacheKeyResolver`]: decides which objects get their own record on write
//! - [`CacheResolver`]: produces the raw value of a field on read

mod cache_resolver;
mod key_resolver;

pub use cache_resolver::{
    CacheResolver, DefaultCacheResolver, FieldPolicyCacheResolver, ResolverContext,
};
pub use key_resolver::{CacheKeyResolver, KeyContext, TypePolicyKeyResolver};

pub(crate) use key_resolver::key_part;
