mod policy;
mod store;

pub use policy::{CacheError, CachePolicy, CachedRead, CachedReader};
pub use store::CacheStore;
