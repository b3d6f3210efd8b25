pub mod content;
pub mod lru;

pub use content::{cache_key, CachedContent, ContentCache, ContentCacheStats};
pub use lru::{LruCache, LruOptions};
