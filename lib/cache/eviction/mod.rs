/// Least-recently-used eviction worker.
pub mod lru;
