//! Small stdlib-adjacent helpers shared by every `shardval-*` crate.

pub mod futures;
pub mod metrics;
pub mod time;

/// Hasher used for every hot-path map in the core. Not resistant to
/// adversarial inputs — only use it for keys that are already content hashes
/// or validated identifiers.
pub type FastHashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type FastHashSet<K> = std::collections::HashSet<K, ahash::RandomState>;
