pub mod cache;
pub mod memory;
pub mod schema;
pub mod source;
pub mod watcher;

#[cfg(feature = "etcd")]
pub mod etcd;

pub use cache::DocumentCache;
pub use memory::MemoryConfigSource;
pub use source::{ConfigSource, QueryResult, SourceError};
pub use watcher::{WatchSink, WatchUpdate, WatcherHandle};

#[cfg(feature = "etcd")]
pub use etcd::EtcdConfigSource;
