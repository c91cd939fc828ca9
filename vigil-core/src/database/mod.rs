pub mod cache;
pub mod memory;
pub mod mirror;
pub mod ports;
pub mod postgres;

pub use cache::{FastKeys, RedisFastStore};
pub use memory::{MemoryDurableStore, MemoryFastStore};
pub use mirror::TaskMirror;
pub use ports::{DurableStore, FastStore, StatusGuard};
pub use postgres::PostgresStore;
