pub mod distributed;
pub mod sqlite;
pub mod store;

pub use distributed::DistributedLock;
pub use sqlite::SqliteLockStore;
pub use store::{LockError, LockStore, MemoryLockStore};
