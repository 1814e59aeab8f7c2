pub mod machine;
pub mod snapshot;
pub mod sqlite;
pub mod store;

pub use machine::StateMachine;
pub use snapshot::{BotState, StateUpdates, TradingState};
pub use sqlite::SqliteStateStore;
pub use store::{MemoryStateStore, StateError, StateStore};
