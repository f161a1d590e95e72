pub mod memory;
pub mod notify;
pub mod sql;
pub mod traits;

pub use memory::MemoryLocalStore;
pub use notify::{ChangeEvent, ChangeFeed, SuppressGuard};
pub use sql::SqliteLocalStore;
pub use traits::{LocalStore, PurgeStats, StoreError};
