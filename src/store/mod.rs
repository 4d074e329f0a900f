//! Persistence layer — JSON-document map store behind a FIFO queue.

pub mod map_store;
pub mod traits;

pub use map_store::MapStore;
pub use traits::{MapStoreHandle, StoredMap};
