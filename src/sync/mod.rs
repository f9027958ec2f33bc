pub mod buffer;
pub mod store;

pub use buffer::SyncBuffer;
pub use store::{BatchStore, JsonFileStore, MemoryStore};
