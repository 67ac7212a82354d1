pub mod store;

pub use store::{Applied, KeyedRow, KeyedStateStore, MemoryStateStore, StateError};
