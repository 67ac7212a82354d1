pub mod duckdb;
pub mod offsets;
pub mod traits;

pub use offsets::{OffsetTracker, SharedOffsets};
pub use traits::{CommittedOffset, OffsetStore, StorageError};
