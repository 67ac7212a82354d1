pub mod index;
pub mod operator;

pub use index::ForeignKeyIndex;
pub use operator::{JoinError, JoinOperator, JoinSpec, JoinedRow};
