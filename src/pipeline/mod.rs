pub mod channel;
pub mod coordinator;
pub mod runner;

pub use channel::{create_channel, Receiver, Sender};
pub use coordinator::{
    FailureCause, Pipeline, PipelineFailure, PipelineHandle, PipelineReport, PipelineState,
};
pub use runner::run_join;
