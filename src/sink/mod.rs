pub mod elasticsearch;
pub mod memory;
pub mod traits;
pub mod writer;

pub use elasticsearch::ElasticsearchSink;
pub use memory::MemoryDocumentStore;
pub use traits::{DocumentStore, SinkError, SinkOp};
pub use writer::{run_writer, Progress, SharedWriterStats, SinkAck, SinkMessage, WriterError, WriterStats};

use crate::config::types::{SinkConfig, SinkTarget};
use std::sync::Arc;

/// Build the document store a sink section describes.
pub fn create_document_store(config: &SinkConfig) -> Result<Arc<dyn DocumentStore>, SinkError> {
    match &config.target {
        SinkTarget::Elasticsearch { url, index, refresh } => Ok(Arc::new(ElasticsearchSink::new(
            url,
            index,
            *refresh,
            config.retry.timeout,
        )?)),
        SinkTarget::Memory => Ok(Arc::new(MemoryDocumentStore::new())),
    }
}
