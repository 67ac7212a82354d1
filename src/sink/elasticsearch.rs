use super::traits::{DocumentStore, SinkError, SinkOp};
use crate::source::record::Row;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Document store backed by an Elasticsearch index, written through `_bulk`.
#[derive(Debug)]
pub struct ElasticsearchSink {
    base_url: Url,
    index: String,
    refresh: bool,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_id", default)]
    id: Option<String>,
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    #[serde(rename = "_source", default)]
    source_doc: Option<Row>,
}

impl From<reqwest::Error> for SinkError {
    fn from(e: reqwest::Error) -> Self {
        SinkError::Unavailable(e.to_string())
    }
}

impl ElasticsearchSink {
    pub fn new(url: &str, index: &str, refresh: bool, timeout: Duration) -> Result<Self, SinkError> {
        let base_url = Url::parse(url)
            .map_err(|e| SinkError::Unavailable(format!("invalid Elasticsearch URL '{}': {}", url, e)))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base_url,
            index: index.to_string(),
            refresh,
            client,
        })
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SinkError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SinkError::Unavailable(format!("cannot build request path from {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn bulk_body(&self, ops: &[SinkOp]) -> Result<String, SinkError> {
        let mut body = String::new();
        for op in ops {
            let (action, document) = match op {
                SinkOp::Upsert { id, document } => {
                    (json!({"index": {"_index": self.index, "_id": id}}), Some(document))
                }
                SinkOp::Delete { id } => (json!({"delete": {"_index": self.index, "_id": id}}), None),
            };
            body.push_str(&action.to_string());
            body.push('\n');
            if let Some(document) = document {
                let line = serde_json::to_string(document).map_err(|e| SinkError::Rejected {
                    id: op.id().to_string(),
                    reason: e.to_string(),
                })?;
                body.push_str(&line);
                body.push('\n');
            }
        }
        Ok(body)
    }
}

/// Overload and server faults are worth retrying; other client errors are not.
fn is_transient_status(status: u16) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS.as_u16() || status >= 500
}

fn check_items(response: BulkResponse) -> Result<(), SinkError> {
    if !response.errors {
        return Ok(());
    }

    let mut transient = None;
    for item in response.items {
        for (action, result) in item {
            if result.status < 300 {
                continue;
            }
            if action == "delete" && result.status == StatusCode::NOT_FOUND.as_u16() {
                continue;
            }

            let id = result.id.unwrap_or_default();
            let reason = result
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| format!("status {}", result.status));

            if is_transient_status(result.status) {
                transient.get_or_insert(SinkError::Unavailable(format!(
                    "document '{}' {}: {}",
                    id, action, reason
                )));
            } else {
                return Err(SinkError::Rejected { id, reason });
            }
        }
    }

    match transient {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[async_trait]
impl DocumentStore for ElasticsearchSink {
    async fn bulk(&self, ops: &[SinkOp]) -> Result<(), SinkError> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut url = self.endpoint(&["_bulk"])?;
        if self.refresh {
            url.query_pairs_mut().append_pair("refresh", "true");
        }

        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(self.bulk_body(ops)?)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            if is_transient_status(status.as_u16()) {
                return Err(SinkError::Unavailable(format!("status {}: {}", status, message)));
            }
            return Err(SinkError::Rejected {
                id: String::new(),
                reason: format!("bulk request refused with status {}: {}", status, message),
            });
        }

        let body: BulkResponse = response.json().await?;
        check_items(body)?;

        tracing::debug!(index = %self.index, ops = ops.len(), "Bulk write acknowledged");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Row>, SinkError> {
        let url = self.endpoint(&[&self.index, "_doc", id])?;
        let response = self.client.get(url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SinkError::Unavailable(format!(
                "get '{}' returned status {}",
                id,
                response.status()
            )));
        }

        let body: GetResponse = response.json().await?;
        Ok(body.source_doc)
    }
}
