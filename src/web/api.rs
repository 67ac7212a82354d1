use crate::pipeline::{PipelineHandle, PipelineState};
use crate::sink::WriterStats;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: PipelineHandle,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: PipelineState,
    /// Last committed position per source.
    pub committed: BTreeMap<String, u64>,
    pub sink: WriterStats,
    /// Rows held in keyed state per table.
    pub tables: BTreeMap<String, usize>,
}

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, &'static str) {
    match state.pipeline.state() {
        PipelineState::Failed => (StatusCode::SERVICE_UNAVAILABLE, "FAILED"),
        _ => (StatusCode::OK, "OK"),
    }
}

pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let pipeline = &state.pipeline;
    Json(StatusResponse {
        state: pipeline.state(),
        committed: pipeline
            .committed()
            .into_iter()
            .map(|(source_id, position)| (source_id, position.0))
            .collect(),
        sink: pipeline.writer_stats(),
        tables: pipeline.table_rows(),
    })
}
