//! Daemon variables endpoint

use axum::{Json, extract::State};

use crate::{
    api::{error::ApiResult, state::ApiState, types::VarsResponse},
    version,
};

/// GET /debug/vars
///
/// Returns build info and the processor's counters
pub async fn get_vars(State(state): State<ApiState>) -> ApiResult<Json<VarsResponse>> {
    let stats = state.processor.get_stats().await?;

    Ok(Json(VarsResponse {
        version: version::NUMBER,
        commit: version::commit(),
        pid: std::process::id(),
        stats,
    }))
}
