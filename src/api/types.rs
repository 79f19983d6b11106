//! API response types

use serde::{Deserialize, Serialize};

use crate::actors::messages::ProcessorStats;

/// Response for GET /debug/health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

/// Response for GET /debug/vars
#[derive(Debug, Clone, Serialize)]
pub struct VarsResponse {
    pub version: &'static str,
    pub commit: &'static str,
    pub pid: u32,
    pub stats: ProcessorStats,
}
