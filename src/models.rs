use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Trigger for one listing sync: emitted by the catalog side after an
/// internal price change settles on a new best price.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncRequest {
    pub listing_id: i64,
    /// Internally computed best sell price the marketplace should converge to.
    pub target_price: u32,
    /// Per-unit margin override; falls back to the configured default.
    #[serde(default)]
    pub margin: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub listing_id: i64,
    pub accepted_price: u32,
    pub negotiation_rounds: u32,
    pub options_pushed: usize,
    pub stages: Vec<StageReport>,
}

/// Per-stage transcript entry; logged and returned to the caller so a failed
/// run is attributable to an exact stage.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
