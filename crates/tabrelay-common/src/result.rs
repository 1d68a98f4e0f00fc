use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of one executed instruction. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub instruction_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ExecutionResult {
    pub fn success(
        instruction_id: impl Into<String>,
        duration: Duration,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            instruction_id: instruction_id.into(),
            success: true,
            error: None,
            duration_ms: millis(duration),
            data,
        }
    }

    pub fn failure(
        instruction_id: impl Into<String>,
        duration: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            instruction_id: instruction_id.into(),
            success: false,
            error: Some(error.into()),
            duration_ms: millis(duration),
            data: None,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Aggregate view over a results list, derived on demand.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub total: usize,
    pub success: usize,
    pub failure: usize,
    /// Percentage in `[0, 100]`; 0 when there are no results.
    pub success_rate: f64,
    pub total_duration_ms: u64,
    pub average_duration_ms: f64,
}

impl ExecutionStats {
    pub fn from_results(results: &[ExecutionResult]) -> Self {
        let total = results.len();
        let success = results.iter().filter(|r| r.success).count();
        let total_duration_ms = results
            .iter()
            .fold(0u64, |acc, r| acc.saturating_add(r.duration_ms));

        let (success_rate, average_duration_ms) = if total == 0 {
            (0.0, 0.0)
        } else {
            (
                success as f64 / total as f64 * 100.0,
                total_duration_ms as f64 / total as f64,
            )
        };

        Self {
            total,
            success,
            failure: total - success,
            success_rate,
            total_duration_ms,
            average_duration_ms,
        }
    }
}
