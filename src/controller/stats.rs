use super::types::OperationResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Running totals over every `apply` made through one controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControllerStatistics {
    pub total_operations: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Operations that needed more than one dispatch
    pub retried: u64,
    pub total_attempts: u64,
    pub failures_by_kind: HashMap<String, u64>,
    pub last_failure_time: Option<DateTime<Utc>>,
}

impl ControllerStatistics {
    pub(crate) fn record(&mut self, result: &OperationResult) {
        self.total_operations += 1;
        self.total_attempts += u64::from(result.attempts);
        if result.attempts > 1 {
            self.retried += 1;
        }

        match result.failure_kind() {
            None => self.succeeded += 1,
            Some(kind) => {
                self.failed += 1;
                self.last_failure_time = Some(Utc::now());
                *self
                    .failures_by_kind
                    .entry(kind.name().to_string())
                    .or_insert(0) += 1;
            }
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 1.0;
        }
        self.succeeded as f64 / self.total_operations as f64
    }
}
