// src/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One employee row. `company` is the owning source's identifier; together
/// with `email` it identifies the record across the whole directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmployeeRecord {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub company: String,
}

impl EmployeeRecord {
    pub fn new(name: &str, email: &str, department: &str, company: &str) -> Self {
        Self {
            name: name.to_string(),
            email: email.to_string(),
            department: department.to_string(),
            company: company.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Ok,
    Timeout,
    Error,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::Ok => "ok",
            FetchStatus::Timeout => "timeout",
            FetchStatus::Error => "error",
        }
    }
}

/// Per-source result of one aggregation. Always present, even on failure;
/// `records` is empty unless `status` is `Ok`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchOutcome {
    pub source: String,
    pub display_name: String,
    pub status: FetchStatus,
    pub records: Vec<EmployeeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 0 when the fetch was abandoned at the aggregate deadline.
    pub attempts: u32,
    pub elapsed_ms: u64,
}

impl FetchOutcome {
    pub fn is_ok(&self) -> bool {
        self.status == FetchStatus::Ok
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatedResult {
    pub requested_by: String,
    pub generated_at: DateTime<Utc>,
    /// One entry per configured source, in registry order.
    pub outcomes: Vec<FetchOutcome>,
}

impl AggregatedResult {
    pub fn total_records(&self) -> usize {
        self.outcomes.iter().map(|o| o.records.len()).sum()
    }

    pub fn failed_sources(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| !o.is_ok())
            .map(|o| o.source.as_str())
            .collect()
    }

    pub fn all_ok(&self) -> bool {
        self.outcomes.iter().all(FetchOutcome::is_ok)
    }

    pub fn outcome(&self, source: &str) -> Option<&FetchOutcome> {
        self.outcomes.iter().find(|o| o.source == source)
    }
}
