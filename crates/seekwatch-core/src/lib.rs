//! Core domain model for seekwatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "seekwatch-core";

/// One scraped job posting. Immutable once produced by a scrape executor;
/// identity for dedup purposes is solely the configured [`KeyField`] value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub title: String,
    pub company: String,
    pub location: String,
    pub classification: String,
    pub subcategory: String,
    pub job_url: String,
    #[serde(default)]
    pub posted_date: Option<String>,
    #[serde(default)]
    pub salary: Option<String>,
    #[serde(default)]
    pub job_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub scraped_at: DateTime<Utc>,
    #[serde(default)]
    pub job_id: Option<String>,
}

impl JobRecord {
    /// Dedup key for this record under the given field choice.
    ///
    /// A record without an extracted numeric id falls back to its URL, which
    /// is always present.
    pub fn dedup_key(&self, field: KeyField) -> &str {
        match field {
            KeyField::JobUrl => &self.job_url,
            KeyField::JobId => self.job_id.as_deref().unwrap_or(&self.job_url),
            KeyField::Title => &self.title,
        }
    }
}

/// Which record field decides identity when deduplicating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyField {
    #[default]
    JobUrl,
    JobId,
    Title,
}

/// Lifecycle state of a scrape job.
///
/// `Pending` is the only initial state; `Completed` and `Failed` are
/// terminal. No job skips `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status `{other}`")),
        }
    }
}

/// Parameters of one scrape submission. Request-level fields override the
/// configured defaults when present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRequest {
    #[serde(default)]
    pub config_path: Option<String>,
    #[serde(default)]
    pub headless: Option<bool>,
    #[serde(default)]
    pub max_pages: Option<u32>,
    /// One-shot webhook target for this job only, independent of the
    /// registered-webhook set.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Events the webhook dispatcher can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    ScrapeCompleted,
    ScrapeFailed,
}

impl JobEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            JobEvent::ScrapeCompleted => "scrape.completed",
            JobEvent::ScrapeFailed => "scrape.failed",
        }
    }
}

impl std::fmt::Display for JobEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered webhook endpoint. Removed only by explicit unregistration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookRegistration {
    pub webhook_id: String,
    pub url: String,
    pub events: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WebhookRegistration {
    pub fn subscribes_to(&self, event: JobEvent) -> bool {
        self.events.iter().any(|e| e == event.as_str())
    }
}

/// Allocate a scrape-job identifier: second-resolution timestamp for
/// time-ordering plus a random suffix so concurrent submissions in the same
/// second cannot collide.
pub fn new_job_id(now: DateTime<Utc>) -> String {
    let stamp = now.format("%Y%m%d_%H%M%S");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("scrape_{stamp}_{}", &suffix[..8])
}

/// Allocate a webhook registration identifier.
pub fn new_webhook_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("webhook_{}", &suffix[..8])
}
