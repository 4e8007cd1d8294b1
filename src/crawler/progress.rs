use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How many recently discovered URLs the progress snapshot retains.
pub const RECENT_DISCOVERY_LIMIT: usize = 10;

/// Lifecycle state of one crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    Running,
    Paused,
    Completed,
    Failed,
    /// Operator cancel; terminal.
    Stopped,
}

impl std::fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CrawlStatus::Running => "running",
            CrawlStatus::Paused => "paused",
            CrawlStatus::Completed => "completed",
            CrawlStatus::Failed => "failed",
            CrawlStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a running crawl. Single writer (the orchestrator),
/// read by the broadcaster; consumers must tolerate staleness.
///
/// `total` is `visited + queued` and may shrink as filtering removes
/// candidates, so percentage-complete derived from it is non-monotonic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlProgress {
    pub status: CrawlStatus,
    pub crawled: usize,
    pub total: usize,
    pub errors: usize,
    pub current_url: Option<String>,
    pub pages_per_minute: f64,
    pub estimated_time_remaining_secs: Option<u64>,
    pub recently_discovered: VecDeque<String>,
}

impl CrawlProgress {
    pub fn new() -> Self {
        Self {
            status: CrawlStatus::Running,
            crawled: 0,
            total: 0,
            errors: 0,
            current_url: None,
            pages_per_minute: 0.0,
            estimated_time_remaining_secs: None,
            recently_discovered: VecDeque::new(),
        }
    }

    /// Push a discovered URL into the bounded recent ring.
    pub fn push_discovered(&mut self, url: String) {
        if self.recently_discovered.len() >= RECENT_DISCOVERY_LIMIT {
            self.recently_discovered.pop_front();
        }
        self.recently_discovered.push_back(url);
    }
}

impl Default for CrawlProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// A page-level failure, appended for post-mortem reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageError {
    pub url: String,
    pub error: String,
    pub status_code: Option<u16>,
    pub timestamp: DateTime<Utc>,
}

impl PageError {
    pub fn new(url: impl Into<String>, error: impl Into<String>, status_code: Option<u16>) -> Self {
        Self {
            url: url.into(),
            error: error.into(),
            status_code,
            timestamp: Utc::now(),
        }
    }
}

/// One progress emission for a job, as delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub user_id: String,
    pub progress: CrawlProgress,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(job_id: Uuid, user_id: impl Into<String>, progress: CrawlProgress) -> Self {
        Self {
            job_id,
            user_id: user_id.into(),
            progress,
            timestamp: Utc::now(),
        }
    }
}

/// Wire form of a progress event on the cross-instance bus. The origin id
/// lets a listener skip events it already delivered locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEnvelope {
    pub origin: Uuid,
    pub event: ProgressEvent,
}

/// Consumer of progress events; the broadcaster implements this and the job
/// queue hands it to running crawl handlers. Injected explicitly, never a
/// process-wide singleton.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn publish(&self, event: ProgressEvent);
}

/// Sink that drops everything, for jobs nobody watches.
pub struct NullSink;

#[async_trait]
impl ProgressSink for NullSink {
    async fn publish(&self, _event: ProgressEvent) {}
}
