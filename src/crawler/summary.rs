use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::analyzer::{IssueSeverity, PageAnalysis};
use super::progress::{CrawlStatus, PageError};

/// One analyzed page in the job's result set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    pub analysis: PageAnalysis,
    pub depth: u32,
    pub parent_url: Option<String>,
    pub crawled_at: DateTime<Utc>,
}

/// Aggregate numbers emitted when a crawl reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSummary {
    pub total_pages: usize,
    pub successful_pages: usize,
    pub error_pages: usize,
    /// Mean page score over scored pages; `None` when nothing was scored.
    pub average_score: Option<f32>,
    pub total_issues: usize,
    pub critical_issues: usize,
    pub duration_secs: f64,
}

impl CrawlSummary {
    pub fn compute(pages: &[PageRecord], errors: &[PageError], duration_secs: f64) -> Self {
        let scored: Vec<f32> = pages
            .iter()
            .filter_map(|p| p.analysis.score)
            .collect();
        let average_score = if scored.is_empty() {
            None
        } else {
            Some(scored.iter().sum::<f32>() / scored.len() as f32)
        };

        let total_issues = pages.iter().map(|p| p.analysis.issues.len()).sum();
        let critical_issues = pages
            .iter()
            .flat_map(|p| &p.analysis.issues)
            .filter(|i| i.severity == IssueSeverity::Critical)
            .count();

        Self {
            total_pages: pages.len() + errors.len(),
            successful_pages: pages.len(),
            error_pages: errors.len(),
            average_score,
            total_issues,
            critical_issues,
            duration_secs,
        }
    }
}

/// Category of a cross-page finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
    DuplicateContent,
    OrphanPage,
    BrokenLink,
    SiteStructure,
    ContentGap,
}

/// A cross-page finding produced by the post-pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub kind: InsightKind,
    pub message: String,
    pub urls: Vec<String>,
}

/// Post-pass over the complete result set. The core only guarantees this
/// hook runs once at completion with every accumulated page; the heuristics
/// behind it are replaceable.
pub trait InsightDetector: Send + Sync {
    fn detect(&self, pages: &[PageRecord], errors: &[PageError]) -> Vec<Insight>;
}

/// Default detector that reports nothing.
pub struct NoInsights;

impl InsightDetector for NoInsights {
    fn detect(&self, _pages: &[PageRecord], _errors: &[PageError]) -> Vec<Insight> {
        Vec::new()
    }
}

/// Final outcome of one crawl job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlResult {
    pub job_id: Uuid,
    pub status: CrawlStatus,
    pub pages: Vec<PageRecord>,
    pub errors: Vec<PageError>,
    pub summary: CrawlSummary,
    pub insights: Vec<Insight>,
}
