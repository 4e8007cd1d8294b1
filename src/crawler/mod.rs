pub mod analyzer;
pub mod orchestrator;
pub mod progress;
pub mod summary;

pub use analyzer::{HttpAnalyzer, PageAnalysis, PageAnalyzer};
pub use orchestrator::CrawlOrchestrator;
pub use progress::{CrawlProgress, CrawlStatus, ProgressEvent, ProgressSink};
pub use summary::{CrawlResult, CrawlSummary, InsightDetector, NoInsights, PageRecord};
