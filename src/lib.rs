//! Crawl orchestration for site analysis jobs.
//!
//! A submitted crawl becomes a job in the [`queue::JobQueue`]; its handler
//! drives a [`crawler::CrawlOrchestrator`] whose workers drain a priority
//! [`frontier::Frontier`], and progress fans out to subscribers through the
//! [`broadcast::BroadcastHub`].

pub mod broadcast;
pub mod cli;
pub mod crawler;
pub mod error;
pub mod frontier;
pub mod queue;
pub mod storage;
pub mod utils;

pub use cli::config::{AppConfig, CrawlConfiguration, CrawlType};
pub use crawler::{CrawlOrchestrator, CrawlResult, CrawlStatus};
pub use error::CrawlerError;
pub use queue::{JobQueue, JobState};
