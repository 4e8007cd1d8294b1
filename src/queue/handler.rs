use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::crawler::analyzer::PageAnalyzer;
use crate::crawler::orchestrator::CrawlOrchestrator;
use crate::crawler::summary::{CrawlResult, InsightDetector};
use crate::storage::ResultStore;

use super::queue::{JobContext, JobHandler};
use super::job::JobRecord;

/// Runs admitted jobs by driving a crawl orchestrator and forwarding its
/// progress stream into the job context's sink.
pub struct CrawlJobHandler {
    analyzer: Arc<dyn PageAnalyzer>,
    insights: Arc<dyn InsightDetector>,
    results: Arc<dyn ResultStore>,
}

impl CrawlJobHandler {
    pub fn new(
        analyzer: Arc<dyn PageAnalyzer>,
        insights: Arc<dyn InsightDetector>,
        results: Arc<dyn ResultStore>,
    ) -> Self {
        Self {
            analyzer,
            insights,
            results,
        }
    }
}

#[async_trait]
impl JobHandler for CrawlJobHandler {
    async fn run(&self, job: JobRecord, ctx: JobContext) -> anyhow::Result<CrawlResult> {
        let orchestrator = CrawlOrchestrator::new(
            job.id,
            job.user_id.clone(),
            job.config.clone(),
            self.analyzer.clone(),
            self.insights.clone(),
            ctx.cancel.clone(),
        )?;

        // Forward orchestrator progress until its channel closes with the
        // last sender.
        let mut events = orchestrator.subscribe();
        let sink = ctx.progress.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => sink.publish(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "progress forwarder lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let outcome = orchestrator.run().await;
        // The orchestrator owns the last progress sender; dropping it closes
        // the channel and lets the forwarder drain and exit.
        drop(orchestrator);
        let _ = forwarder.await;

        let result = outcome?;
        self.results.save_result(job.id, &result).await;

        info!(
            job_id = %job.id,
            status = %result.status,
            pages = result.pages.len(),
            "crawl job finished"
        );
        Ok(result)
    }
}
