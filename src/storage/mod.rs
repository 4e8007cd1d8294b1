use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::crawler::summary::CrawlResult;

/// Where finished crawl results land.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn save_result(&self, job_id: Uuid, result: &CrawlResult);
    async fn get_result(&self, job_id: Uuid) -> Option<CrawlResult>;
}

/// In-process result store. Results live as long as the process does.
#[derive(Default)]
pub struct MemoryResultStore {
    results: Mutex<HashMap<Uuid, CrawlResult>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn save_result(&self, job_id: Uuid, result: &CrawlResult) {
        self.results.lock().await.insert(job_id, result.clone());
    }

    async fn get_result(&self, job_id: Uuid) -> Option<CrawlResult> {
        self.results.lock().await.get(&job_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::progress::CrawlStatus;
    use crate::crawler::summary::CrawlSummary;

    #[tokio::test]
    async fn stores_and_returns_results_by_job() {
        let store = MemoryResultStore::new();
        let job_id = Uuid::new_v4();
        let result = CrawlResult {
            job_id,
            status: CrawlStatus::Completed,
            pages: Vec::new(),
            errors: Vec::new(),
            summary: CrawlSummary::compute(&[], &[], 1.0),
            insights: Vec::new(),
        };

        store.save_result(job_id, &result).await;
        let fetched = store.get_result(job_id).await.unwrap();
        assert_eq!(fetched.job_id, job_id);
        assert!(store.get_result(Uuid::new_v4()).await.is_none());
    }
}
