use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sitescan::cli::config::{CrawlConfiguration, CrawlType};
use sitescan::crawler::analyzer::HttpAnalyzer;
use sitescan::crawler::progress::NullSink;
use sitescan::crawler::summary::NoInsights;
use sitescan::queue::{CrawlJobHandler, JobQueue, JobState, QueueSettings};
use sitescan::storage::{MemoryResultStore, ResultStore};

fn page(title: &str, links: &[&str]) -> String {
    let anchors: String = links
        .iter()
        .map(|href| format!("<a href=\"{href}\">{href}</a>"))
        .collect();
    format!(
        "<!DOCTYPE html><html><head><title>{title}</title>\
         <meta name=\"description\" content=\"fixture page\"></head>\
         <body><h1>{title}</h1><p>fixture content</p>{anchors}</body></html>"
    )
}

fn html_response(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "text/html")
}

fn crawl_config(start_url: String) -> CrawlConfiguration {
    let mut config = CrawlConfiguration {
        crawl_type: CrawlType::WholeDomain,
        start_url,
        max_depth: 1,
        max_pages: 3,
        ..Default::default()
    };
    config.performance.concurrent = 2;
    config.performance.delay_between_requests_ms = 0;
    config.performance.request_timeout_secs = 5;
    config
}

fn test_queue(results: Arc<MemoryResultStore>) -> Arc<JobQueue> {
    let analyzer = HttpAnalyzer::new(Duration::from_secs(5), Default::default()).unwrap();
    let handler = CrawlJobHandler::new(Arc::new(analyzer), Arc::new(NoInsights), results);

    let settings = QueueSettings {
        concurrency: 2,
        max_attempts: 3,
        backoff_base: Duration::from_millis(50),
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let queue = JobQueue::new(settings, Arc::new(handler), Arc::new(NullSink), None);
    queue.start();
    queue
}

async fn wait_for_terminal(queue: &JobQueue, id: Uuid) -> JobState {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let state = queue.job_status(id).await.unwrap();
        if state.is_terminal() {
            return state;
        }
        assert!(Instant::now() < deadline, "job never reached a terminal state");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn crawl_of_fixture_site_respects_page_budget() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html_response(page("home", &["/a", "/b", "/c", "/d"])))
        .mount(&server)
        .await;
    for name in ["a", "b", "c", "d"] {
        Mock::given(method("GET"))
            .and(path(format!("/{name}")))
            .respond_with(html_response(page(name, &[])))
            .mount(&server)
            .await;
    }

    let results = Arc::new(MemoryResultStore::new());
    let queue = test_queue(results.clone());

    let id = queue
        .add_job("user-1", crawl_config(format!("{}/", server.uri())))
        .await
        .unwrap();

    let state = wait_for_terminal(&queue, id).await;
    assert_eq!(state, JobState::Completed);

    let job = queue.job(id).await.unwrap();
    let result = job.result.expect("completed job carries a result");
    assert_eq!(result.pages.len(), 3);
    assert!(result.errors.is_empty());
    assert_eq!(result.summary.error_pages, 0);

    // The stored copy matches what the job record carries.
    let stored = results.get_result(id).await.expect("result was persisted");
    assert_eq!(stored.pages.len(), 3);

    // Discovery outpaced the budget; the denominator covers every URL the
    // frontier saw, fetched or not.
    let progress = job.progress.expect("progress was recorded");
    assert!(progress.crawled >= 3);
    assert!(progress.total >= 3);

    queue.shutdown();
}

#[tokio::test]
async fn unreachable_seed_fails_after_retries() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let results = Arc::new(MemoryResultStore::new());
    let queue = test_queue(results);

    let id = queue
        .add_job("user-1", crawl_config(format!("{}/", server.uri())))
        .await
        .unwrap();

    let state = wait_for_terminal(&queue, id).await;
    assert_eq!(state, JobState::Failed);

    let job = queue.job(id).await.unwrap();
    assert_eq!(job.attempts_made, 3);
    assert!(!job.failed_reason.unwrap_or_default().is_empty());

    queue.shutdown();
}
