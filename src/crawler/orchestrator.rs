use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cli::config::CrawlConfiguration;
use crate::error::CrawlerError;
use crate::frontier::{priority, Frontier, FrontierEntry, LinkSource, UrlFilter};
use crate::queue::job::CancelFlag;
use crate::utils::metrics::RateTracker;

use super::analyzer::{ExtractedLinks, PageAnalyzer};
use super::progress::{CrawlProgress, CrawlStatus, PageError, ProgressEvent};
use super::summary::{CrawlResult, CrawlSummary, InsightDetector, PageRecord};

/// Hard ceiling on the per-page fetch timeout.
const MAX_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// How long an idle or paused worker sleeps before rechecking.
const IDLE_WAIT: Duration = Duration::from_millis(50);
const PAUSE_WAIT: Duration = Duration::from_millis(100);

/// Drives one crawl job: seeds the frontier, runs `performance.concurrent`
/// workers against it, feeds discovered links back through the URL filter
/// and publishes progress on a broadcast channel.
///
/// State machine: running -> paused -> running, running -> completed,
/// running -> failed, any non-terminal -> stopped. Pause and stop are
/// cooperative flags observed at worker loop boundaries, never preemption.
pub struct CrawlOrchestrator {
    job_id: Uuid,
    user_id: String,
    config: CrawlConfiguration,
    filter: Arc<UrlFilter>,
    analyzer: Arc<dyn PageAnalyzer>,
    insights: Arc<dyn InsightDetector>,

    // The frontier is the only state shared across workers; one lock,
    // held briefly.
    frontier: Arc<Mutex<Frontier>>,
    progress: Arc<Mutex<CrawlProgress>>,
    pages: Arc<Mutex<Vec<PageRecord>>>,
    errors: Arc<Mutex<Vec<PageError>>>,
    rate: Arc<Mutex<RateTracker>>,

    /// Pages actually fetched, for budget enforcement.
    fetched: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    /// Set by the worker that observes the frontier fully drained.
    drained: Arc<AtomicBool>,
    cancel: CancelFlag,

    events: broadcast::Sender<ProgressEvent>,
}

impl Clone for CrawlOrchestrator {
    fn clone(&self) -> Self {
        Self {
            job_id: self.job_id,
            user_id: self.user_id.clone(),
            config: self.config.clone(),
            filter: self.filter.clone(),
            analyzer: self.analyzer.clone(),
            insights: self.insights.clone(),
            frontier: self.frontier.clone(),
            progress: self.progress.clone(),
            pages: self.pages.clone(),
            errors: self.errors.clone(),
            rate: self.rate.clone(),
            fetched: self.fetched.clone(),
            running: self.running.clone(),
            paused: self.paused.clone(),
            drained: self.drained.clone(),
            cancel: self.cancel.clone(),
            events: self.events.clone(),
        }
    }
}

impl CrawlOrchestrator {
    pub fn new(
        job_id: Uuid,
        user_id: impl Into<String>,
        config: CrawlConfiguration,
        analyzer: Arc<dyn PageAnalyzer>,
        insights: Arc<dyn InsightDetector>,
        cancel: CancelFlag,
    ) -> Result<Self, CrawlerError> {
        config.validate()?;
        let filter = UrlFilter::new(config.crawl_type, &config.start_url, &config.filters)?;
        let (events, _) = broadcast::channel(64);

        Ok(Self {
            job_id,
            user_id: user_id.into(),
            config,
            filter: Arc::new(filter),
            analyzer,
            insights,
            frontier: Arc::new(Mutex::new(Frontier::new())),
            progress: Arc::new(Mutex::new(CrawlProgress::new())),
            pages: Arc::new(Mutex::new(Vec::new())),
            errors: Arc::new(Mutex::new(Vec::new())),
            rate: Arc::new(Mutex::new(RateTracker::new())),
            fetched: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicBool::new(true)),
            paused: Arc::new(AtomicBool::new(false)),
            drained: Arc::new(AtomicBool::new(false)),
            cancel,
            events,
        })
    }

    /// Receive progress events for this job. Events may be dropped if the
    /// receiver lags; each carries a complete snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Request a cooperative pause; workers idle at their next loop check.
    pub fn pause(&self) {
        info!(job_id = %self.job_id, "pausing crawl");
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Clear the pause flag.
    pub fn resume(&self) {
        info!(job_id = %self.job_id, "resuming crawl");
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Request a cooperative stop; terminal.
    pub fn stop(&self) {
        info!(job_id = %self.job_id, "stopping crawl");
        self.running.store(false, Ordering::SeqCst);
    }

    /// Current progress snapshot.
    pub async fn progress(&self) -> CrawlProgress {
        self.progress.lock().await.clone()
    }

    /// Run the crawl to a terminal state.
    ///
    /// Returns `Err` only for job-level failures (the seed never yielded a
    /// page); page-level errors are recorded and do not abort the job.
    pub async fn run(&self) -> Result<CrawlResult, CrawlerError> {
        let started = Instant::now();
        let seed = self.filter.seed().clone();

        info!(job_id = %self.job_id, seed = %seed, workers = self.config.performance.concurrent, "starting crawl");

        {
            let mut frontier = self.frontier.lock().await;
            frontier.add(FrontierEntry {
                url: seed.to_string(),
                depth: 0,
                priority: priority(&seed, 0, LinkSource::Start),
                source: LinkSource::Start,
                parent_url: None,
            });
        }
        self.update_progress(false).await;

        // 1 Hz progress ticker, independent of page completions.
        let ticker = {
            let this = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    if !this.running.load(Ordering::SeqCst) {
                        break;
                    }
                    this.update_progress(true).await;
                }
            })
        };

        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.performance.concurrent {
            let this = self.clone();
            workers.spawn(async move { this.worker_loop(worker_id).await });
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                // A panicking worker is a bug, not a page error.
                error!(job_id = %self.job_id, "worker task failed: {}", e);
            }
        }
        self.running.store(false, Ordering::SeqCst);
        ticker.abort();

        let pages = self.pages.lock().await.clone();
        let errors = self.errors.lock().await.clone();

        let status = if self.cancel.is_cancelled() {
            CrawlStatus::Stopped
        } else if !self.drained.load(Ordering::SeqCst) {
            // stop() before the frontier drained.
            CrawlStatus::Stopped
        } else if pages.is_empty() && !errors.is_empty() {
            CrawlStatus::Failed
        } else {
            CrawlStatus::Completed
        };

        if status == CrawlStatus::Failed {
            let reason = errors
                .first()
                .map(|e| e.error.clone())
                .unwrap_or_else(|| "seed url unreachable".to_string());
            warn!(job_id = %self.job_id, "crawl failed: {}", reason);
            self.emit_terminal(status).await;
            return Err(CrawlerError::SeedUnreachable(reason));
        }

        let duration_secs = started.elapsed().as_secs_f64();
        let summary = CrawlSummary::compute(&pages, &errors, duration_secs);
        let insights = self.insights.detect(&pages, &errors);

        info!(
            job_id = %self.job_id,
            pages = summary.successful_pages,
            errors = summary.error_pages,
            duration_secs = format!("{duration_secs:.1}"),
            "crawl finished"
        );

        self.emit_terminal(status).await;

        Ok(CrawlResult {
            job_id: self.job_id,
            status,
            pages,
            errors,
            summary,
            insights,
        })
    }

    async fn worker_loop(&self, worker_id: usize) {
        debug!(job_id = %self.job_id, worker_id, "worker started");

        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if self.cancel.is_cancelled() {
                self.running.store(false, Ordering::SeqCst);
                break;
            }
            if self.paused.load(Ordering::SeqCst) {
                tokio::time::sleep(PAUSE_WAIT).await;
                continue;
            }

            let entry = {
                let mut frontier = self.frontier.lock().await;
                match frontier.get_next() {
                    Some(entry) => entry,
                    None => {
                        if frontier.processing_count() == 0 {
                            // Nothing queued, nobody mid-page: done.
                            self.drained.store(true, Ordering::SeqCst);
                            self.running.store(false, Ordering::SeqCst);
                            break;
                        }
                        drop(frontier);
                        tokio::time::sleep(IDLE_WAIT).await;
                        continue;
                    }
                }
            };

            self.process_entry(entry).await;

            let delay = self.config.performance.delay_between_requests_ms;
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }

        debug!(job_id = %self.job_id, worker_id, "worker exiting");
    }

    async fn process_entry(&self, entry: FrontierEntry) {
        // Re-check admission at dequeue time; the seed is exempt.
        let url = if entry.depth == 0 {
            self.filter.seed().clone()
        } else {
            match self.filter.admit(&entry.url) {
                Some(url) => url,
                None => {
                    self.frontier.lock().await.mark_visited(&entry.url);
                    return;
                }
            }
        };

        // Reserve a slot in the page budget; past the budget the frontier
        // just drains without fetching.
        let max_pages = self.config.max_pages as usize;
        let reserved = self
            .fetched
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max_pages).then_some(n + 1)
            });
        if reserved.is_err() {
            self.frontier.lock().await.mark_visited(&entry.url);
            return;
        }

        {
            let mut progress = self.progress.lock().await;
            progress.current_url = Some(entry.url.clone());
        }

        let timeout = Duration::from_secs(self.config.performance.request_timeout_secs)
            .min(MAX_FETCH_TIMEOUT);

        match tokio::time::timeout(timeout, self.analyzer.analyze(&url)).await {
            Ok(Ok(analysis)) => {
                let links = analysis.links.clone();
                {
                    let mut pages = self.pages.lock().await;
                    pages.push(PageRecord {
                        analysis,
                        depth: entry.depth,
                        parent_url: entry.parent_url.clone(),
                        crawled_at: Utc::now(),
                    });
                }
                self.rate.lock().await.record();

                // Feed the links back and retire the URL under one frontier
                // acquisition. A release between the two lets a sibling worker
                // observe queued=0/processing=0 and declare the crawl drained
                // with this page's links still unqueued.
                let discovered = {
                    let mut frontier = self.frontier.lock().await;
                    let discovered = if entry.depth < self.config.max_depth {
                        self.enqueue_links(&mut frontier, &entry, &links)
                    } else {
                        Vec::new()
                    };
                    frontier.mark_visited(&entry.url);
                    discovered
                };
                if !discovered.is_empty() {
                    let mut progress = self.progress.lock().await;
                    for url in discovered {
                        progress.push_discovered(url);
                    }
                }
            }
            Ok(Err(e)) => {
                self.record_page_error(&entry, &e.message, e.status_code).await;
            }
            Err(_) => {
                self.record_page_error(&entry, "page fetch timed out", None)
                    .await;
            }
        }

        self.update_progress(true).await;
    }

    /// Filter the page's outbound links and feed survivors into the frontier
    /// at `depth + 1`. Caller holds the frontier lock; returns the URLs that
    /// were actually added.
    fn enqueue_links(
        &self,
        frontier: &mut Frontier,
        parent: &FrontierEntry,
        links: &ExtractedLinks,
    ) -> Vec<String> {
        let depth = parent.depth + 1;
        let groups = [
            (&links.navigation, LinkSource::Navigation),
            (&links.content, LinkSource::Content),
            (&links.footer, LinkSource::Footer),
            (&links.external, LinkSource::Link),
        ];

        let mut discovered = Vec::new();
        for (group, source) in groups {
            for raw in group.iter() {
                let Some(url) = self.filter.admit(raw) else {
                    continue;
                };
                let added = frontier.add(FrontierEntry {
                    url: url.to_string(),
                    depth,
                    priority: priority(&url, depth, source),
                    source,
                    parent_url: Some(parent.url.clone()),
                });
                if added {
                    discovered.push(url.to_string());
                }
            }
        }
        discovered
    }

    async fn record_page_error(&self, entry: &FrontierEntry, message: &str, status: Option<u16>) {
        warn!(job_id = %self.job_id, url = %entry.url, "page error: {}", message);
        self.errors
            .lock()
            .await
            .push(PageError::new(&entry.url, message, status));
        self.frontier.lock().await.mark_error(&entry.url);
    }

    /// Refresh the progress snapshot from the frontier counters and
    /// optionally emit it to subscribers.
    async fn update_progress(&self, emit: bool) {
        let (crawled, queued) = {
            let frontier = self.frontier.lock().await;
            (frontier.visited_count(), frontier.queued_count())
        };
        let errors = self.errors.lock().await.len();
        let (pages_per_minute, eta) = {
            let mut rate = self.rate.lock().await;
            let ppm = rate.pages_per_minute();
            (ppm, rate.estimated_remaining(queued))
        };

        let snapshot = {
            let mut progress = self.progress.lock().await;
            progress.status = if self.paused.load(Ordering::SeqCst) {
                CrawlStatus::Paused
            } else {
                CrawlStatus::Running
            };
            progress.crawled = crawled;
            // Live denominator; shrinks when filtering removes candidates.
            progress.total = crawled + queued;
            progress.errors = errors;
            progress.pages_per_minute = pages_per_minute;
            progress.estimated_time_remaining_secs = eta;
            progress.clone()
        };

        if emit {
            let _ = self
                .events
                .send(ProgressEvent::new(self.job_id, &self.user_id, snapshot));
        }
    }

    async fn emit_terminal(&self, status: CrawlStatus) {
        let snapshot = {
            let mut progress = self.progress.lock().await;
            progress.status = status;
            progress.current_url = None;
            progress.clone()
        };
        let _ = self
            .events
            .send(ProgressEvent::new(self.job_id, &self.user_id, snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::{CrawlType, PerformanceSettings};
    use crate::crawler::analyzer::{AnalyzeError, MockPageAnalyzer, PageAnalysis};
    use crate::crawler::summary::NoInsights;
    use std::collections::HashMap;
    use url::Url;

    /// Analyzer backed by a static map of pages; unknown URLs 404.
    struct FakeSite {
        pages: HashMap<String, Vec<String>>,
    }

    #[async_trait::async_trait]
    impl PageAnalyzer for FakeSite {
        async fn analyze(&self, url: &Url) -> Result<PageAnalysis, AnalyzeError> {
            let links = self
                .pages
                .get(url.as_str())
                .ok_or_else(|| AnalyzeError::new("http status 404", Some(404)))?;
            Ok(PageAnalysis {
                url: url.to_string(),
                status_code: 200,
                title: Some("t".to_string()),
                links: ExtractedLinks {
                    content: links.clone(),
                    ..Default::default()
                },
                score: Some(90.0),
                issues: Vec::new(),
            })
        }
    }

    fn config(start: &str, max_depth: u32, max_pages: u32) -> CrawlConfiguration {
        CrawlConfiguration {
            crawl_type: CrawlType::WholeDomain,
            start_url: start.to_string(),
            max_depth,
            max_pages,
            performance: PerformanceSettings {
                concurrent: 2,
                delay_between_requests_ms: 0,
                request_timeout_secs: 5,
            },
            ..Default::default()
        }
    }

    fn orchestrator(
        config: CrawlConfiguration,
        analyzer: Arc<dyn PageAnalyzer>,
    ) -> CrawlOrchestrator {
        CrawlOrchestrator::new(
            Uuid::new_v4(),
            "user-1",
            config,
            analyzer,
            Arc::new(NoInsights),
            CancelFlag::new(),
        )
        .unwrap()
    }

    fn site(entries: &[(&str, &[&str])]) -> Arc<FakeSite> {
        Arc::new(FakeSite {
            pages: entries
                .iter()
                .map(|(url, links)| {
                    (
                        url.to_string(),
                        links.iter().map(|l| l.to_string()).collect(),
                    )
                })
                .collect(),
        })
    }

    #[tokio::test]
    async fn crawls_linked_pages_and_completes() {
        let analyzer = site(&[
            (
                "https://a.test/",
                &["https://a.test/one", "https://a.test/two"][..],
            ),
            ("https://a.test/one", &[][..]),
            ("https://a.test/two", &[][..]),
        ]);
        let orch = orchestrator(config("https://a.test/", 2, 50), analyzer);

        let result = orch.run().await.unwrap();
        assert_eq!(result.status, CrawlStatus::Completed);
        assert_eq!(result.pages.len(), 3);
        assert_eq!(result.errors.len(), 0);
        assert_eq!(result.summary.successful_pages, 3);
    }

    #[tokio::test]
    async fn depth_bound_is_enforced() {
        // Chain: / -> a -> b; with max_depth=1, b (depth 2) is discovered
        // but never fetched.
        let analyzer = site(&[
            ("https://a.test/", &["https://a.test/a"][..]),
            ("https://a.test/a", &["https://a.test/b"][..]),
            ("https://a.test/b", &[][..]),
        ]);
        let orch = orchestrator(config("https://a.test/", 1, 50), analyzer);

        let result = orch.run().await.unwrap();
        let urls: Vec<&str> = result.pages.iter().map(|p| p.analysis.url.as_str()).collect();
        assert!(urls.contains(&"https://a.test/"));
        assert!(urls.contains(&"https://a.test/a"));
        assert!(!urls.contains(&"https://a.test/b"));
        assert!(result.pages.iter().all(|p| p.depth <= 1));
    }

    #[tokio::test]
    async fn page_budget_caps_fetches() {
        let links: Vec<String> = (0..10).map(|i| format!("https://a.test/p{i}")).collect();
        let mut pages: HashMap<String, Vec<String>> = HashMap::new();
        pages.insert("https://a.test/".to_string(), links.clone());
        for link in &links {
            pages.insert(link.clone(), Vec::new());
        }
        let orch = orchestrator(
            config("https://a.test/", 3, 5),
            Arc::new(FakeSite { pages }),
        );

        let result = orch.run().await.unwrap();
        assert_eq!(result.status, CrawlStatus::Completed);
        assert_eq!(result.pages.len(), 5);
    }

    #[tokio::test]
    async fn page_errors_do_not_abort_the_job() {
        let analyzer = site(&[(
            "https://a.test/",
            &["https://a.test/ok", "https://a.test/missing"][..],
        ), ("https://a.test/ok", &[][..])]);
        let orch = orchestrator(config("https://a.test/", 2, 50), analyzer);

        let result = orch.run().await.unwrap();
        assert_eq!(result.status, CrawlStatus::Completed);
        assert_eq!(result.pages.len(), 2);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].status_code, Some(404));
        assert_eq!(result.summary.error_pages, 1);
    }

    #[tokio::test]
    async fn unreachable_seed_fails_the_job() {
        let mut mock = MockPageAnalyzer::new();
        mock.expect_analyze()
            .returning(|_| Err(AnalyzeError::new("http status 500", Some(500))));

        let orch = orchestrator(config("https://a.test/", 1, 10), Arc::new(mock));
        let err = orch.run().await.unwrap_err();
        assert!(matches!(err, CrawlerError::SeedUnreachable(_)));
    }

    #[tokio::test]
    async fn cancellation_stops_the_crawl() {
        let cancel = CancelFlag::new();
        cancel.cancel();

        let analyzer = site(&[("https://a.test/", &[][..])]);
        let orch = CrawlOrchestrator::new(
            Uuid::new_v4(),
            "user-1",
            config("https://a.test/", 1, 10),
            analyzer,
            Arc::new(NoInsights),
            cancel,
        )
        .unwrap();

        let result = orch.run().await.unwrap();
        assert_eq!(result.status, CrawlStatus::Stopped);
        assert!(result.pages.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn chained_discoveries_are_never_lost_at_drain() {
        // Each page links only to the next, so dropping any page's links
        // truncates the crawl. Idle workers racing the link feedback must
        // never observe an empty frontier and end the job early.
        const CHAIN: usize = 30;
        let mut pages: HashMap<String, Vec<String>> = HashMap::new();
        for i in 0..CHAIN {
            let url = if i == 0 {
                "https://a.test/".to_string()
            } else {
                format!("https://a.test/p{i}")
            };
            let next = if i + 1 < CHAIN {
                vec![format!("https://a.test/p{}", i + 1)]
            } else {
                Vec::new()
            };
            pages.insert(url, next);
        }

        for _ in 0..25 {
            let mut cfg = config("https://a.test/", CHAIN as u32, 1000);
            cfg.performance.concurrent = 8;
            let orch = orchestrator(cfg, Arc::new(FakeSite { pages: pages.clone() }));

            let result = orch.run().await.unwrap();
            assert_eq!(result.status, CrawlStatus::Completed);
            assert_eq!(result.pages.len(), CHAIN);
        }
    }

    #[tokio::test]
    async fn pause_suspends_workers_until_resume() {
        let links: Vec<String> = (0..4).map(|i| format!("https://a.test/p{i}")).collect();
        let mut pages: HashMap<String, Vec<String>> = HashMap::new();
        pages.insert("https://a.test/".to_string(), links.clone());
        for link in &links {
            pages.insert(link.clone(), Vec::new());
        }
        let orch = orchestrator(
            config("https://a.test/", 2, 50),
            Arc::new(FakeSite { pages }),
        );

        orch.pause();
        let runner = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.run().await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        let progress = orch.progress().await;
        assert_eq!(progress.status, CrawlStatus::Paused);
        assert_eq!(progress.crawled, 0);

        orch.resume();
        let result = runner.await.unwrap().unwrap();
        assert_eq!(result.status, CrawlStatus::Completed);
        assert_eq!(result.pages.len(), 5);
    }

    /// Analyzer that holds every fetch long enough for stop() to land first.
    struct SlowSite;

    #[async_trait::async_trait]
    impl PageAnalyzer for SlowSite {
        async fn analyze(&self, url: &Url) -> Result<PageAnalysis, AnalyzeError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let links = (0..10).map(|i| format!("{url}sub{i}/")).collect();
            Ok(PageAnalysis {
                url: url.to_string(),
                status_code: 200,
                title: None,
                links: ExtractedLinks {
                    content: links,
                    ..Default::default()
                },
                score: Some(80.0),
                issues: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn stop_ends_the_crawl_before_the_frontier_drains() {
        let orch = orchestrator(config("https://a.test/", 5, 1000), Arc::new(SlowSite));
        let runner = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.run().await })
        };

        tokio::time::sleep(Duration::from_millis(120)).await;
        orch.stop();

        let result = runner.await.unwrap().unwrap();
        assert_eq!(result.status, CrawlStatus::Stopped);
        assert!(result.pages.len() < 1000);
    }

    #[tokio::test]
    async fn progress_events_are_emitted() {
        let analyzer = site(&[("https://a.test/", &["https://a.test/one"][..]), ("https://a.test/one", &[][..])]);
        let orch = orchestrator(config("https://a.test/", 1, 10), analyzer);
        let mut events = orch.subscribe();

        let result = orch.run().await.unwrap();
        assert_eq!(result.status, CrawlStatus::Completed);

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        let last = last.expect("at least one progress event");
        assert_eq!(last.progress.status, CrawlStatus::Completed);
        assert_eq!(last.progress.crawled, 2);
    }
}
