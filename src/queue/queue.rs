use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cli::config::{CrawlConfiguration, QueueConfig};
use crate::crawler::progress::{CrawlStatus, ProgressEvent, ProgressSink};
use crate::crawler::summary::CrawlResult;
use crate::error::CrawlerError;

use super::job::{CancelFlag, JobRecord, JobState};
use super::store::RedisJobStore;

/// Completed-job durations kept for the processing-time average.
const PROCESSING_TIME_SAMPLES: usize = 99;

/// Queue tuning, in runtime units.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub keep_completed: usize,
    pub keep_failed: usize,
    pub metrics_interval: Duration,
    pub default_processing_time: Duration,
    /// Dispatcher tick; cancellation and delayed-job promotion are observed
    /// at this granularity.
    pub poll_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for QueueSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            keep_completed: config.keep_completed,
            keep_failed: config.keep_failed,
            metrics_interval: Duration::from_secs(config.metrics_interval_secs),
            default_processing_time: Duration::from_secs(config.default_processing_time_secs),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Executes one admitted job. Implementations receive the cancel flag and a
/// progress sink through the context; a returned error triggers queue-level
/// retry with backoff.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: JobRecord, ctx: JobContext) -> anyhow::Result<CrawlResult>;
}

/// Per-attempt execution context handed to the handler.
#[derive(Clone)]
pub struct JobContext {
    pub cancel: CancelFlag,
    pub progress: Arc<dyn ProgressSink>,
}

/// Aggregate queue counters, recomputed at most once per metrics interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub average_processing_secs: f64,
    pub computed_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<Uuid, JobRecord>,
    waiting: VecDeque<Uuid>,
    delayed: Vec<(Instant, Uuid)>,
    active: HashSet<Uuid>,
    cancel_flags: HashMap<Uuid, CancelFlag>,
    completed_order: VecDeque<Uuid>,
    failed_order: VecDeque<Uuid>,
    processing_times: VecDeque<Duration>,
    metrics_cache: Option<(Instant, QueueMetrics)>,
}

/// Admits, schedules, retries and reclaims crawl jobs.
///
/// The in-process state is the single source of truth for job status; the
/// optional redis mirror only serves cross-process status lookups and
/// cancellation markers. Constructed once at startup and passed by handle.
pub struct JobQueue {
    settings: QueueSettings,
    state: Arc<Mutex<QueueState>>,
    handler: Arc<dyn JobHandler>,
    sink: Arc<dyn ProgressSink>,
    store: Option<Arc<RedisJobStore>>,
    shutdown: Arc<AtomicBool>,
}

impl JobQueue {
    pub fn new(
        settings: QueueSettings,
        handler: Arc<dyn JobHandler>,
        sink: Arc<dyn ProgressSink>,
        store: Option<Arc<RedisJobStore>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            state: Arc::new(Mutex::new(QueueState::default())),
            handler,
            sink,
            store,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Spawn the dispatcher loop. Idempotent shutdown via [`JobQueue::shutdown`].
    pub fn start(self: &Arc<Self>) {
        let queue = self.clone();
        tokio::spawn(async move {
            info!(concurrency = queue.settings.concurrency, "job queue dispatcher started");
            loop {
                if queue.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                queue.tick().await;
                tokio::time::sleep(queue.settings.poll_interval).await;
            }
            debug!("job queue dispatcher stopped");
        });
    }

    /// Stop dispatching new jobs. Active jobs keep running.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Admit a crawl job. Configuration problems fail fast here and are
    /// never retried.
    pub async fn add_job(
        &self,
        user_id: impl Into<String>,
        config: CrawlConfiguration,
    ) -> Result<Uuid, CrawlerError> {
        config.validate()?;

        let record = JobRecord::new(user_id, config);
        let id = record.id;

        {
            let mut state = self.state.lock().await;
            state.waiting.push_back(id);
            state.jobs.insert(id, record.clone());
        }
        self.mirror_save(&record).await;

        info!(job_id = %id, url = %record.config.start_url, "job admitted");
        Ok(id)
    }

    /// Current state of a job, or `JobNotFound` once it is reclaimed or
    /// removed by cancellation.
    pub async fn job_status(&self, id: Uuid) -> Result<JobState, CrawlerError> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(&id)
            .map(|j| j.state)
            .ok_or(CrawlerError::JobNotFound(id))
    }

    /// Full record for a job.
    pub async fn job(&self, id: Uuid) -> Result<JobRecord, CrawlerError> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(&id)
            .cloned()
            .ok_or(CrawlerError::JobNotFound(id))
    }

    /// Result of a completed job, `None` while it has none.
    pub async fn job_result(&self, id: Uuid) -> Result<Option<CrawlResult>, CrawlerError> {
        Ok(self.job(id).await?.result)
    }

    /// Cancel a job. Waiting and delayed jobs are removed immediately;
    /// active jobs get their cancel flag set and wind down cooperatively.
    /// Returns whether anything changed, so a repeated cancel is a no-op.
    pub async fn cancel_job(&self, id: Uuid) -> Result<bool, CrawlerError> {
        let removed_record = {
            let mut state = self.state.lock().await;

            let Some(job_state) = state.jobs.get(&id).map(|j| j.state) else {
                return Ok(false);
            };

            match job_state {
                JobState::Waiting => {
                    state.waiting.retain(|j| *j != id);
                    state.jobs.remove(&id)
                }
                JobState::Delayed => {
                    state.delayed.retain(|(_, j)| *j != id);
                    state.jobs.remove(&id)
                }
                JobState::Active => {
                    let Some(flag) = state.cancel_flags.get(&id) else {
                        return Ok(false);
                    };
                    if flag.is_cancelled() {
                        return Ok(false);
                    }
                    flag.cancel();
                    info!(job_id = %id, "cancellation requested for active job");
                    return Ok(true);
                }
                // Terminal and paused jobs have nothing to cancel.
                _ => return Ok(false),
            }
        };

        if removed_record.is_some() {
            info!(job_id = %id, "job removed by cancellation");
            self.mirror_delete(id).await;
        }
        Ok(removed_record.is_some())
    }

    /// Re-queue a failed job with a fresh attempt budget.
    pub async fn retry_job(&self, id: Uuid) -> Result<(), CrawlerError> {
        let record = {
            let mut state = self.state.lock().await;
            let job = state
                .jobs
                .get_mut(&id)
                .ok_or(CrawlerError::JobNotFound(id))?;

            if job.state != JobState::Failed {
                return Err(CrawlerError::InvalidJobState {
                    id,
                    state: job.state.to_string(),
                    action: "retry",
                });
            }

            job.state = JobState::Waiting;
            job.attempts_made = 0;
            job.failed_reason = None;
            job.completed_at = None;
            let record = job.clone();

            state.failed_order.retain(|j| *j != id);
            state.waiting.push_back(id);
            record
        };

        info!(job_id = %id, "failed job re-queued");
        self.mirror_save(&record).await;
        Ok(())
    }

    /// 1-based position among currently waiting jobs; `None` when the job
    /// is not waiting.
    pub async fn queue_position(&self, id: Uuid) -> Result<Option<usize>, CrawlerError> {
        let state = self.state.lock().await;
        if !state.jobs.contains_key(&id) {
            return Err(CrawlerError::JobNotFound(id));
        }
        Ok(state.waiting.iter().position(|j| *j == id).map(|p| p + 1))
    }

    /// Estimated wait for a given queue position:
    /// `ceil(position / concurrency) * average_processing_time`.
    pub async fn estimated_wait(&self, position: usize) -> Duration {
        let avg = {
            let state = self.state.lock().await;
            self.average_processing(&state)
        };
        let rounds = position.div_ceil(self.settings.concurrency);
        avg * rounds as u32
    }

    /// Aggregate counters, served from a cache no older than the metrics
    /// interval so status polls never trigger a full scan each time.
    pub async fn metrics(&self) -> QueueMetrics {
        let mut state = self.state.lock().await;

        if let Some((computed, cached)) = &state.metrics_cache {
            if computed.elapsed() < self.settings.metrics_interval {
                return cached.clone();
            }
        }

        let mut metrics = QueueMetrics {
            waiting: 0,
            active: 0,
            completed: 0,
            failed: 0,
            delayed: 0,
            average_processing_secs: self.average_processing(&state).as_secs_f64(),
            computed_at: Utc::now(),
        };
        for job in state.jobs.values() {
            match job.state {
                JobState::Waiting => metrics.waiting += 1,
                JobState::Active => metrics.active += 1,
                JobState::Completed => metrics.completed += 1,
                JobState::Failed => metrics.failed += 1,
                JobState::Delayed => metrics.delayed += 1,
                JobState::Paused | JobState::Cancelled => {}
            }
        }

        state.metrics_cache = Some((Instant::now(), metrics.clone()));
        metrics
    }

    fn average_processing(&self, state: &QueueState) -> Duration {
        if state.processing_times.is_empty() {
            return self.settings.default_processing_time;
        }
        let total: Duration = state.processing_times.iter().sum();
        total / state.processing_times.len() as u32
    }

    /// One dispatcher pass: promote due delayed jobs, observe external
    /// cancel markers, start waiting jobs up to the concurrency limit.
    async fn tick(self: &Arc<Self>) {
        if let Some(store) = &self.store {
            self.observe_cancel_markers(store).await;
        }

        let to_start: Vec<Uuid> = {
            let mut state = self.state.lock().await;

            let now = Instant::now();
            let due: Vec<Uuid> = {
                let (due, pending): (Vec<_>, Vec<_>) =
                    state.delayed.drain(..).partition(|(at, _)| *at <= now);
                state.delayed = pending;
                due.into_iter().map(|(_, id)| id).collect()
            };
            for id in due {
                if let Some(job) = state.jobs.get_mut(&id) {
                    job.state = JobState::Waiting;
                    state.waiting.push_back(id);
                }
            }

            let mut started = Vec::new();
            while state.active.len() + started.len() < self.settings.concurrency {
                let Some(id) = state.waiting.pop_front() else {
                    break;
                };
                started.push(id);
            }
            started
        };

        for id in to_start {
            self.start_job(id).await;
        }
    }

    async fn start_job(self: &Arc<Self>, id: Uuid) {
        let (record, flag) = {
            let mut state = self.state.lock().await;
            let Some(job) = state.jobs.get_mut(&id) else {
                return;
            };
            job.state = JobState::Active;
            job.started_at = Some(Utc::now());
            job.attempts_made += 1;
            let record = job.clone();

            let flag = CancelFlag::new();
            state.active.insert(id);
            state.cancel_flags.insert(id, flag.clone());
            (record, flag)
        };
        self.mirror_save(&record).await;

        info!(job_id = %id, attempt = record.attempts_made, "job started");

        let queue = self.clone();
        tokio::spawn(async move {
            let ctx = JobContext {
                cancel: flag,
                progress: Arc::new(RecordingSink {
                    state: queue.state.clone(),
                    store: queue.store.clone(),
                    inner: queue.sink.clone(),
                }),
            };
            let outcome = queue.handler.run(record, ctx).await;
            queue.finish_job(id, outcome).await;
        });
    }

    async fn finish_job(self: &Arc<Self>, id: Uuid, outcome: anyhow::Result<CrawlResult>) {
        let mirror: Option<JobRecord> = {
            let mut state = self.state.lock().await;
            state.active.remove(&id);
            state.cancel_flags.remove(&id);

            // Take the record out so the remaining queue state can be
            // updated alongside it without aliasing the jobs map.
            let Some(mut job) = state.jobs.remove(&id) else {
                // Reclaimed while running (cancellation race); nothing to record.
                return;
            };

            match outcome {
                Ok(result) => {
                    // A crawl that stopped early was cancelled, not completed;
                    // its truncated duration would also skew the wait estimate.
                    let cancelled = result.status == CrawlStatus::Stopped;
                    job.state = if cancelled {
                        JobState::Cancelled
                    } else {
                        JobState::Completed
                    };
                    job.completed_at = Some(Utc::now());
                    if !cancelled {
                        if let (Some(started), Some(finished)) = (job.started_at, job.completed_at)
                        {
                            let elapsed = (finished - started).to_std().unwrap_or(Duration::ZERO);
                            state.processing_times.push_back(elapsed);
                            while state.processing_times.len() > PROCESSING_TIME_SAMPLES {
                                state.processing_times.pop_front();
                            }
                        }
                    }
                    job.result = Some(result);
                    state.jobs.insert(id, job.clone());
                    state.completed_order.push_back(id);
                    Self::prune_terminal(&mut state, true, self.settings.keep_completed);
                    info!(job_id = %id, state = %job.state, "job finished");
                    Some(job)
                }
                Err(e) => {
                    if job.attempts_made < self.settings.max_attempts {
                        let delay = self.settings.backoff_base
                            * 2u32.saturating_pow(job.attempts_made.saturating_sub(1));
                        job.state = JobState::Delayed;
                        warn!(
                            job_id = %id,
                            attempt = job.attempts_made,
                            delay_ms = delay.as_millis() as u64,
                            "job attempt failed, retrying: {e:#}"
                        );
                        state.jobs.insert(id, job.clone());
                        state.delayed.push((Instant::now() + delay, id));
                        Some(job)
                    } else {
                        job.state = JobState::Failed;
                        job.completed_at = Some(Utc::now());
                        job.failed_reason = Some(format!("{e:#}"));
                        error!(job_id = %id, "job failed permanently: {e:#}");
                        state.jobs.insert(id, job.clone());
                        state.failed_order.push_back(id);
                        Self::prune_terminal(&mut state, false, self.settings.keep_failed);
                        Some(job)
                    }
                }
            }
        };

        if let Some(record) = mirror {
            self.mirror_save(&record).await;
        }
    }

    /// Drop the oldest terminal records beyond the retention limit.
    fn prune_terminal(state: &mut QueueState, completed: bool, keep: usize) {
        let order = if completed {
            &mut state.completed_order
        } else {
            &mut state.failed_order
        };
        while order.len() > keep {
            if let Some(old) = order.pop_front() {
                state.jobs.remove(&old);
                debug!(job_id = %old, "terminal job reclaimed");
            }
        }
    }

    /// Pick up cancel markers written by other processes via redis.
    async fn observe_cancel_markers(&self, store: &Arc<RedisJobStore>) {
        let flags: Vec<(Uuid, CancelFlag)> = {
            let state = self.state.lock().await;
            state
                .cancel_flags
                .iter()
                .filter(|(_, f)| !f.is_cancelled())
                .map(|(id, f)| (*id, f.clone()))
                .collect()
        };
        for (id, flag) in flags {
            match store.is_cancel_requested(id).await {
                Ok(true) => {
                    info!(job_id = %id, "external cancel marker observed");
                    flag.cancel();
                }
                Ok(false) => {}
                Err(e) => {
                    debug!("cancel marker check failed: {e:#}");
                    break;
                }
            }
        }
    }

    async fn mirror_save(&self, record: &JobRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(record).await {
                warn!(job_id = %record.id, "failed to mirror job record: {e:#}");
            }
        }
    }

    async fn mirror_delete(&self, id: Uuid) {
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(id).await {
                warn!(job_id = %id, "failed to delete mirrored job record: {e:#}");
            }
        }
    }
}

/// Sink wrapper that records the latest progress snapshot on the job record
/// (and its redis mirror) before forwarding to the real sink.
struct RecordingSink {
    state: Arc<Mutex<QueueState>>,
    store: Option<Arc<RedisJobStore>>,
    inner: Arc<dyn ProgressSink>,
}

#[async_trait]
impl ProgressSink for RecordingSink {
    async fn publish(&self, event: ProgressEvent) {
        let record = {
            let mut state = self.state.lock().await;
            if let Some(job) = state.jobs.get_mut(&event.job_id) {
                job.progress = Some(event.progress.clone());
                Some(job.clone())
            } else {
                None
            }
        };
        if let (Some(store), Some(record)) = (&self.store, record) {
            if let Err(e) = store.save(&record).await {
                debug!("failed to mirror progress: {e:#}");
            }
        }
        self.inner.publish(event).await;
    }
}
