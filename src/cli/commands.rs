use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::cli::config::{AppConfig, CrawlConfiguration, CrawlType};
use crate::crawler::analyzer::HttpAnalyzer;
use crate::crawler::progress::{ProgressEvent, ProgressSink};
use crate::crawler::summary::NoInsights;
use crate::queue::{CrawlJobHandler, JobQueue, JobState, QueueSettings, RedisJobStore};
use crate::storage::MemoryResultStore;

/// Sink that prints progress lines for the attached terminal.
struct ConsoleSink;

#[async_trait]
impl ProgressSink for ConsoleSink {
    async fn publish(&self, event: ProgressEvent) {
        let progress = &event.progress;
        let eta = progress
            .estimated_time_remaining_secs
            .map(|secs| format!(", ~{secs}s left"))
            .unwrap_or_default();
        println!(
            "[{}] {}/{} pages, {} errors, {:.1} pages/min{}",
            progress.status, progress.crawled, progress.total, progress.errors,
            progress.pages_per_minute, eta
        );
    }
}

fn load_config(profile: Option<&str>) -> Result<AppConfig> {
    match profile {
        Some(profile) => {
            AppConfig::load_profile(profile).context(format!("Failed to load profile: {profile}"))
        }
        None => AppConfig::load_default(),
    }
}

fn parse_job_id(job_id: &str) -> Result<Uuid> {
    Uuid::parse_str(job_id).context(format!("'{job_id}' is not a valid job id"))
}

async fn open_store(config: &AppConfig) -> Result<RedisJobStore> {
    let redis_url = config.redis_url.as_deref().context(
        "No redis_url configured; jobs from other processes are not reachable",
    )?;
    RedisJobStore::new(redis_url).await
}

fn parse_scope(scope: &str) -> Result<CrawlType> {
    match scope {
        "single-page" => Ok(CrawlType::SinglePage),
        "subfolder" => Ok(CrawlType::Subfolder),
        "whole-domain" => Ok(CrawlType::WholeDomain),
        other => anyhow::bail!(
            "Unknown scope '{other}', expected single-page, subfolder or whole-domain"
        ),
    }
}

/// Build the queue with its crawl handler and run one job to completion.
async fn run_job(app: &AppConfig, config: CrawlConfiguration) -> Result<()> {
    let analyzer = HttpAnalyzer::new(
        Duration::from_secs(config.performance.request_timeout_secs),
        config.analysis.clone(),
    )?;

    let handler = CrawlJobHandler::new(
        Arc::new(analyzer),
        Arc::new(NoInsights),
        Arc::new(MemoryResultStore::new()),
    );

    let store = match &app.redis_url {
        Some(url) => Some(Arc::new(RedisJobStore::new(url).await?)),
        None => None,
    };

    let queue = JobQueue::new(
        QueueSettings::from(&app.queue),
        Arc::new(handler),
        Arc::new(ConsoleSink),
        store,
    );
    queue.start();

    let job_id = queue.add_job("cli", config).await?;
    info!("Job started with ID: {}", job_id);

    let state = loop {
        let state = queue.job_status(job_id).await?;
        if state.is_terminal() {
            break state;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    };

    let job = queue.job(job_id).await?;
    println!("Job {job_id} finished: {state}");
    if let Some(result) = &job.result {
        let summary = &result.summary;
        let score = summary
            .average_score
            .map(|s| format!("{s:.1}"))
            .unwrap_or_else(|| "n/a".to_string());
        println!(
            "Analyzed {} pages in {:.1}s ({} errors, average score {})",
            summary.successful_pages, summary.duration_secs, summary.error_pages, score
        );
    }
    if let Some(reason) = &job.failed_reason {
        println!("Failure reason: {reason}");
    }

    queue.shutdown();
    if state == JobState::Failed {
        anyhow::bail!("Job {job_id} failed");
    }
    Ok(())
}

/// Run a crawl in this process and wait for it to finish.
pub async fn crawl(
    url: String,
    profile: Option<String>,
    depth: Option<u32>,
    limit: Option<u32>,
    concurrent: Option<usize>,
    scope: Option<String>,
) -> Result<()> {
    let app = load_config(profile.as_deref())?;

    let mut config = CrawlConfiguration {
        start_url: url,
        max_depth: depth.unwrap_or(app.crawl.max_depth),
        max_pages: limit.unwrap_or(app.crawl.max_pages),
        ..Default::default()
    };
    config.performance.concurrent = concurrent.unwrap_or(app.crawl.concurrent);
    config.performance.delay_between_requests_ms = app.crawl.delay_between_requests_ms;
    if let Some(scope) = scope.as_deref() {
        config.crawl_type = parse_scope(scope)?;
    }

    run_job(&app, config).await
}

/// Check the status of a job, including jobs owned by other processes.
pub async fn status(job_id: String) -> Result<()> {
    let id = parse_job_id(&job_id)?;
    let app = load_config(None)?;
    let store = open_store(&app).await?;

    let record = store
        .get(id)
        .await?
        .context(format!("Job {id} not found"))?;

    println!("Job ID: {}", record.id);
    println!("Status: {}", record.state);
    println!("Attempts: {}", record.attempts_made);
    println!("Created: {}", record.created_at);
    if let Some(started) = record.started_at {
        println!("Started: {started}");
    }
    if let Some(progress) = &record.progress {
        println!("Pages: {}/{}", progress.crawled, progress.total);
        println!("Errors: {}", progress.errors);
    }
    if let Some(reason) = &record.failed_reason {
        println!("Failure reason: {reason}");
    }

    Ok(())
}

/// Print a finished job's result as JSON.
pub async fn result(job_id: String) -> Result<()> {
    let id = parse_job_id(&job_id)?;
    let app = load_config(None)?;
    let store = open_store(&app).await?;

    let record = store
        .get(id)
        .await?
        .context(format!("Job {id} not found"))?;

    match &record.result {
        Some(result) => {
            let json = serde_json::to_string_pretty(result)
                .context("Failed to serialize crawl result")?;
            println!("{json}");
        }
        None => println!("Job {} has no result yet (status: {})", record.id, record.state),
    }

    Ok(())
}

/// Request cancellation of a job. The owning process observes the marker
/// on its next dispatcher tick.
pub async fn cancel(job_id: String) -> Result<()> {
    let id = parse_job_id(&job_id)?;
    let app = load_config(None)?;
    let store = open_store(&app).await?;

    store
        .get(id)
        .await?
        .context(format!("Job {id} not found"))?;
    store.request_cancel(id).await?;

    println!("Cancellation requested for job {id}");
    Ok(())
}

/// Re-run a failed job's configuration as a fresh crawl in this process.
pub async fn retry(job_id: String) -> Result<()> {
    let id = parse_job_id(&job_id)?;
    let app = load_config(None)?;
    let store = open_store(&app).await?;

    let record = store
        .get(id)
        .await?
        .context(format!("Job {id} not found"))?;
    if record.state != JobState::Failed {
        anyhow::bail!("Job {} is {}, only failed jobs can be retried", id, record.state);
    }

    info!("Re-running configuration of failed job {}", id);
    run_job(&app, record.config).await
}

/// Aggregate counters over all mirrored job records.
pub async fn metrics() -> Result<()> {
    let app = load_config(None)?;
    let store = open_store(&app).await?;

    let records = store.scan_records().await?;
    let count = |state: JobState| records.iter().filter(|r| r.state == state).count();

    println!("Jobs: {}", records.len());
    println!("  waiting:   {}", count(JobState::Waiting));
    println!("  active:    {}", count(JobState::Active));
    println!("  delayed:   {}", count(JobState::Delayed));
    println!("  completed: {}", count(JobState::Completed));
    println!("  failed:    {}", count(JobState::Failed));
    println!("  cancelled: {}", count(JobState::Cancelled));

    Ok(())
}

/// List all available profiles
pub async fn list_profiles() -> Result<()> {
    let profiles = AppConfig::list_profiles()?;

    if profiles.is_empty() {
        println!("No configuration profiles found");
    } else {
        println!("Available profiles:");
        for profile in profiles {
            println!("  - {profile}");
        }
    }

    Ok(())
}

/// Create or show a named profile.
pub async fn manage_profile(profile: String) -> Result<()> {
    match AppConfig::load_profile(&profile) {
        Ok(config) => {
            let yaml = serde_yaml::to_string(&config).context("Failed to serialize profile")?;
            println!("{yaml}");
        }
        Err(_) => {
            info!("Profile '{}' not found, creating it from defaults", profile);
            let config = AppConfig::default();
            config.save_as_profile(&profile)?;
            println!("Created profile '{profile}'");
        }
    }

    Ok(())
}

/// Show the current default configuration.
pub async fn show_config() -> Result<()> {
    let config = AppConfig::load_default()?;
    let yaml = serde_yaml::to_string(&config).context("Failed to serialize configuration")?;
    println!("{yaml}");
    Ok(())
}
