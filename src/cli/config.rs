use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use crate::error::CrawlerError;

/// Scope of one crawl job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CrawlType {
    /// Fetch and analyze the start URL only.
    SinglePage,
    /// Stay under the start URL's path prefix.
    Subfolder,
    /// Crawl the whole host (subdomains/external per filter settings).
    WholeDomain,
}

/// Immutable per-job input, created once at submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlConfiguration {
    pub crawl_type: CrawlType,
    pub start_url: String,
    pub max_depth: u32,
    pub max_pages: u32,
    #[serde(default)]
    pub filters: FilterSettings,
    #[serde(default)]
    pub performance: PerformanceSettings,
    #[serde(default)]
    pub analysis: AnalysisSettings,
}

impl CrawlConfiguration {
    /// Validate the configuration at admission time. Rejections here fail
    /// fast and are never retried.
    pub fn validate(&self) -> Result<(), CrawlerError> {
        let url = url::Url::parse(&self.start_url)
            .map_err(|e| CrawlerError::InvalidConfig(format!("start_url: {e}")))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(CrawlerError::InvalidConfig(format!(
                "start_url must be http(s), got {}",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(CrawlerError::InvalidConfig(
                "start_url has no host".to_string(),
            ));
        }
        if self.max_pages == 0 {
            return Err(CrawlerError::InvalidConfig(
                "max_pages must be at least 1".to_string(),
            ));
        }
        if self.performance.concurrent == 0 {
            return Err(CrawlerError::InvalidConfig(
                "performance.concurrent must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CrawlConfiguration {
    fn default() -> Self {
        Self {
            crawl_type: CrawlType::WholeDomain,
            start_url: String::new(),
            max_depth: 3,
            max_pages: 100,
            filters: FilterSettings::default(),
            performance: PerformanceSettings::default(),
            analysis: AnalysisSettings::default(),
        }
    }
}

/// URL admission filters for one job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterSettings {
    /// Glob allow-list (`*` any run, `?` any char); empty = allow all.
    #[serde(default)]
    pub include_patterns: Vec<String>,

    /// Glob deny-list applied after the allow-list.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Allowed file extensions; extensionless paths always pass.
    #[serde(default)]
    pub allowed_extensions: Vec<String>,

    /// Follow links to other registrable domains.
    #[serde(default)]
    pub follow_external: bool,

    /// Follow links to sibling subdomains of the seed.
    #[serde(default)]
    pub analyze_subdomains: bool,

    /// Carried for configuration fidelity; compliance is out of scope.
    #[serde(default)]
    pub respect_robots: bool,
}

/// Concurrency and pacing for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSettings {
    /// Number of workers draining the frontier.
    pub concurrent: usize,

    /// Sleep after each fetched page, per worker.
    pub delay_between_requests_ms: u64,

    /// Per-page fetch timeout in seconds, capped at 60.
    pub request_timeout_secs: u64,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            concurrent: 4,
            delay_between_requests_ms: 200,
            request_timeout_secs: 30,
        }
    }
}

/// Options forwarded to the page analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSettings {
    pub check_meta: bool,
    pub check_headings: bool,
    pub check_images: bool,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            check_meta: true,
            check_headings: true,
            check_images: true,
        }
    }
}

/// Process-level configuration, loaded from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Redis connection for the job-record mirror and the progress bus.
    /// When absent the process runs single-instance, in-memory only.
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub broadcast: BroadcastConfig,

    /// Defaults merged into submitted crawls.
    #[serde(default)]
    pub crawl: CrawlDefaults,
}

/// Job queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Jobs processed at once.
    pub concurrency: usize,
    /// Attempts before a job goes terminally failed.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub backoff_base_ms: u64,
    /// Completed records retained for result retrieval.
    pub keep_completed: usize,
    /// Failed records retained for debugging.
    pub keep_failed: usize,
    /// Aggregate metrics are recomputed at most this often.
    pub metrics_interval_secs: u64,
    /// Processing-time estimate used before any job has completed.
    pub default_processing_time_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            max_attempts: 3,
            backoff_base_ms: 2_000,
            keep_completed: 10,
            keep_failed: 50,
            metrics_interval_secs: 10,
            default_processing_time_secs: 300,
        }
    }
}

/// Progress broadcaster tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Seconds an unauthenticated connection may linger.
    pub auth_timeout_secs: u64,
    /// Seconds of inactivity before a session is evicted.
    pub idle_timeout_secs: u64,
    /// Minimum gap between deliveries for one job.
    pub throttle_window_ms: u64,
    /// Concurrent connections allowed per source address.
    pub max_connections_per_addr: usize,
    /// New connections per source address per rolling minute.
    pub max_new_connections_per_minute: usize,
    /// Lifetime of cached progress snapshots.
    pub snapshot_ttl_secs: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            auth_timeout_secs: 30,
            idle_timeout_secs: 300,
            throttle_window_ms: 1_000,
            max_connections_per_addr: 5,
            max_new_connections_per_minute: 10,
            snapshot_ttl_secs: 30,
        }
    }
}

/// Crawl parameter defaults applied when the CLI omits them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlDefaults {
    pub max_depth: u32,
    pub max_pages: u32,
    pub concurrent: usize,
    pub delay_between_requests_ms: u64,
}

impl Default for CrawlDefaults {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_pages: 100,
            concurrent: 4,
            delay_between_requests_ms: 200,
        }
    }
}

impl AppConfig {
    /// Platform config directory, created on first use.
    fn config_dir() -> PathBuf {
        let path = directories::ProjectDirs::from("com", "sitescan", "sitescan")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("./config"));

        if let Err(e) = fs::create_dir_all(path.join("profiles")) {
            error!("Failed to create config directory: {}", e);
        }
        path
    }

    /// Load the default configuration, creating it on first run.
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_dir().join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_to_file(&config_path)?;
            Ok(config)
        }
    }

    fn profile_path(profile: &str) -> PathBuf {
        Self::config_dir()
            .join("profiles")
            .join(format!("{profile}.yaml"))
    }

    /// Load a named configuration profile.
    pub fn load_profile(profile: &str) -> Result<Self> {
        let path = Self::profile_path(profile);
        if !path.exists() {
            anyhow::bail!("Profile '{}' not found", profile);
        }
        Self::load_from_file(&path)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))
    }

    /// Save the configuration as a named profile.
    pub fn save_as_profile(&self, profile: &str) -> Result<()> {
        self.save_to_file(&Self::profile_path(profile))
    }

    fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory: {}", parent.display()))?;
        }
        let contents = serde_yaml::to_string(self).context("Failed to serialize configuration")?;
        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))
    }

    /// Names of all saved profiles.
    pub fn list_profiles() -> Result<Vec<String>> {
        let profiles_dir = Self::config_dir().join("profiles");
        if !profiles_dir.exists() {
            return Ok(vec![]);
        }

        let mut profiles = Vec::new();
        for entry in fs::read_dir(profiles_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "yaml") {
                if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                    profiles.push(name.to_string());
                }
            }
        }
        profiles.sort();
        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(start_url: &str) -> CrawlConfiguration {
        CrawlConfiguration {
            start_url: start_url.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn valid_configuration_passes() {
        assert!(config("https://example.com/").validate().is_ok());
    }

    #[test]
    fn malformed_start_url_is_rejected() {
        assert!(config("not a url").validate().is_err());
        assert!(config("ftp://example.com/").validate().is_err());
    }

    #[test]
    fn zero_budgets_are_rejected() {
        let mut c = config("https://example.com/");
        c.max_pages = 0;
        assert!(c.validate().is_err());

        let mut c = config("https://example.com/");
        c.performance.concurrent = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn crawl_configuration_round_trips_through_yaml() {
        let c = config("https://example.com/");
        let yaml = serde_yaml::to_string(&c).unwrap();
        let back: CrawlConfiguration = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.start_url, c.start_url);
        assert_eq!(back.crawl_type, CrawlType::WholeDomain);
    }
}
