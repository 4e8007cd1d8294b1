use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::cli::config::AnalysisSettings;

/// Failure to fetch or analyze a single page. Carries the HTTP status when
/// one was observed so the crawl error log can report it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct AnalyzeError {
    pub message: String,
    pub status_code: Option<u16>,
}

impl AnalyzeError {
    pub fn new(message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self {
            message: message.into(),
            status_code,
        }
    }
}

/// Links extracted from a page, grouped by placement. Placement feeds the
/// frontier's priority scoring; `external` links point off-host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedLinks {
    pub navigation: Vec<String>,
    pub content: Vec<String>,
    pub footer: Vec<String>,
    pub external: Vec<String>,
}

impl ExtractedLinks {
    pub fn total(&self) -> usize {
        self.navigation.len() + self.content.len() + self.footer.len() + self.external.len()
    }
}

/// Severity of a single page issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Critical,
    Warning,
    Info,
}

/// One finding from the page analysis pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub severity: IssueSeverity,
    pub message: String,
}

/// Outcome of fetching and analyzing one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageAnalysis {
    pub url: String,
    pub status_code: u16,
    pub title: Option<String>,
    pub links: ExtractedLinks,
    /// 0-100 quality score; `None` for non-HTML responses.
    pub score: Option<f32>,
    pub issues: Vec<Issue>,
}

/// Fetch-and-analyze seam. The orchestration core treats the analysis as an
/// opaque, replaceable function; any error becomes a per-page crawl error,
/// never a job failure.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageAnalyzer: Send + Sync {
    async fn analyze(&self, url: &Url) -> Result<PageAnalysis, AnalyzeError>;
}

/// Default analyzer: plain HTTP fetch plus a lightweight on-page SEO pass.
pub struct HttpAnalyzer {
    client: reqwest::Client,
    settings: AnalysisSettings,
}

impl HttpAnalyzer {
    pub fn new(timeout: Duration, settings: AnalysisSettings) -> Result<Self, AnalyzeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sitescan/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AnalyzeError::new(format!("failed to build http client: {e}"), None))?;

        Ok(Self { client, settings })
    }
}

#[async_trait]
impl PageAnalyzer for HttpAnalyzer {
    async fn analyze(&self, url: &Url) -> Result<PageAnalysis, AnalyzeError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| AnalyzeError::new(format!("request failed: {e}"), e.status().map(|s| s.as_u16())))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AnalyzeError::new(
                format!("http status {status}"),
                Some(status.as_u16()),
            ));
        }

        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(true, |ct| ct.contains("text/html") || ct.contains("xhtml"));

        let body = response
            .text()
            .await
            .map_err(|e| AnalyzeError::new(format!("failed to read body: {e}"), Some(status.as_u16())))?;

        if !is_html {
            debug!(url = %url, "skipping analysis of non-html response");
            return Ok(PageAnalysis {
                url: url.to_string(),
                status_code: status.as_u16(),
                title: None,
                links: ExtractedLinks::default(),
                score: None,
                issues: Vec::new(),
            });
        }

        Ok(analyze_html(url, status.as_u16(), &body, &self.settings))
    }
}

/// Parse the document and collect title, classified links and issues.
/// Sync on purpose: `scraper::Html` is not `Send`, so it must not live
/// across an await point.
fn analyze_html(url: &Url, status_code: u16, body: &str, settings: &AnalysisSettings) -> PageAnalysis {
    let document = Html::parse_document(body);

    let nav_selector = Selector::parse("nav a[href], header a[href]").expect("static selector");
    let footer_selector = Selector::parse("footer a[href]").expect("static selector");
    let all_selector = Selector::parse("a[href]").expect("static selector");
    let title_selector = Selector::parse("title").expect("static selector");

    let title = document
        .select(&title_selector)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());

    let resolve = |href: &str| -> Option<Url> {
        match Url::parse(href) {
            Ok(abs) => Some(abs),
            Err(_) => url.join(href).ok(),
        }
    };

    let collect = |selector: &Selector| -> Vec<String> {
        document
            .select(selector)
            .filter_map(|a| a.value().attr("href"))
            .filter_map(|href| resolve(href))
            .map(|u| u.to_string())
            .collect()
    };

    let nav_links = collect(&nav_selector);
    let footer_links = collect(&footer_selector);

    let mut links = ExtractedLinks::default();
    let host = url.host_str().unwrap_or_default().to_string();
    let mut seen = std::collections::HashSet::new();

    let mut place = |raw: String, placement: Placement, links: &mut ExtractedLinks| {
        if !seen.insert(raw.clone()) {
            return;
        }
        let external = Url::parse(&raw)
            .ok()
            .and_then(|u| u.host_str().map(|h| h != host))
            .unwrap_or(false);
        if external {
            links.external.push(raw);
            return;
        }
        match placement {
            Placement::Navigation => links.navigation.push(raw),
            Placement::Footer => links.footer.push(raw),
            Placement::Content => links.content.push(raw),
        }
    };

    for link in nav_links {
        place(link, Placement::Navigation, &mut links);
    }
    for link in footer_links {
        place(link, Placement::Footer, &mut links);
    }
    for link in collect(&all_selector) {
        place(link, Placement::Content, &mut links);
    }

    let issues = collect_issues(&document, title.as_deref(), settings);
    let score = score_from_issues(&issues);

    PageAnalysis {
        url: url.to_string(),
        status_code,
        title,
        links,
        score: Some(score),
        issues,
    }
}

enum Placement {
    Navigation,
    Footer,
    Content,
}

fn collect_issues(document: &Html, title: Option<&str>, settings: &AnalysisSettings) -> Vec<Issue> {
    let mut issues = Vec::new();

    match title {
        None => issues.push(Issue {
            severity: IssueSeverity::Critical,
            message: "page has no <title>".to_string(),
        }),
        Some(t) if t.len() > 70 => issues.push(Issue {
            severity: IssueSeverity::Warning,
            message: format!("title is {} characters, over the 70 character guideline", t.len()),
        }),
        _ => {}
    }

    if settings.check_meta {
        let meta = Selector::parse(r#"meta[name="description"]"#).expect("static selector");
        if document.select(&meta).next().is_none() {
            issues.push(Issue {
                severity: IssueSeverity::Warning,
                message: "missing meta description".to_string(),
            });
        }
    }

    if settings.check_headings {
        let h1 = Selector::parse("h1").expect("static selector");
        match document.select(&h1).count() {
            0 => issues.push(Issue {
                severity: IssueSeverity::Warning,
                message: "page has no <h1>".to_string(),
            }),
            1 => {}
            n => issues.push(Issue {
                severity: IssueSeverity::Info,
                message: format!("page has {n} <h1> elements"),
            }),
        }
    }

    if settings.check_images {
        let img = Selector::parse("img:not([alt])").expect("static selector");
        let missing = document.select(&img).count();
        if missing > 0 {
            issues.push(Issue {
                severity: IssueSeverity::Info,
                message: format!("{missing} images missing alt text"),
            });
        }
    }

    issues
}

/// 100 minus a per-issue penalty, floored at zero.
fn score_from_issues(issues: &[Issue]) -> f32 {
    let penalty: f32 = issues
        .iter()
        .map(|i| match i.severity {
            IssueSeverity::Critical => 15.0,
            IssueSeverity::Warning => 5.0,
            IssueSeverity::Info => 1.0,
        })
        .sum();
    (100.0 - penalty).max(0.0)
}
