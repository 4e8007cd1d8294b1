use serde::{Deserialize, Serialize};
use url::Url;

/// Where a URL was discovered. The variant drives part of the priority
/// score: structurally significant placements (sitemap, navigation) are
/// favored over incidental ones (footer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkSource {
    /// The seed URL of the job.
    Start,
    Sitemap,
    Navigation,
    Content,
    Footer,
    /// A link whose placement could not be classified.
    Link,
}

impl LinkSource {
    /// Priority weight contributed by the discovery source.
    pub fn weight(self) -> i32 {
        match self {
            LinkSource::Sitemap => 30,
            LinkSource::Navigation => 20,
            LinkSource::Content => 10,
            LinkSource::Footer => -10,
            LinkSource::Start | LinkSource::Link => 0,
        }
    }
}

/// Coarse classification of a URL path, used for priority scoring.
/// Explicit decision table so the rule set stays reviewable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    /// `/`, `/index.html` and friends.
    Root,
    /// Product or service pages.
    Product,
    /// Blog posts, articles, news.
    Article,
    /// Tag/category listings, typically low-value duplicates.
    Tag,
    /// Search and filter result pages.
    Search,
    Other,
}

impl PathClass {
    /// Classify a URL by its path segments and query string.
    pub fn classify(url: &Url) -> Self {
        let path = url.path().to_ascii_lowercase();

        if path == "/" || path.is_empty() {
            return PathClass::Root;
        }
        if let Some(name) = path.rsplit('/').next() {
            if name.starts_with("index.") || name == "index" {
                return PathClass::Root;
            }
        }

        // Query-driven search/filter pages take precedence over path hints.
        if let Some(query) = url.query() {
            let query = query.to_ascii_lowercase();
            if query.split('&').any(|p| {
                p.starts_with("s=") || p.starts_with("q=") || p.starts_with("filter")
            }) {
                return PathClass::Search;
            }
        }

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for segment in &segments {
            match *segment {
                "search" | "filter" | "filters" => return PathClass::Search,
                "tag" | "tags" | "category" | "categories" => return PathClass::Tag,
                "product" | "products" | "service" | "services" | "shop" | "store" => {
                    return PathClass::Product
                }
                "blog" | "article" | "articles" | "news" | "post" | "posts" => {
                    return PathClass::Article
                }
                _ => {}
            }
        }

        PathClass::Other
    }

    /// Priority weight contributed by the path class.
    pub fn weight(self) -> i32 {
        match self {
            PathClass::Root => 20,
            PathClass::Product => 10,
            PathClass::Article => 5,
            PathClass::Tag => -15,
            PathClass::Search => -20,
            PathClass::Other => 0,
        }
    }
}

/// A discovered URL waiting in the frontier. Consumed exactly once by a
/// worker; never outlives the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontierEntry {
    /// Normalized URL.
    pub url: String,

    /// Depth in the crawl tree (0 for the seed).
    pub depth: u32,

    /// Priority score, 0-100, higher is drained first.
    pub priority: u8,

    /// Where the URL was discovered.
    pub source: LinkSource,

    /// URL of the page that linked here (None for the seed).
    pub parent_url: Option<String>,
}

/// Compute the priority score for a discovered URL.
///
/// Deterministic, pure function of depth, source and the URL's shape:
/// starts at `100 - 10 * depth`, adds the source and path-class weights and
/// clamps to 0..=100. The result is breadth-biased but authority-aware
/// rather than strict BFS.
pub fn priority(url: &Url, depth: u32, source: LinkSource) -> u8 {
    let base = 100i32.saturating_sub(depth as i32 * 10);
    let score = base + source.weight() + PathClass::classify(url).weight();
    score.clamp(0, 100) as u8
}
