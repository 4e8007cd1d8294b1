use regex::Regex;
use tracing::{debug, warn};
use url::Url;

use crate::cli::config::{CrawlType, FilterSettings};
use crate::error::CrawlerError;

/// Query parameters that only carry tracking state. Two links differing
/// only by these must collapse to one frontier entry.
const TRACKING_PARAMS: [&str; 2] = ["fbclid", "gclid"];

fn is_tracking_param(name: &str) -> bool {
    name.starts_with("utm_") || TRACKING_PARAMS.contains(&name)
}

/// Decides which discovered URLs are admitted into the frontier.
///
/// Applies scheme, host/domain scope, crawl-type, glob pattern and file
/// extension rules against normalized URLs. Malformed candidates are
/// silently dropped rather than failing the page that linked them.
pub struct UrlFilter {
    crawl_type: CrawlType,
    seed: Url,
    seed_host: String,
    seed_domain: String,
    seed_path: String,
    follow_external: bool,
    analyze_subdomains: bool,
    include_patterns: Vec<Regex>,
    exclude_patterns: Vec<Regex>,
    allowed_extensions: Vec<String>,
}

impl UrlFilter {
    /// Build a filter for one job from its start URL and filter settings.
    pub fn new(
        crawl_type: CrawlType,
        start_url: &str,
        filters: &FilterSettings,
    ) -> Result<Self, CrawlerError> {
        let seed = Self::normalize(start_url)
            .ok_or_else(|| CrawlerError::InvalidConfig(format!("invalid start url: {start_url}")))?;

        let seed_host = seed
            .host_str()
            .ok_or_else(|| CrawlerError::InvalidConfig("start url has no host".to_string()))?
            .to_lowercase();

        // Compile glob patterns, skipping ones that do not translate.
        let include_patterns = compile_patterns(&filters.include_patterns);
        let exclude_patterns = compile_patterns(&filters.exclude_patterns);

        let allowed_extensions = filters
            .allowed_extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();

        Ok(Self {
            crawl_type,
            seed_domain: registrable_domain(&seed_host),
            seed_path: seed.path().to_string(),
            seed_host,
            seed,
            follow_external: filters.follow_external,
            analyze_subdomains: filters.analyze_subdomains,
            include_patterns,
            exclude_patterns,
            allowed_extensions,
        })
    }

    /// The normalized seed URL for this job.
    pub fn seed(&self) -> &Url {
        &self.seed
    }

    /// Normalize a URL so that trivially different spellings de-duplicate:
    /// lowercase host, no default port, no fragment, no tracking query
    /// parameters, remaining query parameters sorted by key.
    pub fn normalize(raw: &str) -> Option<Url> {
        let mut url = Url::parse(raw).ok()?;

        url.set_fragment(None);

        if let Some(port) = url.port() {
            if (url.scheme() == "http" && port == 80) || (url.scheme() == "https" && port == 443) {
                let _ = url.set_port(None);
            }
        }

        if let Some(host) = url.host_str() {
            let lowered = host.to_lowercase();
            if lowered != host {
                url.set_host(Some(&lowered)).ok()?;
            }
        }

        if url.query().is_some() {
            let mut params: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(k, _)| !is_tracking_param(k))
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            params.sort_by(|a, b| a.0.cmp(&b.0));

            if params.is_empty() {
                url.set_query(None);
            } else {
                let query = params
                    .iter()
                    .map(|(k, v)| {
                        if v.is_empty() {
                            k.clone()
                        } else {
                            format!("{k}={v}")
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("&");
                url.set_query(Some(&query));
            }
        }

        Some(url)
    }

    /// Apply the admission rules to a candidate link. Returns the normalized
    /// URL when admitted, `None` when the candidate is dropped.
    pub fn admit(&self, raw: &str) -> Option<Url> {
        let url = Self::normalize(raw)?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return None;
        }

        let host = url.host_str()?.to_lowercase();
        if host != self.seed_host {
            let same_domain = registrable_domain(&host) == self.seed_domain;
            let allowed = if same_domain {
                self.analyze_subdomains || self.follow_external
            } else {
                self.follow_external
            };
            if !allowed {
                debug!(url = %url, "dropping out-of-scope host");
                return None;
            }
        }

        match self.crawl_type {
            CrawlType::SinglePage => {
                // Only the seed itself is ever fetched.
                if url != self.seed {
                    return None;
                }
            }
            CrawlType::Subfolder => {
                if host == self.seed_host && !url.path().starts_with(&self.seed_path) {
                    debug!(url = %url, "dropping url outside the seed subfolder");
                    return None;
                }
            }
            CrawlType::WholeDomain => {}
        }

        let url_str = url.as_str();

        // Allow-list first, then deny-list.
        if !self.include_patterns.is_empty()
            && !self.include_patterns.iter().any(|p| p.is_match(url_str))
        {
            return None;
        }
        if self.exclude_patterns.iter().any(|p| p.is_match(url_str)) {
            return None;
        }

        if !self.allowed_extensions.is_empty() {
            if let Some(ext) = path_extension(&url) {
                if !self.allowed_extensions.contains(&ext) {
                    return None;
                }
            }
            // Extensionless paths are HTML routes and always pass.
        }

        Some(url)
    }
}

/// Translate a glob pattern (`*` any run, `?` any char) into an anchored-free
/// regex and compile it, warning on patterns that still fail to compile.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut translated = String::with_capacity(pattern.len() * 2);
    for ch in pattern.chars() {
        match ch {
            '*' => translated.push_str(".*"),
            '?' => translated.push('.'),
            c => translated.push_str(&regex::escape(&c.to_string())),
        }
    }

    match Regex::new(&translated) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!("invalid url pattern '{}': {}", pattern, e);
            None
        }
    }
}

fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| glob_to_regex(p)).collect()
}

/// Last two labels of a hostname, e.g. `blog.example.com` -> `example.com`.
/// IP literals and single-label hosts are returned unchanged.
fn registrable_domain(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 || host.parse::<std::net::IpAddr>().is_ok() {
        return host.to_string();
    }
    labels[labels.len() - 2..].join(".")
}

/// File extension of the final path segment, lowercased.
fn path_extension(url: &Url) -> Option<String> {
    let segment = url.path().rsplit('/').next()?;
    let (_, ext) = segment.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::FilterSettings;

    fn filter(crawl_type: CrawlType, start: &str, settings: FilterSettings) -> UrlFilter {
        UrlFilter::new(crawl_type, start, &settings).unwrap()
    }

    fn default_filter() -> UrlFilter {
        filter(
            CrawlType::WholeDomain,
            "https://example.com/",
            FilterSettings::default(),
        )
    }

    #[test]
    fn normalization_strips_tracking_and_fragments() {
        let a = UrlFilter::normalize("https://Example.com/page?utm_source=x&b=2&a=1#frag").unwrap();
        let b = UrlFilter::normalize("https://example.com:443/page?a=1&fbclid=zzz&b=2").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "https://example.com/page?a=1&b=2");
    }

    #[test]
    fn normalization_drops_empty_query() {
        let u = UrlFilter::normalize("https://example.com/page?gclid=123").unwrap();
        assert_eq!(u.as_str(), "https://example.com/page");
    }

    #[test]
    fn non_http_schemes_are_dropped() {
        let f = default_filter();
        assert!(f.admit("mailto:someone@example.com").is_none());
        assert!(f.admit("ftp://example.com/file").is_none());
        assert!(f.admit("javascript:void(0)").is_none());
        assert!(f.admit("https://example.com/ok").is_some());
    }

    #[test]
    fn external_hosts_require_follow_external() {
        let f = default_filter();
        assert!(f.admit("https://other.test/page").is_none());

        let f = filter(
            CrawlType::WholeDomain,
            "https://example.com/",
            FilterSettings {
                follow_external: true,
                ..Default::default()
            },
        );
        assert!(f.admit("https://other.test/page").is_some());
    }

    #[test]
    fn subdomains_require_analyze_subdomains() {
        let f = default_filter();
        assert!(f.admit("https://blog.example.com/post").is_none());

        let f = filter(
            CrawlType::WholeDomain,
            "https://example.com/",
            FilterSettings {
                analyze_subdomains: true,
                ..Default::default()
            },
        );
        assert!(f.admit("https://blog.example.com/post").is_some());
        assert!(f.admit("https://other.test/page").is_none());
    }

    #[test]
    fn subfolder_crawl_requires_path_prefix() {
        let f = filter(
            CrawlType::Subfolder,
            "https://example.com/docs/",
            FilterSettings::default(),
        );
        assert!(f.admit("https://example.com/docs/intro").is_some());
        assert!(f.admit("https://example.com/blog/post").is_none());
    }

    #[test]
    fn single_page_admits_only_the_seed() {
        let f = filter(
            CrawlType::SinglePage,
            "https://example.com/landing",
            FilterSettings::default(),
        );
        assert!(f.admit("https://example.com/landing").is_some());
        assert!(f.admit("https://example.com/other").is_none());
    }

    #[test]
    fn include_then_exclude_patterns() {
        let f = filter(
            CrawlType::WholeDomain,
            "https://example.com/",
            FilterSettings {
                include_patterns: vec!["*/blog/*".to_string()],
                exclude_patterns: vec!["*draft*".to_string()],
                ..Default::default()
            },
        );
        assert!(f.admit("https://example.com/blog/post").is_some());
        assert!(f.admit("https://example.com/about").is_none());
        assert!(f.admit("https://example.com/blog/draft-post").is_none());
    }

    #[test]
    fn extension_filter_passes_extensionless_paths() {
        let f = filter(
            CrawlType::WholeDomain,
            "https://example.com/",
            FilterSettings {
                allowed_extensions: vec!["html".to_string()],
                ..Default::default()
            },
        );
        assert!(f.admit("https://example.com/page.html").is_some());
        assert!(f.admit("https://example.com/image.png").is_none());
        assert!(f.admit("https://example.com/about").is_some());
    }

    #[test]
    fn malformed_urls_are_silently_dropped() {
        let f = default_filter();
        assert!(f.admit("ht!tp://???").is_none());
        assert!(f.admit("").is_none());
    }

    #[test]
    fn registrable_domain_is_last_two_labels() {
        assert_eq!(registrable_domain("www.blog.example.com"), "example.com");
        assert_eq!(registrable_domain("example.com"), "example.com");
        assert_eq!(registrable_domain("localhost"), "localhost");
        assert_eq!(registrable_domain("127.0.0.1"), "127.0.0.1");
    }
}
