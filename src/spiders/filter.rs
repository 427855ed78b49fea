use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

/// URL patterns for including or excluding followed links
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct UrlPatterns {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// Decides which discovered links a selector spider may follow
#[derive(Debug, Clone, Default)]
pub struct UrlFilter {
    /// Compiled regex patterns for URL inclusion
    include_patterns: Vec<Regex>,

    /// Compiled regex patterns for URL exclusion
    exclude_patterns: Vec<Regex>,

    /// Allowed domains (if empty, any domain is allowed)
    allowed_domains: Vec<String>,
}

fn compile(patterns: &[String], kind: &str) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!("Invalid {} pattern '{}': {}", kind, pattern, e);
                None
            }
        })
        .collect()
}

impl UrlFilter {
    pub fn new(patterns: &UrlPatterns, allowed_domains: &[String]) -> Self {
        Self {
            include_patterns: compile(&patterns.include, "include"),
            exclude_patterns: compile(&patterns.exclude, "exclude"),
            allowed_domains: allowed_domains
                .iter()
                .map(|domain| domain.trim().to_lowercase())
                .filter(|domain| !domain.is_empty())
                .collect(),
        }
    }

    /// Determine if a link should be followed
    pub fn allows(&self, url: &Url) -> bool {
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }

        if !self.allowed_domains.is_empty() {
            let Some(host) = url.host_str() else {
                return false;
            };
            let host = host.to_lowercase();
            let allowed = self
                .allowed_domains
                .iter()
                .any(|domain| host == *domain || host.ends_with(&format!(".{}", domain)));
            if !allowed {
                debug!("Skipping link to non-allowed domain: {}", host);
                return false;
            }
        }

        let candidate = url.as_str();
        if self.exclude_patterns.iter().any(|pattern| pattern.is_match(candidate)) {
            debug!("Skipping link matching exclusion pattern: {}", candidate);
            return false;
        }

        if !self.include_patterns.is_empty()
            && !self.include_patterns.iter().any(|pattern| pattern.is_match(candidate))
        {
            debug!("Skipping link not matching any inclusion pattern: {}", candidate);
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> UrlFilter {
        UrlFilter::new(
            &UrlPatterns {
                include: vec![r"^https?://(www\.)?example\.com/.*$".to_string()],
                exclude: vec![r"^.*\.(jpg|jpeg|png|gif|css|js)$".to_string(), "(".to_string()],
            },
            &["Example.com".to_string()],
        )
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_allows() {
        let filter = filter();

        assert!(filter.allows(&url("https://example.com/page1")));
        assert!(filter.allows(&url("https://www.example.com/page2")));
        assert!(!filter.allows(&url("https://other-site.com/page")));
        assert!(!filter.allows(&url("https://example.com/image.jpg")));
        assert!(!filter.allows(&url("mailto:someone@example.com")));
    }

    #[test]
    fn test_empty_filter_allows_any_web_link() {
        let filter = UrlFilter::default();
        assert!(filter.allows(&url("http://anything.test/x")));
        assert!(!filter.allows(&url("ftp://anything.test/x")));
    }
}
