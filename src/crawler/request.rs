use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

/// A single unit of crawl work: where to go, how, and which rule parses the result.
///
/// Requests are immutable once they have been pushed into the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Name of the spider this request belongs to
    pub spider: String,

    /// Target URL
    pub url: String,

    /// HTTP method, always upper case
    pub method: String,

    /// Name of the rule used to parse the response
    pub rule: String,

    /// Page that produced this request (None for seeds)
    pub referer: Option<String>,

    /// Distance from the seed request
    pub depth: u32,

    /// Higher values are dequeued first
    pub priority: i32,

    /// Extra request headers
    pub headers: HashMap<String, String>,

    /// Body for POST-like methods
    pub post_data: Option<String>,

    /// Arbitrary context carried from the parent page to the child
    pub temp: Map<String, Value>,

    /// Skip deduplication for this request
    pub reloadable: bool,

    /// Download attempts before giving up (None uses the downloader default)
    pub try_times: Option<u32>,

    /// Pause between download attempts (None uses the downloader default)
    pub retry_pause: Option<Duration>,
}

impl Request {
    /// Create a GET request parsed by `rule`
    pub fn new(url: impl Into<String>, rule: impl Into<String>) -> Self {
        Self {
            spider: String::new(),
            url: url.into(),
            method: "GET".to_string(),
            rule: rule.into(),
            referer: None,
            depth: 0,
            priority: 0,
            headers: HashMap::new(),
            post_data: None,
            temp: Map::new(),
            reloadable: false,
            try_times: None,
            retry_pause: None,
        }
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.trim().to_ascii_uppercase();
        self
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_post_data(mut self, body: impl Into<String>) -> Self {
        self.post_data = Some(body.into());
        self
    }

    pub fn with_temp(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.temp.insert(key.into(), value.into());
        self
    }

    pub fn with_try_times(mut self, try_times: u32) -> Self {
        self.try_times = Some(try_times);
        self
    }

    pub fn reloadable(mut self) -> Self {
        self.reloadable = true;
        self
    }

    /// Deduplication key: method plus URL
    pub fn fingerprint(&self) -> String {
        format!("{} {}", self.method, self.url)
    }

    /// Look up a value carried in the temp data
    pub fn temp(&self, key: &str) -> Option<&Value> {
        self.temp.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_uses_method_and_url() {
        let get = Request::new("https://example.com/a", "index");
        let post = Request::new("https://example.com/a", "index").with_method(" post ");

        assert_eq!(get.fingerprint(), "GET https://example.com/a");
        assert_eq!(post.fingerprint(), "POST https://example.com/a");
        assert_ne!(get.fingerprint(), post.fingerprint());
    }

    #[test]
    fn test_fingerprint_ignores_context() {
        let a = Request::new("https://example.com/a", "index").with_temp("page", 1);
        let b = Request::new("https://example.com/a", "detail")
            .with_referer("https://example.com")
            .with_priority(5);

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.temp("page"), Some(&Value::from(1)));
        assert!(b.temp("page").is_none());
    }
}
