pub mod http;

use async_trait::async_trait;

use crate::crawler::request::Request;
use crate::crawler::response::Response;
use crate::crawler::spider::Spider;

// Re-export common types
pub use http::HttpDownloader;

/// Fetches one request.
///
/// Implementations must always return: fetch faults are reported through
/// [`Response::error`], never by panicking or blocking forever.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, spider: &Spider, request: Request) -> Response;
}
