use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::REFERER;
use reqwest::{Client, Method};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cli::config::DownloaderSettings;
use crate::crawler::request::Request;
use crate::crawler::response::Response;
use crate::crawler::spider::Spider;
use crate::downloader::Downloader;

/// HTTP downloader backed by a shared reqwest client
pub struct HttpDownloader {
    client: Client,
    try_times: u32,
    retry_pause: Duration,
}

enum Attempt {
    Done(Response),
    Retry(String),
}

impl HttpDownloader {
    pub fn new(settings: &DownloaderSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .cookie_store(settings.cookies)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            try_times: settings.try_times.max(1),
            retry_pause: Duration::from_millis(settings.retry_pause_ms),
        })
    }

    async fn attempt(&self, method: &Method, request: &Request) -> Attempt {
        let mut builder = self.client.request(method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(referer) = &request.referer {
            builder = builder.header(REFERER, referer.as_str());
        }
        if let Some(body) = &request.post_data {
            builder = builder.body(body.clone());
        }

        let http_response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return Attempt::Retry(e.to_string()),
        };

        let status = http_response.status();
        if status.is_server_error() {
            return Attempt::Retry(format!("server returned {}", status));
        }

        let final_url = http_response.url().to_string();
        let headers: HashMap<String, String> = http_response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect();

        let body = match http_response.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => return Attempt::Retry(format!("failed to read body: {}", e)),
        };

        let mut response = Response::new(request.clone()).with_body(status.as_u16(), body);
        response.set_url(final_url);
        response.headers = headers;
        if status.is_client_error() {
            response.set_error(format!("server returned {}", status));
        }
        Attempt::Done(response)
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, spider: &Spider, request: Request) -> Response {
        let method = match Method::from_bytes(request.method.as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                let message = format!("invalid HTTP method: {}", request.method);
                return Response::failed(request, message);
            }
        };

        let attempts = request.try_times.unwrap_or(self.try_times).max(1);
        let pause = request.retry_pause.unwrap_or(self.retry_pause);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            debug!("[{}] {} {} (attempt {})", spider.name(), method, request.url, attempt);
            match self.attempt(&method, &request).await {
                Attempt::Done(response) => return response,
                Attempt::Retry(error) => {
                    if attempt < attempts {
                        warn!(
                            "Download of {} failed ({}), retrying in {:?}",
                            request.url, error, pause
                        );
                        tokio::time::sleep(pause).await;
                    }
                    last_error = error;
                }
            }
        }

        Response::failed(request, last_error)
    }
}
