use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use tokio::io::AsyncRead;

use crate::crawler::request::Request;

/// One extracted record, an opaque field → value mapping
pub type Item = Map<String, Value>;

/// Streamable byte source for extracted files
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// A file extracted from a page
pub struct FileCell {
    pub name: String,
    pub body: ByteStream,
}

impl FileCell {
    pub fn new(name: impl Into<String>, body: ByteStream) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }

    /// Wrap an in-memory buffer
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self::new(name, Box::pin(std::io::Cursor::new(bytes)))
    }
}

impl fmt::Debug for FileCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileCell").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Outcome of downloading one [`Request`].
///
/// Fetch faults are carried in-band through [`Response::error`] so the crawler can
/// branch without unwinding. Parsing fills `items` and `files`, which are handed to
/// the pipeline exactly once.
#[derive(Debug)]
pub struct Response {
    request: Request,
    url: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    error: Option<String>,
    items: Vec<Item>,
    files: Vec<FileCell>,
}

impl Response {
    pub fn new(request: Request) -> Self {
        let url = request.url.clone();
        Self {
            request,
            url,
            status: 0,
            headers: HashMap::new(),
            body: Vec::new(),
            error: None,
            items: Vec::new(),
            files: Vec::new(),
        }
    }

    /// A response that only reports a fetch failure
    pub fn failed(request: Request, error: impl fmt::Display) -> Self {
        let mut response = Self::new(request);
        response.error = Some(error.to_string());
        response
    }

    pub fn with_body(mut self, status: u16, body: impl Into<Vec<u8>>) -> Self {
        self.status = status;
        self.body = body.into();
        self
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn set_error(&mut self, error: impl fmt::Display) {
        self.error = Some(error.to_string());
    }

    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }

    /// Final URL after redirects
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn set_url(&mut self, url: impl Into<String>) {
        self.url = url.into();
    }

    pub fn referer(&self) -> Option<&str> {
        self.request.referer.as_deref()
    }

    pub fn method(&self) -> &str {
        &self.request.method
    }

    pub fn rule_name(&self) -> &str {
        &self.request.rule
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Body decoded as UTF-8, lossy
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn push_item(&mut self, item: Item) {
        self.items.push(item);
    }

    pub fn push_file(&mut self, file: FileCell) {
        self.files.push(file);
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn take_items(&mut self) -> Vec<Item> {
        std::mem::take(&mut self.items)
    }

    pub fn take_files(&mut self) -> Vec<FileCell> {
        std::mem::take(&mut self.files)
    }
}
