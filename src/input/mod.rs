//! Initial-input resolution.
//!
//! Each [`InputType`](crate::agent::InputType) maps to one strategy in
//! [`InputResolver::resolve`]. Strategies that depend on the host go through
//! the [`InputHost`] capability trait so the core never touches a terminal,
//! browser or clipboard directly.

mod resolver;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use resolver::{InputResolver, ResolveError};

/// Text extracted from a page by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageContent {
    pub title: String,
    pub url: String,
    pub body_text: String,
}

/// A file chosen by the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Host capability failures
#[derive(Debug, Error)]
pub enum HostError {
    #[error("{0} is not available in this host")]
    Unsupported(&'static str),
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Capabilities supplied by whatever embeds the workflow engine
#[async_trait]
pub trait InputHost: Send + Sync {
    /// Ask the user for free text. `None` means they cancelled.
    async fn request_manual_input(&self, message: &str) -> Option<String>;

    async fn scrape_page(&self) -> Result<PageContent, HostError>;

    /// `Ok(None)` when the picker was dismissed
    async fn pick_file(&self) -> Result<Option<FileContent>, HostError>;

    async fn read_clipboard(&self) -> Result<String, HostError>;

    /// Ask the user for an endpoint URL. `None` means they cancelled.
    async fn request_url(&self) -> Option<String>;

    /// Show a message to the user right away
    fn notify(&self, message: &str);
}

/// HTTP client for page and API fetches, bounded by `timeout`
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(timeout).build()
}
