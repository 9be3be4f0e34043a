use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use super::{http_client, InputHost, PageContent};
use crate::agent::InputType;

/// Structural resolution failures. Everything else falls back to manual text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("'previous_output' cannot supply the initial input of a workflow")]
    PreviousOutputAsInitial,
}

/// Turns a declared input type into text
pub struct InputResolver<H> {
    host: H,
    http: reqwest::Client,
}

impl<H: InputHost> InputResolver<H> {
    /// `fetch_timeout` bounds each `api_call` request
    pub fn new(host: H, fetch_timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            host,
            http: http_client(fetch_timeout)?,
        })
    }

    #[cfg(test)]
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Resolve input for `agent_name`.
    ///
    /// `Ok(None)` means the user declined to provide anything and the run should abort.
    pub async fn resolve(
        &self,
        input_type: InputType,
        agent_name: &str,
    ) -> Result<Option<String>, ResolveError> {
        info!(input_type = %input_type, agent = agent_name, "resolving initial input");
        let text = match input_type {
            InputType::Text => self.from_text(agent_name).await,
            InputType::PageScrape => self.from_page(agent_name).await,
            InputType::FileUpload => self.from_file(agent_name).await,
            InputType::Clipboard => self.from_clipboard(agent_name).await,
            InputType::ApiCall => self.from_api(agent_name).await,
            InputType::PreviousOutput => return Err(ResolveError::PreviousOutputAsInitial),
            InputType::Unknown => {
                warn!(agent = agent_name, "unrecognised input type, using manual text");
                self.from_text(agent_name).await
            }
        };
        Ok(text)
    }

    async fn from_text(&self, agent_name: &str) -> Option<String> {
        self.host
            .request_manual_input(&format!("Enter input for agent \"{}\":", agent_name))
            .await
    }

    async fn from_page(&self, agent_name: &str) -> Option<String> {
        match self.host.scrape_page().await {
            Ok(page) => Some(format_page(&page)),
            Err(e) => {
                self.fallback(agent_name, &format!("Could not read the page: {}", e))
                    .await
            }
        }
    }

    async fn from_file(&self, agent_name: &str) -> Option<String> {
        match self.host.pick_file().await {
            // Non-text formats are read best-effort
            Ok(Some(file)) => Some(String::from_utf8_lossy(&file.bytes).into_owned()),
            Ok(None) => self.fallback(agent_name, "No file selected").await,
            Err(e) => {
                self.fallback(agent_name, &format!("Could not read the file: {}", e))
                    .await
            }
        }
    }

    async fn from_clipboard(&self, agent_name: &str) -> Option<String> {
        match self.host.read_clipboard().await {
            Ok(text) if !text.trim().is_empty() => Some(text),
            Ok(_) => self.fallback(agent_name, "Clipboard is empty").await,
            Err(e) => {
                self.fallback(agent_name, &format!("Could not read the clipboard: {}", e))
                    .await
            }
        }
    }

    async fn from_api(&self, agent_name: &str) -> Option<String> {
        let url = self.host.request_url().await?;
        let url = url.trim();
        if url.is_empty() {
            return None;
        }

        match self.fetch(url).await {
            Ok(body) => Some(body),
            Err(e) => {
                self.fallback(agent_name, &format!("API request failed: {}", e))
                    .await
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<String, reqwest::Error> {
        self.http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }

    async fn fallback(&self, agent_name: &str, reason: &str) -> Option<String> {
        warn!(agent = agent_name, reason, "falling back to manual input");
        self.host.notify(reason);
        self.from_text(agent_name).await
    }
}

/// Render scraped page content as agent input
pub fn format_page(page: &PageContent) -> String {
    format!(
        "Title: {}\nURL: {}\n\nContent:\n{}",
        page.title, page.url, page.body_text
    )
}
