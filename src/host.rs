//! Terminal implementation of the input host capabilities.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Editor, Input};
use tokio::process::Command;
use tracing::{debug, warn};
use url::Url;

use crate::input::{http_client, FileContent, HostError, InputHost, PageContent};

/// Clipboard readers tried in order
const CLIPBOARD_COMMANDS: &[(&str, &[&str])] = &[
    ("pbpaste", &[]),
    ("wl-paste", &["--no-newline"]),
    ("xclip", &["-selection", "clipboard", "-o"]),
    ("xsel", &["--clipboard", "--output"]),
    ("powershell", &["-NoProfile", "-Command", "Get-Clipboard"]),
];

/// Values given on the command line instead of asking interactively
#[derive(Debug, Clone, Default)]
pub struct HostOptions {
    pub page_url: Option<String>,
    pub file: Option<PathBuf>,
    pub api_url: Option<String>,
}

/// Prompts on the terminal, notifies on stderr
pub struct TerminalHost {
    options: HostOptions,
    http: reqwest::Client,
}

impl TerminalHost {
    /// `fetch_timeout` bounds each page fetch
    pub fn new(options: HostOptions, fetch_timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            options,
            http: http_client(fetch_timeout)?,
        })
    }

    async fn fetch_page(&self, url: &str) -> Result<PageContent, HostError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| HostError::Failed(e.to_string()))?;
        let final_url = response.url().to_string();
        let html = response
            .text()
            .await
            .map_err(|e| HostError::Failed(e.to_string()))?;
        Ok(extract_page(&final_url, &html))
    }

    /// The preset URL when it is valid, otherwise ask
    async fn url_or_prompt(&self, preset: Option<&String>, prompt: &str) -> Option<String> {
        if let Some(url) = preset {
            match validate_url(url) {
                Ok(()) => return Some(url.trim().to_string()),
                Err(e) => self.notify(&e),
            }
        }
        prompt_url(prompt).await
    }
}

#[async_trait]
impl InputHost for TerminalHost {
    async fn request_manual_input(&self, message: &str) -> Option<String> {
        let prompt = format!("{} (leave empty to open your editor)", message);
        interact(move || -> dialoguer::Result<Option<String>> {
            let theme = ColorfulTheme::default();
            let line = Input::<String>::with_theme(&theme)
                .with_prompt(prompt)
                .allow_empty(true)
                .interact_text()?;
            if !line.is_empty() {
                return Ok(Some(line));
            }
            // `None` when the editor is closed without saving
            Ok(Editor::new().edit("")?)
        })
        .await
    }

    async fn scrape_page(&self) -> Result<PageContent, HostError> {
        let url = self
            .url_or_prompt(self.options.page_url.as_ref(), "Page URL to read")
            .await
            .ok_or_else(|| HostError::Failed("no page URL given".into()))?;
        self.fetch_page(&url).await
    }

    async fn pick_file(&self) -> Result<Option<FileContent>, HostError> {
        let path = match &self.options.file {
            Some(path) => path.clone(),
            None => match prompt_path("File to read").await {
                Some(path) => path,
                None => return Ok(None),
            },
        };
        let bytes = tokio::fs::read(&path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Some(FileContent { name, bytes }))
    }

    async fn read_clipboard(&self) -> Result<String, HostError> {
        for (program, args) in CLIPBOARD_COMMANDS {
            let output = Command::new(program)
                .args(*args)
                .stdin(Stdio::null())
                .stderr(Stdio::null())
                .output()
                .await;
            match output {
                Ok(out) if out.status.success() => {
                    return Ok(String::from_utf8_lossy(&out.stdout).into_owned());
                }
                Ok(out) => debug!(program, code = ?out.status.code(), "clipboard reader failed"),
                Err(e) => debug!(program, error = %e, "clipboard reader unavailable"),
            }
        }
        Err(HostError::Unsupported("clipboard access"))
    }

    async fn request_url(&self) -> Option<String> {
        self.url_or_prompt(self.options.api_url.as_ref(), "API endpoint URL")
            .await
    }

    fn notify(&self, message: &str) {
        eprintln!("! {}", message);
    }
}

/// Run a blocking prompt off the async workers. A prompt error (Ctrl-C, no
/// terminal) counts as a cancel.
async fn interact<T, E, F>(prompt: F) -> Option<T>
where
    F: FnOnce() -> Result<Option<T>, E> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    match tokio::task::spawn_blocking(prompt).await {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            debug!(error = %e, "prompt cancelled");
            None
        }
        Err(e) => {
            warn!(error = %e, "prompt task failed");
            None
        }
    }
}

async fn prompt_url(prompt: &str) -> Option<String> {
    let prompt = prompt.to_string();
    interact(move || -> dialoguer::Result<Option<String>> {
        let theme = ColorfulTheme::default();
        let url = Input::<String>::with_theme(&theme)
            .with_prompt(prompt)
            .allow_empty(true)
            .validate_with(|input: &String| -> Result<(), String> {
                if input.trim().is_empty() {
                    Ok(())
                } else {
                    validate_url(input)
                }
            })
            .interact_text()?;
        Ok(Some(url.trim().to_string()).filter(|u| !u.is_empty()))
    })
    .await
}

async fn prompt_path(prompt: &str) -> Option<PathBuf> {
    let prompt = prompt.to_string();
    interact(move || -> dialoguer::Result<Option<PathBuf>> {
        let theme = ColorfulTheme::default();
        let path = Input::<String>::with_theme(&theme)
            .with_prompt(prompt)
            .allow_empty(true)
            .validate_with(|input: &String| -> Result<(), String> {
                let path = input.trim();
                if path.is_empty() || Path::new(path).is_file() {
                    Ok(())
                } else {
                    Err(format!("No such file: {}", path))
                }
            })
            .interact_text()?;
        Ok(Some(PathBuf::from(path.trim())).filter(|p| !p.as_os_str().is_empty()))
    })
    .await
}

/// Absolute http(s) URL
pub fn validate_url(input: &str) -> Result<(), String> {
    let url = Url::parse(input.trim()).map_err(|e| format!("Invalid URL: {}", e))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("Unsupported URL scheme: {}", other)),
    }
}

/// Yes/no question on the terminal, defaulting to no
pub async fn confirm(prompt: &str) -> bool {
    let prompt = prompt.to_string();
    interact(move || -> dialoguer::Result<Option<bool>> {
        let theme = ColorfulTheme::default();
        Ok(Some(
            Confirm::with_theme(&theme)
                .with_prompt(prompt)
                .default(false)
                .interact()?,
        ))
    })
    .await
    .unwrap_or(false)
}

/// Title and visible text of an HTML document
pub fn extract_page(url: &str, html: &str) -> PageContent {
    PageContent {
        title: extract_title(html).unwrap_or_default(),
        url: url.to_string(),
        body_text: strip_html(html),
    }
}

fn extract_title(html: &str) -> Option<String> {
    // ASCII lowercasing keeps byte offsets aligned with `html`
    let lower = html.to_ascii_lowercase();
    let open = lower.find("<title")?;
    let start = open + lower[open..].find('>')? + 1;
    let end = start + lower[start..].find("</title>")?;
    Some(collapse_whitespace(&decode_entities(&html[start..end])))
}

fn strip_html(html: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let mut text = String::with_capacity(html.len());
    let mut i = 0;

    while i < html.len() {
        let rest = &lower[i..];
        let skip_block = ["script", "style", "head", "noscript"]
            .into_iter()
            .find(|tag| opens_tag(rest, tag));
        if let Some(tag) = skip_block {
            let close = format!("</{}>", tag);
            match rest.find(&close) {
                Some(end) => {
                    i += end + close.len();
                    text.push(' ');
                    continue;
                }
                None => break,
            }
        }
        if rest.starts_with('<') {
            match rest.find('>') {
                Some(end) => {
                    i += end + 1;
                    text.push(' ');
                    continue;
                }
                None => break,
            }
        }
        let next = rest.find('<').map(|p| i + p).unwrap_or(html.len());
        text.push_str(&html[i..next]);
        i = next;
    }

    collapse_whitespace(&decode_entities(&text))
}

/// `<tag>` or `<tag ...>` at the start of `rest`, but not `<tagname...>`
fn opens_tag(rest: &str, tag: &str) -> bool {
    rest.strip_prefix('<')
        .and_then(|r| r.strip_prefix(tag))
        .and_then(|r| r.chars().next())
        .is_some_and(|c| c == '>' || c == '/' || c.is_ascii_whitespace())
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
