use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Agent execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Error,
}

impl AgentStatus {
    /// Display name for status
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Error => "Error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Behavior preset selected by an agent's role tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Scraper,
    Summarizer,
    Analyzer,
    Translator,
    Writer,
    /// No preset instruction; the prompt template carries everything
    #[default]
    #[serde(other)]
    Custom,
}

impl AgentRole {
    pub const ALL: [AgentRole; 6] = [
        Self::Scraper,
        Self::Summarizer,
        Self::Analyzer,
        Self::Translator,
        Self::Writer,
        Self::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scraper => "scraper",
            Self::Summarizer => "summarizer",
            Self::Analyzer => "analyzer",
            Self::Translator => "translator",
            Self::Writer => "writer",
            Self::Custom => "custom",
        }
    }

    /// Instruction prepended to the prompt for this preset
    pub fn instruction(&self) -> Option<&'static str> {
        match self {
            Self::Scraper => Some(
                "You are a content extraction agent. Pull out the meaningful text, \
                 facts and structure from the input and drop navigation, ads and boilerplate.",
            ),
            Self::Summarizer => Some(
                "You are a summarization agent. Produce a concise, well-structured summary \
                 of the input that keeps every key point.",
            ),
            Self::Analyzer => Some(
                "You are an analysis agent. Identify the main themes, claims, risks and \
                 open questions in the input.",
            ),
            Self::Translator => Some(
                "You are a translation agent. Translate the input faithfully, preserving \
                 formatting and meaning.",
            ),
            Self::Writer => Some(
                "You are a writing agent. Turn the input into clear, polished prose.",
            ),
            Self::Custom => None,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<_> = Self::ALL.iter().map(|r| r.as_str()).collect();
                format!("unknown role '{}' (expected one of: {})", s, known.join(", "))
            })
    }
}

/// Where an agent gets its input from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    /// Manual text entry
    #[default]
    Text,
    PageScrape,
    FileUpload,
    Clipboard,
    ApiCall,
    /// Output of the preceding agent (sequential mode only)
    PreviousOutput,
    /// Unrecognised tag read from storage; resolved as `Text`.
    ///
    /// The original tag is not kept, so the next save writes `unknown`.
    #[serde(other)]
    Unknown,
}

impl InputType {
    pub const KNOWN: [InputType; 6] = [
        Self::Text,
        Self::PageScrape,
        Self::FileUpload,
        Self::Clipboard,
        Self::ApiCall,
        Self::PreviousOutput,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::PageScrape => "page_scrape",
            Self::FileUpload => "file_upload",
            Self::Clipboard => "clipboard",
            Self::ApiCall => "api_call",
            Self::PreviousOutput => "previous_output",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for InputType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::KNOWN
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<_> = Self::KNOWN.iter().map(|t| t.as_str()).collect();
                format!("unknown input type '{}' (expected one of: {})", s, known.join(", "))
            })
    }
}

/// A configured unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    /// Unique ID, never changes once assigned
    pub id: String,
    /// Display label
    pub name: String,
    #[serde(default)]
    pub role: AgentRole,
    /// Template with an optional `{input}` slot
    #[serde(default)]
    pub prompt_template: String,
    #[serde(default)]
    pub input_type: InputType,
    /// Run state, never persisted
    #[serde(skip)]
    pub status: AgentStatus,
    #[serde(skip)]
    pub output: Option<String>,
    #[serde(skip)]
    pub error: Option<String>,
}

impl Agent {
    /// Create a new idle agent with a fresh ID
    pub fn new(
        name: impl Into<String>,
        role: AgentRole,
        prompt_template: impl Into<String>,
        input_type: InputType,
    ) -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self::with_id(format!("agent-{}", &uuid[..8]), name, role, prompt_template, input_type)
    }

    pub fn with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        role: AgentRole,
        prompt_template: impl Into<String>,
        input_type: InputType,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
            prompt_template: prompt_template.into(),
            input_type,
            status: AgentStatus::Idle,
            output: None,
            error: None,
        }
    }

    /// Back to idle with no output or error
    pub fn reset(&mut self) {
        self.status = AgentStatus::Idle;
        self.output = None;
        self.error = None;
    }

    pub fn begin_run(&mut self) {
        self.status = AgentStatus::Running;
        self.output = None;
        self.error = None;
    }

    pub fn complete(&mut self, output: impl Into<String>) {
        self.status = AgentStatus::Completed;
        self.output = Some(output.into());
        self.error = None;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = AgentStatus::Error;
        self.output = None;
        self.error = Some(error.into());
    }
}

/// Shared handle to one agent's state.
///
/// The lock is only held for short synchronous updates, never across a model call.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    id: String,
    inner: Arc<Mutex<Agent>>,
}

impl AgentHandle {
    pub fn new(agent: Agent) -> Self {
        Self {
            id: agent.id.clone(),
            inner: Arc::new(Mutex::new(agent)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn lock(&self) -> MutexGuard<'_, Agent> {
        self.inner.lock().await
    }

    /// Copy of the current state
    pub async fn snapshot(&self) -> Agent {
        self.inner.lock().await.clone()
    }

    /// Fail the agent if it is still `running`. Callable from `Drop`.
    ///
    /// When the lock is contended the update is handed to the current runtime.
    pub fn cancel(&self, reason: &str) {
        if let Ok(mut agent) = self.inner.try_lock() {
            fail_if_running(&mut agent, reason);
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            let reason = reason.to_string();
            runtime.spawn(async move {
                fail_if_running(&mut *inner.lock().await, &reason);
            });
        }
    }
}

fn fail_if_running(agent: &mut Agent, reason: &str) {
    if agent.status == AgentStatus::Running {
        agent.fail(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_creation() {
        let agent = Agent::new("Reader", AgentRole::Scraper, "{input}", InputType::PageScrape);
        assert!(agent.id.starts_with("agent-"));
        assert_eq!(agent.id.len(), "agent-".len() + 8);
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.output.is_none());
        assert!(agent.error.is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Agent::new("a", AgentRole::Custom, "", InputType::Text);
        let b = Agent::new("b", AgentRole::Custom, "", InputType::Text);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_output_and_error_are_exclusive() {
        let mut agent = Agent::new("a", AgentRole::Custom, "", InputType::Text);

        agent.begin_run();
        assert_eq!(agent.status, AgentStatus::Running);

        agent.fail("boom");
        assert_eq!(agent.status, AgentStatus::Error);
        assert!(agent.output.is_none());
        assert_eq!(agent.error.as_deref(), Some("boom"));

        agent.begin_run();
        assert!(agent.error.is_none());
        agent.complete("done");
        assert_eq!(agent.output.as_deref(), Some("done"));
        assert!(agent.error.is_none());

        agent.reset();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.output.is_none());
    }

    #[test]
    fn test_transient_fields_not_serialized() {
        let mut agent = Agent::with_id("agent-1", "a", AgentRole::Summarizer, "t", InputType::Clipboard);
        agent.complete("secret output");

        let json = serde_json::to_string(&agent).unwrap();
        assert!(!json.contains("secret output"));
        assert!(!json.contains("status"));
        assert!(json.contains("\"promptTemplate\":\"t\""));
        assert!(json.contains("\"inputType\":\"clipboard\""));

        let restored: Agent = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.status, AgentStatus::Idle);
        assert!(restored.output.is_none());
    }

    #[test]
    fn test_unknown_tags_deserialize_to_fallbacks() {
        let json = r#"{"id":"agent-x","name":"x","role":"poet","promptTemplate":"","inputType":"telepathy"}"#;
        let agent: Agent = serde_json::from_str(json).unwrap();
        assert_eq!(agent.role, AgentRole::Custom);
        assert_eq!(agent.input_type, InputType::Unknown);
    }

    #[test]
    fn test_unknown_input_type_is_saved_as_unknown() {
        let json = r#"{"id":"agent-x","name":"x","inputType":"pdf"}"#;
        let agent: Agent = serde_json::from_str(json).unwrap();

        let saved = serde_json::to_string(&agent).unwrap();
        assert!(saved.contains("\"inputType\":\"unknown\""));
        assert!(!saved.contains("pdf"));
    }

    #[test]
    fn test_input_type_from_str() {
        assert_eq!("page_scrape".parse::<InputType>().unwrap(), InputType::PageScrape);
        assert_eq!("previous_output".parse::<InputType>().unwrap(), InputType::PreviousOutput);
        assert!("unknown".parse::<InputType>().is_err());
        assert!("PDF".parse::<InputType>().is_err());
    }

    #[test]
    fn test_role_from_str_and_instruction() {
        assert_eq!("summarizer".parse::<AgentRole>().unwrap(), AgentRole::Summarizer);
        assert!("poet".parse::<AgentRole>().is_err());
        assert!(AgentRole::Summarizer.instruction().is_some());
        assert!(AgentRole::Custom.instruction().is_none());
    }

    #[tokio::test]
    async fn test_handle_snapshot_is_a_copy() {
        let handle = AgentHandle::new(Agent::with_id("agent-1", "a", AgentRole::Custom, "", InputType::Text));
        let before = handle.snapshot().await;

        handle.lock().await.complete("out");

        assert_eq!(before.status, AgentStatus::Idle);
        assert_eq!(handle.snapshot().await.status, AgentStatus::Completed);
        assert_eq!(handle.id(), "agent-1");
    }

    #[tokio::test]
    async fn test_cancel_only_fails_running_agents() {
        let handle = AgentHandle::new(Agent::with_id("agent-1", "a", AgentRole::Custom, "", InputType::Text));

        handle.cancel("stopped");
        assert_eq!(handle.snapshot().await.status, AgentStatus::Idle);

        handle.lock().await.begin_run();
        handle.cancel("stopped");
        let state = handle.snapshot().await;
        assert_eq!(state.status, AgentStatus::Error);
        assert_eq!(state.error.as_deref(), Some("stopped"));

        handle.lock().await.complete("done");
        handle.cancel("stopped");
        assert_eq!(handle.snapshot().await.status, AgentStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_while_locked_is_applied_later() {
        let handle = AgentHandle::new(Agent::with_id("agent-1", "a", AgentRole::Custom, "", InputType::Text));
        {
            let mut agent = handle.lock().await;
            agent.begin_run();
            handle.cancel("stopped");
        }

        // The deferred update needs the lock we just released
        let mut status = AgentStatus::Running;
        for _ in 0..10 {
            tokio::task::yield_now().await;
            status = handle.snapshot().await.status;
            if status == AgentStatus::Error {
                break;
            }
        }
        assert_eq!(status, AgentStatus::Error);
    }
}
