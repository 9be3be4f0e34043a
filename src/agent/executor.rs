use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use super::{Agent, AgentHandle};
use crate::llm::{GenerationParams, LlmClient, LlmError, LlmRequest};

/// Slot in a prompt template that receives the resolved input
pub const INPUT_SLOT: &str = "{input}";

/// Error recorded on an agent whose run was dropped mid-flight
pub const CANCELLED: &str = "run cancelled";

/// Executor settings
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    pub generation: GenerationParams,
    /// Per-call timeout; `None` waits as long as the model takes
    pub timeout: Option<Duration>,
}

/// Why a single agent execution failed
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
}

/// An agent already moved to `running`, with its request built.
///
/// Dropping it before [`AgentExecutor::complete`] records a terminal state
/// fails the agent with [`CANCELLED`].
pub struct PreparedRun {
    agent: AgentHandle,
    request: Option<LlmRequest>,
    finished: bool,
}

impl PreparedRun {
    pub fn agent_id(&self) -> &str {
        self.agent.id()
    }
}

impl Drop for PreparedRun {
    fn drop(&mut self) {
        if !self.finished {
            self.agent.cancel(CANCELLED);
        }
    }
}

/// Runs one agent against one input and records the outcome on the agent
pub struct AgentExecutor {
    client: Arc<dyn LlmClient>,
    config: ExecutorConfig,
}

impl AgentExecutor {
    pub fn new(client: Arc<dyn LlmClient>, config: ExecutorConfig) -> Self {
        Self { client, config }
    }

    pub fn ensure_ready(&self) -> Result<(), LlmError> {
        self.client.ensure_ready()
    }

    /// Run an agent: `prepare` then `complete`
    pub async fn execute(&self, agent: &AgentHandle, input: &str) -> Result<String, ExecutionError> {
        let run = self.prepare(agent, input).await;
        self.complete(run).await
    }

    /// Mark the agent running and build its request. Issues no call.
    pub async fn prepare(&self, agent: &AgentHandle, input: &str) -> PreparedRun {
        let prompt = {
            let mut state = agent.lock().await;
            state.begin_run();
            build_prompt(&state, input)
        };

        PreparedRun {
            agent: agent.clone(),
            request: Some(LlmRequest {
                prompt,
                generation: self.config.generation.clone(),
            }),
            finished: false,
        }
    }

    /// Issue the model call for a prepared run and move the agent to a terminal state
    pub async fn complete(&self, mut run: PreparedRun) -> Result<String, ExecutionError> {
        let result = match run.request.take() {
            Some(request) => self.call(request).await,
            None => Err(LlmError::Response("request already sent".to_string()).into()),
        };

        let agent = run.agent.clone();
        let mut state = agent.lock().await;
        run.finished = true;
        match result {
            Ok(text) => {
                info!(agent = %state.id, name = %state.name, chars = text.len(), "agent completed");
                state.complete(text.clone());
                Ok(text)
            }
            Err(e) => {
                warn!(agent = %state.id, name = %state.name, error = %e, "agent failed");
                state.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn call(&self, request: LlmRequest) -> Result<String, ExecutionError> {
        let call = self.client.complete(request);
        let text = match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| ExecutionError::Timeout(limit))??,
            None => call.await?,
        };

        if text.trim().is_empty() {
            return Err(LlmError::EmptyResponse.into());
        }
        Ok(text)
    }
}

/// Combine role instruction, template and input into one prompt
pub fn build_prompt(agent: &Agent, input: &str) -> String {
    let body = if agent.prompt_template.contains(INPUT_SLOT) {
        agent.prompt_template.replace(INPUT_SLOT, input)
    } else if input.is_empty() {
        agent.prompt_template.clone()
    } else if agent.prompt_template.trim().is_empty() {
        input.to_string()
    } else {
        format!("{}\n\n{}", agent.prompt_template.trim_end(), input)
    };

    match agent.role.instruction() {
        Some(instruction) => format!("{}\n\n{}", instruction, body),
        None => body,
    }
}
