use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::export::RunResult;
use super::store::{PersistedWorkflow, WorkflowStore};
use crate::agent::{Agent, AgentExecutor, AgentHandle, AgentRole, InputType};
use crate::input::{InputHost, InputResolver, ResolveError};
use crate::llm::LlmError;

/// How the steps of a workflow are driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Each agent's output feeds the next agent
    #[default]
    Sequential,
    /// Every agent gets the initial input, all in flight at once
    Parallel,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
        }
    }

    pub fn toggled(&self) -> Self {
        match self {
            Self::Sequential => Self::Parallel,
            Self::Parallel => Self::Sequential,
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Workflow errors
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("a workflow run is already in progress")]
    AlreadyRunning,
    #[error("the workflow has no steps")]
    EmptySteps,
    #[error("none of the workflow steps refers to a configured agent")]
    NoAgents,
    #[error("agent \"{0}\" is first in the workflow but takes the previous agent's output")]
    PreviousOutputFirst(String),
    #[error("cannot run workflow: {0}")]
    NotReady(#[source] LlmError),
    #[error("no input provided, run aborted")]
    InputCancelled,
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("agent {0} already exists")]
    DuplicateAgent(String),
    #[error("agent {0} is already a workflow step")]
    DuplicateStep(String),
    #[error("step index {index} is out of range ({len} steps)")]
    StepOutOfRange { index: usize, len: usize },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Counts for one finished run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    /// Step ids with no matching agent
    pub skipped: usize,
}

/// Edits applied to an agent between runs. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct AgentUpdate {
    pub name: Option<String>,
    pub role: Option<AgentRole>,
    pub prompt_template: Option<String>,
    pub input_type: Option<InputType>,
}

/// Workflow validation result
#[derive(Debug, Clone)]
pub struct ValidationReport {
    /// Whether a run could start
    pub is_valid: bool,
    /// Worth showing, does not block a run
    pub warnings: Vec<String>,
    /// Blocks a run
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self {
            is_valid: true,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn with_warning(mut self, msg: impl Into<String>) -> Self {
        self.warnings.push(msg.into());
        self
    }

    pub fn with_error(mut self, msg: impl Into<String>) -> Self {
        self.is_valid = false;
        self.errors.push(msg.into());
        self
    }
}

/// Holds the single-flight flag for the lifetime of a run
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Owns the agents, the step list and the execution mode, and runs workflows
pub struct Orchestrator {
    agents: Vec<AgentHandle>,
    steps: Vec<String>,
    mode: ExecutionMode,
    executor: AgentExecutor,
    store: Arc<dyn WorkflowStore>,
    running: AtomicBool,
    /// Step list of the most recent run, which may differ from `steps`
    last_run: Mutex<Option<Vec<String>>>,
}

impl Orchestrator {
    /// Empty orchestrator; nothing is read from the store
    pub fn new(store: Arc<dyn WorkflowStore>, executor: AgentExecutor) -> Self {
        Self {
            agents: Vec::new(),
            steps: Vec::new(),
            mode: ExecutionMode::default(),
            executor,
            store,
            running: AtomicBool::new(false),
            last_run: Mutex::new(None),
        }
    }

    /// Rebuild agents, mode and steps from the store
    pub fn load(store: Arc<dyn WorkflowStore>, executor: AgentExecutor) -> Result<Self, WorkflowError> {
        let state = store.load()?;
        let mut orchestrator = Self::new(store, executor);
        let mut seen = HashSet::new();
        for mut agent in state.agents {
            if !seen.insert(agent.id.clone()) {
                warn!(agent = %agent.id, "duplicate agent id in store, keeping the first");
                continue;
            }
            agent.reset();
            orchestrator.agents.push(AgentHandle::new(agent));
        }
        orchestrator.mode = state.execution_mode;
        let mut seen_steps = HashSet::new();
        orchestrator.steps = state
            .workflow_steps
            .into_iter()
            .filter(|id| seen_steps.insert(id.clone()))
            .collect();
        info!(
            agents = orchestrator.agents.len(),
            steps = orchestrator.steps.len(),
            mode = %orchestrator.mode,
            "workflow loaded"
        );
        Ok(orchestrator)
    }

    /// Write agents, mode and steps to the store
    pub async fn save(&self) -> Result<(), WorkflowError> {
        let state = PersistedWorkflow {
            agents: self.list_agents().await,
            execution_mode: self.mode,
            workflow_steps: self.steps.clone(),
        };
        self.store.save(&state)?;
        Ok(())
    }

    /// Remove every agent and step, reset the mode and wipe the store
    pub fn reset(&mut self) -> Result<(), WorkflowError> {
        self.store.clear()?;
        self.agents.clear();
        self.steps.clear();
        self.mode = ExecutionMode::default();
        *self.last_run.get_mut().unwrap_or_else(|e| e.into_inner()) = None;
        info!("workflow storage reset");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn set_execution_mode(&mut self, mode: ExecutionMode) {
        self.mode = mode;
    }

    pub fn toggle_execution_mode(&mut self) -> ExecutionMode {
        self.mode = self.mode.toggled();
        self.mode
    }

    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    fn handle(&self, id: &str) -> Option<&AgentHandle> {
        self.agents.iter().find(|a| a.id() == id)
    }

    /// Copy of one agent's current state
    pub async fn get_agent(&self, id: &str) -> Option<Agent> {
        match self.handle(id) {
            Some(handle) => Some(handle.snapshot().await),
            None => None,
        }
    }

    /// Copies of every agent, in insertion order
    pub async fn list_agents(&self) -> Vec<Agent> {
        let mut agents = Vec::with_capacity(self.agents.len());
        for handle in &self.agents {
            agents.push(handle.snapshot().await);
        }
        agents
    }

    /// Steps of the most recent run, or the configured steps before any run
    pub fn run_steps(&self) -> Vec<String> {
        self.last_run
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| self.steps.clone())
    }

    /// Snapshot of every agent in [`run_steps`](Self::run_steps), in step order.
    ///
    /// Dangling step ids are left out. Safe to call mid-run.
    pub async fn get_results(&self) -> Vec<RunResult> {
        let steps = self.run_steps();
        let mut results = Vec::with_capacity(steps.len());
        for id in &steps {
            if let Some(handle) = self.handle(id) {
                results.push(RunResult::from(&handle.snapshot().await));
            }
        }
        results
    }

    pub fn add_agent(&mut self, agent: Agent) -> Result<String, WorkflowError> {
        if self.handle(&agent.id).is_some() {
            return Err(WorkflowError::DuplicateAgent(agent.id));
        }
        let id = agent.id.clone();
        info!(agent = %id, name = %agent.name, role = %agent.role, "agent added");
        self.agents.push(AgentHandle::new(agent));
        Ok(id)
    }

    pub async fn update_agent(&mut self, id: &str, update: AgentUpdate) -> Result<(), WorkflowError> {
        let handle = self
            .handle(id)
            .ok_or_else(|| WorkflowError::UnknownAgent(id.to_string()))?;
        let mut agent = handle.lock().await;
        if let Some(name) = update.name {
            agent.name = name;
        }
        if let Some(role) = update.role {
            agent.role = role;
        }
        if let Some(template) = update.prompt_template {
            agent.prompt_template = template;
        }
        if let Some(input_type) = update.input_type {
            agent.input_type = input_type;
        }
        Ok(())
    }

    /// Remove an agent and its workflow step
    pub async fn remove_agent(&mut self, id: &str) -> Result<Agent, WorkflowError> {
        let index = self
            .agents
            .iter()
            .position(|a| a.id() == id)
            .ok_or_else(|| WorkflowError::UnknownAgent(id.to_string()))?;
        let handle = self.agents.remove(index);
        self.steps.retain(|step| step != id);
        info!(agent = %id, "agent removed");
        Ok(handle.snapshot().await)
    }

    pub fn add_step(&mut self, id: &str) -> Result<(), WorkflowError> {
        if self.handle(id).is_none() {
            return Err(WorkflowError::UnknownAgent(id.to_string()));
        }
        if self.steps.iter().any(|step| step == id) {
            return Err(WorkflowError::DuplicateStep(id.to_string()));
        }
        self.steps.push(id.to_string());
        Ok(())
    }

    /// Returns whether the step was present
    pub fn remove_step(&mut self, id: &str) -> bool {
        let before = self.steps.len();
        self.steps.retain(|step| step != id);
        self.steps.len() != before
    }

    pub fn move_step(&mut self, from: usize, to: usize) -> Result<(), WorkflowError> {
        let len = self.steps.len();
        for index in [from, to] {
            if index >= len {
                return Err(WorkflowError::StepOutOfRange { index, len });
            }
        }
        let id = self.steps.remove(from);
        self.steps.insert(to, id);
        Ok(())
    }

    pub fn clear_steps(&mut self) {
        self.steps.clear();
    }

    /// Check the configured workflow without running it
    pub async fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::ok();
        if self.steps.is_empty() {
            return report.with_error("The workflow has no steps");
        }

        let mut first = true;
        for id in &self.steps {
            let Some(handle) = self.handle(id) else {
                report = report.with_warning(format!("Step {} refers to a deleted agent and will be skipped", id));
                continue;
            };
            let agent = handle.snapshot().await;
            if agent.input_type == InputType::PreviousOutput {
                if first {
                    report = report.with_error(format!(
                        "\"{}\" is the first agent but uses previous_output as input",
                        agent.name
                    ));
                } else if self.mode == ExecutionMode::Parallel {
                    report = report.with_warning(format!(
                        "\"{}\" uses previous_output, but in parallel mode it receives the initial input",
                        agent.name
                    ));
                }
            }
            first = false;
        }

        if first {
            report = report.with_error("None of the workflow steps refers to a configured agent");
        }
        if let Err(e) = self.executor.ensure_ready() {
            report = report.with_error(e.to_string());
        }
        report
    }

    /// Resolve the initial input through `resolver`, then run the configured steps
    pub async fn run_workflow<H: InputHost>(
        &self,
        resolver: &InputResolver<H>,
    ) -> Result<RunSummary, WorkflowError> {
        let _guard = RunGuard::acquire(&self.running).ok_or(WorkflowError::AlreadyRunning)?;
        let (handles, skipped) = self.preflight(&self.steps).await?;

        // Preflight guarantees at least one handle
        let first = handles[0].snapshot().await;
        let input = match resolver.resolve(first.input_type, &first.name).await {
            Ok(Some(input)) => input,
            Ok(None) => {
                warn!("initial input cancelled, run aborted");
                return Err(WorkflowError::InputCancelled);
            }
            Err(ResolveError::PreviousOutputAsInitial) => {
                return Err(WorkflowError::PreviousOutputFirst(first.name))
            }
        };

        Ok(self.execute(&self.steps, &handles, skipped, &input).await)
    }

    /// Run `steps` with `initial_input` already resolved.
    ///
    /// Rejects a second call while a run is in flight. Per-agent failures are
    /// recorded on the agents and never returned from here.
    pub async fn run_workflow_with_steps(
        &self,
        steps: &[String],
        initial_input: &str,
    ) -> Result<RunSummary, WorkflowError> {
        let _guard = RunGuard::acquire(&self.running).ok_or(WorkflowError::AlreadyRunning)?;
        let (handles, skipped) = self.preflight(steps).await?;
        Ok(self.execute(steps, &handles, skipped, initial_input).await)
    }

    /// Checks that must pass before any agent state changes or any call is made
    async fn preflight(&self, steps: &[String]) -> Result<(Vec<AgentHandle>, usize), WorkflowError> {
        if steps.is_empty() {
            return Err(WorkflowError::EmptySteps);
        }

        let mut seen = HashSet::new();
        let mut handles = Vec::with_capacity(steps.len());
        let mut skipped = 0;
        for id in steps {
            if !seen.insert(id.as_str()) {
                return Err(WorkflowError::DuplicateStep(id.clone()));
            }
            match self.handle(id) {
                Some(handle) => handles.push(handle.clone()),
                None => {
                    warn!(step = %id, "step refers to a missing agent, skipping");
                    skipped += 1;
                }
            }
        }

        let Some(first) = handles.first() else {
            return Err(WorkflowError::NoAgents);
        };
        let first = first.snapshot().await;
        if first.input_type == InputType::PreviousOutput {
            return Err(WorkflowError::PreviousOutputFirst(first.name));
        }

        self.executor.ensure_ready().map_err(WorkflowError::NotReady)?;
        Ok((handles, skipped))
    }

    async fn execute(
        &self,
        steps: &[String],
        handles: &[AgentHandle],
        skipped: usize,
        initial_input: &str,
    ) -> RunSummary {
        *self.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(steps.to_vec());
        for handle in handles {
            handle.lock().await.reset();
        }

        info!(mode = %self.mode, agents = handles.len(), skipped, "workflow run started");
        let mut summary = match self.mode {
            ExecutionMode::Sequential => self.run_sequential(handles, initial_input).await,
            ExecutionMode::Parallel => self.run_parallel(handles, initial_input).await,
        };
        summary.skipped = skipped;
        info!(
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            "workflow run finished"
        );
        summary
    }

    async fn run_sequential(&self, handles: &[AgentHandle], initial_input: &str) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut current_input = initial_input.to_string();

        for handle in handles {
            match self.executor.execute(handle, &current_input).await {
                Ok(output) => {
                    summary.completed += 1;
                    current_input = output;
                }
                Err(e) => {
                    // A failed agent does not stop the pipeline; the next one
                    // gets the last successful output
                    summary.failed += 1;
                    warn!(agent = %handle.id(), error = %e, "continuing with previous input");
                }
            }
        }
        summary
    }

    async fn run_parallel(&self, handles: &[AgentHandle], initial_input: &str) -> RunSummary {
        let mut prepared = Vec::with_capacity(handles.len());
        for handle in handles {
            let run = self.executor.prepare(handle, initial_input).await;
            debug!(agent = %run.agent_id(), "agent dispatched");
            prepared.push(run);
        }

        let outcomes = join_all(prepared.into_iter().map(|run| self.executor.complete(run))).await;

        let failed = outcomes.iter().filter(|r| r.is_err()).count();
        RunSummary {
            completed: outcomes.len() - failed,
            failed,
            skipped: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentStatus, ExecutorConfig};
    use crate::input::{FileContent, HostError, PageContent};
    use crate::llm::{LlmClient, LlmRequest};
    use crate::workflow::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    // ========================================
    // Test doubles
    // ========================================

    /// Agents in these tests use the template `{input}|<name>`, so the prompt
    /// carries both the input and the agent name. Replies with `<input>+<name>`.
    #[derive(Default)]
    struct EchoClient {
        fail_for: HashSet<String>,
        delays: HashMap<String, Duration>,
        /// Calls block until a permit is added
        gate: Option<Arc<Semaphore>>,
        missing_key: bool,
        calls: Mutex<Vec<(String, String)>>,
        finished: Mutex<Vec<String>>,
    }

    impl EchoClient {
        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }

        fn input_for(&self, name: &str) -> Option<String> {
            self.calls()
                .into_iter()
                .find(|(n, _)| n == name)
                .map(|(_, input)| input)
        }

        fn finished(&self) -> Vec<String> {
            self.finished.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmClient for EchoClient {
        fn ensure_ready(&self) -> Result<(), LlmError> {
            if self.missing_key {
                Err(LlmError::MissingCredential)
            } else {
                Ok(())
            }
        }

        async fn complete(&self, request: LlmRequest) -> Result<String, LlmError> {
            let (input, name) = request
                .prompt
                .rsplit_once('|')
                .map(|(i, n)| (i.to_string(), n.to_string()))
                .unwrap_or_default();
            self.calls.lock().unwrap().push((name.clone(), input.clone()));

            if let Some(gate) = &self.gate {
                let _ = gate.acquire().await;
            }
            if let Some(delay) = self.delays.get(&name) {
                tokio::time::sleep(*delay).await;
            }
            self.finished.lock().unwrap().push(name.clone());

            if self.fail_for.contains(&name) {
                return Err(LlmError::Http(format!("{} exploded", name)));
            }
            Ok(format!("{}+{}", input, name))
        }
    }

    #[derive(Default)]
    struct StubHost {
        manual: Option<String>,
        clipboard: Option<String>,
    }

    #[async_trait]
    impl InputHost for StubHost {
        async fn request_manual_input(&self, _message: &str) -> Option<String> {
            self.manual.clone()
        }
        async fn scrape_page(&self) -> Result<PageContent, HostError> {
            Err(HostError::Unsupported("page scraping"))
        }
        async fn pick_file(&self) -> Result<Option<FileContent>, HostError> {
            Ok(None)
        }
        async fn read_clipboard(&self) -> Result<String, HostError> {
            self.clipboard.clone().ok_or(HostError::Unsupported("clipboard"))
        }
        async fn request_url(&self) -> Option<String> {
            None
        }
        fn notify(&self, _message: &str) {}
    }

    fn echo_agent(id: &str, name: &str, input_type: InputType) -> Agent {
        Agent::with_id(id, name, AgentRole::Custom, format!("{{input}}|{}", name), input_type)
    }

    /// Orchestrator with agents a1..a3 named A1..A3, all in the step list
    fn setup(client: Arc<EchoClient>, mode: ExecutionMode) -> (Orchestrator, Vec<String>) {
        let executor = AgentExecutor::new(client, ExecutorConfig::default());
        let mut orchestrator = Orchestrator::new(Arc::new(MemoryStore::new()), executor);
        orchestrator
            .add_agent(echo_agent("a1", "A1", InputType::Text))
            .unwrap();
        orchestrator
            .add_agent(echo_agent("a2", "A2", InputType::PreviousOutput))
            .unwrap();
        orchestrator
            .add_agent(echo_agent("a3", "A3", InputType::PreviousOutput))
            .unwrap();
        for id in ["a1", "a2", "a3"] {
            orchestrator.add_step(id).unwrap();
        }
        orchestrator.set_execution_mode(mode);
        let steps = orchestrator.steps().to_vec();
        (orchestrator, steps)
    }

    async fn output_of(orchestrator: &Orchestrator, id: &str) -> Option<String> {
        orchestrator.get_agent(id).await.and_then(|a| a.output)
    }

    // ========================================
    // Sequential mode
    // ========================================

    #[tokio::test]
    async fn test_sequential_chains_outputs() {
        let client = Arc::new(EchoClient::default());
        let (orchestrator, steps) = setup(client.clone(), ExecutionMode::Sequential);

        let summary = orchestrator.run_workflow_with_steps(&steps, "X").await.unwrap();

        assert_eq!(summary, RunSummary { completed: 3, failed: 0, skipped: 0 });
        assert_eq!(output_of(&orchestrator, "a1").await.as_deref(), Some("X+A1"));
        assert_eq!(output_of(&orchestrator, "a2").await.as_deref(), Some("X+A1+A2"));
        assert_eq!(output_of(&orchestrator, "a3").await.as_deref(), Some("X+A1+A2+A3"));
        assert!(!orchestrator.is_running());
    }

    #[tokio::test]
    async fn test_sequential_continues_after_failure() {
        let client = Arc::new(EchoClient {
            fail_for: HashSet::from(["A2".to_string()]),
            ..Default::default()
        });
        let (orchestrator, steps) = setup(client.clone(), ExecutionMode::Sequential);

        let summary = orchestrator.run_workflow_with_steps(&steps, "X").await.unwrap();

        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 1);

        let a2 = orchestrator.get_agent("a2").await.unwrap();
        assert_eq!(a2.status, AgentStatus::Error);
        assert!(a2.error.unwrap().contains("A2 exploded"));
        assert!(a2.output.is_none());

        // A3 gets A1's output, not A2's error text
        assert_eq!(client.input_for("A3").as_deref(), Some("X+A1"));
        assert_eq!(output_of(&orchestrator, "a3").await.as_deref(), Some("X+A1+A3"));
    }

    #[tokio::test]
    async fn test_sequential_runs_one_agent_at_a_time() {
        let client = Arc::new(EchoClient {
            delays: HashMap::from([("A1".to_string(), Duration::from_millis(30))]),
            ..Default::default()
        });
        let (orchestrator, steps) = setup(client.clone(), ExecutionMode::Sequential);

        orchestrator.run_workflow_with_steps(&steps, "X").await.unwrap();

        assert_eq!(client.finished(), vec!["A1", "A2", "A3"]);
    }

    // ========================================
    // Parallel mode
    // ========================================

    #[tokio::test]
    async fn test_parallel_gives_every_agent_the_initial_input() {
        let client = Arc::new(EchoClient {
            fail_for: HashSet::from(["A1".to_string()]),
            delays: HashMap::from([("A2".to_string(), Duration::from_millis(20))]),
            ..Default::default()
        });
        let (orchestrator, steps) = setup(client.clone(), ExecutionMode::Parallel);

        let summary = orchestrator.run_workflow_with_steps(&steps, "Y").await.unwrap();

        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 1);
        for name in ["A1", "A2", "A3"] {
            assert_eq!(client.input_for(name).as_deref(), Some("Y"));
        }
        assert_eq!(output_of(&orchestrator, "a2").await.as_deref(), Some("Y+A2"));
        assert_eq!(output_of(&orchestrator, "a3").await.as_deref(), Some("Y+A3"));
    }

    #[tokio::test]
    async fn test_parallel_results_follow_step_order() {
        let client = Arc::new(EchoClient {
            delays: HashMap::from([
                ("A1".to_string(), Duration::from_millis(60)),
                ("A2".to_string(), Duration::from_millis(30)),
            ]),
            ..Default::default()
        });
        let (orchestrator, steps) = setup(client.clone(), ExecutionMode::Parallel);

        orchestrator.run_workflow_with_steps(&steps, "Y").await.unwrap();

        assert_eq!(client.finished(), vec!["A3", "A2", "A1"]);
        let ids: Vec<_> = orchestrator.get_results().await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a1", "a2", "a3"]);
    }

    #[tokio::test]
    async fn test_parallel_starts_all_agents_before_any_finishes() {
        let gate = Arc::new(Semaphore::new(0));
        let client = Arc::new(EchoClient {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let (orchestrator, steps) = setup(client.clone(), ExecutionMode::Parallel);

        let run = orchestrator.run_workflow_with_steps(&steps, "Y");
        tokio::pin!(run);
        assert!(futures::poll!(&mut run).is_pending());

        let statuses: Vec<_> = orchestrator.get_results().await.into_iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![AgentStatus::Running; 3]);
        assert!(client.finished().is_empty());

        gate.add_permits(1);
        run.await.unwrap();
        assert_eq!(client.finished().len(), 3);
    }

    // ========================================
    // Run lifecycle
    // ========================================

    #[tokio::test]
    async fn test_second_run_is_rejected_while_first_in_flight() {
        let gate = Arc::new(Semaphore::new(0));
        let client = Arc::new(EchoClient {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let (orchestrator, steps) = setup(client.clone(), ExecutionMode::Sequential);

        let first = orchestrator.run_workflow_with_steps(&steps, "X");
        tokio::pin!(first);
        assert!(futures::poll!(&mut first).is_pending());
        assert!(orchestrator.is_running());
        let before = orchestrator.get_results().await;

        let second = orchestrator.run_workflow_with_steps(&steps, "other").await;
        assert!(matches!(second, Err(WorkflowError::AlreadyRunning)));
        assert_eq!(orchestrator.get_results().await, before);
        assert_eq!(client.calls().len(), 1);

        gate.add_permits(1);
        first.await.unwrap();
        assert!(!orchestrator.is_running());
        assert_eq!(output_of(&orchestrator, "a3").await.as_deref(), Some("X+A1+A2+A3"));
    }

    #[tokio::test]
    async fn test_run_resets_previous_state() {
        let client = Arc::new(EchoClient {
            fail_for: HashSet::from(["A2".to_string()]),
            ..Default::default()
        });
        let (orchestrator, steps) = setup(client.clone(), ExecutionMode::Sequential);
        orchestrator.run_workflow_with_steps(&steps, "X").await.unwrap();
        assert_eq!(orchestrator.get_agent("a2").await.unwrap().status, AgentStatus::Error);

        let gate = Arc::new(Semaphore::new(0));
        let gated = Arc::new(EchoClient {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        // Same agents behind a gated client, carrying the failed state over
        let store = Arc::new(MemoryStore::new());
        let mut rerun = Orchestrator::new(store, AgentExecutor::new(gated, ExecutorConfig::default()));
        for agent in orchestrator.list_agents().await {
            rerun.add_agent(agent).unwrap();
        }
        for id in &steps {
            rerun.add_step(id).unwrap();
        }
        // list_agents copies run state too; the new run must clear it
        assert_eq!(rerun.get_agent("a2").await.unwrap().status, AgentStatus::Error);

        let run = rerun.run_workflow_with_steps(&steps, "Z");
        tokio::pin!(run);
        assert!(futures::poll!(&mut run).is_pending());

        let a2 = rerun.get_agent("a2").await.unwrap();
        assert_eq!(a2.status, AgentStatus::Idle);
        assert!(a2.error.is_none());
        assert!(a2.output.is_none());

        gate.add_permits(1);
        run.await.unwrap();
        assert_eq!(rerun.get_agent("a2").await.unwrap().status, AgentStatus::Completed);
    }

    #[tokio::test]
    async fn test_dangling_steps_are_skipped() {
        for mode in [ExecutionMode::Sequential, ExecutionMode::Parallel] {
            let client = Arc::new(EchoClient::default());
            let (orchestrator, _) = setup(client.clone(), mode);
            let steps = vec!["a1".to_string(), "ghost".to_string(), "a2".to_string()];

            let summary = orchestrator.run_workflow_with_steps(&steps, "X").await.unwrap();

            assert_eq!(summary.skipped, 1);
            assert_eq!(summary.completed, 2);
            assert_eq!(client.calls().len(), 2);
        }
    }

    #[tokio::test]
    async fn test_results_exclude_dangling_steps() {
        let client = Arc::new(EchoClient::default());
        let store = Arc::new(MemoryStore::with_state(PersistedWorkflow {
            agents: vec![echo_agent("a1", "A1", InputType::Text)],
            execution_mode: ExecutionMode::Sequential,
            workflow_steps: vec!["ghost".into(), "a1".into()],
        }));
        let orchestrator =
            Orchestrator::load(store, AgentExecutor::new(client, ExecutorConfig::default())).unwrap();

        orchestrator
            .run_workflow_with_steps(orchestrator.steps(), "X")
            .await
            .unwrap();

        let results = orchestrator.get_results().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "a1");
    }

    #[tokio::test]
    async fn test_previous_output_first_is_rejected_before_any_call() {
        let client = Arc::new(EchoClient::default());
        let (orchestrator, _) = setup(client.clone(), ExecutionMode::Sequential);
        let steps = vec!["a2".to_string(), "a1".to_string()];

        let err = orchestrator.run_workflow_with_steps(&steps, "X").await.unwrap_err();

        assert!(matches!(err, WorkflowError::PreviousOutputFirst(name) if name == "A2"));
        assert!(client.calls().is_empty());
        assert!(!orchestrator.is_running());
    }

    #[tokio::test]
    async fn test_configuration_errors_mutate_nothing() {
        let client = Arc::new(EchoClient {
            missing_key: true,
            ..Default::default()
        });
        let (orchestrator, steps) = setup(client.clone(), ExecutionMode::Sequential);

        let err = orchestrator.run_workflow_with_steps(&steps, "X").await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotReady(LlmError::MissingCredential)));

        let err = orchestrator.run_workflow_with_steps(&[], "X").await.unwrap_err();
        assert!(matches!(err, WorkflowError::EmptySteps));

        let err = orchestrator
            .run_workflow_with_steps(&["ghost".to_string()], "X")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NoAgents));

        assert!(client.calls().is_empty());
        assert!(!orchestrator.is_running());
    }

    #[tokio::test]
    async fn test_dropped_run_releases_flag_and_agents() {
        for mode in [ExecutionMode::Sequential, ExecutionMode::Parallel] {
            let gate = Arc::new(Semaphore::new(0));
            let client = Arc::new(EchoClient {
                gate: Some(gate),
                ..Default::default()
            });
            let (orchestrator, steps) = setup(client, mode);

            {
                let run = orchestrator.run_workflow_with_steps(&steps, "X");
                tokio::pin!(run);
                assert!(futures::poll!(&mut run).is_pending());
                assert!(orchestrator.is_running());
            }

            assert!(!orchestrator.is_running());
            let results = orchestrator.get_results().await;
            assert!(results.iter().all(|r| r.status != AgentStatus::Running), "{:?}", mode);
            assert_eq!(results[0].status, AgentStatus::Error);
            assert_eq!(results[0].error.as_deref(), Some("run cancelled"));
            if mode == ExecutionMode::Sequential {
                // Never started, so never cancelled
                assert_eq!(results[1].status, AgentStatus::Idle);
            }
        }
    }

    #[tokio::test]
    async fn test_results_follow_the_steps_that_ran() {
        let client = Arc::new(EchoClient::default());
        let (orchestrator, steps) = setup(client, ExecutionMode::Parallel);
        assert_eq!(orchestrator.run_steps(), steps);

        let subset = vec!["a3".to_string(), "a1".to_string()];
        orchestrator.run_workflow_with_steps(&subset, "Y").await.unwrap();

        let ids: Vec<_> = orchestrator.get_results().await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a3", "a1"]);
        assert_eq!(orchestrator.steps(), steps.as_slice());
        assert_eq!(orchestrator.run_steps(), subset);
    }

    // ========================================
    // Initial input resolution
    // ========================================

    #[tokio::test]
    async fn test_run_workflow_resolves_first_agent_input() {
        let client = Arc::new(EchoClient::default());
        let (mut orchestrator, _) = setup(client.clone(), ExecutionMode::Sequential);
        orchestrator
            .update_agent(
                "a1",
                AgentUpdate {
                    input_type: Some(InputType::Clipboard),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let resolver = InputResolver::new(
            StubHost {
                clipboard: Some("copied".into()),
                ..Default::default()
            },
            Duration::from_secs(5),
        )
        .unwrap();

        orchestrator.run_workflow(&resolver).await.unwrap();

        assert_eq!(client.input_for("A1").as_deref(), Some("copied"));
        assert_eq!(output_of(&orchestrator, "a3").await.as_deref(), Some("copied+A1+A2+A3"));
    }

    #[tokio::test]
    async fn test_run_workflow_aborts_when_input_cancelled() {
        let client = Arc::new(EchoClient::default());
        let (orchestrator, _) = setup(client.clone(), ExecutionMode::Sequential);
        let resolver = InputResolver::new(StubHost::default(), Duration::from_secs(5)).unwrap();

        let err = orchestrator.run_workflow(&resolver).await.unwrap_err();

        assert!(matches!(err, WorkflowError::InputCancelled));
        assert!(client.calls().is_empty());
        assert!(!orchestrator.is_running());
        assert_eq!(orchestrator.get_agent("a1").await.unwrap().status, AgentStatus::Idle);
    }

    // ========================================
    // Editing and persistence
    // ========================================

    #[tokio::test]
    async fn test_step_editing() {
        let client = Arc::new(EchoClient::default());
        let (mut orchestrator, _) = setup(client, ExecutionMode::Sequential);

        assert!(matches!(orchestrator.add_step("a1"), Err(WorkflowError::DuplicateStep(_))));
        assert!(matches!(orchestrator.add_step("ghost"), Err(WorkflowError::UnknownAgent(_))));

        orchestrator.move_step(2, 0).unwrap();
        assert_eq!(orchestrator.steps(), ["a3", "a1", "a2"]);
        assert!(matches!(
            orchestrator.move_step(0, 3),
            Err(WorkflowError::StepOutOfRange { index: 3, len: 3 })
        ));

        assert!(orchestrator.remove_step("a1"));
        assert!(!orchestrator.remove_step("a1"));
        assert_eq!(orchestrator.steps(), ["a3", "a2"]);

        orchestrator.remove_agent("a3").await.unwrap();
        assert_eq!(orchestrator.steps(), ["a2"]);
        assert!(orchestrator.get_agent("a3").await.is_none());

        orchestrator.clear_steps();
        assert!(orchestrator.steps().is_empty());
    }

    #[tokio::test]
    async fn test_agent_editing() {
        let client = Arc::new(EchoClient::default());
        let (mut orchestrator, _) = setup(client, ExecutionMode::Sequential);

        let err = orchestrator.add_agent(echo_agent("a1", "Copy", InputType::Text)).unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateAgent(_)));

        orchestrator
            .update_agent(
                "a1",
                AgentUpdate {
                    name: Some("Reader".into()),
                    role: Some(AgentRole::Scraper),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let a1 = orchestrator.get_agent("a1").await.unwrap();
        assert_eq!(a1.name, "Reader");
        assert_eq!(a1.role, AgentRole::Scraper);
        assert_eq!(a1.prompt_template, "{input}|A1");

        let err = orchestrator.update_agent("ghost", AgentUpdate::default()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownAgent(_)));
    }

    #[tokio::test]
    async fn test_mode_toggle() {
        let client = Arc::new(EchoClient::default());
        let (mut orchestrator, _) = setup(client, ExecutionMode::Sequential);
        assert_eq!(orchestrator.toggle_execution_mode(), ExecutionMode::Parallel);
        assert_eq!(orchestrator.toggle_execution_mode(), ExecutionMode::Sequential);
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(EchoClient::default());
        let (orchestrator, steps) = setup(client.clone(), ExecutionMode::Parallel);
        orchestrator.run_workflow_with_steps(&steps, "X").await.unwrap();

        let mut copy = Orchestrator::new(
            store.clone(),
            AgentExecutor::new(client.clone(), ExecutorConfig::default()),
        );
        for agent in orchestrator.list_agents().await {
            copy.add_agent(agent).unwrap();
        }
        for id in &steps {
            copy.add_step(id).unwrap();
        }
        copy.set_execution_mode(ExecutionMode::Parallel);
        copy.save().await.unwrap();

        let loaded = Orchestrator::load(store, AgentExecutor::new(client, ExecutorConfig::default())).unwrap();
        assert_eq!(loaded.execution_mode(), ExecutionMode::Parallel);
        assert_eq!(loaded.steps(), steps.as_slice());
        let a1 = loaded.get_agent("a1").await.unwrap();
        assert_eq!(a1.status, AgentStatus::Idle);
        assert!(a1.output.is_none());
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(EchoClient::default());
        let executor = AgentExecutor::new(client, ExecutorConfig::default());
        let mut orchestrator = Orchestrator::new(store.clone(), executor);
        orchestrator.add_agent(echo_agent("a1", "A1", InputType::Text)).unwrap();
        orchestrator.add_step("a1").unwrap();
        orchestrator.set_execution_mode(ExecutionMode::Parallel);
        orchestrator.save().await.unwrap();

        orchestrator.reset().unwrap();

        assert!(orchestrator.list_agents().await.is_empty());
        assert!(orchestrator.steps().is_empty());
        assert_eq!(orchestrator.execution_mode(), ExecutionMode::Sequential);
        assert!(store.load().unwrap().agents.is_empty());
    }

    #[tokio::test]
    async fn test_validate_reports_problems() {
        let client = Arc::new(EchoClient::default());
        let (mut orchestrator, _) = setup(client, ExecutionMode::Parallel);

        let report = orchestrator.validate().await;
        assert!(report.is_valid);
        assert_eq!(report.warnings.len(), 2);

        orchestrator.move_step(1, 0).unwrap();
        let report = orchestrator.validate().await;
        assert!(!report.is_valid);
        assert!(report.errors[0].contains("A2"));

        orchestrator.clear_steps();
        assert!(!orchestrator.validate().await.is_valid);
    }

    #[test]
    fn test_execution_mode_serialization() {
        assert_eq!(serde_json::to_string(&ExecutionMode::Parallel).unwrap(), "\"parallel\"");
        let mode: ExecutionMode = serde_json::from_str("\"sequential\"").unwrap();
        assert_eq!(mode, ExecutionMode::Sequential);
    }
}
