mod agent;
mod config;
mod host;
mod input;
mod llm;
mod workflow;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use agent::{Agent, AgentExecutor, AgentRole, InputType};
use config::{default_data_dir, CredentialStore, MindflowConfig, API_KEY_ENV};
use host::{confirm, HostOptions, TerminalHost};
use input::InputResolver;
use llm::GeminiClient;
use workflow::{
    export_json, export_markdown, parse_export, to_display_list, AgentUpdate, ExecutionMode,
    ExportMetadata, JsonFileStore, Orchestrator, RunResult,
};

/// Multi-agent LLM workflows: chain agents sequentially or fan them out in parallel
#[derive(Debug, Parser)]
#[command(name = "mindflow", version, about)]
struct Cli {
    /// Directory for config, credentials and workflow state
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Use the per-user data directory instead of ./.mindflow
    #[arg(long, global = true)]
    global: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create, edit and remove agents
    #[command(subcommand)]
    Agent(AgentCommand),
    /// Edit the ordered step list
    #[command(subcommand)]
    Steps(StepsCommand),
    /// Show or change the execution mode
    Mode {
        #[arg(value_enum)]
        mode: Option<ModeArg>,
    },
    /// Check the workflow without running it
    Validate,
    /// Run the workflow
    Run(RunArgs),
    /// Print a previously exported JSON result file
    Results { path: PathBuf },
    /// Manage the Gemini API key
    #[command(subcommand)]
    Key(KeyCommand),
    /// Show or initialise config.json
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Delete all agents, steps and settings
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
        /// Also delete the stored API key
        #[arg(long)]
        with_credentials: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Sequential,
    Parallel,
    /// Switch to the other mode
    Toggle,
}

#[derive(Debug, Subcommand)]
enum AgentCommand {
    /// Add an agent
    Add {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "custom")]
        role: AgentRole,
        /// Prompt template; `{input}` marks where the input goes
        #[arg(long, default_value = "{input}")]
        prompt: String,
        #[arg(long, default_value = "text")]
        input_type: InputType,
        /// Also append the agent to the workflow steps
        #[arg(long)]
        step: bool,
    },
    /// List agents
    List,
    /// Change an agent's settings
    Edit {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        role: Option<AgentRole>,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long)]
        input_type: Option<InputType>,
    },
    /// Remove an agent and its step
    Remove { id: String },
}

#[derive(Debug, Subcommand)]
enum StepsCommand {
    /// Show the step list
    List,
    /// Append an agent to the steps
    Add { id: String },
    /// Remove an agent from the steps
    Remove { id: String },
    /// Move the step at FROM to position TO (1-based)
    Move { from: usize, to: usize },
    /// Remove every step
    Clear,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Initial input; skips input resolution for the first agent
    #[arg(long)]
    input: Option<String>,
    /// Page to read for page_scrape input
    #[arg(long)]
    page: Option<String>,
    /// File to read for file_upload input
    #[arg(long)]
    file: Option<PathBuf>,
    /// Endpoint to fetch for api_call input
    #[arg(long)]
    url: Option<String>,
    /// Write the results as JSON
    #[arg(long)]
    export_json: Option<PathBuf>,
    /// Write the results as markdown
    #[arg(long)]
    export_markdown: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Write the default configuration if none exists
    Init,
}

#[derive(Debug, Subcommand)]
enum KeyCommand {
    /// Store the API key
    Set { key: String },
    /// Show whether a key is configured
    Status,
    /// Delete the stored key
    Clear,
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "mindflow=debug" } else { "mindflow=info" };
    let filter = EnvFilter::try_from_env("MINDFLOW_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn open_orchestrator(data_dir: &Path) -> anyhow::Result<Orchestrator> {
    let config = MindflowConfig::load(data_dir)?;
    let api_key = CredentialStore::new(data_dir).api_key()?;
    let client = GeminiClient::new(config.gemini_config(api_key))?;
    let executor = AgentExecutor::new(Arc::new(client), config.executor_config());
    let store = Arc::new(JsonFileStore::new(data_dir)?);
    Ok(Orchestrator::load(store, executor)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(|| default_data_dir(cli.global));

    match cli.command {
        Command::Key(command) => handle_key(&data_dir, command),
        Command::Config(command) => handle_config(&data_dir, command),
        Command::Results { path } => {
            let json = std::fs::read_to_string(&path)
                .context(format!("Failed to read {}", path.display()))?;
            let document = parse_export(&json)
                .context(format!("{} is not a workflow export", path.display()))?;
            println!(
                "Exported {} ({} mode, {} steps)",
                document.timestamp.to_rfc3339(),
                document.execution_mode,
                document.workflow_steps.len()
            );
            print_results(&document.results);
            if document.results.iter().any(|r| !r.status.is_terminal()) {
                println!("\nSome agents had not finished when this was exported.");
            }
            Ok(())
        }
        Command::Reset {
            yes,
            with_credentials,
        } => {
            if !yes && !confirm("Delete every agent and step?").await {
                bail!("reset cancelled");
            }
            let mut orchestrator = open_orchestrator(&data_dir)?;
            orchestrator.reset()?;
            if with_credentials {
                CredentialStore::new(&data_dir).clear()?;
            }
            println!("Workflow storage reset.");
            Ok(())
        }
        Command::Agent(command) => {
            let mut orchestrator = open_orchestrator(&data_dir)?;
            handle_agent(&mut orchestrator, command).await?;
            orchestrator.save().await?;
            Ok(())
        }
        Command::Steps(command) => {
            let mut orchestrator = open_orchestrator(&data_dir)?;
            handle_steps(&mut orchestrator, command).await?;
            orchestrator.save().await?;
            Ok(())
        }
        Command::Mode { mode } => {
            let mut orchestrator = open_orchestrator(&data_dir)?;
            match mode {
                None => {}
                Some(ModeArg::Toggle) => {
                    orchestrator.toggle_execution_mode();
                }
                Some(ModeArg::Sequential) => orchestrator.set_execution_mode(ExecutionMode::Sequential),
                Some(ModeArg::Parallel) => orchestrator.set_execution_mode(ExecutionMode::Parallel),
            }
            orchestrator.save().await?;
            println!("Execution mode: {}", orchestrator.execution_mode());
            Ok(())
        }
        Command::Validate => {
            let orchestrator = open_orchestrator(&data_dir)?;
            let report = orchestrator.validate().await;
            for warning in &report.warnings {
                println!("warning: {}", warning);
            }
            for error in &report.errors {
                println!("error: {}", error);
            }
            if !report.is_valid {
                bail!("workflow is not runnable");
            }
            println!("Workflow OK ({} steps, {}).", orchestrator.steps().len(), orchestrator.execution_mode());
            Ok(())
        }
        Command::Run(args) => {
            let fetch_timeout = MindflowConfig::load(&data_dir)?.fetch_timeout();
            let orchestrator = open_orchestrator(&data_dir)?;
            run(&orchestrator, args, fetch_timeout).await
        }
    }
}

fn handle_config(data_dir: &Path, command: ConfigCommand) -> anyhow::Result<()> {
    let config = MindflowConfig::load(data_dir)?;
    match command {
        ConfigCommand::Show => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigCommand::Init => {
            if data_dir.join("config.json").exists() {
                println!("config.json already exists in {}", data_dir.display());
            } else {
                config.save(data_dir)?;
                println!("Wrote default config to {}", data_dir.join("config.json").display());
            }
        }
    }
    Ok(())
}

fn handle_key(data_dir: &Path, command: KeyCommand) -> anyhow::Result<()> {
    let credentials = CredentialStore::new(data_dir);
    match command {
        KeyCommand::Set { key } => {
            if key.trim().is_empty() {
                bail!("API key must not be empty");
            }
            credentials.set_api_key(&key)?;
            println!("API key saved.");
        }
        KeyCommand::Status => {
            if std::env::var(API_KEY_ENV).is_ok_and(|k| !k.trim().is_empty()) {
                println!("API key: set via {}", API_KEY_ENV);
            } else if credentials.stored_api_key()?.is_some() {
                println!("API key: stored");
            } else {
                println!("API key: not configured");
            }
        }
        KeyCommand::Clear => {
            credentials.clear()?;
            println!("Stored API key removed.");
        }
    }
    Ok(())
}

async fn handle_agent(orchestrator: &mut Orchestrator, command: AgentCommand) -> anyhow::Result<()> {
    match command {
        AgentCommand::Add {
            name,
            role,
            prompt,
            input_type,
            step,
        } => {
            let id = orchestrator.add_agent(Agent::new(name, role, prompt, input_type))?;
            if step {
                orchestrator.add_step(&id)?;
            }
            println!("{}", id);
        }
        AgentCommand::List => {
            let agents = orchestrator.list_agents().await;
            if agents.is_empty() {
                println!("No agents configured.");
            }
            for agent in agents {
                let position = orchestrator
                    .steps()
                    .iter()
                    .position(|s| *s == agent.id)
                    .map(|p| format!("step {}", p + 1))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {:<20} {:<11} {:<16} {}",
                    agent.id, agent.name, agent.role, agent.input_type, position
                );
            }
        }
        AgentCommand::Edit {
            id,
            name,
            role,
            prompt,
            input_type,
        } => {
            let update = AgentUpdate {
                name,
                role,
                prompt_template: prompt,
                input_type,
            };
            orchestrator.update_agent(&id, update).await?;
            println!("Agent {} updated.", id);
        }
        AgentCommand::Remove { id } => {
            let agent = orchestrator.remove_agent(&id).await?;
            println!("Removed {} ({}).", agent.name, agent.id);
        }
    }
    Ok(())
}

async fn handle_steps(orchestrator: &mut Orchestrator, command: StepsCommand) -> anyhow::Result<()> {
    match command {
        StepsCommand::List => {}
        StepsCommand::Add { id } => orchestrator.add_step(&id)?,
        StepsCommand::Remove { id } => {
            if !orchestrator.remove_step(&id) {
                bail!("{} is not a workflow step", id);
            }
        }
        StepsCommand::Move { from, to } => {
            if from == 0 || to == 0 {
                bail!("step positions start at 1");
            }
            orchestrator.move_step(from - 1, to - 1)?;
        }
        StepsCommand::Clear => orchestrator.clear_steps(),
    }

    println!("Mode: {}", orchestrator.execution_mode());
    for (index, id) in orchestrator.steps().iter().enumerate() {
        match orchestrator.get_agent(id).await {
            Some(agent) => println!("{:>3}. {} ({}, input: {})", index + 1, agent.name, agent.id, agent.input_type),
            None => println!("{:>3}. {} (missing agent, will be skipped)", index + 1, id),
        }
    }
    Ok(())
}

async fn run(orchestrator: &Orchestrator, args: RunArgs, fetch_timeout: Duration) -> anyhow::Result<()> {
    let summary = match args.input {
        Some(input) => {
            orchestrator
                .run_workflow_with_steps(orchestrator.steps(), &input)
                .await?
        }
        None => {
            let host = TerminalHost::new(
                HostOptions {
                    page_url: args.page,
                    file: args.file,
                    api_url: args.url,
                },
                fetch_timeout,
            )?;
            let resolver = InputResolver::new(host, fetch_timeout)?;
            orchestrator.run_workflow(&resolver).await?
        }
    };

    let results = to_display_list(orchestrator).await;
    print_results(&results);
    println!(
        "\n{} completed, {} failed, {} skipped",
        summary.completed, summary.failed, summary.skipped
    );

    let meta = ExportMetadata::capture(orchestrator);
    if let Some(path) = args.export_json {
        let json = export_json(&results, &meta)?;
        std::fs::write(&path, json).context(format!("Failed to write {}", path.display()))?;
        println!("Results written to {}", path.display());
    }
    if let Some(path) = args.export_markdown {
        std::fs::write(&path, export_markdown(&results, &meta))
            .context(format!("Failed to write {}", path.display()))?;
        println!("Results written to {}", path.display());
    }
    Ok(())
}

fn print_results(results: &[RunResult]) {
    for (index, result) in results.iter().enumerate() {
        println!(
            "\n[{}] {} ({}) - {}",
            index + 1,
            result.name,
            result.role,
            result.status.display_name()
        );
        if let Some(error) = &result.error {
            println!("error: {}", error);
        } else if let Some(output) = &result.output {
            println!("{}", output.trim_end());
        }
    }
}
