//! Run results for display and export.
//!
//! Everything here is a pure function of a result list plus metadata.

use std::fmt::Write;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ExecutionMode, Orchestrator};
use crate::agent::{Agent, AgentRole, AgentStatus};

/// One agent's state at the end of (or during) a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub id: String,
    pub name: String,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl From<&Agent> for RunResult {
    fn from(agent: &Agent) -> Self {
        Self {
            id: agent.id.clone(),
            name: agent.name.clone(),
            role: agent.role,
            status: agent.status,
            output: agent.output.clone(),
            error: agent.error.clone(),
        }
    }
}

/// Run context written alongside the results
#[derive(Debug, Clone, PartialEq)]
pub struct ExportMetadata {
    pub timestamp: DateTime<Utc>,
    pub execution_mode: ExecutionMode,
    pub workflow_steps: Vec<String>,
}

impl ExportMetadata {
    /// Metadata for the orchestrator's mode and last-run steps, stamped now
    pub fn capture(orchestrator: &Orchestrator) -> Self {
        Self {
            timestamp: Utc::now(),
            execution_mode: orchestrator.execution_mode(),
            workflow_steps: orchestrator.run_steps(),
        }
    }
}

/// Exported JSON document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub timestamp: DateTime<Utc>,
    pub execution_mode: ExecutionMode,
    pub workflow_steps: Vec<String>,
    pub results: Vec<RunResult>,
}

/// Current results in the order of the last run's steps
pub async fn to_display_list(orchestrator: &Orchestrator) -> Vec<RunResult> {
    orchestrator.get_results().await
}

pub fn export_json(results: &[RunResult], meta: &ExportMetadata) -> Result<String, serde_json::Error> {
    let document = ExportDocument {
        timestamp: meta.timestamp,
        execution_mode: meta.execution_mode,
        workflow_steps: meta.workflow_steps.clone(),
        results: results.to_vec(),
    };
    serde_json::to_string_pretty(&document)
}

pub fn parse_export(json: &str) -> Result<ExportDocument, serde_json::Error> {
    serde_json::from_str(json)
}

/// Human-readable rendering of the same document
pub fn export_markdown(results: &[RunResult], meta: &ExportMetadata) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Workflow Results");
    let _ = writeln!(out);
    let _ = writeln!(out, "- **Exported:** {}", meta.timestamp.to_rfc3339());
    let _ = writeln!(out, "- **Execution mode:** {}", meta.execution_mode);
    let _ = writeln!(out, "- **Steps:** {}", meta.workflow_steps.len());

    for (index, result) in results.iter().enumerate() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## {}. {} ({})", index + 1, result.name, result.role);
        let _ = writeln!(out);
        let _ = writeln!(out, "**Status:** {}", result.status.display_name());
        let _ = writeln!(out);
        match (&result.output, &result.error) {
            (_, Some(error)) => {
                let _ = writeln!(out, "> **Error:** {}", error);
            }
            (Some(output), None) => {
                let _ = writeln!(out, "{}", output.trim_end());
            }
            (None, None) => {
                let _ = writeln!(out, "_No output._");
            }
        }
    }
    out
}
