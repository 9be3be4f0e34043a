mod export;
mod orchestrator;
mod store;

pub use export::{
    export_json, export_markdown, parse_export, to_display_list, ExportMetadata, RunResult,
};
pub use orchestrator::{AgentUpdate, ExecutionMode, Orchestrator};
pub use store::JsonFileStore;
