mod agent;
mod executor;

pub use agent::{Agent, AgentHandle, AgentRole, AgentStatus, InputType};
pub use executor::{AgentExecutor, ExecutorConfig};
