pub mod agent;
pub mod logging;

pub use agent::{Agent, AgentError};
