pub mod config;
pub mod duration;
pub mod error;
pub mod identity;
pub mod ids;
pub mod types;

pub use config::{BouncerConfig, Credentials, LogLevel, LogMode, LoggingConfig, RetryBudget};
pub use error::BouncerError;
pub use identity::BinaryIdentity;
pub use ids::DecisionId;
pub use types::{Action, Decision, DecisionType, DeltaBatch, EnforcementEvent, Scope};

pub const BOUNCER_NAME: &str = "crowdsec-custom-bouncer";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn user_agent() -> String {
    format!("{BOUNCER_NAME}/v{VERSION}")
}
