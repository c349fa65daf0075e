use std::fmt;
use std::path::PathBuf;

use bouncer_core::EnforcementEvent;

/// One short-lived run of the enforcement program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl InvocationCommand {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// `<program> <action> <value> <duration-seconds> <scenario> <json> [bin_args...]`
    pub fn for_event(
        program: PathBuf,
        bin_args: &[String],
        event: &EnforcementEvent,
        json: String,
    ) -> Self {
        let mut args = vec![
            event.action.to_string(),
            event.value.clone(),
            event.duration_seconds().to_string(),
            event.scenario.clone(),
            json,
        ];
        args.extend(bin_args.iter().cloned());
        Self::new(program, args)
    }
}

impl fmt::Display for InvocationCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
