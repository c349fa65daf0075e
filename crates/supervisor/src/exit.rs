use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::sys::signal::Signal;

/// Why a run of the enforcement program ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitCause {
    Exited(i32),
    Signaled(i32),
    SpawnFailed(String),
    WaitFailed(String),
}

impl ExitCause {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitCause::Exited(0))
    }
}

impl From<ExitStatus> for ExitCause {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitCause::Exited(code),
            (None, Some(signal)) => ExitCause::Signaled(signal),
            (None, None) => ExitCause::WaitFailed(format!("unknown exit status {status}")),
        }
    }
}

impl fmt::Display for ExitCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCause::Exited(code) => write!(f, "exit status: {code}"),
            ExitCause::Signaled(signal) => write!(f, "signal: {}", signal_name(*signal)),
            ExitCause::SpawnFailed(message) => write!(f, "unable to start: {message}"),
            ExitCause::WaitFailed(message) => write!(f, "unable to wait: {message}"),
        }
    }
}

fn signal_name(signal: i32) -> String {
    let Ok(signal) = Signal::try_from(signal) else {
        return format!("signal {signal}");
    };
    let name = match signal {
        Signal::SIGKILL => "killed",
        Signal::SIGTERM => "terminated",
        Signal::SIGINT => "interrupt",
        Signal::SIGHUP => "hangup",
        Signal::SIGQUIT => "quit",
        Signal::SIGABRT => "aborted",
        Signal::SIGSEGV => "segmentation fault",
        Signal::SIGPIPE => "broken pipe",
        other => other.as_str(),
    };
    name.to_string()
}
