use std::future::Future;
use std::io;
use std::process::{Output, Stdio};
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use bouncer_core::RetryBudget;
use dispatcher::InvocationCommand;

use crate::exit::ExitCause;
use crate::retry::{RetryTracker, Transition};
use crate::SupervisorError;

/// Grace period between SIGTERM and SIGKILL on shutdown.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Spawning,
    Running,
    Exited,
    Respawning,
    FatallyStopped,
    Stopped,
}

/// Owns the enforcement program's process handle and its retry budget.
#[derive(Debug)]
pub struct ProcessSupervisor {
    command: InvocationCommand,
    retries: RetryTracker,
    child: Option<Child>,
    state: SupervisorState,
    spawn_count: u32,
}

impl ProcessSupervisor {
    pub fn new(command: InvocationCommand, budget: RetryBudget) -> Self {
        Self {
            command,
            retries: RetryTracker::new(budget),
            child: None,
            state: SupervisorState::Spawning,
            spawn_count: 0,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retries.retry_count()
    }

    pub fn spawn_count(&self) -> u32 {
        self.spawn_count
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Starts the long-lived program and hands back its stdin.
    pub fn spawn(&mut self) -> Result<ChildStdin, SupervisorError> {
        debug!("Starting binary {}", self.command);
        self.spawn_count += 1;
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // own process group, so shutdown reaches the whole tree
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: self.command.program.display().to_string(),
                source,
            })?;
        let stdin = child.stdin.take().ok_or(SupervisorError::NoStdin)?;
        self.child = Some(child);
        self.state = SupervisorState::Running;
        Ok(stdin)
    }

    /// Resolves when the running program exits. Never resolves if nothing
    /// is running.
    pub async fn wait_for_exit(&mut self) -> ExitCause {
        let Some(child) = self.child.as_mut() else {
            return std::future::pending().await;
        };
        let cause = match child.wait().await {
            Ok(status) => ExitCause::from(status),
            Err(err) => ExitCause::WaitFailed(err.to_string()),
        };
        self.child = None;
        self.state = SupervisorState::Exited;
        cause
    }

    /// Records an unexpected exit and decides between respawn and giving up.
    pub fn on_exit(&mut self, cause: &ExitCause) -> Transition {
        let transition = self.retries.on_exit(cause);
        self.state = match transition {
            Transition::Respawn { .. } => SupervisorState::Respawning,
            Transition::Fatal => SupervisorState::FatallyStopped,
        };
        transition
    }

    /// Runs one short-lived invocation to completion, in its own process
    /// group. If `stop` resolves first the whole group is terminated and
    /// [`Invocation::Stopped`] is returned.
    pub async fn invoke<F>(
        &mut self,
        command: &InvocationCommand,
        stop: F,
    ) -> Result<Invocation, ExitCause>
    where
        F: Future<Output = ()>,
    {
        debug!("running {command}");
        self.spawn_count += 1;
        self.state = SupervisorState::Running;
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                self.state = SupervisorState::Exited;
                ExitCause::SpawnFailed(format!("{}: {err}", command.program.display()))
            })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let finished = tokio::select! {
            biased;
            _ = stop => None,
            output = collect_output(&mut child, stdout, stderr) => Some(output),
        };
        self.state = SupervisorState::Exited;
        match finished {
            Some(output) => output
                .map(Invocation::Completed)
                .map_err(|err| ExitCause::WaitFailed(err.to_string())),
            None => {
                terminate_group(&mut child).await;
                Ok(Invocation::Stopped)
            }
        }
    }

    /// Terminates the running program and its process group: SIGTERM, then
    /// SIGKILL once the grace period is over.
    pub async fn shutdown(&mut self) {
        if self.state != SupervisorState::FatallyStopped {
            self.state = SupervisorState::Stopped;
        }
        if let Some(mut child) = self.child.take() {
            terminate_group(&mut child).await;
        }
    }
}

/// Outcome of a live-mode invocation that was not refused by the OS.
#[derive(Debug)]
pub enum Invocation {
    Completed(Output),
    Stopped,
}

async fn collect_output(
    child: &mut Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
) -> io::Result<Output> {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let read_out = async {
        if let Some(mut pipe) = stdout {
            pipe.read_to_end(&mut out).await?;
        }
        Ok::<_, io::Error>(())
    };
    let read_err = async {
        if let Some(mut pipe) = stderr {
            pipe.read_to_end(&mut err).await?;
        }
        Ok::<_, io::Error>(())
    };
    let (status, read_out, read_err) = tokio::join!(child.wait(), read_out, read_err);
    read_out?;
    read_err?;
    Ok(Output {
        status: status?,
        stdout: out,
        stderr: err,
    })
}

/// SIGTERM to the child's process group, SIGKILL after [`TERMINATE_GRACE`].
async fn terminate_group(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let group = Pid::from_raw(pid as i32);

    if let Err(err) = killpg(group, Signal::SIGTERM) {
        warn!("unable to signal custom program group {pid}: {err}");
    }
    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            info!("custom program stopped ({})", ExitCause::from(status));
            return;
        }
        Ok(Err(err)) => warn!("while waiting for custom program: {err}"),
        Err(_) => warn!(
            "custom program did not stop within {}s, killing it",
            TERMINATE_GRACE.as_secs()
        ),
    }
    if let Err(err) = killpg(group, Signal::SIGKILL) {
        debug!("kill custom program group {pid}: {err}");
    }
    if let Err(err) = child.kill().await {
        debug!("kill custom program: {err}");
    }
}
