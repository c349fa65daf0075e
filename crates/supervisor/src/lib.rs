//! Supervision of the external enforcement program.
//!
//! In stream mode one long-lived program receives the event lines on its
//! stdin and is respawned when it dies; in live mode each queued invocation
//! runs to completion and failed runs are retried. Both count failures
//! against the same retry budget, and exhausting it is fatal for the whole
//! bouncer.

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use bouncer_core::BouncerConfig;
use dispatcher::{DeliveryQueue, InvocationCommand};

mod exit;
mod process;
mod retry;

pub use exit::ExitCause;
pub use process::{Invocation, ProcessSupervisor, SupervisorState, TERMINATE_GRACE};
pub use retry::{respawn_delay, RetryTracker, Transition, RESPAWN_DELAY_INITIAL, RESPAWN_DELAY_MAX};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("maximum retries exceeded for program execution")]
    RetriesExhausted,
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("custom program has no stdin")]
    NoStdin,
}

impl ProcessSupervisor {
    pub fn from_config(config: &BouncerConfig) -> Self {
        let command = InvocationCommand::new(config.bin_path.clone(), config.bin_args.clone());
        Self::new(command, config.retry_budget())
    }
}

/// Drives the supervisor for whichever delivery mode the queue belongs to,
/// until shutdown is requested or the retry budget runs out.
pub async fn supervise(
    supervisor: ProcessSupervisor,
    queue: DeliveryQueue,
    shutdown: watch::Receiver<bool>,
) -> Result<(), SupervisorError> {
    match queue {
        DeliveryQueue::Stream(lines) => feed_stdin(supervisor, lines, shutdown).await,
        DeliveryQueue::Live(commands) => run_invocations(supervisor, commands, shutdown).await,
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    let mut buffer = Vec::with_capacity(line.len() + 1);
    buffer.extend_from_slice(line.as_bytes());
    buffer.push(b'\n');
    stdin.write_all(&buffer).await?;
    stdin.flush().await
}

/// Waits out the respawn delay. Returns `false` if shutdown was requested
/// in the meantime.
async fn respawn_pause(attempt: u32, shutdown: &mut watch::Receiver<bool>) -> bool {
    let delay = respawn_delay(attempt);
    debug!("respawning custom program in {}ms", delay.as_millis());
    tokio::select! {
        biased;
        _ = shutdown_requested(shutdown) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Stream mode. A line that could not be written because the program died
/// is kept and written to the next instance.
pub async fn feed_stdin(
    mut supervisor: ProcessSupervisor,
    mut lines: mpsc::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SupervisorError> {
    let mut pending: Option<String> = None;
    let mut queue_open = true;

    loop {
        let transition = match supervisor.spawn() {
            Ok(stdin) => {
                info!("custom program started (pid {})", supervisor.pid().unwrap_or_default());
                let fed = feed_instance(
                    &mut supervisor,
                    stdin,
                    &mut pending,
                    &mut queue_open,
                    &mut lines,
                    &mut shutdown,
                )
                .await;
                match fed {
                    Some(transition) => transition,
                    None => {
                        supervisor.shutdown().await;
                        return Ok(());
                    }
                }
            }
            Err(err) => supervisor.on_exit(&ExitCause::SpawnFailed(err.to_string())),
        };
        let Transition::Respawn { attempt } = transition else {
            return Err(SupervisorError::RetriesExhausted);
        };
        if !respawn_pause(attempt, &mut shutdown).await {
            supervisor.shutdown().await;
            return Ok(());
        }
    }
}

/// Feeds one running instance until it exits, returning the supervisor's
/// verdict on that exit, or `None` once shutdown is requested.
async fn feed_instance(
    supervisor: &mut ProcessSupervisor,
    stdin: ChildStdin,
    pending: &mut Option<String>,
    queue_open: &mut bool,
    lines: &mut mpsc::Receiver<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Transition> {
    let mut stdin = Some(stdin);
    loop {
        let writable = stdin.is_some() && (pending.is_some() || *queue_open);
        tokio::select! {
            biased;
            _ = shutdown_requested(shutdown) => return None,
            cause = supervisor.wait_for_exit() => return Some(supervisor.on_exit(&cause)),
            next = next_line(pending, lines), if writable => {
                let Some(line) = next else {
                    debug!("event queue closed");
                    *queue_open = false;
                    continue;
                };
                let Some(pipe) = stdin.as_mut() else {
                    *pending = Some(line);
                    continue;
                };
                tokio::select! {
                    biased;
                    _ = shutdown_requested(shutdown) => return None,
                    written = write_line(pipe, &line) => {
                        if let Err(err) = written {
                            warn!("unable to write to custom program: {err}");
                            *pending = Some(line);
                            // wait for the exit watcher to report the crash
                            stdin = None;
                        }
                    }
                }
            }
        }
    }
}

async fn next_line(
    pending: &mut Option<String>,
    lines: &mut mpsc::Receiver<String>,
) -> Option<String> {
    match pending.take() {
        Some(line) => Some(line),
        None => lines.recv().await,
    }
}

/// Live mode. A failed invocation is retried with the same arguments while
/// the budget allows.
pub async fn run_invocations(
    mut supervisor: ProcessSupervisor,
    mut commands: mpsc::Receiver<InvocationCommand>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SupervisorError> {
    loop {
        let command = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => {
                supervisor.shutdown().await;
                return Ok(());
            }
            command = commands.recv() => match command {
                Some(command) => command,
                None => {
                    debug!("event queue closed");
                    shutdown_requested(&mut shutdown).await;
                    supervisor.shutdown().await;
                    return Ok(());
                }
            },
        };
        let action = command.args.first().cloned().unwrap_or_default();

        loop {
            let outcome = supervisor
                .invoke(&command, shutdown_requested(&mut shutdown))
                .await;
            let cause = match outcome {
                Ok(Invocation::Stopped) => {
                    supervisor.shutdown().await;
                    return Ok(());
                }
                Ok(Invocation::Completed(output)) => {
                    let cause = ExitCause::from(output.status);
                    let combined = combined_output(&output);
                    if cause.is_success() {
                        debug!("'{action}' command ({command}) --> {combined}");
                        break;
                    }
                    error!("Error in '{action}' command ({command}): {cause} --> {combined}");
                    cause
                }
                Err(cause) => {
                    error!("Error in '{action}' command ({command}): {cause}");
                    cause
                }
            };
            let Transition::Respawn { attempt } = supervisor.on_exit(&cause) else {
                return Err(SupervisorError::RetriesExhausted);
            };
            if !respawn_pause(attempt, &mut shutdown).await {
                supervisor.shutdown().await;
                return Ok(());
            }
        }
    }
}

fn combined_output(output: &std::process::Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text.trim_end().to_string()
}
