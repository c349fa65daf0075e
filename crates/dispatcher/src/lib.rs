//! Delivery of enforcement events to the external program.
//!
//! The mode is fixed at startup: in stream mode every event becomes one JSON
//! line on the stdin of a long-lived program, in live mode every event
//! becomes one short-lived invocation. Either way the dispatcher only
//! enqueues work; the supervisor owns the processes that consume it.

use std::path::PathBuf;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use bouncer_core::{BouncerConfig, EnforcementEvent};

mod command;
mod encode;

pub use command::InvocationCommand;
pub use encode::encode_event;

pub const QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("serialize error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("enforcement delivery has stopped")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Stream,
    Live,
}

impl DeliveryMode {
    pub fn from_config(config: &BouncerConfig) -> Self {
        if config.feed_via_stdin {
            DeliveryMode::Stream
        } else {
            DeliveryMode::Live
        }
    }
}

/// Feeds newline-delimited records to the supervised program's stdin.
#[derive(Debug, Clone)]
pub struct StdinFeed {
    sender: mpsc::Sender<String>,
}

/// Turns each event into a separate program invocation.
#[derive(Debug, Clone)]
pub struct LiveInvoker {
    sender: mpsc::Sender<InvocationCommand>,
    program: PathBuf,
    bin_args: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum Dispatcher {
    Stream(StdinFeed),
    Live(LiveInvoker),
}

/// Consumer side of the ordered event queue, handed to the supervisor.
#[derive(Debug)]
pub enum DeliveryQueue {
    Stream(mpsc::Receiver<String>),
    Live(mpsc::Receiver<InvocationCommand>),
}

impl StdinFeed {
    pub async fn deliver(&self, events: &[EnforcementEvent]) -> Result<usize, DispatchError> {
        for event in events {
            let line = encode_event(event)?;
            debug!("queueing '{}' for '{}'", event.action, event.value);
            // waits while the queue is full, nothing is dropped
            self.sender.send(line).await.map_err(|_| DispatchError::Closed)?;
        }
        Ok(events.len())
    }
}

impl LiveInvoker {
    pub async fn deliver(&self, events: &[EnforcementEvent]) -> Result<usize, DispatchError> {
        for event in events {
            let json = encode_event(event)?;
            let command =
                InvocationCommand::for_event(self.program.clone(), &self.bin_args, event, json);
            debug!("queueing '{}' command for '{}'", event.action, event.value);
            self.sender.send(command).await.map_err(|_| DispatchError::Closed)?;
        }
        Ok(events.len())
    }
}

impl Dispatcher {
    pub fn new(config: &BouncerConfig, capacity: usize) -> (Self, DeliveryQueue) {
        match DeliveryMode::from_config(config) {
            DeliveryMode::Stream => {
                let (sender, receiver) = mpsc::channel(capacity);
                (
                    Dispatcher::Stream(StdinFeed { sender }),
                    DeliveryQueue::Stream(receiver),
                )
            }
            DeliveryMode::Live => {
                let (sender, receiver) = mpsc::channel(capacity);
                let invoker = LiveInvoker {
                    sender,
                    program: config.bin_path.clone(),
                    bin_args: config.bin_args.clone(),
                };
                (Dispatcher::Live(invoker), DeliveryQueue::Live(receiver))
            }
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        match self {
            Dispatcher::Stream(_) => DeliveryMode::Stream,
            Dispatcher::Live(_) => DeliveryMode::Live,
        }
    }

    /// Enqueues the events in order and returns how many were queued.
    pub async fn deliver(&self, events: &[EnforcementEvent]) -> Result<usize, DispatchError> {
        match self {
            Dispatcher::Stream(feed) => feed.deliver(events).await,
            Dispatcher::Live(invoker) => invoker.deliver(events).await,
        }
    }
}
