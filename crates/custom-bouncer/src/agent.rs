//! Wires the stream client, the cache, the dispatcher and the supervisor
//! together and runs them until a stop is requested or one of them fails.

use std::future::Future;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use bouncer_core::{BouncerConfig, Credentials, DeltaBatch};
use decision_cache::DecisionCache;
use decision_stream::{AuthTransport, StreamClient, StreamError};
use dispatcher::{DeliveryQueue, DispatchError, Dispatcher, QUEUE_CAPACITY};
use supervisor::{supervise, ProcessSupervisor, SupervisorError};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unable to configure bouncer: {0}")]
    Setup(#[from] StreamError),
    #[error("bouncer stream halted")]
    StreamHalted,
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("{0} task failed: {1}")]
    Task(&'static str, String),
}

pub struct Agent {
    client: StreamClient,
    cache: DecisionCache,
    dispatcher: Dispatcher,
    queue: DeliveryQueue,
    supervisor: ProcessSupervisor,
    update_frequency: Duration,
}

impl Agent {
    /// Builds every component. Nothing touches the network or spawns a
    /// process until [`Agent::run`].
    pub fn new(config: &BouncerConfig, credentials: &Credentials) -> Result<Self, AgentError> {
        let transport = AuthTransport::build(config, credentials)?;
        let client = StreamClient::new(transport, config)?;
        let (dispatcher, queue) = Dispatcher::new(config, QUEUE_CAPACITY);
        debug!("delivery mode: {:?}", dispatcher.mode());
        Ok(Self {
            client,
            cache: DecisionCache::new(config.cache_retention_duration),
            dispatcher,
            queue,
            supervisor: ProcessSupervisor::from_config(config),
            update_frequency: config.update_frequency,
        })
    }

    /// Runs until `stop` resolves (clean exit) or the stream or the
    /// supervisor fails (error). The enforcement program is terminated in
    /// both cases.
    pub async fn run<F>(self, stop: F) -> Result<(), AgentError>
    where
        F: Future<Output = ()>,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut supervisor_task = tokio::spawn(supervise(
            self.supervisor,
            self.queue,
            shutdown_rx.clone(),
        ));
        let mut stream_task = tokio::spawn(stream_decisions(
            self.client,
            self.cache,
            self.dispatcher,
            self.update_frequency,
            shutdown_rx,
        ));

        let outcome = tokio::select! {
            biased;
            _ = stop => Ok(()),
            joined = &mut stream_task => {
                let result = flatten("stream", joined);
                if let Err(err) = &result {
                    error!("{err}");
                }
                result
            }
            joined = &mut supervisor_task => flatten_supervisor(joined),
        };

        info!("terminating bouncer process");
        let _ = shutdown_tx.send(true);
        if !stream_task.is_finished() {
            let _ = stream_task.await;
        }
        if !supervisor_task.is_finished() {
            if let Err(err) = flatten_supervisor(supervisor_task.await) {
                error!("while stopping custom program: {err}");
            }
        }
        outcome
    }
}

fn flatten(
    name: &'static str,
    joined: Result<Result<(), AgentError>, tokio::task::JoinError>,
) -> Result<(), AgentError> {
    joined.map_err(|err| AgentError::Task(name, err.to_string()))?
}

fn flatten_supervisor(
    joined: Result<Result<(), SupervisorError>, tokio::task::JoinError>,
) -> Result<(), AgentError> {
    flatten("supervisor", joined.map(|result| result.map_err(AgentError::from)))
}

async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn log_batch(batch: &DeltaBatch) {
    match batch.to_remove.len() {
        1 => info!("deleting 1 decision"),
        count => info!("deleting {count} decisions"),
    }
    match batch.to_add.len() {
        1 => info!("adding 1 decision"),
        count => info!("adding {count} decisions"),
    }
    for decision in &batch.to_add {
        debug!(
            "Adding '{}' for '{}'",
            decision.value,
            decision.duration.as_deref().unwrap_or_default()
        );
    }
}

async fn stream_decisions(
    mut client: StreamClient,
    mut cache: DecisionCache,
    dispatcher: Dispatcher,
    update_frequency: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), AgentError> {
    info!("Processing new and deleted decisions . . .");
    let mut ticker = tokio::time::interval(update_frequency);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop_requested(&mut shutdown) => return Ok(()),
            _ = ticker.tick() => {}
        }

        let batch = tokio::select! {
            biased;
            _ = stop_requested(&mut shutdown) => return Ok(()),
            polled = client.poll() => polled.map_err(|_| AgentError::StreamHalted)?,
        };
        log_batch(&batch);

        let events = cache.apply(batch, Instant::now());
        debug!("{} events to enforce, {} decisions enforced", events.len(), cache.len());
        if events.is_empty() {
            continue;
        }

        let delivered = tokio::select! {
            biased;
            _ = stop_requested(&mut shutdown) => return Ok(()),
            delivered = dispatcher.deliver(&events) => delivered,
        };
        match delivered {
            Ok(count) => debug!("queued {count} events"),
            Err(DispatchError::Closed) => {
                // the supervisor is gone and reports its own failure
                stop_requested(&mut shutdown).await;
                return Ok(());
            }
            Err(err) => error!("unable to queue decisions: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use bouncer_core::{Decision, DecisionId};

    use super::*;

    fn config(extra: &str) -> BouncerConfig {
        BouncerConfig::from_yaml_str(&format!(
            "api_url: http://127.0.0.1:1/\napi_key: key\nbin_path: /bin/sh\n{extra}"
        ))
        .unwrap()
    }

    #[test]
    fn test_agent_builds_without_network() {
        let config = config("feed_via_stdin: true\n");
        let credentials = config.validate().unwrap();
        let agent = Agent::new(&config, &credentials).unwrap();
        assert_eq!(agent.update_frequency, Duration::from_secs(10));
        assert!(matches!(agent.queue, DeliveryQueue::Stream(_)));
    }

    #[test]
    fn test_invalid_api_url_is_setup_error() {
        let config = BouncerConfig::from_yaml_str(
            "api_url: 'not a url'\napi_key: key\nbin_path: /bin/sh\n",
        )
        .unwrap();
        let credentials = config.credentials().unwrap();
        let err = Agent::new(&config, &credentials).err().unwrap();
        assert!(matches!(err, AgentError::Setup(StreamError::InvalidUrl(_))));
    }

    #[test]
    fn test_log_batch_accepts_empty_batch() {
        log_batch(&DeltaBatch::default());
        let batch = DeltaBatch {
            to_add: vec![Decision {
                id: DecisionId(1),
                value: "1.2.3.4".to_string(),
                scope: Default::default(),
                kind: Default::default(),
                origin: "cscli".to_string(),
                scenario: "manual 'ban' from 'localhost'".to_string(),
                duration: Some("4h".to_string()),
                uuid: None,
            }],
            to_remove: Vec::new(),
        };
        log_batch(&batch);
    }

    #[tokio::test]
    async fn test_stop_before_first_poll_is_clean() {
        let config = config("update_frequency: 1h\n");
        let credentials = config.credentials().unwrap();
        let agent = Agent::new(&config, &credentials).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(10), agent.run(async {})).await;
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_authority_halts_stream() {
        let config = config("feed_via_stdin: false\n");
        let credentials = config.credentials().unwrap();
        let agent = Agent::new(&config, &credentials).unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(20),
            agent.run(std::future::pending::<()>()),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(AgentError::StreamHalted)));
    }
}
