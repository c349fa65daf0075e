use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, error};

use bouncer_core::{BouncerConfig, Decision, DeltaBatch};

use crate::error::{error_chain, StreamError};
use crate::transport::AuthTransport;

const STREAM_PATH: &str = "v1/decisions/stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No snapshot received yet; the next poll asks for one.
    Connecting,
    Streaming,
    Terminated,
}

#[derive(Debug, Default, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    new: Option<Vec<Decision>>,
    #[serde(default)]
    deleted: Option<Vec<Decision>>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

/// Client for the authority's decisions stream.
///
/// The first successful poll returns the full snapshot; later polls only
/// return what changed since. Any failure moves the client to
/// `Terminated`, it never reconnects on its own.
#[derive(Debug)]
pub struct StreamClient {
    transport: AuthTransport,
    url: Url,
    filters: Vec<(&'static str, String)>,
    state: StreamState,
}

impl StreamClient {
    pub fn new(transport: AuthTransport, config: &BouncerConfig) -> Result<Self, StreamError> {
        let url = stream_url(&config.api_url)?;
        let mut filters = Vec::new();
        for (name, values) in [
            ("scenarios_containing", &config.scenarios_containing),
            ("scenarios_not_containing", &config.scenarios_not_containing),
            ("origins", &config.origins),
        ] {
            if !values.is_empty() {
                filters.push((name, values.join(",")));
            }
        }
        Ok(Self {
            transport,
            url,
            filters,
            state: StreamState::Connecting,
        })
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn poll(&mut self) -> Result<DeltaBatch, StreamError> {
        if self.state == StreamState::Terminated {
            return Err(StreamError::Terminated);
        }
        match self.fetch().await {
            Ok(batch) => {
                self.state = StreamState::Streaming;
                Ok(batch)
            }
            Err(err) => {
                self.state = StreamState::Terminated;
                error!("{err}");
                Err(err)
            }
        }
    }

    async fn fetch(&self) -> Result<DeltaBatch, StreamError> {
        let startup = self.state == StreamState::Connecting;
        let mut url = self.url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("startup", if startup { "true" } else { "false" });
            for (name, value) in &self.filters {
                query.append_pair(name, value);
            }
        }
        debug!("polling {url}");

        let response = self
            .transport
            .get(url.clone())
            .send()
            .await
            .map_err(|err| StreamError::Transport(error_chain(&err)))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| StreamError::Transport(error_chain(&err)))?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(self.transport.rejection(api_message(status, &body)));
        }
        if !status.is_success() {
            return Err(StreamError::UnexpectedStatus {
                url: self.url.to_string(),
                status: status.as_u16(),
                message: api_message(status, &body),
            });
        }

        let parsed: StreamResponse = serde_json::from_slice(&body)
            .map_err(|err| StreamError::Malformed(err.to_string()))?;
        Ok(DeltaBatch {
            to_add: parsed.new.unwrap_or_default(),
            to_remove: parsed.deleted.unwrap_or_default(),
        })
    }
}

fn stream_url(api_url: &str) -> Result<Url, StreamError> {
    let mut base = api_url.trim().to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Url::parse(&base)
        .and_then(|base| base.join(STREAM_PATH))
        .map_err(|_| StreamError::InvalidUrl(api_url.to_string()))
}

fn api_message(status: StatusCode, body: &[u8]) -> String {
    match serde_json::from_slice::<ApiErrorBody>(body) {
        Ok(parsed) => parsed.message,
        Err(_) if status == StatusCode::FORBIDDEN => "access forbidden".to_string(),
        Err(_) => status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_lowercase(),
    }
}
