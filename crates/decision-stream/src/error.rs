use std::error::Error as StdError;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("auth-api: auth with api key failed return nil response, error: API error: {0}")]
    ApiKeyRejected(String),
    #[error("API error: {0}")]
    CertificateRejected(String),
    #[error("{0}")]
    Transport(String),
    #[error("unexpected response from {url}: {status}: {message}")]
    UnexpectedStatus {
        url: String,
        status: u16,
        message: String,
    },
    #[error("malformed decision stream: {0}")]
    Malformed(String),
    #[error("unable to read {what} {}: {source}", path.display())]
    CredentialFile {
        what: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unable to configure transport: {0}")]
    Setup(String),
    #[error("invalid api_url '{0}'")]
    InvalidUrl(String),
    #[error("decision stream already terminated")]
    Terminated,
}

impl StreamError {
    /// Authority rejections as opposed to transport or protocol failures.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(
            self,
            StreamError::ApiKeyRejected(_) | StreamError::CertificateRejected(_)
        )
    }
}

/// Flattens an error and its sources into one line, so the root cause
/// (`Connection refused`, `invalid peer certificate: UnknownIssuer`) ends up
/// in the log.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !message.contains(&cause_text) {
            message.push_str(": ");
            message.push_str(&cause_text);
        }
        source = cause.source();
    }
    message
}
