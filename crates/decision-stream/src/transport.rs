use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Certificate, Client, Identity, RequestBuilder};
use tracing::info;

use bouncer_core::{user_agent, BouncerConfig, Credentials};

use crate::error::{error_chain, StreamError};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    ApiKey,
    Certificate,
}

/// Authenticated HTTP client for the authority.
#[derive(Debug, Clone)]
pub struct AuthTransport {
    client: Client,
    mode: AuthMode,
}

impl AuthTransport {
    pub fn build(config: &BouncerConfig, credentials: &Credentials) -> Result<Self, StreamError> {
        let mut builder = Client::builder()
            .use_rustls_tls()
            .user_agent(user_agent())
            .connect_timeout(Duration::from_secs(10));

        if let Some(ca_path) = &config.ca_cert_path {
            info!("Using CA cert {}", ca_path.display());
            let pem = read_pem(ca_path, "CA certificate")?;
            let ca = Certificate::from_pem(&pem)
                .map_err(|err| StreamError::Setup(format!("CA cert {}: {}", ca_path.display(), error_chain(&err))))?;
            builder = builder.add_root_certificate(ca);
        }

        let mode = match credentials {
            Credentials::ApiKey(key) => {
                info!("Using API key auth");
                // the key is sent verbatim, no interpolation of any kind
                let mut value = HeaderValue::from_str(key)
                    .map_err(|_| StreamError::Setup("api_key contains characters not allowed in a header".to_string()))?;
                value.set_sensitive(true);
                let mut headers = HeaderMap::new();
                headers.insert(HeaderName::from_static(API_KEY_HEADER), value);
                builder = builder.default_headers(headers);
                AuthMode::ApiKey
            }
            Credentials::Certificate { cert_path, key_path } => {
                info!(
                    "Using cert auth with cert {} and key {}",
                    cert_path.display(),
                    key_path.display()
                );
                builder = builder.identity(load_identity(cert_path, key_path)?);
                AuthMode::Certificate
            }
        };

        let client = builder
            .build()
            .map_err(|err| StreamError::Setup(error_chain(&err)))?;
        Ok(Self { client, mode })
    }

    pub fn mode(&self) -> &AuthMode {
        &self.mode
    }

    pub fn get(&self, url: reqwest::Url) -> RequestBuilder {
        self.client.get(url)
    }

    /// Maps an authority refusal onto the error for the active auth mode.
    pub fn rejection(&self, message: String) -> StreamError {
        match self.mode {
            AuthMode::ApiKey => StreamError::ApiKeyRejected(message),
            AuthMode::Certificate => StreamError::CertificateRejected(message),
        }
    }
}

fn read_pem(path: &Path, what: &'static str) -> Result<Vec<u8>, StreamError> {
    fs::read(path).map_err(|source| StreamError::CredentialFile {
        what,
        path: PathBuf::from(path),
        source,
    })
}

fn load_identity(cert_path: &Path, key_path: &Path) -> Result<Identity, StreamError> {
    let mut pem = read_pem(cert_path, "client certificate")?;
    if !pem.ends_with(b"\n") {
        pem.push(b'\n');
    }
    pem.extend(read_pem(key_path, "client key")?);
    Identity::from_pem(&pem).map_err(|err| {
        StreamError::Setup(format!(
            "client certificate {} / key {}: {}",
            cert_path.display(),
            key_path.display(),
            error_chain(&err)
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BouncerConfig {
        BouncerConfig::from_yaml_str("api_url: http://127.0.0.1:8080/\nbin_path: /bin/sh\n").unwrap()
    }

    #[test]
    fn test_api_key_mode() {
        let transport =
            AuthTransport::build(&config(), &Credentials::ApiKey("foo$bar".to_string())).unwrap();
        assert_eq!(transport.mode(), &AuthMode::ApiKey);
        assert!(matches!(
            transport.rejection("access forbidden".to_string()),
            StreamError::ApiKeyRejected(_)
        ));
    }

    #[test]
    fn test_missing_certificate_file() {
        let credentials = Credentials::Certificate {
            cert_path: PathBuf::from("/does/not/exist/bouncer.crt"),
            key_path: PathBuf::from("/does/not/exist/bouncer.key"),
        };
        let err = AuthTransport::build(&config(), &credentials).unwrap_err();
        assert!(matches!(
            err,
            StreamError::CredentialFile { what: "client certificate", .. }
        ));
    }

    #[test]
    fn test_missing_ca_file() {
        let mut config = config();
        config.ca_cert_path = Some(PathBuf::from("/does/not/exist/ca.crt"));
        let err = AuthTransport::build(&config, &Credentials::ApiKey("key".to_string())).unwrap_err();
        assert!(matches!(err, StreamError::CredentialFile { what: "CA certificate", .. }));
    }

    #[test]
    fn test_header_rejects_control_characters() {
        let result = AuthTransport::build(&config(), &Credentials::ApiKey("bad\nkey".to_string()));
        assert!(matches!(result, Err(StreamError::Setup(_))));
    }
}
