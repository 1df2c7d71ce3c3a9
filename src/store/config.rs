//! Client configuration for object store connections

use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Default connection timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 50;

/// Default socket (read) timeout in seconds
pub const DEFAULT_SOCKET_TIMEOUT_SECS: u64 = 50;

/// Request signing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerKind {
    /// AWS Signature Version 4
    SigV4,

    /// Unsigned requests
    Anonymous,
}

/// HTTP proxy settings
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

impl ProxyConfig {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Connection settings for an object store client.
///
/// Passed with every request and treated as immutable; stores are resolved
/// (and cached) per distinct configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// AWS region (e.g., "us-east-1")
    pub region: Option<String>,

    /// Custom endpoint URL (for S3-compatible services like MinIO)
    pub endpoint: Option<String>,

    /// Path-style addressing (required for some S3-compatible services)
    pub force_path_style: bool,

    /// Access key ID (uses credential chain if not provided)
    pub access_key: Option<String>,

    /// Secret access key (uses credential chain if not provided)
    pub secret_key: Option<String>,

    /// Session token (for temporary credentials)
    pub session_token: Option<String>,

    /// Do not sign requests (public buckets)
    pub no_sign_request: bool,

    /// Signer override by name
    pub signer_override: Option<String>,

    /// HTTP proxy
    pub proxy: Option<ProxyConfig>,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,

    /// Socket read timeout in seconds
    pub socket_timeout_secs: u64,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self {
            region: None,
            endpoint: None,
            force_path_style: false,
            access_key: None,
            secret_key: None,
            session_token: None,
            no_sign_request: false,
            signer_override: None,
            proxy: None,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            socket_timeout_secs: DEFAULT_SOCKET_TIMEOUT_SECS,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.access_key.is_some() != self.secret_key.is_some() {
            return Err(TransferError::Configuration(
                "Both access_key and secret_key must be provided together".to_string(),
            ));
        }

        if self.session_token.is_some() && self.access_key.is_none() {
            return Err(TransferError::Configuration(
                "session_token requires access_key and secret_key".to_string(),
            ));
        }

        if let Some(endpoint) = &self.endpoint {
            let parsed = Url::parse(endpoint).map_err(|e| {
                TransferError::Configuration(format!("Invalid endpoint '{}': {}", endpoint, e))
            })?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(TransferError::Configuration(format!(
                    "Endpoint '{}' must use http or https",
                    endpoint
                )));
            }
        }

        if let Some(proxy) = &self.proxy {
            if proxy.host.trim().is_empty() || proxy.port == 0 {
                return Err(TransferError::Configuration(format!(
                    "Invalid proxy {}:{}",
                    proxy.host, proxy.port
                )));
            }
            Url::parse(&proxy.url()).map_err(|e| {
                TransferError::Configuration(format!("Invalid proxy '{}': {}", proxy.url(), e))
            })?;
        }

        if self.connect_timeout_secs == 0 || self.socket_timeout_secs == 0 {
            return Err(TransferError::Configuration(
                "Timeouts must be at least 1 second".to_string(),
            ));
        }

        self.signer()?;
        Ok(())
    }

    /// Resolve the signing mode from `no_sign_request` and `signer_override`
    pub fn signer(&self) -> Result<SignerKind> {
        if self.no_sign_request {
            return Ok(SignerKind::Anonymous);
        }
        match self.signer_override.as_deref() {
            None => Ok(SignerKind::SigV4),
            Some("AWSS3V4SignerType") | Some("AWS4SignerType") | Some("SigV4") => {
                Ok(SignerKind::SigV4)
            }
            Some("NoOpSignerType") => Ok(SignerKind::Anonymous),
            Some(other) => Err(TransferError::Configuration(format!(
                "Unsupported signer override: {}",
                other
            ))),
        }
    }

    /// Check if using custom endpoint (S3-compatible service)
    pub fn is_custom_endpoint(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Check if using explicit credentials
    pub fn has_explicit_credentials(&self) -> bool {
        self.access_key.is_some() && self.secret_key.is_some()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.config.region = Some(region.into());
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = Some(endpoint.into());
        self
    }

    pub fn credentials(mut self, access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        self.config.access_key = Some(access_key.into());
        self.config.secret_key = Some(secret_key.into());
        self
    }

    pub fn session_token(mut self, token: impl Into<String>) -> Self {
        self.config.session_token = Some(token.into());
        self
    }

    pub fn force_path_style(mut self, force: bool) -> Self {
        self.config.force_path_style = force;
        self
    }

    pub fn no_sign_request(mut self, no_sign: bool) -> Self {
        self.config.no_sign_request = no_sign;
        self
    }

    pub fn signer_override(mut self, signer: impl Into<String>) -> Self {
        self.config.signer_override = Some(signer.into());
        self
    }

    pub fn proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.proxy = Some(ProxyConfig {
            host: host.into(),
            port,
        });
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.connect_timeout_secs = secs;
        self
    }

    pub fn socket_timeout_secs(mut self, secs: u64) -> Self {
        self.config.socket_timeout_secs = secs;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<ClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Validate a bucket name according to S3 naming rules
pub fn validate_bucket_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TransferError::InvalidRequest(
            "Bucket name cannot be empty".to_string(),
        ));
    }
    if !is_valid_bucket_name(name) {
        return Err(TransferError::InvalidRequest(format!(
            "Invalid bucket name: {}. Bucket names must be 3-63 characters, \
             lowercase letters, numbers, hyphens, and periods only",
            name
        )));
    }
    Ok(())
}

fn is_valid_bucket_name(name: &str) -> bool {
    if !(3..=63).contains(&name.len()) {
        return false;
    }

    let bytes = name.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !edge_ok(bytes[0]) || !edge_ok(bytes[bytes.len() - 1]) {
        return false;
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return false;
    }

    if name.contains("..") {
        return false;
    }

    // Cannot be formatted as IP address
    if name.split('.').count() == 4 && name.split('.').all(|s| s.parse::<u8>().is_ok()) {
        return false;
    }

    !name.starts_with("xn--") && !name.ends_with("-s3alias")
}
