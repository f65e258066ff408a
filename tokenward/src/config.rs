//! Service configuration
//!
//! A [`Config`] can be deserialized from any serde format or built in code
//! with [`Config::new`] and the `with_*` setters. Everything except the token
//! endpoint and client credentials has a default. Validation happens when the
//! service is constructed, never on first use.

use std::{fmt, net::IpAddr, path::PathBuf, time::Duration};

use serde::Deserialize;
use thiserror::Error;
use tokenward_clock::DurationSecs;

use crate::{
    crypto::{CryptoError, TokenCipher},
    scheduler::{ScheduleMode, SchedulerSettings},
    ClientId, ClientSecret, ProviderId, SubjectId,
};

/// A configuration problem detected at construction
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The token URL could not be parsed
    #[error("token URL `{url}` is invalid: {reason}")]
    InvalidTokenUrl {
        /// The offending URL
        url: String,
        /// Why it was rejected by the parser
        reason: String,
    },
    /// The token URL does not use https and is not a loopback address
    #[error("token URL `{0}` must use https")]
    InsecureTokenUrl(String),
    /// No client ID was given
    #[error("client ID must not be empty")]
    MissingClientId,
    /// No client secret was given
    #[error("client secret must not be empty")]
    MissingClientSecret,
    /// The encryption key is malformed
    #[error("encryption key is invalid")]
    EncryptionKey(#[from] CryptoError),
    /// A persistent store was configured without an encryption key
    #[error("an encryption key is required when tokens are persisted to disk")]
    MissingEncryptionKey,
    /// A persistent store was configured but file support is not compiled in
    #[error("file persistence requires the `file` feature")]
    FileBackendUnavailable,
    /// An interval that drives the refresh loop was zero
    #[error("`{0}` must be greater than zero")]
    ZeroInterval(&'static str),
    /// The HTTP client could not be constructed
    #[error("unable to construct HTTP client")]
    HttpClient(#[from] reqwest::Error),
}

/// Which identities the background loop tracks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// A single fixed identity
    Single,
    /// Every stored identity
    #[default]
    Multi,
}

/// Configuration for a [`TokenService`](crate::TokenService)
#[derive(Clone, Deserialize)]
pub struct Config {
    /// The provider's token endpoint
    pub token_url: String,
    /// The client ID presented with refresh grants
    pub client_id: ClientId,
    /// The client secret presented with refresh grants
    pub client_secret: ClientSecret,
    /// The provider whose tokens are managed
    #[serde(default)]
    pub provider: ProviderId,
    /// A base64-encoded 32-byte key for sealing tokens at rest
    #[serde(default)]
    pub encryption_key: Option<String>,
    /// Permits a persistent store to use a generated key
    #[serde(default)]
    pub allow_ephemeral_key: bool,
    /// How long before expiry a token is refreshed
    #[serde(default = "defaults::refresh_threshold")]
    pub refresh_threshold: DurationSecs,
    /// The longest the background loop sleeps between passes
    #[serde(default = "defaults::check_interval")]
    pub check_interval: DurationSecs,
    /// The shortest adaptive sleep in single-identity mode
    #[serde(default = "defaults::min_sleep")]
    pub min_sleep: DurationSecs,
    /// The total number of attempts made per refresh
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,
    /// The timeout for a single token endpoint request
    #[serde(default = "defaults::request_timeout")]
    pub request_timeout: DurationSecs,
    /// How long stopping waits for the background loop
    #[serde(default = "defaults::join_timeout")]
    pub join_timeout: DurationSecs,
    /// How many events to retain; defaults by mode
    #[serde(default)]
    pub event_history: Option<usize>,
    /// The most by which each sleep is randomly shortened
    #[serde(default)]
    pub max_jitter: DurationSecs,
    /// Persists tokens to this JSON file instead of memory
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    /// Which identities to track
    #[serde(default)]
    pub mode: Mode,
    /// Sends refresh grants as JSON rather than form data
    #[serde(default)]
    pub json_body: bool,
}

mod defaults {
    use tokenward_clock::DurationSecs;

    pub fn refresh_threshold() -> DurationSecs {
        DurationSecs(600)
    }

    pub fn check_interval() -> DurationSecs {
        DurationSecs(300)
    }

    pub fn min_sleep() -> DurationSecs {
        DurationSecs(60)
    }

    pub fn max_retries() -> u32 {
        3
    }

    pub fn request_timeout() -> DurationSecs {
        DurationSecs(30)
    }

    pub fn join_timeout() -> DurationSecs {
        DurationSecs(10)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Config")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret)
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "***ENCRYPTION KEY***"),
            )
            .field("provider", &self.provider)
            .field("allow_ephemeral_key", &self.allow_ephemeral_key)
            .field("refresh_threshold", &self.refresh_threshold)
            .field("check_interval", &self.check_interval)
            .field("min_sleep", &self.min_sleep)
            .field("max_retries", &self.max_retries)
            .field("request_timeout", &self.request_timeout)
            .field("join_timeout", &self.join_timeout)
            .field("event_history", &self.event_history)
            .field("max_jitter", &self.max_jitter)
            .field("store_path", &self.store_path)
            .field("mode", &self.mode)
            .field("json_body", &self.json_body)
            .finish()
    }
}

impl Config {
    /// Constructs a configuration with default settings
    pub fn new(token_url: impl Into<String>, client_id: ClientId, client_secret: ClientSecret) -> Self {
        Self {
            token_url: token_url.into(),
            client_id,
            client_secret,
            provider: ProviderId::default(),
            encryption_key: None,
            allow_ephemeral_key: false,
            refresh_threshold: defaults::refresh_threshold(),
            check_interval: defaults::check_interval(),
            min_sleep: defaults::min_sleep(),
            max_retries: defaults::max_retries(),
            request_timeout: defaults::request_timeout(),
            join_timeout: defaults::join_timeout(),
            event_history: None,
            max_jitter: DurationSecs::ZERO,
            store_path: None,
            mode: Mode::default(),
            json_body: false,
        }
    }

    /// Sets the provider
    pub fn with_provider(mut self, provider: ProviderId) -> Self {
        self.provider = provider;
        self
    }

    /// Sets the base64-encoded encryption key
    pub fn with_encryption_key(mut self, key: impl Into<String>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    /// Persists tokens to a JSON file
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    /// Sets the mode
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the refresh threshold
    pub fn with_refresh_threshold(mut self, threshold: DurationSecs) -> Self {
        self.refresh_threshold = threshold;
        self
    }

    /// Sets the check interval
    pub fn with_check_interval(mut self, interval: DurationSecs) -> Self {
        self.check_interval = interval;
        self
    }

    /// Sets the total number of attempts per refresh
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Parses and checks the token URL
    ///
    /// Plain http is accepted only for loopback hosts.
    pub fn token_url(&self) -> Result<reqwest::Url, ConfigError> {
        let url = reqwest::Url::parse(&self.token_url).map_err(|error| ConfigError::InvalidTokenUrl {
            url: self.token_url.clone(),
            reason: error.to_string(),
        })?;

        match url.scheme() {
            "https" => Ok(url),
            "http" if url.host_str().map_or(false, is_loopback) => Ok(url),
            _ => Err(ConfigError::InsecureTokenUrl(self.token_url.clone())),
        }
    }

    /// Checks the configuration for problems
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.token_url()?;

        if self.client_id.as_str().trim().is_empty() {
            return Err(ConfigError::MissingClientId);
        }
        if self.client_secret.as_str().trim().is_empty() {
            return Err(ConfigError::MissingClientSecret);
        }

        if let Some(key) = &self.encryption_key {
            TokenCipher::from_base64_key(key)?;
        } else if self.store_path.is_some() && !self.allow_ephemeral_key {
            return Err(ConfigError::MissingEncryptionKey);
        }

        if self.store_path.is_some() && !cfg!(feature = "file") {
            return Err(ConfigError::FileBackendUnavailable);
        }

        if self.check_interval == DurationSecs::ZERO {
            return Err(ConfigError::ZeroInterval("check_interval"));
        }
        if self.request_timeout == DurationSecs::ZERO {
            return Err(ConfigError::ZeroInterval("request_timeout"));
        }

        Ok(())
    }

    /// The scheduling mode this configuration selects
    pub fn schedule_mode(&self) -> ScheduleMode {
        match self.mode {
            Mode::Single => ScheduleMode::SingleIdentity(SubjectId::single_identity()),
            Mode::Multi => ScheduleMode::MultiIdentity,
        }
    }

    /// The scheduler settings this configuration selects
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            mode: self.schedule_mode(),
            provider: self.provider.clone(),
            refresh_threshold: self.refresh_threshold,
            check_interval: self.check_interval,
            min_sleep: self.min_sleep,
            join_timeout: Duration::from(self.join_timeout),
        }
    }

    /// The number of events to retain
    pub fn event_history(&self) -> usize {
        self.event_history
            .unwrap_or_else(|| self.schedule_mode().default_event_history())
    }
}

fn is_loopback(host: &str) -> bool {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map_or(host.eq_ignore_ascii_case("localhost"), |ip| ip.is_loopback())
}
