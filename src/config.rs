//! Configuration consumed by the pipeline at assembly time.

use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    auth::{DEFAULT_RENEWAL_MARGIN, SharedSasToken},
    backoff::BackoffPolicy,
    clock::{Clock, SystemClock},
};

/// Largest keep-alive interval the hub accepts, in seconds.
pub const MAX_KEEP_ALIVE_SECS: u64 = 1740;

/// Longest delay the timer wheel can represent.
pub const MAX_TIMER_DURATION: Duration = Duration::from_millis((1 << 36) - 1);

/// Default provisioning endpoint.
pub const DEFAULT_PROVISIONING_HOST: &str = "global.azure-devices-provisioning.net";

/// Invalid configuration.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Hostname is empty.
    #[error("hostname must not be empty")]
    EmptyHostname,
    /// Keep-alive is zero or above [`MAX_KEEP_ALIVE_SECS`].
    #[error("keep alive must be between 1 and {MAX_KEEP_ALIVE_SECS} seconds, got {0}")]
    KeepAliveOutOfRange(u64),
    /// Retry interval is zero or above [`MAX_TIMER_DURATION`].
    #[error("connection retry interval must be positive and at most {max:?}, got {got:?}")]
    RetryIntervalOutOfRange {
        /// Supplied interval.
        got: Duration,
        /// Upper bound.
        max: Duration,
    },
}

/// Client certificate used instead of a SAS token.
#[derive(Clone, PartialEq, Eq)]
pub struct X509 {
    /// PEM-encoded certificate chain.
    pub cert_pem: Vec<u8>,
    /// PEM-encoded private key.
    pub key_pem: Vec<u8>,
    /// Optional key pass phrase.
    pub pass_phrase: Option<String>,
}

impl fmt::Debug for X509 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X509")
            .field("cert_len", &self.cert_pem.len())
            .finish_non_exhaustive()
    }
}

/// How the client proves its identity. Token and certificate are exclusive.
#[derive(Clone, Debug)]
pub enum Credential {
    /// Shared access signature.
    SasToken(SharedSasToken),
    /// Client certificate.
    X509(X509),
}

impl Credential {
    /// The SAS token, when this credential is one.
    #[must_use]
    pub fn sas_token(&self) -> Option<&SharedSasToken> {
        match self {
            Self::SasToken(token) => Some(token),
            Self::X509(_) => None,
        }
    }
}

/// Which identity the pipeline speaks for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identity {
    /// A hub device, optionally a module on it.
    Device {
        /// Device id.
        device_id: String,
        /// Module id.
        module_id: Option<String>,
    },
    /// A provisioning registration.
    Registration {
        /// Provisioning scope.
        id_scope: String,
        /// Registration id.
        registration_id: String,
    },
}

/// Proxy protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    /// HTTP CONNECT proxy.
    Http,
    /// SOCKS4 proxy.
    Socks4,
    /// SOCKS5 proxy.
    Socks5,
}

/// Proxy used to reach the broker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyOptions {
    /// Proxy protocol.
    pub proxy_type: ProxyType,
    /// Proxy host.
    pub address: String,
    /// Proxy port.
    pub port: u16,
    /// Optional username.
    #[serde(default)]
    pub username: Option<String>,
    /// Optional password.
    #[serde(default)]
    pub password: Option<String>,
}

/// Settings shared by every stage of a pipeline.
#[derive(Clone)]
pub struct PipelineConfig {
    pub(crate) hostname: String,
    pub(crate) gateway_hostname: Option<String>,
    pub(crate) identity: Identity,
    pub(crate) credential: Credential,
    pub(crate) server_verification_cert: Option<String>,
    pub(crate) websockets: bool,
    pub(crate) cipher: String,
    pub(crate) proxy_options: Option<ProxyOptions>,
    pub(crate) keep_alive: Duration,
    pub(crate) auto_connect: bool,
    pub(crate) connection_retry: bool,
    pub(crate) connection_retry_interval: Duration,
    pub(crate) product_info: String,
    pub(crate) ensure_desired_properties: bool,
    pub(crate) sastoken_renewal_margin: Duration,
    pub(crate) operation_timeout: Duration,
    pub(crate) provisioning_timeout: Duration,
    pub(crate) polling_interval: Duration,
    pub(crate) backoff: BackoffPolicy,
    pub(crate) clock: Arc<dyn Clock>,
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("hostname", &self.hostname)
            .field("gateway_hostname", &self.gateway_hostname)
            .field("identity", &self.identity)
            .field("websockets", &self.websockets)
            .field("keep_alive", &self.keep_alive)
            .field("auto_connect", &self.auto_connect)
            .field("connection_retry", &self.connection_retry)
            .field("connection_retry_interval", &self.connection_retry_interval)
            .finish_non_exhaustive()
    }
}

impl PipelineConfig {
    /// Start configuring a pipeline for `identity` at `hostname`.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use hubwire::config::{Credential, Identity, PipelineConfig, X509};
    ///
    /// let config = PipelineConfig::builder(
    ///     "hub.example.net",
    ///     Identity::Device { device_id: "dev".into(), module_id: None },
    ///     Credential::X509(X509 { cert_pem: vec![], key_pem: vec![], pass_phrase: None }),
    /// )
    /// .keep_alive(Duration::from_secs(30))
    /// .build()
    /// .expect("valid config");
    /// assert_eq!(config.keep_alive(), Duration::from_secs(30));
    /// ```
    #[must_use]
    pub fn builder(
        hostname: impl Into<String>,
        identity: Identity,
        credential: Credential,
    ) -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self {
                hostname: hostname.into(),
                gateway_hostname: None,
                identity,
                credential,
                server_verification_cert: None,
                websockets: false,
                cipher: String::new(),
                proxy_options: None,
                keep_alive: Duration::from_secs(60),
                auto_connect: true,
                connection_retry: true,
                connection_retry_interval: Duration::from_secs(10),
                product_info: String::new(),
                ensure_desired_properties: true,
                sastoken_renewal_margin: Duration::from_secs(DEFAULT_RENEWAL_MARGIN),
                operation_timeout: Duration::from_secs(10),
                provisioning_timeout: Duration::from_secs(30),
                polling_interval: Duration::from_secs(2),
                backoff: BackoffPolicy::default(),
                clock: Arc::new(SystemClock),
            },
        }
    }

    /// Hub or provisioning hostname.
    #[must_use]
    pub fn hostname(&self) -> &str { &self.hostname }

    /// Identity the pipeline speaks for.
    #[must_use]
    pub fn identity(&self) -> &Identity { &self.identity }

    /// Credential in use.
    #[must_use]
    pub fn credential(&self) -> &Credential { &self.credential }

    /// MQTT keep-alive interval.
    #[must_use]
    pub fn keep_alive(&self) -> Duration { self.keep_alive }

    /// Normalised cipher list.
    #[must_use]
    pub fn cipher(&self) -> &str { &self.cipher }

    /// Whether dropped connections are re-established automatically.
    #[must_use]
    pub fn connection_retry(&self) -> bool { self.connection_retry }

    /// Whether operations needing a connection establish one on demand.
    #[must_use]
    pub fn auto_connect(&self) -> bool { self.auto_connect }

    /// Backoff policy for reconnection: the retry interval seeds the delay.
    #[must_use]
    pub fn reconnect_policy(&self) -> BackoffPolicy {
        self.backoff.with_initial_delay(self.connection_retry_interval)
    }
}

/// Builder for [`PipelineConfig`].
#[must_use]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Connect through an edge gateway instead of the hub directly.
    pub fn gateway_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.config.gateway_hostname = Some(hostname.into());
        self
    }

    /// Trust `cert` (PEM) when verifying the server.
    pub fn server_verification_cert(mut self, cert: impl Into<String>) -> Self {
        self.config.server_verification_cert = Some(cert.into());
        self
    }

    /// Tunnel MQTT over websockets.
    pub fn websockets(mut self, enabled: bool) -> Self {
        self.config.websockets = enabled;
        self
    }

    /// Restrict TLS to `ciphers`.
    ///
    /// Names are joined with `:`, upper-cased and `_` becomes `-`.
    pub fn cipher<I, S>(mut self, ciphers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.config.cipher = ciphers
            .into_iter()
            .map(|c| c.as_ref().to_uppercase().replace('_', "-"))
            .collect::<Vec<_>>()
            .join(":");
        self
    }

    /// Reach the broker through a proxy.
    pub fn proxy_options(mut self, proxy: ProxyOptions) -> Self {
        self.config.proxy_options = Some(proxy);
        self
    }

    /// MQTT keep-alive interval.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    /// Establish a connection on demand for operations that need one.
    pub fn auto_connect(mut self, enabled: bool) -> Self {
        self.config.auto_connect = enabled;
        self
    }

    /// Re-establish dropped connections automatically.
    pub fn connection_retry(mut self, enabled: bool) -> Self {
        self.config.connection_retry = enabled;
        self
    }

    /// Base delay between reconnection attempts.
    pub fn connection_retry_interval(mut self, interval: Duration) -> Self {
        self.config.connection_retry_interval = interval;
        self
    }

    /// Custom product information appended to the user agent.
    pub fn product_info(mut self, info: impl Into<String>) -> Self {
        self.config.product_info = info.into();
        self
    }

    /// Re-fetch the twin after reconnecting to catch missed patches.
    pub fn ensure_desired_properties(mut self, enabled: bool) -> Self {
        self.config.ensure_desired_properties = enabled;
        self
    }

    /// Renew SAS tokens this long before they expire.
    pub fn sastoken_renewal_margin(mut self, margin: Duration) -> Self {
        self.config.sastoken_renewal_margin = margin;
        self
    }

    /// Deadline for subscribe and unsubscribe acknowledgements.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.operation_timeout = timeout;
        self
    }

    /// Overall deadline for a provisioning registration.
    pub fn provisioning_timeout(mut self, timeout: Duration) -> Self {
        self.config.provisioning_timeout = timeout;
        self
    }

    /// Default interval between provisioning status polls.
    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.config.polling_interval = interval;
        self
    }

    /// Backoff used when retrying operations.
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.config.backoff = backoff;
        self
    }

    /// Wall clock used for token expiry.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.config.clock = clock;
        self
    }

    /// Validate and finish.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the hostname is empty, keep-alive is
    /// outside `1..=1740` seconds or the retry interval is zero or longer than
    /// [`MAX_TIMER_DURATION`].
    pub fn build(mut self) -> Result<PipelineConfig, ConfigError> {
        let config = &mut self.config;
        if config.hostname.is_empty() {
            return Err(ConfigError::EmptyHostname);
        }
        let keep_alive = config.keep_alive.as_secs();
        if keep_alive == 0 || keep_alive > MAX_KEEP_ALIVE_SECS {
            return Err(ConfigError::KeepAliveOutOfRange(keep_alive));
        }
        let interval = config.connection_retry_interval;
        if interval.is_zero() || interval > MAX_TIMER_DURATION {
            return Err(ConfigError::RetryIntervalOutOfRange {
                got: interval,
                max: MAX_TIMER_DURATION,
            });
        }
        config.backoff = config.backoff.normalized();
        Ok(self.config)
    }
}
