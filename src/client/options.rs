//! Options shared by every client constructor.

use std::{fmt, sync::Arc, time::Duration};

use crate::{
    auth::DEFAULT_TOKEN_TTL,
    backoff::BackoffPolicy,
    clock::{Clock, SystemClock},
    config::{PipelineConfigBuilder, ProxyOptions},
    transport::TransportFactory,
};

/// Optional settings for a client.
///
/// Unset values fall back to the pipeline defaults.
///
/// ```
/// use std::time::Duration;
///
/// use hubwire::client::ClientOptions;
///
/// let options = ClientOptions::default()
///     .keep_alive(Duration::from_secs(120))
///     .sastoken_ttl(900)
///     .product_info("thermostat/1.0");
/// assert_eq!(options.sastoken_ttl_secs(), 900);
/// ```
#[derive(Clone)]
#[must_use]
pub struct ClientOptions {
    server_verification_cert: Option<String>,
    gateway_hostname: Option<String>,
    websockets: bool,
    cipher: Vec<String>,
    product_info: String,
    proxy_options: Option<ProxyOptions>,
    keep_alive: Option<Duration>,
    auto_connect: bool,
    connection_retry: bool,
    connection_retry_interval: Option<Duration>,
    ensure_desired_properties: bool,
    sastoken_ttl: u64,
    sastoken_renewal_margin: Option<Duration>,
    operation_timeout: Option<Duration>,
    provisioning_timeout: Option<Duration>,
    backoff: Option<BackoffPolicy>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) transport: Option<Arc<dyn TransportFactory>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            server_verification_cert: None,
            gateway_hostname: None,
            websockets: false,
            cipher: Vec::new(),
            product_info: String::new(),
            proxy_options: None,
            keep_alive: None,
            auto_connect: true,
            connection_retry: true,
            connection_retry_interval: None,
            ensure_desired_properties: true,
            sastoken_ttl: DEFAULT_TOKEN_TTL,
            sastoken_renewal_margin: None,
            operation_timeout: None,
            provisioning_timeout: None,
            backoff: None,
            clock: Arc::new(SystemClock),
            transport: None,
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("gateway_hostname", &self.gateway_hostname)
            .field("websockets", &self.websockets)
            .field("keep_alive", &self.keep_alive)
            .field("auto_connect", &self.auto_connect)
            .field("connection_retry", &self.connection_retry)
            .field("sastoken_ttl", &self.sastoken_ttl)
            .finish_non_exhaustive()
    }
}

impl ClientOptions {
    /// Trust `cert` (PEM) when verifying the server.
    pub fn server_verification_cert(mut self, cert: impl Into<String>) -> Self {
        self.server_verification_cert = Some(cert.into());
        self
    }

    /// Connect through an edge gateway.
    pub fn gateway_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.gateway_hostname = Some(hostname.into());
        self
    }

    /// Tunnel MQTT over websockets.
    pub fn websockets(mut self, enabled: bool) -> Self {
        self.websockets = enabled;
        self
    }

    /// Restrict TLS to these cipher suites.
    pub fn cipher<I, S>(mut self, ciphers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cipher = ciphers.into_iter().map(Into::into).collect();
        self
    }

    /// Product information appended to the user agent.
    pub fn product_info(mut self, info: impl Into<String>) -> Self {
        self.product_info = info.into();
        self
    }

    /// Reach the broker through a proxy.
    pub fn proxy_options(mut self, proxy: ProxyOptions) -> Self {
        self.proxy_options = Some(proxy);
        self
    }

    /// MQTT keep-alive interval.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    /// Connect on demand when an operation needs a connection.
    pub fn auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect = enabled;
        self
    }

    /// Re-establish dropped connections.
    pub fn connection_retry(mut self, enabled: bool) -> Self {
        self.connection_retry = enabled;
        self
    }

    /// Base delay between reconnection attempts.
    pub fn connection_retry_interval(mut self, interval: Duration) -> Self {
        self.connection_retry_interval = Some(interval);
        self
    }

    /// Re-fetch the twin after reconnecting.
    pub fn ensure_desired_properties(mut self, enabled: bool) -> Self {
        self.ensure_desired_properties = enabled;
        self
    }

    /// Lifetime in seconds of tokens generated from a shared access key.
    pub fn sastoken_ttl(mut self, ttl_secs: u64) -> Self {
        self.sastoken_ttl = ttl_secs;
        self
    }

    /// Lifetime of generated tokens.
    #[must_use]
    pub fn sastoken_ttl_secs(&self) -> u64 { self.sastoken_ttl }

    /// Renew tokens this long before they expire.
    pub fn sastoken_renewal_margin(mut self, margin: Duration) -> Self {
        self.sastoken_renewal_margin = Some(margin);
        self
    }

    /// Deadline for subscribe and unsubscribe acknowledgements.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Overall deadline for a provisioning registration.
    pub fn provisioning_timeout(mut self, timeout: Duration) -> Self {
        self.provisioning_timeout = Some(timeout);
        self
    }

    /// Backoff for operation retries.
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Wall clock used for token expiry.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Transport used instead of the built-in MQTT one.
    pub fn transport(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport = Some(factory);
        self
    }

    pub(crate) fn apply(&self, mut builder: PipelineConfigBuilder) -> PipelineConfigBuilder {
        if let Some(cert) = &self.server_verification_cert {
            builder = builder.server_verification_cert(cert.clone());
        }
        if let Some(gateway) = &self.gateway_hostname {
            builder = builder.gateway_hostname(gateway.clone());
        }
        if let Some(proxy) = &self.proxy_options {
            builder = builder.proxy_options(proxy.clone());
        }
        if let Some(keep_alive) = self.keep_alive {
            builder = builder.keep_alive(keep_alive);
        }
        if let Some(interval) = self.connection_retry_interval {
            builder = builder.connection_retry_interval(interval);
        }
        if let Some(margin) = self.sastoken_renewal_margin {
            builder = builder.sastoken_renewal_margin(margin);
        }
        if let Some(timeout) = self.operation_timeout {
            builder = builder.operation_timeout(timeout);
        }
        if let Some(timeout) = self.provisioning_timeout {
            builder = builder.provisioning_timeout(timeout);
        }
        if let Some(backoff) = self.backoff {
            builder = builder.backoff(backoff);
        }
        builder
            .websockets(self.websockets)
            .cipher(&self.cipher)
            .product_info(self.product_info.clone())
            .auto_connect(self.auto_connect)
            .connection_retry(self.connection_retry)
            .ensure_desired_properties(self.ensure_desired_properties)
            .clock(Arc::clone(&self.clock))
    }
}
