//! Configuration options for the Millrace client.

use crate::auth::AuthCallback;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Configuration options for creating a Millrace client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MillraceOptions {
    /// API key from your Millrace dashboard
    #[serde(default)]
    pub key: Option<String>,

    /// Literal auth token, used instead of the API key
    #[serde(default)]
    pub token: Option<String>,

    /// Endpoint to fetch auth tokens from
    #[serde(default)]
    pub auth_url: Option<String>,

    /// Custom headers to send with token requests
    #[serde(default)]
    pub auth_headers: Option<HashMap<String, String>>,

    /// Programmatic token source; takes precedence over `auth_url`
    #[serde(skip)]
    pub auth_callback: Option<AuthCallback>,

    /// Client id presented to the service for presence
    #[serde(default)]
    pub client_id: Option<String>,

    /// Custom realtime host (default: realtime.millrace.io)
    #[serde(default)]
    pub realtime_host: Option<String>,

    /// Realtime port (default: 80 for ws, 443 for wss)
    #[serde(default)]
    pub port: Option<u16>,

    /// Use TLS/WSS connection
    #[serde(default)]
    pub use_tls: Option<bool>,

    /// Connect as soon as the client is created (default: true)
    #[serde(default)]
    pub auto_connect: Option<bool>,

    /// Queue publishes while a connection is pending (default: true)
    #[serde(default)]
    pub queue_messages: Option<bool>,

    /// Recovery key from a previous connection to resume from
    #[serde(default)]
    pub recover: Option<String>,

    /// Receive messages published over this same connection (default: true)
    #[serde(default)]
    pub echo_messages: Option<bool>,

    /// Delay before retrying after a disconnection, in milliseconds
    /// (default: 15000)
    #[serde(default)]
    pub disconnected_retry_timeout_ms: Option<u64>,

    /// Interval between retries while suspended, in milliseconds
    /// (default: 30000)
    #[serde(default)]
    pub suspended_retry_timeout_ms: Option<u64>,

    /// How long a connection may stay down before it suspends, in
    /// milliseconds (default: 120000)
    #[serde(default)]
    pub suspend_after_ms: Option<u64>,

    /// Deadline for the transport handshake and CONNECTED, in milliseconds
    /// (default: 10000)
    #[serde(default)]
    pub open_timeout_ms: Option<u64>,

    /// Deadline for attach/detach/close exchanges, in milliseconds
    /// (default: 10000)
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

impl Default for MillraceOptions {
    fn default() -> Self {
        Self {
            key: None,
            token: None,
            auth_url: None,
            auth_headers: None,
            auth_callback: None,
            client_id: None,
            realtime_host: None,
            port: None,
            use_tls: None,
            auto_connect: Some(true),
            queue_messages: Some(true),
            recover: None,
            echo_messages: Some(true),
            disconnected_retry_timeout_ms: Some(15_000),
            suspended_retry_timeout_ms: Some(30_000),
            suspend_after_ms: Some(120_000),
            open_timeout_ms: Some(10_000),
            request_timeout_ms: Some(10_000),
        }
    }
}

impl MillraceOptions {
    /// Create new options with just the API key
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    /// Create new options with a literal token
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Default::default()
        }
    }

    /// Builder pattern: set a literal auth token
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Builder pattern: set the token endpoint
    pub fn auth_url(mut self, url: impl Into<String>) -> Self {
        self.auth_url = Some(url.into());
        self
    }

    /// Builder pattern: add a token request header
    pub fn auth_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let headers = self.auth_headers.get_or_insert_with(HashMap::new);
        headers.insert(key.into(), value.into());
        self
    }

    /// Builder pattern: set a programmatic token source
    pub fn auth_callback(mut self, callback: AuthCallback) -> Self {
        self.auth_callback = Some(callback);
        self
    }

    /// Builder pattern: set the client id
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Builder pattern: set a custom realtime host
    pub fn realtime_host(mut self, host: impl Into<String>) -> Self {
        self.realtime_host = Some(host.into());
        self
    }

    /// Builder pattern: set the realtime port
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Builder pattern: enable/disable TLS
    pub fn use_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = Some(use_tls);
        self
    }

    /// Builder pattern: connect eagerly or on demand
    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = Some(auto_connect);
        self
    }

    /// Builder pattern: enable/disable queueing while disconnected
    pub fn queue_messages(mut self, queue_messages: bool) -> Self {
        self.queue_messages = Some(queue_messages);
        self
    }

    /// Builder pattern: resume from a recovery key
    pub fn recover(mut self, recovery_key: impl Into<String>) -> Self {
        self.recover = Some(recovery_key.into());
        self
    }

    /// Builder pattern: suppress delivery of our own publishes
    pub fn echo_messages(mut self, echo: bool) -> Self {
        self.echo_messages = Some(echo);
        self
    }

    /// Builder pattern: set the disconnected retry delay
    pub fn disconnected_retry_timeout(mut self, timeout: Duration) -> Self {
        self.disconnected_retry_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Builder pattern: set the suspended retry interval
    pub fn suspended_retry_timeout(mut self, timeout: Duration) -> Self {
        self.suspended_retry_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Builder pattern: set the suspension window
    pub fn suspend_after(mut self, window: Duration) -> Self {
        self.suspend_after_ms = Some(window.as_millis() as u64);
        self
    }

    /// Builder pattern: set the handshake deadline
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Builder pattern: set the channel-operation deadline
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Get the effective realtime endpoint URL, without auth parameters
    pub fn get_realtime_url(&self) -> String {
        let use_tls = self.use_tls.unwrap_or(true);
        let scheme = if use_tls { "wss" } else { "ws" };

        let host = self
            .realtime_host
            .clone()
            .unwrap_or_else(|| "realtime.millrace.io".to_string());

        let port = self.port.unwrap_or(if use_tls { 443 } else { 80 });

        // Don't include port in URL if it's the default for the scheme
        let port_str = if (use_tls && port == 443) || (!use_tls && port == 80) {
            String::new()
        } else {
            format!(":{}", port)
        };

        format!("{}://{}{}/", scheme, host, port_str)
    }

    /// Get the disconnected retry delay
    pub fn get_disconnected_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnected_retry_timeout_ms.unwrap_or(15_000))
    }

    /// Get the suspended retry interval
    pub fn get_suspended_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.suspended_retry_timeout_ms.unwrap_or(30_000))
    }

    /// Get the suspension window
    pub fn get_suspend_after(&self) -> Duration {
        Duration::from_millis(self.suspend_after_ms.unwrap_or(120_000))
    }

    /// Get the handshake deadline
    pub fn get_open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms.unwrap_or(10_000))
    }

    /// Get the channel-operation deadline
    pub fn get_request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.unwrap_or(10_000))
    }
}

/// Internal configuration derived from MillraceOptions
#[derive(Debug, Clone)]
pub struct Config {
    pub key: Option<String>,
    pub token: Option<String>,
    pub auth_url: Option<String>,
    pub auth_headers: HashMap<String, String>,
    pub auth_callback: Option<AuthCallback>,
    pub client_id: Option<String>,
    pub realtime_url: String,
    pub auto_connect: bool,
    pub queue_messages: bool,
    pub recover: Option<String>,
    pub echo_messages: bool,
    pub disconnected_retry_timeout: Duration,
    pub suspended_retry_timeout: Duration,
    pub suspend_after: Duration,
    pub open_timeout: Duration,
    pub request_timeout: Duration,
}

impl Config {
    /// Whether any credential source is configured
    pub fn has_credentials(&self) -> bool {
        self.key.is_some()
            || self.token.is_some()
            || self.auth_url.is_some()
            || self.auth_callback.is_some()
    }
}

impl From<MillraceOptions> for Config {
    fn from(opts: MillraceOptions) -> Self {
        Self {
            key: opts.key.clone(),
            token: opts.token.clone(),
            auth_url: opts.auth_url.clone(),
            auth_headers: opts.auth_headers.clone().unwrap_or_default(),
            auth_callback: opts.auth_callback.clone(),
            client_id: opts.client_id.clone(),
            realtime_url: opts.get_realtime_url(),
            auto_connect: opts.auto_connect.unwrap_or(true),
            queue_messages: opts.queue_messages.unwrap_or(true),
            recover: opts.recover.clone(),
            echo_messages: opts.echo_messages.unwrap_or(true),
            disconnected_retry_timeout: opts.get_disconnected_retry_timeout(),
            suspended_retry_timeout: opts.get_suspended_retry_timeout(),
            suspend_after: opts.get_suspend_after(),
            open_timeout: opts.get_open_timeout(),
            request_timeout: opts.get_request_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_realtime_url() {
        let opts = MillraceOptions::new("app.key:secret");
        let url = opts.get_realtime_url();
        assert_eq!(url, "wss://realtime.millrace.io/");
    }

    #[test]
    fn test_custom_host_url() {
        let opts = MillraceOptions::new("app.key:secret")
            .realtime_host("localhost")
            .port(6001)
            .use_tls(false);
        let url = opts.get_realtime_url();
        assert_eq!(url, "ws://localhost:6001/");
    }

    #[test]
    fn test_default_port_elided() {
        let opts = MillraceOptions::new("k").realtime_host("example.com").port(443);
        assert_eq!(opts.get_realtime_url(), "wss://example.com/");
    }

    #[test]
    fn test_config_url_carries_the_scheme() {
        let config = Config::from(
            MillraceOptions::new("k")
                .realtime_host("localhost")
                .port(6001)
                .use_tls(false),
        );
        assert_eq!(config.realtime_url, "ws://localhost:6001/");
    }

    #[test]
    fn test_timeout_defaults() {
        let config = Config::from(MillraceOptions::new("k"));
        assert_eq!(config.disconnected_retry_timeout, Duration::from_secs(15));
        assert_eq!(config.suspended_retry_timeout, Duration::from_secs(30));
        assert_eq!(config.suspend_after, Duration::from_secs(120));
        assert_eq!(config.open_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert!(config.auto_connect);
        assert!(config.queue_messages);
        assert!(config.echo_messages);
    }

    #[test]
    fn test_credentials_detection() {
        let config = Config::from(MillraceOptions::default());
        assert!(!config.has_credentials());

        let config = Config::from(MillraceOptions::with_token("tok"));
        assert!(config.has_credentials());

        let config = Config::from(MillraceOptions::default().auth_url("https://example.com/auth"));
        assert!(config.has_credentials());
    }
}
