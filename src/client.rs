//! Client entry point.
//!
//! A [`MillraceClient`] owns one realtime connection and the channels
//! multiplexed over it. Construction wires the two together: channel-scoped
//! frames flow from the connection into the channel registry, and
//! connection state changes fan out to every channel before user listeners
//! run.

use crate::channels::{Channel, Channels};
use crate::connection::{Connection, ConnectionManager, ConnectionState};
use crate::error::{ErrorInfo, MillraceError, Result};
use crate::options::{Config, MillraceOptions};
use crate::transports::{TransportFactory, WebSocketFactory};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Client for the Millrace realtime service.
///
/// Cheap to clone; all clones share the same connection and channels.
///
/// # Example
///
/// ```no_run
/// use millrace::{MillraceClient, MillraceOptions};
///
/// # async fn run() -> millrace::Result<()> {
/// let client = MillraceClient::from_options(
///     MillraceOptions::new("app.key:secret").client_id("alice"),
/// )?;
/// client.wait_for_connection(std::time::Duration::from_secs(5)).await?;
///
/// let orders = client.channel("orders");
/// orders.subscribe(|message| println!("got {:?}", message.data));
/// orders.publish("created", serde_json::json!({ "id": 1 })).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MillraceClient {
    manager: Arc<ConnectionManager>,
    connection: Connection,
    channels: Arc<Channels>,
    client_id: Option<String>,
}

impl MillraceClient {
    /// Create a client from a key, connecting automatically.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        Self::from_options(MillraceOptions::new(key))
    }

    /// Create a client with full options.
    ///
    /// Respects `auto_connect`; when it is disabled, call [`connect`] to
    /// start the connection. Must be called within a tokio runtime.
    ///
    /// [`connect`]: MillraceClient::connect
    pub fn from_options(options: MillraceOptions) -> Result<Self> {
        Self::with_transport_factory(options, Arc::new(WebSocketFactory))
    }

    /// Create a client that carries frames over a custom transport.
    ///
    /// The factory is invoked once per connection attempt.
    pub fn with_transport_factory(
        options: MillraceOptions,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        let config = Config::from(options);
        if !config.has_credentials() {
            return Err(MillraceError::config(
                "No credentials: set key, token, auth_url or auth_callback",
            ));
        }

        let client_id = config.client_id.clone();
        let request_timeout = config.request_timeout;
        let auto_connect = config.auto_connect;

        let manager = Arc::new(ConnectionManager::new(config, factory));
        let channels = Arc::new(Channels::new(
            manager.clone(),
            client_id.clone(),
            request_timeout,
        ));

        // Weak: the manager must not keep the registry alive
        let router = Arc::downgrade(&channels);
        manager.set_frame_router(Arc::new(move |frame| {
            if let Some(channels) = router.upgrade() {
                channels.route_frame(frame);
            }
        }));

        // Registered before the client is handed out, so channels always
        // react to a connection transition ahead of user listeners
        let reactor = Arc::downgrade(&channels);
        manager.on_state_change(move |change| {
            if let Some(channels) = reactor.upgrade() {
                channels.handle_connection_change(change);
            }
        });

        let client = Self {
            connection: Connection::new(manager.clone()),
            manager,
            channels,
            client_id,
        };

        if auto_connect {
            debug!("Auto-connecting");
            let manager = client.manager.clone();
            tokio::spawn(async move {
                let _ = manager.connect().await;
            });
        }

        Ok(client)
    }

    /// Start connecting. Progress is reported through connection listeners.
    pub async fn connect(&self) -> Result<()> {
        self.manager.connect().await
    }

    /// Close the connection. Channels detach locally once it closes.
    pub async fn close(&self) -> Result<()> {
        self.manager.close().await
    }

    /// Get a channel by name, creating it on first use.
    pub fn channel(&self, name: &str) -> Channel {
        self.channels.get(name)
    }

    /// The channel registry.
    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    /// Handle to the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    /// The client id this client publishes and enters presence as
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Opaque key for recovering this connection from a fresh client
    pub fn recovery_key(&self) -> Option<String> {
        self.manager.recovery_key()
    }

    /// Wait until the connection is established.
    ///
    /// Returns early with the failure reason when the connection reaches a
    /// terminal state instead.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.manager.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Failed => {
                    let info = self
                        .manager
                        .error_reason()
                        .unwrap_or_else(|| ErrorInfo::connection_failed("Connection failed"));
                    return Err(info.into());
                }
                ConnectionState::Closed => {
                    return Err(MillraceError::connection("Connection is closed"));
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(MillraceError::timeout("Timed out waiting for connection"));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl std::fmt::Debug for MillraceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MillraceClient")
            .field("state", &self.state())
            .field("client_id", &self.client_id)
            .field("channels", &self.channels.len())
            .finish()
    }
}
