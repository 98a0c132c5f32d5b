//! WebSocket transport implementation using tokio-tungstenite.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use super::transport::{Transport, TransportEvent, TransportFactory, TransportListener};
use crate::error::{MillraceError, Result};
use crate::protocol::ProtocolMessage;

/// Command to send to the WebSocket writer task
enum WriteCommand {
    SendText(String),
    Close,
}

/// WebSocket transport.
///
/// Single-shot: once closed it cannot be connected again. A close may land
/// while the handshake is still in flight; the handshake task re-checks the
/// closed flag and tears the late socket down instead of surfacing it.
pub struct WebSocketTransport {
    /// Channel to send commands to the writer task
    write_tx: Arc<RwLock<Option<mpsc::Sender<WriteCommand>>>>,
    /// Connected flag
    connected: Arc<RwLock<bool>>,
    /// Set by `close`, never cleared
    closed: Arc<RwLock<bool>>,
    /// Event listener
    listener: Arc<RwLock<Option<TransportListener>>>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self {
            write_tx: Arc::new(RwLock::new(None)),
            connected: Arc::new(RwLock::new(false)),
            closed: Arc::new(RwLock::new(false)),
            listener: Arc::new(RwLock::new(None)),
        }
    }

    fn emit(listener: &Arc<RwLock<Option<TransportListener>>>, event: TransportEvent) {
        let listener = listener.read().clone();
        if let Some(listener) = listener {
            listener(event);
        }
    }

    /// Spawn reader and writer tasks
    fn spawn_tasks(&self, url: String) {
        let listener = self.listener.clone();
        let connected = self.connected.clone();
        let closed = self.closed.clone();
        let write_tx_arc = self.write_tx.clone();

        tokio::spawn(async move {
            let mut ws_stream = match connect_async(&url).await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    if *closed.read() {
                        debug!("Abandoned connection attempt failed: {:?}", e);
                        return;
                    }
                    error!("WebSocket connection failed: {:?}", e);
                    *connected.write() = false;
                    Self::emit(&listener, TransportEvent::Error(format!("Connection failed: {:?}", e)));
                    return;
                }
            };

            if *closed.read() {
                // Closed while the handshake was in flight; the socket must
                // not outlive the attempt
                info!("WebSocket opened after close; shutting it down");
                let _ = ws_stream.close(None).await;
                return;
            }

            info!("WebSocket connected");

            let (mut writer, mut reader) = ws_stream.split();

            let (write_tx, mut write_rx) = mpsc::channel::<WriteCommand>(100);
            *write_tx_arc.write() = Some(write_tx.clone());

            // Writer task
            let connected_clone = connected.clone();
            tokio::spawn(async move {
                while let Some(cmd) = write_rx.recv().await {
                    let result = match cmd {
                        WriteCommand::SendText(text) => {
                            debug!("Sending frame: {}", text);
                            writer.send(Message::Text(text)).await
                        }
                        WriteCommand::Close => {
                            debug!("Closing connection");
                            let _ = writer.send(Message::Close(None)).await;
                            break;
                        }
                    };

                    if let Err(e) = result {
                        error!("Write error: {:?}", e);
                        *connected_clone.write() = false;
                        break;
                    }
                }
                debug!("Writer task ended");
            });

            // A close that raced the writer installation above settles here
            if *closed.read() {
                let _ = write_tx.send(WriteCommand::Close).await;
                return;
            }

            *connected.write() = true;
            Self::emit(&listener, TransportEvent::Opened);

            // Reader loop runs in this task
            loop {
                match reader.next().await {
                    Some(Ok(message)) => match message {
                        Message::Text(text) => {
                            debug!("Received frame: {}", text);
                            match ProtocolMessage::from_json(&text) {
                                Ok(frame) => {
                                    Self::emit(&listener, TransportEvent::Message(frame));
                                }
                                Err(e) => {
                                    warn!("Dropping unparseable frame: {}", e);
                                }
                            }
                        }
                        Message::Binary(_) => {
                            debug!("Received binary message (ignored)");
                        }
                        Message::Close(frame) => {
                            info!("Received close frame");
                            *connected.write() = false;

                            let (code, reason) = if let Some(cf) = frame {
                                (Some(cf.code.into()), Some(cf.reason.to_string()))
                            } else {
                                (None, None)
                            };

                            Self::emit(&listener, TransportEvent::Closed { code, reason });
                            break;
                        }
                        Message::Ping(_) => {
                            debug!("Received ping");
                        }
                        Message::Pong(_) => {
                            debug!("Received pong");
                        }
                        Message::Frame(_) => {
                            debug!("Received raw frame");
                        }
                    },
                    Some(Err(e)) => {
                        error!("WebSocket receive error: {:?}", e);
                        *connected.write() = false;

                        Self::emit(
                            &listener,
                            TransportEvent::Closed {
                                code: None,
                                reason: Some(format!("Error: {:?}", e)),
                            },
                        );
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended");
                        *connected.write() = false;

                        Self::emit(
                            &listener,
                            TransportEvent::Closed {
                                code: None,
                                reason: Some("Stream ended".to_string()),
                            },
                        );
                        break;
                    }
                }
            }

            debug!("Reader task ended");
        });
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&mut self, url: &str) -> Result<()> {
        if self.is_connected() {
            return Err(MillraceError::invalid_state("Already connected"));
        }
        if *self.closed.read() {
            return Err(MillraceError::invalid_state("Transport already closed"));
        }

        info!("Connecting to WebSocket: {}", url);

        self.spawn_tasks(url.to_string());

        Ok(())
    }

    async fn close(&mut self) {
        // Unconditional: a connect may still be in its handshake, and the
        // spawned task consults this flag before surfacing the socket
        *self.closed.write() = true;

        let tx = self.write_tx.read().as_ref().cloned();
        if let Some(tx) = tx {
            info!("Closing WebSocket");
            let _ = tx.send(WriteCommand::Close).await;
        }

        *self.write_tx.write() = None;
        *self.connected.write() = false;
    }

    async fn send(&self, message: &ProtocolMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(MillraceError::invalid_state("Not connected"));
        }

        let text = message.to_json()?;

        let tx = self.write_tx.read().as_ref().cloned();
        if let Some(tx) = tx {
            tx.send(WriteCommand::SendText(text))
                .await
                .map_err(|e| MillraceError::transport(format!("Send failed: {:?}", e)))?;
            Ok(())
        } else {
            Err(MillraceError::invalid_state("Writer not available"))
        }
    }

    fn is_connected(&self) -> bool {
        *self.connected.read()
    }

    fn set_listener(&mut self, listener: TransportListener) {
        *self.listener.write() = Some(listener);
    }
}

/// Factory producing [`WebSocketTransport`] instances.
#[derive(Debug, Default, Clone)]
pub struct WebSocketFactory;

impl TransportFactory for WebSocketFactory {
    fn create(&self) -> Box<dyn Transport> {
        Box::new(WebSocketTransport::new())
    }
}
