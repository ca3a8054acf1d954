//! WebSocket Client für den Signaling-Relay
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - `join` direkt nach dem Verbindungsaufbau
//! - Keep-Alive per Ping
//! - geordnete Zustellung eingehender Nachrichten über einen mpsc-Kanal
//! - genau ein `Disconnected` pro Verbindung

use super::messages::SignalMessage;
use crate::identity::LocalIdentity;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Intervall für WebSocket-Pings
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// Kapazität der ausgehenden Warteschlange
const OUTGOING_CAPACITY: usize = 100;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling relay")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),
}

// ============================================================================
// RELAY BOUNDARY
// ============================================================================

/// Sendeseite des Relays, so wie der Negotiator sie sieht
///
/// Fire-and-forget: ein `Ok` heißt nur, dass die Nachricht
/// zum Versand angenommen wurde.
pub trait RelaySink: Send + Sync {
    fn send(&self, message: &SignalMessage) -> Result<(), SignalingError>;
}

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Nachricht vom Relay, in Empfangsreihenfolge
    Message(SignalMessage),

    /// Verbindung getrennt (höchstens einmal pro Verbindung)
    Disconnected,
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für die Relay-Kommunikation
pub struct SignalingClient {
    server_url: String,
    state: Arc<RwLock<ClientState>>,
    tx: mpsc::Sender<String>,
}

impl SignalingClient {
    /// Verbindet mit dem Relay und meldet den Client an
    ///
    /// Gibt den Client und den Empfänger für eingehende Events zurück.
    pub async fn connect(
        server_url: &str,
        identity: &LocalIdentity,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>), SignalingError> {
        let ws_url = websocket_url(server_url);
        tracing::info!("Connecting to signaling relay: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(OUTGOING_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(ClientState { is_connected: true }));

        // Read-Task
        let state_clone = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match SignalMessage::from_json(&text) {
                        Ok(message) => {
                            tracing::debug!("Relay message: {}", message.kind());
                            if event_tx.send(SignalingEvent::Message(message)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Dropping undecodable relay message: {}", e);
                        }
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state_clone.write().is_connected = false;
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        // Write-Task, inklusive Keep-Alive
        let state_clone = Arc::clone(&state);
        tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.tick().await;
            loop {
                let frame = tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(text) => Message::Text(text),
                        None => break,
                    },
                    _ = keepalive.tick() => Message::Ping(Vec::new()),
                };
                if let Err(e) = write.send(frame).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            state_clone.write().is_connected = false;
            let _ = write.close().await;
        });

        let client = Self {
            server_url: ws_url,
            state,
            tx,
        };

        client.send(&SignalMessage::Join {
            client_id: identity.id.clone(),
            name: identity.name.clone(),
        })?;

        tracing::info!("Joined relay as {} ({})", identity.name, identity.id.short());
        Ok((client, event_rx))
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }
}

impl RelaySink for SignalingClient {
    fn send(&self, message: &SignalMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        let text = message
            .to_json()
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        // try_send blockiert nicht
        self.tx
            .try_send(text)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url)
            .field("state", &*self.state.read())
            .finish()
    }
}

/// Leitet die WebSocket-URL aus der konfigurierten Relay-URL ab
fn websocket_url(server_url: &str) -> String {
    if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        server_url.to_string()
    }
}
