//! Signaling Module - WebSocket Client für den Relay
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Relay:
//! - WebSocket-Verbindung aufbauen und halten
//! - Nachrichten serialisieren und senden
//! - Eingehende Nachrichten parsen und weiterleiten
//!

mod client;
mod messages;
mod retry;

pub use client::{RelaySink, SignalingClient, SignalingError, SignalingEvent};
pub use messages::*;
pub use retry::RetryPolicy;
