//! Media Boundary
//!
//! Abstrakte Steuerfläche in die Media-Engine. Der Negotiator erzeugt
//! und verbraucht darüber Descriptoren und Kandidaten; Encoding und
//! Transport der Audiodaten bleiben vollständig in der Engine.

use super::engine::EngineEvent;
use super::session::SessionId;
use crate::signaling::{Candidate, SessionDescription};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Media engine error: {0}")]
    Engine(String),

    #[error("Media engine did not respond in time")]
    TimedOut,
}

// ============================================================================
// MEDIA EVENTS
// ============================================================================

/// Richtung eines Pegelwerts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioDirection {
    Local,
    Remote,
}

/// Rückmeldungen der Media-Engine
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// Lokal entdeckter Kandidat, geht an den Peer
    LocalCandidate(Candidate),

    /// Pegel 0.0..=100.0, wird nur durchgereicht
    AudioLevel { direction: AudioDirection, level: f32 },

    /// Fataler Fehler, beendet die Session
    Failed(String),
}

/// Rückkanal einer Media-Session in die Event-Queue des Negotiators
///
/// Events tragen die Session-ID, damit Nachzügler einer bereits
/// beendeten Session verworfen werden.
#[derive(Debug, Clone)]
pub struct MediaEventSink {
    session: SessionId,
    queue: mpsc::WeakUnboundedSender<EngineEvent>,
}

impl MediaEventSink {
    pub(crate) fn new(session: SessionId, queue: mpsc::WeakUnboundedSender<EngineEvent>) -> Self {
        Self { session, queue }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Reiht ein Event ein; `false` wenn die Engine nicht mehr läuft
    pub fn emit(&self, event: MediaEvent) -> bool {
        match self.queue.upgrade() {
            Some(queue) => queue
                .send(EngineEvent::Media {
                    session: self.session,
                    event,
                })
                .is_ok(),
            None => false,
        }
    }
}

// ============================================================================
// MEDIA TRAITS
// ============================================================================

/// Fabrik für Media-Sessions
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Erwirbt das Audiogerät und öffnet eine neue Session
    async fn open(&self, events: MediaEventSink) -> Result<Box<dyn MediaSession>, MediaError>;
}

/// Eine geöffnete Media-Session, exklusiv im Besitz einer CallSession
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Erzeugt das Offer und setzt es als lokale Description
    async fn create_offer(&mut self) -> Result<SessionDescription, MediaError>;

    /// Erzeugt das Answer und setzt es als lokale Description
    async fn create_answer(&mut self) -> Result<SessionDescription, MediaError>;

    async fn apply_remote(&mut self, description: SessionDescription) -> Result<(), MediaError>;

    async fn add_candidate(&mut self, candidate: Candidate) -> Result<(), MediaError>;

    /// Gibt Gerät und Verbindung frei
    async fn close(&mut self);
}
