//! Call Session Typen
//!
//! Ein einziger getaggter Zustand statt verstreuter Flags: jede Variante
//! trägt genau die Felder, die in diesem Zustand gültig sind.

use super::candidates::CandidateQueue;
use super::media::{AudioDirection, MediaSession};
use crate::signaling::{Peer, SignalingError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum CallError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No incoming call")]
    NoIncomingCall,

    #[error("Cannot call yourself")]
    CallingSelf,

    #[error("Not connected to signaling relay")]
    NotConnected,

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Call engine is not running")]
    EngineStopped,
}

// ============================================================================
// PUBLIC STATE
// ============================================================================

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Kein aktiver Anruf
    Idle,
    /// Ausgehender Anruf wartet auf Annahme
    Outgoing,
    /// Eingehender Anruf wartet auf Antwort
    IncomingPending,
    /// Descriptoren werden ausgetauscht
    Negotiating,
    /// Anruf aktiv
    Active,
    /// Anruf beendet, geht sofort zurück auf Idle
    Ended,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "idle",
            CallState::Outgoing => "outgoing",
            CallState::IncomingPending => "incoming",
            CallState::Negotiating => "negotiating",
            CallState::Active => "active",
            CallState::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Wer das Offer erzeugt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

/// Warum ein Anruf endete
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    /// Eingehender Anruf lokal abgelehnt
    Declined,
    /// Gegenseite hat abgelehnt
    Rejected,
    /// Gegenseite telefoniert bereits
    Busy,
    DeviceUnavailable(String),
    NegotiationFailed(String),
    MediaFailed(String),
    TimedOut,
    RelayLost,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::LocalHangup => f.write_str("hung up"),
            EndReason::RemoteHangup => f.write_str("remote hung up"),
            EndReason::Declined => f.write_str("declined"),
            EndReason::Rejected => f.write_str("rejected by remote"),
            EndReason::Busy => f.write_str("remote is busy"),
            EndReason::DeviceUnavailable(e) => write!(f, "device unavailable: {}", e),
            EndReason::NegotiationFailed(e) => write!(f, "negotiation failed: {}", e),
            EndReason::MediaFailed(e) => write!(f, "media failed: {}", e),
            EndReason::TimedOut => f.write_str("negotiation timed out"),
            EndReason::RelayLost => f.write_str("relay connection lost"),
        }
    }
}

/// Events an die UI- bzw. Service-Schicht
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    RosterChanged(Vec<Peer>),
    IncomingCall(Peer),
    StateChanged {
        state: CallState,
        peer_name: Option<String>,
    },
    Ended {
        peer: Peer,
        reason: EndReason,
    },
    AudioLevel {
        direction: AudioDirection,
        level: f32,
    },
}

/// Momentaufnahme für die UI
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallStatus {
    pub state: CallState,
    pub peer: Option<Peer>,
    pub role: Option<Role>,
    pub since: DateTime<Utc>,
}

impl Default for CallStatus {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            peer: None,
            role: None,
            since: Utc::now(),
        }
    }
}

// ============================================================================
// INTERNAL SESSION
// ============================================================================

/// Fortlaufende Nummer pro Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) enum Session {
    Idle,
    Outgoing(Pending),
    IncomingPending(Pending),
    Negotiating(Negotiation),
    Active(Negotiation),
}

/// Session vor dem Erwerb des Media-Handles
pub(crate) struct Pending {
    pub id: SessionId,
    pub peer: Peer,
}

/// Session mit Media-Handle
pub(crate) struct Negotiation {
    pub id: SessionId,
    pub peer: Peer,
    pub role: Role,
    pub media: Box<dyn MediaSession>,
    pub local_sent: bool,
    pub remote_applied: bool,
    pub candidates: CandidateQueue,
    pub timeout: Option<JoinHandle<()>>,
}

impl Negotiation {
    pub fn new(pending: Pending, role: Role, media: Box<dyn MediaSession>) -> Self {
        Self {
            id: pending.id,
            peer: pending.peer,
            role,
            media,
            local_sent: false,
            remote_applied: false,
            candidates: CandidateQueue::new(),
            timeout: None,
        }
    }

    pub fn disarm_timeout(&mut self) {
        if let Some(timer) = self.timeout.take() {
            timer.abort();
        }
    }

    /// Löst die Session auf; wartende Kandidaten werden verworfen
    pub fn release(mut self) -> (Peer, Box<dyn MediaSession>) {
        self.disarm_timeout();
        let dropped = self.candidates.clear();
        if dropped > 0 {
            tracing::debug!("Discarding {} unapplied candidates", dropped);
        }
        (self.peer, self.media)
    }
}

impl Session {
    pub fn state(&self) -> CallState {
        match self {
            Session::Idle => CallState::Idle,
            Session::Outgoing(_) => CallState::Outgoing,
            Session::IncomingPending(_) => CallState::IncomingPending,
            Session::Negotiating(_) => CallState::Negotiating,
            Session::Active(_) => CallState::Active,
        }
    }

    pub fn id(&self) -> Option<SessionId> {
        match self {
            Session::Idle => None,
            Session::Outgoing(p) | Session::IncomingPending(p) => Some(p.id),
            Session::Negotiating(n) | Session::Active(n) => Some(n.id),
        }
    }

    pub fn peer(&self) -> Option<&Peer> {
        match self {
            Session::Idle => None,
            Session::Outgoing(p) | Session::IncomingPending(p) => Some(&p.peer),
            Session::Negotiating(n) | Session::Active(n) => Some(&n.peer),
        }
    }

    pub fn role(&self) -> Option<Role> {
        match self {
            Session::Negotiating(n) | Session::Active(n) => Some(n.role),
            _ => None,
        }
    }

    pub fn is_with(&self, peer_id: &crate::signaling::PeerId) -> bool {
        self.peer().is_some_and(|p| &p.id == peer_id)
    }
}
