//! Message Types für das Signaling-Protokoll
//!
//! Ein JSON-Objekt pro Nachricht, unterschieden über das `type`-Feld.
//! Der Relay leitet Client→Client Nachrichten unverändert weiter und
//! verschickt selbst nur `user-list` Snapshots.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Descriptor type mismatch: expected {expected}, got {found}")]
    DescriptorMismatch { expected: SdpKind, found: SdpKind },

    #[error("Descriptor carries no SDP")]
    EmptyDescriptor,
}

// ============================================================================
// IDENTITIES
// ============================================================================

/// Eindeutige Client-ID, stabil über Reconnects vom selben Gerät
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Gekürzte Form für Logs und Anzeige
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Ein Eintrag im Roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    #[serde(rename = "client_id", alias = "clientId")]
    pub id: PeerId,
    pub name: String,
}

impl Peer {
    pub fn new(id: impl Into<PeerId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

// ============================================================================
// NEGOTIATION PAYLOADS
// ============================================================================

/// Art eines Session-Descriptors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SdpKind::Offer => "offer",
            SdpKind::Pranswer => "pranswer",
            SdpKind::Answer => "answer",
            SdpKind::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

/// Negotiation-Descriptor im Browser-Format `{type, sdp}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Prüft, ob der Descriptor zur Nachricht passt, in der er kam
    pub fn validate(&self, expected: SdpKind) -> Result<(), ProtocolError> {
        if self.kind != expected {
            return Err(ProtocolError::DescriptorMismatch {
                expected,
                found: self.kind,
            });
        }
        if self.sdp.trim().is_empty() {
            return Err(ProtocolError::EmptyDescriptor);
        }
        Ok(())
    }
}

/// Connectivity-Kandidat im Browser-Format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl Candidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

// ============================================================================
// SIGNAL MESSAGES
// ============================================================================

/// Alle Nachrichten, die über den Relay laufen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// Anmeldung beim Relay (Client → Relay)
    Join {
        #[serde(rename = "client_id", alias = "clientId")]
        client_id: PeerId,
        name: String,
    },

    /// Vollständiger Roster-Snapshot (Relay → Client)
    ///
    /// Einträge bleiben roh, damit einzelne defekte Einträge
    /// verworfen werden können statt den ganzen Snapshot.
    UserList { users: Vec<serde_json::Value> },

    /// Anrufwunsch
    Call {
        from: PeerId,
        to: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// Angerufener nimmt an
    CallAccept {
        from: PeerId,
        to: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// Angerufener lehnt ab (oder ist besetzt)
    #[serde(rename = "call-reject", alias = "call-rejected")]
    CallReject {
        from: PeerId,
        to: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// SDP Offer des Initiators
    Offer {
        from: PeerId,
        to: PeerId,
        offer: SessionDescription,
    },

    /// SDP Answer des Responders
    Answer {
        from: PeerId,
        to: PeerId,
        answer: SessionDescription,
    },

    /// ICE Kandidat
    Ice {
        from: PeerId,
        to: PeerId,
        candidate: Candidate,
    },

    /// Anruf beendet
    #[serde(alias = "call-ended")]
    Hangup { from: PeerId, to: PeerId },

    /// Unbekannter Nachrichtentyp
    #[serde(other)]
    Unknown,
}

/// Reason-Wert einer Ablehnung wegen laufendem Anruf
pub const REJECT_BUSY: &str = "busy";

/// Reason-Wert einer Ablehnung, weil das Audiogerät fehlt
pub const REJECT_UNAVAILABLE: &str = "unavailable";

impl SignalMessage {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Absender und Empfänger einer Client→Client Nachricht
    pub fn route(&self) -> Option<(&PeerId, &PeerId)> {
        match self {
            SignalMessage::Call { from, to, .. }
            | SignalMessage::CallAccept { from, to, .. }
            | SignalMessage::CallReject { from, to, .. }
            | SignalMessage::Offer { from, to, .. }
            | SignalMessage::Answer { from, to, .. }
            | SignalMessage::Ice { from, to, .. }
            | SignalMessage::Hangup { from, to } => Some((from, to)),
            SignalMessage::Join { .. } | SignalMessage::UserList { .. } | SignalMessage::Unknown => {
                None
            }
        }
    }

    /// Empfänger (falls Client→Client)
    pub fn recipient(&self) -> Option<&PeerId> {
        self.route().map(|(_, to)| to)
    }

    /// Typname für Logs
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Join { .. } => "join",
            SignalMessage::UserList { .. } => "user-list",
            SignalMessage::Call { .. } => "call",
            SignalMessage::CallAccept { .. } => "call-accept",
            SignalMessage::CallReject { .. } => "call-reject",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Ice { .. } => "ice",
            SignalMessage::Hangup { .. } => "hangup",
            SignalMessage::Unknown => "unknown",
        }
    }
}
