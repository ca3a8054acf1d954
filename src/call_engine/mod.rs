//! Call Engine Module - Verhandlung und Media
//!
//! Dieses Modul verwaltet:
//! - die Zustandsmaschine einer CallSession (Negotiator)
//! - wartende Connectivity-Kandidaten
//! - die Grenze zur Media-Engine und deren WebRTC-Implementierung

mod candidates;
mod engine;
mod media;
mod rtc;
mod session;

pub use candidates::CandidateQueue;
pub use engine::{Action, CallEngine, EngineConfig};
pub use media::{AudioDirection, MediaEngine, MediaError, MediaEvent, MediaEventSink, MediaSession};
pub use rtc::{default_stun_servers, rms_level, RtcMediaEngine, RtcMediaSession, SAMPLE_RATE};
pub use session::{CallError, CallEvent, CallState, CallStatus, EndReason, Role, SessionId};
