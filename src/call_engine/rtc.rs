//! WebRTC Media Engine
//!
//! Implementiert die Media-Traits mit `webrtc`: eine Peer Connection pro
//! Session mit Standard-Codecs, Interceptors und einem Opus Audio-Track.
//!
//! Der Pegel der Gegenseite kommt aus der RTP Header-Extension
//! `ssrc-audio-level` (RFC 6464), die Browser bei jedem Audio-Paket mitsenden.

use super::media::{
    AudioDirection, MediaEngine, MediaError, MediaEvent, MediaEventSink, MediaSession,
};
use crate::signaling::{Candidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as CodecRegistry;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpHeaderExtensionCapability, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Sample Rate für Opus
pub const SAMPLE_RATE: u32 = 48000;

/// RTP Header-Extension mit dem Pegel jedes Audio-Pakets
pub const AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";

/// Mindestabstand zwischen zwei Pegel-Events
const LEVEL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// AUDIO LEVELS
// ============================================================================

/// Skaliert eine Amplitude (0.0..=1.0) auf 0..=100
fn scale_level(amplitude: f32) -> f32 {
    (amplitude * 200.0).clamp(0.0, 100.0)
}

/// Pegel eines PCM-Blocks (RMS), für Capture-Komponenten
pub fn rms_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let rms = (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt();
    scale_level(rms)
}

/// Pegel aus der `ssrc-audio-level` Extension (-dBov in den unteren 7 Bit)
fn level_from_extension(payload: &[u8]) -> Option<f32> {
    let dbov = payload.first()? & 0x7f;
    if dbov == 127 {
        return Some(0.0);
    }
    let amplitude = 10f32.powf(-(dbov as f32) / 20.0);
    Some(scale_level(amplitude))
}

/// Liest den Remote-Track und meldet den Pegel, bis der Track endet
async fn meter_remote_audio(track: Arc<TrackRemote>, extension_id: u8, events: MediaEventSink) {
    let mut last_emit: Option<Instant> = None;
    loop {
        let packet = match track.read_rtp().await {
            Ok((packet, _)) => packet,
            Err(e) => {
                tracing::debug!("Remote audio track ended: {}", e);
                break;
            }
        };
        let Some(level) = packet
            .header
            .get_extension(extension_id)
            .and_then(|payload| level_from_extension(&payload))
        else {
            continue;
        };
        if last_emit.is_some_and(|t| t.elapsed() < LEVEL_INTERVAL) {
            continue;
        }
        last_emit = Some(Instant::now());
        let event = MediaEvent::AudioLevel {
            direction: AudioDirection::Remote,
            level,
        };
        if !events.emit(event) {
            break;
        }
    }
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN Server
pub fn default_stun_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

fn ice_servers(urls: &[String]) -> Vec<RTCIceServer> {
    if urls.is_empty() {
        return Vec::new();
    }
    vec![RTCIceServer {
        urls: urls.to_vec(),
        ..Default::default()
    }]
}

fn engine_error(e: webrtc::Error) -> MediaError {
    MediaError::Engine(e.to_string())
}

// ============================================================================
// MEDIA ENGINE
// ============================================================================

/// Öffnet WebRTC Peer Connections
#[derive(Debug, Clone)]
pub struct RtcMediaEngine {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcMediaEngine {
    pub fn new(stun_urls: &[String]) -> Self {
        Self {
            ice_servers: ice_servers(stun_urls),
        }
    }

    /// Fügt einen TURN-Server hinzu
    pub fn with_turn_server(mut self, url: String, username: String, credential: String) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls: vec![url],
            username,
            credential,
            ..Default::default()
        });
        self
    }

    pub fn ice_server_count(&self) -> usize {
        self.ice_servers.len()
    }

    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, MediaError> {
        let mut codecs = CodecRegistry::default();
        codecs.register_default_codecs().map_err(engine_error)?;
        codecs
            .register_header_extension(
                RTCRtpHeaderExtensionCapability {
                    uri: AUDIO_LEVEL_URI.to_string(),
                },
                RTPCodecType::Audio,
                None,
            )
            .map_err(engine_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut codecs).map_err(engine_error)?;

        let api = APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(config).await.map_err(engine_error)?;
        Ok(Arc::new(pc))
    }
}

impl Default for RtcMediaEngine {
    fn default() -> Self {
        Self::new(&default_stun_servers())
    }
}

#[async_trait]
impl MediaEngine for RtcMediaEngine {
    async fn open(&self, events: MediaEventSink) -> Result<Box<dyn MediaSession>, MediaError> {
        let pc = self.create_peer_connection().await?;
        register_handlers(&pc, events.clone());

        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_string(),
            "peercall".to_string(),
        ));

        if let Err(e) = pc
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
        {
            let _ = pc.close().await;
            return Err(MediaError::DeviceUnavailable(e.to_string()));
        }

        tracing::debug!("Opened peer connection for session {}", events.session());
        Ok(Box::new(RtcMediaSession { pc, closed: false }))
    }
}

/// Leitet Callbacks der Peer Connection in die Event-Queue
fn register_handlers(pc: &RTCPeerConnection, events: MediaEventSink) {
    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);
        match s {
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                sink.emit(MediaEvent::Failed(format!("peer connection {}", s)));
            }
            _ => {}
        }
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => {
                    sink.emit(MediaEvent::LocalCandidate(Candidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let sink = events;
    pc.on_track(Box::new(move |track, receiver, _| {
        let sink = sink.clone();
        Box::pin(async move {
            tracing::info!("Received track: {:?}", track.codec());
            let params = receiver.get_parameters().await;
            let extension = params
                .header_extensions
                .iter()
                .find(|e| e.uri == AUDIO_LEVEL_URI)
                .and_then(|e| u8::try_from(e.id).ok());
            match extension {
                Some(id) => {
                    tokio::spawn(meter_remote_audio(track, id, sink));
                }
                None => tracing::debug!("Remote track carries no audio level extension"),
            }
        })
    }));
}

// ============================================================================
// MEDIA SESSION
// ============================================================================

/// Eine Peer Connection mit lokalem Audio-Track
pub struct RtcMediaSession {
    pc: Arc<RTCPeerConnection>,
    closed: bool,
}

#[async_trait]
impl MediaSession for RtcMediaSession {
    async fn create_offer(&mut self) -> Result<SessionDescription, MediaError> {
        let offer = self.pc.create_offer(None).await.map_err(engine_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(engine_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, MediaError> {
        let answer = self.pc.create_answer(None).await.map_err(engine_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(engine_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn apply_remote(&mut self, description: SessionDescription) -> Result<(), MediaError> {
        let remote = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
            other => {
                return Err(MediaError::InvalidDescription(format!(
                    "unsupported description type {}",
                    other
                )))
            }
        }
        .map_err(|e| MediaError::InvalidDescription(e.to_string()))?;

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| MediaError::InvalidDescription(e.to_string()))
    }

    async fn add_candidate(&mut self, candidate: Candidate) -> Result<(), MediaError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(engine_error)
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::engine::EngineEvent;
    use crate::call_engine::session::SessionId;
    use tokio::sync::mpsc;

    async fn open_session(
        engine: &RtcMediaEngine,
        id: u64,
        queue: &mpsc::UnboundedSender<EngineEvent>,
    ) -> Box<dyn MediaSession> {
        let sink = MediaEventSink::new(SessionId(id), queue.downgrade());
        engine.open(sink).await.unwrap()
    }

    #[tokio::test]
    async fn test_offer_contains_audio() {
        let engine = RtcMediaEngine::new(&[]);
        let (queue, _events) = mpsc::unbounded_channel();
        let mut session = open_session(&engine, 1, &queue).await;

        let offer = session.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains(AUDIO_LEVEL_URI));
        session.close().await;
    }

    #[tokio::test]
    async fn test_offer_answer_exchange() {
        let engine = RtcMediaEngine::new(&[]);
        let (queue, _events) = mpsc::unbounded_channel();
        let mut caller = open_session(&engine, 1, &queue).await;
        let mut callee = open_session(&engine, 2, &queue).await;

        let offer = caller.create_offer().await.unwrap();
        callee.apply_remote(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        assert!(answer.sdp.contains("m=audio"));
        caller.apply_remote(answer).await.unwrap();

        caller.close().await;
        callee.close().await;
        // Zweites close ist ein No-op
        caller.close().await;
    }

    #[tokio::test]
    async fn test_rollback_is_rejected() {
        let engine = RtcMediaEngine::new(&[]);
        let (queue, _events) = mpsc::unbounded_channel();
        let mut session = open_session(&engine, 1, &queue).await;

        let rollback = SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        };
        assert!(matches!(
            session.apply_remote(rollback).await,
            Err(MediaError::InvalidDescription(_))
        ));
        session.close().await;
    }

    #[test]
    fn test_levels() {
        assert_eq!(rms_level(&[]), 0.0);
        assert_eq!(rms_level(&[0.0; 480]), 0.0);
        assert_eq!(rms_level(&[1.0, -1.0, 1.0, -1.0]), 100.0);
        assert!((rms_level(&[0.1, -0.1, 0.1, -0.1]) - 20.0).abs() < 0.01);

        assert_eq!(level_from_extension(&[]), None);
        assert_eq!(level_from_extension(&[0x00]), Some(100.0));
        assert_eq!(level_from_extension(&[127]), Some(0.0));
        // Voice-Activity-Bit wird ignoriert
        let level = level_from_extension(&[0x80 | 20]).unwrap();
        assert!((level - 20.0).abs() < 0.01);
    }

    #[test]
    fn test_ice_servers() {
        assert!(ice_servers(&[]).is_empty());
        let servers = ice_servers(&default_stun_servers());
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls.len(), 2);

        let engine = RtcMediaEngine::default().with_turn_server(
            "turn:turn.example:3478".to_string(),
            "user".to_string(),
            "secret".to_string(),
        );
        assert_eq!(engine.ice_server_count(), 2);
    }
}
