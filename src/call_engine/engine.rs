//! Call Engine
//!
//! Verhandelt Peer-to-Peer Audio-Sessions über den Signaling-Relay.
//!
//! Alle Eingaben (Relay-Nachrichten, lokale Aktionen, Media-Callbacks,
//! Timer) landen als `EngineEvent` in einer einzigen Queue und werden
//! nacheinander vom `Negotiator` verarbeitet. Asynchrone Media-Schritte
//! werden innerhalb der Verarbeitung abgewartet, ein später eintreffendes
//! Event (z. B. Hangup) greift also erst nach dem laufenden Schritt.

use super::media::{MediaEngine, MediaError, MediaEvent, MediaEventSink, MediaSession};
use super::session::{
    CallError, CallEvent, CallState, CallStatus, EndReason, Negotiation, Pending, Role, Session,
    SessionId,
};
use crate::identity::LocalIdentity;
use crate::roster::RosterTracker;
use crate::signaling::{
    Candidate, Peer, PeerId, RelaySink, SdpKind, SessionDescription, SignalMessage, REJECT_BUSY,
    REJECT_UNAVAILABLE,
};
use chrono::Utc;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Kapazität des Event-Broadcasts an die UI
const EVENT_CAPACITY: usize = 100;

/// Name für Peers, die weder Roster noch Nachricht benennen
const UNKNOWN_PEER_NAME: &str = "Unknown";

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Obergrenze für den Zustand Negotiating und für jeden Media-Schritt
    pub negotiation_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Lokale Aktionen der UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Call(PeerId),
    Accept,
    Reject,
    Hangup,
}

/// Ein Eintrag der seriellen Event-Queue
pub(crate) enum EngineEvent {
    Action {
        action: Action,
        reply: Option<oneshot::Sender<Result<(), CallError>>>,
    },
    RelayAttached(Arc<dyn RelaySink>),
    Relay(SignalMessage),
    RelayLost,
    Media {
        session: SessionId,
        event: MediaEvent,
    },
    NegotiationTimeout(SessionId),
}

impl std::fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::Action { action, .. } => f.debug_tuple("Action").field(action).finish(),
            EngineEvent::RelayAttached(_) => f.write_str("RelayAttached"),
            EngineEvent::Relay(msg) => f.debug_tuple("Relay").field(&msg.kind()).finish(),
            EngineEvent::RelayLost => f.write_str("RelayLost"),
            EngineEvent::Media { session, event } => f
                .debug_struct("Media")
                .field("session", session)
                .field("event", event)
                .finish(),
            EngineEvent::NegotiationTimeout(id) => {
                f.debug_tuple("NegotiationTimeout").field(id).finish()
            }
        }
    }
}

/// Wie die Gegenseite beim Beenden informiert wird
#[derive(Debug, Clone, Copy)]
enum Notify {
    Nothing,
    Hangup,
    Reject(Option<&'static str>),
}

/// Von Engine und Handles geteilte Momentaufnahmen
#[derive(Debug, Default)]
struct Shared {
    status: RwLock<CallStatus>,
    roster: RwLock<Vec<Peer>>,
}

// ============================================================================
// NEGOTIATOR
// ============================================================================

/// Zustandsmaschine einer CallSession
///
/// Besitzt die einzige Session und deren Media-Handle exklusiv.
pub(crate) struct Negotiator {
    local: LocalIdentity,
    config: EngineConfig,
    media_engine: Arc<dyn MediaEngine>,
    relay: Option<Arc<dyn RelaySink>>,
    roster: RosterTracker,
    session: Session,
    next_session: u64,
    queue: mpsc::WeakUnboundedSender<EngineEvent>,
    events: broadcast::Sender<CallEvent>,
    shared: Arc<Shared>,
}

impl Negotiator {
    fn new(
        local: LocalIdentity,
        media_engine: Arc<dyn MediaEngine>,
        config: EngineConfig,
        queue: mpsc::WeakUnboundedSender<EngineEvent>,
        events: broadcast::Sender<CallEvent>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            roster: RosterTracker::new(local.id.clone()),
            local,
            config,
            media_engine,
            relay: None,
            session: Session::Idle,
            next_session: 0,
            queue,
            events,
            shared,
        }
    }

    /// Einzige Übergangsfunktion
    pub(crate) async fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Action { action, reply } => {
                let result = self.handle_action(action).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            EngineEvent::RelayAttached(relay) => {
                tracing::info!("Relay attached");
                self.relay = Some(relay);
            }
            EngineEvent::Relay(message) => self.handle_message(message).await,
            EngineEvent::RelayLost => {
                tracing::info!("Relay connection lost");
                self.relay = None;
                self.end_session(EndReason::RelayLost, Notify::Nothing).await;
            }
            EngineEvent::Media { session, event } => self.handle_media_event(session, event).await,
            EngineEvent::NegotiationTimeout(id) => {
                if matches!(&self.session, Session::Negotiating(n) if n.id == id) {
                    tracing::warn!("Negotiation {} timed out", id);
                    self.end_session(EndReason::TimedOut, Notify::Hangup).await;
                }
            }
        }
    }

    /// Beendet einen laufenden Anruf beim Herunterfahren
    pub(crate) async fn shutdown(&mut self) {
        self.end_session(EndReason::LocalHangup, Notify::Hangup).await;
    }

    // ========================================================================
    // LOCAL ACTIONS
    // ========================================================================

    async fn handle_action(&mut self, action: Action) -> Result<(), CallError> {
        match action {
            Action::Call(peer_id) => self.start_call(peer_id),
            Action::Accept => {
                if !matches!(self.session, Session::IncomingPending(_)) {
                    return Err(CallError::NoIncomingCall);
                }
                if let Session::IncomingPending(pending) = self.take_session() {
                    tracing::info!("Accepting call from {}", pending.peer.name);
                    self.start_negotiation(pending, Role::Responder).await;
                }
                Ok(())
            }
            Action::Reject => {
                if !matches!(self.session, Session::IncomingPending(_)) {
                    return Err(CallError::NoIncomingCall);
                }
                self.end_session(EndReason::Declined, Notify::Reject(None))
                    .await;
                Ok(())
            }
            Action::Hangup => {
                // Idempotent: im Idle passiert nichts
                self.end_session(EndReason::LocalHangup, Notify::Hangup).await;
                Ok(())
            }
        }
    }

    fn start_call(&mut self, peer_id: PeerId) -> Result<(), CallError> {
        if peer_id == self.local.id {
            return Err(CallError::CallingSelf);
        }
        if !matches!(self.session, Session::Idle) {
            return Err(CallError::AlreadyInCall);
        }
        let relay = self.relay.clone().ok_or(CallError::NotConnected)?;

        relay.send(&SignalMessage::Call {
            from: self.local.id.clone(),
            to: peer_id.clone(),
            name: Some(self.local.name.clone()),
        })?;

        let name = self
            .roster
            .display_name(&peer_id)
            .unwrap_or(UNKNOWN_PEER_NAME)
            .to_string();
        tracing::info!("Calling {} ({})", name, peer_id.short());

        let id = self.next_session_id();
        self.session = Session::Outgoing(Pending {
            id,
            peer: Peer::new(peer_id, name),
        });
        self.publish_state();
        Ok(())
    }

    // ========================================================================
    // RELAY MESSAGES
    // ========================================================================

    async fn handle_message(&mut self, message: SignalMessage) {
        if let SignalMessage::UserList { users } = message {
            let peers = self.roster.apply_snapshot(users);
            *self.shared.roster.write() = peers.clone();
            self.emit(CallEvent::RosterChanged(peers));
            return;
        }

        let Some((from, to)) = message.route() else {
            tracing::debug!("Ignoring {} message", message.kind());
            return;
        };
        if to != &self.local.id {
            tracing::warn!("Dropping {} addressed to {}", message.kind(), to.short());
            return;
        }
        if from == &self.local.id {
            tracing::warn!("Dropping {} sent from our own id", message.kind());
            return;
        }

        match message {
            SignalMessage::Call { from, name, .. } => self.on_call_intent(from, name).await,
            SignalMessage::CallAccept { from, name, .. } => self.on_call_accept(from, name).await,
            SignalMessage::CallReject { from, reason, .. } => {
                self.on_call_reject(from, reason).await
            }
            SignalMessage::Offer { from, offer, .. } => self.on_offer(from, offer).await,
            SignalMessage::Answer { from, answer, .. } => self.on_answer(from, answer).await,
            SignalMessage::Ice {
                from, candidate, ..
            } => self.on_candidate(from, candidate).await,
            SignalMessage::Hangup { from, .. } => self.on_remote_hangup(from).await,
            SignalMessage::Join { .. } | SignalMessage::UserList { .. } | SignalMessage::Unknown => {}
        }
    }

    async fn on_call_intent(&mut self, from: PeerId, name: Option<String>) {
        match &self.session {
            Session::Idle => {
                let name = name
                    .filter(|n| !n.trim().is_empty())
                    .or_else(|| self.roster.display_name(&from).map(str::to_string))
                    .unwrap_or_else(|| UNKNOWN_PEER_NAME.to_string());
                let peer = Peer::new(from, name);
                tracing::info!("Incoming call from {} ({})", peer.name, peer.id.short());

                let id = self.next_session_id();
                self.session = Session::IncomingPending(Pending {
                    id,
                    peer: peer.clone(),
                });
                self.publish_state();
                self.emit(CallEvent::IncomingCall(peer));
            }
            Session::Outgoing(pending) if pending.peer.id == from => {
                // Glare: die kleinere ID wird Initiator
                let role = if self.local.id < from {
                    Role::Initiator
                } else {
                    Role::Responder
                };
                tracing::info!(
                    "Simultaneous call with {}, resolving as {:?}",
                    from.short(),
                    role
                );
                if let Session::Outgoing(mut pending) = self.take_session() {
                    if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
                        pending.peer.name = name;
                    }
                    self.start_negotiation(pending, role).await;
                }
            }
            session if session.is_with(&from) => {
                tracing::debug!("Ignoring repeated call intent from {}", from.short());
            }
            _ => {
                tracing::info!("Rejecting call from {}: busy", from.short());
                self.send(SignalMessage::CallReject {
                    from: self.local.id.clone(),
                    to: from,
                    reason: Some(REJECT_BUSY.to_string()),
                });
            }
        }
    }

    async fn on_call_accept(&mut self, from: PeerId, name: Option<String>) {
        match &self.session {
            Session::Outgoing(pending) if pending.peer.id == from => {
                if let Session::Outgoing(mut pending) = self.take_session() {
                    if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
                        pending.peer.name = name;
                    }
                    tracing::info!("Call accepted by {}", pending.peer.name);
                    self.start_negotiation(pending, Role::Initiator).await;
                }
            }
            Session::Negotiating(_) | Session::Active(_) if self.session.is_with(&from) => {
                tracing::debug!("Ignoring duplicate call-accept from {}", from.short());
            }
            _ => {
                tracing::warn!(
                    "Dropping call-accept from {} in state {}",
                    from.short(),
                    self.session.state()
                );
            }
        }
    }

    async fn on_call_reject(&mut self, from: PeerId, reason: Option<String>) {
        match &self.session {
            Session::Outgoing(pending) if pending.peer.id == from => {
                self.end_session(reject_reason(reason), Notify::Nothing).await;
            }
            // Nach Glare kann der Responder noch ablehnen, solange kein Answer kam
            Session::Negotiating(n)
                if n.peer.id == from && n.role == Role::Initiator && !n.remote_applied =>
            {
                self.end_session(reject_reason(reason), Notify::Nothing).await;
            }
            _ => {
                tracing::warn!(
                    "Dropping call-reject from {} in state {}",
                    from.short(),
                    self.session.state()
                );
            }
        }
    }

    async fn on_offer(&mut self, from: PeerId, offer: SessionDescription) {
        match &self.session {
            Session::Negotiating(n) if n.peer.id == from => {}
            Session::Active(n) if n.peer.id == from => {
                tracing::debug!("Ignoring duplicate offer from {}", from.short());
                return;
            }
            _ => {
                tracing::warn!(
                    "Dropping offer from {} in state {}",
                    from.short(),
                    self.session.state()
                );
                return;
            }
        }
        let Session::Negotiating(mut n) = self.take_session() else {
            return;
        };

        if n.role == Role::Initiator {
            tracing::warn!("Initiator received an offer from {}, dropping", from.short());
            self.session = Session::Negotiating(n);
            return;
        }
        if n.remote_applied {
            tracing::debug!("Ignoring duplicate offer from {}", from.short());
            self.session = Session::Negotiating(n);
            return;
        }

        if let Err(e) = offer.validate(SdpKind::Offer) {
            self.fail(n, EndReason::NegotiationFailed(e.to_string())).await;
            return;
        }
        let deadline = self.config.negotiation_timeout;
        let applied = with_deadline(deadline, n.media.apply_remote(offer)).await;
        if let Err(e) = applied {
            self.fail(n, EndReason::NegotiationFailed(e.to_string())).await;
            return;
        }
        n.remote_applied = true;
        n.candidates.mark_ready();
        n.candidates.drain_if_ready(n.media.as_mut()).await;

        let created = with_deadline(deadline, n.media.create_answer()).await;
        let answer = match created {
            Ok(answer) => answer,
            Err(e) => {
                self.fail(n, EndReason::NegotiationFailed(e.to_string())).await;
                return;
            }
        };
        self.send(SignalMessage::Answer {
            from: self.local.id.clone(),
            to: n.peer.id.clone(),
            answer,
        });
        n.local_sent = true;
        self.activate(n);
    }

    async fn on_answer(&mut self, from: PeerId, answer: SessionDescription) {
        match &self.session {
            Session::Negotiating(n) if n.peer.id == from => {}
            Session::Active(n) if n.peer.id == from => {
                tracing::debug!("Ignoring duplicate answer from {}", from.short());
                return;
            }
            _ => {
                tracing::warn!(
                    "Dropping answer from {} in state {}",
                    from.short(),
                    self.session.state()
                );
                return;
            }
        }
        let Session::Negotiating(mut n) = self.take_session() else {
            return;
        };

        if n.role == Role::Responder || !n.local_sent {
            tracing::warn!("Unexpected answer from {}, dropping", from.short());
            self.session = Session::Negotiating(n);
            return;
        }
        if n.remote_applied {
            tracing::debug!("Ignoring duplicate answer from {}", from.short());
            self.session = Session::Negotiating(n);
            return;
        }

        if let Err(e) = answer.validate(SdpKind::Answer) {
            self.fail(n, EndReason::NegotiationFailed(e.to_string())).await;
            return;
        }
        let deadline = self.config.negotiation_timeout;
        let applied = with_deadline(deadline, n.media.apply_remote(answer)).await;
        if let Err(e) = applied {
            self.fail(n, EndReason::NegotiationFailed(e.to_string())).await;
            return;
        }
        n.remote_applied = true;
        n.candidates.mark_ready();
        n.candidates.drain_if_ready(n.media.as_mut()).await;
        self.activate(n);
    }

    async fn on_candidate(&mut self, from: PeerId, candidate: Candidate) {
        match &mut self.session {
            Session::Negotiating(n) | Session::Active(n) if n.peer.id == from => {
                n.candidates.enqueue(candidate);
                n.candidates.drain_if_ready(n.media.as_mut()).await;
            }
            _ => {
                tracing::debug!("Dropping candidate from {} outside negotiation", from.short());
            }
        }
    }

    async fn on_remote_hangup(&mut self, from: PeerId) {
        if self.session.is_with(&from) {
            self.end_session(EndReason::RemoteHangup, Notify::Nothing).await;
        } else {
            tracing::debug!("Ignoring hangup from {}", from.short());
        }
    }

    // ========================================================================
    // MEDIA EVENTS
    // ========================================================================

    async fn handle_media_event(&mut self, session: SessionId, event: MediaEvent) {
        if self.session.id() != Some(session) {
            tracing::debug!("Dropping media event of finished session {}", session);
            return;
        }
        match event {
            MediaEvent::LocalCandidate(candidate) => {
                if let Session::Negotiating(n) | Session::Active(n) = &self.session {
                    let message = SignalMessage::Ice {
                        from: self.local.id.clone(),
                        to: n.peer.id.clone(),
                        candidate,
                    };
                    self.send(message);
                }
            }
            MediaEvent::AudioLevel { direction, level } => {
                self.emit(CallEvent::AudioLevel { direction, level });
            }
            MediaEvent::Failed(reason) => {
                tracing::error!("Media session {} failed: {}", session, reason);
                self.end_session(EndReason::MediaFailed(reason), Notify::Hangup)
                    .await;
            }
        }
    }

    // ========================================================================
    // TRANSITIONS
    // ========================================================================

    /// Erwirbt das Media-Handle und startet die Verhandlung
    async fn start_negotiation(&mut self, pending: Pending, role: Role) {
        let sink = MediaEventSink::new(pending.id, self.queue.clone());
        let opened = with_deadline(self.config.negotiation_timeout, self.media_engine.open(sink)).await;

        let media = match opened {
            Ok(media) => media,
            Err(e) => {
                tracing::error!("Failed to acquire media for {}: {}", pending.peer.name, e);
                // Kein automatischer Neuversuch
                let notify = match role {
                    Role::Initiator => Notify::Hangup,
                    Role::Responder => Notify::Reject(Some(REJECT_UNAVAILABLE)),
                };
                self.finish(pending.peer, None, EndReason::DeviceUnavailable(e.to_string()), notify)
                    .await;
                return;
            }
        };

        let mut n = Negotiation::new(pending, role, media);
        n.timeout = Some(self.arm_timeout(n.id));

        match role {
            Role::Initiator => {
                let created =
                    with_deadline(self.config.negotiation_timeout, n.media.create_offer()).await;
                match created {
                    Ok(offer) => {
                        self.send(SignalMessage::Offer {
                            from: self.local.id.clone(),
                            to: n.peer.id.clone(),
                            offer,
                        });
                        n.local_sent = true;
                    }
                    Err(e) => {
                        self.fail(n, EndReason::NegotiationFailed(e.to_string())).await;
                        return;
                    }
                }
            }
            Role::Responder => {
                self.send(SignalMessage::CallAccept {
                    from: self.local.id.clone(),
                    to: n.peer.id.clone(),
                    name: Some(self.local.name.clone()),
                });
            }
        }

        tracing::info!("Negotiating with {} as {:?}", n.peer.name, role);
        self.session = Session::Negotiating(n);
        self.publish_state();
    }

    fn activate(&mut self, mut n: Negotiation) {
        n.disarm_timeout();
        tracing::info!("Call with {} is active", n.peer.name);
        self.session = Session::Active(n);
        self.publish_state();
    }

    /// Negotiation-Fehler: beenden und Gegenseite informieren
    async fn fail(&mut self, n: Negotiation, reason: EndReason) {
        tracing::error!("Negotiation with {} failed: {}", n.peer.name, reason);
        let (peer, media) = n.release();
        self.finish(peer, Some(media), reason, Notify::Hangup).await;
    }

    async fn end_session(&mut self, reason: EndReason, notify: Notify) {
        let (peer, media) = match self.take_session() {
            Session::Idle => return,
            Session::Outgoing(p) | Session::IncomingPending(p) => (p.peer, None),
            Session::Negotiating(n) | Session::Active(n) => {
                let (peer, media) = n.release();
                (peer, Some(media))
            }
        };
        self.finish(peer, media, reason, notify).await;
    }

    /// Ended: Media freigeben, UI informieren, zurück auf Idle
    async fn finish(
        &mut self,
        peer: Peer,
        media: Option<Box<dyn MediaSession>>,
        reason: EndReason,
        notify: Notify,
    ) {
        match notify {
            Notify::Nothing => {}
            Notify::Hangup => self.send(SignalMessage::Hangup {
                from: self.local.id.clone(),
                to: peer.id.clone(),
            }),
            Notify::Reject(reason) => self.send(SignalMessage::CallReject {
                from: self.local.id.clone(),
                to: peer.id.clone(),
                reason: reason.map(str::to_string),
            }),
        }

        if let Some(mut media) = media {
            if tokio::time::timeout(self.config.negotiation_timeout, media.close())
                .await
                .is_err()
            {
                tracing::warn!("Media session did not close in time");
            }
        }

        tracing::info!("Call with {} ended: {}", peer.name, reason);
        self.session = Session::Idle;
        self.publish_ended(&peer);
        self.emit(CallEvent::Ended { peer, reason });
        self.publish_state();
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn take_session(&mut self) -> Session {
        std::mem::replace(&mut self.session, Session::Idle)
    }

    fn next_session_id(&mut self) -> SessionId {
        self.next_session += 1;
        SessionId(self.next_session)
    }

    fn arm_timeout(&self, id: SessionId) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let timeout = self.config.negotiation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(queue) = queue.upgrade() {
                let _ = queue.send(EngineEvent::NegotiationTimeout(id));
            }
        })
    }

    /// Fire-and-forget über den Relay
    fn send(&self, message: SignalMessage) {
        match &self.relay {
            Some(relay) => {
                tracing::debug!("Sending {} to relay", message.kind());
                if let Err(e) = relay.send(&message) {
                    tracing::warn!("Failed to send {}: {}", message.kind(), e);
                }
            }
            None => tracing::debug!("Relay down, not sending {}", message.kind()),
        }
    }

    fn emit(&self, event: CallEvent) {
        // Ohne Subscriber ist das Senden ein Fehler, den wir ignorieren
        let _ = self.events.send(event);
    }

    fn publish_state(&self) {
        let state = self.session.state();
        let peer = self.session.peer().cloned();
        self.publish(state, peer);
    }

    fn publish_ended(&self, peer: &Peer) {
        self.publish(CallState::Ended, Some(peer.clone()));
    }

    fn publish(&self, state: CallState, peer: Option<Peer>) {
        let peer_name = peer.as_ref().map(|p| p.name.clone());
        *self.shared.status.write() = CallStatus {
            state,
            role: self.session.role(),
            peer,
            since: Utc::now(),
        };
        self.emit(CallEvent::StateChanged { state, peer_name });
    }
}

/// Ordnet den Reason eines `call-reject` einem EndReason zu
fn reject_reason(reason: Option<String>) -> EndReason {
    match reason.as_deref() {
        Some(REJECT_BUSY) => EndReason::Busy,
        Some(REJECT_UNAVAILABLE) => {
            EndReason::DeviceUnavailable("remote audio device unavailable".to_string())
        }
        _ => EndReason::Rejected,
    }
}

/// Begrenzt einen Media-Schritt auf die Verhandlungszeit
async fn with_deadline<T>(
    deadline: Duration,
    step: impl Future<Output = Result<T, MediaError>>,
) -> Result<T, MediaError> {
    tokio::time::timeout(deadline, step)
        .await
        .unwrap_or(Err(MediaError::TimedOut))
}

// ============================================================================
// CALL ENGINE HANDLE
// ============================================================================

/// Handle auf den Negotiator-Task
///
/// Klonbar; alle Klone speisen dieselbe Event-Queue. Wenn der letzte
/// Handle fällt, beendet sich der Task und legt einen laufenden Anruf auf.
#[derive(Clone)]
pub struct CallEngine {
    queue: mpsc::UnboundedSender<EngineEvent>,
    events: broadcast::Sender<CallEvent>,
    shared: Arc<Shared>,
}

impl CallEngine {
    /// Startet den Negotiator-Task
    pub fn spawn(
        local: LocalIdentity,
        media_engine: Arc<dyn MediaEngine>,
        config: EngineConfig,
    ) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared::default());

        let mut negotiator = Negotiator::new(
            local,
            media_engine,
            config,
            queue.downgrade(),
            events.clone(),
            Arc::clone(&shared),
        );

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                negotiator.handle(event).await;
            }
            negotiator.shutdown().await;
            tracing::debug!("Call engine stopped");
        });

        Self {
            queue,
            events,
            shared,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Gibt den aktuellen Call-Status zurück
    pub fn status(&self) -> CallStatus {
        self.shared.status.read().clone()
    }

    /// Zuletzt empfangener Roster
    pub fn roster(&self) -> Vec<Peer> {
        self.shared.roster.read().clone()
    }

    /// Startet einen ausgehenden Anruf
    pub async fn call(&self, peer_id: impl Into<PeerId>) -> Result<(), CallError> {
        self.request(Action::Call(peer_id.into())).await
    }

    /// Akzeptiert den eingehenden Anruf
    pub async fn accept_incoming(&self) -> Result<(), CallError> {
        self.request(Action::Accept).await
    }

    /// Lehnt den eingehenden Anruf ab
    pub async fn reject_incoming(&self) -> Result<(), CallError> {
        self.request(Action::Reject).await
    }

    /// Beendet den aktuellen Anruf (im Idle ein No-op)
    pub async fn hangup(&self) -> Result<(), CallError> {
        self.request(Action::Hangup).await
    }

    /// Verbindet den Negotiator mit einer neuen Relay-Verbindung
    pub fn attach_relay(&self, relay: Arc<dyn RelaySink>) -> Result<(), CallError> {
        self.post(EngineEvent::RelayAttached(relay))
    }

    /// Reicht eine Relay-Nachricht in Empfangsreihenfolge ein
    pub fn deliver(&self, message: SignalMessage) -> Result<(), CallError> {
        self.post(EngineEvent::Relay(message))
    }

    /// Relay-Verbindung verloren
    pub fn relay_lost(&self) -> Result<(), CallError> {
        self.post(EngineEvent::RelayLost)
    }

    async fn request(&self, action: Action) -> Result<(), CallError> {
        let (reply, response) = oneshot::channel();
        self.post(EngineEvent::Action {
            action,
            reply: Some(reply),
        })?;
        response.await.map_err(|_| CallError::EngineStopped)?
    }

    fn post(&self, event: EngineEvent) -> Result<(), CallError> {
        self.queue.send(event).map_err(|_| CallError::EngineStopped)
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SignalingError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingRelay {
        sent: Mutex<Vec<SignalMessage>>,
    }

    impl RelaySink for RecordingRelay {
        fn send(&self, message: &SignalMessage) -> Result<(), SignalingError> {
            self.sent.lock().push(message.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeMedia {
        unavailable: bool,
        /// Hält `create_offer` an, bis der Test freigibt
        offer_gate: Option<Arc<tokio::sync::Notify>>,
        log: Arc<Mutex<Vec<String>>>,
        sinks: Mutex<Vec<MediaEventSink>>,
    }

    struct FakeSession {
        offer_gate: Option<Arc<tokio::sync::Notify>>,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl MediaEngine for FakeMedia {
        async fn open(&self, events: MediaEventSink) -> Result<Box<dyn MediaSession>, MediaError> {
            if self.unavailable {
                return Err(MediaError::DeviceUnavailable("no microphone".to_string()));
            }
            self.sinks.lock().push(events);
            Ok(Box::new(FakeSession {
                offer_gate: self.offer_gate.clone(),
                log: Arc::clone(&self.log),
            }))
        }
    }

    #[async_trait]
    impl MediaSession for FakeSession {
        async fn create_offer(&mut self) -> Result<SessionDescription, MediaError> {
            if let Some(gate) = &self.offer_gate {
                gate.notified().await;
            }
            Ok(SessionDescription::offer("v=0 offer"))
        }

        async fn create_answer(&mut self) -> Result<SessionDescription, MediaError> {
            Ok(SessionDescription::answer("v=0 answer"))
        }

        async fn apply_remote(&mut self, description: SessionDescription) -> Result<(), MediaError> {
            self.log.lock().push(format!("apply:{}", description.kind));
            Ok(())
        }

        async fn add_candidate(&mut self, candidate: Candidate) -> Result<(), MediaError> {
            self.log.lock().push(format!("candidate:{}", candidate.candidate));
            Ok(())
        }

        async fn close(&mut self) {
            self.log.lock().push("close".to_string());
        }
    }

    struct Harness {
        negotiator: Negotiator,
        relay: Arc<RecordingRelay>,
        media: Arc<FakeMedia>,
        inbox: mpsc::UnboundedReceiver<EngineEvent>,
        events: broadcast::Receiver<CallEvent>,
        _queue: mpsc::UnboundedSender<EngineEvent>,
    }

    fn harness_with(local: &str, media: FakeMedia, timeout: Duration) -> Harness {
        let (queue, inbox) = mpsc::unbounded_channel();
        let (events_tx, events) = broadcast::channel(EVENT_CAPACITY);
        let relay = Arc::new(RecordingRelay::default());
        let media = Arc::new(media);
        let name = match local {
            "a1" => "Ari",
            "b1" => "Bea",
            _ => "Cy",
        };

        let mut negotiator = Negotiator::new(
            LocalIdentity::new(PeerId::new(local), name),
            media.clone(),
            EngineConfig {
                negotiation_timeout: timeout,
            },
            queue.downgrade(),
            events_tx,
            Arc::new(Shared::default()),
        );
        negotiator.relay = Some(relay.clone());

        Harness {
            negotiator,
            relay,
            media,
            inbox,
            events,
            _queue: queue,
        }
    }

    fn harness(local: &str) -> Harness {
        harness_with(local, FakeMedia::default(), Duration::from_secs(5))
    }

    impl Harness {
        async fn deliver(&mut self, message: SignalMessage) {
            self.negotiator.handle(EngineEvent::Relay(message)).await;
        }

        async fn act(&mut self, action: Action) -> Result<(), CallError> {
            self.negotiator.handle_action(action).await
        }

        fn sent(&self) -> Vec<SignalMessage> {
            std::mem::take(&mut *self.relay.sent.lock())
        }

        fn sent_kinds(&self) -> Vec<&'static str> {
            self.sent().iter().map(SignalMessage::kind).collect()
        }

        fn state(&self) -> CallState {
            self.negotiator.session.state()
        }

        fn media_log(&self) -> Vec<String> {
            self.media.log.lock().clone()
        }

        fn drain_events(&mut self) -> Vec<CallEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        fn ended_reason(&mut self) -> Option<EndReason> {
            self.drain_events().into_iter().find_map(|e| match e {
                CallEvent::Ended { reason, .. } => Some(reason),
                _ => None,
            })
        }

        /// a1 ruft b1 an und b1 nimmt an
        async fn negotiating_as_initiator(&mut self) {
            self.act(Action::Call("b1".into())).await.unwrap();
            self.deliver(call_accept("b1", "a1")).await;
            assert_eq!(self.state(), CallState::Negotiating);
            self.sent();
            self.drain_events();
        }

        /// b1 nimmt den Anruf von a1 an
        async fn negotiating_as_responder(&mut self) {
            self.deliver(call("a1", "b1")).await;
            self.act(Action::Accept).await.unwrap();
            assert_eq!(self.state(), CallState::Negotiating);
            self.sent();
            self.drain_events();
        }
    }

    fn call(from: &str, to: &str) -> SignalMessage {
        SignalMessage::Call {
            from: from.into(),
            to: to.into(),
            name: None,
        }
    }

    fn call_accept(from: &str, to: &str) -> SignalMessage {
        SignalMessage::CallAccept {
            from: from.into(),
            to: to.into(),
            name: None,
        }
    }

    fn offer(from: &str, to: &str) -> SignalMessage {
        SignalMessage::Offer {
            from: from.into(),
            to: to.into(),
            offer: SessionDescription::offer("v=0 remote"),
        }
    }

    fn answer(from: &str, to: &str) -> SignalMessage {
        SignalMessage::Answer {
            from: from.into(),
            to: to.into(),
            answer: SessionDescription::answer("v=0 remote"),
        }
    }

    fn ice(from: &str, to: &str, candidate: &str) -> SignalMessage {
        SignalMessage::Ice {
            from: from.into(),
            to: to.into(),
            candidate: Candidate::new(candidate),
        }
    }

    fn hangup(from: &str, to: &str) -> SignalMessage {
        SignalMessage::Hangup {
            from: from.into(),
            to: to.into(),
        }
    }

    #[tokio::test]
    async fn test_outgoing_call_becomes_active() {
        let mut h = harness("a1");
        h.deliver(SignalMessage::UserList {
            users: vec![json!({"client_id": "b1", "name": "Bea"})],
        })
        .await;

        h.act(Action::Call("b1".into())).await.unwrap();
        assert_eq!(
            h.sent(),
            vec![SignalMessage::Call {
                from: "a1".into(),
                to: "b1".into(),
                name: Some("Ari".to_string()),
            }]
        );
        assert_eq!(h.state(), CallState::Outgoing);
        assert_eq!(h.negotiator.shared.status.read().state, CallState::Outgoing);

        h.deliver(call_accept("b1", "a1")).await;
        assert_eq!(h.sent_kinds(), vec!["offer"]);
        assert_eq!(h.state(), CallState::Negotiating);
        assert_eq!(h.negotiator.session.role(), Some(Role::Initiator));

        h.deliver(answer("b1", "a1")).await;
        assert_eq!(h.state(), CallState::Active);
        assert_eq!(h.media_log(), vec!["apply:answer"]);

        let events = h.drain_events();
        assert!(events.contains(&CallEvent::StateChanged {
            state: CallState::Active,
            peer_name: Some("Bea".to_string()),
        }));
    }

    #[tokio::test]
    async fn test_responder_holds_early_candidates() {
        let mut h = harness("b1");
        h.deliver(SignalMessage::Call {
            from: "a1".into(),
            to: "b1".into(),
            name: Some("Ari".to_string()),
        })
        .await;
        assert_eq!(h.state(), CallState::IncomingPending);
        assert!(h
            .drain_events()
            .contains(&CallEvent::IncomingCall(Peer::new("a1", "Ari"))));

        h.act(Action::Accept).await.unwrap();
        assert_eq!(
            h.sent(),
            vec![SignalMessage::CallAccept {
                from: "b1".into(),
                to: "a1".into(),
                name: Some("Bea".to_string()),
            }]
        );

        h.deliver(ice("a1", "b1", "c1")).await;
        h.deliver(ice("a1", "b1", "c2")).await;
        assert!(h.media_log().is_empty());

        h.deliver(offer("a1", "b1")).await;
        assert_eq!(h.media_log(), vec!["apply:offer", "candidate:c1", "candidate:c2"]);
        assert_eq!(h.sent_kinds(), vec!["answer"]);
        assert_eq!(h.state(), CallState::Active);

        h.deliver(ice("a1", "b1", "c3")).await;
        assert_eq!(h.media_log().last().map(String::as_str), Some("candidate:c3"));
    }

    #[tokio::test]
    async fn test_busy_while_incoming_pending() {
        let mut h = harness("b1");
        h.deliver(call("a1", "b1")).await;
        h.deliver(call("c1", "b1")).await;

        assert_eq!(
            h.sent(),
            vec![SignalMessage::CallReject {
                from: "b1".into(),
                to: "c1".into(),
                reason: Some(REJECT_BUSY.to_string()),
            }]
        );
        assert_eq!(h.state(), CallState::IncomingPending);
        assert!(h.negotiator.session.is_with(&"a1".into()));
    }

    #[tokio::test]
    async fn test_call_preconditions() {
        let mut h = harness("a1");
        assert!(matches!(
            h.act(Action::Call("a1".into())).await,
            Err(CallError::CallingSelf)
        ));
        assert!(matches!(h.act(Action::Accept).await, Err(CallError::NoIncomingCall)));
        assert!(matches!(h.act(Action::Reject).await, Err(CallError::NoIncomingCall)));

        h.act(Action::Call("b1".into())).await.unwrap();
        assert!(matches!(
            h.act(Action::Call("c1".into())).await,
            Err(CallError::AlreadyInCall)
        ));

        let mut offline = harness("a1");
        offline.negotiator.relay = None;
        assert!(matches!(
            offline.act(Action::Call("b1".into())).await,
            Err(CallError::NotConnected)
        ));
        assert_eq!(offline.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_hangup_is_idempotent() {
        let mut h = harness("a1");
        h.act(Action::Hangup).await.unwrap();
        assert!(h.sent().is_empty());
        assert!(h.drain_events().is_empty());

        h.negotiating_as_initiator().await;
        h.act(Action::Hangup).await.unwrap();
        assert_eq!(h.sent_kinds(), vec!["hangup"]);
        assert_eq!(h.state(), CallState::Idle);
        assert_eq!(h.media_log(), vec!["close"]);

        let events = h.drain_events();
        let states: Vec<CallState> = events
            .iter()
            .filter_map(|e| match e {
                CallEvent::StateChanged { state, .. } => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![CallState::Ended, CallState::Idle]);
        assert!(events.contains(&CallEvent::Ended {
            peer: Peer::new("b1", "Unknown"),
            reason: EndReason::LocalHangup,
        }));

        h.act(Action::Hangup).await.unwrap();
        assert!(h.sent().is_empty());
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_local_reject_sends_call_reject() {
        let mut h = harness("b1");
        h.deliver(call("a1", "b1")).await;
        h.act(Action::Reject).await.unwrap();

        assert_eq!(
            h.sent(),
            vec![SignalMessage::CallReject {
                from: "b1".into(),
                to: "a1".into(),
                reason: None,
            }]
        );
        assert_eq!(h.state(), CallState::Idle);
        assert_eq!(h.ended_reason(), Some(EndReason::Declined));
        assert!(h.media_log().is_empty());
    }

    #[tokio::test]
    async fn test_remote_reject_maps_busy() {
        let mut h = harness("a1");
        h.act(Action::Call("b1".into())).await.unwrap();
        h.sent();
        h.deliver(SignalMessage::CallReject {
            from: "b1".into(),
            to: "a1".into(),
            reason: Some("busy".to_string()),
        })
        .await;
        assert_eq!(h.state(), CallState::Idle);
        assert_eq!(h.ended_reason(), Some(EndReason::Busy));
        assert!(h.sent().is_empty());

        h.act(Action::Call("b1".into())).await.unwrap();
        h.deliver(SignalMessage::CallReject {
            from: "b1".into(),
            to: "a1".into(),
            reason: None,
        })
        .await;
        assert_eq!(h.ended_reason(), Some(EndReason::Rejected));
    }

    #[tokio::test]
    async fn test_duplicate_offer_and_answer_are_ignored() {
        let mut h = harness("b1");
        h.negotiating_as_responder().await;
        h.deliver(offer("a1", "b1")).await;
        h.sent();
        h.deliver(offer("a1", "b1")).await;
        assert!(h.sent().is_empty());
        assert_eq!(h.media_log(), vec!["apply:offer"]);
        assert_eq!(h.state(), CallState::Active);

        let mut h = harness("a1");
        h.negotiating_as_initiator().await;
        h.deliver(answer("b1", "a1")).await;
        h.deliver(answer("b1", "a1")).await;
        assert_eq!(h.media_log(), vec!["apply:answer"]);
        assert_eq!(h.state(), CallState::Active);
    }

    #[tokio::test]
    async fn test_initiator_ignores_offer() {
        let mut h = harness("a1");
        h.negotiating_as_initiator().await;
        h.deliver(offer("b1", "a1")).await;

        assert!(h.sent().is_empty());
        assert!(h.media_log().is_empty());
        assert_eq!(h.state(), CallState::Negotiating);
    }

    #[tokio::test]
    async fn test_answer_without_negotiation_is_dropped() {
        let mut h = harness("a1");
        h.deliver(answer("b1", "a1")).await;
        h.deliver(ice("b1", "a1", "c1")).await;
        h.deliver(hangup("b1", "a1")).await;

        assert_eq!(h.state(), CallState::Idle);
        assert!(h.sent().is_empty());
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_mismatched_descriptor_fails_negotiation() {
        let mut h = harness("b1");
        h.negotiating_as_responder().await;
        h.deliver(SignalMessage::Offer {
            from: "a1".into(),
            to: "b1".into(),
            offer: SessionDescription::answer("v=0"),
        })
        .await;

        assert_eq!(h.sent_kinds(), vec!["hangup"]);
        assert_eq!(h.state(), CallState::Idle);
        assert_eq!(h.media_log(), vec!["close"]);
        assert!(matches!(h.ended_reason(), Some(EndReason::NegotiationFailed(_))));
    }

    #[tokio::test]
    async fn test_malformed_answer_fails_negotiation() {
        let mut h = harness("a1");
        h.negotiating_as_initiator().await;
        h.deliver(SignalMessage::Answer {
            from: "b1".into(),
            to: "a1".into(),
            answer: SessionDescription::answer("  "),
        })
        .await;

        assert_eq!(h.sent_kinds(), vec!["hangup"]);
        assert_eq!(h.state(), CallState::Idle);
        assert_eq!(h.media_log(), vec!["close"]);
        assert!(matches!(h.ended_reason(), Some(EndReason::NegotiationFailed(_))));

        let mut h = harness("a1");
        h.negotiating_as_initiator().await;
        h.deliver(SignalMessage::Answer {
            from: "b1".into(),
            to: "a1".into(),
            answer: SessionDescription::offer("v=0"),
        })
        .await;
        assert_eq!(h.sent_kinds(), vec!["hangup"]);
        assert!(matches!(h.ended_reason(), Some(EndReason::NegotiationFailed(_))));
    }

    #[tokio::test]
    async fn test_cancel_while_outgoing() {
        let mut h = harness("a1");
        h.act(Action::Call("b1".into())).await.unwrap();
        h.sent();
        h.drain_events();

        h.act(Action::Hangup).await.unwrap();
        assert_eq!(
            h.sent(),
            vec![SignalMessage::Hangup {
                from: "a1".into(),
                to: "b1".into(),
            }]
        );
        assert_eq!(h.state(), CallState::Idle);
        assert_eq!(h.ended_reason(), Some(EndReason::LocalHangup));
        assert!(h.media_log().is_empty());

        // Gegenseite: IncomingPending endet mit RemoteHangup
        let mut h = harness("b1");
        h.deliver(call("a1", "b1")).await;
        h.drain_events();
        h.deliver(hangup("a1", "b1")).await;
        assert_eq!(h.state(), CallState::Idle);
        assert_eq!(h.ended_reason(), Some(EndReason::RemoteHangup));
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn test_hangup_waits_for_media_step() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let media = Arc::new(FakeMedia {
            offer_gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        let relay = Arc::new(RecordingRelay::default());
        let engine = CallEngine::spawn(
            LocalIdentity::new(PeerId::new("a1"), "Ari"),
            media.clone(),
            EngineConfig::default(),
        );
        let mut events = engine.subscribe();
        engine.attach_relay(relay.clone()).unwrap();
        engine.call("b1").await.unwrap();
        engine.deliver(call_accept("b1", "a1")).unwrap();

        let hangup = tokio::spawn({
            let engine = engine.clone();
            async move { engine.hangup().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!hangup.is_finished());
        let kinds: Vec<&str> = relay.sent.lock().iter().map(SignalMessage::kind).collect();
        assert_eq!(kinds, vec!["call"]);

        gate.notify_one();
        hangup.await.unwrap().unwrap();

        let kinds: Vec<&str> = relay.sent.lock().iter().map(SignalMessage::kind).collect();
        assert_eq!(kinds, vec!["call", "offer", "hangup"]);
        assert_eq!(engine.status().state, CallState::Idle);
        assert_eq!(*media.log.lock(), vec!["close"]);

        let mut reason = None;
        while let Ok(event) = events.try_recv() {
            if let CallEvent::Ended { reason: r, .. } = event {
                reason = Some(r);
            }
        }
        assert_eq!(reason, Some(EndReason::LocalHangup));
    }

    #[tokio::test]
    async fn test_negotiation_timeout() {
        let mut h = harness_with("a1", FakeMedia::default(), Duration::from_millis(50));
        h.negotiating_as_initiator().await;

        let event = h.inbox.recv().await.unwrap();
        assert!(matches!(event, EngineEvent::NegotiationTimeout(_)));
        h.negotiator.handle(event).await;

        assert_eq!(h.sent_kinds(), vec!["hangup"]);
        assert_eq!(h.state(), CallState::Idle);
        assert_eq!(h.ended_reason(), Some(EndReason::TimedOut));
    }

    #[tokio::test]
    async fn test_active_call_disarms_timeout() {
        let mut h = harness_with("a1", FakeMedia::default(), Duration::from_millis(50));
        h.negotiating_as_initiator().await;
        h.deliver(answer("b1", "a1")).await;
        assert_eq!(h.state(), CallState::Active);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(h.inbox.try_recv().is_err());
        assert_eq!(h.state(), CallState::Active);
    }

    #[tokio::test]
    async fn test_device_unavailable() {
        let media = FakeMedia {
            unavailable: true,
            ..Default::default()
        };
        let mut h = harness_with("b1", media, Duration::from_secs(5));
        h.deliver(call("a1", "b1")).await;
        h.act(Action::Accept).await.unwrap();

        assert_eq!(
            h.sent(),
            vec![SignalMessage::CallReject {
                from: "b1".into(),
                to: "a1".into(),
                reason: Some(REJECT_UNAVAILABLE.to_string()),
            }]
        );
        assert_eq!(h.state(), CallState::Idle);
        assert!(matches!(h.ended_reason(), Some(EndReason::DeviceUnavailable(_))));

        let media = FakeMedia {
            unavailable: true,
            ..Default::default()
        };
        let mut h = harness_with("a1", media, Duration::from_secs(5));
        h.act(Action::Call("b1".into())).await.unwrap();
        h.sent();
        h.deliver(call_accept("b1", "a1")).await;
        assert_eq!(h.sent_kinds(), vec!["hangup"]);
        assert_eq!(h.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_glare_lower_id_initiates() {
        let mut h = harness("a1");
        h.act(Action::Call("b1".into())).await.unwrap();
        h.sent();
        h.deliver(call("b1", "a1")).await;
        assert_eq!(h.negotiator.session.role(), Some(Role::Initiator));
        assert_eq!(h.sent_kinds(), vec!["offer"]);

        // Das call-accept der Gegenseite ist danach ein Duplikat
        h.deliver(call_accept("b1", "a1")).await;
        assert!(h.sent().is_empty());
        assert_eq!(h.state(), CallState::Negotiating);

        let mut h = harness("b1");
        h.act(Action::Call("a1".into())).await.unwrap();
        h.sent();
        h.deliver(call("a1", "b1")).await;
        assert_eq!(h.negotiator.session.role(), Some(Role::Responder));
        assert_eq!(h.sent_kinds(), vec!["call-accept"]);

        h.deliver(call_accept("a1", "b1")).await;
        assert!(h.sent().is_empty());
        h.deliver(offer("a1", "b1")).await;
        assert_eq!(h.sent_kinds(), vec!["answer"]);
        assert_eq!(h.state(), CallState::Active);
    }

    #[tokio::test]
    async fn test_glare_keeps_caller_name() {
        let mut h = harness("b1");
        h.act(Action::Call("a1".into())).await.unwrap();
        h.drain_events();
        h.deliver(SignalMessage::Call {
            from: "a1".into(),
            to: "b1".into(),
            name: Some("Ari".to_string()),
        })
        .await;

        assert_eq!(h.negotiator.session.peer(), Some(&Peer::new("a1", "Ari")));
        assert!(h.drain_events().contains(&CallEvent::StateChanged {
            state: CallState::Negotiating,
            peer_name: Some("Ari".to_string()),
        }));
    }

    #[tokio::test]
    async fn test_glare_responder_rejects_before_answer() {
        let mut h = harness("a1");
        h.act(Action::Call("b1".into())).await.unwrap();
        h.sent();
        h.deliver(call("b1", "a1")).await;
        assert_eq!(h.state(), CallState::Negotiating);
        h.sent();

        // b1 hat kein Mikrofon und lehnt nach dem Glare ab
        h.deliver(SignalMessage::CallReject {
            from: "b1".into(),
            to: "a1".into(),
            reason: Some(REJECT_UNAVAILABLE.to_string()),
        })
        .await;

        assert_eq!(h.state(), CallState::Idle);
        assert_eq!(h.media_log(), vec!["close"]);
        assert!(h.sent().is_empty());
        assert!(matches!(h.ended_reason(), Some(EndReason::DeviceUnavailable(_))));

        // Nach dem Answer ist ein call-reject bedeutungslos
        let mut h = harness("a1");
        h.negotiating_as_initiator().await;
        h.deliver(answer("b1", "a1")).await;
        h.deliver(SignalMessage::CallReject {
            from: "b1".into(),
            to: "a1".into(),
            reason: None,
        })
        .await;
        assert_eq!(h.state(), CallState::Active);
    }

    #[tokio::test]
    async fn test_media_events_of_ended_session_are_dropped() {
        let mut h = harness("a1");
        h.negotiating_as_initiator().await;
        let sink = h.media.sinks.lock()[0].clone();

        assert!(sink.emit(MediaEvent::LocalCandidate(Candidate::new("l1"))));
        let event = h.inbox.recv().await.unwrap();
        h.negotiator.handle(event).await;
        assert_eq!(
            h.sent(),
            vec![SignalMessage::Ice {
                from: "a1".into(),
                to: "b1".into(),
                candidate: Candidate::new("l1"),
            }]
        );

        h.deliver(hangup("b1", "a1")).await;
        assert_eq!(h.ended_reason(), Some(EndReason::RemoteHangup));
        assert!(h.sent().is_empty());

        h.act(Action::Call("b1".into())).await.unwrap();
        h.sent();
        assert!(sink.emit(MediaEvent::Failed("ice failed".to_string())));
        let event = h.inbox.recv().await.unwrap();
        h.negotiator.handle(event).await;
        assert_eq!(h.state(), CallState::Outgoing);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn test_media_failure_ends_call() {
        let mut h = harness("b1");
        h.negotiating_as_responder().await;
        h.deliver(offer("a1", "b1")).await;
        h.sent();
        h.drain_events();

        let sink = h.media.sinks.lock()[0].clone();
        sink.emit(MediaEvent::AudioLevel {
            direction: crate::call_engine::media::AudioDirection::Remote,
            level: 42.0,
        });
        sink.emit(MediaEvent::Failed("connection failed".to_string()));
        for _ in 0..2 {
            let event = h.inbox.recv().await.unwrap();
            h.negotiator.handle(event).await;
        }

        assert_eq!(h.sent_kinds(), vec!["hangup"]);
        let events = h.drain_events();
        assert!(matches!(events[0], CallEvent::AudioLevel { level, .. } if level == 42.0));
        assert!(events.contains(&CallEvent::Ended {
            peer: Peer::new("a1", "Unknown"),
            reason: EndReason::MediaFailed("connection failed".to_string()),
        }));
    }

    #[tokio::test]
    async fn test_misaddressed_messages_are_dropped() {
        let mut h = harness("a1");
        h.deliver(call("b1", "c1")).await;
        h.deliver(call("a1", "a1")).await;
        assert_eq!(h.state(), CallState::Idle);
        assert!(h.sent().is_empty());
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_roster_snapshot_updates_shared_view() {
        let mut h = harness("a1");
        h.deliver(SignalMessage::UserList {
            users: vec![
                json!({"client_id": "a1", "name": "Ari"}),
                json!({"client_id": "b1", "name": "Bea"}),
            ],
        })
        .await;

        let expected = vec![Peer::new("b1", "Bea")];
        assert_eq!(*h.negotiator.shared.roster.read(), expected);
        assert_eq!(h.drain_events(), vec![CallEvent::RosterChanged(expected)]);
    }

    #[tokio::test]
    async fn test_relay_lost_ends_call_without_notify() {
        let mut h = harness("a1");
        h.negotiating_as_initiator().await;
        h.negotiator.handle(EngineEvent::RelayLost).await;

        assert!(h.sent().is_empty());
        assert!(h.negotiator.relay.is_none());
        assert_eq!(h.state(), CallState::Idle);
        assert_eq!(h.ended_reason(), Some(EndReason::RelayLost));
    }
}
