//! peercall - P2P Voice Calls
//!
//! Verhandelt Peer-to-Peer Audioanrufe über einen schlanken Signaling-Relay:
//! - WebSocket Relay für Roster und Call-Signale
//! - WebRTC für die Audioverbindung
//! - persistente Client-ID statt Benutzerkonto

pub mod call_engine;
pub mod config;
pub mod console;
pub mod identity;
pub mod roster;
pub mod signaling;

use anyhow::Context;
use call_engine::CallEngine;
use config::AppConfig;
use identity::LocalIdentity;
use signaling::{SignalingClient, SignalingEvent};
use std::sync::Arc;

/// Default-Filter, überschreibbar mit `RUST_LOG`
pub const DEFAULT_LOG_FILTER: &str = "peercall=debug,peercall_lib=debug,webrtc=warn";

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging (mehrfacher Aufruf ist harmlos)
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// RELAY CONNECTION
// ============================================================================

/// Hält die Relay-Verbindung und reicht Nachrichten an die Engine
///
/// Nach einem Verbindungsverlust wird neu verbunden; schlägt das
/// wiederholt fehl, endet die Schleife mit dem letzten Fehler.
pub async fn relay_loop(
    config: AppConfig,
    identity: LocalIdentity,
    engine: CallEngine,
) -> anyhow::Result<()> {
    let policy = config.retry_policy();

    loop {
        let (client, mut events) = policy
            .run("Relay connection", |_| {
                SignalingClient::connect(&config.signaling_url, &identity)
            })
            .await
            .context("could not reach signaling relay")?;

        engine.attach_relay(Arc::new(client))?;

        while let Some(event) = events.recv().await {
            match event {
                SignalingEvent::Message(message) => engine.deliver(message)?,
                SignalingEvent::Disconnected => break,
            }
        }

        engine.relay_lost()?;
        tracing::warn!("Relay connection lost, reconnecting");
    }
}

// ============================================================================
// APP RUNNER
// ============================================================================

/// Startet Engine, Relay-Verbindung und Konsole
pub async fn run() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let identity =
        LocalIdentity::load_or_create(config.display_name.clone()).context("failed to load client id")?;
    tracing::info!("Starting as {} ({})", identity.name, identity.id);

    let media = Arc::new(config.media_engine());
    let engine = CallEngine::spawn(identity.clone(), media, config.engine_config());

    let printer = tokio::spawn(console::print_events(engine.subscribe()));
    let mut relay = tokio::spawn(relay_loop(config, identity, engine.clone()));

    let result = tokio::select! {
        result = console::run_console(engine.clone()) => result,
        joined = &mut relay => joined.context("relay task failed")?,
    };

    relay.abort();
    printer.abort();
    result
}
