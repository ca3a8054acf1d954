//! Identity Module - persistente Client-ID
//!
//! Dieses Modul verwaltet die lokale Identität des Clients:
//! - Generierung einer UUID beim ersten Start
//! - Persistente Speicherung im App-Datenverzeichnis
//! - Anzeigename für den Relay
//!

mod client_id;

pub use client_id::{default_display_name, IdentityError, LocalIdentity};
