//! Persistente Client-ID
//!
//! Die ID bleibt über Neustarts und Reconnects vom selben Gerät stabil.
//! Gespeichert wird sie als Klartext-Datei im App-Datenverzeichnis:
//! - Windows: `%APPDATA%/peercall/data/client_id`
//! - macOS: `~/Library/Application Support/dev.peercall.peercall/client_id`
//! - Linux: `~/.local/share/peercall/client_id`

use crate::signaling::PeerId;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Failed to access identity file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not determine app data directory")]
    NoDataDirectory,

    #[error("Stored client id is empty: {0}")]
    EmptyId(PathBuf),
}

// ============================================================================
// LOCAL IDENTITY
// ============================================================================

/// ID und Anzeigename des lokalen Clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub id: PeerId,
    pub name: String,
}

impl LocalIdentity {
    pub fn new(id: PeerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Lädt die gespeicherte ID oder erstellt eine neue
    ///
    /// Ohne `name` wird der Anzeigename aus der ID abgeleitet.
    pub fn load_or_create(name: Option<String>) -> Result<Self, IdentityError> {
        let path = Self::get_id_path()?;
        Self::load_or_create_at(&path, name)
    }

    /// Wie `load_or_create`, aber mit explizitem Pfad
    pub fn load_or_create_at(path: &Path, name: Option<String>) -> Result<Self, IdentityError> {
        let id = if path.exists() {
            tracing::info!("Loading client id from {:?}", path);
            let stored = fs::read_to_string(path)?;
            let stored = stored.trim();
            if stored.is_empty() {
                return Err(IdentityError::EmptyId(path.to_path_buf()));
            }
            PeerId::new(stored)
        } else {
            tracing::info!("Creating new client id at {:?}", path);
            let id = PeerId::new(Uuid::new_v4().to_string());
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, id.as_str())?;
            id
        };

        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| default_display_name(&id));
        Ok(Self { id, name })
    }

    /// Ermittelt den Pfad zur ID-Datei
    fn get_id_path() -> Result<PathBuf, IdentityError> {
        let proj_dirs = directories::ProjectDirs::from("dev", "peercall", "peercall")
            .ok_or(IdentityError::NoDataDirectory)?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("client_id");
        Ok(path)
    }
}

/// Anzeigename nach dem Muster `User-xxxx`
pub fn default_display_name(id: &PeerId) -> String {
    let prefix: String = id.as_str().chars().take(4).collect();
    format!("User-{}", prefix)
}

// ============================================================================
// TESTS
// ============================================================================
