//! Path-Candidate Queue
//!
//! Kandidaten können vor dem Remote-Descriptor eintreffen, weil das
//! Sammeln auf der Gegenseite asynchron zur Descriptor-Zustellung läuft.
//! Jeder eingehende Kandidat läuft durch diese Queue.

use super::media::MediaSession;
use crate::signaling::Candidate;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<Candidate>,
    ready: bool,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, candidate: Candidate) {
        self.pending.push_back(candidate);
    }

    /// Remote-Descriptor wurde angewendet
    pub fn mark_ready(&mut self) {
        self.ready = true;
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Übergibt alle wartenden Kandidaten in Ankunftsreihenfolge
    ///
    /// Nur wenn der Remote-Descriptor bereits angewendet ist, sonst
    /// bleibt die Queue unverändert. Gibt die Zahl angenommener
    /// Kandidaten zurück; abgelehnte werden geloggt und übersprungen.
    pub async fn drain_if_ready(&mut self, media: &mut dyn MediaSession) -> usize {
        if !self.ready {
            if !self.pending.is_empty() {
                tracing::debug!(
                    "Holding {} candidates until remote description is applied",
                    self.pending.len()
                );
            }
            return 0;
        }

        let mut applied = 0;
        while let Some(candidate) = self.pending.pop_front() {
            match media.add_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => tracing::warn!("Skipping stale candidate: {}", e),
            }
        }
        applied
    }

    /// Verwirft alle wartenden Kandidaten ohne sie anzuwenden
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.ready = false;
        dropped
    }
}
