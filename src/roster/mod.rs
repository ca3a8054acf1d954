//! Roster Module
//!
//! Hält die vom Relay verteilte Liste erreichbarer Peers.

mod tracker;

pub use tracker::RosterTracker;
