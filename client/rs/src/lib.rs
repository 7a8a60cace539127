//! # Docksmith Client
//!
//! Shared entities for the Docksmith container update engine.
//! These types cross every boundary in the system: the decision
//! engine, the update orchestrator, the persistent store contract,
//! and the event bus all speak in terms of this crate.

pub mod entities;
