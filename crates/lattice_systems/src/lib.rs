//! # lattice_systems
//!
//! The simulation subsystems of the grid world server.
//!
//! This crate provides:
//!
//! - [`movement`] — velocity state and the three-phase tick movement
//!   pass with collision resolution.
//! - [`vision`] — per-observer visibility deltas and snapshots.
//! - [`chat`] — range-scoped message delivery and slash commands.
//! - [`pipeline`] — the per-tick driver that drains actions, fans chunk
//!   work out over the bus, and settles cross-chunk moves.

pub mod chat;
mod commands;
pub mod movement;
pub mod pipeline;
pub mod vision;

pub use chat::{ChatListener, ChatMessage, ChatSystem, SYSTEM_SENDER};
pub use commands::{COMMANDS, ChatCommand};
pub use movement::MovementSystem;
pub use pipeline::TickPipeline;
pub use vision::{LookItem, VisionObserver, VisionSystem, VisionUpdater};
