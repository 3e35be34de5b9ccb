//! # lattice_net
//!
//! NATS transport layer for the grid world server.
//!
//! This crate provides:
//!
//! - [`subjects`] — NATS subject hierarchy constants and builders.
//! - [`messages`] — Bus message types for ticks and chunk work.
//! - [`codec`] — MessagePack serialisation/deserialisation helpers.
//! - [`bus`] — The `WorkBus` contract: publish/subscribe with queue
//!   groups plus request/reply.
//! - [`connection`] — NATS connection management and the NATS bus.
//! - [`local`] — An in-process bus with the same contract, for tests and
//!   single-process servers.
//! - [`error`] — Network-layer error types.

pub mod bus;
pub mod codec;
pub mod connection;
pub mod error;
pub mod local;
pub mod messages;
pub mod subjects;

pub use bus::{BusHandler, WorkBus, handler};
pub use codec::{decode, encode};
pub use connection::NatsConnection;
pub use error::NetError;
pub use local::LocalBus;
