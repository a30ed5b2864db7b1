//! MPC Relay: message relay and coordination for threshold protocols
//!
//! ## Description
//!
//! This crate runs multi-round threshold protocols (key generation, key refresh, signing and
//! pre-signing) across independent participant processes that only talk to each other through
//! a publish/subscribe broker. The protocol mathematics live behind the [`engine`] traits; this
//! crate moves the protocol's round messages between participants, detects when a run has
//! finished or failed, and collects every participant's result.
//!
//! ## Summary
//!
//! An [`Orchestrator`] mints a session id and publishes a protocol request to every
//! participant. Each [`Participant`] starts its protocol engine and runs a [`Session`] loop
//! that forwards the engine's outgoing messages to their recipients and feeds incoming
//! messages back into the engine. When the engine is done, every participant publishes its
//! session result on a channel keyed by session and participant. The orchestrator waits until
//! all of them have reported, then checks that they agree (and, for signatures, that the
//! signature verifies).
//!
//! All channels are typed and cached by the [`ChannelRegistry`]; the [`bus`] underneath moves
//! JSON bytes over Redis or, in tests and demos, an in-process broker.
//!
//! ## Usage Notes
//!
//! Every wait is bounded by a session deadline: a participant that never answers fails the
//! session with [`RelayError::Timeout`] instead of hanging the orchestrator.
//!
//! > ⚠ The bundled [`SchnorrEngine`] has not been reviewed and key shares are stored
//! unencrypted. Do not use it to protect real funds.

pub mod bus;
pub mod cluster;
pub mod config;
pub mod engine;
mod error;
pub mod orchestrator;
pub mod participant;
pub mod registry;
pub mod session;
pub mod store;
pub mod types;

pub use engine::SchnorrEngine;
pub use error::{RelayError, Result};
pub use orchestrator::Orchestrator;
pub use participant::Participant;
pub use registry::ChannelRegistry;
pub use session::Session;
