//! Durable server records for the FastDEV runner.
//!
//! This module defines the per-server record (`ServerRecord`), its
//! lifecycle state machine (`ServerState`), launch modes, and the
//! JSON-file backed [`StateStore`] that keeps records across manager
//! restarts.
//!
//! # Examples
//!
//! ```
//! use fastdev_runner::state::{ServerMode, ServerRecord, ServerState};
//!
//! let record = ServerRecord::new("api", "/srv/app", ServerMode::Dev);
//! assert_eq!(record.state, ServerState::Stopped);
//! assert!(record.state.can_transition(ServerState::Starting));
//! ```
mod record;
mod store;

pub use record::{ExitInfo, ServerDetails, ServerMode, ServerRecord, ServerState, ServerSummary};
pub use store::StateStore;
