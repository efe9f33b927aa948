//! # Arena Core
//!
//! The real-time match orchestration core of a competitive programming
//! arena: it accepts concurrent players, pairs them into matches, drives
//! each match through a multi-round lifecycle, ingests code submissions,
//! dispatches them to a sandboxed grader, aggregates scores, and
//! multicasts state to players and spectators.
//!
//! It provides:
//! - Matchmaking with cancellable tickets, rating-bucket widening and
//!   custom join-by-id lobbies ([`MatchmakerHandle`](crate::matchmaker::MatchmakerHandle))
//! - A single-writer state machine per match driving rounds, deadlines,
//!   solution intake, grading and reconnection ([`match_runtime`])
//! - A duplex session layer owning the connection↔player↔match mapping
//!   with room multicast and chat ([`SessionHub`](crate::session_hub::SessionHub))
//! - A [`Supervisor`](crate::supervisor::Supervisor) tying it together:
//!   one per process, parameterized by [`Clock`](crate::clock::Clock),
//!   [`StateStore`](crate::state_store::StateStore),
//!   [`Store`](crate::store::Store) and
//!   [`GraderClient`](crate::grader::GraderClient)
//!
//! HTTP handling, auth, durable storage and the grader itself live
//! outside this crate; the core reaches them through the narrow traits in
//! [`state_store`], [`store`] and [`grader`]. Any message-framed duplex
//! transport can carry the [`protocol`] events.
//!
//! # Usage Example
//!
//! Boot a core with the in-process collaborators and drive one custom
//! lobby:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use arena_core::prelude::*;
//! use arena_core::config::CustomConfig;
//! use arena_core::grader::{GradeRequest, GradeReport, GradeError, GraderClient};
//!
//! struct NullGrader;
//!
//! #[async_trait::async_trait]
//! impl GraderClient for NullGrader {
//!     async fn grade(&self, _req: GradeRequest) -> Result<GradeReport, GradeError> {
//!         Err(GradeError::Unavailable { message: "offline".into(), tests: None })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let supervisor = Supervisor::new(
//!         Clock::new(),
//!         CoreConfig::new(),
//!         Arc::new(MemoryStateStore::new()),
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(StaticProblemSource::new()),
//!         Arc::new(NullGrader),
//!     );
//!
//!     let owner = Player::new("ada", 1200);
//!     let conn = supervisor.connect(owner.clone()).await;
//!     supervisor
//!         .handle_command(conn.conn_id, ClientCommand::CreateCustom {
//!             config: CustomConfig::default(),
//!         })
//!         .await;
//!     // Feed further commands from your transport; read events from
//!     // `conn.events`.
//! }
//! ```
#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod error;
pub mod grader;
mod logger;
pub mod match_runtime;
pub mod match_state;
pub mod matchmaker;
pub mod player;
pub mod protocol;
pub mod session_hub;
pub mod state_store;
pub mod store;
pub mod supervisor;

pub use anyhow;

/// Commonly used types for quick access.
///
/// ```rust
/// use arena_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::clock::Clock;
    pub use crate::config::CoreConfig;
    pub use crate::match_state::{MatchSnapshot, MatchStatus};
    pub use crate::player::{MatchMode, Player, PlayerId};
    pub use crate::protocol::{ClientCommand, Envelope, ServerEvent};
    pub use crate::session_hub::SessionHub;
    pub use crate::state_store::{MemoryStateStore, StateStore};
    pub use crate::store::{MemoryStore, StaticProblemSource, Store};
    pub use crate::supervisor::Supervisor;
}
