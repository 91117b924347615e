//! Core of agentdeck: workflow rules for tasks and the live synchronization
//! of a local snapshot with an agent orchestration server.
//!
//! - [`workflow`]: status, outcome and stage transition tables
//! - [`gateway`]: typed HTTP calls against the server
//! - [`stream`]: server-push notifications over SSE
//! - [`sync`]: snapshot ownership and stale-result handling
//! - [`transition`]: validated mutations and the approval queue

pub mod config;
pub mod gateway;
pub mod stream;
pub mod sync;
pub mod transition;
pub mod workflow;
