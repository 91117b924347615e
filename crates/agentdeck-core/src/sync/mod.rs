//! Synchronization of the local snapshot with the server.

mod controller;
mod state;

pub use controller::{
    plan_for, RefreshOutcome, RefreshTicket, SyncAction, SyncController, SyncError, SyncEvent,
    SyncOptions,
};
pub use state::{LoadPhase, Snapshot};
