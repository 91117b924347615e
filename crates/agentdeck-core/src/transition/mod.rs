//! Transition executor and approval queue.

mod approvals;
mod executor;

pub use approvals::{is_pending_approval, ApprovalQueue};
pub use executor::{TransitionError, TransitionExecutor, TransitionReceipt};
