//! Durable run/session store.
//!
//! The store is the single authority for persisted records, per-stream
//! event append-logs with live fan-out, pending-approval waiters, and the
//! cancellation registry. Engines mutate records only through `get`/
//! `update`; all files live under the configured data directory.

pub mod models;
pub mod session;
mod store;

pub use models::{Event, Run, RunStatus, Step, StepStatus, StepType};
pub use session::{
    ApprovalAction, ApprovalDecision, Message, Session, SessionCost, SessionEvent, SessionMode,
    SessionStatus, Turn, TurnStatus,
};
pub use store::{ApprovalReceiver, Store};
