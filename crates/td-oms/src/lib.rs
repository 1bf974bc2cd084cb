//! td-oms — order lifecycle state machine.
//!
//! # Design
//!
//! Explicit state machine for a single order. Every lifecycle event is
//! applied via [`transition`], which enforces two invariants:
//!
//! 1. **Legal transitions only.** Illegal moves return
//!    [`InvalidTransition`], which callers MUST treat as a quarantine
//!    signal for the affected order.
//! 2. **Idempotent replay.** A self-transition (`x → x`) is a silent no-op,
//!    so re-delivered broker events converge without error.
//!
//! # State diagram
//!
//! ```text
//!   PENDING ──► QUEUED ──► SUBMITTED ──► PARTIALLY_FILLED ──► FILLED (term.)
//!      │           │           │  ▲            │    │
//!      │           │           │  │            │    └──► CANCELLED (term.)
//!      ▼           │           ▼  │            ▼
//!  REJECTED ◄──────┴── MODIFY_REQUESTED ◄──────┘
//!  (term.)                 │
//!                          └──► SUBMITTED | REJECTED
//! ```
//!
//! `EXPIRED` is terminal and entered only by validity handling (DAY close,
//! IOC immediate expiry), never by a broker lifecycle event, so it has no
//! inbound edge here beyond the explicit expiry call.

use td_schemas::OrderState;

mod machine;

pub use machine::{apply_event, expire, transition, InvalidTransition, OrderEvent};

/// All states an order can ever occupy, in a stable order (used by audits
/// and the state-path validity test helper).
pub const ALL_STATES: [OrderState; 9] = [
    OrderState::Pending,
    OrderState::Queued,
    OrderState::Submitted,
    OrderState::PartiallyFilled,
    OrderState::ModifyRequested,
    OrderState::Filled,
    OrderState::Cancelled,
    OrderState::Rejected,
    OrderState::Expired,
];

/// Check that a persisted sequence of states forms a valid path through the
/// transition graph (self-transitions allowed). Used by tests and the
/// reconciliation engine's sanity pass.
pub fn is_valid_state_path(path: &[OrderState]) -> bool {
    path.windows(2)
        .all(|w| w[0] == w[1] || transition(w[0], w[1]).is_ok())
}
