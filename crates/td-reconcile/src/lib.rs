//! td-reconcile — scheduled comparison of local state against broker truth.

mod diff;
mod engine;

pub use diff::{diff_holdings, diff_orders, diff_positions, diff_scope, ScopeDiff};
pub use engine::{run_reconciliation, ReconError};
