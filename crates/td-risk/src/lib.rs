//! td-risk — hierarchical pre-trade risk checks.
//!
//! Layered gate, all of which must pass:
//! 1. scope resolution (instrument beats strategy beats portfolio per kind)
//! 2. position / notional / concentration projection of post-trade exposure
//! 3. daily loss and drawdown-from-peak
//! 4. incremental VaR (historical simulation or seeded Monte Carlo)
//!
//! The gate is pure: it mutates nothing and does no IO.

mod gate;
mod types;
mod var;

pub use gate::evaluate;
pub use types::{
    InstrumentExposure, OrderProjection, PortfolioSnapshot, RiskVerdict, Violation,
};
pub use var::{historical_var_pct_e4, monte_carlo_var_pct_e4};
