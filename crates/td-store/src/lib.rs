//! td-store — the persistence port.
//!
//! The engine talks to storage exclusively through the [`Store`] /
//! [`StoreTx`] traits and the [`IdempotencyStore`] reservation contract.
//! `td-db` implements them against Postgres; [`MemoryStore`] here is the
//! deterministic in-process implementation used by tests and the paper
//! stack.
//!
//! Contract highlights:
//! - every order-state mutation happens inside a transaction that also
//!   records the transition row for audit
//! - a transaction sees its own writes (strong read-after-write per order)
//! - idempotency reservation is compare-and-set: one writer wins

mod error;
mod memory;
mod port;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use port::{
    IdempotencyStore, LocalSnapshots, OrderFilter, Reservation, Store, StoreTx,
};
