//! td-schemas
//!
//! Canonical record types and vocabulary shared by every crate in the
//! workspace. Pure data: serde-serializable structs and enums, the
//! fixed-point [`Amount`] money type, and nothing that does IO.

pub mod fees;
pub mod instrument;
pub mod margin;
pub mod money;
pub mod order;
pub mod portfolio;
pub mod recon;
pub mod risk;

pub use fees::{AssetClass, Brokerage, FeeBreakdown, FeeRule, Segment};
pub use instrument::{Instrument, InstrumentKey, InstrumentType, OptionKind};
pub use margin::{MarginRule, MarginType};
pub use money::{Amount, AMOUNT_SCALE};
pub use order::{
    BracketSpec, Fill, Order, OrderIntent, OrderState, OrderTransition, OrderType, ProductType,
    Side, Validity,
};
pub use portfolio::{Holding, Position, PositionKey};
pub use recon::{
    recon_lock_key, ReconItem, ReconItemStatus, ReconItemType, ReconRun, ReconRunStatus,
    ReconScope,
};
pub use risk::{LimitKind, LimitScope, RiskLimit};
