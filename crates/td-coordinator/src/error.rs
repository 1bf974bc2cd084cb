use td_risk::Violation;
use td_schemas::{Amount, OrderState};
use td_store::StoreError;
use uuid::Uuid;

/// Outcome of an accepted submission.
#[derive(Clone, Debug, PartialEq)]
pub struct SubmitResponse {
    pub order_id: Uuid,
    /// True when the idempotency key matched a prior submission and no new
    /// work was performed.
    pub existing: bool,
    pub state: OrderState,
    /// Iceberg children / bracket exits created alongside the order.
    pub child_ids: Vec<Uuid>,
}

/// Rejection or failure of a submission. Terminal rejections are persisted
/// as REJECTED order rows before they are returned.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitError {
    /// Malformed or constraint-violating intent.
    Validation { order_id: Uuid, reasons: Vec<String> },
    MarginShortfall {
        order_id: Uuid,
        available: Amount,
        required: Amount,
        shortfall: Amount,
    },
    RiskViolation {
        order_id: Uuid,
        violations: Vec<Violation>,
    },
    /// Synchronous backpressure: the intake queue is full.
    CapacityExceeded,
    /// The intake worker dropped the job (shutdown mid-flight).
    Shutdown,
    Store(StoreError),
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::Validation { reasons, .. } => {
                write!(f, "VALIDATION: {}", reasons.join("; "))
            }
            SubmitError::MarginShortfall { shortfall, .. } => {
                write!(f, "MARGIN_SHORTFALL: short by {shortfall}")
            }
            SubmitError::RiskViolation { violations, .. } => {
                write!(f, "RISK_VIOLATION: {} check(s) failed", violations.len())
            }
            SubmitError::CapacityExceeded => write!(f, "CAPACITY_EXCEEDED"),
            SubmitError::Shutdown => write!(f, "coordinator shut down"),
            SubmitError::Store(e) => write!(f, "store failure: {e}"),
        }
    }
}

impl std::error::Error for SubmitError {}

impl From<StoreError> for SubmitError {
    fn from(e: StoreError) -> Self {
        SubmitError::Store(e)
    }
}

/// Failures of post-accept operations (cancel, modify).
#[derive(Debug, Clone, PartialEq)]
pub enum OrderOpError {
    NotFound(Uuid),
    /// The order is not in a state that accepts this operation.
    NotWorking { order_id: Uuid, state: OrderState },
    Broker(String),
    Store(StoreError),
}

impl std::fmt::Display for OrderOpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderOpError::NotFound(id) => write!(f, "order {id} not found"),
            OrderOpError::NotWorking { order_id, state } => {
                write!(f, "order {order_id} not live (state {state})")
            }
            OrderOpError::Broker(e) => write!(f, "broker failure: {e}"),
            OrderOpError::Store(e) => write!(f, "store failure: {e}"),
        }
    }
}

impl std::error::Error for OrderOpError {}

impl From<StoreError> for OrderOpError {
    fn from(e: StoreError) -> Self {
        OrderOpError::Store(e)
    }
}
