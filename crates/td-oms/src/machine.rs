use td_schemas::OrderState;

// ---------------------------------------------------------------------------
// InvalidTransition
// ---------------------------------------------------------------------------

/// Returned when a state change is not an edge of the lifecycle graph.
///
/// **Callers MUST treat this as a quarantine condition.** An illegal
/// transition indicates a serious inconsistency (e.g. a fill arriving after
/// cancellation was confirmed) that requires operator investigation; the
/// affected order takes no further transitions until then.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: OrderState,
    pub to: OrderState,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid order transition: {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

// ---------------------------------------------------------------------------
// transition
// ---------------------------------------------------------------------------

/// Validate a state change against the lifecycle graph.
///
/// Returns the new state on success. A self-transition (`x → x`) is a
/// permitted no-op so that re-delivered broker events are idempotent.
///
/// # Errors
/// [`InvalidTransition`] for any move that is not an edge of the graph.
pub fn transition(from: OrderState, to: OrderState) -> Result<OrderState, InvalidTransition> {
    use OrderState::*;

    // Broker-event idempotency: re-applying the current state is a no-op.
    if from == to {
        return Ok(to);
    }

    let legal = match (from, to) {
        (Pending, Queued | Rejected) => true,
        (Queued, Submitted | Rejected | Cancelled) => true,
        (Submitted, PartiallyFilled | Filled | Cancelled | Rejected | ModifyRequested) => true,
        (PartiallyFilled, Filled | Cancelled | ModifyRequested) => true,
        (ModifyRequested, Submitted | Rejected) => true,
        _ => false,
    };

    if legal {
        Ok(to)
    } else {
        Err(InvalidTransition { from, to })
    }
}

/// Validity-driven expiry (DAY close, IOC remainder).
///
/// Expiry is not a broker lifecycle edge in [`transition`]'s graph; it is
/// only legal from a non-terminal state that has not begun filling a cancel.
pub fn expire(from: OrderState) -> Result<OrderState, InvalidTransition> {
    use OrderState::*;
    match from {
        Expired => Ok(Expired),
        Queued | Submitted | PartiallyFilled => Ok(Expired),
        _ => Err(InvalidTransition { from, to: Expired }),
    }
}

// ---------------------------------------------------------------------------
// OrderEvent
// ---------------------------------------------------------------------------

/// Broker-stream lifecycle events, already normalized to the core
/// vocabulary. Quantities ride on the coordinator's fill records; the state
/// machine cares only about the edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEvent {
    /// Broker acknowledged the order (or a modify of it).
    Ack,
    PartialFill,
    Fill,
    Reject,
    Cancelled,
    Expired,
}

/// Map a broker event onto the state it targets from `from`, and validate
/// the edge.
///
/// `Ack` targets `Submitted` from both `Queued` (initial acceptance) and
/// `ModifyRequested` (modify confirmed); all other events target a fixed
/// state.
pub fn apply_event(from: OrderState, ev: OrderEvent) -> Result<OrderState, InvalidTransition> {
    let to = match ev {
        OrderEvent::Ack => OrderState::Submitted,
        OrderEvent::PartialFill => OrderState::PartiallyFilled,
        OrderEvent::Fill => OrderState::Filled,
        OrderEvent::Reject => OrderState::Rejected,
        OrderEvent::Cancelled => OrderState::Cancelled,
        OrderEvent::Expired => return expire(from),
    };
    transition(from, to)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
