//! td-router — broker selection, iceberg slicing, bracket expansion.
//!
//! The router is a deterministic boundary: no IO, no clocks of its own, no
//! broker calls. It decides *where* an order goes and *what shape* it takes;
//! the coordinator owns persistence and release sequencing.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use td_config::CoreConfig;
use td_schemas::{
    Amount, BracketSpec, InstrumentType, Order, OrderState, OrderType, Side, Validity,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// Iceberg slicing needs a limit price on the parent.
    ParentHasNoPrice,
    /// visible_qty must be in [1, parent.qty].
    BadVisibleQty { visible_qty: i64, parent_qty: i64 },
}

impl std::fmt::Display for RouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterError::ParentHasNoPrice => {
                write!(f, "iceberg parent must carry a limit price")
            }
            RouterError::BadVisibleQty {
                visible_qty,
                parent_qty,
            } => write!(
                f,
                "visible_qty {visible_qty} outside [1, {parent_qty}]"
            ),
        }
    }
}

impl std::error::Error for RouterError {}

// ---------------------------------------------------------------------------
// Broker selection
// ---------------------------------------------------------------------------

/// Select the broker for an intent.
///
/// Precedence: explicit `broker_id` on the intent, then the routing rule for
/// the instrument type, then the configured default.
pub fn route(
    cfg: &CoreConfig,
    explicit_broker: Option<&str>,
    instrument_type: InstrumentType,
) -> String {
    if let Some(b) = explicit_broker {
        if !b.is_empty() {
            return b.to_string();
        }
    }
    cfg.routing_rules
        .get(&instrument_type)
        .cloned()
        .unwrap_or_else(|| cfg.default_broker.clone())
}

// ---------------------------------------------------------------------------
// Iceberg slicing
// ---------------------------------------------------------------------------

/// Split a parent order into LIMIT children of at most `visible_qty` each.
///
/// Children:
/// - sum exactly to the parent quantity, every slice in `[1, visible_qty]`
/// - share the parent's price, side, instrument, broker and product
/// - carry `parent_id = parent.order_id`
/// - are created in `Pending`; the coordinator releases them sequentially
///   (child N+1 is queued only once child N has started filling).
pub fn split_iceberg(
    parent: &Order,
    visible_qty: i64,
    now: DateTime<Utc>,
) -> Result<Vec<Order>, RouterError> {
    if visible_qty < 1 || visible_qty > parent.qty {
        return Err(RouterError::BadVisibleQty {
            visible_qty,
            parent_qty: parent.qty,
        });
    }
    let price = parent.price.ok_or(RouterError::ParentHasNoPrice)?;

    let mut children = Vec::new();
    let mut remaining = parent.qty;
    while remaining > 0 {
        let slice = remaining.min(visible_qty);
        // Stagger creation stamps so release order is total and stable.
        let now = now + chrono::Duration::microseconds(children.len() as i64);
        children.push(Order {
            order_id: Uuid::new_v4(),
            idempotency_key: None,
            strategy_id: parent.strategy_id.clone(),
            broker_id: parent.broker_id.clone(),
            instrument: parent.instrument.clone(),
            side: parent.side,
            order_type: OrderType::Limit,
            validity: parent.validity,
            product: parent.product,
            qty: slice,
            price: Some(price),
            trigger_price: None,
            group_id: None,
            parent_id: Some(parent.order_id),
            broker_order_id: None,
            state: OrderState::Pending,
            filled_qty: 0,
            avg_fill_price: None,
            reject_reason: None,
            created_at: now,
            updated_at: now,
        });
        remaining -= slice;
    }

    Ok(children)
}

// ---------------------------------------------------------------------------
// Bracket expansion
// ---------------------------------------------------------------------------

/// The two exit legs of a bracket, linked by a shared OCO group.
#[derive(Clone, Debug, PartialEq)]
pub struct BracketExits {
    pub target: Order,
    pub stop: Order,
}

/// Expand a bracket entry into its OCO exit pair.
///
/// Both exits are for the entry's full quantity on the opposite side and
/// share a fresh `group_id`; the coordinator cancels the surviving sibling
/// when either fills. The target is a LIMIT at `target_price`; the stop is a
/// STOP_LOSS_MARKET triggered at `stop_trigger`.
pub fn expand_bracket(entry: &Order, spec: &BracketSpec, now: DateTime<Utc>) -> BracketExits {
    let group_id = Uuid::new_v4();
    let exit_side = entry.side.opposite();

    let exit = |order_type: OrderType, price: Option<Amount>, trigger: Option<Amount>| Order {
        order_id: Uuid::new_v4(),
        idempotency_key: None,
        strategy_id: entry.strategy_id.clone(),
        broker_id: entry.broker_id.clone(),
        instrument: entry.instrument.clone(),
        side: exit_side,
        order_type,
        validity: Validity::Day,
        product: entry.product,
        qty: entry.qty,
        price,
        trigger_price: trigger,
        group_id: Some(group_id),
        parent_id: Some(entry.order_id),
        broker_order_id: None,
        state: OrderState::Pending,
        filled_qty: 0,
        avg_fill_price: None,
        reject_reason: None,
        created_at: now,
        updated_at: now,
    };

    BracketExits {
        target: exit(OrderType::Limit, Some(spec.target_price), None),
        stop: exit(OrderType::StopLossMarket, None, Some(spec.stop_trigger)),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
