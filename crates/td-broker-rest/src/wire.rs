//! Wire DTOs and normalization into the core vocabulary.
//!
//! Prices cross this boundary as two-decimal floats (what the venue's JSON
//! carries) and are converted to fixed-point [`Amount`] immediately; nothing
//! above this module ever sees a float rupee.

use serde::{Deserialize, Serialize};

use td_broker::{BrokerHoldingSnapshot, BrokerOrderSnapshot, BrokerPositionSnapshot};
use td_schemas::{Amount, InstrumentKey, OrderState, ProductType, Side};

pub fn amount_from_wire(v: f64) -> Amount {
    Amount::from_units((v * 10_000.0).round() as i64)
}

pub fn amount_to_wire(a: Amount) -> f64 {
    a.units() as f64 / 10_000.0
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct TokenRequest<'a> {
    pub api_key: &'a str,
    pub api_secret: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct PlaceOrderRequest {
    pub exchange: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub validity: String,
    pub product: String,
    pub quantity: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_price: Option<f64>,
    /// Echoed back by the venue; lets reconciliation correlate.
    pub client_ref: String,
}

#[derive(Debug, Serialize)]
pub struct ModifyOrderRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct PlaceOrderResponse {
    pub order_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Read models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct WireOrder {
    pub order_id: String,
    pub exchange: String,
    pub symbol: String,
    pub side: String,
    pub status: String,
    pub quantity: i64,
    pub filled_quantity: i64,
    pub average_price: Option<f64>,
    pub price: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WirePosition {
    pub exchange: String,
    pub symbol: String,
    pub product: String,
    pub net_quantity: i64,
    pub average_price: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireHolding {
    pub exchange: String,
    pub symbol: String,
    pub quantity: i64,
    pub average_cost: f64,
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Serialize any canonical enum to its wire spelling (the serde name).
pub fn enum_wire<T: serde::Serialize>(v: &T) -> String {
    match serde_json::to_value(v) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

pub fn side_to_wire(side: Side) -> &'static str {
    match side {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}

pub fn side_from_wire(s: &str) -> Option<Side> {
    match s {
        "BUY" | "B" => Some(Side::Buy),
        "SELL" | "S" => Some(Side::Sell),
        _ => None,
    }
}

pub fn product_to_wire(p: ProductType) -> &'static str {
    match p {
        ProductType::Mis => "MIS",
        ProductType::Cnc => "CNC",
        ProductType::Nrml => "NRML",
    }
}

pub fn product_from_wire(s: &str) -> Option<ProductType> {
    match s {
        "MIS" => Some(ProductType::Mis),
        "CNC" => Some(ProductType::Cnc),
        "NRML" => Some(ProductType::Nrml),
        _ => None,
    }
}

/// Venue order statuses onto the core lifecycle. Unknown strings map to
/// `None`; the caller logs and skips rather than inventing a state.
pub fn state_from_wire(s: &str) -> Option<OrderState> {
    match s {
        "OPEN" | "ACCEPTED" | "TRIGGER_PENDING" => Some(OrderState::Submitted),
        "PARTIALLY_FILLED" => Some(OrderState::PartiallyFilled),
        "COMPLETE" | "FILLED" => Some(OrderState::Filled),
        "CANCELLED" => Some(OrderState::Cancelled),
        "REJECTED" => Some(OrderState::Rejected),
        "EXPIRED" | "LAPSED" => Some(OrderState::Expired),
        _ => None,
    }
}

pub fn order_snapshot_from_wire(w: &WireOrder) -> Option<BrokerOrderSnapshot> {
    Some(BrokerOrderSnapshot {
        broker_order_id: w.order_id.clone(),
        instrument: InstrumentKey::new(w.exchange.clone(), w.symbol.clone()),
        side: side_from_wire(&w.side)?,
        state: state_from_wire(&w.status)?,
        qty: w.quantity,
        filled_qty: w.filled_quantity,
        avg_fill_price: w.average_price.map(amount_from_wire),
        price: w.price.map(amount_from_wire),
    })
}

pub fn position_snapshot_from_wire(w: &WirePosition) -> Option<BrokerPositionSnapshot> {
    Some(BrokerPositionSnapshot {
        instrument: InstrumentKey::new(w.exchange.clone(), w.symbol.clone()),
        product: product_from_wire(&w.product)?,
        net_qty: w.net_quantity,
        avg_price: amount_from_wire(w.average_price),
    })
}

pub fn holding_snapshot_from_wire(w: &WireHolding) -> BrokerHoldingSnapshot {
    BrokerHoldingSnapshot {
        instrument: InstrumentKey::new(w.exchange.clone(), w.symbol.clone()),
        qty: w.quantity,
        avg_cost: amount_from_wire(w.average_cost),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_round_trips_two_decimal_wire_values() {
        let a = amount_from_wire(123.45);
        assert_eq!(a, Amount::from_paise(12_345));
        assert!((amount_to_wire(a) - 123.45).abs() < 1e-9);
    }

    #[test]
    fn state_normalization_covers_venue_spellings() {
        assert_eq!(state_from_wire("OPEN"), Some(OrderState::Submitted));
        assert_eq!(state_from_wire("COMPLETE"), Some(OrderState::Filled));
        assert_eq!(state_from_wire("LAPSED"), Some(OrderState::Expired));
        assert_eq!(state_from_wire("???"), None);
    }

    #[test]
    fn unknown_side_is_not_guessed() {
        assert_eq!(side_from_wire("SHORT"), None);
    }

    #[test]
    fn wire_order_with_unknown_status_is_skipped() {
        let w = WireOrder {
            order_id: "X1".into(),
            exchange: "NSE".into(),
            symbol: "SBIN".into(),
            side: "BUY".into(),
            status: "WEIRD".into(),
            quantity: 10,
            filled_quantity: 0,
            average_price: None,
            price: Some(100.0),
        };
        assert!(order_snapshot_from_wire(&w).is_none());
    }
}
