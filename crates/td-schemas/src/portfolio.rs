//! Position and holding records.
//!
//! Positions carry cumulative buy/sell legs so volume-weighted averages can
//! be maintained incrementally; `net_qty` is always derived, never stored
//! independently.

use serde::{Deserialize, Serialize};

use crate::instrument::InstrumentKey;
use crate::money::Amount;
use crate::order::ProductType;

/// Identity of a position: `(broker, instrument, product_type)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub broker_id: String,
    pub instrument: InstrumentKey,
    pub product: ProductType,
}

impl PositionKey {
    pub fn new(broker_id: impl Into<String>, instrument: InstrumentKey, product: ProductType) -> Self {
        Self {
            broker_id: broker_id.into(),
            instrument,
            product,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub key: PositionKey,
    pub buy_qty: i64,
    pub buy_avg: Amount,
    pub sell_qty: i64,
    pub sell_avg: Amount,
    pub realized_pnl: Amount,
    /// Refreshed from market data; derived, never authoritative.
    pub unrealized_pnl: Amount,
}

impl Position {
    pub fn flat(key: PositionKey) -> Self {
        Self {
            key,
            buy_qty: 0,
            buy_avg: Amount::ZERO,
            sell_qty: 0,
            sell_avg: Amount::ZERO,
            realized_pnl: Amount::ZERO,
            unrealized_pnl: Amount::ZERO,
        }
    }

    /// `net_qty = buy_qty − sell_qty`; positive = long.
    pub fn net_qty(&self) -> i64 {
        self.buy_qty - self.sell_qty
    }

    pub fn is_flat(&self) -> bool {
        self.net_qty() == 0
    }
}

/// Delivered equity: identity `(broker, instrument)`, quantity never negative.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub broker_id: String,
    pub instrument: InstrumentKey,
    pub qty: i64,
    pub avg_cost: Amount,
    pub last_traded_price: Amount,
}

impl Holding {
    pub fn current_value(&self) -> Amount {
        self.last_traded_price
            .checked_mul_qty(self.qty)
            .unwrap_or(Amount::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> PositionKey {
        PositionKey::new("paper", InstrumentKey::new("NSE", "SBIN"), ProductType::Mis)
    }

    #[test]
    fn net_qty_is_buy_minus_sell() {
        let mut p = Position::flat(key());
        p.buy_qty = 100;
        p.sell_qty = 30;
        assert_eq!(p.net_qty(), 70);
        assert!(!p.is_flat());
    }

    #[test]
    fn holding_value_is_qty_times_ltp() {
        let h = Holding {
            broker_id: "paper".into(),
            instrument: InstrumentKey::new("NSE", "SBIN"),
            qty: 10,
            avg_cost: Amount::from_rupees(500),
            last_traded_price: Amount::from_rupees(550),
        };
        assert_eq!(h.current_value(), Amount::from_rupees(5_500));
    }
}
