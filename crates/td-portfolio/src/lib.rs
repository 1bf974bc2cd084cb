//! td-portfolio — fold execution fills into positions and holdings.
//!
//! Pure deterministic logic, no IO:
//! - positions keep cumulative buy/sell legs with volume-weighted averages
//! - realized P&L is recognized when a fill reduces |net_qty|
//! - delivery (CNC) settlement moves quantity and cost basis into holdings
//! - unrealized P&L is derived from marks on demand, never stored as truth

use std::collections::BTreeMap;

use td_schemas::{Amount, Fill, Holding, InstrumentKey, Position, PositionKey, Side};

mod reduce;

pub use reduce::{apply_fill_to_position, vwap_merge};

/// symbol-level mark map used for unrealized P&L.
pub type MarkMap = BTreeMap<InstrumentKey, Amount>;

/// In-memory book: the single-writer view the coordinator owns. The store
/// persists snapshots of this; queries never flow the other way.
#[derive(Clone, Debug, Default)]
pub struct PortfolioBook {
    pub positions: BTreeMap<PositionKey, Position>,
    /// Keyed `(broker_id, instrument)`.
    pub holdings: BTreeMap<(String, InstrumentKey), Holding>,
}

impl PortfolioBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one fill to the matching position, creating it if absent.
    /// Returns the realized P&L recognized by this fill.
    pub fn apply_fill(&mut self, fill: &Fill) -> Amount {
        let key = PositionKey::new(
            fill.broker_id.clone(),
            fill.instrument.clone(),
            fill.product,
        );
        let pos = self
            .positions
            .entry(key.clone())
            .or_insert_with(|| Position::flat(key));
        apply_fill_to_position(pos, fill)
    }

    /// Settle all delivery (CNC) positions into holdings.
    ///
    /// A net-long CNC position moves its net quantity and cost basis into
    /// the holding (volume-weighted merge). A net-short CNC position means
    /// delivered stock was sold: the holding quantity is reduced, floored at
    /// zero. Settled positions are removed from the intraday book.
    pub fn settle_delivery(&mut self) {
        let cnc_keys: Vec<PositionKey> = self
            .positions
            .keys()
            .filter(|k| k.product.is_delivery())
            .cloned()
            .collect();

        for key in cnc_keys {
            let pos = match self.positions.remove(&key) {
                Some(p) => p,
                None => continue,
            };
            let net = pos.net_qty();
            let hkey = (key.broker_id.clone(), key.instrument.clone());

            if net > 0 {
                let holding = self.holdings.entry(hkey).or_insert_with(|| Holding {
                    broker_id: key.broker_id.clone(),
                    instrument: key.instrument.clone(),
                    qty: 0,
                    avg_cost: Amount::ZERO,
                    last_traded_price: Amount::ZERO,
                });
                holding.avg_cost = vwap_merge(holding.avg_cost, holding.qty, pos.buy_avg, net);
                holding.qty += net;
            } else if net < 0 {
                if let Some(holding) = self.holdings.get_mut(&hkey) {
                    holding.qty = (holding.qty + net).max(0);
                    if holding.qty == 0 {
                        holding.avg_cost = Amount::ZERO;
                    }
                }
            }
        }
    }

    /// Total realized P&L across all positions.
    pub fn realized_pnl(&self) -> Amount {
        self.positions.values().map(|p| p.realized_pnl).sum()
    }

    /// Derive unrealized P&L for every open position from the given marks.
    /// Positions without a mark are skipped (no evidence, no number).
    pub fn refresh_unrealized(&mut self, marks: &MarkMap) {
        for pos in self.positions.values_mut() {
            let mark = match marks.get(&pos.key.instrument) {
                Some(m) => *m,
                None => continue,
            };
            pos.unrealized_pnl = unrealized_for(pos, mark);
        }
    }

    /// Update holding marks (`last_traded_price`) from market data.
    pub fn refresh_holding_marks(&mut self, marks: &MarkMap) {
        for h in self.holdings.values_mut() {
            if let Some(m) = marks.get(&h.instrument) {
                h.last_traded_price = *m;
            }
        }
    }

    /// Gross notional across open positions at their entry averages.
    pub fn gross_notional(&self) -> Amount {
        self.positions
            .values()
            .map(|p| {
                let net = p.net_qty();
                let avg = if net >= 0 { p.buy_avg } else { p.sell_avg };
                avg.checked_mul_qty(net.abs()).unwrap_or(Amount::MAX)
            })
            .sum()
    }
}

fn unrealized_for(pos: &Position, mark: Amount) -> Amount {
    let net = pos.net_qty();
    if net > 0 {
        (mark - pos.buy_avg).checked_mul_qty(net).unwrap_or(Amount::MAX)
    } else if net < 0 {
        (pos.sell_avg - mark)
            .checked_mul_qty(-net)
            .unwrap_or(Amount::MAX)
    } else {
        Amount::ZERO
    }
}
