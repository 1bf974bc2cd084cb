//! The per-fill position update.

use td_schemas::{Amount, Fill, Position, Side};

/// Volume-weighted merge of two average prices.
///
/// `(avg_a·qty_a + avg_b·qty_b) / (qty_a + qty_b)` with i128 intermediates;
/// returns `avg_b` when both quantities are zero (degenerate, new leg).
pub fn vwap_merge(avg_a: Amount, qty_a: i64, avg_b: Amount, qty_b: i64) -> Amount {
    let total = qty_a + qty_b;
    if total == 0 {
        return avg_b;
    }
    let weighted = (avg_a.units() as i128) * (qty_a as i128)
        + (avg_b.units() as i128) * (qty_b as i128);
    Amount::from_units((weighted / (total as i128)) as i64)
}

/// Fold one fill into a position.
///
/// The buy/sell legs accumulate independently with volume-weighted
/// averages; `net_qty` stays derived. Realized P&L is recognized for the
/// portion of the fill that reduces |net_qty|:
///
/// - net long, sell fill: `(sell_px − buy_avg) · reduced`
/// - net short, buy fill: `(sell_avg − buy_px) · reduced`
///
/// Returns the realized P&L recognized by this fill (also accumulated onto
/// `position.realized_pnl`).
pub fn apply_fill_to_position(position: &mut Position, fill: &Fill) -> Amount {
    debug_assert!(fill.qty > 0, "fill qty must be positive");

    let net_before = position.net_qty();

    // Realized portion: how much of this fill closes existing exposure.
    let realized = match fill.side {
        Side::Sell if net_before > 0 => {
            let reduced = fill.qty.min(net_before);
            (fill.price - position.buy_avg)
                .checked_mul_qty(reduced)
                .unwrap_or(Amount::MAX)
        }
        Side::Buy if net_before < 0 => {
            let reduced = fill.qty.min(-net_before);
            (position.sell_avg - fill.price)
                .checked_mul_qty(reduced)
                .unwrap_or(Amount::MAX)
        }
        _ => Amount::ZERO,
    };

    match fill.side {
        Side::Buy => {
            position.buy_avg = vwap_merge(position.buy_avg, position.buy_qty, fill.price, fill.qty);
            position.buy_qty += fill.qty;
        }
        Side::Sell => {
            position.sell_avg =
                vwap_merge(position.sell_avg, position.sell_qty, fill.price, fill.qty);
            position.sell_qty += fill.qty;
        }
    }

    position.realized_pnl += realized;
    realized
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use td_schemas::{InstrumentKey, PositionKey, ProductType};
    use uuid::Uuid;

    fn fill(side: Side, qty: i64, price: i64) -> Fill {
        Fill {
            fill_id: Uuid::new_v4().to_string(),
            order_id: Uuid::new_v4(),
            broker_id: "paper".into(),
            instrument: InstrumentKey::new("NSE", "SBIN"),
            side,
            product: ProductType::Mis,
            qty,
            price: Amount::from_rupees(price),
            ts: Utc::now(),
        }
    }

    fn flat() -> Position {
        Position::flat(PositionKey::new(
            "paper",
            InstrumentKey::new("NSE", "SBIN"),
            ProductType::Mis,
        ))
    }

    #[test]
    fn vwap_merge_weights_by_quantity() {
        let merged = vwap_merge(Amount::from_rupees(100), 30, Amount::from_rupees(200), 10);
        // (3000 + 2000) / 40 = 125.
        assert_eq!(merged, Amount::from_rupees(125));
    }

    #[test]
    fn vwap_merge_empty_left_leg() {
        assert_eq!(
            vwap_merge(Amount::ZERO, 0, Amount::from_rupees(500), 40),
            Amount::from_rupees(500)
        );
    }

    #[test]
    fn sell_beyond_net_realizes_only_the_closing_portion() {
        let mut p = flat();
        apply_fill_to_position(&mut p, &fill(Side::Buy, 10, 500));
        // Sell 30: 10 close (+10·20), 20 open a short leg.
        let realized = apply_fill_to_position(&mut p, &fill(Side::Sell, 30, 520));
        assert_eq!(realized, Amount::from_rupees(200));
        assert_eq!(p.net_qty(), -20);
    }

    #[test]
    fn increasing_fills_realize_nothing() {
        let mut p = flat();
        assert_eq!(
            apply_fill_to_position(&mut p, &fill(Side::Buy, 10, 500)),
            Amount::ZERO
        );
        assert_eq!(
            apply_fill_to_position(&mut p, &fill(Side::Buy, 10, 510)),
            Amount::ZERO
        );
    }
}
