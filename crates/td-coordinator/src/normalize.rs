//! Intent normalization: the field-level checks every submission passes
//! before any gate runs. Collects all failures, not just the first.

use td_schemas::{Amount, Instrument, OrderIntent};

pub fn validate_intent(intent: &OrderIntent, instrument: &Instrument) -> Result<(), Vec<String>> {
    let mut reasons: Vec<String> = Vec::new();

    if !instrument.tradable {
        reasons.push(format!("instrument {} is not tradable", instrument.key));
    }

    if intent.qty <= 0 {
        reasons.push(format!("qty must be positive, got {}", intent.qty));
    } else if instrument.lot_size > 1 && intent.qty % instrument.lot_size != 0 {
        reasons.push(format!(
            "qty {} is not a multiple of lot size {}",
            intent.qty, instrument.lot_size
        ));
    }

    match (intent.order_type.requires_price(), intent.price) {
        (true, None) => reasons.push(format!("{:?} order requires a price", intent.order_type)),
        (true, Some(p)) => {
            if p <= Amount::ZERO {
                reasons.push(format!("price must be positive, got {p}"));
            } else if !p.is_tick_aligned(instrument.tick_size) {
                reasons.push(format!(
                    "price {p} not aligned to tick {}",
                    instrument.tick_size
                ));
            }
        }
        (false, Some(_)) => {
            reasons.push(format!("{:?} order must not carry a price", intent.order_type))
        }
        (false, None) => {}
    }

    match (intent.order_type.requires_trigger(), intent.trigger_price) {
        (true, None) => reasons.push(format!(
            "{:?} order requires a trigger price",
            intent.order_type
        )),
        (true, Some(t)) if t <= Amount::ZERO => {
            reasons.push(format!("trigger price must be positive, got {t}"))
        }
        _ => {}
    }

    if let Some(visible) = intent.iceberg_visible_qty {
        if visible < 1 || visible > intent.qty {
            reasons.push(format!(
                "iceberg visible qty {visible} outside [1, {}]",
                intent.qty
            ));
        }
    }

    if let Some(b) = &intent.bracket {
        if b.target_price <= Amount::ZERO || b.stop_trigger <= Amount::ZERO {
            reasons.push("bracket exit prices must be positive".to_string());
        }
    }

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(reasons)
    }
}
