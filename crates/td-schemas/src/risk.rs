//! Risk limit records.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::instrument::InstrumentKey;

/// Where a limit applies. Narrower scopes override wider ones for the same
/// [`LimitKind`]: Instrument beats Strategy beats Portfolio.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum LimitScope {
    Portfolio,
    Strategy { strategy_id: String },
    Instrument { instrument: InstrumentKey },
}

impl LimitScope {
    /// Specificity rank used for override resolution; higher wins.
    pub fn rank(&self) -> u8 {
        match self {
            LimitScope::Portfolio => 0,
            LimitScope::Strategy { .. } => 1,
            LimitScope::Instrument { .. } => 2,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    PositionSize,
    Notional,
    Drawdown,
    Var,
    Concentration,
}

/// A scoped constraint record.
///
/// `limit_value`/`current_value` units depend on `kind`: whole shares for
/// `PositionSize`, 1e-4 money units for `Notional`/`Drawdown`/`Var`, 1e-4
/// percent for `Concentration`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskLimit {
    pub limit_id: Uuid,
    pub scope: LimitScope,
    pub kind: LimitKind,
    pub limit_value: i64,
    pub current_value: i64,
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_rank_ordering() {
        let p = LimitScope::Portfolio;
        let s = LimitScope::Strategy {
            strategy_id: "momo".into(),
        };
        let i = LimitScope::Instrument {
            instrument: InstrumentKey::new("NSE", "SBIN"),
        };
        assert!(i.rank() > s.rank());
        assert!(s.rank() > p.rank());
    }
}
