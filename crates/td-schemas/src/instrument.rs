//! Instrument master records.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::money::Amount;

/// Identity of a tradable instrument: `(exchange, symbol)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstrumentKey {
    pub exchange: String,
    pub symbol: String,
}

impl InstrumentKey {
    pub fn new(exchange: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
        }
    }
}

impl std::fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstrumentType {
    Equity,
    Future,
    Option,
    Currency,
    Commodity,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptionKind {
    Call,
    Put,
}

/// One row of the exchange instrument master. Immutable between refreshes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub key: InstrumentKey,
    pub instrument_type: InstrumentType,
    /// Contract multiplier; 1 for cash equity.
    pub lot_size: i64,
    pub tick_size: Amount,
    pub expiry: Option<NaiveDate>,
    pub strike: Option<Amount>,
    pub option_kind: Option<OptionKind>,
    pub tradable: bool,
}

impl Instrument {
    /// Cash-equity convenience constructor (lot 1, 5 paise tick).
    pub fn equity(exchange: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            key: InstrumentKey::new(exchange, symbol),
            instrument_type: InstrumentType::Equity,
            lot_size: 1,
            tick_size: Amount::from_paise(5),
            expiry: None,
            strike: None,
            option_kind: None,
            tradable: true,
        }
    }

    pub fn is_derivative(&self) -> bool {
        matches!(
            self.instrument_type,
            InstrumentType::Future | InstrumentType::Option
        )
    }

    pub fn is_long_option(&self, side: crate::order::Side) -> bool {
        self.instrument_type == InstrumentType::Option && side == crate::order::Side::Buy
    }
}
