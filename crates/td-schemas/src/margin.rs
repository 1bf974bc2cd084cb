//! Versioned margin rule records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::instrument::InstrumentKey;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarginType {
    Span,
    Exposure,
    Delivery,
}

/// One versioned margin rule per `(broker, instrument, margin_type, window)`.
/// Percentages are at 1e-4 percent scale (`12_0000` = 12 %).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarginRule {
    pub rule_id: Uuid,
    pub broker_id: String,
    pub instrument: InstrumentKey,
    pub margin_type: MarginType,
    pub pct_e4: i64,
    pub effective_from: DateTime<Utc>,
    pub effective_to: Option<DateTime<Utc>>,
}

impl MarginRule {
    pub fn is_active_at(&self, t: DateTime<Utc>) -> bool {
        self.effective_from <= t && self.effective_to.map_or(true, |to| to >= t)
    }
}
