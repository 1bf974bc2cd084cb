//! Fixed-point money type.
//!
//! # Motivation
//!
//! All money amounts and prices in this system use a 1e-4 fixed-point
//! representation stored as `i64`. Using raw `i64` for money is error-prone:
//! it allows accidental arithmetic with unrelated integers (quantities, IDs,
//! sequence numbers) without any compile-time signal.
//!
//! `Amount` wraps the raw `i64` so the type system prevents:
//! - Implicit construction from raw `i64` (no `From<i64>` impl).
//! - Mixing `Amount` with unrelated `i64` values in arithmetic.
//!
//! # Scale
//!
//! 1 rupee = 10_000 units. Exchange prices carry at most two decimals, so the
//! extra two digits leave headroom for percentage components (fees, margin
//! rates) computed before the final half-up rounding to two decimals.
//!
//! # Arithmetic
//!
//! - `Add`, `Sub`, `Neg`, `AddAssign`, `SubAssign` are closed over `Amount`.
//! - `saturating_add` / `saturating_sub` clamp at the `i64` limits.
//! - `checked_mul_qty(qty)` multiplies a per-unit price by an integer
//!   quantity via `i64::checked_mul`. Callers must handle `None`
//!   explicitly; overflow in a trade-value calculation is a critical
//!   error, not a routine saturation. (Percentage math in `mul_pct_e4`
//!   is the one place an `i128` intermediate is needed.)

use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

use serde::{Deserialize, Serialize};

/// Fixed-point scale: 1 rupee = 10_000 units.
pub const AMOUNT_SCALE: i64 = 10_000;

/// A fixed-point monetary amount at 1e-4 scale.
///
/// # Construction
///
/// Use [`Amount::from_units`] for explicit construction from raw units,
/// [`Amount::from_rupees`] for whole-rupee values, or [`Amount::from_paise`]
/// when the source carries two decimals. There is intentionally no
/// `From<i64>` implementation.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);
    pub const MAX: Amount = Amount(i64::MAX);
    pub const MIN: Amount = Amount(i64::MIN);

    /// Construct from raw 1e-4 units.
    #[inline]
    pub const fn from_units(raw: i64) -> Self {
        Amount(raw)
    }

    /// Construct from whole rupees.
    #[inline]
    pub const fn from_rupees(rupees: i64) -> Self {
        Amount(rupees * AMOUNT_SCALE)
    }

    /// Construct from paise (two-decimal money, e.g. broker wire prices).
    #[inline]
    pub const fn from_paise(paise: i64) -> Self {
        Amount(paise * 100)
    }

    /// Extract the underlying raw units.
    #[inline]
    pub const fn units(self) -> i64 {
        self.0
    }

    #[inline]
    pub fn saturating_add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }

    #[inline]
    pub fn saturating_sub(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_sub(rhs.0))
    }

    /// Absolute value. `Amount::MIN.abs()` saturates to `Amount::MAX`.
    #[inline]
    pub fn abs(self) -> Amount {
        Amount(self.0.saturating_abs())
    }

    #[inline]
    pub fn signum(self) -> i64 {
        self.0.signum()
    }

    #[inline]
    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    #[inline]
    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Multiply a per-unit price by an integer quantity.
    ///
    /// Returns `None` if the product overflows `i64`.
    #[inline]
    pub fn checked_mul_qty(self, qty: i64) -> Option<Amount> {
        self.0.checked_mul(qty).map(Amount)
    }

    /// Multiply by a percentage expressed in basis points of 1e-4
    /// (`pct_e4 = 12_500` means 1.25 %). Intermediate math in `i128`,
    /// truncating division; use [`Amount::round_half_up_2dp`] afterwards when
    /// a two-decimal money value is required.
    #[inline]
    pub fn mul_pct_e4(self, pct_e4: i64) -> Amount {
        let v = (self.0 as i128) * (pct_e4 as i128) / 1_000_000i128;
        Amount(clamp_i128(v))
    }

    /// Round half-up to two decimals (the statutory money granularity).
    ///
    /// Half-up on the absolute value, sign restored afterwards, matching how
    /// contract notes round each fee component before summing.
    pub fn round_half_up_2dp(self) -> Amount {
        let sign = self.0.signum();
        let abs = self.0.saturating_abs();
        let rounded = (abs + 50) / 100 * 100;
        Amount(sign * rounded)
    }

    /// True if the value is exactly representable at two decimals.
    #[inline]
    pub fn is_2dp_aligned(self) -> bool {
        self.0 % 100 == 0
    }

    /// True if the value is an integer multiple of `tick`.
    ///
    /// A zero or negative tick never aligns (malformed instrument master).
    #[inline]
    pub fn is_tick_aligned(self, tick: Amount) -> bool {
        tick.0 > 0 && self.0 % tick.0 == 0
    }
}

fn clamp_i128(x: i128) -> i64 {
    if x > i64::MAX as i128 {
        i64::MAX
    } else if x < i64::MIN as i128 {
        i64::MIN
    } else {
        x as i64
    }
}

impl Add for Amount {
    type Output = Amount;
    #[inline]
    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl Sub for Amount {
    type Output = Amount;
    #[inline]
    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0 - rhs.0)
    }
}

impl Neg for Amount {
    type Output = Amount;
    #[inline]
    fn neg(self) -> Amount {
        Amount(-self.0)
    }
}

impl AddAssign for Amount {
    #[inline]
    fn add_assign(&mut self, rhs: Amount) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Amount {
    #[inline]
    fn sub_assign(&mut self, rhs: Amount) {
        self.0 -= rhs.0;
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, |acc, a| acc.saturating_add(a))
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let whole = self.0 / AMOUNT_SCALE;
        let frac = (self.0 % AMOUNT_SCALE).abs();
        // When |value| < 1 rupee and negative, `whole` truncates to 0 and
        // loses the sign; emit it explicitly.
        if self.0 < 0 && whole == 0 {
            write!(f, "-{whole}.{frac:04}")
        } else {
            write!(f, "{whole}.{frac:04}")
        }
    }
}
