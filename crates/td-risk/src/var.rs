//! Value-at-Risk estimators.
//!
//! Both estimators return a loss fraction at 1e-4 percent scale (positive =
//! loss). The gate multiplies the fraction by the projected gross notional
//! to get a money figure.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Historical simulation: the VaR at `confidence_pct` is the loss at the
/// `(100 - confidence)` percentile of the observed return distribution.
///
/// Returns 0 when the history is empty (no evidence of loss — the caller's
/// limit record decides whether that is acceptable).
pub fn historical_var_pct_e4(returns_pct_e4: &[i64], confidence_pct: u8) -> i64 {
    if returns_pct_e4.is_empty() {
        return 0;
    }
    let mut sorted: Vec<i64> = returns_pct_e4.to_vec();
    sorted.sort_unstable();

    // A loss is a negative return; VaR is reported as a positive magnitude.
    (-sorted[tail_index(sorted.len(), confidence_pct)]).max(0)
}

/// Monte Carlo: draw `paths` normal returns calibrated to the sample mean
/// and standard deviation of the history, then take the same tail quantile.
///
/// The RNG is seeded explicitly so the estimate is reproducible run to run.
pub fn monte_carlo_var_pct_e4(
    returns_pct_e4: &[i64],
    confidence_pct: u8,
    paths: u32,
    seed: u64,
) -> i64 {
    if returns_pct_e4.is_empty() || paths == 0 {
        return 0;
    }

    let n = returns_pct_e4.len() as f64;
    let mean = returns_pct_e4.iter().map(|&r| r as f64).sum::<f64>() / n;
    let var = returns_pct_e4
        .iter()
        .map(|&r| {
            let d = r as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    let std = var.sqrt();

    let mut rng = StdRng::seed_from_u64(seed);
    let mut simulated: Vec<i64> = (0..paths)
        .map(|_| (mean + std * standard_normal(&mut rng)) as i64)
        .collect();
    simulated.sort_unstable();

    (-simulated[tail_index(simulated.len(), confidence_pct)]).max(0)
}

/// Index of the `(100 - confidence)`-percentile observation in an ascending
/// sort. The tail is inclusive of its boundary: with 100 samples at 99 %
/// confidence this is the single worst observation.
fn tail_index(len: usize, confidence_pct: u8) -> usize {
    let tail = (100u32.saturating_sub(confidence_pct as u32)) as usize;
    (len * tail / 100).saturating_sub(1).min(len - 1)
}

/// Box–Muller transform over two uniforms.
fn standard_normal(rng: &mut StdRng) -> f64 {
    // Guard the log: u1 ∈ (0, 1].
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}
