//! # Value-Based Pricing
//!
//! Two notions of the price a therapy can carry and remain worth adopting:
//!
//! - The value-based price: the list price at which the therapy's expected
//!   incremental NMB against the base comparator is exactly zero.
//! - The probability threshold: the highest price at which the therapy is
//!   still at least as often the per-draw optimum as its best competitor,
//!   found by bisection.
//!
//! Both work on the price-adjusted cost `K` (cost with the list price
//! removed), so a candidate price `p` gives the therapy a cost of `K + p`.

use crate::data::psa::{PsaError, PsaTable};
use crate::grid::{GridError, validate_lambdas};
use crate::nmb::{OptimalSelector, TieBreak, first_argmax, nmb_matrix};
use crate::progress::{AnalysisProgressObserver, AnalysisStage};
use itertools::Itertools;
use ndarray::{Array1, ArrayView2, Axis, Zip};
use rayon::prelude::*;
use std::collections::BTreeMap;
use thiserror::Error;

/// Bisection steps used by [`probability_threshold`].
pub const BISECTION_ITERATIONS: usize = 50;

#[derive(Error, Debug)]
pub enum VbpError {
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error(transparent)]
    Psa(#[from] PsaError),
    #[error("Strategy index {index} is out of range for {n_strategies} strategies.")]
    StrategyOutOfRange { index: usize, n_strategies: usize },
    #[error("Price bounds must be finite with lower <= upper (found [{lower}, {upper}]).")]
    InvalidPriceBounds { lower: f64, upper: f64 },
    #[error("The PSA table carries no price adjustment; a focal strategy with a list price is required.")]
    MissingPriceAdjustment,
    #[error("The PSA table has no draws.")]
    NoDraws,
    #[error("The price grid must be non-empty and finite.")]
    InvalidPrices,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VbpPoint {
    pub therapy: String,
    pub lambda: f64,
    pub threshold_price: f64,
    pub probability_ce: f64,
    pub base_strategy: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdPrice {
    pub therapy: String,
    pub lambda: f64,
    pub threshold_price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceProbability {
    pub therapy: String,
    pub lambda: f64,
    pub price: f64,
    pub probability: f64,
}

/// `wtp · expected_qaly − expected_cost`, with both expectations taken as
/// increments against the comparator over aligned draws.
pub fn value_based_price(expected_cost: f64, expected_qaly: f64, wtp: f64) -> f64 {
    wtp * expected_qaly - expected_cost
}

/// Highest price adjustment `p` in `price_bounds` at which the strategy in
/// column `strategy_index` of `nb_matrix` (NMB at zero price, `[draw, strategy]`)
/// has a per-draw vote share at least as large as every competitor's.
///
/// Returns `NaN` when even the lower bound is infeasible and the upper bound
/// itself when it is still feasible.
pub fn probability_threshold(
    nb_matrix: ArrayView2<'_, f64>,
    strategy_index: usize,
    price_bounds: (f64, f64),
) -> Result<f64, VbpError> {
    let (lower, upper) = price_bounds;
    if !(lower.is_finite() && upper.is_finite()) || lower > upper {
        return Err(VbpError::InvalidPriceBounds { lower, upper });
    }
    let n_strategies = nb_matrix.ncols();
    if strategy_index >= n_strategies {
        return Err(VbpError::StrategyOutOfRange {
            index: strategy_index,
            n_strategies,
        });
    }
    if nb_matrix.nrows() == 0 {
        return Err(VbpError::NoDraws);
    }

    let feasible = |price: f64| {
        let shares = vote_shares(nb_matrix, strategy_index, price);
        let best_competitor = shares
            .iter()
            .enumerate()
            .filter(|&(idx, _)| idx != strategy_index)
            .map(|(_, &share)| share)
            .fold(0.0, f64::max);
        shares[strategy_index] >= best_competitor
    };

    if !feasible(lower) {
        return Ok(f64::NAN);
    }
    if feasible(upper) {
        return Ok(upper);
    }
    let (mut lo, mut hi) = (lower, upper);
    for _ in 0..BISECTION_ITERATIONS {
        let mid = 0.5 * (lo + hi);
        if feasible(mid) {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

/// Number of draws won by each strategy when `strategy_index` pays `price`.
fn vote_shares(nb_matrix: ArrayView2<'_, f64>, strategy_index: usize, price: f64) -> Array1<f64> {
    let mut counts = Array1::<f64>::zeros(nb_matrix.ncols());
    let mut adjusted = Array1::<f64>::zeros(nb_matrix.ncols());
    for row in nb_matrix.outer_iter() {
        adjusted.assign(&row);
        adjusted[strategy_index] -= price;
        counts[first_argmax(adjusted.view())] += 1.0;
    }
    counts / nb_matrix.nrows() as f64
}

/// Value-based price and probability of cost-effectiveness at list price for
/// every non-base therapy and willingness-to-pay.
///
/// Each therapy's `K` is its cost minus its configured list price; therapies
/// without a configured price are treated as priced at zero.
pub fn vbp_curves(
    table: &PsaTable,
    base: &str,
    lambdas: &[f64],
    prices: &BTreeMap<String, f64>,
) -> Result<Vec<VbpPoint>, VbpError> {
    validate_lambdas(lambdas)?;
    if table.n_draws() == 0 {
        return Err(VbpError::NoDraws);
    }
    let base_idx = table.require_strategy(base)?;
    let n_draws = table.n_draws() as f64;
    let base_cost = table.cost_of(base_idx).sum() / n_draws;
    let base_effect = table.effect_of(base_idx).sum() / n_draws;

    let mut points = Vec::with_capacity((table.n_strategies() - 1) * lambdas.len());
    for (idx, therapy) in table.strategies().iter().enumerate() {
        if idx == base_idx {
            continue;
        }
        let list_price = match prices.get(therapy) {
            Some(&price) => price,
            None => {
                log::warn!("No list price configured for '{therapy}'; value-based price is reported as an increment over current cost");
                0.0
            }
        };
        let delta_k = table.cost_of(idx).sum() / n_draws - list_price - base_cost;
        let delta_e = table.effect_of(idx).sum() / n_draws - base_effect;

        for &lambda in lambdas {
            let mut wins = 0usize;
            Zip::from(table.cost_of(idx))
                .and(table.effect_of(idx))
                .and(table.cost_of(base_idx))
                .and(table.effect_of(base_idx))
                .for_each(|&cs, &es, &cb, &eb| {
                    if lambda * es - cs >= lambda * eb - cb {
                        wins += 1;
                    }
                });
            points.push(VbpPoint {
                therapy: therapy.clone(),
                lambda,
                threshold_price: value_based_price(delta_k, delta_e, lambda),
                probability_ce: wins as f64 / n_draws,
                base_strategy: base.to_string(),
            });
        }
    }
    Ok(points)
}

/// Probability-threshold price of the focal strategy at every willingness-to-pay.
pub fn threshold_price_curve(
    table: &PsaTable,
    lambdas: &[f64],
    price_bounds: (f64, f64),
    progress: &mut dyn AnalysisProgressObserver,
) -> Result<Vec<ThresholdPrice>, VbpError> {
    validate_lambdas(lambdas)?;
    let adjustment = table.adjustment().ok_or(VbpError::MissingPriceAdjustment)?;
    let therapy = &table.strategies()[adjustment.focal];
    let stage = AnalysisStage::PriceThresholdSearch;

    progress.on_stage_start(stage, lambdas.len());
    let mut curve = Vec::with_capacity(lambdas.len());
    for (step, &lambda) in lambdas.iter().enumerate() {
        let nb = nmb_matrix(adjustment.k.view(), table.effect(), lambda);
        let threshold_price = probability_threshold(nb.view(), adjustment.focal, price_bounds)?;
        log::debug!("Threshold price for '{therapy}' at lambda = {lambda}: {threshold_price}");
        curve.push(ThresholdPrice {
            therapy: therapy.clone(),
            lambda,
            threshold_price,
        });
        progress.on_stage_advance(stage, step + 1);
    }
    progress.on_stage_finish(stage);
    Ok(curve)
}

/// For every willingness-to-pay and candidate price, the fraction of draws in
/// which the focal strategy charging that price is the per-draw optimum.
pub fn price_probability_curve(
    table: &PsaTable,
    lambdas: &[f64],
    prices: &[f64],
    policy: TieBreak,
) -> Result<Vec<PriceProbability>, VbpError> {
    validate_lambdas(lambdas)?;
    if prices.is_empty() || prices.iter().any(|p| !p.is_finite()) {
        return Err(VbpError::InvalidPrices);
    }
    let adjustment = table.adjustment().ok_or(VbpError::MissingPriceAdjustment)?;
    if table.n_draws() == 0 {
        return Err(VbpError::NoDraws);
    }
    let focal = adjustment.focal;
    let therapy = &table.strategies()[focal];
    let selector = OptimalSelector::new(table.strategies(), Some(focal), policy);
    let n_draws = table.n_draws() as f64;

    let grid: Vec<(f64, f64)> = lambdas
        .iter()
        .copied()
        .cartesian_product(prices.iter().copied())
        .collect();
    let points = grid
        .par_iter()
        .map(|&(lambda, price)| {
            let mut nb = nmb_matrix(adjustment.k.view(), table.effect(), lambda);
            nb.column_mut(focal).mapv_inplace(|v| v - price);
            let wins = nb
                .axis_iter(Axis(0))
                .filter(|row| selector.select(row.view()) == focal)
                .count();
            PriceProbability {
                therapy: therapy.clone(),
                lambda,
                price,
                probability: wins as f64 / n_draws,
            }
        })
        .collect();
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::recording::RecordingProgress;
    use crate::test_fixtures::{constant_two_strategy_table, noisy_three_strategy_table};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn ketamine_prices(price: f64) -> BTreeMap<String, f64> {
        BTreeMap::from([("Ketamine".to_string(), price)])
    }

    #[test]
    fn value_based_price_is_wtp_times_effect_minus_cost() {
        assert_eq!(value_based_price(400.0, 0.4, 50_000.0), 19_600.0);
        assert_eq!(value_based_price(400.0, 0.0, 50_000.0), -400.0);
    }

    #[test]
    fn vbp_curve_drives_expected_incremental_nmb_to_zero() {
        let table = constant_two_strategy_table(100);
        let points = vbp_curves(&table, "Usual care", &[50_000.0], &ketamine_prices(300.0))
            .expect("vbp");
        assert_eq!(points.len(), 1);
        let point = &points[0];
        assert_eq!(point.therapy, "Ketamine");
        assert_eq!(point.base_strategy, "Usual care");
        // K = 1100, ΔK = 100, ΔE = 0.4.
        assert_abs_diff_eq!(point.threshold_price, 19_900.0, epsilon = 1e-6);
        assert_eq!(point.probability_ce, 1.0);

        // Paying exactly the threshold price gives zero incremental NMB.
        let k = 1400.0 - 300.0;
        let nmb_ketamine = 50_000.0 * 2.4 - (k + point.threshold_price);
        let nmb_usual = 50_000.0 * 2.0 - 1000.0;
        assert_abs_diff_eq!(nmb_ketamine, nmb_usual, epsilon = 1e-6);
    }

    #[test]
    fn threshold_is_upper_bound_when_still_feasible() {
        let nb = array![[10.0, 0.0], [10.0, 0.0]];
        assert_eq!(probability_threshold(nb.view(), 0, (0.0, 5.0)).expect("threshold"), 5.0);
    }

    #[test]
    fn threshold_is_nan_when_infeasible_at_lower_bound() {
        let nb = array![[0.0, 10.0], [0.0, 10.0]];
        assert!(
            probability_threshold(nb.view(), 0, (0.0, 5.0))
                .expect("threshold")
                .is_nan()
        );
    }

    #[test]
    fn bisection_converges_to_the_vote_share_crossing() {
        // The focal strategy leads by 10 in every draw; at price > 10 it loses
        // every draw, at price <= 10 the tie goes to the first column.
        let nb = array![[110.0, 100.0], [60.0, 50.0], [20.0, 10.0]];
        let threshold = probability_threshold(nb.view(), 0, (0.0, 100.0)).expect("threshold");
        assert_abs_diff_eq!(threshold, 10.0, epsilon = 1e-9);
    }

    #[test]
    fn invalid_threshold_inputs_are_rejected() {
        let nb = array![[1.0, 2.0]];
        assert!(matches!(
            probability_threshold(nb.view(), 2, (0.0, 1.0)),
            Err(VbpError::StrategyOutOfRange { .. })
        ));
        assert!(matches!(
            probability_threshold(nb.view(), 0, (1.0, 0.0)),
            Err(VbpError::InvalidPriceBounds { .. })
        ));
    }

    #[test]
    fn threshold_curve_reports_progress_per_lambda() {
        let table = noisy_three_strategy_table(200, 17)
            .with_price_adjusted_cost("Ketamine", 250.0)
            .expect("adjusted");
        let mut progress = RecordingProgress::default();
        let curve =
            threshold_price_curve(&table, &[10_000.0, 20_000.0], (0.0, 50_000.0), &mut progress)
                .expect("curve");
        assert_eq!(curve.len(), 2);
        assert!(curve.iter().all(|p| p.therapy == "Ketamine"));
        assert!(
            curve
                .iter()
                .all(|p| p.threshold_price.is_finite() && p.threshold_price > 0.0)
        );
        let stage = AnalysisStage::PriceThresholdSearch;
        assert_eq!(progress.events.first(), Some(&(stage, "start", 2)));
        assert_eq!(progress.events.last(), Some(&(stage, "finish", 0)));
        assert_eq!(progress.events.len(), 4);
    }

    #[test]
    fn price_probability_falls_as_price_rises() {
        let table = noisy_three_strategy_table(300, 23)
            .with_price_adjusted_cost("Ketamine", 250.0)
            .expect("adjusted");
        let prices = [0.0, 5_000.0, 20_000.0, 100_000.0];
        let points = price_probability_curve(&table, &[50_000.0], &prices, TieBreak::Declared)
            .expect("curve");
        assert_eq!(points.len(), prices.len());
        assert!(points.windows(2).all(|w| w[0].probability >= w[1].probability));
        assert_eq!(points[3].probability, 0.0);
    }

    #[test]
    fn price_curves_need_a_price_adjustment() {
        let table = constant_two_strategy_table(3);
        assert!(matches!(
            price_probability_curve(&table, &[1.0], &[0.0], TieBreak::Declared),
            Err(VbpError::MissingPriceAdjustment)
        ));
        let mut progress = crate::progress::NoopProgress;
        assert!(matches!(
            threshold_price_curve(&table, &[1.0], (0.0, 1.0), &mut progress),
            Err(VbpError::MissingPriceAdjustment)
        ));
    }
}
