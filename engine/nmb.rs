//! # Net Monetary Benefit Engine
//!
//! Builds the NMB cube `NMB[λ, draw, strategy] = λ·effect − cost`, the
//! per-λ expected NMB of every strategy, and the per-draw optimal strategy.
//!
//! Ties between strategies are resolved by an explicit [`TieBreak`] policy.
//! Two strategies are tied when their NMB values are close in the sense of
//! [`is_close`], so floating-point noise never decides a winner.

use crate::data::psa::PsaTable;
use crate::grid::{GridError, validate_lambdas};
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis, Zip};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Relative tolerance of the closeness test (numpy `isclose` default).
pub const CLOSE_RTOL: f64 = 1e-5;
/// Absolute tolerance of the closeness test (numpy `isclose` default).
pub const CLOSE_ATOL: f64 = 1e-8;

#[derive(Error, Debug)]
pub enum NmbError {
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error("Focal strategy '{0}' is not present in the PSA table.")]
    UnknownFocal(String),
    #[error("The PSA table has no strategies.")]
    NoStrategies,
}

/// `|a - b| <= atol + rtol * |b|`, asymmetric in `b` like numpy.
pub fn is_close(a: f64, b: f64) -> bool {
    (a - b).abs() <= CLOSE_ATOL + CLOSE_RTOL * b.abs()
}

/// How the per-draw optimal strategy is chosen when several strategies tie
/// with the row maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TieBreak {
    /// First maximum in column order, then the focal strategy if it is close
    /// to the maximum, then an alphabetical pass where every close strategy
    /// overwrites the choice. The last tied name alphabetically wins.
    Legacy,
    /// The focal strategy wins any tie it is part of; otherwise the
    /// lexicographically smallest tied name wins.
    #[default]
    Declared,
}

/// Resolves the optimal column of NMB rows under a fixed policy.
#[derive(Debug, Clone)]
pub struct OptimalSelector {
    policy: TieBreak,
    focal: Option<usize>,
    alphabetical: Vec<usize>,
}

impl OptimalSelector {
    pub fn new(strategies: &[String], focal: Option<usize>, policy: TieBreak) -> Self {
        let mut alphabetical: Vec<usize> = (0..strategies.len()).collect();
        alphabetical.sort_by(|&a, &b| strategies[a].cmp(&strategies[b]));
        Self {
            policy,
            focal,
            alphabetical,
        }
    }

    /// Index of the winning strategy for one row of NMB values.
    pub fn select(&self, row: ArrayView1<'_, f64>) -> usize {
        let first_max = first_argmax(row);
        let max = row[first_max];
        match self.policy {
            TieBreak::Legacy => {
                let mut best = first_max;
                if let Some(focal) = self.focal {
                    if is_close(row[focal], max) {
                        best = focal;
                    }
                }
                for &idx in &self.alphabetical {
                    if is_close(row[idx], max) {
                        best = idx;
                    }
                }
                best
            }
            TieBreak::Declared => {
                if let Some(focal) = self.focal {
                    if is_close(row[focal], max) {
                        return focal;
                    }
                }
                self.alphabetical
                    .iter()
                    .copied()
                    .find(|&idx| is_close(row[idx], max))
                    .unwrap_or(first_max)
            }
        }
    }
}

/// First index holding the maximum value.
pub fn first_argmax(values: ArrayView1<'_, f64>) -> usize {
    let mut best = 0;
    for (idx, &value) in values.iter().enumerate() {
        if value > values[best] {
            best = idx;
        }
    }
    best
}

/// `λ·effect − cost` for every draw and strategy at one willingness-to-pay.
pub fn nmb_matrix(cost: ArrayView2<'_, f64>, effect: ArrayView2<'_, f64>, lambda: f64) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros(cost.raw_dim());
    Zip::from(&mut out)
        .and(&effect)
        .and(&cost)
        .for_each(|o, &e, &c| *o = lambda * e - c);
    out
}

/// NMB values indexed `[lambda, draw, strategy]`.
#[derive(Debug, Clone, PartialEq)]
pub struct NmbCube {
    lambdas: Vec<f64>,
    draws: Vec<i64>,
    strategies: Vec<String>,
    values: Array3<f64>,
}

impl NmbCube {
    pub fn lambdas(&self) -> &[f64] {
        &self.lambdas
    }

    pub fn draws(&self) -> &[i64] {
        &self.draws
    }

    pub fn strategies(&self) -> &[String] {
        &self.strategies
    }

    pub fn values(&self) -> ArrayView3<'_, f64> {
        self.values.view()
    }

    /// `[draw, strategy]` slice for the λ at `lambda_idx`.
    pub fn at(&self, lambda_idx: usize) -> ArrayView2<'_, f64> {
        self.values.index_axis(Axis(0), lambda_idx)
    }
}

/// Output of [`compute_nmb`].
#[derive(Debug, Clone, PartialEq)]
pub struct NmbAnalysis {
    pub cube: NmbCube,
    /// Mean NMB across draws, `[lambda, strategy]`.
    pub expected: Array2<f64>,
    /// Winning strategy index per draw, `[lambda, draw]`.
    pub optimal: Array2<usize>,
}

impl NmbAnalysis {
    pub fn strategies(&self) -> &[String] {
        self.cube.strategies()
    }

    pub fn lambdas(&self) -> &[f64] {
        self.cube.lambdas()
    }

    /// Winning strategy name per draw for one λ.
    pub fn optimal_names(&self, lambda_idx: usize) -> Vec<&str> {
        self.optimal
            .row(lambda_idx)
            .iter()
            .map(|&idx| self.cube.strategies[idx].as_str())
            .collect()
    }

    /// Fraction of draws in which each strategy is optimal, `[lambda, strategy]`.
    pub fn optimal_share(&self) -> Array2<f64> {
        let n_strategies = self.cube.strategies.len();
        let n_draws = self.cube.draws.len().max(1) as f64;
        let mut share = Array2::<f64>::zeros((self.cube.lambdas.len(), n_strategies));
        for (mut out, winners) in share.outer_iter_mut().zip(self.optimal.outer_iter()) {
            for &idx in winners {
                out[idx] += 1.0;
            }
            out.mapv_inplace(|count| count / n_draws);
        }
        share
    }

    /// Strategy with the highest expected NMB at `lambda_idx` (first on ties).
    pub fn expected_best(&self, lambda_idx: usize) -> usize {
        first_argmax(self.expected.row(lambda_idx))
    }
}

/// Computes the NMB cube, expected NMB and per-draw optimal strategy.
pub fn compute_nmb(
    table: &PsaTable,
    lambdas: &[f64],
    focal: Option<&str>,
    policy: TieBreak,
) -> Result<NmbAnalysis, NmbError> {
    validate_lambdas(lambdas)?;
    if table.n_strategies() == 0 {
        return Err(NmbError::NoStrategies);
    }
    let focal_idx = match focal {
        Some(name) => Some(
            table
                .strategy_index(name)
                .ok_or_else(|| NmbError::UnknownFocal(name.to_string()))?,
        ),
        None => None,
    };

    let n_lambdas = lambdas.len();
    let (n_draws, n_strategies) = (table.n_draws(), table.n_strategies());
    log::debug!(
        "Building NMB cube: {n_lambdas} lambdas x {n_draws} draws x {n_strategies} strategies"
    );

    let cost = table.cost();
    let effect = table.effect();
    let mut values = Array3::<f64>::zeros((n_lambdas, n_draws, n_strategies));
    Zip::from(values.axis_iter_mut(Axis(0)))
        .and(ArrayView1::from(lambdas))
        .par_for_each(|mut slice, &lambda| slice.assign(&nmb_matrix(cost, effect, lambda)));

    let mut expected = Array2::<f64>::zeros((n_lambdas, n_strategies));
    for (mut row, slice) in expected.outer_iter_mut().zip(values.outer_iter()) {
        let means: Array1<f64> = slice
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::from_elem(n_strategies, f64::NAN));
        row.assign(&means);
    }

    let selector = OptimalSelector::new(table.strategies(), focal_idx, policy);
    let mut optimal = Array2::<usize>::zeros((n_lambdas, n_draws));
    for (mut winners, slice) in optimal.outer_iter_mut().zip(values.outer_iter()) {
        for (winner, row) in winners.iter_mut().zip(slice.outer_iter()) {
            *winner = selector.select(row);
        }
    }

    Ok(NmbAnalysis {
        cube: NmbCube {
            lambdas: lambdas.to_vec(),
            draws: table.draws().to_vec(),
            strategies: table.strategies().to_vec(),
            values,
        },
        expected,
        optimal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{constant_two_strategy_table, names};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn nmb_matches_closed_form_for_every_cell() {
        let table = constant_two_strategy_table(10);
        let lambdas = [0.0, 20_000.0, 50_000.0];
        let analysis = compute_nmb(&table, &lambdas, None, TieBreak::Declared).expect("nmb");
        for (l, &lambda) in lambdas.iter().enumerate() {
            for d in 0..table.n_draws() {
                for s in 0..table.n_strategies() {
                    let expected = lambda * table.effect()[[d, s]] - table.cost()[[d, s]];
                    assert_abs_diff_eq!(
                        analysis.cube.values()[[l, d, s]],
                        expected,
                        epsilon = 1e-9
                    );
                }
            }
        }
    }

    #[test]
    fn ketamine_dominates_at_fifty_thousand() {
        let table = constant_two_strategy_table(1000);
        let analysis = compute_nmb(&table, &[50_000.0], None, TieBreak::Declared).expect("nmb");
        assert_abs_diff_eq!(analysis.expected[[0, 0]], 99_000.0, epsilon = 1e-6);
        assert_abs_diff_eq!(analysis.expected[[0, 1]], 118_600.0, epsilon = 1e-6);
        assert!(analysis.optimal_names(0).iter().all(|&s| s == "Ketamine"));
        assert_eq!(analysis.expected_best(0), 1);
        assert_abs_diff_eq!(analysis.optimal_share()[[0, 1]], 1.0);
    }

    #[test]
    fn compute_nmb_is_idempotent() {
        let table = constant_two_strategy_table(50);
        let lambdas = [10_000.0, 30_000.0];
        let first = compute_nmb(&table, &lambdas, Some("Ketamine"), TieBreak::Legacy).expect("nmb");
        let second =
            compute_nmb(&table, &lambdas, Some("Ketamine"), TieBreak::Legacy).expect("nmb");
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_invalid_lambdas_and_unknown_focal() {
        let table = constant_two_strategy_table(5);
        assert!(matches!(
            compute_nmb(&table, &[], None, TieBreak::Declared),
            Err(NmbError::Grid(GridError::InvalidLambdas))
        ));
        assert!(matches!(
            compute_nmb(&table, &[f64::INFINITY], None, TieBreak::Declared),
            Err(NmbError::Grid(GridError::InvalidLambdas))
        ));
        assert!(matches!(
            compute_nmb(&table, &[1.0], Some("rTMS"), TieBreak::Declared),
            Err(NmbError::UnknownFocal(_))
        ));
    }

    #[test]
    fn legacy_policy_lets_last_alphabetical_tie_win() {
        let strategies = names(&["B", "A", "C"]);
        let row = array![5.0, 5.0, 5.0];
        let plain = OptimalSelector::new(&strategies, None, TieBreak::Legacy);
        assert_eq!(plain.select(row.view()), 2);
        // The alphabetical pass runs after the focal rule and overwrites it.
        let with_focal = OptimalSelector::new(&strategies, Some(0), TieBreak::Legacy);
        assert_eq!(with_focal.select(row.view()), 2);
    }

    #[test]
    fn legacy_focal_is_overwritten_by_later_alphabetical_tie() {
        let strategies = names(&["B", "A", "C"]);
        let row = array![5.0, 5.0, 1.0];
        let selector = OptimalSelector::new(&strategies, Some(1), TieBreak::Legacy);
        assert_eq!(selector.select(row.view()), 0);
    }

    #[test]
    fn declared_policy_prefers_focal_then_smallest_name() {
        let strategies = names(&["B", "A", "C"]);
        let row = array![5.0, 5.0, 5.0];
        let plain = OptimalSelector::new(&strategies, None, TieBreak::Declared);
        assert_eq!(plain.select(row.view()), 1);
        let with_focal = OptimalSelector::new(&strategies, Some(2), TieBreak::Declared);
        assert_eq!(with_focal.select(row.view()), 2);
    }

    #[test]
    fn near_ties_are_ties() {
        let strategies = names(&["Z", "A"]);
        let row = array![5.0, 5.0 - 1e-9];
        let selector = OptimalSelector::new(&strategies, None, TieBreak::Declared);
        assert_eq!(selector.select(row.view()), 1);
        let clear = array![5.0, 4.0];
        assert_eq!(selector.select(clear.view()), 0);
    }

    #[test]
    fn nmb_matrix_handles_zero_lambda() {
        let cost = array![[100.0, 200.0]];
        let effect = array![[1.0, 2.0]];
        let nmb = nmb_matrix(cost.view(), effect.view(), 0.0);
        assert_eq!(nmb, array![[-100.0, -200.0]]);
    }
}
