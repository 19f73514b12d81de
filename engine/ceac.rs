//! # Acceptability Curves and Frontier
//!
//! CEAC: for each strategy and willingness-to-pay, the probability that the
//! strategy is cost-effective. CEAF: for each willingness-to-pay, the strategy
//! with the highest expected NMB and the probability that it is the per-draw
//! optimum.
//!
//! The frontier is piecewise constant in the selected strategy and its
//! probability can jump where the selected strategy switches.

use crate::data::psa::{PsaError, PsaTable};
use crate::grid::{GridError, validate_lambdas};
use crate::nmb::{NmbError, TieBreak, compute_nmb, first_argmax, nmb_matrix};
use ndarray::{Axis, Zip};
use rayon::prelude::*;
use thiserror::Error;

/// Slack under the row maximum within which a strategy still counts as optimal.
pub const FRONTIER_EPSILON: f64 = 1e-9;

#[derive(Error, Debug)]
pub enum CeacError {
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error(transparent)]
    Nmb(#[from] NmbError),
    #[error(transparent)]
    Psa(#[from] PsaError),
    #[error("PSA results are missing strategies: {0}")]
    MissingStrategies(String),
    #[error("The acceptability frontier needs at least one strategy.")]
    NoStrategies,
    #[error("The PSA table has no draws.")]
    NoDraws,
    #[error("The legacy reference willingness-to-pay must be finite (found {0}).")]
    InvalidReferenceLambda(f64),
}

/// Which probability a CEAC point reports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CeacMethod {
    /// `P(NMB_s > NMB_base)` for every non-base strategy.
    VersusBase,
    /// `P(s is the per-draw optimum)` for every strategy.
    Optimal,
    /// `P(ΔNMB_s(reference_lambda) > 0)` against base, computed once and
    /// repeated over the whole grid.
    LegacyConstant { reference_lambda: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CeacPoint {
    pub strategy: String,
    pub wtp: f64,
    pub probability: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrontierPoint {
    pub wtp: f64,
    pub best_strategy: String,
    pub probability: f64,
}

/// Computes acceptability curves. Points are grouped by strategy (table
/// order) and ordered by willingness-to-pay within each strategy.
pub fn compute_ceac(
    table: &PsaTable,
    lambdas: &[f64],
    base: &str,
    method: CeacMethod,
    focal: Option<&str>,
    policy: TieBreak,
) -> Result<Vec<CeacPoint>, CeacError> {
    validate_lambdas(lambdas)?;
    if table.n_draws() == 0 {
        return Err(CeacError::NoDraws);
    }
    let base_idx = table.require_strategy(base)?;
    let n_draws = table.n_draws() as f64;

    match method {
        CeacMethod::VersusBase => {
            let mut points = Vec::new();
            for (idx, name) in table.strategies().iter().enumerate() {
                if idx == base_idx {
                    continue;
                }
                let curve: Vec<f64> = lambdas
                    .par_iter()
                    .map(|&lambda| {
                        beats_base_fraction(table, idx, base_idx, lambda) / n_draws
                    })
                    .collect();
                points.extend(lambdas.iter().zip(curve).map(|(&wtp, probability)| {
                    CeacPoint {
                        strategy: name.clone(),
                        wtp,
                        probability,
                    }
                }));
            }
            Ok(points)
        }
        CeacMethod::Optimal => {
            let analysis = compute_nmb(table, lambdas, focal, policy)?;
            let share = analysis.optimal_share();
            let mut points = Vec::with_capacity(share.len());
            for (idx, name) in table.strategies().iter().enumerate() {
                points.extend(lambdas.iter().zip(share.column(idx)).map(
                    |(&wtp, &probability)| CeacPoint {
                        strategy: name.clone(),
                        wtp,
                        probability,
                    },
                ));
            }
            Ok(points)
        }
        CeacMethod::LegacyConstant { reference_lambda } => {
            if !reference_lambda.is_finite() {
                return Err(CeacError::InvalidReferenceLambda(reference_lambda));
            }
            log::info!(
                "Using the constant-probability CEAC approximation at lambda = {reference_lambda}"
            );
            let mut points = Vec::new();
            for (idx, name) in table.strategies().iter().enumerate() {
                if idx == base_idx {
                    continue;
                }
                let probability =
                    beats_base_fraction(table, idx, base_idx, reference_lambda) / n_draws;
                points.extend(lambdas.iter().map(|&wtp| CeacPoint {
                    strategy: name.clone(),
                    wtp,
                    probability,
                }));
            }
            Ok(points)
        }
    }
}

/// Number of draws in which `strategy` has strictly higher NMB than `base`.
fn beats_base_fraction(table: &PsaTable, strategy: usize, base: usize, lambda: f64) -> f64 {
    let mut wins = 0usize;
    Zip::from(table.cost_of(strategy))
        .and(table.effect_of(strategy))
        .and(table.cost_of(base))
        .and(table.effect_of(base))
        .for_each(|&cs, &es, &cb, &eb| {
            if lambda * es - cs > lambda * eb - cb {
                wins += 1;
            }
        });
    wins as f64
}

/// Computes the acceptability frontier over `strategies` (which must all be
/// columns of `table`).
pub fn compute_frontier(
    table: &PsaTable,
    lambdas: &[f64],
    strategies: &[String],
) -> Result<Vec<FrontierPoint>, CeacError> {
    validate_lambdas(lambdas)?;
    if strategies.is_empty() {
        return Err(CeacError::NoStrategies);
    }
    let missing = table.missing_strategies(strategies);
    if !missing.is_empty() {
        return Err(CeacError::MissingStrategies(missing.join(", ")));
    }
    if table.n_draws() == 0 {
        return Err(CeacError::NoDraws);
    }

    let columns: Vec<usize> = strategies
        .iter()
        .filter_map(|name| table.strategy_index(name))
        .collect();
    let cost = table.cost().select(Axis(1), &columns);
    let effect = table.effect().select(Axis(1), &columns);
    let n_draws = table.n_draws() as f64;

    let points = lambdas
        .par_iter()
        .map(|&lambda| {
            let nmb = nmb_matrix(cost.view(), effect.view(), lambda);
            let means = nmb.sum_axis(Axis(0)) / n_draws;
            let best = first_argmax(means.view());
            let hits = nmb
                .outer_iter()
                .filter(|row| {
                    let row_max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                    row[best] >= row_max - FRONTIER_EPSILON
                })
                .count();
            FrontierPoint {
                wtp: lambda,
                best_strategy: strategies[best].clone(),
                probability: hits as f64 / n_draws,
            }
        })
        .collect();
    Ok(points)
}
