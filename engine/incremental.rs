//! Incremental cost-effectiveness ratios and the deterministic efficiency
//! frontier computed from PSA means.

use crate::data::psa::{PsaError, PsaTable};
use ndarray::Axis;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

/// Incremental effects smaller than this are treated as zero.
const ZERO_EFFECT: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq)]
pub struct StrategySummary {
    pub strategy: String,
    pub mean_cost: f64,
    pub mean_effect: f64,
    pub delta_cost: f64,
    pub delta_effect: f64,
    /// `delta_cost / delta_effect`; `+inf` when the incremental effect is
    /// zero and `NaN` for the base row.
    pub icer: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrontierStatus {
    Frontier,
    Dominated,
    ExtendedlyDominated,
}

impl fmt::Display for FrontierStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Frontier => "frontier",
            Self::Dominated => "dominated",
            Self::ExtendedlyDominated => "extendedly_dominated",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrontierEntry {
    pub strategy: String,
    pub mean_cost: f64,
    pub mean_effect: f64,
    pub status: FrontierStatus,
    /// ICER against the previous frontier strategy; `None` for the cheapest
    /// frontier strategy and for every strategy off the frontier.
    pub sequential_icer: Option<f64>,
}

/// Ratio with the sentinel used throughout the engine for a zero denominator.
pub fn icer(delta_cost: f64, delta_effect: f64) -> f64 {
    if delta_effect.abs() < ZERO_EFFECT {
        f64::INFINITY
    } else {
        delta_cost / delta_effect
    }
}

/// Mean cost and effect of every strategy and their increments over `base`.
pub fn incremental_summary(
    table: &PsaTable,
    base: &str,
) -> Result<Vec<StrategySummary>, PsaError> {
    let base_idx = table.require_strategy(base)?;
    let (costs, effects) = strategy_means(table);
    let mut rows = Vec::with_capacity(table.n_strategies());
    for (idx, name) in table.strategies().iter().enumerate() {
        let delta_cost = costs[idx] - costs[base_idx];
        let delta_effect = effects[idx] - effects[base_idx];
        let ratio = if idx == base_idx {
            f64::NAN
        } else {
            if delta_effect.abs() < ZERO_EFFECT {
                log::warn!(
                    "'{name}' has zero incremental effect against '{base}'; ICER reported as infinite"
                );
            }
            icer(delta_cost, delta_effect)
        };
        rows.push(StrategySummary {
            strategy: name.clone(),
            mean_cost: costs[idx],
            mean_effect: effects[idx],
            delta_cost,
            delta_effect,
            icer: ratio,
        });
    }
    Ok(rows)
}

/// Classifies each strategy as on the frontier, strictly dominated, or
/// extendedly dominated, and reports sequential ICERs along the frontier.
pub fn efficiency_frontier(table: &PsaTable) -> Vec<FrontierEntry> {
    let (costs, effects) = strategy_means(table);
    let n = table.n_strategies();
    let mut status = vec![FrontierStatus::Frontier; n];

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        costs[a]
            .partial_cmp(&costs[b])
            .unwrap_or(Ordering::Equal)
            .then(effects[b].partial_cmp(&effects[a]).unwrap_or(Ordering::Equal))
    });

    let mut candidates: Vec<usize> = Vec::with_capacity(n);
    let mut best_effect = f64::NEG_INFINITY;
    for &idx in &order {
        if effects[idx] <= best_effect {
            status[idx] = FrontierStatus::Dominated;
        } else {
            best_effect = effects[idx];
            candidates.push(idx);
        }
    }

    loop {
        let ratios: Vec<f64> = candidates
            .windows(2)
            .map(|w| icer(costs[w[1]] - costs[w[0]], effects[w[1]] - effects[w[0]]))
            .collect();
        let Some(position) = ratios.windows(2).position(|r| r[0] > r[1]) else {
            break;
        };
        let removed = candidates.remove(position + 1);
        status[removed] = FrontierStatus::ExtendedlyDominated;
    }

    let mut sequential = vec![None; n];
    for pair in candidates.windows(2) {
        sequential[pair[1]] = Some(icer(
            costs[pair[1]] - costs[pair[0]],
            effects[pair[1]] - effects[pair[0]],
        ));
    }

    order
        .into_iter()
        .map(|idx| FrontierEntry {
            strategy: table.strategies()[idx].clone(),
            mean_cost: costs[idx],
            mean_effect: effects[idx],
            status: status[idx],
            sequential_icer: sequential[idx],
        })
        .collect()
}

fn strategy_means(table: &PsaTable) -> (Vec<f64>, Vec<f64>) {
    let n = table.n_strategies();
    let costs = table
        .cost()
        .mean_axis(Axis(0))
        .map(|m| m.to_vec())
        .unwrap_or_else(|| vec![f64::NAN; n]);
    let effects = table
        .effect()
        .mean_axis(Axis(0))
        .map(|m| m.to_vec())
        .unwrap_or_else(|| vec![f64::NAN; n]);
    (costs, effects)
}
