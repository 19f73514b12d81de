//! # Expected Value of Partial Perfect Information
//!
//! Two estimators are provided and always labelled in the output:
//!
//! - [`EvppiMethod::Legacy`]: a variance-decomposition heuristic that assigns
//!   fixed shares of the incremental NMB variance to named parameter groups
//!   and reports `share · Var(ΔNMB) / (2·|E[ΔNMB]|)`. It is illustrative only
//!   and carries no statistical guarantee.
//! - [`EvppiMethod::Regression`]: a nonparametric metamodel estimate. Each
//!   strategy's NMB is regressed on a quadratic basis of the group's
//!   parameters and the EVPI formula is applied to the fitted values.

use crate::data::psa::{
    PsaError, PsaTable, build_case_insensitive_map, extract_f64_column, extract_i64_column,
    read_tabular,
};
use crate::grid::validate_lambdas;
use crate::nmb::nmb_matrix;
use crate::voi::evpi::{VoiError, check_voi_table, evpi_from_nmb};
use crate::voi::linalg::cholesky;
use ndarray::{Array2, ArrayView1, Axis};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Incremental NMB means smaller than this use the square-root fallback.
const ZERO_MEAN: f64 = 1e-12;
/// Parameters with a smaller standard deviation carry no information.
const ZERO_SPREAD: f64 = 1e-12;
/// Ridge added to the normal equations, relative to the number of draws.
const RELATIVE_RIDGE: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvppiMethod {
    Legacy,
    Regression,
}

impl fmt::Display for EvppiMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Legacy => "legacy",
            Self::Regression => "regression",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvppiPoint {
    pub group: String,
    pub wtp: f64,
    pub evppi: f64,
    pub method: EvppiMethod,
}

/// Fixed share of incremental NMB variance attributed to a parameter group.
#[derive(Debug, Clone, PartialEq)]
pub struct VarianceShare {
    pub group: String,
    pub proportion: f64,
}

/// Clinical 50 %, Cost 30 %, Utility 20 %.
pub fn default_variance_shares() -> Vec<VarianceShare> {
    [("Clinical", 0.5), ("Cost", 0.3), ("Utility", 0.2)]
        .into_iter()
        .map(|(group, proportion)| VarianceShare {
            group: group.to_string(),
            proportion,
        })
        .collect()
}

/// Legacy heuristic on the incremental NMB of `focal` against `base`.
pub fn legacy_evppi(
    table: &PsaTable,
    lambdas: &[f64],
    base: &str,
    focal: &str,
    shares: &[VarianceShare],
) -> Result<Vec<EvppiPoint>, VoiError> {
    validate_lambdas(lambdas)?;
    check_voi_table(table)?;
    if shares.is_empty() {
        return Err(VoiError::NoGroups);
    }
    for share in shares {
        if !(share.proportion.is_finite() && (0.0..=1.0).contains(&share.proportion)) {
            return Err(VoiError::InvalidProportion {
                group: share.group.clone(),
                value: share.proportion,
            });
        }
    }
    let total: f64 = shares.iter().map(|s| s.proportion).sum();
    if (total - 1.0).abs() > 1e-9 {
        log::warn!("Legacy EVPPI variance shares sum to {total}, not 1");
    }
    let base_idx = table.require_strategy(base)?;
    let focal_idx = table.require_strategy(focal)?;
    log::info!("Legacy EVPPI is a variance-decomposition heuristic, not a parameter-level estimate");

    let n_draws = table.n_draws() as f64;
    let mut points = Vec::with_capacity(shares.len() * lambdas.len());
    let mut moments = Vec::with_capacity(lambdas.len());
    for &wtp in lambdas {
        let delta = (&table.effect_of(focal_idx) - &table.effect_of(base_idx)) * wtp
            - (&table.cost_of(focal_idx) - &table.cost_of(base_idx));
        let mean = delta.sum() / n_draws;
        let variance = delta.mapv(|v| (v - mean).powi(2)).sum() / n_draws;
        if variance == 0.0 {
            log::warn!("Incremental NMB has zero variance at lambda = {wtp}; legacy EVPPI is 0");
        } else if mean.abs() < ZERO_MEAN {
            log::warn!(
                "Incremental NMB has zero mean at lambda = {wtp}; using the sqrt(variance) fallback"
            );
        }
        moments.push((wtp, mean, variance));
    }

    for share in shares {
        for &(wtp, mean, variance) in &moments {
            let evppi = if mean.abs() < ZERO_MEAN {
                share.proportion * variance.sqrt()
            } else {
                share.proportion * variance / (2.0 * mean.abs())
            };
            points.push(EvppiPoint {
                group: share.group.clone(),
                wtp,
                evppi,
                method: EvppiMethod::Legacy,
            });
        }
    }
    Ok(points)
}

/// A named set of parameters whose joint uncertainty is resolved together.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterGroup {
    pub name: String,
    pub parameters: Vec<String>,
}

impl FromStr for ParameterGroup {
    type Err = String;

    /// Parses `NAME=param_a,param_b`.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let (name, list) = text
            .split_once('=')
            .ok_or_else(|| format!("expected NAME=param[,param...], found '{text}'"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(format!("parameter group '{text}' has an empty name"));
        }
        let parameters: Vec<String> = list
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        if parameters.is_empty() {
            return Err(format!("parameter group '{name}' lists no parameters"));
        }
        Ok(Self {
            name: name.to_string(),
            parameters,
        })
    }
}

/// Sampled parameter values, one row per PSA draw.
#[derive(Debug, Clone)]
pub struct ParameterTable {
    draws: Vec<i64>,
    names: Vec<String>,
    values: Array2<f64>,
}

impl ParameterTable {
    pub fn from_arrays(
        draws: Vec<i64>,
        names: Vec<String>,
        values: Array2<f64>,
    ) -> Result<Self, VoiError> {
        if values.dim() != (draws.len(), names.len()) {
            return Err(VoiError::Psa(PsaError::ShapeMismatch(format!(
                "parameter values are {:?} for {} draws and {} parameters",
                values.dim(),
                draws.len(),
                names.len()
            ))));
        }
        let mut seen = HashSet::with_capacity(draws.len());
        if let Some(&duplicate) = draws.iter().find(|&&d| !seen.insert(d)) {
            return Err(VoiError::DuplicateParameterDraw(duplicate));
        }
        Ok(Self {
            draws,
            names,
            values,
        })
    }

    /// Reads a CSV/TSV with a `draw` column and one numeric column per parameter.
    pub fn read(path: &Path) -> Result<Self, VoiError> {
        let df = read_tabular(path)?;
        let headers: Vec<String> = df
            .get_column_names()
            .into_iter()
            .map(|name| name.as_str().to_string())
            .collect();
        let map = build_case_insensitive_map(headers.iter());
        let draws = extract_i64_column(&df, &map, "draw")?;

        let names: Vec<String> = headers
            .iter()
            .filter(|h| h.trim().to_ascii_lowercase() != "draw")
            .map(|h| h.trim().to_string())
            .collect();
        let mut values = Array2::<f64>::zeros((draws.len(), names.len()));
        for (col, name) in names.iter().enumerate() {
            let column = extract_f64_column(&df, &map, &name.to_ascii_lowercase())?;
            values.column_mut(col).assign(&ArrayView1::from(column.as_slice()));
        }
        log::info!(
            "Loaded {} parameters over {} draws from '{}'",
            names.len(),
            draws.len(),
            path.display()
        );
        Self::from_arrays(draws, names, values)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|idx| self.values.column(idx))
    }

    /// Reorders rows to follow `draws`; every draw must be present.
    pub fn aligned_to(&self, draws: &[i64]) -> Result<Self, VoiError> {
        let index: HashMap<i64, usize> =
            self.draws.iter().enumerate().map(|(i, &d)| (d, i)).collect();
        let rows = draws
            .iter()
            .map(|d| index.get(d).copied().ok_or(VoiError::ParameterDrawMissing(*d)))
            .collect::<Result<Vec<usize>, _>>()?;
        Ok(Self {
            draws: draws.to_vec(),
            names: self.names.clone(),
            values: self.values.select(Axis(0), &rows),
        })
    }
}

/// `[1, z_1..z_k, z_1²..z_k²]` with `z` the standardised group parameters.
fn group_design(parameters: &ParameterTable, group: &ParameterGroup) -> Result<Array2<f64>, VoiError> {
    if group.parameters.is_empty() {
        return Err(VoiError::EmptyGroup(group.name.clone()));
    }
    let n = parameters.draws.len();
    let mut standardised = Vec::with_capacity(group.parameters.len());
    for name in &group.parameters {
        let column = parameters
            .column(name)
            .ok_or_else(|| VoiError::ParameterNotFound(name.clone()))?;
        let mean = column.sum() / n as f64;
        let sd = (column.mapv(|v| (v - mean).powi(2)).sum() / n as f64).sqrt();
        if sd < ZERO_SPREAD {
            log::warn!("Parameter '{name}' is constant across draws and is left out of the regression");
            continue;
        }
        standardised.push(column.mapv(|v| (v - mean) / sd));
    }

    let k = standardised.len();
    let mut design = Array2::<f64>::ones((n, 1 + 2 * k));
    for (j, z) in standardised.iter().enumerate() {
        design.column_mut(1 + j).assign(z);
        design.column_mut(1 + k + j).assign(&z.mapv(|v| v * v));
    }
    Ok(design)
}

/// Regression-metamodel EVPPI for every group and willingness-to-pay.
pub fn regression_evppi(
    table: &PsaTable,
    lambdas: &[f64],
    parameters: &ParameterTable,
    groups: &[ParameterGroup],
) -> Result<Vec<EvppiPoint>, VoiError> {
    validate_lambdas(lambdas)?;
    check_voi_table(table)?;
    if groups.is_empty() {
        return Err(VoiError::NoGroups);
    }
    let aligned = parameters.aligned_to(table.draws())?;
    let n = table.n_draws();

    let mut points = Vec::with_capacity(groups.len() * lambdas.len());
    for group in groups {
        let design = group_design(&aligned, group)?;
        let columns = design.ncols();
        if n <= columns {
            return Err(VoiError::InsufficientDraws {
                group: group.name.clone(),
                columns,
                draws: n,
            });
        }
        let mut gram = design.t().dot(&design);
        for i in 0..columns {
            gram[[i, i]] += RELATIVE_RIDGE * n as f64;
        }
        let factor = cholesky(gram.view())?;

        // NMB is linear in cost and effect, so fitting both once covers every λ.
        let mut fitted_cost = Array2::<f64>::zeros(table.cost().raw_dim());
        let mut fitted_effect = Array2::<f64>::zeros(table.effect().raw_dim());
        for strategy in 0..table.n_strategies() {
            let beta = factor.solve(design.t().dot(&table.cost_of(strategy)).view())?;
            fitted_cost.column_mut(strategy).assign(&design.dot(&beta));
            let beta = factor.solve(design.t().dot(&table.effect_of(strategy)).view())?;
            fitted_effect.column_mut(strategy).assign(&design.dot(&beta));
        }

        let values: Vec<f64> = lambdas
            .par_iter()
            .map(|&wtp| evpi_from_nmb(nmb_matrix(fitted_cost.view(), fitted_effect.view(), wtp).view()))
            .collect();
        log::debug!(
            "Regression EVPPI for '{}' uses {} basis columns; first value {:?}",
            group.name,
            columns,
            values.first()
        );
        points.extend(lambdas.iter().zip(values).map(|(&wtp, evppi)| EvppiPoint {
            group: group.name.clone(),
            wtp,
            evppi,
            method: EvppiMethod::Regression,
        }));
    }
    Ok(points)
}

/// Parameters not named by any group; handy for reporting.
pub fn ungrouped_parameters<'a>(parameters: &'a ParameterTable, groups: &[ParameterGroup]) -> Vec<&'a str> {
    let grouped: HashSet<&str> = groups
        .iter()
        .flat_map(|g| g.parameters.iter().map(String::as_str))
        .collect();
    parameters
        .names()
        .iter()
        .map(String::as_str)
        .filter(|name| !grouped.contains(name))
        .collect()
}
