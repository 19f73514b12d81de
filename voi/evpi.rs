//! Expected value of perfect information.
//!
//! `EVPI(λ) = E[max_j NMB_j(λ)] − max_j E[NMB_j(λ)]`, clamped at zero.

use crate::data::psa::{PsaError, PsaTable};
use crate::grid::{GridError, validate_lambdas};
use crate::nmb::nmb_matrix;
use crate::voi::linalg::LinalgError;
use ndarray::ArrayView2;
use polars::prelude::PolarsError;
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiError {
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error(transparent)]
    Psa(#[from] PsaError),
    #[error(transparent)]
    Linalg(#[from] LinalgError),
    #[error("Error from the underlying Polars library: {0}")]
    Polars(#[from] PolarsError),
    #[error("Value of information needs at least 2 strategies (found {0}).")]
    TooFewStrategies(usize),
    #[error("The PSA table has no draws.")]
    NoDraws,
    #[error(
        "Population and horizon must be finite and non-negative (population = {population}, horizon = {horizon})."
    )]
    InvalidPopulation { population: f64, horizon: f64 },
    #[error("Variance proportion for group '{group}' must lie in [0, 1] (found {value}).")]
    InvalidProportion { group: String, value: f64 },
    #[error("At least one parameter group is required.")]
    NoGroups,
    #[error("Parameter group '{0}' lists no parameters.")]
    EmptyGroup(String),
    #[error("Parameter '{0}' was not found in the parameter table.")]
    ParameterNotFound(String),
    #[error("Draw {0} of the PSA table has no row in the parameter table.")]
    ParameterDrawMissing(i64),
    #[error("Parameter table has duplicate draw id {0}.")]
    DuplicateParameterDraw(i64),
    #[error(
        "Parameter group '{group}' needs more than {columns} draws for its regression (found {draws})."
    )]
    InsufficientDraws {
        group: String,
        columns: usize,
        draws: usize,
    },
}

/// One row of the EVPI table.
#[derive(Debug, Clone, PartialEq)]
pub struct EvpiPoint {
    pub wtp: f64,
    pub evpi: f64,
    pub population_evpi: f64,
}

/// Multiplier turning per-patient values into population values.
pub fn population_scale(annual_population: f64, horizon_years: f64) -> Result<f64, VoiError> {
    let valid = |v: f64| v.is_finite() && v >= 0.0;
    if !(valid(annual_population) && valid(horizon_years)) {
        return Err(VoiError::InvalidPopulation {
            population: annual_population,
            horizon: horizon_years,
        });
    }
    Ok(annual_population * horizon_years)
}

/// EVPI of one `[draw, strategy]` NMB matrix.
pub fn evpi_from_nmb(nmb: ArrayView2<'_, f64>) -> f64 {
    let n_draws = nmb.nrows();
    if n_draws == 0 || nmb.ncols() == 0 {
        return 0.0;
    }
    // Row maxima and column sums are accumulated in the same pass and order,
    // so a table without uncertainty gives exactly zero.
    let mut column_sums = vec![0.0; nmb.ncols()];
    let mut max_sum = 0.0;
    for row in nmb.outer_iter() {
        let mut row_max = f64::NEG_INFINITY;
        for (sum, &value) in column_sums.iter_mut().zip(row.iter()) {
            *sum += value;
            row_max = row_max.max(value);
        }
        max_sum += row_max;
    }
    let expected_max = max_sum / n_draws as f64;
    let max_expected = column_sums
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max)
        / n_draws as f64;
    (expected_max - max_expected).max(0.0)
}

pub(crate) fn check_voi_table(table: &PsaTable) -> Result<(), VoiError> {
    if table.n_strategies() < 2 {
        return Err(VoiError::TooFewStrategies(table.n_strategies()));
    }
    if table.n_draws() == 0 {
        return Err(VoiError::NoDraws);
    }
    Ok(())
}

/// EVPI over the willingness-to-pay grid.
pub fn compute_evpi(
    table: &PsaTable,
    lambdas: &[f64],
    population_scale: f64,
) -> Result<Vec<EvpiPoint>, VoiError> {
    validate_lambdas(lambdas)?;
    check_voi_table(table)?;
    let points = lambdas
        .par_iter()
        .map(|&wtp| {
            let evpi = evpi_from_nmb(nmb_matrix(table.cost(), table.effect(), wtp).view());
            EvpiPoint {
                wtp,
                evpi,
                population_evpi: evpi * population_scale,
            }
        })
        .collect::<Vec<_>>();
    if let Some(peak) = points
        .iter()
        .max_by(|a, b| a.evpi.total_cmp(&b.evpi))
    {
        log::info!("EVPI peaks at {:.2} per patient (lambda = {})", peak.evpi, peak.wtp);
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{constant_two_strategy_table, names, uncertain_two_strategy_table};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn no_uncertainty_means_no_value_of_information() {
        let table = constant_two_strategy_table(1000);
        let points = compute_evpi(&table, &[50_000.0], 1.0).expect("evpi");
        assert_eq!(points[0].evpi, 0.0);
    }

    #[test]
    fn uncertainty_gives_positive_evpi() {
        let table = uncertain_two_strategy_table(5_000, 42);
        let points = compute_evpi(&table, &[50_000.0], 1.0).expect("evpi");
        assert!(points[0].evpi > 0.0);
    }

    #[test]
    fn evpi_matches_hand_computation() {
        // Draw 1: A wins by 10. Draw 2: B wins by 30.
        let nmb = array![[20.0, 10.0], [0.0, 30.0]];
        // E[max] = 25, max E = 20.
        assert_abs_diff_eq!(evpi_from_nmb(nmb.view()), 5.0);
    }

    #[test]
    fn evpi_is_never_negative_across_the_grid() {
        let table = uncertain_two_strategy_table(500, 9);
        let lambdas: Vec<f64> = (0..=40).map(|i| i as f64 * 2_500.0).collect();
        let points = compute_evpi(&table, &lambdas, 1.0).expect("evpi");
        assert!(points.iter().all(|p| p.evpi >= 0.0));
    }

    #[test]
    fn evpi_vanishes_when_costs_alone_decide() {
        let table = uncertain_two_strategy_table(4_000, 5);
        let points = compute_evpi(&table, &[0.0, 50_000.0], 1.0).expect("evpi");
        assert_eq!(points[0].evpi, 0.0);
        assert!(points[1].evpi > 0.0);
    }

    #[test]
    fn population_evpi_scales_linearly() {
        let table = uncertain_two_strategy_table(300, 1);
        let scale = population_scale(12_000.0, 5.0).expect("scale");
        let points = compute_evpi(&table, &[30_000.0], scale).expect("evpi");
        assert_abs_diff_eq!(points[0].population_evpi, points[0].evpi * 60_000.0);
        assert!(population_scale(-1.0, 5.0).is_err());
    }

    #[test]
    fn single_strategy_is_rejected() {
        let table = PsaTable::from_arrays(
            names(&["Usual care"]),
            vec![1, 2],
            array![[1.0], [2.0]],
            array![[1.0], [1.0]],
        )
        .expect("table");
        assert!(matches!(
            compute_evpi(&table, &[1.0], 1.0),
            Err(VoiError::TooFewStrategies(1))
        ));
        assert!(matches!(
            compute_evpi(&constant_two_strategy_table(2), &[], 1.0),
            Err(VoiError::Grid(GridError::InvalidLambdas))
        ));
    }
}
