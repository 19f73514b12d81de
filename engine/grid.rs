//! Willingness-to-pay and price grids.
//!
//! A single grid is built per analysis and shared by the NMB, CEAC, CEAF and
//! VBP stages so that every output table uses the same x-axis.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Relative slack used when deciding whether a stepped point has reached `max`.
const SNAP_TOLERANCE: f64 = 1e-9;
/// Largest stepped grid `build_grid` will materialise.
pub const MAX_GRID_POINTS: usize = 1_000_000;

#[derive(Error, Debug, PartialEq)]
pub enum GridError {
    #[error("Grid bounds must be finite (min = {min}, max = {max}, step = {step}).")]
    NonFinite { min: f64, max: f64, step: f64 },
    #[error("Grid step must be positive (found {0}).")]
    NonPositiveStep(f64),
    #[error("Grid maximum {max} is below the minimum {min}.")]
    InvertedBounds { min: f64, max: f64 },
    #[error("Grid from {min} to {max} in steps of {step} exceeds {MAX_GRID_POINTS} points.")]
    TooManyPoints { min: f64, max: f64, step: f64 },
    #[error("A linearly spaced grid needs at least one point.")]
    Empty,
    #[error("Willingness-to-pay values must be non-empty and finite.")]
    InvalidLambdas,
}

/// Builds `min, min + step, …` up to `max`.
///
/// With `inclusive`, `max` is always the last point; without it, points at or
/// beyond `max` are dropped. The result is strictly increasing.
pub fn build_grid(min: f64, max: f64, step: f64, inclusive: bool) -> Result<Vec<f64>, GridError> {
    if !(min.is_finite() && max.is_finite() && step.is_finite()) {
        return Err(GridError::NonFinite { min, max, step });
    }
    if step <= 0.0 {
        return Err(GridError::NonPositiveStep(step));
    }
    if max < min {
        return Err(GridError::InvertedBounds { min, max });
    }

    let span = (max - min) / step + SNAP_TOLERANCE;
    if !span.is_finite() || span >= (MAX_GRID_POINTS - 1) as f64 {
        return Err(GridError::TooManyPoints { min, max, step });
    }
    let slack = SNAP_TOLERANCE * step;
    let n_steps = span.floor() as usize;
    let mut points: Vec<f64> = (0..=n_steps)
        .map(|i| {
            let value = min + (i as f64) * step;
            if (value - max).abs() <= slack { max } else { value }
        })
        .collect();

    if inclusive {
        if points.last().is_none_or(|&last| last < max) {
            points.push(max);
        }
    } else {
        points.retain(|&value| value < max - slack);
    }

    points.dedup_by(|a, b| a <= b);
    Ok(points)
}

/// `n` evenly spaced points from `start` to `stop`, both ends included.
pub fn linspace(start: f64, stop: f64, n: usize) -> Result<Vec<f64>, GridError> {
    if !(start.is_finite() && stop.is_finite()) {
        return Err(GridError::NonFinite {
            min: start,
            max: stop,
            step: f64::NAN,
        });
    }
    match n {
        0 => Err(GridError::Empty),
        1 => Ok(vec![start]),
        _ => {
            let step = (stop - start) / ((n - 1) as f64);
            Ok((0..n)
                .map(|i| if i == n - 1 { stop } else { start + (i as f64) * step })
                .collect())
        }
    }
}

/// Rejects empty or non-finite willingness-to-pay vectors.
pub fn validate_lambdas(lambdas: &[f64]) -> Result<(), GridError> {
    if lambdas.is_empty() || lambdas.iter().any(|v| !v.is_finite()) {
        return Err(GridError::InvalidLambdas);
    }
    Ok(())
}

/// Reporting jurisdiction; selects the default willingness-to-pay grid and
/// names output files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Jurisdiction {
    Au,
    Nz,
}

impl Jurisdiction {
    pub fn code(self) -> &'static str {
        match self {
            Self::Au => "au",
            Self::Nz => "nz",
        }
    }

    /// AUD grid: 201 points over 0–100 000. NZD grid: 181 points over 0–60 000.
    pub fn default_lambda_grid(self) -> Vec<f64> {
        let (stop, n) = match self {
            Self::Au => (100_000.0, 201),
            Self::Nz => (60_000.0, 181),
        };
        (0..n)
            .map(|i| stop * (i as f64) / ((n - 1) as f64))
            .collect()
    }
}

impl fmt::Display for Jurisdiction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn inclusive_grid_has_expected_points() {
        let grid = build_grid(0.0, 100_000.0, 5_000.0, true).expect("grid");
        assert_eq!(grid.len(), 21);
        assert_eq!(grid[0], 0.0);
        assert_eq!(grid[1], 5_000.0);
        assert_eq!(*grid.last().unwrap(), 100_000.0);
    }

    #[test]
    fn oversized_grids_are_rejected_before_allocation() {
        assert!(matches!(
            build_grid(0.0, 1e12, 1e-6, true),
            Err(GridError::TooManyPoints { .. })
        ));
        assert!(matches!(
            build_grid(0.0, 1e300, 1.0, false),
            Err(GridError::TooManyPoints { .. })
        ));
        assert!(matches!(
            build_grid(-1e308, 1e308, 1.0, true),
            Err(GridError::TooManyPoints { .. })
        ));
        let largest = build_grid(0.0, (MAX_GRID_POINTS - 2) as f64, 1.0, true).expect("grid");
        assert_eq!(largest.len(), MAX_GRID_POINTS - 1);
    }

    #[test]
    fn inclusive_grid_appends_max_when_step_overshoots() {
        let grid = build_grid(0.0, 10.0, 3.0, true).expect("grid");
        assert_eq!(grid, vec![0.0, 3.0, 6.0, 9.0, 10.0]);
    }

    #[test]
    fn exclusive_grid_drops_max() {
        let grid = build_grid(0.0, 10.0, 5.0, false).expect("grid");
        assert_eq!(grid, vec![0.0, 5.0]);
    }

    #[test]
    fn fractional_steps_end_exactly_on_max() {
        let grid = build_grid(0.0, 1.0, 0.1, true).expect("grid");
        assert_eq!(grid.len(), 11);
        assert_eq!(*grid.last().unwrap(), 1.0);
        assert!(grid.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn degenerate_grid_is_single_point() {
        assert_eq!(build_grid(5.0, 5.0, 1.0, true).expect("grid"), vec![5.0]);
    }

    #[test]
    fn invalid_grids_are_rejected() {
        assert_eq!(
            build_grid(0.0, 10.0, 0.0, true),
            Err(GridError::NonPositiveStep(0.0))
        );
        assert_eq!(
            build_grid(0.0, 10.0, -1.0, true),
            Err(GridError::NonPositiveStep(-1.0))
        );
        assert!(matches!(
            build_grid(10.0, 0.0, 1.0, true),
            Err(GridError::InvertedBounds { .. })
        ));
        assert!(matches!(
            build_grid(0.0, f64::INFINITY, 1.0, true),
            Err(GridError::NonFinite { .. })
        ));
    }

    #[test]
    fn jurisdiction_grids_match_published_axes() {
        let au = Jurisdiction::Au.default_lambda_grid();
        assert_eq!(au.len(), 201);
        assert_abs_diff_eq!(au[1], 500.0, epsilon = 1e-9);
        assert_eq!(*au.last().unwrap(), 100_000.0);

        let nz = Jurisdiction::Nz.default_lambda_grid();
        assert_eq!(nz.len(), 181);
        assert_abs_diff_eq!(nz[1], 333.333_333_333, epsilon = 1e-6);
        assert_eq!(*nz.last().unwrap(), 60_000.0);
    }

    #[test]
    fn linspace_includes_both_ends() {
        let points = linspace(0.0, 1.0, 5).expect("points");
        assert_eq!(points, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(linspace(0.0, 1.0, 0), Err(GridError::Empty));
    }

    #[test]
    fn lambda_validation() {
        assert!(validate_lambdas(&[0.0, 50_000.0]).is_ok());
        assert_eq!(validate_lambdas(&[]), Err(GridError::InvalidLambdas));
        assert_eq!(
            validate_lambdas(&[f64::NAN]),
            Err(GridError::InvalidLambdas)
        );
    }
}
