//! # Expected Value of Sample Information
//!
//! Resampling estimate: for each candidate sample size `n`, draw `n` PSA rows
//! without replacement, recompute EVPI on the subsample, and summarise the
//! spread across simulations. Each (sample size, simulation) task owns an RNG
//! seeded from the base seed plus its task index, so the output does not
//! depend on how rayon schedules the work.
//!
//! The curve can be smoothed with [`GpSmoother`] before choosing the sample
//! size that maximises the expected net benefit of sampling.

use crate::data::psa::PsaTable;
use crate::nmb::nmb_matrix;
use crate::progress::{AnalysisProgressObserver, AnalysisStage};
use crate::voi::evpi::{VoiError, check_voi_table, evpi_from_nmb};
use crate::voi::gp::{GpError, GpSmoother};
use ndarray::Axis;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rayon::prelude::*;
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EvsiError {
    #[error(transparent)]
    Voi(#[from] VoiError),
    #[error(transparent)]
    Gp(#[from] GpError),
    #[error("At least one sample size is required.")]
    NoSampleSizes,
    #[error("Sample size {size} must lie between 1 and the number of draws ({n_draws}).")]
    InvalidSampleSize { size: usize, n_draws: usize },
    #[error("The number of simulations must be at least 1.")]
    NoSimulations,
    #[error("Willingness-to-pay for EVSI must be finite (found {0}).")]
    InvalidLambda(f64),
    #[error("Cost per patient and population scale must be finite and non-negative.")]
    InvalidResearchCost,
    #[error("No EVSI values were supplied for the net-benefit search.")]
    EmptyCurve,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvsiConfig {
    pub sample_sizes: Vec<usize>,
    pub simulations: usize,
    pub seed: u64,
    pub lambda: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvsiSummary {
    pub sample_size: usize,
    pub mean: f64,
    pub sd: f64,
    pub p2_5: f64,
    pub p97_5: f64,
}

/// EVSI at one sample size, raw or smoothed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvsiEstimate {
    pub sample_size: usize,
    pub evsi: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnbsPoint {
    pub sample_size: usize,
    pub evsi: f64,
    pub cost: f64,
    pub enbs: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnbsAnalysis {
    pub points: Vec<EnbsPoint>,
    pub optimal_sample_size: usize,
    pub optimal_enbs: f64,
}

/// Runs the resampling loop. Summaries follow the order of `config.sample_sizes`.
pub fn resample_evsi(
    table: &PsaTable,
    config: &EvsiConfig,
    progress: &mut dyn AnalysisProgressObserver,
) -> Result<Vec<EvsiSummary>, EvsiError> {
    check_voi_table(table)?;
    if !config.lambda.is_finite() {
        return Err(EvsiError::InvalidLambda(config.lambda));
    }
    if config.sample_sizes.is_empty() {
        return Err(EvsiError::NoSampleSizes);
    }
    if config.simulations == 0 {
        return Err(EvsiError::NoSimulations);
    }
    let n_draws = table.n_draws();
    if let Some(&size) = config
        .sample_sizes
        .iter()
        .find(|&&size| size == 0 || size > n_draws)
    {
        return Err(EvsiError::InvalidSampleSize { size, n_draws });
    }

    let nmb = nmb_matrix(table.cost(), table.effect(), config.lambda);
    let stage = AnalysisStage::EvsiResampling;
    progress.on_stage_start(stage, config.sample_sizes.len() * config.simulations);
    log::info!(
        "Resampling EVSI at lambda = {} for {} sample sizes x {} simulations (seed {})",
        config.lambda,
        config.sample_sizes.len(),
        config.simulations,
        config.seed
    );

    let mut summaries = Vec::with_capacity(config.sample_sizes.len());
    for (size_idx, &size) in config.sample_sizes.iter().enumerate() {
        let first_task = (size_idx * config.simulations) as u64;
        let values: Vec<f64> = (0..config.simulations)
            .into_par_iter()
            .map(|sim| {
                let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(first_task + sim as u64));
                let rows = sample(&mut rng, n_draws, size).into_vec();
                evpi_from_nmb(nmb.select(Axis(0), &rows).view())
            })
            .collect();
        let summary = summarise(size, values);
        log::debug!(
            "EVSI(n = {size}) = {:.4} (sd {:.4}, 95% band {:.4}..{:.4})",
            summary.mean,
            summary.sd,
            summary.p2_5,
            summary.p97_5
        );
        summaries.push(summary);
        progress.on_stage_advance(stage, (size_idx + 1) * config.simulations);
    }
    progress.on_stage_finish(stage);
    Ok(summaries)
}

fn summarise(sample_size: usize, mut values: Vec<f64>) -> EvsiSummary {
    let n = values.len();
    let mean = values.iter().sum::<f64>() / n as f64;
    let sd = if n > 1 {
        (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
    } else {
        0.0
    };
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    EvsiSummary {
        sample_size,
        mean,
        sd,
        p2_5: percentile(&values, 0.025),
        p97_5: percentile(&values, 0.975),
    }
}

/// Linear-interpolation percentile of an ascending slice, `p` in `[0, 1]`.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let position = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = position.floor() as usize;
    let hi = position.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let weight = position - lo as f64;
    sorted[lo] * (1.0 - weight) + sorted[hi] * weight
}

/// Raw EVSI means as estimates.
pub fn raw_estimates(summaries: &[EvsiSummary]) -> Vec<EvsiEstimate> {
    summaries
        .iter()
        .map(|s| EvsiEstimate {
            sample_size: s.sample_size,
            evsi: s.mean,
        })
        .collect()
}

/// Smooths the EVSI means with a Gaussian process and predicts on every
/// sample size in `grid`. Each mean's noise is its Monte Carlo standard error.
pub fn smooth_evsi(
    summaries: &[EvsiSummary],
    simulations: usize,
    grid: &[usize],
) -> Result<Vec<EvsiEstimate>, EvsiError> {
    if simulations == 0 {
        return Err(EvsiError::NoSimulations);
    }
    let inputs: Vec<f64> = summaries.iter().map(|s| s.sample_size as f64).collect();
    let outputs: Vec<f64> = summaries.iter().map(|s| s.mean).collect();
    let errors: Vec<f64> = summaries
        .iter()
        .map(|s| s.sd / (simulations as f64).sqrt())
        .collect();
    let gp = GpSmoother::fit(&inputs, &outputs, &errors)?;
    Ok(grid
        .iter()
        .map(|&n| EvsiEstimate {
            sample_size: n,
            evsi: gp.predict(n as f64).max(0.0),
        })
        .collect())
}

/// Integer sample sizes spanning the observed range, at most `points` long.
pub fn smoothing_grid(summaries: &[EvsiSummary], points: usize) -> Vec<usize> {
    let (Some(lo), Some(hi)) = (
        summaries.iter().map(|s| s.sample_size).min(),
        summaries.iter().map(|s| s.sample_size).max(),
    ) else {
        return Vec::new();
    };
    if points <= 1 || lo == hi {
        return vec![lo];
    }
    let mut grid: Vec<usize> = (0..points)
        .map(|i| lo + ((hi - lo) as f64 * i as f64 / (points - 1) as f64).round() as usize)
        .collect();
    grid.dedup();
    grid
}

/// `ENBS(n) = population_scale · EVSI(n) − cost_per_patient · n`, maximised
/// over the supplied curve. The first maximum wins ties.
pub fn optimal_sample_size(
    curve: &[EvsiEstimate],
    population_scale: f64,
    cost_per_patient: f64,
) -> Result<EnbsAnalysis, EvsiError> {
    let valid = |v: f64| v.is_finite() && v >= 0.0;
    if !(valid(population_scale) && valid(cost_per_patient)) {
        return Err(EvsiError::InvalidResearchCost);
    }
    if curve.is_empty() {
        return Err(EvsiError::EmptyCurve);
    }
    let points: Vec<EnbsPoint> = curve
        .iter()
        .map(|estimate| {
            let cost = cost_per_patient * estimate.sample_size as f64;
            EnbsPoint {
                sample_size: estimate.sample_size,
                evsi: estimate.evsi,
                cost,
                enbs: population_scale * estimate.evsi - cost,
            }
        })
        .collect();
    let mut best = 0;
    for (idx, point) in points.iter().enumerate() {
        if point.enbs > points[best].enbs {
            best = idx;
        }
    }
    let (optimal_sample_size, optimal_enbs) = (points[best].sample_size, points[best].enbs);
    log::info!("Optimal research sample size is {optimal_sample_size} (ENBS {optimal_enbs:.2})");
    Ok(EnbsAnalysis {
        points,
        optimal_sample_size,
        optimal_enbs,
    })
}
