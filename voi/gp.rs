//! Gaussian-process smoother for the EVSI curve.
//!
//! Squared-exponential kernel with a constant mean. Hyperparameters are set
//! from the data rather than optimised: the length scale is half the range of
//! the inputs, the signal variance is the variance of the outputs, and each
//! observation carries its own noise (its squared standard error plus a small
//! jitter).

use crate::voi::linalg::{LinalgError, cholesky};
use ndarray::{Array1, Array2};
use thiserror::Error;

/// Jitter added to every diagonal entry, relative to the signal variance.
const RELATIVE_JITTER: f64 = 1e-6;

#[derive(Error, Debug)]
pub enum GpError {
    #[error("A Gaussian process needs at least one observation.")]
    Empty,
    #[error("Inputs, outputs and standard errors must have equal lengths ({x}, {y}, {se}).")]
    LengthMismatch { x: usize, y: usize, se: usize },
    #[error("Gaussian-process observations must be finite.")]
    NonFinite,
    #[error(transparent)]
    Linalg(#[from] LinalgError),
}

#[derive(Debug, Clone)]
pub struct GpSmoother {
    inputs: Vec<f64>,
    weights: Array1<f64>,
    mean: f64,
    length_scale: f64,
    signal_variance: f64,
}

impl GpSmoother {
    pub fn fit(inputs: &[f64], outputs: &[f64], standard_errors: &[f64]) -> Result<Self, GpError> {
        let n = inputs.len();
        if n == 0 {
            return Err(GpError::Empty);
        }
        if outputs.len() != n || standard_errors.len() != n {
            return Err(GpError::LengthMismatch {
                x: n,
                y: outputs.len(),
                se: standard_errors.len(),
            });
        }
        if inputs
            .iter()
            .chain(outputs)
            .chain(standard_errors)
            .any(|v| !v.is_finite())
        {
            return Err(GpError::NonFinite);
        }

        let mean = outputs.iter().sum::<f64>() / n as f64;
        let signal_variance = outputs.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / n as f64;
        let (lo, hi) = inputs
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)));
        let range = hi - lo;
        let length_scale = if range > 0.0 { range / 2.0 } else { 1.0 };

        if signal_variance <= 0.0 {
            log::debug!("EVSI curve is flat; Gaussian-process smoother reduces to its mean");
            return Ok(Self {
                inputs: inputs.to_vec(),
                weights: Array1::zeros(n),
                mean,
                length_scale,
                signal_variance: 0.0,
            });
        }

        let mut gram = Array2::<f64>::zeros((n, n));
        for i in 0..n {
            for j in 0..n {
                gram[[i, j]] = kernel(inputs[i], inputs[j], length_scale, signal_variance);
            }
            gram[[i, i]] += RELATIVE_JITTER * signal_variance + standard_errors[i].powi(2);
        }
        let centred = Array1::from_iter(outputs.iter().map(|y| y - mean));
        let weights = cholesky(gram.view())?.solve(centred.view())?;

        Ok(Self {
            inputs: inputs.to_vec(),
            weights,
            mean,
            length_scale,
            signal_variance,
        })
    }

    /// Posterior mean at `x`.
    pub fn predict(&self, x: f64) -> f64 {
        self.mean
            + self
                .inputs
                .iter()
                .zip(self.weights.iter())
                .map(|(&xi, &w)| w * kernel(x, xi, self.length_scale, self.signal_variance))
                .sum::<f64>()
    }
}

fn kernel(a: f64, b: f64, length_scale: f64, signal_variance: f64) -> f64 {
    let d = (a - b) / length_scale;
    signal_variance * (-0.5 * d * d).exp()
}
