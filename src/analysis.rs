//! RMS emittance and Twiss parameters from a measured phase-space
//! distribution.
//!
//! All quantities are SI: positions in metres, angles in radians, so the
//! emittance comes out in m·rad.

use crate::error::ScannerError;
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Second-moment description of a beam in one transverse plane
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TwissResult {
    /// sqrt(σxx·σx'x' − σxx'²), m·rad
    pub rms_emittance: f64,
    pub alpha: f64,
    /// m/rad
    pub beta: f64,
    /// rad/m
    pub gamma: f64,
}

impl TwissResult {
    /// Emittance as reported to operators, 4·ε_rms
    pub fn emittance(&self) -> f64 {
        4.0 * self.rms_emittance
    }

    /// Emittance in mm·mrad
    pub fn emittance_mm_mrad(&self) -> f64 {
        self.emittance() * 1e6
    }

    /// β·γ − α², unity for a consistent parameter set
    pub fn invariant(&self) -> f64 {
        self.beta * self.gamma - self.alpha * self.alpha
    }
}

/// Weighted moments of a current matrix
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Moments {
    pub mean_position: f64,
    pub mean_momentum: f64,
    pub sigma_xx: f64,
    pub sigma_pp: f64,
    pub sigma_xp: f64,
}

/// First and central second moments of `matrix`.
///
/// Rows follow `momenta`, columns follow `positions`.
pub fn moments(
    matrix: &Array2<f64>,
    positions: &[f64],
    momenta: &[f64],
) -> Result<Moments, ScannerError> {
    let (rows, cols) = matrix.dim();
    if rows != momenta.len() || cols != positions.len() {
        return Err(ScannerError::ShapeMismatch {
            rows,
            cols,
            expected_rows: momenta.len(),
            expected_cols: positions.len(),
        });
    }

    let total = matrix.sum();
    if !(total.is_finite() && total > 0.0) {
        return Err(ScannerError::EmptyMatrix);
    }

    // Projections onto each axis
    let position_profile = matrix.sum_axis(Axis(0));
    let momentum_profile = matrix.sum_axis(Axis(1));

    let mean_position = position_profile
        .iter()
        .zip(positions)
        .map(|(w, x)| w * x)
        .sum::<f64>()
        / total;
    let mean_momentum = momentum_profile
        .iter()
        .zip(momenta)
        .map(|(w, p)| w * p)
        .sum::<f64>()
        / total;

    let sigma_xx = position_profile
        .iter()
        .zip(positions)
        .map(|(w, x)| w * (x - mean_position).powi(2))
        .sum::<f64>()
        / total;
    let sigma_pp = momentum_profile
        .iter()
        .zip(momenta)
        .map(|(w, p)| w * (p - mean_momentum).powi(2))
        .sum::<f64>()
        / total;

    let sigma_xp = matrix
        .indexed_iter()
        .map(|((i, j), w)| w * (positions[j] - mean_position) * (momenta[i] - mean_momentum))
        .sum::<f64>()
        / total;

    Ok(Moments {
        mean_position,
        mean_momentum,
        sigma_xx,
        sigma_pp,
        sigma_xp,
    })
}

/// RMS emittance and Twiss parameters of a current matrix.
///
/// A non-positive radicand means the distribution has no phase-space area
/// (a single line or point) and is reported rather than coerced.
pub fn analyze(
    matrix: &Array2<f64>,
    positions: &[f64],
    momenta: &[f64],
) -> Result<TwissResult, ScannerError> {
    let m = moments(matrix, positions, momenta)?;

    let radicand = m.sigma_xx * m.sigma_pp - m.sigma_xp * m.sigma_xp;
    if !(radicand.is_finite() && radicand > 0.0) {
        return Err(ScannerError::DegenerateDistribution(radicand));
    }
    let rms_emittance = radicand.sqrt();

    Ok(TwissResult {
        rms_emittance,
        alpha: -m.sigma_xp / rms_emittance,
        beta: m.sigma_xx / rms_emittance,
        gamma: m.sigma_pp / rms_emittance,
    })
}

/// `n` points of the ellipse enclosing 4·ε_rms, θ stepping over [0, 2π)
pub fn matched_ellipse(twiss: &TwissResult, n: usize) -> Vec<(f64, f64)> {
    let eps4 = 4.0 * twiss.rms_emittance;
    let x_amplitude = (eps4 * twiss.beta).sqrt();
    let p_amplitude = (eps4 / twiss.beta).sqrt();

    (0..n)
        .map(|k| {
            let theta = 2.0 * PI * k as f64 / n as f64;
            let x = x_amplitude * theta.cos();
            let p = -p_amplitude * (twiss.alpha * theta.cos() + theta.sin());
            (x, p)
        })
        .collect()
}
