use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine-only optimizer configuration.
///
/// Controls the outer coordinate-ascent loop; model structure (latent count,
/// regression order, priors) is passed separately to [`crate::fit_latent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitControl {
    /// Maximum number of outer iterations.
    pub max_iterations: usize,
    /// Inner fixed-point repetitions for each posterior-variance diagonal.
    pub fixed_point_iterations: usize,
    /// Convergence tolerance on the maximum parameter change per iteration.
    pub tolerance: f64,
    /// Emit per-iteration summaries at `info` level.
    pub verbose: bool,
}

impl Default for FitControl {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            fixed_point_iterations: 3,
            tolerance: 1e-4,
            verbose: false,
        }
    }
}

/// Warm starts, freeze flags and model switches for one fit.
///
/// Every field has a neutral default; callers set only what they need.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FitOptions {
    /// Initial loading coefficients, (L, N). Random draw scaled to
    /// `alpha_norm` when absent.
    pub alpha0: Option<Array2<f64>>,
    /// Initial history/intercept coefficients, (intercept + p*N, N).
    /// Ridge least squares of counts on the regressor when absent.
    pub beta0: Option<Array2<f64>>,
    /// Initial posterior mean, (T, L). Prior mean when absent.
    pub mean0: Option<Array2<f64>>,
    /// Initial posterior covariance, one (T, T) slice per latent.
    /// Prior covariance when absent.
    pub cov0: Option<Vec<Array2<f64>>>,
    /// Initial posterior precision slices; only the diagonal is tracked.
    pub prec0: Option<Vec<Array2<f64>>>,
    /// Freeze the loading coefficients at their initial values.
    pub fix_alpha: bool,
    /// Freeze the history coefficients at their initial values.
    pub fix_beta: bool,
    /// Freeze the posterior mean at its initial values.
    pub fix_mean: bool,
    /// Freeze the posterior covariance at its initial values.
    pub fix_cov: bool,
    /// Target Euclidean norm of each loading row. Zero means the default (1).
    pub alpha_norm: f64,
    /// Include an intercept column in the history regressor.
    pub intercept: bool,
    /// Re-estimate prior variances from the posterior after each iteration.
    pub hyper: bool,
    /// Stopping tolerance of the incomplete Cholesky of the prior kernel.
    /// Zero means the default (1e-7).
    pub ichol_tolerance: f64,
    /// Seed for the default loading initialization.
    pub seed: u64,
}

impl FitOptions {
    /// Defaults matching a plain fit: intercept on, nothing frozen,
    /// unit loading norm.
    pub fn new() -> Self {
        Self {
            intercept: true,
            alpha_norm: 1.0,
            ichol_tolerance: 1e-7,
            ..Self::default()
        }
    }

    pub(crate) fn effective_alpha_norm(&self) -> f64 {
        if self.alpha_norm > 0.0 { self.alpha_norm } else { 1.0 }
    }

    pub(crate) fn effective_ichol_tolerance(&self) -> f64 {
        if self.ichol_tolerance > 0.0 {
            self.ichol_tolerance
        } else {
            1e-7
        }
    }
}

/// Everything a run produces, including the initial coefficients actually
/// used so a run can be reproduced from its output.
#[derive(Debug, Clone)]
pub struct FitResult {
    /// ELBO after each completed iteration; index 0 is the initial value.
    pub lower_bound: Vec<f64>,
    /// Posterior mean trajectories, (T, L).
    pub post_mean: Array2<f64>,
    /// Posterior covariance, one (T, T) slice per latent.
    pub post_cov: Vec<Array2<f64>>,
    /// Loading coefficients, (L, N).
    pub alpha: Array2<f64>,
    /// History/intercept coefficients, (intercept + p*N, N).
    pub beta: Array2<f64>,
    /// Loadings the optimization started from.
    pub alpha0: Array2<f64>,
    /// History coefficients the optimization started from.
    pub beta0: Array2<f64>,
    /// Wall-clock time spent in the optimizer.
    pub elapsed: Duration,
    /// Whether the parameter deltas dropped below tolerance in budget.
    pub converged: bool,
}
