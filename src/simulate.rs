use crate::faer_ndarray::{FaerCholesky, FaerLinalgError};
use crate::prior::sqexp_cov;
use faer::Side;
use ndarray::{Array1, Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Poisson, StandardNormal};

/// Draw zero-mean GP latent trajectories from the squared-exponential prior.
///
/// Sampling goes through the jittered covariance Cholesky: `x = std * L z`
/// with `z` standard normal, one independent draw per latent dimension.
pub fn gp_latents(
    n_latents: usize,
    n_steps: usize,
    std: f64,
    omega: f64,
    seed: u64,
) -> Result<Array2<f64>, FaerLinalgError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut cov = sqexp_cov(n_steps, omega, 1.0);
    for t in 0..n_steps {
        cov[[t, t]] += 1e-7;
    }
    let lower = cov.cholesky(Side::Lower)?.lower_triangular();

    let mut latent = Array2::<f64>::zeros((n_steps, n_latents));
    for l in 0..n_latents {
        let z = Array1::from_shape_fn(n_steps, |_| rng.sample::<f64, _>(StandardNormal));
        let sample = lower.dot(&z);
        for t in 0..n_steps {
            latent[[t, l]] = std * sample[t];
        }
    }
    Ok(latent)
}

/// Simulate spike trains driven by known latent trajectories.
///
/// The regressor rolls forward one bin at a time, so each simulated spike
/// feeds back into the history of the following bins exactly as the fitted
/// model assumes. Counts are thresholded to {0, 1}: a Poisson draw above zero
/// registers as a single spike per bin.
///
/// Returns `(spike, regressor, rate)` with shapes (T, N), (T, k), (T, N).
pub fn poisson_spikes(
    latent: ArrayView2<f64>,
    alpha: ArrayView2<f64>,
    beta: ArrayView2<f64>,
    intercept: bool,
    prehistory: Option<ArrayView2<f64>>,
    seed: u64,
) -> (Array2<f64>, Array2<f64>, Array2<f64>) {
    let (n_steps, _) = latent.dim();
    let n_neurons = alpha.ncols();
    let k = beta.nrows();
    let icpt = usize::from(intercept);
    let order = (k - icpt) / n_neurons.max(1);

    let mut rng = StdRng::seed_from_u64(seed);
    let mut spike = Array2::<f64>::zeros((n_steps, n_neurons));
    let mut regressor = Array2::<f64>::ones((n_steps, k));
    let mut rate = Array2::<f64>::zeros((n_steps, n_neurons));

    if let Some(y0) = prehistory {
        for t in 0..order.min(y0.nrows()) {
            let mut col = icpt;
            for s in t..y0.nrows() {
                for j in 0..n_neurons {
                    regressor[[t, col]] = y0[[s, j]];
                    col += 1;
                }
            }
        }
    }

    for t in 0..n_steps {
        for n in 0..n_neurons {
            let mut lograte = 0.0;
            for c in 0..k {
                lograte += regressor[[t, c]] * beta[[c, n]];
            }
            for l in 0..alpha.nrows() {
                lograte += latent[[t, l]] * alpha[[l, n]];
            }
            rate[[t, n]] = lograte.exp();
            let draw = Poisson::new(rate[[t, n]].max(f64::EPSILON))
                .map(|d| d.sample(&mut rng))
                .unwrap_or(0.0);
            spike[[t, n]] = if draw > 0.0 { 1.0 } else { 0.0 };
        }
        if t + 1 < n_steps && order > 0 {
            // Shift the history window left by one lag and append this bin.
            for c in icpt..k - n_neurons {
                regressor[[t + 1, c]] = regressor[[t, c + n_neurons]];
            }
            for j in 0..n_neurons {
                regressor[[t + 1, icpt + (order - 1) * n_neurons + j]] = spike[[t, j]];
            }
        }
    }

    (spike, regressor, rate)
}
