use crate::faer_ndarray::FaerCholesky;
use crate::prior::GpPrior;
use faer::Side;
use ndarray::{Array2, ArrayView2};

/// Expected Poisson intensity at `(t, n)` under the current parameters.
///
/// The linear predictor carries the usual regression and loading terms plus
/// the log-normal moment correction `0.5 * sum_l alpha^2 * V_l[t, t]`, since
/// the rate is an expectation over the Gaussian posterior of the latents, not
/// a plug-in of its mean. Non-finite values collapse to machine epsilon and
/// the output is floored there, keeping downstream linear algebra defined.
pub fn safe_rate(
    t: usize,
    n: usize,
    regressor: ArrayView2<f64>,
    post_mean: ArrayView2<f64>,
    post_cov: &[Array2<f64>],
    beta: ArrayView2<f64>,
    alpha: ArrayView2<f64>,
) -> f64 {
    let mut lograte = 0.0;
    for k in 0..regressor.ncols() {
        lograte += regressor[[t, k]] * beta[[k, n]];
    }
    for (l, cov_l) in post_cov.iter().enumerate() {
        let a = alpha[[l, n]];
        lograte += post_mean[[t, l]] * a + 0.5 * a * a * cov_l[[t, t]];
    }
    let rate = lograte.exp();
    if rate.is_finite() && rate > f64::EPSILON {
        rate
    } else {
        f64::EPSILON
    }
}

/// Refresh the cached intensity for every listed row/column pair.
pub fn refresh_rate(
    rate: &mut Array2<f64>,
    rows: impl IntoIterator<Item = usize> + Clone,
    cols: impl IntoIterator<Item = usize> + Clone,
    regressor: ArrayView2<f64>,
    post_mean: ArrayView2<f64>,
    post_cov: &[Array2<f64>],
    beta: ArrayView2<f64>,
    alpha: ArrayView2<f64>,
) {
    for t in rows {
        for n in cols.clone() {
            rate[[t, n]] = safe_rate(t, n, regressor, post_mean, post_cov, beta, alpha);
        }
    }
}

/// Evidence lower bound under the current parameters.
///
/// Poisson term plus, per latent, the Gaussian cross-entropy terms
/// `-0.5 d^T K^{-1} d - 0.5 tr(K^{-1} V) + 0.5 log det V`. The quadratic and
/// trace terms go through the cached prior Cholesky rather than an explicit
/// inverse. A posterior slice that has lost positive-definiteness makes the
/// log-determinant undefined; the bound is then `-inf`, which the step
/// acceptance logic treats as a rejection.
pub fn lower_bound(
    spike: ArrayView2<f64>,
    regressor: ArrayView2<f64>,
    beta: ArrayView2<f64>,
    alpha: ArrayView2<f64>,
    prior: &GpPrior,
    prior_mean: ArrayView2<f64>,
    post_mean: ArrayView2<f64>,
    post_cov: &[Array2<f64>],
    rate: &Array2<f64>,
) -> f64 {
    let lin = regressor.dot(&beta) + post_mean.dot(&alpha);
    let mut lb = (&spike * &lin - rate).sum();

    for (l, cov_l) in post_cov.iter().enumerate() {
        let d = &post_mean.column(l) - &prior_mean.column(l);
        let solved = prior.factor[l].solve_vec(&d);
        lb -= 0.5 * d.dot(&solved);

        let solved_cov = prior.factor[l].solve_mat(cov_l);
        lb -= 0.5 * solved_cov.diag().sum();

        match cov_l.cholesky(Side::Lower) {
            Ok(factor) => lb += 0.5 * factor.log_det(),
            Err(_) => return f64::NEG_INFINITY,
        }
    }
    lb
}
