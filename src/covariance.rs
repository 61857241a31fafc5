use crate::moments::safe_rate;
use ndarray::{Array1, Array2, ArrayView2};

/// In-place update of one latent dimension's posterior covariance slice.
///
/// For each timepoint `t` the diagonal entry solves the fixed-point equation
/// `V[t,t] = 1 / (prior_prec[t,t] - k + sum_n rate[t,n] * alpha[l,n]^2)`,
/// where `k = prec_diag[t] - 1/V_old[t,t]` is held fixed across the inner
/// repetitions and the rate row is refreshed after every repetition so the
/// moment correction sees the new diagonal. The change then propagates to the
/// rest of row/column `t` by a rank-one correction of the complementary block
/// followed by a rescale of the row and column, and the tracked precision
/// diagonal is updated to match.
///
/// A denominator that is non-finite or not strictly positive would destroy
/// the positive-definiteness invariant; such timepoints are skipped with a
/// debug log and their entries left untouched.
#[allow(clippy::too_many_arguments)]
pub fn update_latent_covariance(
    l: usize,
    fixed_point_iterations: usize,
    regressor: ArrayView2<f64>,
    post_mean: ArrayView2<f64>,
    post_cov: &mut [Array2<f64>],
    prec_diag: &mut Array2<f64>,
    rate: &mut Array2<f64>,
    prior_prec_l: &Array2<f64>,
    beta: ArrayView2<f64>,
    alpha: ArrayView2<f64>,
) {
    let (n_steps, n_neurons) = rate.dim();
    let eps = 2.0 * f64::EPSILON;

    for t in 0..n_steps {
        let old_vtt = post_cov[l][[t, t]];
        let k_tilde = prec_diag[[l, t]] - 1.0 / old_vtt;

        let mut skipped = false;
        for _ in 0..fixed_point_iterations {
            let mut coupling = 0.0;
            for n in 0..n_neurons {
                let a = alpha[[l, n]];
                coupling += rate[[t, n]] * a * a;
            }
            let denom = prior_prec_l[[t, t]] - k_tilde + coupling;
            if !denom.is_finite() || denom <= eps {
                log::debug!(
                    "covariance update skipped at latent {l}, time {t}: denominator {denom:.3e}"
                );
                post_cov[l][[t, t]] = old_vtt;
                skipped = true;
                break;
            }
            post_cov[l][[t, t]] = 1.0 / denom;
            for n in 0..n_neurons {
                rate[[t, n]] = safe_rate(t, n, regressor, post_mean, post_cov, beta, alpha);
            }
        }
        if skipped {
            for n in 0..n_neurons {
                rate[[t, n]] = safe_rate(t, n, regressor, post_mean, post_cov, beta, alpha);
            }
            continue;
        }

        let new_vtt = post_cov[l][[t, t]];
        let row_old: Array1<f64> = post_cov[l].row(t).to_owned();
        let scale = (new_vtt - old_vtt) / (old_vtt * old_vtt);
        let cov_l = &mut post_cov[l];
        for i in 0..n_steps {
            if i == t {
                continue;
            }
            for j in 0..n_steps {
                if j == t {
                    continue;
                }
                cov_l[[i, j]] += scale * row_old[i] * row_old[j];
            }
        }
        for j in 0..n_steps {
            if j == t {
                continue;
            }
            let v = new_vtt * row_old[j] / old_vtt;
            cov_l[[t, j]] = v;
            cov_l[[j, t]] = v;
        }

        prec_diag[[l, t]] = k_tilde + 1.0 / new_vtt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::make_regressor;
    use approx::assert_abs_diff_eq;
    use crate::moments::refresh_rate;
    use crate::prior::GpPrior;
    use ndarray::array;

    fn setup() -> (
        Array2<f64>,
        Array2<f64>,
        Array2<f64>,
        Array2<f64>,
        Vec<Array2<f64>>,
        Array2<f64>,
        Array2<f64>,
        GpPrior,
    ) {
        let spike = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0], [0.0, 0.0]];
        let regressor = make_regressor(spike.view(), 1, true);
        let beta = Array2::from_elem((regressor.ncols(), 2), -0.1);
        let alpha = array![[0.6, -0.4]];
        let post_mean = Array2::<f64>::zeros((4, 1));
        let prior = GpPrior::new(4, array![1.0].view(), array![0.5].view(), 1e-12)
            .expect("prior construction must succeed");
        let post_cov = vec![prior.cov[0].clone()];
        let mut prec_diag = Array2::<f64>::zeros((1, 4));
        for t in 0..4 {
            prec_diag[[0, t]] = prior.prec[0][[t, t]];
        }
        let mut rate = Array2::<f64>::zeros((4, 2));
        refresh_rate(
            &mut rate,
            0..4,
            0..2,
            regressor.view(),
            post_mean.view(),
            &post_cov,
            beta.view(),
            alpha.view(),
        );
        (spike, regressor, beta, alpha, post_cov, prec_diag, rate, prior)
    }

    #[test]
    fn update_preserves_symmetry_and_positive_diagonal() {
        let (_, regressor, beta, alpha, mut post_cov, mut prec_diag, mut rate, prior) = setup();
        let post_mean = Array2::<f64>::zeros((4, 1));
        update_latent_covariance(
            0,
            3,
            regressor.view(),
            post_mean.view(),
            &mut post_cov,
            &mut prec_diag,
            &mut rate,
            &prior.prec[0],
            beta.view(),
            alpha.view(),
        );
        let v = &post_cov[0];
        for t in 0..4 {
            assert!(v[[t, t]] > 0.0, "diagonal entry {t} not positive");
            for s in 0..4 {
                assert_abs_diff_eq!(v[[t, s]], v[[s, t]], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn update_shrinks_variance_under_observations() {
        // Observed spikes are informative, so the posterior marginal variance
        // should drop below the prior variance.
        let (_, regressor, beta, alpha, mut post_cov, mut prec_diag, mut rate, prior) = setup();
        let post_mean = Array2::<f64>::zeros((4, 1));
        let prior_diag: Vec<f64> = (0..4).map(|t| post_cov[0][[t, t]]).collect();
        update_latent_covariance(
            0,
            3,
            regressor.view(),
            post_mean.view(),
            &mut post_cov,
            &mut prec_diag,
            &mut rate,
            &prior.prec[0],
            beta.view(),
            alpha.view(),
        );
        for t in 0..4 {
            assert!(post_cov[0][[t, t]] < prior_diag[t] + 1e-12);
        }
    }

    #[test]
    fn zero_fixed_point_iterations_leave_state_untouched() {
        let (_, regressor, beta, alpha, mut post_cov, mut prec_diag, mut rate, prior) = setup();
        let post_mean = Array2::<f64>::zeros((4, 1));
        let cov_before = post_cov[0].clone();
        let prec_before = prec_diag.clone();
        let rate_before = rate.clone();
        update_latent_covariance(
            0,
            0,
            regressor.view(),
            post_mean.view(),
            &mut post_cov,
            &mut prec_diag,
            &mut rate,
            &prior.prec[0],
            beta.view(),
            alpha.view(),
        );
        let max_cov_delta = post_cov[0]
            .iter()
            .zip(cov_before.iter())
            .fold(0.0f64, |acc, (&a, &b)| acc.max((a - b).abs()));
        assert!(max_cov_delta < 1e-12);
        assert_eq!(rate, rate_before);
        // With an unchanged diagonal the tracked precision entry is rewritten
        // to the same value.
        for t in 0..4 {
            assert!((prec_diag[[0, t]] - prec_before[[0, t]]).abs() < 1e-9);
        }
    }
}
