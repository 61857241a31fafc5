use crate::faer_ndarray::{FaerCholesky, FaerCholeskyFactor, FaerLinalgError};
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1};

/// Jitter added to the dense prior covariance so its Cholesky always exists.
const COV_JITTER: f64 = 1e-7;

/// Dense squared-exponential covariance over a regular 1-D time grid.
///
/// `omega` is the inverse squared lengthscale: `k(i, j) = var * exp(-omega *
/// (i - j)^2)`.
pub fn sqexp_cov(n: usize, omega: f64, var: f64) -> Array2<f64> {
    Array2::from_shape_fn((n, n), |(i, j)| {
        let d = i as f64 - j as f64;
        var * (-omega * d * d).exp()
    })
}

/// Incomplete Cholesky factorization of the unit-variance squared-exponential
/// kernel over `0..n`.
///
/// Greedy pivoted: each step selects the index with the largest residual
/// diagonal, computes the corresponding factor column, and subtracts its
/// contribution from the residual. Stops once the residual trace drops below
/// `tol`, so `G * G^T` reconstructs the kernel to within `tol` in trace norm.
/// Returns `G` of shape (n, m) with `m <= n`, rows in original index order.
pub fn ichol_gauss(n: usize, omega: f64, tol: f64) -> Array2<f64> {
    let mut diag = vec![1.0f64; n];
    let mut pvec: Vec<usize> = (0..n).collect();
    let mut g = Array2::<f64>::zeros((n, n));

    let mut rank = 0;
    while rank < n && diag[rank..].iter().sum::<f64>() > tol {
        let jast = rank
            + diag[rank..]
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap_or(0);
        pvec.swap(rank, jast);
        diag.swap(rank, jast);
        for c in 0..rank {
            let tmp = g[[rank, c]];
            g[[rank, c]] = g[[jast, c]];
            g[[jast, c]] = tmp;
        }

        let pivot = diag[rank].max(0.0).sqrt();
        if pivot == 0.0 {
            break;
        }
        g[[rank, rank]] = pivot;
        for j in rank + 1..n {
            let d = pvec[j] as f64 - pvec[rank] as f64;
            let kij = (-omega * d * d).exp();
            let mut dot = 0.0;
            for c in 0..rank {
                dot += g[[j, c]] * g[[rank, c]];
            }
            g[[j, rank]] = (kij - dot) / pivot;
            diag[j] = 1.0
                - (0..=rank).map(|c| g[[j, c]] * g[[j, c]]).sum::<f64>();
        }
        rank += 1;
    }

    // Undo the pivoting so row r of the output corresponds to time index r.
    let mut out = Array2::<f64>::zeros((n, rank));
    for r in 0..n {
        for c in 0..rank {
            out[[pvec[r], c]] = g[[r, c]];
        }
    }
    out
}

/// Fixed GP prior over the latent trajectories: per-latent dense covariance,
/// its cached Cholesky, a rank-reduced factor, and the precision derived from
/// that factor.
pub struct GpPrior {
    /// Prior variance per latent; mutated only by hyperparameter re-estimation.
    pub variance: Array1<f64>,
    /// Inverse squared lengthscale per latent.
    pub omega: Array1<f64>,
    /// Dense jittered covariance, one (T, T) slice per latent.
    pub cov: Vec<Array2<f64>>,
    /// Prior precision, one (T, T) slice per latent.
    pub prec: Vec<Array2<f64>>,
    /// Cholesky of `cov`, used for every solve against the prior covariance.
    pub factor: Vec<FaerCholeskyFactor>,
    /// Rank-reduced Cholesky factors; ragged, one (T, m_l) matrix per latent.
    pub ichol: Vec<Array2<f64>>,
}

impl GpPrior {
    /// Build the prior for `n_steps` timepoints from per-latent variance and
    /// inverse squared lengthscale.
    ///
    /// The precision follows the rank-reduced route: with `G` the incomplete
    /// factor of the unit-variance kernel, the precision is
    /// `(G^+)^T G^+ / var`, the pseudo-inverse of `G G^T` scaled by the
    /// variance.
    pub fn new(
        n_steps: usize,
        variance: ArrayView1<f64>,
        omega: ArrayView1<f64>,
        ichol_tol: f64,
    ) -> Result<Self, FaerLinalgError> {
        let n_latents = variance.len();
        let mut cov = Vec::with_capacity(n_latents);
        let mut prec = Vec::with_capacity(n_latents);
        let mut factor = Vec::with_capacity(n_latents);
        let mut ichol = Vec::with_capacity(n_latents);

        for l in 0..n_latents {
            let mut kl = sqexp_cov(n_steps, omega[l], variance[l]);
            for t in 0..n_steps {
                kl[[t, t]] += COV_JITTER;
            }
            factor.push(kl.cholesky(Side::Lower)?);

            let g = ichol_gauss(n_steps, omega[l], ichol_tol);
            let rank = g.ncols();
            let mut gtg = g.t().dot(&g);
            for c in 0..rank {
                gtg[[c, c]] += COV_JITTER;
            }
            let gtg_factor = gtg.cholesky(Side::Lower)?;
            // G^+ = (G^T G)^{-1} G^T, shape (m, T).
            let pinv = gtg_factor.solve_mat(&g.t().to_owned());
            let prec_l = pinv.t().dot(&pinv) / variance[l];

            cov.push(kl);
            prec.push(prec_l);
            ichol.push(g);
        }

        Ok(Self {
            variance: variance.to_owned(),
            omega: omega.to_owned(),
            cov,
            prec,
            factor,
            ichol,
        })
    }

    pub fn n_latents(&self) -> usize {
        self.variance.len()
    }

    /// Rescale latent `l` to a new prior variance and refresh the cached
    /// Cholesky. Used by the gated hyperparameter re-estimation branch.
    pub fn rescale(&mut self, l: usize, new_variance: f64) -> Result<(), FaerLinalgError> {
        let ratio = new_variance / self.variance[l];
        self.cov[l] *= ratio;
        self.prec[l] /= ratio;
        self.factor[l] = self.cov[l].cholesky(Side::Lower)?;
        self.variance[l] = new_variance;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn max_abs_diff(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
        a.iter()
            .zip(b.iter())
            .fold(0.0f64, |acc, (&x, &y)| acc.max((x - y).abs()))
    }

    #[test]
    fn ichol_reconstructs_unit_lengthscale_kernel() {
        let n = 500;
        let omega = 1.0;
        let g = ichol_gauss(n, omega, 1e-10);
        let k = sqexp_cov(n, omega, 1.0);
        let rec = g.dot(&g.t());
        assert!(
            max_abs_diff(&k, &rec) < 1e-6,
            "reconstruction error {:.3e}",
            max_abs_diff(&k, &rec)
        );
    }

    #[test]
    fn ichol_rank_shrinks_with_smooth_kernels() {
        // A long lengthscale makes the kernel numerically low-rank.
        let g = ichol_gauss(200, 1e-4, 1e-7);
        assert!(g.ncols() < 200 / 2, "rank {} not reduced", g.ncols());
        let k = sqexp_cov(200, 1e-4, 1.0);
        let rec = g.dot(&g.t());
        assert!(max_abs_diff(&k, &rec) < 1e-3);
    }

    #[test]
    fn prior_precision_is_a_pseudo_inverse_of_the_covariance() {
        let variance = array![1.5];
        let omega = array![0.1];
        let prior = GpPrior::new(60, variance.view(), omega.view(), 1e-10)
            .expect("prior construction must succeed");
        // The truncated precision damps directions below the tolerance, so
        // K * P is not the identity; the stable property is K * P * K = K.
        let kpk = prior.cov[0].dot(&prior.prec[0]).dot(&prior.cov[0]);
        assert!(
            max_abs_diff(&kpk, &prior.cov[0]) < 1e-3,
            "K*P*K deviates from K by {:.3e}",
            max_abs_diff(&kpk, &prior.cov[0])
        );
    }

    #[test]
    fn rescale_keeps_cov_and_precision_consistent() {
        let variance = array![1.0];
        let omega = array![0.5];
        let mut prior = GpPrior::new(30, variance.view(), omega.view(), 1e-10)
            .expect("prior construction must succeed");
        let cov_before = prior.cov[0].clone();
        let prec_before = prior.prec[0].clone();
        prior.rescale(0, 2.0).expect("rescale must succeed");
        assert!(max_abs_diff(&prior.cov[0], &(&cov_before * 2.0)) < 1e-12);
        assert!(max_abs_diff(&prior.prec[0], &(&prec_before / 2.0)) < 1e-12);
        assert_eq!(prior.variance[0], 2.0);
    }
}
