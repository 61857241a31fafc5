use crate::faer_ndarray::FaerQr;
use ndarray::{Array2, ArrayView2};

/// Orthogonalize latent trajectories against their loadings.
///
/// Factors `x = Q R` and returns `(Q, R a)`, so the product `x * a` is
/// preserved while the returned trajectories have orthonormal columns. Used
/// to remove the rotational gauge freedom between latents and loadings when
/// presenting a fit.
pub fn orthogonalize(x: ArrayView2<f64>, a: ArrayView2<f64>) -> (Array2<f64>, Array2<f64>) {
    let (q, r) = x.qr();
    (q, r.dot(&a))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    #[test]
    fn orthogonalization_preserves_the_product() {
        let mut rng = StdRng::seed_from_u64(0);
        let n = 500;
        let p = 200;
        let q = 100;
        let x = Array2::from_shape_fn((n, q), |_| rng.sample::<f64, _>(StandardNormal));
        let a = Array2::from_shape_fn((q, p), |_| rng.random::<f64>());

        let (x_orth, a_orth) = orthogonalize(x.view(), a.view());
        let original = x.dot(&a);
        let transformed = x_orth.dot(&a_orth);
        let max_err = original
            .iter()
            .zip(transformed.iter())
            .fold(0.0f64, |acc, (&u, &v)| acc.max((u - v).abs()));
        assert!(max_err < 1e-8, "product changed by {max_err:.3e}");

        let gram = x_orth.t().dot(&x_orth);
        for i in 0..q {
            for j in 0..q {
                let target = if i == j { 1.0 } else { 0.0 };
                assert!((gram[[i, j]] - target).abs() < 1e-8);
            }
        }
    }
}
