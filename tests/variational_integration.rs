use gpcount::{FitControl, FitOptions, fit_latent, gp_latents, poisson_spikes, sqexp_cov};
use ndarray::{Array2, array};

const T: usize = 50;
const N: usize = 3;
const OMEGA: f64 = 1e-2;

fn simulate_session(seed: u64) -> Array2<f64> {
    let latent = gp_latents(1, T, 1.0, OMEGA, seed).expect("latent sampling must succeed");
    let alpha = array![[1.0, 0.8, -0.9]];
    let mut beta = Array2::<f64>::zeros((1 + N, N));
    beta.row_mut(0).fill(-1.0);
    for r in 1..1 + N {
        beta.row_mut(r).fill(-0.1);
    }
    let (spike, _, _) = poisson_spikes(latent.view(), alpha.view(), beta.view(), true, None, seed);
    spike
}

fn default_fit(
    spike: &Array2<f64>,
    options: &FitOptions,
    control: &FitControl,
) -> gpcount::FitResult {
    let prior_mean = Array2::<f64>::zeros((T, 1));
    fit_latent(
        spike.view(),
        1,
        prior_mean.view(),
        array![1.0].view(),
        array![OMEGA].view(),
        options,
        control,
    )
    .expect("fit must succeed on well-formed input")
}

#[test]
fn synthetic_session_converges_and_improves_the_bound() {
    let spike = simulate_session(42);
    let result = default_fit(&spike, &FitOptions::new(), &FitControl::default());

    assert!(result.converged, "optimizer did not converge in budget");
    let first = result.lower_bound[0];
    let last = *result.lower_bound.last().expect("trajectory is non-empty");
    assert!(
        last > first,
        "final bound {last:.6} not above initial {first:.6}"
    );
    assert!(result.elapsed.as_nanos() > 0);
    assert_eq!(result.alpha.dim(), (1, N));
    assert_eq!(result.beta.dim(), (1 + N, N));
}

#[test]
fn lower_bound_trajectory_is_monotone_up_to_float_tolerance() {
    let spike = simulate_session(7);
    let control = FitControl {
        max_iterations: 60,
        ..FitControl::default()
    };
    let result = default_fit(&spike, &FitOptions::new(), &control);

    for w in result.lower_bound.windows(2) {
        let slack = 1e-6 * w[0].abs().max(1.0);
        assert!(
            w[1] >= w[0] - slack,
            "bound decreased from {:.9} to {:.9}",
            w[0],
            w[1]
        );
    }
}

#[test]
fn loading_rows_keep_the_target_norm() {
    let spike = simulate_session(3);
    let options = FitOptions {
        alpha_norm: 2.0,
        ..FitOptions::new()
    };
    let control = FitControl {
        max_iterations: 30,
        ..FitControl::default()
    };
    let result = default_fit(&spike, &options, &control);
    for l in 0..result.alpha.nrows() {
        let norm = result.alpha.row(l).dot(&result.alpha.row(l)).sqrt();
        assert!(
            (norm - 2.0).abs() < 1e-8,
            "loading row {l} has norm {norm:.12}"
        );
    }
}

#[test]
fn posterior_covariance_stays_symmetric_with_positive_diagonal() {
    let spike = simulate_session(19);
    let control = FitControl {
        max_iterations: 40,
        ..FitControl::default()
    };
    let result = default_fit(&spike, &FitOptions::new(), &control);
    let v = &result.post_cov[0];
    for t in 0..T {
        assert!(v[[t, t]] > 0.0, "non-positive variance at timepoint {t}");
        for s in 0..T {
            assert!(
                (v[[t, s]] - v[[s, t]]).abs() < 1e-8,
                "asymmetry at ({t}, {s}): {:.3e}",
                (v[[t, s]] - v[[s, t]]).abs()
            );
        }
    }
}

#[test]
fn frozen_covariance_block_is_bit_identical_across_the_run() {
    let spike = simulate_session(11);
    let mut cov0 = sqexp_cov(T, OMEGA, 1.0);
    for t in 0..T {
        cov0[[t, t]] += 0.01;
    }
    let options = FitOptions {
        cov0: Some(vec![cov0.clone()]),
        fix_cov: true,
        ..FitOptions::new()
    };
    let control = FitControl {
        max_iterations: 25,
        ..FitControl::default()
    };
    let result = default_fit(&spike, &options, &control);
    assert_eq!(
        result.post_cov[0], cov0,
        "frozen covariance block was modified"
    );
}

#[test]
fn frozen_loadings_are_bit_identical_and_reported_as_initial() {
    let spike = simulate_session(23);
    let alpha0 = array![[0.6, -0.6, 0.2]];
    let options = FitOptions {
        alpha0: Some(alpha0.clone()),
        fix_alpha: true,
        ..FitOptions::new()
    };
    let control = FitControl {
        max_iterations: 25,
        ..FitControl::default()
    };
    let result = default_fit(&spike, &options, &control);
    assert_eq!(result.alpha, alpha0);
    assert_eq!(result.alpha0, alpha0);
}

#[test]
fn warm_started_fit_reproduces_its_reported_initial_coefficients() {
    let spike = simulate_session(31);
    let control = FitControl {
        max_iterations: 10,
        ..FitControl::default()
    };
    let first = default_fit(&spike, &FitOptions::new(), &control);
    // Seeding a second run with the reported initial values must reproduce
    // the first trajectory.
    let options = FitOptions {
        alpha0: Some(first.alpha0.clone()),
        beta0: Some(first.beta0.clone()),
        ..FitOptions::new()
    };
    let second = default_fit(&spike, &options, &control);
    let max_diff = first
        .lower_bound
        .iter()
        .zip(second.lower_bound.iter())
        .fold(0.0f64, |acc, (&a, &b)| acc.max((a - b).abs()));
    assert!(max_diff < 1e-9, "trajectories diverged by {max_diff:.3e}");
}

#[test]
fn verbose_control_round_trips_through_serde() {
    let control = FitControl {
        max_iterations: 17,
        fixed_point_iterations: 2,
        tolerance: 1e-3,
        verbose: true,
    };
    let json = serde_json::to_string(&control).expect("serialization must succeed");
    let back: FitControl = serde_json::from_str(&json).expect("deserialization must succeed");
    assert_eq!(back.max_iterations, 17);
    assert_eq!(back.fixed_point_iterations, 2);
    assert!(back.verbose);
}

#[test]
fn posterior_mean_columns_are_centered() {
    let spike = simulate_session(13);
    let control = FitControl {
        max_iterations: 30,
        ..FitControl::default()
    };
    let result = default_fit(&spike, &FitOptions::new(), &control);
    for l in 0..result.post_mean.ncols() {
        let mean = result.post_mean.column(l).mean().unwrap_or(0.0);
        assert!(
            mean.abs() < 1e-10,
            "posterior mean column {l} drifted to {mean:.3e}"
        );
    }
}
