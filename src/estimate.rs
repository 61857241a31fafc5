use crate::covariance::update_latent_covariance;
use crate::faer_ndarray::{FaerCholesky, FaerLinalgError, factorize_symmetric_with_fallback};
use crate::history::make_regressor;
use crate::moments::{lower_bound, refresh_rate};
use crate::prior::GpPrior;
use crate::types::{FitControl, FitOptions, FitResult};
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::time::Instant;
use thiserror::Error;

/// Trust-radius decay applied when a step is rejected.
const RADIUS_DECAY: f64 = 0.5;
/// Trust-radius growth applied when a step clearly beats its quadratic model.
const RADIUS_GROWTH: f64 = 1.5;
/// Fraction of the predicted improvement a step must realize to grow.
const IMPROVEMENT_THRESHOLD: f64 = 0.75;
/// Ridge added to the normal equations of the initial least squares.
const INIT_RIDGE: f64 = 1e-8;

#[derive(Debug, Error)]
pub enum FitError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("supplied posterior covariance is not positive definite for latent {latent}: {source}")]
    NotPositiveDefinite {
        latent: usize,
        source: FaerLinalgError,
    },

    #[error("a linear system solve failed during initialization: {0}")]
    LinearSystemSolveFailed(#[from] FaerLinalgError),
}

/// All state mutated across one optimization run. Each pass receives this by
/// exclusive reference, which pins the single-writer-per-pass discipline into
/// the signatures.
struct OptimState<'a> {
    spike: ArrayView2<'a, f64>,
    regressor: Array2<f64>,
    prior: GpPrior,
    prior_mean: ArrayView2<'a, f64>,
    post_mean: Array2<f64>,
    post_cov: Vec<Array2<f64>>,
    prec_diag: Array2<f64>,
    alpha: Array2<f64>,
    beta: Array2<f64>,
    rate: Array2<f64>,
}

impl OptimState<'_> {
    fn n_steps(&self) -> usize {
        self.spike.nrows()
    }

    fn n_neurons(&self) -> usize {
        self.spike.ncols()
    }

    fn n_latents(&self) -> usize {
        self.prior.n_latents()
    }

    fn refresh_rate_column(&mut self, n: usize) {
        refresh_rate(
            &mut self.rate,
            0..self.spike.nrows(),
            [n],
            self.regressor.view(),
            self.post_mean.view(),
            &self.post_cov,
            self.beta.view(),
            self.alpha.view(),
        );
    }

    fn refresh_rate_all(&mut self) {
        refresh_rate(
            &mut self.rate,
            0..self.spike.nrows(),
            0..self.spike.ncols(),
            self.regressor.view(),
            self.post_mean.view(),
            &self.post_cov,
            self.beta.view(),
            self.alpha.view(),
        );
    }

    fn lower_bound(&self) -> f64 {
        lower_bound(
            self.spike,
            self.regressor.view(),
            self.beta.view(),
            self.alpha.view(),
            &self.prior,
            self.prior_mean,
            self.post_mean.view(),
            &self.post_cov,
            &self.rate,
        )
    }
}

/// Tracks the largest parameter change per iteration and decides termination.
struct ConvergenceController {
    tolerance: f64,
    old_alpha: Array2<f64>,
    old_beta: Array2<f64>,
    old_mean: Array2<f64>,
    old_cov: Vec<Array2<f64>>,
}

impl ConvergenceController {
    fn new(state: &OptimState<'_>, tolerance: f64) -> Self {
        Self {
            tolerance,
            old_alpha: state.alpha.clone(),
            old_beta: state.beta.clone(),
            old_mean: state.post_mean.clone(),
            old_cov: state.post_cov.clone(),
        }
    }

    /// Largest absolute change across all unfrozen blocks since the previous
    /// call, and whether it fell below tolerance. Updates the snapshots.
    fn check(&mut self, state: &OptimState<'_>, options: &FitOptions) -> (f64, bool) {
        let del_alpha = if options.fix_alpha {
            0.0
        } else {
            max_abs_diff(&self.old_alpha, &state.alpha)
        };
        let del_beta = if options.fix_beta {
            0.0
        } else {
            max_abs_diff(&self.old_beta, &state.beta)
        };
        let del_mean = if options.fix_mean {
            0.0
        } else {
            max_abs_diff(&self.old_mean, &state.post_mean)
        };
        let del_cov = if options.fix_cov {
            0.0
        } else {
            self.old_cov
                .iter()
                .zip(state.post_cov.iter())
                .fold(0.0f64, |acc, (a, b)| acc.max(max_abs_diff(a, b)))
        };

        self.old_alpha.assign(&state.alpha);
        self.old_beta.assign(&state.beta);
        self.old_mean.assign(&state.post_mean);
        for (old, new) in self.old_cov.iter_mut().zip(state.post_cov.iter()) {
            old.assign(new);
        }

        let delta = del_alpha.max(del_beta).max(del_mean).max(del_cov);
        (delta, delta < self.tolerance)
    }
}

fn max_abs_diff(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .fold(0.0f64, |acc, (&x, &y)| acc.max((x - y).abs()))
}

fn inf_norm(a: &Array1<f64>) -> f64 {
    a.iter().fold(0.0f64, |acc, &v| acc.max(v.abs()))
}

/// Fit the latent GP model to spike counts by variational coordinate ascent.
///
/// One outer iteration runs four sequential blocks (history coefficients,
/// loadings, posterior mean, posterior covariance), each coordinate update a
/// damped Newton step gated on the evidence lower bound: steps that make the
/// bound non-finite or smaller are rolled back and shrink that coordinate's
/// trust radius, steps that beat their quadratic model grow it. The loop ends
/// when the largest parameter change falls below `control.tolerance` or the
/// iteration budget runs out, in which case the partial trajectory is still
/// returned and a warning logged.
pub fn fit_latent<'a>(
    spike: ArrayView2<'a, f64>,
    order: usize,
    prior_mean: ArrayView2<'a, f64>,
    prior_var: ArrayView1<f64>,
    prior_omega: ArrayView1<f64>,
    options: &FitOptions,
    control: &FitControl,
) -> Result<FitResult, FitError> {
    let start = Instant::now();
    validate_inputs(spike, order, prior_mean, prior_var, prior_omega, options, control)?;

    let (n_steps, n_neurons) = spike.dim();
    let n_latents = prior_mean.ncols();
    let eps = 2.0 * f64::EPSILON;
    let anorm = options.effective_alpha_norm();

    let regressor = make_regressor(spike, order, options.intercept);
    let prior = GpPrior::new(
        n_steps,
        prior_var,
        prior_omega,
        options.effective_ichol_tolerance(),
    )?;

    let alpha0 = match &options.alpha0 {
        Some(a) => a.clone(),
        None => {
            let mut rng = StdRng::seed_from_u64(options.seed);
            let mut a = Array2::from_shape_fn((n_latents, n_neurons), |_| {
                rng.sample::<f64, _>(StandardNormal)
            });
            let norm = a.iter().map(|v| v * v).sum::<f64>().sqrt();
            if norm > 0.0 {
                a *= anorm / norm;
            }
            a
        }
    };
    let beta0 = match &options.beta0 {
        Some(b) => b.clone(),
        None => initial_beta(&regressor, spike)?,
    };

    let post_mean = match &options.mean0 {
        Some(m) => m.clone(),
        None => prior_mean.to_owned(),
    };
    let post_cov = match &options.cov0 {
        Some(v) => v.clone(),
        None => prior.cov.clone(),
    };
    let mut prec_diag = Array2::<f64>::zeros((n_latents, n_steps));
    match &options.prec0 {
        Some(k0) => {
            for l in 0..n_latents {
                for t in 0..n_steps {
                    prec_diag[[l, t]] = k0[l][[t, t]];
                }
            }
        }
        None => {
            for l in 0..n_latents {
                for t in 0..n_steps {
                    prec_diag[[l, t]] = prior.prec[l][[t, t]];
                }
            }
        }
    }

    let mut state = OptimState {
        spike,
        regressor,
        prior,
        prior_mean,
        post_mean,
        post_cov,
        prec_diag,
        alpha: alpha0.clone(),
        beta: beta0.clone(),
        rate: Array2::zeros((n_steps, n_neurons)),
    };
    state.refresh_rate_all();

    let mut lbound = vec![state.lower_bound()];

    let mut ra = Array1::<f64>::ones(n_latents);
    let mut rb = Array1::<f64>::ones(n_neurons);
    let mut rm = Array1::<f64>::ones(n_latents);

    let mut controller = ConvergenceController::new(&state, control.tolerance);

    let mut converged = false;
    let mut it = 1;
    while !converged && it < control.max_iterations {
        let last_lb = lbound[it - 1];

        if !options.fix_beta {
            beta_pass(&mut state, &mut rb, last_lb, eps);
        }
        if !options.fix_alpha {
            alpha_pass(&mut state, &mut ra, last_lb, eps, anorm);
        }
        if !options.fix_mean {
            mean_pass(&mut state, &mut rm, last_lb, eps);
        }
        if !options.fix_cov {
            covariance_pass(&mut state, control.fixed_point_iterations, last_lb);
        }
        if options.hyper {
            reestimate_prior_variance(&mut state);
        }

        lbound.push(state.lower_bound());

        let (delta, done) = controller.check(&state, options);
        converged = done;

        if control.verbose {
            log::info!(
                "iteration {it}: lower bound {:.6}, increment {:.6e}, max delta {:.6e}",
                lbound[it],
                lbound[it] - lbound[it - 1],
                delta
            );
        }
        it += 1;
    }

    if !converged {
        log::warn!(
            "optimization did not converge within {} iterations",
            control.max_iterations
        );
    }

    Ok(FitResult {
        lower_bound: lbound,
        post_mean: state.post_mean,
        post_cov: state.post_cov,
        alpha: state.alpha,
        beta: state.beta,
        alpha0,
        beta0,
        elapsed: start.elapsed(),
        converged,
    })
}

/// One Newton pass over the history/intercept coefficients, per neuron.
/// Gradient and Hessian come from the Poisson likelihood alone; the prior
/// does not involve Beta.
fn beta_pass(state: &mut OptimState<'_>, rb: &mut Array1<f64>, last_lb: f64, eps: f64) {
    for n in 0..state.n_neurons() {
        let resid_n = &state.spike.column(n) - &state.rate.column(n);
        let grad = state.regressor.t().dot(&resid_n);
        if inf_norm(&grad) < eps {
            continue;
        }

        let weights = state.rate.column(n).to_owned().insert_axis(Axis(1));
        let weighted = &state.regressor * &weights;
        let hess = state.regressor.t().dot(&weighted);
        let factor = match factorize_symmetric_with_fallback(&hess, Side::Lower) {
            Ok(f) => f,
            Err(err) => {
                log::warn!("beta update for neuron {n} skipped: {err}");
                continue;
            }
        };
        let mut delta = factor.solve_vec(&grad);
        delta *= rb[n];
        if !delta.iter().all(|v| v.is_finite()) {
            log::warn!("beta update for neuron {n} skipped: non-finite step");
            continue;
        }
        let predicted = grad.dot(&delta) - 0.5 * delta.dot(&hess.dot(&delta));

        let last_beta = state.beta.column(n).to_owned();
        let last_rate = state.rate.column(n).to_owned();
        {
            let mut col = state.beta.column_mut(n);
            col += &delta;
        }
        state.refresh_rate_column(n);
        let lb = state.lower_bound();
        if !lb.is_finite() || lb < last_lb {
            rb[n] = RADIUS_DECAY * rb[n] + eps;
            state.beta.column_mut(n).assign(&last_beta);
            state.rate.column_mut(n).assign(&last_rate);
        } else if lb - last_lb > IMPROVEMENT_THRESHOLD * predicted {
            rb[n] *= RADIUS_GROWTH;
        }
    }
}

/// One Newton pass over the loading coefficients, per latent dimension.
/// The step is projected onto the tangent space of the fixed-norm constraint
/// and the row is renormalized to the target norm after the accept/reject
/// decision, whichever way it went.
fn alpha_pass(state: &mut OptimState<'_>, ra: &mut Array1<f64>, last_lb: f64, eps: f64, anorm: f64) {
    for l in 0..state.n_latents() {
        let alpha_row = state.alpha.row(l).to_owned();
        let m_l = state.post_mean.column(l).to_owned();
        let v_diag = state.post_cov[l].diag().to_owned();

        let resid = &state.spike - &state.rate;
        let grad = resid.t().dot(&m_l) - (state.rate.t().dot(&v_diag) * &alpha_row);
        if inf_norm(&grad) < eps {
            continue;
        }

        let m_sq = m_l.mapv(|v| v * v);
        let mv = &m_l * &v_diag;
        let v_sq = v_diag.mapv(|v| v * v);
        let mut hess_diag = state.rate.t().dot(&m_sq);
        hess_diag += &(state.rate.t().dot(&mv) * 2.0 * &alpha_row);
        hess_diag += &(state.rate.t().dot(&v_sq) * &alpha_row.mapv(|v| v * v));
        hess_diag += &state.rate.t().dot(&v_diag);

        if hess_diag.iter().any(|h| !h.is_finite() || h.abs() <= eps) {
            log::warn!("alpha update for latent {l} skipped: singular Hessian diagonal");
            continue;
        }
        let mut delta = &grad / &hess_diag;
        delta *= ra[l];
        // Project onto the tangent space of the norm constraint so the step
        // does not fight the renormalization below.
        let row_sq = alpha_row.dot(&alpha_row);
        if row_sq > 0.0 {
            let coef = delta.dot(&alpha_row) / row_sq;
            delta.scaled_add(-coef, &alpha_row);
        }
        let predicted = grad.dot(&delta)
            - 0.5
                * delta
                    .iter()
                    .zip(hess_diag.iter())
                    .map(|(&d, &h)| h * d * d)
                    .sum::<f64>();

        let last_alpha = alpha_row.clone();
        let last_rate = state.rate.clone();
        {
            let mut row = state.alpha.row_mut(l);
            row += &delta;
        }
        state.refresh_rate_all();
        let lb = state.lower_bound();
        if !lb.is_finite() || lb < last_lb {
            ra[l] = RADIUS_DECAY * ra[l] + eps;
            state.alpha.row_mut(l).assign(&last_alpha);
            state.rate.assign(&last_rate);
        } else if lb - last_lb > IMPROVEMENT_THRESHOLD * predicted {
            ra[l] *= RADIUS_GROWTH;
        }

        let norm = state.alpha.row(l).dot(&state.alpha.row(l)).sqrt();
        if norm > 0.0 && (norm - anorm).abs() > f64::EPSILON {
            let scale = anorm / norm;
            state.alpha.row_mut(l).mapv_inplace(|v| v * scale);
            state.refresh_rate_all();
        }
    }
}

/// One Newton pass over the posterior mean, per latent dimension. Combines
/// the Poisson gradient with the GP-prior pull, the latter through the cached
/// prior-covariance Cholesky. The column is re-centered after the decision to
/// remove the gauge freedom against the loading scale.
fn mean_pass(state: &mut OptimState<'_>, rm: &mut Array1<f64>, last_lb: f64, eps: f64) {
    let n_steps = state.n_steps();
    for l in 0..state.n_latents() {
        let alpha_row = state.alpha.row(l).to_owned();
        let resid = &state.spike - &state.rate;
        let d = &state.post_mean.column(l) - &state.prior_mean.column(l);
        let grad = resid.dot(&alpha_row) - state.prior.factor[l].solve_vec(&d);
        if inf_norm(&grad) < eps {
            continue;
        }

        let mut hess = state.prior.prec[l].clone();
        let w = state.rate.dot(&alpha_row.mapv(|v| v * v));
        for t in 0..n_steps {
            hess[[t, t]] += w[t];
        }
        let factor = match factorize_symmetric_with_fallback(&hess, Side::Lower) {
            Ok(f) => f,
            Err(err) => {
                log::warn!("posterior mean update for latent {l} skipped: {err}");
                continue;
            }
        };
        let mut delta = factor.solve_vec(&grad);
        delta *= rm[l];
        if !delta.iter().all(|v| v.is_finite()) {
            log::warn!("posterior mean update for latent {l} skipped: non-finite step");
            continue;
        }
        let predicted = grad.dot(&delta) - 0.5 * delta.dot(&hess.dot(&delta));

        let last_mean = state.post_mean.column(l).to_owned();
        let last_rate = state.rate.clone();
        {
            let mut col = state.post_mean.column_mut(l);
            col += &delta;
        }
        state.refresh_rate_all();
        let lb = state.lower_bound();
        if !lb.is_finite() || lb < last_lb {
            rm[l] = RADIUS_DECAY * rm[l] + eps;
            state.post_mean.column_mut(l).assign(&last_mean);
            state.rate.assign(&last_rate);
        } else if lb - last_lb > IMPROVEMENT_THRESHOLD * predicted {
            rm[l] *= RADIUS_GROWTH;
        }

        let center = state.post_mean.column(l).mean().unwrap_or(0.0);
        if center != 0.0 {
            state
                .post_mean
                .column_mut(l)
                .mapv_inplace(|v| v - center);
            state.refresh_rate_all();
        }
    }
}

/// Posterior covariance pass. The per-timepoint fixed-point update has no
/// per-step quadratic model, so acceptance is gated per latent: the whole
/// sweep is rolled back if it leaves the bound non-finite or lower.
fn covariance_pass(state: &mut OptimState<'_>, fixed_point_iterations: usize, last_lb: f64) {
    for l in 0..state.n_latents() {
        let last_cov = state.post_cov[l].clone();
        let last_prec = state.prec_diag.row(l).to_owned();
        let last_rate = state.rate.clone();

        update_latent_covariance(
            l,
            fixed_point_iterations,
            state.regressor.view(),
            state.post_mean.view(),
            &mut state.post_cov,
            &mut state.prec_diag,
            &mut state.rate,
            &state.prior.prec[l],
            state.beta.view(),
            state.alpha.view(),
        );

        let lb = state.lower_bound();
        if !lb.is_finite() || lb < last_lb {
            log::debug!("covariance sweep for latent {l} rejected, restoring previous slice");
            state.post_cov[l] = last_cov;
            state.prec_diag.row_mut(l).assign(&last_prec);
            state.rate.assign(&last_rate);
        }
    }
}

/// Gated hyperparameter branch: re-estimate each latent's prior variance from
/// the current posterior and rescale the prior in place.
fn reestimate_prior_variance(state: &mut OptimState<'_>) {
    let n_steps = state.n_steps() as f64;
    for l in 0..state.n_latents() {
        let d = &state.post_mean.column(l) - &state.prior_mean.column(l);
        let pd = state.prior.prec[l].dot(&d);
        let quad = d.dot(&pd);
        let trace = (&state.prior.prec[l] * &state.post_cov[l]).sum();
        let vl = state.prior.variance[l] * (quad + trace) / n_steps;
        if !vl.is_finite() || vl <= 0.0 {
            log::warn!("prior variance re-estimate for latent {l} discarded: {vl:.3e}");
            continue;
        }
        log::debug!("prior variance for latent {l} re-estimated to {vl:.6e}");
        if let Err(err) = state.prior.rescale(l, vl) {
            log::warn!("prior rescale for latent {l} failed: {err}");
        }
    }
}

/// Ridge-stabilized least squares of the counts on the regressor, the default
/// warm start for Beta.
fn initial_beta(
    regressor: &Array2<f64>,
    spike: ArrayView2<f64>,
) -> Result<Array2<f64>, FaerLinalgError> {
    let k = regressor.ncols();
    let mut xtx = regressor.t().dot(regressor);
    for c in 0..k {
        xtx[[c, c]] += INIT_RIDGE;
    }
    let factor = factorize_symmetric_with_fallback(&xtx, Side::Lower)?;
    let mut beta = Array2::<f64>::zeros((k, spike.ncols()));
    for n in 0..spike.ncols() {
        let xty = regressor.t().dot(&spike.column(n));
        beta.column_mut(n).assign(&factor.solve_vec(&xty));
    }
    Ok(beta)
}

fn validate_inputs(
    spike: ArrayView2<f64>,
    order: usize,
    prior_mean: ArrayView2<f64>,
    prior_var: ArrayView1<f64>,
    prior_omega: ArrayView1<f64>,
    options: &FitOptions,
    control: &FitControl,
) -> Result<(), FitError> {
    let (n_steps, n_neurons) = spike.dim();
    if n_steps == 0 || n_neurons == 0 {
        return Err(FitError::InvalidInput("spike matrix is empty".into()));
    }
    if spike.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(FitError::InvalidInput(
            "spike counts must be finite and non-negative".into(),
        ));
    }
    if prior_mean.nrows() != n_steps {
        return Err(FitError::InvalidInput(format!(
            "prior mean has {} rows, spike train has {} timepoints",
            prior_mean.nrows(),
            n_steps
        )));
    }
    let n_latents = prior_mean.ncols();
    if n_latents == 0 {
        return Err(FitError::InvalidInput(
            "at least one latent dimension is required".into(),
        ));
    }
    if prior_var.len() != n_latents || prior_omega.len() != n_latents {
        return Err(FitError::InvalidInput(format!(
            "expected {n_latents} prior variances and lengthscales, got {} and {}",
            prior_var.len(),
            prior_omega.len()
        )));
    }
    if prior_var.iter().any(|v| !v.is_finite() || *v <= 0.0)
        || prior_omega.iter().any(|v| !v.is_finite() || *v <= 0.0)
    {
        return Err(FitError::InvalidInput(
            "prior variances and inverse squared lengthscales must be positive".into(),
        ));
    }
    if control.max_iterations == 0 {
        return Err(FitError::InvalidInput(
            "max_iterations must be at least one".into(),
        ));
    }
    if !(control.tolerance > 0.0) {
        return Err(FitError::InvalidInput(
            "convergence tolerance must be positive".into(),
        ));
    }

    let k = usize::from(options.intercept) + order * n_neurons;
    if let Some(a0) = &options.alpha0
        && a0.dim() != (n_latents, n_neurons)
    {
        return Err(FitError::InvalidInput(format!(
            "alpha0 has shape {:?}, expected ({n_latents}, {n_neurons})",
            a0.dim()
        )));
    }
    if let Some(b0) = &options.beta0
        && b0.dim() != (k, n_neurons)
    {
        return Err(FitError::InvalidInput(format!(
            "beta0 has shape {:?}, expected ({k}, {n_neurons})",
            b0.dim()
        )));
    }
    if let Some(m0) = &options.mean0
        && m0.dim() != (n_steps, n_latents)
    {
        return Err(FitError::InvalidInput(format!(
            "mean0 has shape {:?}, expected ({n_steps}, {n_latents})",
            m0.dim()
        )));
    }
    for (name, slices) in [("cov0", &options.cov0), ("prec0", &options.prec0)] {
        if let Some(slices) = slices {
            if slices.len() != n_latents {
                return Err(FitError::InvalidInput(format!(
                    "{name} has {} slices, expected {n_latents}",
                    slices.len()
                )));
            }
            for (l, slice) in slices.iter().enumerate() {
                if slice.dim() != (n_steps, n_steps) {
                    return Err(FitError::InvalidInput(format!(
                        "{name}[{l}] has shape {:?}, expected ({n_steps}, {n_steps})",
                        slice.dim()
                    )));
                }
            }
        }
    }
    if let Some(cov0) = &options.cov0 {
        for (l, slice) in cov0.iter().enumerate() {
            slice
                .cholesky(Side::Lower)
                .map_err(|source| FitError::NotPositiveDefinite { latent: l, source })?;
        }
    }
    Ok(())
}
