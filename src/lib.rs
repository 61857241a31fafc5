pub mod covariance;
pub mod estimate;
pub mod faer_ndarray;
pub mod history;
pub mod moments;
pub mod prior;
pub mod simulate;
pub mod transform;
pub mod types;

pub use estimate::{FitError, fit_latent};
pub use history::make_regressor;
pub use moments::{lower_bound, safe_rate};
pub use prior::{GpPrior, ichol_gauss, sqexp_cov};
pub use simulate::{gp_latents, poisson_spikes};
pub use transform::orthogonalize;
pub use types::{FitControl, FitOptions, FitResult};
