use ndarray::{Array2, ArrayView2};

/// Build the lagged design matrix from raw spike counts.
///
/// Row `t` holds the optional intercept followed by the counts of the `order`
/// bins preceding `t`, oldest lag first, neurons contiguous within each lag.
/// Lags that reach before the start of the recording stay at the baseline
/// value of one.
pub fn make_regressor(spike: ArrayView2<f64>, order: usize, intercept: bool) -> Array2<f64> {
    let (n_steps, n_neurons) = spike.dim();
    let icpt = usize::from(intercept);
    let mut regressor = Array2::<f64>::ones((n_steps, icpt + order * n_neurons));
    for t in 0..n_steps {
        let first_lag = t.saturating_sub(order);
        let mut col = icpt + (order - (t - first_lag)) * n_neurons;
        for s in first_lag..t {
            for j in 0..n_neurons {
                regressor[[t, col]] = spike[[s, j]];
                col += 1;
            }
        }
    }
    regressor
}
