use faer::linalg::solvers::{self, Ldlt as FaerLdlt, Llt as FaerLlt, Solve};
use faer::{MatMut, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2, s};
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("LDLT factorization failed: {0:?}")]
    Ldlt(solvers::LdltError),
}

/// Zero-copy faer view over an ndarray matrix.
///
/// Layouts with non-positive strides are materialized into an owned compact
/// copy, since faer kernels assume forward memory traversal.
pub struct FaerArrayView<'a> {
    ptr: *const f64,
    rows: usize,
    cols: usize,
    row_stride: isize,
    col_stride: isize,
    owned: Option<Array2<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        if strides[0] <= 0 || strides[1] <= 0 {
            let owned = array.to_owned();
            let owned_strides = owned.strides();
            return Self {
                ptr: owned.as_ptr(),
                rows,
                cols,
                row_stride: owned_strides[0],
                col_stride: owned_strides[1],
                owned: Some(owned),
                _marker: PhantomData,
            };
        }
        Self {
            ptr: array.as_ptr(),
            rows,
            cols,
            row_stride: strides[0],
            col_stride: strides[1],
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, rows, cols, rs, cs) = if let Some(owned) = &self.owned {
            let strides = owned.strides();
            (owned.as_ptr(), owned.nrows(), owned.ncols(), strides[0], strides[1])
        } else {
            (self.ptr, self.rows, self.cols, self.row_stride, self.col_stride)
        };
        // SAFETY: pointer/shape/strides come either from a live ndarray view
        // with positive strides or from the owned compact copy held by `self`,
        // both valid for the lifetime of the returned view.
        unsafe { MatRef::from_raw_parts(ptr, rows, cols, rs, cs) }
    }
}

#[inline]
pub fn array2_to_mat_mut(array: &mut Array2<f64>) -> MatMut<'_, f64> {
    let (rows, cols) = array.dim();
    let strides = array.strides();
    let (s0, s1) = (strides[0], strides[1]);
    // SAFETY: raw parts taken directly from the ndarray buffer.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), rows, cols, s0, s1) }
}

#[inline]
pub fn array1_to_col_mat_mut(array: &mut Array1<f64>) -> MatMut<'_, f64> {
    let len = array.len();
    let stride = array.strides()[0];
    // SAFETY: a 1-D ndarray is a single strided column.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), len, 1, stride, 0) }
}

pub(crate) fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((mat.nrows(), mat.ncols()));
    for j in 0..mat.ncols() {
        for i in 0..mat.nrows() {
            out[[i, j]] = mat[(i, j)];
        }
    }
    out
}

/// Cached LLT factor of a symmetric positive-definite matrix.
pub struct FaerCholeskyFactor {
    factor: FaerLlt<f64>,
}

impl FaerCholeskyFactor {
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let mut rhs = rhs.to_owned();
        let mut rhs_view = array1_to_col_mat_mut(&mut rhs);
        self.factor.solve_in_place(rhs_view.as_mut());
        rhs
    }

    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let mut rhs = rhs.to_owned();
        let mut rhs_view = array2_to_mat_mut(&mut rhs);
        self.factor.solve_in_place(rhs_view.as_mut());
        rhs
    }

    pub fn lower_triangular(&self) -> Array2<f64> {
        mat_to_array(self.factor.L())
    }

    /// Log-determinant of the factored matrix, from the Cholesky diagonal.
    pub fn log_det(&self) -> f64 {
        let l = self.factor.L();
        let mut acc = 0.0;
        for i in 0..l.nrows() {
            acc += l[(i, i)].ln();
        }
        2.0 * acc
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        let view = FaerArrayView::new(self);
        let factor = view.as_ref().llt(side).map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor { factor })
    }
}

pub enum FaerSymmetricFactor {
    Llt(FaerLlt<f64>),
    Ldlt(FaerLdlt<f64>),
}

impl FaerSymmetricFactor {
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let mut rhs = rhs.to_owned();
        let mut rhs_view = array1_to_col_mat_mut(&mut rhs);
        match self {
            FaerSymmetricFactor::Llt(f) => f.solve_in_place(rhs_view.as_mut()),
            FaerSymmetricFactor::Ldlt(f) => f.solve_in_place(rhs_view.as_mut()),
        }
        rhs
    }
}

/// Factorize a symmetric system with an LLT first attempt and LDLT fallback.
///
/// Newton systems in the coordinate updates are positive definite whenever the
/// rate cache is strictly positive, but near-singular Hessians can defeat the
/// LLT; the LDLT fallback keeps those steps usable.
pub fn factorize_symmetric_with_fallback<S: Data<Elem = f64>>(
    matrix: &ArrayBase<S, Ix2>,
    side: Side,
) -> Result<FaerSymmetricFactor, FaerLinalgError> {
    let view = FaerArrayView::new(matrix);
    if let Ok(llt) = FaerLlt::new(view.as_ref(), side) {
        return Ok(FaerSymmetricFactor::Llt(llt));
    }
    let ldlt = FaerLdlt::new(view.as_ref(), side).map_err(FaerLinalgError::Ldlt)?;
    Ok(FaerSymmetricFactor::Ldlt(ldlt))
}

/// Thin QR factorization: for an (m, n) input, `Q` is (m, k) and `R` is
/// (k, n) with `k = min(m, n)`, so `Q R` reconstructs the input.
pub trait FaerQr {
    fn qr(&self) -> (Array2<f64>, Array2<f64>);
}

impl<S: Data<Elem = f64>> FaerQr for ArrayBase<S, Ix2> {
    fn qr(&self) -> (Array2<f64>, Array2<f64>) {
        let k = self.nrows().min(self.ncols());
        let view = FaerArrayView::new(self);
        let qr = view.as_ref().qr();
        // compute_Q yields the full (m, m) orthogonal factor; keep the
        // leading columns that pair with the thin R.
        let q = mat_to_array(qr.compute_Q().as_ref());
        let r = mat_to_array(qr.R());
        (
            q.slice(s![.., ..k]).to_owned(),
            r.slice(s![..k, ..]).to_owned(),
        )
    }
}
