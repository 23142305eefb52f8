use faer::linalg::solvers::{PartialPivLu, Solve, Svd};
use faer::{Mat, MatRef};
use ndarray::{Array1, Array2, ArrayBase, ArrayViewMut2, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinalgError {
    #[error("thin SVD failed to converge")]
    SvdNoConvergence,
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

enum DenseStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

/// Zero-copy `faer` view of an `ndarray` matrix.
///
/// Standard-layout and transposed-standard-layout arrays are borrowed
/// directly; anything else (sliced, reversed) falls back to an owned copy.
pub struct DenseView<'a> {
    storage: DenseStorage<'a>,
}

impl<'a> DenseView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let storage = if let Some(slice) = array.as_slice_memory_order() {
            if array.is_standard_layout() {
                DenseStorage::Borrowed(MatRef::from_row_major_slice(
                    slice,
                    array.nrows(),
                    array.ncols(),
                ))
            } else if array.t().is_standard_layout() {
                DenseStorage::Borrowed(MatRef::from_column_major_slice(
                    slice,
                    array.nrows(),
                    array.ncols(),
                ))
            } else {
                let (rows, cols) = array.dim();
                DenseStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
            }
        } else {
            let (rows, cols) = array.dim();
            DenseStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        match &self.storage {
            DenseStorage::Borrowed(view) => *view,
            DenseStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

/// Dense LU factorization with partial (row) pivoting.
///
/// Wraps `faer`'s `PartialPivLu` behind an `ndarray` interface. Factorization
/// never fails: a singular or near-singular input produces a usable but
/// numerically degraded factorization, and the degradation surfaces through
/// the solve results and [`DenseLu::log_abs_det`], never as an error.
#[derive(Clone, Debug)]
pub struct DenseLu {
    factor: PartialPivLu<f64>,
    dim: usize,
}

impl DenseLu {
    pub fn factor<S: Data<Elem = f64>>(matrix: &ArrayBase<S, Ix2>) -> Self {
        debug_assert_eq!(matrix.nrows(), matrix.ncols());
        let view = DenseView::new(matrix);
        Self {
            factor: PartialPivLu::new(view.as_ref()),
            dim: matrix.nrows(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// `x` such that `matrix * x = rhs`.
    pub fn solve<S: Data<Elem = f64>>(&self, rhs: &ArrayBase<S, Ix2>) -> Array2<f64> {
        let view = DenseView::new(rhs);
        let solution = self.factor.solve(view.as_ref());
        mat_to_array(solution.as_ref())
    }

    /// Overwrites `block` with the solution of `matrix * x = block`.
    pub fn solve_in_place(&self, mut block: ArrayViewMut2<'_, f64>) {
        let solution = self.solve(&block);
        block.assign(&solution);
    }

    /// Sum of `ln |u_ii|` over the diagonal of the `U` factor.
    ///
    /// `L` has a unit diagonal and the row permutation only flips the sign of
    /// the determinant, so this is `ln |det|` of the factorized matrix. A
    /// zero pivot yields `-inf`, matching the best-effort numeric contract.
    pub fn log_abs_det(&self) -> f64 {
        let u = self.factor.U();
        (0..self.dim).map(|i| u[(i, i)].abs().ln()).sum()
    }

    /// Smallest pivot magnitude, as a degeneracy diagnostic.
    ///
    /// `None` for an empty factorization.
    pub fn min_abs_pivot(&self) -> Option<f64> {
        let u = self.factor.U();
        (0..self.dim).map(|i| u[(i, i)].abs()).reduce(f64::min)
    }
}

/// Thin SVD of an `ndarray` matrix, returned as `(u, sigma, v)` with
/// `matrix = u * diag(sigma) * v^T` and singular values in descending order.
pub trait ThinSvd {
    fn thin_svd(&self) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>), LinalgError>;
}

impl<S: Data<Elem = f64>> ThinSvd for ArrayBase<S, Ix2> {
    fn thin_svd(&self) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>), LinalgError> {
        let view = DenseView::new(self);
        let svd = Svd::new_thin(view.as_ref()).map_err(|_| LinalgError::SvdNoConvergence)?;
        let s = svd.S().column_vector().as_mat();
        let sigma = Array1::from_shape_fn(s.nrows(), |i| s[(i, 0)]);
        Ok((mat_to_array(svd.U()), sigma, mat_to_array(svd.V())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_matrix(rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f64> {
        Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
    }

    #[test]
    fn lu_solve_recovers_known_solution() {
        let mut rng = StdRng::seed_from_u64(7);
        let a = random_matrix(12, 12, &mut rng) + Array2::<f64>::eye(12) * 12.0;
        let x_true = random_matrix(12, 3, &mut rng);
        let b = a.dot(&x_true);

        let lu = DenseLu::factor(&a);
        let x = lu.solve(&b);
        for (expected, actual) in x_true.iter().zip(x.iter()) {
            assert_abs_diff_eq!(expected, actual, epsilon = 1e-10);
        }
    }

    #[test]
    fn lu_solve_in_place_matches_solve() {
        let mut rng = StdRng::seed_from_u64(8);
        let a = random_matrix(6, 6, &mut rng) + Array2::<f64>::eye(6) * 6.0;
        let b = random_matrix(6, 2, &mut rng);

        let lu = DenseLu::factor(&a);
        let expected = lu.solve(&b);
        let mut in_place = b.clone();
        lu.solve_in_place(in_place.view_mut());
        assert_eq!(expected, in_place);
    }

    #[test]
    fn log_abs_det_matches_hand_computed_determinant() {
        // det = 2*1 - 3*4 = -10
        let a = array![[2.0, 3.0], [4.0, 1.0]];
        let lu = DenseLu::factor(&a);
        assert_abs_diff_eq!(lu.log_abs_det(), 10.0_f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn singular_matrix_reports_zero_pivot_and_infinite_log_det() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        let lu = DenseLu::factor(&a);
        assert_eq!(lu.min_abs_pivot(), Some(0.0));
        assert_eq!(lu.log_abs_det(), f64::NEG_INFINITY);
    }

    #[test]
    fn empty_factorization_is_neutral() {
        let a = Array2::<f64>::zeros((0, 0));
        let lu = DenseLu::factor(&a);
        assert_eq!(lu.log_abs_det(), 0.0);
        assert_eq!(lu.min_abs_pivot(), None);
    }

    #[test]
    fn thin_svd_reconstructs_low_rank_matrix() {
        let mut rng = StdRng::seed_from_u64(9);
        let left = random_matrix(10, 2, &mut rng);
        let right = random_matrix(8, 2, &mut rng);
        let a = left.dot(&right.t());

        let (u, sigma, v) = a.thin_svd().unwrap();
        assert!(sigma[0] >= sigma[1]);
        assert!(sigma[2] < 1e-12 * sigma[0]);

        let reconstructed = u.dot(&Array2::from_diag(&sigma)).dot(&v.t());
        for (expected, actual) in a.iter().zip(reconstructed.iter()) {
            assert_abs_diff_eq!(expected, actual, epsilon = 1e-10);
        }
    }

    #[test]
    fn dense_view_borrows_transposed_layout() {
        let a = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let at = a.t();
        let view = DenseView::new(&at);
        let mat = view.as_ref();
        assert_eq!(mat.nrows(), 2);
        assert_eq!(mat[(0, 2)], 5.0);
        assert_eq!(mat[(1, 0)], 2.0);
    }
}
