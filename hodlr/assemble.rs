use crate::linalg::{LinalgError, ThinSvd};
use crate::node::HodlrNode;
use crate::tree::{HodlrError, HodlrTree};
use ndarray::{Array1, Array2, s};
use rayon::prelude::*;

/// Entry oracle the tree is assembled from.
///
/// Implementations must be cheap to query entry-wise (a kernel function, a
/// stored dense matrix); assembly pulls whole blocks, so overriding
/// [`MatrixSource::block`] pays off when a faster bulk path exists.
pub trait MatrixSource: Sync {
    fn entry(&self, row: usize, col: usize) -> f64;

    fn block(&self, row_start: usize, col_start: usize, rows: usize, cols: usize) -> Array2<f64> {
        Array2::from_shape_fn((rows, cols), |(i, j)| {
            self.entry(row_start + i, col_start + j)
        })
    }
}

/// A [`MatrixSource`] over an in-memory dense matrix.
pub struct DenseSource<'a> {
    matrix: &'a Array2<f64>,
}

impl<'a> DenseSource<'a> {
    pub fn new(matrix: &'a Array2<f64>) -> Self {
        Self { matrix }
    }
}

impl MatrixSource for DenseSource<'_> {
    fn entry(&self, row: usize, col: usize) -> f64 {
        self.matrix[(row, col)]
    }

    fn block(&self, row_start: usize, col_start: usize, rows: usize, cols: usize) -> Array2<f64> {
        self.matrix
            .slice(s![row_start..row_start + rows, col_start..col_start + cols])
            .to_owned()
    }
}

fn truncation_rank(sigma: &Array1<f64>, tolerance: f64) -> usize {
    let Some(&largest) = sigma.first() else {
        return 0;
    };
    if largest <= 0.0 {
        return 0;
    }
    sigma.iter().take_while(|&&s| s > tolerance * largest).count()
}

/// Left factor of the truncated SVD with the singular values folded in, so
/// the off-diagonal block is exactly `left * right^T`.
fn scaled_left_factor(u: &Array2<f64>, sigma: &Array1<f64>, rank: usize) -> Array2<f64> {
    let mut left = u.slice(s![.., ..rank]).to_owned();
    for (mut column, &scale) in left.columns_mut().into_iter().zip(sigma.iter()) {
        column *= scale;
    }
    left
}

fn compress_node_couplings<Src: MatrixSource>(
    node: &mut HodlrNode,
    source: &Src,
    tolerance: f64,
) -> Result<(), LinalgError> {
    let [start0, start1] = node.child_start;
    let [span0, span1] = node.child_span;

    let upper = source.block(start0, start1, span0, span1);
    let (u, sigma, v) = upper.thin_svd()?;
    let rank = truncation_rank(&sigma, tolerance);
    node.rank[0] = rank;
    node.basis_u[0] = scaled_left_factor(&u, &sigma, rank);
    node.basis_v[1] = v.slice(s![.., ..rank]).to_owned();

    let lower = source.block(start1, start0, span1, span0);
    let (u, sigma, v) = lower.thin_svd()?;
    let rank = truncation_rank(&sigma, tolerance);
    node.rank[1] = rank;
    node.basis_u[1] = scaled_left_factor(&u, &sigma, rank);
    node.basis_v[0] = v.slice(s![.., ..rank]).to_owned();

    node.coupling_lu = None;
    Ok(())
}

impl HodlrTree {
    /// Populates leaf diagonal blocks and off-diagonal low-rank bases from
    /// `source`. Off-diagonal blocks are compressed by thin SVD, truncated
    /// at singular values below `tolerance` relative to each block's largest
    /// (a zero block gets rank 0). Any previous factorization is dropped.
    pub fn assemble<Src: MatrixSource>(
        &mut self,
        source: &Src,
        tolerance: f64,
    ) -> Result<(), HodlrError> {
        log::info!(
            "assembling HODLR tree: dimension {}, {} levels, relative tolerance {tolerance:.1e}",
            self.dim,
            self.n_levels
        );
        self.factorized = false;
        let n_levels = self.n_levels;

        self.levels[n_levels].par_iter_mut().for_each(|leaf| {
            leaf.coupling = source.block(
                leaf.row_start,
                leaf.row_start,
                leaf.row_span,
                leaf.row_span,
            );
            leaf.coupling_lu = None;
        });

        for level in 0..n_levels {
            self.levels[level]
                .par_iter_mut()
                .map(|node| compress_node_couplings(node, source, tolerance))
                .collect::<Result<(), LinalgError>>()?;
        }

        let coupling_rank: usize = self.levels[..n_levels]
            .iter()
            .flatten()
            .map(HodlrNode::total_rank)
            .sum();
        log::debug!("assembly complete; total coupling rank {coupling_rank}");
        Ok(())
    }

    /// Builds and assembles a tree over `dim` rows, bisecting until leaf
    /// ranges would drop below `leaf_span` rows.
    ///
    /// # Panics
    ///
    /// If `dim` is zero.
    pub fn from_source<Src: MatrixSource>(
        source: &Src,
        dim: usize,
        leaf_span: usize,
        tolerance: f64,
    ) -> Result<Self, HodlrError> {
        let leaf_span = leaf_span.max(1);
        let mut n_levels = 0;
        while (dim >> (n_levels + 1)) >= leaf_span {
            n_levels += 1;
        }
        let mut tree = Self::new(dim, n_levels);
        tree.assemble(source, tolerance)?;
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn truncation_rank_is_relative_to_largest_singular_value() {
        let sigma = Array1::from_vec(vec![4.0, 2.0, 4.0e-13]);
        assert_eq!(truncation_rank(&sigma, 1e-12), 2);
        assert_eq!(truncation_rank(&sigma, 0.6), 1);
        assert_eq!(truncation_rank(&Array1::zeros(3), 1e-12), 0);
        assert_eq!(truncation_rank(&Array1::zeros(0), 1e-12), 0);
    }

    #[test]
    fn assembly_recovers_exact_rank_one_coupling() {
        // Off-diagonal blocks are outer products, so a relative tolerance
        // far above machine precision must still find rank exactly 1.
        let a = array![
            [5.0, 0.0, 1.0, 2.0],
            [0.0, 5.0, 2.0, 4.0],
            [3.0, 1.5, 5.0, 0.0],
            [6.0, 3.0, 0.0, 5.0],
        ];
        let source = DenseSource::new(&a);
        let tree = HodlrTree::from_source(&source, 4, 2, 1e-8).unwrap();

        let root = tree.node(0, 0);
        assert_eq!(root.rank, [1, 1]);

        let upper = root.basis_u[0].dot(&root.basis_v[1].t());
        let lower = root.basis_u[1].dot(&root.basis_v[0].t());
        for i in 0..2 {
            for j in 0..2 {
                assert_abs_diff_eq!(upper[(i, j)], a[(i, 2 + j)], epsilon = 1e-10);
                assert_abs_diff_eq!(lower[(i, j)], a[(2 + i, j)], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn zero_off_diagonal_blocks_assemble_to_rank_zero() {
        let a = Array2::from_diag(&Array1::from_vec(vec![2.0, 3.0, 4.0, 5.0]));
        let source = DenseSource::new(&a);
        let tree = HodlrTree::from_source(&source, 4, 1, 1e-12).unwrap();
        for level in 0..tree.n_levels() {
            for index in 0..tree.nodes_in_level(level) {
                assert_eq!(tree.node(level, index).rank, [0, 0]);
            }
        }
    }

    #[test]
    fn leaf_blocks_copy_the_diagonal_of_the_source() {
        let a = array![
            [1.0, 2.0, 0.0, 0.0],
            [3.0, 4.0, 0.0, 0.0],
            [0.0, 0.0, 5.0, 6.0],
            [0.0, 0.0, 7.0, 8.0],
        ];
        let source = DenseSource::new(&a);
        let tree = HodlrTree::from_source(&source, 4, 2, 1e-12).unwrap();
        assert_eq!(tree.n_levels(), 1);
        assert_eq!(tree.node(1, 0).coupling, array![[1.0, 2.0], [3.0, 4.0]]);
        assert_eq!(tree.node(1, 1).coupling, array![[5.0, 6.0], [7.0, 8.0]]);
    }
}
