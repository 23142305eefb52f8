use crate::factorize::split_into_node_blocks;
use crate::linalg::LinalgError;
use crate::node::{AncestorStep, HodlrNode};
use ndarray::{Array2, Axis, s};
use rayon::prelude::*;
use thiserror::Error;

/// Errors raised by precondition checks on the tree's public operations.
///
/// Numerical degeneracy is deliberately absent: a near-singular diagonal or
/// coupling block degrades the returned values (up to `-inf`/`NaN` in the
/// log-determinant) but never fails, matching the best-effort contract of
/// the elimination. See [`HodlrTree::smallest_pivot`] for the diagnostic.
#[derive(Debug, Error)]
pub enum HodlrError {
    #[error("`{operation}` requires a factorized tree; call `factorize` first")]
    NotFactorized { operation: &'static str },

    #[error("right-hand side has {found} rows but the matrix dimension is {expected}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("low-rank assembly failed: {0}")]
    Assembly(#[from] LinalgError),
}

/// A HODLR matrix: a perfectly balanced binary tree of [`HodlrNode`]s over a
/// contiguous index range, one arena per level.
///
/// Lifecycle: construct the geometry ([`HodlrTree::new`] or
/// [`HodlrTree::from_source`]), populate leaf blocks and low-rank bases
/// (assembly or direct node access), [`factorize`], then any number of
/// [`solve`] / [`log_determinant`] queries. Mutating a node or re-assembling
/// drops the factorized state; re-running [`factorize`] always restarts from
/// the original bases.
///
/// [`factorize`]: HodlrTree::factorize
/// [`solve`]: HodlrTree::solve
/// [`log_determinant`]: HodlrTree::log_determinant
/// [`HodlrTree::from_source`]: HodlrTree::from_source
pub struct HodlrTree {
    pub(crate) dim: usize,
    pub(crate) n_levels: usize,
    /// `levels[0]` is the root level, `levels[n_levels]` the leaves.
    pub(crate) levels: Vec<Vec<HodlrNode>>,
    pub(crate) factorized: bool,
}

impl HodlrTree {
    /// Builds the tree geometry over `dim` rows with `n_levels` bisections
    /// (so `2^n_levels` leaves). Ranges are split evenly, the first child
    /// taking the extra row of an odd range. Bases and leaf blocks start
    /// empty.
    ///
    /// # Panics
    ///
    /// If `dim < 2^n_levels` (a leaf would own an empty range).
    pub fn new(dim: usize, n_levels: usize) -> Self {
        assert!(
            dim >= (1usize << n_levels),
            "dimension {dim} is too small for {n_levels} levels"
        );

        let mut levels: Vec<Vec<HodlrNode>> = Vec::with_capacity(n_levels + 1);
        let mut current: Vec<(usize, usize, Vec<AncestorStep>)> = vec![(0, dim, Vec::new())];
        for level in 0..n_levels {
            let mut nodes = Vec::with_capacity(current.len());
            let mut next = Vec::with_capacity(current.len() * 2);
            for (index, (row_start, row_span, ancestors)) in current.into_iter().enumerate() {
                let child_span = [row_span.div_ceil(2), row_span / 2];
                for slot in 0..2 {
                    let delta = if slot == 0 { 0 } else { child_span[0] };
                    let mut child_ancestors: Vec<AncestorStep> = ancestors
                        .iter()
                        .map(|step| AncestorStep {
                            offset: step.offset + delta,
                            ..*step
                        })
                        .collect();
                    child_ancestors.push(AncestorStep {
                        index,
                        slot,
                        offset: 0,
                    });
                    next.push((row_start + delta, child_span[slot], child_ancestors));
                }
                nodes.push(HodlrNode::new_internal(
                    level, index, row_start, row_span, child_span, ancestors,
                ));
            }
            levels.push(nodes);
            current = next;
        }
        let leaves = current
            .into_iter()
            .enumerate()
            .map(|(index, (row_start, row_span, ancestors))| {
                HodlrNode::new_leaf(n_levels, index, row_start, row_span, ancestors)
            })
            .collect();
        levels.push(leaves);

        Self {
            dim,
            n_levels,
            levels,
            factorized: false,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn n_levels(&self) -> usize {
        self.n_levels
    }

    pub fn nodes_in_level(&self, level: usize) -> usize {
        self.levels[level].len()
    }

    pub fn is_factorized(&self) -> bool {
        self.factorized
    }

    pub fn node(&self, level: usize, index: usize) -> &HodlrNode {
        &self.levels[level][index]
    }

    /// Mutable node access, for populating bases and leaf blocks directly
    /// instead of going through [`assemble`]. Drops any existing factorized
    /// state, since the working state would no longer match the inputs.
    ///
    /// [`assemble`]: HodlrTree::assemble
    pub fn node_mut(&mut self, level: usize, index: usize) -> &mut HodlrNode {
        self.factorized = false;
        &mut self.levels[level][index]
    }

    /// Forward application `A * rhs` of the assembled operator (original
    /// bases and leaf blocks; independent of factorization state).
    pub fn apply(&self, rhs: &Array2<f64>) -> Result<Array2<f64>, HodlrError> {
        if rhs.nrows() != self.dim {
            return Err(HodlrError::DimensionMismatch {
                expected: self.dim,
                found: rhs.nrows(),
            });
        }

        let mut out = Array2::zeros(rhs.raw_dim());
        let leaves = &self.levels[self.n_levels];
        split_into_node_blocks(leaves, out.view_mut())
            .into_par_iter()
            .zip(leaves.par_iter())
            .for_each(|(mut block, leaf)| {
                let b = rhs.slice(s![leaf.row_start..leaf.row_start + leaf.row_span, ..]);
                block.assign(&leaf.coupling.dot(&b));
            });

        for nodes in &self.levels[..self.n_levels] {
            split_into_node_blocks(nodes, out.view_mut())
                .into_par_iter()
                .zip(nodes.par_iter())
                .for_each(|(block, node)| {
                    if node.total_rank() == 0 {
                        return;
                    }
                    let b0 = rhs.slice(s![
                        node.child_start[0]..node.child_start[0] + node.child_span[0],
                        ..
                    ]);
                    let b1 = rhs.slice(s![
                        node.child_start[1]..node.child_start[1] + node.child_span[1],
                        ..
                    ]);
                    let (mut out0, mut out1) = block.split_at(Axis(0), node.child_span[0]);
                    if node.rank[0] > 0 {
                        out0 += &node.basis_u[0].dot(&node.basis_v[1].t().dot(&b1));
                    }
                    if node.rank[1] > 0 {
                        out1 += &node.basis_u[1].dot(&node.basis_v[0].t().dot(&b0));
                    }
                });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_tiles_every_level() {
        let tree = HodlrTree::new(11, 2);
        for level in 0..=tree.n_levels() {
            let nodes = &tree.levels[level];
            assert_eq!(nodes.len(), 1 << level);
            let mut expected_start = 0;
            for node in nodes {
                assert_eq!(node.row_start, expected_start);
                expected_start += node.row_span;
            }
            assert_eq!(expected_start, tree.dim());
        }
    }

    #[test]
    fn odd_ranges_give_first_child_the_extra_row() {
        let tree = HodlrTree::new(11, 1);
        let root = tree.node(0, 0);
        assert_eq!(root.child_span, [6, 5]);
        assert_eq!(root.child_start, [0, 6]);
    }

    #[test]
    fn ancestor_paths_reproduce_row_offsets() {
        let tree = HodlrTree::new(16, 3);
        for level in 1..=tree.n_levels() {
            for node in &tree.levels[level] {
                assert_eq!(node.ancestors.len(), level);
                for (ancestor_level, step) in node.ancestors.iter().enumerate() {
                    let ancestor = tree.node(ancestor_level, step.index);
                    assert_eq!(
                        ancestor.child_start[step.slot] + step.offset,
                        node.row_start
                    );
                    assert!(
                        node.row_start + node.row_span
                            <= ancestor.child_start[step.slot] + ancestor.child_span[step.slot]
                    );
                }
            }
        }
    }

    #[test]
    fn apply_rejects_mismatched_rows() {
        let tree = HodlrTree::new(8, 2);
        let rhs = Array2::<f64>::zeros((7, 1));
        assert!(matches!(
            tree.apply(&rhs),
            Err(HodlrError::DimensionMismatch {
                expected: 8,
                found: 7
            })
        ));
    }
}
