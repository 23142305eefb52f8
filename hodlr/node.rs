use crate::linalg::DenseLu;
use ndarray::{Array2, ArrayView2, Axis, s};

/// One step of a node's stored ancestor path.
///
/// Replaces the original bit-arithmetic walk (`child = k % 2; k = k / 2`)
/// with explicit links: for the ancestor at a given level, `index` is its
/// position within that level, `slot` is which of its two children the node
/// descends through, and `offset` is where the node's row range starts
/// inside that child slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AncestorStep {
    pub index: usize,
    pub slot: usize,
    pub offset: usize,
}

/// One node of the HODLR tree.
///
/// Level 0 is the root; the deepest level holds the leaves. A non-leaf at
/// `(level, k)` has children `(level + 1, 2k)` and `(level + 1, 2k + 1)`.
///
/// Basis convention (from the off-diagonal block structure): the block
/// coupling child 1 into child 0's equations is `basis_u[0] * basis_v[1]^T`
/// with rank `rank[0]`, and its mirror is `basis_u[1] * basis_v[0]^T` with
/// rank `rank[1]`. So `basis_u[c]` is `child_span[c] x rank[c]` while
/// `basis_v[c]` is `child_span[c] x rank[1 - c]`.
///
/// `basis_u`/`basis_v` are set at assembly and never touched afterwards;
/// `u_factor`/`v_factor`/`coupling`/`coupling_lu` are the factorization's
/// working state, rebuilt from scratch on every [`factorize`] pass. Only
/// `u_factor` absorbs corrections from descendant eliminations.
///
/// [`factorize`]: crate::HodlrTree::factorize
pub struct HodlrNode {
    pub level: usize,
    pub index: usize,
    /// Global start of the row range this node owns.
    pub row_start: usize,
    pub row_span: usize,
    /// Global row offsets of the two children (non-leaf only).
    pub child_start: [usize; 2],
    pub child_span: [usize; 2],
    /// Numerical rank of each child's off-diagonal coupling; 0 means none.
    pub rank: [usize; 2],
    pub basis_u: [Array2<f64>; 2],
    pub basis_v: [Array2<f64>; 2],
    pub u_factor: [Array2<f64>; 2],
    pub v_factor: [Array2<f64>; 2],
    /// Woodbury coupling matrix for non-leaves; the dense diagonal block for
    /// leaves.
    pub coupling: Array2<f64>,
    /// Pivoted LU of `coupling`; present only once this node's elimination
    /// step has run (and, for non-leaves, only when a coupling exists).
    pub coupling_lu: Option<DenseLu>,
    /// Path up to the root, indexed by ancestor level (`ancestors[l]` is the
    /// ancestor at level `l`; empty for the root).
    pub ancestors: Vec<AncestorStep>,
    pub is_leaf: bool,
}

fn empty_bases(spans: [usize; 2]) -> [Array2<f64>; 2] {
    [
        Array2::zeros((spans[0], 0)),
        Array2::zeros((spans[1], 0)),
    ]
}

impl HodlrNode {
    pub(crate) fn new_leaf(
        level: usize,
        index: usize,
        row_start: usize,
        row_span: usize,
        ancestors: Vec<AncestorStep>,
    ) -> Self {
        Self {
            level,
            index,
            row_start,
            row_span,
            child_start: [row_start; 2],
            child_span: [0, 0],
            rank: [0, 0],
            basis_u: empty_bases([0, 0]),
            basis_v: empty_bases([0, 0]),
            u_factor: empty_bases([0, 0]),
            v_factor: empty_bases([0, 0]),
            coupling: Array2::zeros((row_span, row_span)),
            coupling_lu: None,
            ancestors,
            is_leaf: true,
        }
    }

    pub(crate) fn new_internal(
        level: usize,
        index: usize,
        row_start: usize,
        row_span: usize,
        child_span: [usize; 2],
        ancestors: Vec<AncestorStep>,
    ) -> Self {
        Self {
            level,
            index,
            row_start,
            row_span,
            child_start: [row_start, row_start + child_span[0]],
            child_span,
            rank: [0, 0],
            basis_u: empty_bases(child_span),
            basis_v: empty_bases(child_span),
            u_factor: empty_bases(child_span),
            v_factor: empty_bases(child_span),
            coupling: Array2::zeros((0, 0)),
            coupling_lu: None,
            ancestors,
            is_leaf: false,
        }
    }

    pub fn total_rank(&self) -> usize {
        self.rank[0] + self.rank[1]
    }

    /// Whether this node's elimination contributes corrections to its
    /// ancestors. Leaves always do; a non-leaf without coupling has nothing
    /// to propagate.
    pub(crate) fn propagates(&self) -> bool {
        self.is_leaf || self.total_rank() > 0
    }

    /// Restores the pre-factorization working state: working bases copied
    /// from the originals, coupling reset to the identity of the total child
    /// rank, any stale factorization dropped.
    pub(crate) fn reset_working_state(&mut self) {
        self.u_factor = self.basis_u.clone();
        self.v_factor = self.basis_v.clone();
        self.coupling = Array2::eye(self.total_rank());
        self.coupling_lu = None;
    }

    /// Leaf elimination: pivoted LU of the dense diagonal block.
    pub(crate) fn factorize_leaf(&mut self) {
        debug_assert!(self.is_leaf);
        self.coupling_lu = Some(DenseLu::factor(&self.coupling));
    }

    /// Non-leaf elimination: fill the coupling matrix's two off-diagonal
    /// sub-blocks from the children's already-corrected factors, then
    /// factorize it. The diagonal sub-blocks stay identity from the reset.
    pub(crate) fn factorize_coupling(&mut self) {
        debug_assert!(!self.is_leaf);
        let r0 = self.rank[0];
        let child1_into_0 = self.v_factor[1].t().dot(&self.u_factor[1]);
        self.coupling
            .slice_mut(s![..r0, r0..])
            .assign(&child1_into_0);
        let child0_into_1 = self.v_factor[0].t().dot(&self.u_factor[0]);
        self.coupling
            .slice_mut(s![r0.., ..r0])
            .assign(&child0_into_1);
        self.coupling_lu = Some(DenseLu::factor(&self.coupling));
    }

    /// The inverse action of this node's eliminated sub-problem applied to a
    /// block of `row_span` rows.
    ///
    /// For a leaf this is the direct dense solve. For a non-leaf it is the
    /// local Woodbury identity `x = b - U (I + V^T U)^{-1} V^T b`, expressed
    /// through the corrected factors and the coupling LU. A node that never
    /// factorized a coupling (both ranks zero) acts as the identity.
    pub(crate) fn apply_inverse(&self, block: ArrayView2<'_, f64>) -> Array2<f64> {
        debug_assert_eq!(block.nrows(), self.row_span);
        let Some(lu) = &self.coupling_lu else {
            return block.to_owned();
        };
        if self.is_leaf {
            return lu.solve(&block);
        }

        let [r0, r1] = self.rank;
        let cols = block.ncols();
        let (b0, b1) = block.split_at(Axis(0), self.child_span[0]);

        let mut stacked = Array2::zeros((r0 + r1, cols));
        stacked
            .slice_mut(s![..r0, ..])
            .assign(&self.v_factor[1].t().dot(&b1));
        stacked
            .slice_mut(s![r0.., ..])
            .assign(&self.v_factor[0].t().dot(&b0));
        let corrected = lu.solve(&stacked);

        let mut out = block.to_owned();
        let (mut out0, mut out1) = out.view_mut().split_at(Axis(0), self.child_span[0]);
        out0 -= &self.u_factor[0].dot(&corrected.slice(s![..r0, ..]));
        out1 -= &self.u_factor[1].dot(&corrected.slice(s![r0.., ..]));
        out
    }
}
