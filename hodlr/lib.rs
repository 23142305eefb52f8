#![deny(dead_code)]
#![deny(unused_imports)]

//! # Hierarchical Off-Diagonal Low-Rank (HODLR) direct solver
//!
//! A HODLR matrix partitions a dense matrix along a balanced binary tree:
//! every tree node owns a contiguous row range, the off-diagonal blocks
//! between the two children of a node are stored as low-rank factor pairs
//! `U * V^T`, and only the deepest level keeps its diagonal blocks dense.
//! For matrices whose off-diagonal interactions are numerically low rank
//! (kernel and integral-equation discretizations, covariance matrices),
//! this brings factorization, solves, and the log-determinant down to
//! near-linear cost.
//!
//! The crate implements the non-symmetric elimination: a bottom-up
//! Sherman–Morrison–Woodbury pass that reduces every node's off-diagonal
//! interaction to a small dense coupling system, propagating each
//! elimination's inverse action into the ancestor bases as it goes. Once
//! factorized, any dense right-hand side can be solved level by level with
//! no downward pass, and the log-determinant is the sum of the local pivot
//! logs.
//!
//! Assembly runs off a [`MatrixSource`] entry oracle: leaf blocks are pulled
//! densely, off-diagonal blocks are compressed by truncated SVD.

pub mod assemble;
mod factorize;
pub mod linalg;
pub mod node;
mod solve;
pub mod tree;

pub use assemble::{DenseSource, MatrixSource};
pub use linalg::{DenseLu, LinalgError};
pub use tree::{HodlrError, HodlrTree};
