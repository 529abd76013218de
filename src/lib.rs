//! # tensor-cse - Symbolic Tensor-Term Consolidation and Intermediate Extraction
//!
//! A Rust library for simplifying the tensor-contraction equations of
//! many-body quantum-chemistry methods such as coupled cluster.
//!
//! ## What is a Term?
//!
//! Residual and energy equations are sums of *terms*. Each term is a signed
//! coefficient times a product of tensors: cluster amplitudes `t`, Hamiltonian
//! integrals `f` and `v`, and Kronecker deltas. Every index (a *line*) is
//! either occupied (`i, j, k, ...`) or virtual (`a, b, c, ...`). A label that
//! appears twice in a term is summed over; a label that appears once is an
//! external index of the left-hand side.
//!
//! The cost of evaluating a product depends on the order of its pairwise
//! contractions and on whether partial products can be shared between terms
//! and equations.
//!
//! ## Features
//!
//! 1. **Consolidation** - Detect terms that are the same expression up to
//!    renaming of summed labels, sign and antisymmetrization, then fold,
//!    cancel or fuse them under a permutation operator.
//! 2. **Intermediate extraction** - A greedy, cost-model-driven common
//!    subexpression search across a whole system of equations, promoting
//!    shared sub-products to named temporaries (`tmps_N`) and scalars
//!    (`scalars_N`).
//!
//! ### Feature 1: Consolidation
//!
//! ```rust
//! use tensor_cse::{consolidate_with_relabeling, Line, Term, Vertex};
//!
//! // R(i,j) = t(i|a) v(a|j) + t(j|a) v(a|i)
//! let lhs = Vertex::amplitude("R", vec![Line::occ("i")], vec![Line::occ("j")]);
//! let t = |o: &str| Vertex::amplitude("t", vec![Line::occ(o)], vec![Line::vir("a")]);
//! let v = |o: &str| Vertex::integral("v", vec![Line::vir("a")], vec![Line::occ(o)]);
//! let mut terms = vec![
//!     Term::new(lhs.clone(), 1.0, vec![t("i"), v("j")]),
//!     Term::new(lhs, 1.0, vec![t("j"), v("i")]),
//! ];
//!
//! let report = consolidate_with_relabeling(&mut terms, &["i", "j"]);
//! assert_eq!(report.num_removed(), 1);
//! assert_eq!(terms[0].permutations().len(), 1);
//! ```
//!
//! ### Feature 2: Intermediate extraction
//!
//! A candidate is any connected sub-product of up to
//! [`CseOptimizer::max_linkage_size`] factors. Each round substitutes every
//! candidate into a private copy of the system in parallel, scores the copy
//! with a [`ScalingMap`], and commits the best one.
//!
//! ```rust
//! use tensor_cse::{CseOptimizer, EquationSystem, Line, Term, Vertex};
//!
//! let op = |name: &str, p: &str, q: &str| {
//!     Vertex::amplitude(name, vec![Line::vir(p)], vec![Line::vir(q)])
//! };
//! let mut system = EquationSystem::new();
//! for name in ["r1", "r2", "r3"] {
//!     let lhs = op(name, "a", "c");
//!     let term = Term::new(lhs.clone(), 1.0, vec![op("x", "a", "b"), op("y", "b", "c")]);
//!     system.add_equation(name, lhs, vec![term]).unwrap();
//! }
//!
//! let summary = system.optimize(&CseOptimizer::new(2, 100)).unwrap();
//! assert_eq!(summary.num_temps, 1);
//! println!("{system}");
//! ```
//!
//! ## Cost Model
//!
//! Costs are asymptotic. Every binary contraction step adds one entry at the
//! *shape* of the labels it touches, written `o{occ}v{vir}`; memory entries
//! sit at the shape of each intermediate. Two maps compare from the largest
//! shape class down:
//!
//! ```text
//! {o2v4: 1, o2v2: 3}  better than  {o2v4: 2}
//! {o3v3: 1}           incomparable with  {o2v4: 1}
//! ```
//!
//! ## Logging
//!
//! Progress is reported through the [`log`] facade: one `info` line per
//! committed intermediate, `debug` detail per round, and a `warn` when the
//! temporary ceiling stops the search.
//!
//! ## JSON
//!
//! [`json::writejson`] and [`json::readjson`] store a whole optimized system,
//! declarations included, for renderers and code generators.

pub mod consolidate;
pub mod cse;
pub mod equation;
pub mod json;
pub mod line;
pub mod linkage;
pub mod linkage_set;
pub mod scaling;
pub mod system;
pub mod term;
pub mod vertex;

#[cfg(test)]
pub mod test_utils;

// Re-export main types
pub use consolidate::{
    consolidate, consolidate_with_paired_relabeling, consolidate_with_relabeling, terms_equal,
    Consolidation, MergeKind, MergeOperation,
};
pub use cse::{optimize, CseOptimizer, OptimizeSummary, StopReason};
pub use equation::{Equation, Substitutions};
pub use json::{from_json_str, readjson, to_json_string, writejson, JsonError};
pub use line::{Line, Shape};
pub use linkage::{compose, Linkage};
pub use linkage_set::LinkageSet;
pub use scaling::{Comparison, ScalingMap};
pub use system::{CseError, EquationSystem, TempCounts, SCALARS, TMPS};
pub use term::{Permutation, Term};
pub use vertex::{Symbol, Tensor, TensorKind, Vertex};

/// Magnitude below which a combined coefficient counts as exactly zero.
pub const ZERO_TOLERANCE: f64 = 1e-12;
