//! Test utilities for validating rewritten equations
//!
//! This module evaluates terms and equations numerically on small random
//! tensors, so that merging and substitution can be checked against the
//! value of the unoptimized system.

use crate::line::Line;
use crate::system::EquationSystem;
use crate::term::Term;
use crate::vertex::{Tensor, TensorKind, Vertex};
use ndarray::{ArrayD, Dimension, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

/// A dense array together with the label of each axis.
pub type Labelled = (Vec<String>, ArrayD<f64>);

/// Naive evaluator for testing
///
/// Every base tensor is filled with seeded random data the first time it
/// is seen and reused afterwards. Integrals and amplitudes are
/// antisymmetric under exchange of same-class lines within a block, so
/// that any line order of the same tensor evaluates consistently.
pub struct NaiveEvaluator {
    rng: StdRng,
    occ_dim: usize,
    vir_dim: usize,
    tensors: HashMap<String, ArrayD<f64>>,
}

impl NaiveEvaluator {
    /// Create an evaluator with 2 occupied and 3 virtual orbitals.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            occ_dim: 2,
            vir_dim: 3,
            tensors: HashMap::new(),
        }
    }

    /// Override the dimension of each orbital class.
    pub fn with_dims(mut self, occ_dim: usize, vir_dim: usize) -> Self {
        self.occ_dim = occ_dim;
        self.vir_dim = vir_dim;
        self
    }

    fn dim(&self, line: &Line) -> usize {
        if line.occupied {
            self.occ_dim
        } else {
            self.vir_dim
        }
    }

    /// Value of equation `name`, with axes in the order of its lhs lines.
    pub fn evaluate_equation(&mut self, system: &EquationSystem, name: &str) -> ArrayD<f64> {
        let equation = system
            .equation(name)
            .unwrap_or_else(|| panic!("no equation named {name}"));
        let shape: Vec<usize> = equation.lhs().lines().iter().map(|l| self.dim(l)).collect();
        let mut total: ArrayD<f64> = ArrayD::zeros(IxDyn(&shape));
        for term in equation.terms() {
            total = total + self.evaluate_term(system, term);
        }
        total
    }

    /// Value of a single term, with axes in the order of its lhs lines.
    ///
    /// Permutation operators are expanded one at a time:
    /// `X -> X + sign * X(first <-> second)`.
    pub fn evaluate_term(&mut self, system: &EquationSystem, term: &Term) -> ArrayD<f64> {
        let output: Vec<String> = term.lhs().lines().iter().map(|l| l.label.clone()).collect();
        let operands: Vec<Labelled> = term
            .rhs()
            .iter()
            .map(|v| self.evaluate_vertex(system, v))
            .collect();

        let mut result = einsum(&operands, &output) * term.value();
        for p in term.permutations() {
            let a = axis_of(&output, &p.first.label);
            let b = axis_of(&output, &p.second.label);
            let mut image = result.clone();
            image.swap_axes(a, b);
            result = &result + &(image * p.image_sign());
        }
        result
    }

    /// Value of an operand, labelled by its lines.
    ///
    /// Promoted intermediates evaluate their declaration; the declaration's
    /// lhs lines bind to the operand's lines by position.
    pub fn evaluate_vertex(&mut self, system: &EquationSystem, vertex: &Vertex) -> Labelled {
        let labels: Vec<String> = vertex.lines().iter().map(|l| l.label.clone()).collect();
        match vertex {
            Vertex::Tensor(t) => {
                let (canonical, swaps) = t.canonical_lines();
                let parity = if swaps % 2 == 0 { 1.0 } else { -1.0 };
                let data = self.base_tensor(t, &canonical) * parity;
                (canonical.iter().map(|l| l.label.clone()).collect(), data)
            }
            Vertex::Linkage(l) => match l.id() {
                Some(id) => {
                    let declaration = system
                        .declaration(id, l.is_scalar())
                        .unwrap_or_else(|| panic!("missing declaration for {}", vertex.name()));
                    (labels, self.evaluate_term(system, declaration))
                }
                None => {
                    let left = self.evaluate_vertex(system, l.left());
                    let right = self.evaluate_vertex(system, l.right());
                    let data = einsum(&[left, right], &labels);
                    (labels, data)
                }
            },
        }
    }

    fn base_tensor(&mut self, tensor: &Tensor, canonical: &[Line]) -> ArrayD<f64> {
        let shape: Vec<usize> = canonical.iter().map(|l| self.dim(l)).collect();
        if tensor.kind() == TensorKind::Delta {
            return ArrayD::from_shape_fn(IxDyn(&shape), |idx| if idx[0] == idx[1] { 1.0 } else { 0.0 });
        }

        let pattern: String = canonical
            .iter()
            .enumerate()
            .map(|(i, l)| {
                let class = if l.occupied { 'o' } else { 'v' };
                if i == tensor.n_bra() {
                    format!("|{class}")
                } else {
                    class.to_string()
                }
            })
            .collect();
        let key = format!("{:?}:{}:{}", tensor.kind(), tensor.name(), pattern);
        if let Some(data) = self.tensors.get(&key) {
            return data.clone();
        }

        let mut data = ArrayD::from_shape_fn(IxDyn(&shape), |_| self.rng.random_range(-1.0..1.0));
        if tensor.kind().is_antisymmetric() {
            for group in same_class_groups(canonical, tensor.n_bra()) {
                data = antisymmetrize(&data, &group);
            }
        }
        self.tensors.insert(key, data.clone());
        data
    }
}

/// Largest elementwise difference between two arrays of the same shape.
pub fn max_abs_diff(a: &ArrayD<f64>, b: &ArrayD<f64>) -> f64 {
    assert_eq!(a.shape(), b.shape(), "shape mismatch");
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

fn axis_of(labels: &[String], label: &str) -> usize {
    labels
        .iter()
        .position(|l| l == label)
        .unwrap_or_else(|| panic!("label {label} is not external"))
}

/// Positions of same-class lines within each block.
fn same_class_groups(lines: &[Line], n_bra: usize) -> Vec<Vec<usize>> {
    let mut groups = Vec::new();
    for (start, end) in [(0, n_bra), (n_bra, lines.len())] {
        for occupied in [true, false] {
            let group: Vec<usize> = (start..end).filter(|&i| lines[i].occupied == occupied).collect();
            if group.len() > 1 {
                groups.push(group);
            }
        }
    }
    groups
}

/// All permutations of `0..n` with their signs.
fn signed_permutations(n: usize) -> Vec<(Vec<usize>, f64)> {
    if n == 0 {
        return vec![(Vec::new(), 1.0)];
    }
    let mut out = Vec::new();
    for (perm, sign) in signed_permutations(n - 1) {
        // Insert n-1 at each position; moving it left by k costs k transpositions.
        for pos in 0..=perm.len() {
            let mut p = perm.clone();
            p.insert(pos, n - 1);
            let shift = perm.len() - pos;
            let s = if shift % 2 == 0 { sign } else { -sign };
            out.push((p, s));
        }
    }
    out
}

fn antisymmetrize(data: &ArrayD<f64>, group: &[usize]) -> ArrayD<f64> {
    let perms = signed_permutations(group.len());
    let norm = perms.len() as f64;
    ArrayD::from_shape_fn(data.raw_dim(), |idx| {
        let idx: Vec<usize> = idx.slice().to_vec();
        let mut sum = 0.0;
        for (perm, sign) in &perms {
            let mut source = idx.clone();
            for (k, &g) in group.iter().enumerate() {
                source[g] = idx[group[perm[k]]];
            }
            sum += sign * data[IxDyn(&source)];
        }
        sum / norm
    })
}

/// Sum over every label that does not appear in `output`.
///
/// Implements general einsum contraction using a simple nested-loop approach.
/// This is slower than optimized implementations but more likely to be correct.
pub fn einsum(operands: &[Labelled], output: &[String]) -> ArrayD<f64> {
    // Build label->size mapping
    let mut label_sizes: HashMap<&str, usize> = HashMap::new();
    let mut all_labels: Vec<&str> = Vec::new();
    for (labels, data) in operands {
        for (i, label) in labels.iter().enumerate() {
            let size = data.shape()[i];
            match label_sizes.get(label.as_str()) {
                Some(&existing) => assert_eq!(existing, size, "Label {label} has inconsistent sizes"),
                None => {
                    label_sizes.insert(label, size);
                    all_labels.push(label);
                }
            }
        }
    }

    let output_shape: Vec<usize> = output
        .iter()
        .map(|label| {
            *label_sizes
                .get(label.as_str())
                .unwrap_or_else(|| panic!("output label {label} not found"))
        })
        .collect();
    let mut result: ArrayD<f64> = ArrayD::zeros(IxDyn(&output_shape));

    let total_iterations: usize = all_labels.iter().map(|l| label_sizes[l]).product();
    let mut values: HashMap<&str, usize> = HashMap::new();
    for iter_idx in 0..total_iterations {
        // Decode iter_idx into label values
        let mut remaining = iter_idx;
        for &label in all_labels.iter().rev() {
            let size = label_sizes[label];
            values.insert(label, remaining % size);
            remaining /= size;
        }

        let mut product = 1.0;
        for (labels, data) in operands {
            let index: Vec<usize> = labels.iter().map(|l| values[l.as_str()]).collect();
            product *= data[IxDyn(&index)];
        }
        let out_index: Vec<usize> = output.iter().map(|l| values[l.as_str()]).collect();
        result[IxDyn(&out_index)] += product;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(ls: &[&str]) -> Vec<String> {
        ls.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_einsum_matrix_product() {
        let a = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![5.0, 6.0, 7.0, 8.0]).unwrap();
        let c = einsum(&[(labels(&["i", "j"]), a.clone()), (labels(&["j", "k"]), b)], &labels(&["i", "k"]));
        assert_eq!(c[IxDyn(&[0, 0])], 19.0);
        assert_eq!(c[IxDyn(&[1, 1])], 50.0);

        let total = einsum(&[(labels(&["i", "j"]), a)], &labels(&[]));
        assert_eq!(total[IxDyn(&[])], 10.0);
    }

    #[test]
    fn test_signed_permutations() {
        let perms = signed_permutations(3);
        assert_eq!(perms.len(), 6);
        assert_eq!(perms.iter().map(|(_, s)| s).sum::<f64>(), 0.0);
        let identity = perms.iter().find(|(p, _)| *p == vec![0, 1, 2]).unwrap();
        assert_eq!(identity.1, 1.0);
    }

    #[test]
    fn test_amplitude_is_antisymmetric() {
        let system = EquationSystem::new();
        let mut eval = NaiveEvaluator::new(7);
        let ij = Vertex::amplitude("t", vec![Line::vir("a"), Line::vir("b")], vec![Line::occ("i"), Line::occ("j")]);
        let ji = Vertex::amplitude("t", vec![Line::vir("a"), Line::vir("b")], vec![Line::occ("j"), Line::occ("i")]);
        let (l1, x) = eval.evaluate_vertex(&system, &ij);
        let (l2, y) = eval.evaluate_vertex(&system, &ji);
        let y = einsum(&[(l2, y)], &l1);
        assert!(max_abs_diff(&x, &(-y)) < 1e-12);
    }

    #[test]
    fn test_delta() {
        let system = EquationSystem::new();
        let mut eval = NaiveEvaluator::new(1);
        let (_, d) = eval.evaluate_vertex(&system, &Vertex::delta(Line::occ("i"), Line::occ("j")));
        assert_eq!(d[IxDyn(&[0, 0])], 1.0);
        assert_eq!(d[IxDyn(&[0, 1])], 0.0);
    }
}
