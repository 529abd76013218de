//! A single term of an equation: coefficient, sign and a product of factors.

use crate::line::Line;
use crate::linkage::{contraction_tree, Linkage, TreeEnumerator, MAX_ENUMERATED_FACTORS};
use crate::scaling::ScalingMap;
use crate::vertex::{Symbol, Vertex};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Placeholder label used while swapping two labels.
const SWAP_SENTINEL: &str = "#";

/// A pair of external lines exchanged by a permutation operator.
///
/// An antisymmetric pair expands `X -> X - X(first <-> second)`, a
/// symmetric one `X -> X + X(first <-> second)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permutation {
    pub first: Line,
    pub second: Line,
    #[serde(default)]
    pub symmetric: bool,
}

impl Permutation {
    pub fn antisymmetric(first: Line, second: Line) -> Self {
        Self {
            first,
            second,
            symmetric: false,
        }
    }

    pub fn symmetric(first: Line, second: Line) -> Self {
        Self {
            first,
            second,
            symmetric: true,
        }
    }

    /// Same pair of labels, in either order, with the same symmetry.
    pub fn matches(&self, other: &Permutation) -> bool {
        let (a, b) = (&self.first.label, &self.second.label);
        let (c, d) = (&other.first.label, &other.second.label);
        self.symmetric == other.symmetric && ((a == c && b == d) || (a == d && b == c))
    }

    pub fn involves(&self, label: &str) -> bool {
        self.first.label == label || self.second.label == label
    }

    /// Sign applied to the exchanged image.
    pub fn image_sign(&self) -> f64 {
        if self.symmetric {
            1.0
        } else {
            -1.0
        }
    }

    fn renamed(&self, from: &str, to: &str) -> Self {
        let rename = |l: &Line| if l.label == from { l.renamed(to) } else { l.clone() };
        Self {
            first: rename(&self.first),
            second: rename(&self.second),
            symmetric: self.symmetric,
        }
    }
}

impl fmt::Display for Permutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = if self.symmetric { "S" } else { "P" };
        write!(f, "{op}({},{})", self.first, self.second)
    }
}

/// `lhs += sign * coefficient * P... * rhs[0] * rhs[1] * ...`
///
/// Factors are kept sorted by operand category, then name, then rank. The
/// contraction tree is the cheapest binary tree over them, so costs do not
/// depend on the sort order. Antisymmetric tensors are stored with
/// canonical line order, the parity of which is folded into the sign on
/// construction.
#[derive(Debug, Clone)]
pub struct Term {
    lhs: Vertex,
    rhs: Vec<Vertex>,
    coefficient: f64,
    sign: i8,
    permutations: Vec<Permutation>,
    comments: Vec<String>,
    zero_point: bool,
    linkage: Option<Arc<Linkage>>,
    flop_map: ScalingMap,
    mem_map: ScalingMap,
}

impl Term {
    /// Build a term with signed prefactor `value`.
    pub fn new(lhs: Vertex, value: f64, rhs: Vec<Vertex>) -> Self {
        let mut term = Self::raw(lhs, rhs);
        term.set_value(value);
        term.canonicalize();
        term
    }

    /// Declaration of a promoted intermediate: `temp = left * right`.
    pub fn declaration(temp: &Linkage) -> Self {
        let body = temp.unpromoted();
        let rhs = vec![body.left().clone(), body.right().clone()];
        let mut term = Self::raw(Vertex::Linkage(Arc::new(temp.clone())), rhs);
        term.rebuild();
        term
    }

    fn raw(lhs: Vertex, rhs: Vec<Vertex>) -> Self {
        Self {
            lhs,
            rhs,
            coefficient: 1.0,
            sign: 1,
            permutations: Vec::new(),
            comments: Vec::new(),
            zero_point: false,
            linkage: None,
            flop_map: ScalingMap::new(),
            mem_map: ScalingMap::new(),
        }
    }

    pub fn with_permutation(mut self, permutation: Permutation) -> Self {
        self.permutations.push(permutation);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comments.push(comment.into());
        self
    }

    /// Mark the term as carrying a boson zero-point contribution.
    pub fn with_zero_point(mut self, zero_point: bool) -> Self {
        self.zero_point = zero_point;
        self
    }

    pub fn lhs(&self) -> &Vertex {
        &self.lhs
    }

    pub fn rhs(&self) -> &[Vertex] {
        &self.rhs
    }

    /// Magnitude of the prefactor.
    pub fn coefficient(&self) -> f64 {
        self.coefficient
    }

    pub fn sign(&self) -> i8 {
        self.sign
    }

    /// Signed prefactor.
    pub fn value(&self) -> f64 {
        self.coefficient * f64::from(self.sign)
    }

    pub fn set_value(&mut self, value: f64) {
        self.coefficient = value.abs();
        self.sign = if value < 0.0 { -1 } else { 1 };
    }

    pub fn permutations(&self) -> &[Permutation] {
        &self.permutations
    }

    pub fn comments(&self) -> &[String] {
        &self.comments
    }

    pub fn zero_point(&self) -> bool {
        self.zero_point
    }

    /// Contraction tree of the factors; `None` for fewer than two factors.
    pub fn linkage(&self) -> Option<&Arc<Linkage>> {
        self.linkage.as_ref()
    }

    pub fn flop_map(&self) -> &ScalingMap {
        &self.flop_map
    }

    pub fn mem_map(&self) -> &ScalingMap {
        &self.mem_map
    }

    /// Whether this term defines a promoted intermediate.
    pub fn is_declaration(&self) -> bool {
        self.lhs.is_promoted()
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.rhs.iter().map(Vertex::symbol).collect()
    }

    /// Occurrences of `label` across the lhs and the visible factor lines.
    pub fn label_count(&self, label: &str) -> usize {
        self.lhs
            .lines()
            .iter()
            .chain(self.rhs.iter().flat_map(|v| v.lines()))
            .filter(|l| l.label == label)
            .count()
    }

    /// First line carrying `label`, searching factors before the lhs.
    pub fn find_line(&self, label: &str) -> Option<&Line> {
        self.rhs
            .iter()
            .flat_map(|v| v.lines())
            .chain(self.lhs.lines())
            .find(|l| l.label == label)
    }

    /// Number of factors that are the promoted intermediate `id`.
    pub fn contains_temp(&self, id: usize, scalar: bool) -> usize {
        self.rhs.iter().filter(|v| v.is_temp(id, scalar)).count()
    }

    pub(crate) fn set_lhs(&mut self, lhs: Vertex) {
        self.lhs = lhs;
    }

    pub(crate) fn push_permutation(&mut self, permutation: Permutation) {
        self.permutations.push(permutation);
    }

    pub(crate) fn set_permutations(&mut self, permutations: Vec<Permutation>) {
        self.permutations = permutations;
    }

    pub(crate) fn set_comments(&mut self, comments: Vec<String>) {
        self.comments = comments;
    }

    /// Copy with `a` and `b` exchanged in the factors and permutation
    /// pairs. The lhs is untouched and no re-canonicalization happens, so
    /// the line order inside each factor records the exchange.
    pub fn swap_labels(&self, a: &str, b: &str) -> Term {
        let mut term = self
            .renamed(a, SWAP_SENTINEL)
            .renamed(b, a)
            .renamed(SWAP_SENTINEL, b);
        term.rebuild();
        term
    }

    fn renamed(&self, from: &str, to: &str) -> Term {
        Term {
            rhs: self.rhs.iter().map(|v| v.renamed(from, to)).collect(),
            permutations: self.permutations.iter().map(|p| p.renamed(from, to)).collect(),
            ..self.clone()
        }
    }

    /// Every connected sub-product of 2..=`max_size` factors, in every
    /// binary parenthesisation, in normalized layout.
    pub fn sub_linkages(&self, max_size: usize) -> Vec<Arc<Linkage>> {
        let n = self.rhs.len();
        if n < 2 || n > MAX_ENUMERATED_FACTORS {
            return Vec::new();
        }
        let mut trees = TreeEnumerator::new(&self.rhs);
        let mut out = Vec::new();
        for mask in 1u32..(1u32 << n) {
            let size = mask.count_ones() as usize;
            if size < 2 || size > max_size {
                continue;
            }
            out.extend(trees.trees(mask).into_iter().filter_map(|v| match v {
                Vertex::Linkage(l) => l.normalized().map(|(n, _)| Arc::new(n)),
                Vertex::Tensor(_) => None,
            }));
        }
        out
    }

    /// Replace every occurrence of the promoted `temp` among the factors.
    ///
    /// The rewrite is kept only if the term's own flop map improves, or
    /// stays the same and `allow_equality` is set. An odd number of line
    /// transpositions needed to match an occurrence flips the sign. Returns
    /// the number of replacements kept.
    pub fn substitute(&mut self, temp: &Linkage, allow_equality: bool) -> usize {
        let Some(id) = temp.id() else {
            return 0;
        };
        let size = temp.leaf_count();
        if size < 2 || self.rhs.len() < size || !self.has_leaves_of(temp) {
            return 0;
        }

        let mut trial = self.clone();
        let mut count = 0;
        while let Some((mask, local, swaps)) = trial.find_occurrence(temp, size) {
            let mut rhs: Vec<Vertex> = trial
                .rhs
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) == 0)
                .map(|(_, v)| v.clone())
                .collect();
            rhs.push(Vertex::Linkage(Arc::new(local.with_id(id))));
            trial.rhs = rhs;
            if swaps % 2 == 1 {
                trial.sign = -trial.sign;
            }
            trial.sort_rhs();
            count += 1;
        }
        if count == 0 {
            return 0;
        }

        trial.rebuild();
        // A rewrite that trades one class for another is ranked by the
        // highest differing class, not refused as incomparable.
        let accepted = match trial.flop_map.cost_cmp(&self.flop_map) {
            Ordering::Less => true,
            Ordering::Equal => allow_equality,
            Ordering::Greater => false,
        };
        if !accepted {
            return 0;
        }
        *self = trial;
        count
    }

    fn has_leaves_of(&self, temp: &Linkage) -> bool {
        temp.leaves().iter().all(|leaf| {
            self.rhs
                .iter()
                .any(|v| v.symbol() == leaf.symbol() && v.name() == leaf.name())
        })
    }

    /// First sub-product matching `temp`, normalized, with the factor mask
    /// it covers and the line transpositions normalization applied.
    fn find_occurrence(&self, temp: &Linkage, size: usize) -> Option<(u32, Linkage, usize)> {
        let n = self.rhs.len();
        if n < size || n > MAX_ENUMERATED_FACTORS {
            return None;
        }
        let mut trees = TreeEnumerator::new(&self.rhs);
        (1u32..(1u32 << n))
            .filter(|mask| mask.count_ones() as usize == size)
            .find_map(|mask| {
                trees.trees(mask).into_iter().find_map(|v| {
                    let l = v.as_linkage()?;
                    if l.flop_map() != temp.flop_map() || l.lines().len() != temp.lines().len() {
                        return None;
                    }
                    let (local, swaps) = l.normalized()?;
                    (local.signature() == temp.signature()).then_some((mask, local, swaps))
                })
            })
    }

    fn canonicalize(&mut self) {
        let mut swaps = 0;
        for factor in self.rhs.iter_mut() {
            let (canonical, n) = factor.canonicalized();
            *factor = canonical;
            swaps += n;
        }
        if swaps % 2 == 1 {
            self.sign = -self.sign;
        }
        self.sort_rhs();
        self.rebuild();
    }

    fn sort_rhs(&mut self) {
        self.rhs.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    }

    /// Recompute the contraction tree and costs from the factor list.
    fn rebuild(&mut self) {
        self.linkage = contraction_tree(&self.rhs).and_then(|tree| tree.as_linkage().cloned());
        match &self.linkage {
            Some(l) => {
                self.flop_map = l.flop_map().clone();
                self.mem_map = l.mem_map().clone();
            }
            None => {
                self.flop_map = ScalingMap::new();
                self.mem_map = ScalingMap::new();
            }
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = if self.is_declaration() { "=" } else { "+=" };
        write!(f, "{} {op} {:+.6}", self.lhs, self.value())?;
        for p in &self.permutations {
            write!(f, " {p}")?;
        }
        for v in &self.rhs {
            write!(f, " {v}")?;
        }
        Ok(())
    }
}

/// Labels of `term` visible on its factors, each once, in first-seen order.
pub(crate) fn factor_labels(term: &Term) -> Vec<&str> {
    let mut out: Vec<&str> = Vec::new();
    for line in term.rhs().iter().flat_map(|v| v.lines()) {
        if !out.contains(&line.label.as_str()) {
            out.push(&line.label);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::Shape;
    use crate::linkage::compose;

    fn r(a: &str, b: &str) -> Vertex {
        Vertex::amplitude("r", vec![Line::vir(a)], vec![Line::vir(b)])
    }

    fn x(a: &str, b: &str) -> Vertex {
        Vertex::amplitude("x", vec![Line::vir(a)], vec![Line::vir(b)])
    }

    fn y(a: &str, b: &str) -> Vertex {
        Vertex::amplitude("y", vec![Line::vir(a)], vec![Line::vir(b)])
    }

    fn z(a: &str, b: &str) -> Vertex {
        Vertex::amplitude("z", vec![Line::vir(a)], vec![Line::vir(b)])
    }

    #[test]
    fn test_new_sorts_and_folds_parity() {
        let lhs = Vertex::amplitude("r2", vec![Line::vir("a"), Line::vir("b")], vec![Line::occ("i"), Line::occ("j")]);
        let t2 = Vertex::amplitude("t2", vec![Line::vir("b"), Line::vir("a")], vec![Line::occ("i"), Line::occ("j")]);
        let v = Vertex::integral("v", vec![Line::occ("m")], vec![Line::occ("m")]);
        let term = Term::new(lhs, 0.5, vec![t2, v]);
        assert_eq!(term.sign(), -1);
        assert_eq!(term.coefficient(), 0.5);
        assert_eq!(term.rhs()[0].name(), "v");
        assert_eq!(term.rhs()[1].to_string(), "t2(a,b,i,j)");
    }

    #[test]
    fn test_costs() {
        let term = Term::new(r("a", "d"), 1.0, vec![x("a", "b"), y("b", "c"), z("c", "d")]);
        // Each step of a chain touches three virtual labels.
        assert_eq!(term.flop_map().total(), 2);
        assert_eq!(term.flop_map().get(&Shape::new(0, 3)), 2);
        assert_eq!(term.flop_map().get(&Shape::new(0, 4)), 0);

        let single = Term::new(r("a", "d"), 1.0, vec![x("a", "d")]);
        assert!(single.flop_map().is_empty());
        assert!(single.linkage().is_none());
    }

    #[test]
    fn test_tree_ignores_factor_sort_order() {
        // u sorts before x although it only touches y.
        let u = Vertex::amplitude("u", vec![Line::vir("c")], vec![Line::vir("d")]);
        let term = Term::new(r("a", "d"), 1.0, vec![x("a", "b"), y("b", "c"), u]);
        assert_eq!(term.rhs()[0].name(), "u");
        assert_eq!(term.flop_map().get(&Shape::new(0, 3)), 2);
        assert_eq!(term.flop_map().get(&Shape::new(0, 4)), 0);
        assert_eq!(term.linkage().unwrap().leaf_count(), 3);
    }

    #[test]
    fn test_substitute_relabeled_dummy_flips_sign() {
        let lhs = Vertex::amplitude("r", vec![Line::vir("a")], vec![Line::occ("i"), Line::occ("j"), Line::vir("b")]);
        let x = |d: &str| Vertex::amplitude("x", vec![Line::vir("a")], vec![Line::occ("i"), Line::occ(d)]);
        let y = |d: &str| Vertex::amplitude("y", vec![Line::occ(d)], vec![Line::occ("j"), Line::vir("b")]);

        let source = Term::new(lhs.clone(), 1.0, vec![x("k"), y("k")]);
        let temp = source.sub_linkages(2)[0].with_id(1);

        // h sorts before i, so the stored x is x(a,h,i) with the sign flipped.
        let mut term = Term::new(lhs, 1.0, vec![x("h"), y("h")]);
        assert_eq!(term.sign(), -1);
        assert_eq!(term.substitute(&temp, true), 1);
        assert_eq!(term.sign(), 1);
        assert_eq!(term.rhs()[0].to_string(), "tmps_1(a,i,j,b)");
    }

    #[test]
    fn test_swap_labels() {
        let term = Term::new(r("a", "c"), 1.0, vec![x("a", "b"), y("b", "c")])
            .with_permutation(Permutation::antisymmetric(Line::vir("a"), Line::vir("c")));
        let swapped = term.swap_labels("a", "c");
        assert_eq!(swapped.rhs()[0].to_string(), "x(c,b)");
        assert_eq!(swapped.rhs()[1].to_string(), "y(b,a)");
        assert_eq!(swapped.lhs().to_string(), "r(a,c)");
        assert!(swapped.permutations()[0].matches(&term.permutations()[0]));
        assert_eq!(swapped.label_count("#"), 0);
    }

    #[test]
    fn test_substitute_whole_product() {
        let mut term = Term::new(r("a", "c"), 1.0, vec![x("a", "b"), y("b", "c")]);
        let temp = compose(&x("d", "e"), &y("e", "f")).unwrap().with_id(1);
        assert_eq!(term.substitute(&temp, true), 1);
        assert_eq!(term.rhs().len(), 1);
        assert_eq!(term.rhs()[0].to_string(), "tmps_1(a,c)");
        assert_eq!(term.contains_temp(1, false), 1);
        assert!(term.flop_map().is_empty());
    }

    #[test]
    fn test_substitute_partial_product() {
        let mut term = Term::new(r("a", "d"), 1.0, vec![x("a", "b"), y("b", "c"), z("c", "d")]);
        let temp = compose(&y("e", "f"), &z("f", "g")).unwrap().with_id(3);
        assert_eq!(term.substitute(&temp, true), 1);
        assert_eq!(term.to_string(), "r(a,d) += +1.000000 x(a,b) tmps_3(b,d)");
        assert_eq!(term.flop_map().total(), 1);
    }

    #[test]
    fn test_substitute_requires_promoted_temp() {
        let mut term = Term::new(r("a", "c"), 1.0, vec![x("a", "b"), y("b", "c")]);
        let unpromoted = compose(&x("d", "e"), &y("e", "f")).unwrap();
        assert_eq!(term.substitute(&unpromoted, true), 0);
    }

    #[test]
    fn test_sub_linkages() {
        let term = Term::new(r("a", "d"), 1.0, vec![x("a", "b"), y("b", "c"), z("c", "d")]);
        // xy, yz, (xy)z, x(yz)
        assert_eq!(term.sub_linkages(3).len(), 4);
        assert_eq!(term.sub_linkages(2).len(), 2);
    }

    #[test]
    fn test_declaration() {
        let temp = compose(&x("a", "b"), &y("b", "c")).unwrap().with_id(2);
        let decl = Term::declaration(&temp);
        assert!(decl.is_declaration());
        assert_eq!(decl.to_string(), "tmps_2(a,c) = +1.000000 x(a,b) y(b,c)");
        assert_eq!(decl.flop_map().total(), 1);
    }

    #[test]
    fn test_label_count() {
        let term = Term::new(r("a", "c"), 1.0, vec![x("a", "b"), y("b", "c")]);
        assert_eq!(term.label_count("a"), 2);
        assert_eq!(term.label_count("b"), 2);
        assert_eq!(factor_labels(&term), vec!["a", "b", "c"]);
    }
}
