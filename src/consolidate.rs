//! Term consolidation.
//!
//! Two terms of one equation may be the same expression written with
//! different dummy labels, a different line order inside antisymmetric
//! tensors, or with two external labels exchanged. The passes here detect
//! this and fold such terms together, cancelling them when their prefactors
//! sum to zero.
//!
//! # Overview
//!
//! - [`terms_equal`] compares two terms up to factor line order and reports
//!   the number of transpositions separating them.
//! - [`consolidate`] folds directly equal terms.
//! - [`consolidate_with_relabeling`] additionally tries exchanging pairs of
//!   labels. Exchanging two dummy labels is a pure relabeling; exchanging
//!   two external labels produces a permutation operator.
//! - [`consolidate_with_paired_relabeling`] exchanges one dummy pair from
//!   each of two label groups at once.
//!
//! # Example
//!
//! ```rust
//! use tensor_cse::consolidate::consolidate_with_relabeling;
//! use tensor_cse::{Line, Term, Vertex};
//!
//! // R(i,j) = T(i,a) V(a,j) + T(j,a) V(a,i)
//! let r = Vertex::amplitude("R", vec![Line::occ("i")], vec![Line::occ("j")]);
//! let t = |i: &str| Vertex::amplitude("T", vec![Line::occ(i)], vec![Line::vir("a")]);
//! let v = |j: &str| Vertex::integral("V", vec![Line::vir("a")], vec![Line::occ(j)]);
//!
//! let mut terms = vec![
//!     Term::new(r.clone(), 1.0, vec![t("i"), v("j")]),
//!     Term::new(r.clone(), 1.0, vec![t("j"), v("i")]),
//! ];
//! let report = consolidate_with_relabeling(&mut terms, &["i", "j"]);
//! assert_eq!(report.num_removed(), 1);
//! assert_eq!(terms.len(), 1);
//! assert_eq!(terms[0].permutations().len(), 1);
//! ```

use crate::term::{Permutation, Term};
use crate::vertex::{Symbol, Vertex};
use crate::ZERO_TOLERANCE;
use std::collections::HashSet;

/// What happened to a pair of terms.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeKind {
    /// The source prefactor was added into the target.
    Folded,
    /// Prefactors summed to zero; both terms were removed.
    Cancelled,
    /// The source is the target with two external labels exchanged; the
    /// target now carries this permutation.
    Permuted(Permutation),
}

/// Describes a single merge between two terms.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOperation {
    /// Index of the term that absorbed the other
    pub target_index: usize,
    /// Index of the term that was removed
    pub source_index: usize,
    pub kind: MergeKind,
}

/// A record of the merges applied by one consolidation pass.
///
/// Indices refer to the term list as it was before the pass.
#[derive(Debug, Clone, Default)]
pub struct Consolidation {
    merges: Vec<MergeOperation>,
    removed: usize,
}

impl Consolidation {
    /// Get the merge operations.
    pub fn merges(&self) -> &[MergeOperation] {
        &self.merges
    }

    /// Get the number of merge operations.
    pub fn num_merges(&self) -> usize {
        self.merges.len()
    }

    /// Number of terms dropped from the list.
    pub fn num_removed(&self) -> usize {
        self.removed
    }

    /// Check if any merge was applied.
    pub fn is_simplified(&self) -> bool {
        !self.merges.is_empty()
    }
}

/// Compare two terms.
///
/// Returns the number of line transpositions relating the two when they are
/// equal up to prefactor, `None` otherwise. Terms are equal when they agree
/// on the zero-point flag and the ordered operand categories, their delta
/// pairs match in either orientation, every remaining factor of one matches
/// a distinct factor of the other with the same name and canonical lines,
/// and their permutation pairs match position by position.
pub fn terms_equal(t1: &Term, t2: &Term) -> Option<usize> {
    if !same_skeleton(t1, t2) {
        return None;
    }
    if !deltas_match(t1.rhs(), t2.rhs()) {
        return None;
    }

    let mut used = vec![false; t2.rhs().len()];
    let mut swaps = 0;
    for f1 in t1.rhs().iter().filter(|v| v.symbol() != Symbol::Delta) {
        let (lines1, swaps1) = f1.canonical_lines();
        let found = t2.rhs().iter().enumerate().find_map(|(j, f2)| {
            if used[j] || f2.symbol() != f1.symbol() || f2.name() != f1.name() {
                return None;
            }
            let (lines2, swaps2) = f2.canonical_lines();
            (lines1 == lines2).then_some((j, swaps2))
        });
        let (j, swaps2) = found?;
        used[j] = true;
        swaps += swaps1 + swaps2;
    }

    if t1.permutations().len() != t2.permutations().len() {
        return None;
    }
    let perms_match = t1
        .permutations()
        .iter()
        .zip(t2.permutations())
        .all(|(p, q)| p.matches(q));
    perms_match.then_some(swaps)
}

/// Zero-point flag and operand categories agree. Relabeling never changes
/// either, so this also gates the relabeling passes.
fn same_skeleton(t1: &Term, t2: &Term) -> bool {
    t1.zero_point() == t2.zero_point()
        && t1.rhs().len() == t2.rhs().len()
        && t1
            .rhs()
            .iter()
            .zip(t2.rhs())
            .all(|(a, b)| a.symbol() == b.symbol())
}

fn delta_pairs(factors: &[Vertex]) -> Vec<(&str, &str)> {
    factors
        .iter()
        .filter(|v| v.symbol() == Symbol::Delta)
        .filter_map(|v| match v.lines() {
            [a, b] => Some((a.label.as_str(), b.label.as_str())),
            _ => None,
        })
        .collect()
}

fn deltas_match(f1: &[Vertex], f2: &[Vertex]) -> bool {
    let d1 = delta_pairs(f1);
    let d2 = delta_pairs(f2);
    if d1.len() != d2.len() {
        return false;
    }
    let mut used = vec![false; d2.len()];
    d1.iter().all(|&(a, b)| {
        let hit = d2
            .iter()
            .enumerate()
            .find(|&(j, &(c, d))| !used[j] && ((a == c && b == d) || (a == d && b == c)));
        match hit {
            Some((j, _)) => {
                used[j] = true;
                true
            }
            None => false,
        }
    })
}

fn parity_sign(swaps: usize) -> f64 {
    if swaps % 2 == 0 {
        1.0
    } else {
        -1.0
    }
}

/// Book-keeping shared by the passes: removal marks and the merge log.
struct Pass {
    removed: Vec<bool>,
    report: Consolidation,
}

impl Pass {
    fn new(n: usize) -> Self {
        Self {
            removed: vec![false; n],
            report: Consolidation::default(),
        }
    }

    /// Fold `terms[j]` into `terms[i]`. Returns true on cancellation.
    fn fold(&mut self, terms: &mut [Term], i: usize, j: usize, swaps: usize) -> bool {
        let combined = terms[i].value() + terms[j].value() * parity_sign(swaps);
        let kind = if combined.abs() < ZERO_TOLERANCE {
            self.removed[i] = true;
            MergeKind::Cancelled
        } else {
            terms[i].set_value(combined);
            MergeKind::Folded
        };
        self.removed[j] = true;
        let cancelled = kind == MergeKind::Cancelled;
        self.report.merges.push(MergeOperation {
            target_index: i,
            source_index: j,
            kind,
        });
        cancelled
    }

    fn permute(&mut self, terms: &mut [Term], i: usize, j: usize, permutation: Permutation) {
        terms[i].push_permutation(permutation.clone());
        self.removed[j] = true;
        self.report.merges.push(MergeOperation {
            target_index: i,
            source_index: j,
            kind: MergeKind::Permuted(permutation),
        });
    }

    fn finish(self, terms: &mut Vec<Term>) -> Consolidation {
        let Pass { removed, mut report } = self;
        report.removed = removed.iter().filter(|&&r| r).count();
        let mut k = 0;
        terms.retain(|_| {
            let keep = !removed[k];
            k += 1;
            keep
        });
        report
    }
}

/// Fold directly equal terms.
pub fn consolidate(terms: &mut Vec<Term>) -> Consolidation {
    let n = terms.len();
    let mut pass = Pass::new(n);
    for i in 0..n {
        if pass.removed[i] {
            continue;
        }
        for j in (i + 1)..n {
            if pass.removed[j] {
                continue;
            }
            if let Some(swaps) = terms_equal(&terms[i], &terms[j]) {
                if pass.fold(terms, i, j, swaps) {
                    break;
                }
            }
        }
    }
    pass.finish(terms)
}

/// A pair of labels to exchange in a term.
#[derive(Debug, Clone)]
struct Exchange {
    first: String,
    second: String,
    external: bool,
}

/// Exchangeable pairs among `labels` for `term`: both occur exactly twice,
/// share an orbital class, and are both dummies or both external. Dummy
/// pairs come first.
fn exchanges<S: AsRef<str>>(term: &Term, labels: &[S]) -> Vec<Exchange> {
    let lhs: HashSet<&str> = term.lhs().lines().iter().map(|l| l.label.as_str()).collect();
    let labels: Vec<&str> = labels.iter().map(|l| l.as_ref()).collect();
    let mut seen: HashSet<&str> = HashSet::new();
    let eligible: Vec<(&str, bool, bool)> = labels
        .into_iter()
        .filter(|label| seen.insert(*label) && term.label_count(label) == 2)
        .filter_map(|label| {
            term.find_line(label)
                .map(|line| (label, line.occupied, lhs.contains(label)))
        })
        .collect();

    let mut pairs = Vec::new();
    for (k, &(a, occ_a, ext_a)) in eligible.iter().enumerate() {
        for &(b, occ_b, ext_b) in &eligible[k + 1..] {
            if occ_a == occ_b && ext_a == ext_b {
                pairs.push(Exchange {
                    first: a.to_string(),
                    second: b.to_string(),
                    external: ext_a,
                });
            }
        }
    }
    pairs.sort_by_key(|p| p.external);
    pairs
}

/// Fold terms that become equal after exchanging one pair of `labels`.
///
/// Dummy exchanges fold prefactors like [`consolidate`]. An external
/// exchange succeeds only when the exchanged image carries exactly the same
/// or exactly the opposite prefactor; the pair is then recorded on the kept
/// term as a symmetric or antisymmetric permutation.
pub fn consolidate_with_relabeling<S: AsRef<str>>(terms: &mut Vec<Term>, labels: &[S]) -> Consolidation {
    let n = terms.len();
    let mut pass = Pass::new(n);
    for i in 0..n {
        if pass.removed[i] {
            continue;
        }
        let candidates = exchanges(&terms[i], labels);
        for j in (i + 1)..n {
            if pass.removed[j] || !same_skeleton(&terms[i], &terms[j]) {
                continue;
            }
            if let Some(swaps) = terms_equal(&terms[i], &terms[j]) {
                if pass.fold(terms, i, j, swaps) {
                    break;
                }
                continue;
            }

            let mut cancelled = false;
            for exchange in &candidates {
                let copy = terms[i].swap_labels(&exchange.first, &exchange.second);
                let Some(swaps) = terms_equal(&copy, &terms[j]) else {
                    continue;
                };
                if !exchange.external {
                    cancelled = pass.fold(terms, i, j, swaps);
                    break;
                }
                if let Some(permutation) = permutation_for(&terms[i], &terms[j], exchange, swaps) {
                    pass.permute(terms, i, j, permutation);
                    break;
                }
            }
            if cancelled {
                break;
            }
        }
    }
    pass.finish(terms)
}

/// Permutation operator turning `target` into `target + source` when
/// `source` is `target` with the external pair exchanged.
fn permutation_for(target: &Term, source: &Term, exchange: &Exchange, swaps: usize) -> Option<Permutation> {
    let (a, b) = (&exchange.first, &exchange.second);
    if target.permutations().iter().any(|p| p.involves(a) || p.involves(b)) {
        return None;
    }
    let first = target.find_line(a)?.clone().with_bra(false);
    let second = target.find_line(b)?.clone().with_bra(false);

    let ratio = source.value() * parity_sign(swaps) / target.value();
    if (ratio - 1.0).abs() < ZERO_TOLERANCE {
        Some(Permutation::symmetric(first, second))
    } else if (ratio + 1.0).abs() < ZERO_TOLERANCE {
        Some(Permutation::antisymmetric(first, second))
    } else {
        None
    }
}

/// Fold terms that become equal after exchanging one dummy pair from
/// `labels_1` and one dummy pair from `labels_2` simultaneously.
pub fn consolidate_with_paired_relabeling<S: AsRef<str>>(
    terms: &mut Vec<Term>,
    labels_1: &[S],
    labels_2: &[S],
) -> Consolidation {
    let n = terms.len();
    let mut pass = Pass::new(n);
    for i in 0..n {
        if pass.removed[i] {
            continue;
        }
        let group_1: Vec<Exchange> = exchanges(&terms[i], labels_1)
            .into_iter()
            .filter(|e| !e.external)
            .collect();
        let group_2: Vec<Exchange> = exchanges(&terms[i], labels_2)
            .into_iter()
            .filter(|e| !e.external)
            .collect();

        for j in (i + 1)..n {
            if pass.removed[j] || !same_skeleton(&terms[i], &terms[j]) {
                continue;
            }
            if let Some(swaps) = terms_equal(&terms[i], &terms[j]) {
                if pass.fold(terms, i, j, swaps) {
                    break;
                }
                continue;
            }

            let found = group_1.iter().find_map(|e1| {
                let once = terms[i].swap_labels(&e1.first, &e1.second);
                group_2.iter().find_map(|e2| {
                    let twice = once.swap_labels(&e2.first, &e2.second);
                    terms_equal(&twice, &terms[j])
                })
            });
            if let Some(swaps) = found {
                if pass.fold(terms, i, j, swaps) {
                    break;
                }
            }
        }
    }
    pass.finish(terms)
}
