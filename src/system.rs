//! The equation system under optimization.
//!
//! [`EquationSystem`] owns the equations together with the counters that
//! number promoted intermediates. Declarations of temporaries and scalars
//! live in two reserved equations, [`TMPS`] and [`SCALARS`].

use crate::cse::{CseOptimizer, OptimizeSummary};
use crate::equation::{Equation, Substitutions};
use crate::linkage::Linkage;
use crate::linkage_set::LinkageSet;
use crate::scaling::ScalingMap;
use crate::term::{Permutation, Term};
use crate::vertex::Vertex;
use crate::ZERO_TOLERANCE;
use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use thiserror::Error;

/// Name of the equation holding temporary declarations.
pub const TMPS: &str = "tmps";
/// Name of the equation holding scalar declarations.
pub const SCALARS: &str = "scalars";

/// Errors raised while building or optimizing an equation system.
#[derive(Debug, Error)]
pub enum CseError {
    #[error("equation `{equation}`: label `{label}` occurs {count} times")]
    MalformedTerm {
        equation: String,
        label: String,
        count: usize,
    },

    #[error("equation `{equation}`: label `{label}` is external on one side only")]
    ExternalMismatch { equation: String, label: String },

    #[error("equation `{equation}`: permutation label `{label}` is not on the left-hand side")]
    InvalidPermutation { equation: String, label: String },

    #[error("equation `{0}` already exists")]
    DuplicateEquation(String),

    #[error("`{0}` is reserved for intermediate declarations")]
    ReservedName(String),

    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Number of promoted temporaries and scalars so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempCounts {
    pub tmps: usize,
    pub scalars: usize,
}

impl TempCounts {
    pub fn get(&self, scalar: bool) -> usize {
        if scalar {
            self.scalars
        } else {
            self.tmps
        }
    }

    /// Id the next intermediate of this class will receive.
    pub(crate) fn next(&self, scalar: bool) -> usize {
        self.get(scalar) + 1
    }

    pub(crate) fn bump(&mut self, scalar: bool) -> usize {
        let counter = if scalar { &mut self.scalars } else { &mut self.tmps };
        *counter += 1;
        *counter
    }
}

/// A set of equations plus the intermediates extracted from them.
#[derive(Debug, Clone, Default)]
pub struct EquationSystem {
    equations: Vec<Equation>,
    counts: TempCounts,
}

impl EquationSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(equations: Vec<Equation>, counts: TempCounts) -> Self {
        Self { equations, counts }
    }

    /// Add an equation `lhs = sum(terms)`.
    pub fn add_equation(&mut self, name: impl Into<String>, lhs: Vertex, terms: Vec<Term>) -> Result<(), CseError> {
        let name = name.into();
        if name == TMPS || name == SCALARS {
            return Err(CseError::ReservedName(name));
        }
        if self.equation(&name).is_some() {
            return Err(CseError::DuplicateEquation(name));
        }
        let mut equation = Equation::new(name, lhs);
        for term in terms {
            equation.add_term(term)?;
        }
        self.equations.push(equation);
        Ok(())
    }

    pub fn equations(&self) -> &[Equation] {
        &self.equations
    }

    pub fn equation(&self, name: &str) -> Option<&Equation> {
        self.equations.iter().find(|e| e.name() == name)
    }

    pub fn counts(&self) -> TempCounts {
        self.counts
    }

    pub fn total_terms(&self) -> usize {
        self.equations.iter().map(Equation::len).sum()
    }

    pub fn flop_map(&self) -> ScalingMap {
        self.equations.iter().map(|e| e.flop_map()).fold(ScalingMap::new(), |acc, m| acc + &m)
    }

    pub fn mem_map(&self) -> ScalingMap {
        self.equations.iter().map(|e| e.mem_map()).fold(ScalingMap::new(), |acc, m| acc + &m)
    }

    /// Declaration of intermediate `id` of the given class.
    pub fn declaration(&self, id: usize, scalar: bool) -> Option<&Term> {
        let container = if scalar { SCALARS } else { TMPS };
        self.equation(container)?
            .terms()
            .iter()
            .find(|t| t.lhs().is_temp(id, scalar))
    }

    /// Run the substitution search with `config`.
    pub fn optimize(&mut self, config: &CseOptimizer) -> Result<OptimizeSummary, CseError> {
        crate::cse::optimize(self, config)
    }

    /// Fold equal terms in every equation, one task per equation. Returns
    /// the number of terms removed.
    pub fn merge_terms(&mut self) -> usize {
        self.equations
            .par_iter_mut()
            .map(|e| e.merge_terms().num_removed())
            .sum()
    }

    /// Candidate sub-products across all equations. Each equation fills a
    /// local set; the sets are merged in equation order.
    pub fn generate_linkages(&self, max_size: usize) -> LinkageSet {
        let locals: Vec<LinkageSet> = self
            .equations
            .par_iter()
            .map(|e| e.generate_linkages(max_size))
            .collect();
        let mut set = LinkageSet::new();
        for local in &locals {
            set.union(local);
        }
        set
    }

    pub(crate) fn ensure_declaration_equations(&mut self) {
        self.container_mut(TMPS);
        self.container_mut(SCALARS);
    }

    fn container_mut(&mut self, name: &str) -> &mut Equation {
        let pos = match self.equations.iter().position(|e| e.name() == name) {
            Some(pos) => pos,
            None => {
                self.equations.push(Equation::declarations(name));
                self.equations.len() - 1
            }
        };
        &mut self.equations[pos]
    }

    /// Promote `candidate` under the next id of its class, substitute it
    /// everywhere and record its declaration.
    ///
    /// Returns `None` and leaves the system untouched when no term accepts
    /// the candidate; the id is only consumed by a declaration.
    pub(crate) fn commit(&mut self, candidate: &Linkage, allow_equality: bool) -> Option<(Linkage, Substitutions)> {
        let scalar = candidate.is_scalar();
        let temp = candidate.with_id(self.counts.next(scalar));
        let tally = self
            .equations
            .par_iter_mut()
            .map(|e| e.substitute(&temp, allow_equality))
            .reduce(Substitutions::default, |mut a, b| {
                a += b;
                a
            });
        if tally.sites == 0 {
            debug!("{} has no accepted occurrence; not declared", temp.name());
            return None;
        }
        self.counts.bump(scalar);

        let declaration = self.factor_declaration(&temp);
        info!("{declaration}  [{} sites]", tally.sites);
        let container = if scalar { SCALARS } else { TMPS };
        self.container_mut(container).push_declaration(declaration);
        Some((temp, tally))
    }

    /// Build the declaration of `temp`, moving a shared coefficient and any
    /// shared permutation operators of the referencing terms into it.
    fn factor_declaration(&mut self, temp: &Linkage) -> Term {
        let mut declaration = Term::declaration(temp);
        let Some(id) = temp.id() else {
            return declaration;
        };
        let scalar = temp.is_scalar();

        let mut refs: Vec<(usize, usize)> = Vec::new();
        for (e, equation) in self.equations.iter().enumerate() {
            if equation.is_temp_equation() {
                continue;
            }
            for (t, term) in equation.terms().iter().enumerate() {
                match term.contains_temp(id, scalar) {
                    0 => {}
                    1 => refs.push((e, t)),
                    _ => return declaration,
                }
            }
        }
        if refs.is_empty() {
            return declaration;
        }

        let common = common_coefficient(refs.iter().map(|&(e, t)| self.equations[e].terms()[t].coefficient()));
        if (common - 1.0).abs() > ZERO_TOLERANCE {
            for &(e, t) in &refs {
                let term = &mut self.equations[e].terms_mut()[t];
                term.set_value(term.value() / common);
            }
            declaration.set_value(common);
        }

        let movable: Vec<Vec<(Permutation, Permutation)>> = refs
            .iter()
            .map(|&(e, t)| movable_permutations(&self.equations[e].terms()[t], temp))
            .collect();
        let mut shared: Vec<Permutation> = movable[0].iter().map(|(_, m)| m.clone()).collect();
        for list in &movable[1..] {
            shared.retain(|p| list.iter().any(|(_, m)| m.matches(p)));
        }
        if shared.is_empty() {
            return declaration;
        }

        for (&(e, t), list) in refs.iter().zip(&movable) {
            let term = &mut self.equations[e].terms_mut()[t];
            let kept: Vec<Permutation> = term
                .permutations()
                .iter()
                .filter(|p| {
                    !list
                        .iter()
                        .any(|(orig, m)| orig == *p && shared.iter().any(|s| s.matches(m)))
                })
                .cloned()
                .collect();
            term.set_permutations(kept);
        }
        declaration.set_permutations(shared);
        declaration
    }
}

/// Most frequent rounded reciprocal among `coefficients`, as a coefficient.
/// Only reciprocals occurring more than once count; otherwise 1.
pub(crate) fn common_coefficient(coefficients: impl IntoIterator<Item = f64>) -> f64 {
    let mut counts: BTreeMap<u64, usize> = BTreeMap::new();
    for c in coefficients {
        if c <= ZERO_TOLERANCE {
            continue;
        }
        let reciprocal = (1.0 / c).round();
        if reciprocal >= 1.0 {
            *counts.entry(reciprocal as u64).or_insert(0) += 1;
        }
    }
    let mut best = (1u64, 1usize);
    for (reciprocal, n) in counts {
        if n > best.1 {
            best = (reciprocal, n);
        }
    }
    1.0 / best.0 as f64
}

/// Permutation pairs of `term` that act only on the lines of its single
/// occurrence of `temp`, each paired with its image on the declaration's
/// lines.
fn movable_permutations(term: &Term, temp: &Linkage) -> Vec<(Permutation, Permutation)> {
    let Some(id) = temp.id() else {
        return Vec::new();
    };
    let Some(local) = term.rhs().iter().find(|v| v.is_temp(id, temp.is_scalar())) else {
        return Vec::new();
    };
    if temp.shape() > term.lhs().shape() {
        return Vec::new();
    }
    let lhs: HashSet<&str> = term.lhs().lines().iter().map(|l| l.label.as_str()).collect();
    let position = |label: &str| local.lines().iter().position(|l| l.label == label);

    let perms = term.permutations();
    perms
        .iter()
        .enumerate()
        .filter_map(|(k, p)| {
            let (a, b) = (p.first.label.as_str(), p.second.label.as_str());
            if !lhs.contains(a) || !lhs.contains(b) {
                return None;
            }
            let overlaps = perms
                .iter()
                .enumerate()
                .any(|(q, other)| q != k && (other.involves(a) || other.involves(b)));
            if overlaps {
                return None;
            }
            let i = position(a)?;
            let j = position(b)?;
            let mapped = Permutation {
                first: temp.lines()[i].clone(),
                second: temp.lines()[j].clone(),
                symmetric: p.symmetric,
            };
            Some((p.clone(), mapped))
        })
        .collect()
}

impl fmt::Display for EquationSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for equation in &self.equations {
            if equation.is_empty() {
                continue;
            }
            writeln!(f, "{}:", equation.name())?;
            write!(f, "{equation}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::Line;
    use crate::linkage::compose;

    fn v2(name: &str, a: &str, b: &str) -> Vertex {
        Vertex::amplitude(name, vec![Line::vir(a)], vec![Line::vir(b)])
    }

    #[test]
    fn test_add_equation_rejects_reserved_and_duplicates() {
        let mut system = EquationSystem::new();
        let lhs = v2("r", "a", "b");
        let term = Term::new(lhs.clone(), 1.0, vec![v2("x", "a", "b")]);
        assert!(system.add_equation("r", lhs.clone(), vec![term.clone()]).is_ok());
        assert!(matches!(
            system.add_equation("r", lhs.clone(), vec![term.clone()]),
            Err(CseError::DuplicateEquation(_))
        ));
        assert!(matches!(
            system.add_equation(TMPS, lhs, vec![term]),
            Err(CseError::ReservedName(_))
        ));
        assert_eq!(system.total_terms(), 1);
    }

    #[test]
    fn test_temp_counts() {
        let mut counts = TempCounts::default();
        assert_eq!(counts.next(false), 1);
        assert_eq!(counts.bump(true), 1);
        assert_eq!(counts.bump(true), 2);
        assert_eq!(counts.get(true), 2);
        assert_eq!(counts.get(false), 0);
    }

    #[test]
    fn test_common_coefficient() {
        assert_eq!(common_coefficient([0.5, 0.5, 1.0]), 0.5);
        assert_eq!(common_coefficient([0.5, 0.25, 1.0]), 1.0);
        assert_eq!(common_coefficient([0.25, 0.25, 0.5, 0.5]), 0.5);
        assert_eq!(common_coefficient(std::iter::empty()), 1.0);
    }

    #[test]
    fn test_commit_factors_coefficient() {
        let mut system = EquationSystem::new();
        for (name, value) in [("r1", 0.5), ("r2", -0.5)] {
            let lhs = v2(name, "a", "c");
            let term = Term::new(lhs.clone(), value, vec![v2("x", "a", "b"), v2("y", "b", "c")]);
            system.add_equation(name, lhs, vec![term]).unwrap();
        }
        system.ensure_declaration_equations();

        let candidate = compose(&v2("x", "p", "q"), &v2("y", "q", "s")).unwrap();
        let (temp, tally) = system.commit(&candidate, true).unwrap();
        assert_eq!(temp.id(), Some(1));
        assert_eq!(tally.sites, 2);

        let decl = system.declaration(1, false).unwrap();
        assert_eq!(decl.value(), 0.5);
        assert_eq!(system.equation("r1").unwrap().terms()[0].value(), 1.0);
        assert_eq!(system.equation("r2").unwrap().terms()[0].value(), -1.0);
    }

    #[test]
    fn test_commit_moves_shared_permutation() {
        let mut system = EquationSystem::new();
        let lhs = Vertex::amplitude("r", vec![Line::vir("a"), Line::vir("b")], vec![Line::occ("i"), Line::occ("j")]);
        let x = Vertex::amplitude("x", vec![Line::vir("a")], vec![Line::occ("i"), Line::occ("k")]);
        let y = Vertex::amplitude("y", vec![Line::occ("k")], vec![Line::vir("b"), Line::occ("j")]);
        let term = Term::new(lhs.clone(), 1.0, vec![x, y])
            .with_permutation(Permutation::antisymmetric(Line::occ("i"), Line::occ("j")));
        // Canonical order of y's ket is (j, b); take the candidate from the
        // stored factors rather than the raw input.
        let candidate = term.sub_linkages(2)[0].as_ref().clone();
        system.add_equation("r", lhs, vec![term]).unwrap();
        system.ensure_declaration_equations();

        let (_, tally) = system.commit(&candidate, true).unwrap();
        assert_eq!(tally.sites, 1);
        let r = system.equation("r").unwrap();
        assert_eq!(r.terms()[0].contains_temp(1, false), 1);
        assert!(r.terms()[0].permutations().is_empty());
        let decl = system.declaration(1, false).unwrap();
        assert_eq!(decl.permutations().len(), 1);
        assert!(decl.permutations()[0].matches(&Permutation::antisymmetric(Line::occ("i"), Line::occ("j"))));
    }

    #[test]
    fn test_commit_without_sites_declares_nothing() {
        let mut system = EquationSystem::new();
        let lhs = v2("r", "a", "c");
        let term = Term::new(lhs.clone(), 1.0, vec![v2("x", "a", "b"), v2("y", "b", "c")]);
        system.add_equation("r", lhs, vec![term]).unwrap();
        system.ensure_declaration_equations();

        let absent = compose(&v2("x", "p", "q"), &v2("z", "q", "s")).unwrap();
        assert!(system.commit(&absent, true).is_none());
        assert_eq!(system.counts().tmps, 0);
        assert!(system.equation(TMPS).unwrap().is_empty());
        assert_eq!(system.equation("r").unwrap().terms()[0].contains_temp(1, false), 0);

        let present = compose(&v2("x", "p", "q"), &v2("y", "q", "s")).unwrap();
        let (temp, _) = system.commit(&present, true).unwrap();
        assert_eq!(temp.id(), Some(1));
        assert_eq!(system.equation(TMPS).unwrap().terms().len(), 1);
    }

    #[test]
    fn test_display_skips_empty_containers() {
        let mut system = EquationSystem::new();
        let lhs = v2("r", "a", "b");
        system
            .add_equation("r", lhs.clone(), vec![Term::new(lhs, 1.0, vec![v2("x", "a", "b")])])
            .unwrap();
        system.ensure_declaration_equations();
        assert_eq!(system.to_string(), "r:\nr(a,b) += +1.000000 x(a,b)\n");
    }
}
