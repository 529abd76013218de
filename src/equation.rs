//! Equations: a left-hand side and a sum of terms.

use crate::consolidate::{consolidate_with_relabeling, Consolidation};
use crate::linkage::Linkage;
use crate::linkage_set::LinkageSet;
use crate::scaling::ScalingMap;
use crate::system::CseError;
use crate::term::Term;
use crate::vertex::Vertex;
use indexmap::{IndexMap, IndexSet};
use log::debug;
use std::collections::HashSet;
use std::fmt;
use std::ops::AddAssign;

/// Tally of replacements made for one intermediate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Substitutions {
    /// Occurrences replaced.
    pub sites: usize,
    /// Replacements that reduced a whole term to a single factor.
    pub assignments: usize,
}

impl Substitutions {
    /// A single replacement that only renames a whole term buys nothing.
    pub fn is_useful(&self) -> bool {
        self.sites > 1 || self.sites > self.assignments
    }
}

impl AddAssign for Substitutions {
    fn add_assign(&mut self, rhs: Self) {
        self.sites += rhs.sites;
        self.assignments += rhs.assignments;
    }
}

/// `lhs = sum of terms`.
#[derive(Debug, Clone)]
pub struct Equation {
    name: String,
    lhs: Vertex,
    terms: Vec<Term>,
    accepts_temps: bool,
}

impl Equation {
    /// An ordinary equation that the substitution search may rewrite.
    pub fn new(name: impl Into<String>, lhs: Vertex) -> Self {
        Self {
            name: name.into(),
            lhs,
            terms: Vec::new(),
            accepts_temps: true,
        }
    }

    /// Container for declarations of promoted intermediates.
    pub(crate) fn declarations(name: &str) -> Self {
        Self {
            name: name.to_string(),
            lhs: Vertex::constant(name),
            terms: Vec::new(),
            accepts_temps: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lhs(&self) -> &Vertex {
        &self.lhs
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Declaration containers (`tmps`, `scalars`) are never rewritten.
    pub fn is_temp_equation(&self) -> bool {
        !self.accepts_temps
    }

    /// Append a term after checking that its lines are consistent with the
    /// lhs: every factor label occurs once and is external, or twice and is
    /// summed over; every lhs label appears among the factors; permutation
    /// pairs exchange external labels.
    pub fn add_term(&mut self, mut term: Term) -> Result<(), CseError> {
        term.set_lhs(self.lhs.clone());
        self.validate(&term)?;
        self.terms.push(term);
        Ok(())
    }

    pub(crate) fn push_declaration(&mut self, term: Term) {
        self.terms.push(term);
    }

    pub(crate) fn terms_mut(&mut self) -> &mut [Term] {
        &mut self.terms
    }

    fn validate(&self, term: &Term) -> Result<(), CseError> {
        let lhs: HashSet<&str> = self.lhs.lines().iter().map(|l| l.label.as_str()).collect();
        let mut counts: IndexMap<&str, usize> = IndexMap::new();
        for line in term.rhs().iter().flat_map(|v| v.lines()) {
            *counts.entry(line.label.as_str()).or_insert(0) += 1;
        }

        for (&label, &count) in &counts {
            let external = lhs.contains(label);
            if count > 2 || (count == 2 && external) {
                return Err(CseError::MalformedTerm {
                    equation: self.name.clone(),
                    label: label.to_string(),
                    count: count + usize::from(external),
                });
            }
            if count == 1 && !external {
                return Err(CseError::ExternalMismatch {
                    equation: self.name.clone(),
                    label: label.to_string(),
                });
            }
        }

        if let Some(missing) = self.lhs.lines().iter().find(|l| counts.get(l.label.as_str()) != Some(&1)) {
            return Err(CseError::ExternalMismatch {
                equation: self.name.clone(),
                label: missing.label.clone(),
            });
        }

        for p in term.permutations() {
            for line in [&p.first, &p.second] {
                if !lhs.contains(line.label.as_str()) {
                    return Err(CseError::InvalidPermutation {
                        equation: self.name.clone(),
                        label: line.label.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn flop_map(&self) -> ScalingMap {
        self.terms.iter().map(Term::flop_map).sum()
    }

    pub fn mem_map(&self) -> ScalingMap {
        self.terms.iter().map(Term::mem_map).sum()
    }

    /// Candidate sub-products of up to `max_size` factors from every term.
    pub fn generate_linkages(&self, max_size: usize) -> LinkageSet {
        let mut set = LinkageSet::new();
        if self.accepts_temps {
            for term in &self.terms {
                set.extend(term.sub_linkages(max_size));
            }
        }
        set
    }

    /// Replace `temp` in every term that accepts it.
    pub fn substitute(&mut self, temp: &Linkage, allow_equality: bool) -> Substitutions {
        let mut tally = Substitutions::default();
        if !self.accepts_temps {
            return tally;
        }
        for term in &mut self.terms {
            let sites = term.substitute(temp, allow_equality);
            if sites > 0 {
                tally.sites += sites;
                if term.rhs().len() == 1 {
                    tally.assignments += 1;
                }
            }
        }
        tally
    }

    /// Flop map this equation would have after substituting `temp`,
    /// leaving the equation untouched.
    pub fn test_substitute(&self, temp: &Linkage, allow_equality: bool) -> (ScalingMap, Substitutions) {
        if !self.accepts_temps {
            return (self.flop_map(), Substitutions::default());
        }
        let mut map = ScalingMap::new();
        let mut tally = Substitutions::default();
        for term in &self.terms {
            let mut trial = term.clone();
            let sites = trial.substitute(temp, allow_equality);
            if sites > 0 {
                tally.sites += sites;
                if trial.rhs().len() == 1 {
                    tally.assignments += 1;
                }
            }
            map += trial.flop_map();
        }
        (map, tally)
    }

    /// Fold equal terms, trying every label of the equation for relabeling.
    /// Declaration containers and scalar equations are left alone.
    pub fn merge_terms(&mut self) -> Consolidation {
        if !self.accepts_temps || self.lhs.rank() == 0 {
            return Consolidation::default();
        }
        let labels: IndexSet<&str> = self
            .lhs
            .lines()
            .iter()
            .chain(self.terms.iter().flat_map(|t| t.rhs().iter().flat_map(|v| v.lines())))
            .map(|l| l.label.as_str())
            .collect();
        let labels: Vec<String> = labels.into_iter().map(str::to_string).collect();

        let report = consolidate_with_relabeling(&mut self.terms, &labels);
        if report.is_simplified() {
            debug!(
                "{}: merged {} terms ({} left)",
                self.name,
                report.num_removed(),
                self.terms.len()
            );
        }
        report
    }
}

impl fmt::Display for Equation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for term in &self.terms {
            writeln!(f, "{term}")?;
        }
        Ok(())
    }
}
