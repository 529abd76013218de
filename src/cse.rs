//! Cost-driven common-subexpression elimination.
//!
//! The search is greedy. Each round collects every sub-product of every
//! term as a candidate intermediate, measures in parallel what the whole
//! system would cost if that candidate were promoted, and commits the single
//! best one. Rounds repeat until no candidate helps or the temporary budget
//! is spent.
//!
//! # Example
//!
//! ```rust
//! use tensor_cse::{CseOptimizer, EquationSystem, Line, StopReason, Term, Vertex};
//!
//! let op = |name: &str, p: &str, q: &str| {
//!     Vertex::amplitude(name, vec![Line::vir(p)], vec![Line::vir(q)])
//! };
//! let mut system = EquationSystem::new();
//! for name in ["r1", "r2"] {
//!     let lhs = op(name, "a", "c");
//!     let term = Term::new(lhs.clone(), 1.0, vec![op("x", "a", "b"), op("y", "b", "c")]);
//!     system.add_equation(name, lhs, vec![term]).unwrap();
//! }
//!
//! let summary = system.optimize(&CseOptimizer::default()).unwrap();
//! assert_eq!(summary.num_temps, 1);
//! assert_eq!(summary.stop_reason, StopReason::Saturated);
//! assert!(summary.flops_after.total() < summary.flops_before.total());
//! ```

use crate::equation::Substitutions;
use crate::linkage::Linkage;
use crate::linkage_set::LinkageSet;
use crate::scaling::{Comparison, ScalingMap};
use crate::system::{CseError, EquationSystem};
use crate::term::Term;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Configuration for the substitution search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CseOptimizer {
    /// Worker threads; non-positive values mean one
    pub threads: i32,
    /// Stop once this many temporaries exist (scalars are not counted)
    pub max_temps: usize,
    /// Largest number of factors in a candidate intermediate
    pub max_linkage_size: usize,
    /// Accept candidates that leave the cost unchanged
    pub allow_equality: bool,
    /// Fold equal terms before and between rounds
    pub merge_terms: bool,
}

impl Default for CseOptimizer {
    fn default() -> Self {
        Self {
            threads: 1,
            max_temps: usize::MAX,
            max_linkage_size: 4,
            allow_equality: true,
            merge_terms: true,
        }
    }
}

impl CseOptimizer {
    pub fn new(threads: i32, max_temps: usize) -> Self {
        Self {
            threads,
            max_temps,
            ..Default::default()
        }
    }

    /// Binary candidates only.
    pub fn fast() -> Self {
        Self {
            max_linkage_size: 2,
            ..Default::default()
        }
    }

    /// Set the number of worker threads.
    pub fn with_threads(mut self, threads: i32) -> Self {
        self.threads = threads;
        self
    }

    /// Set the temporary ceiling.
    pub fn with_max_temps(mut self, max_temps: usize) -> Self {
        self.max_temps = max_temps;
        self
    }

    /// Set the largest candidate size.
    pub fn with_max_linkage_size(mut self, size: usize) -> Self {
        self.max_linkage_size = size;
        self
    }

    pub fn with_allow_equality(mut self, allow: bool) -> Self {
        self.allow_equality = allow;
        self
    }

    pub fn with_merge_terms(mut self, merge: bool) -> Self {
        self.merge_terms = merge;
        self
    }

    /// Thread count actually used.
    pub fn num_threads(&self) -> usize {
        usize::try_from(self.threads).unwrap_or(0).max(1)
    }
}

/// Why the search ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// No remaining candidate improves the system.
    Saturated,
    /// The temporary ceiling was reached.
    TempLimit,
}

/// Outcome of [`optimize`].
#[derive(Debug, Clone, Serialize)]
pub struct OptimizeSummary {
    /// Terms across all equations, declarations included
    pub total_terms: usize,
    pub flops_before: ScalingMap,
    pub flops_after: ScalingMap,
    pub mem_before: ScalingMap,
    pub mem_after: ScalingMap,
    /// Temporaries declared in the system
    pub num_temps: usize,
    /// Scalars declared in the system
    pub num_scalars: usize,
    /// Occurrences replaced by intermediates committed in this run
    pub substitutions: usize,
    /// Terms removed by merging
    pub terms_merged: usize,
    /// Search rounds
    pub iterations: usize,
    /// System flop total after each commit
    pub flop_history: Vec<u64>,
    pub stop_reason: StopReason,
    pub elapsed: Duration,
}

impl OptimizeSummary {
    pub fn ceiling_reached(&self) -> bool {
        self.stop_reason == StopReason::TempLimit
    }
}

/// Result of substituting one candidate into a private copy of the system.
enum Trial {
    Rejected,
    Accepted { temp: Linkage, flop_map: ScalingMap },
}

/// Run the substitution search on `system` inside a dedicated worker pool.
pub fn optimize(system: &mut EquationSystem, config: &CseOptimizer) -> Result<OptimizeSummary, CseError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.num_threads())
        .build()?;
    Ok(pool.install(|| run(system, config)))
}

fn run(system: &mut EquationSystem, config: &CseOptimizer) -> OptimizeSummary {
    let start = Instant::now();
    system.ensure_declaration_equations();
    let flops_before = system.flop_map();
    let mem_before = system.mem_map();
    let temps_before = system.counts();
    info!(
        "optimizing {} equations, {} terms, {} threads",
        system.equations().len(),
        system.total_terms(),
        config.num_threads()
    );

    let mut terms_merged = if config.merge_terms { system.merge_terms() } else { 0 };
    let mut ignored = LinkageSet::new();
    let mut candidates = system.generate_linkages(config.max_linkage_size);
    info!("{} candidate intermediates", candidates.len());

    let mut substitutions = 0;
    let mut iterations = 0;
    let mut flop_history = Vec::new();
    let stop_reason = loop {
        if candidates.is_empty() {
            break StopReason::Saturated;
        }
        if system.counts().tmps >= config.max_temps {
            warn!("MAX temps reached ({}); stopping early", config.max_temps);
            break StopReason::TempLimit;
        }
        iterations += 1;

        let pool: Vec<Arc<Linkage>> = candidates.iter().cloned().collect();
        let trials = evaluate(system, &pool, config.allow_equality);
        let baseline = system.flop_map();
        let mut best: Option<(ScalingMap, Linkage)> = None;
        for (candidate, trial) in pool.iter().zip(trials) {
            match trial {
                Trial::Rejected => {
                    ignored.insert(Arc::clone(candidate));
                }
                Trial::Accepted { temp, flop_map } => {
                    let wins = match &best {
                        Some((best_map, _)) => flop_map.compare(best_map).is_better(),
                        None => match flop_map.compare(&baseline) {
                            Comparison::ThisBetter => true,
                            Comparison::Same => config.allow_equality || temp.is_scalar(),
                            Comparison::OtherBetter | Comparison::Incomparable => false,
                        },
                    };
                    if wins {
                        best = Some((flop_map, temp));
                    }
                }
            }
        }
        debug!(
            "round {iterations}: {} candidates, best {}",
            pool.len(),
            best.as_ref().map_or_else(|| "none".to_string(), |(m, _)| m.to_string())
        );

        match best {
            Some((_, temp)) => {
                let allow = config.allow_equality || temp.is_scalar();
                match system.commit(&temp, allow) {
                    Some((promoted, tally)) => {
                        substitutions += tally.sites;
                        ignored.insert(Arc::new(promoted));
                        flop_history.push(system.flop_map().total());
                    }
                    None => {
                        debug!("{} found no site on commit", temp.name());
                        ignored.insert(Arc::new(temp));
                    }
                }
            }
            None => {
                debug!("no improving candidate; remaking the candidate set");
                ignored.union(&candidates);
            }
        }

        if config.merge_terms {
            terms_merged += system.merge_terms();
        }
        candidates = system.generate_linkages(config.max_linkage_size);
        candidates -= &ignored;
    };

    let counts = system.counts();
    let summary = OptimizeSummary {
        total_terms: system.total_terms(),
        flops_before,
        flops_after: system.flop_map(),
        mem_before,
        mem_after: system.mem_map(),
        num_temps: counts.tmps,
        num_scalars: counts.scalars,
        substitutions,
        terms_merged,
        iterations,
        flop_history,
        stop_reason,
        elapsed: start.elapsed(),
    };
    info!(
        "found {} temporaries and {} scalars in {:.3}s; flops {} -> {}",
        counts.tmps - temps_before.tmps,
        counts.scalars - temps_before.scalars,
        summary.elapsed.as_secs_f64(),
        summary.flops_before.total(),
        summary.flops_after.total()
    );
    summary
}

/// Substitute each candidate into the system without mutating it, one task
/// per candidate, results in candidate order.
fn evaluate(system: &EquationSystem, candidates: &[Arc<Linkage>], allow_equality: bool) -> Vec<Trial> {
    let counts = system.counts();
    candidates
        .par_iter()
        .map(|candidate| {
            let scalar = candidate.is_scalar();
            let temp = candidate.with_id(counts.next(scalar));
            let allow = allow_equality || scalar;
            let mut flop_map = ScalingMap::new();
            let mut tally = Substitutions::default();
            for equation in system.equations() {
                let (map, sites) = equation.test_substitute(&temp, allow);
                flop_map += &map;
                tally += sites;
            }
            if !tally.is_useful() {
                return Trial::Rejected;
            }
            // Charged for single sites too: the replaced work is gone from
            // the referencing term and must be counted once somewhere.
            flop_map += Term::declaration(&temp).flop_map();
            Trial::Accepted { temp, flop_map }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::{Line, Shape};
    use crate::test_utils::{max_abs_diff, NaiveEvaluator};
    use crate::vertex::Vertex;

    fn v2(name: &str, a: &str, b: &str) -> Vertex {
        Vertex::amplitude(name, vec![Line::vir(a)], vec![Line::vir(b)])
    }

    fn chain_system() -> EquationSystem {
        let mut system = EquationSystem::new();
        for (name, extra) in [("r1", "u"), ("r2", "w")] {
            let lhs = v2(name, "a", "d");
            let term = Term::new(lhs.clone(), 1.0, vec![v2("x", "a", "b"), v2("y", "b", "c"), v2(extra, "c", "d")]);
            system.add_equation(name, lhs, vec![term]).unwrap();
        }
        system
    }

    #[test]
    fn test_config_defaults_and_builders() {
        let config = CseOptimizer::default();
        assert_eq!(config.num_threads(), 1);
        assert_eq!(config.max_linkage_size, 4);
        assert!(config.allow_equality);

        let config = CseOptimizer::new(0, 3).with_max_linkage_size(3).with_merge_terms(false);
        assert_eq!(config.num_threads(), 1);
        assert_eq!(config.max_temps, 3);
        assert_eq!(CseOptimizer::new(-4, 1).num_threads(), 1);
        assert_eq!(CseOptimizer::default().with_threads(4).num_threads(), 4);
        assert_eq!(CseOptimizer::fast().max_linkage_size, 2);
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: CseOptimizer = serde_json::from_str(r#"{"threads": 2, "max_temps": 5}"#).unwrap();
        assert_eq!(config.threads, 2);
        assert_eq!(config.max_temps, 5);
        assert_eq!(config.max_linkage_size, 4);
        assert!(config.merge_terms);
    }

    #[test]
    fn test_shared_pair_is_extracted() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut system = chain_system();
        let summary = optimize(&mut system, &CseOptimizer::default()).unwrap();
        assert_eq!(summary.stop_reason, StopReason::Saturated);
        assert!(summary.num_temps >= 1);

        // x y is shared by both equations and must be the first temporary
        let decl = system.declaration(1, false).unwrap();
        let names: Vec<String> = decl.rhs().iter().map(|v| v.name().into_owned()).collect();
        assert_eq!(names, vec!["x", "y"]);
        for name in ["r1", "r2"] {
            let term = &system.equation(name).unwrap().terms()[0];
            assert_eq!(term.contains_temp(1, false), 1);
        }
        assert!(summary.flops_after.compare(&summary.flops_before).is_better());
    }

    fn ext(name: &str, bra: &str, k1: Line, k2: Line) -> Vertex {
        Vertex::amplitude(name, vec![Line::vir(bra)], vec![k1, k2])
    }

    /// r1 = x(a|i,k) y(k|j,b) and r2 = s x(a|i,h) y(h|j,b): the dummy sorts
    /// after `i` in r1 and before it in r2.
    fn relabeled_system() -> EquationSystem {
        let lhs = |name: &str| {
            Vertex::amplitude(name, vec![Line::vir("a")], vec![Line::occ("i"), Line::occ("j"), Line::vir("b")])
        };
        let product = |dummy: &str| {
            vec![
                ext("x", "a", Line::occ("i"), Line::occ(dummy)),
                Vertex::amplitude("y", vec![Line::occ(dummy)], vec![Line::occ("j"), Line::vir("b")]),
            ]
        };
        let mut system = EquationSystem::new();
        let r1 = Term::new(lhs("r1"), 1.0, product("k"));
        let mut factors = product("h");
        factors.push(Vertex::constant("s"));
        let r2 = Term::new(lhs("r2"), 0.5, factors);
        assert_eq!(r2.sign(), -1);
        system.add_equation("r1", lhs("r1"), vec![r1]).unwrap();
        system.add_equation("r2", lhs("r2"), vec![r2]).unwrap();
        system
    }

    #[test]
    fn test_relabeled_product_is_shared_across_equations() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut system = relabeled_system();
        let mut eval = NaiveEvaluator::new(11);
        let before: Vec<_> = ["r1", "r2"].iter().map(|n| eval.evaluate_equation(&system, n)).collect();

        let summary = optimize(&mut system, &CseOptimizer::default()).unwrap();
        assert_eq!(summary.num_temps, 1);
        let decl = system.declaration(1, false).unwrap();
        let names: Vec<String> = decl.rhs().iter().map(|v| v.name().into_owned()).collect();
        assert_eq!(names, vec!["x", "y"]);

        let r2 = &system.equation("r2").unwrap().terms()[0];
        assert_eq!(r2.rhs().len(), 2);
        assert_eq!(r2.contains_temp(1, false), 1);
        assert_eq!(system.equation("r1").unwrap().terms()[0].contains_temp(1, false), 1);
        assert!(summary.flops_after.compare(&summary.flops_before).is_better());

        for (name, b) in ["r1", "r2"].iter().zip(&before) {
            let a = eval.evaluate_equation(&system, name);
            assert!(max_abs_diff(b, &a) < 1e-9, "{name} changed:\n{system}");
        }
    }

    #[test]
    fn test_single_use_pays_for_its_declaration() {
        let mut system = EquationSystem::new();
        let lhs = v2("r", "a", "d");
        let term = Term::new(lhs.clone(), 1.0, vec![v2("x", "a", "b"), v2("y", "b", "c"), v2("u", "c", "d")]);
        system.add_equation("r", lhs, vec![term]).unwrap();

        // x y saves one step in r but costs one step to declare.
        let summary = optimize(&mut system, &CseOptimizer::default().with_allow_equality(false)).unwrap();
        assert_eq!(summary.num_temps, 0);
        assert_eq!(summary.flops_after, summary.flops_before);
        assert_eq!(summary.flops_before.get(&Shape::new(0, 3)), 2);
    }

    #[test]
    fn test_temp_ceiling() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut system = chain_system();
        let summary = optimize(&mut system, &CseOptimizer::default().with_max_temps(0)).unwrap();
        assert!(summary.ceiling_reached());
        assert_eq!(summary.num_temps, 0);
        assert!(system.equation("tmps").unwrap().is_empty());
        assert_eq!(summary.flops_after, summary.flops_before);
    }

    #[test]
    fn test_flop_history_is_monotone() {
        let mut system = chain_system();
        let summary = optimize(&mut system, &CseOptimizer::default().with_threads(3)).unwrap();
        let mut previous = summary.flops_before.total();
        assert!(summary.flop_history[0] < previous);
        for &total in &summary.flop_history {
            assert!(total <= previous);
            previous = total;
        }
        assert_eq!(previous, summary.flops_after.total());
    }

    #[test]
    fn test_empty_system() {
        let mut system = EquationSystem::new();
        let summary = optimize(&mut system, &CseOptimizer::default()).unwrap();
        assert_eq!(summary.stop_reason, StopReason::Saturated);
        assert_eq!(summary.iterations, 0);
        assert_eq!(summary.total_terms, 0);
    }

    #[test]
    fn test_summary_serializes() {
        let mut system = chain_system();
        let summary = optimize(&mut system, &CseOptimizer::default()).unwrap();
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["stop_reason"], "Saturated");
        assert!(json["flops_before"].is_object());
    }
}
