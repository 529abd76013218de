//! Intermediate extraction on a CCSD-like equation system.
//!
//! Run with: cargo run --release --example benchmark
//!
//! Set RUST_LOG=info to follow each committed intermediate.

use std::fs;
use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use tensor_cse::json::writejson;
use tensor_cse::{CseOptimizer, EquationSystem, Line, OptimizeSummary, Term, Vertex};

#[derive(Debug, Serialize)]
struct RunResult {
    threads: i32,
    wall_ms: f64,
    summary: OptimizeSummary,
}

fn o(label: &str) -> Line {
    Line::occ(label)
}

fn v(label: &str) -> Line {
    Line::vir(label)
}

fn f(p: Line, q: Line) -> Vertex {
    Vertex::integral("f", vec![p], vec![q])
}

fn g(p: Line, q: Line, r: Line, s: Line) -> Vertex {
    Vertex::integral("v", vec![p, q], vec![r, s])
}

fn t1(a: &str, i: &str) -> Vertex {
    Vertex::amplitude("t1", vec![v(a)], vec![o(i)])
}

fn t2(a: &str, b: &str, i: &str, j: &str) -> Vertex {
    Vertex::amplitude("t2", vec![v(a), v(b)], vec![o(i), o(j)])
}

/// Energy, singles and doubles residuals with the usual CCSD term shapes.
fn build_system() -> Result<EquationSystem, Box<dyn std::error::Error>> {
    let energy = Vertex::constant("E");
    let r1 = Vertex::amplitude("r1", vec![v("a")], vec![o("i")]);
    let r2 = Vertex::amplitude("r2", vec![v("a"), v("b")], vec![o("i"), o("j")]);
    let fov = || f(o("m"), v("e"));
    let oovv = || g(o("m"), o("n"), v("e"), v("f"));

    let e_terms = vec![
        Term::new(energy.clone(), 1.0, vec![fov(), t1("e", "m")]),
        Term::new(energy.clone(), 0.25, vec![oovv(), t2("e", "f", "m", "n")]),
        Term::new(energy.clone(), 0.5, vec![oovv(), t1("e", "m"), t1("f", "n")]),
    ];

    let r1_terms = vec![
        Term::new(r1.clone(), 1.0, vec![f(v("a"), o("i"))]),
        Term::new(r1.clone(), 1.0, vec![f(v("a"), v("e")), t1("e", "i")]),
        Term::new(r1.clone(), -1.0, vec![f(o("m"), o("i")), t1("a", "m")]),
        Term::new(r1.clone(), 1.0, vec![fov(), t2("a", "e", "i", "m")]),
        Term::new(r1.clone(), -1.0, vec![fov(), t1("e", "i"), t1("a", "m")]),
        Term::new(r1.clone(), 1.0, vec![fov(), t1("e", "m"), t1("a", "i")]),
        Term::new(r1.clone(), -1.0, vec![g(o("m"), v("a"), o("i"), v("e")), t1("e", "m")]),
        Term::new(r1.clone(), -0.5, vec![g(o("m"), o("n"), o("i"), v("e")), t2("a", "e", "m", "n")]),
        Term::new(r1.clone(), -0.5, vec![g(o("m"), v("a"), v("e"), v("f")), t2("e", "f", "i", "m")]),
        Term::new(r1.clone(), -0.5, vec![oovv(), t1("e", "i"), t2("a", "f", "m", "n")]),
        Term::new(r1.clone(), -0.5, vec![oovv(), t1("a", "m"), t2("e", "f", "i", "n")]),
        Term::new(r1.clone(), 1.0, vec![oovv(), t1("e", "m"), t2("a", "f", "i", "n")]),
    ];

    let r2_terms = vec![
        Term::new(r2.clone(), 1.0, vec![g(v("a"), v("b"), o("i"), o("j"))]),
        Term::new(r2.clone(), 1.0, vec![fov(), t1("e", "m"), t2("a", "b", "i", "j")]),
        Term::new(r2.clone(), -1.0, vec![f(o("m"), o("j")), t2("a", "b", "i", "m")]),
        Term::new(r2.clone(), 1.0, vec![f(o("m"), o("i")), t2("a", "b", "j", "m")]),
        Term::new(r2.clone(), 1.0, vec![f(v("b"), v("e")), t2("a", "e", "i", "j")]),
        Term::new(r2.clone(), -1.0, vec![f(v("a"), v("e")), t2("b", "e", "i", "j")]),
        Term::new(r2.clone(), -1.0, vec![fov(), t1("e", "i"), t2("a", "b", "m", "j")]),
        Term::new(r2.clone(), 0.5, vec![g(v("a"), v("b"), v("e"), v("f")), t2("e", "f", "i", "j")]),
        Term::new(r2.clone(), 0.5, vec![g(o("m"), o("n"), o("i"), o("j")), t2("a", "b", "m", "n")]),
        Term::new(r2.clone(), 0.25, vec![oovv(), t2("e", "f", "i", "j"), t2("a", "b", "m", "n")]),
        Term::new(r2.clone(), -0.5, vec![oovv(), t2("a", "e", "i", "j"), t2("b", "f", "m", "n")]),
        Term::new(r2.clone(), 0.5, vec![oovv(), t2("b", "e", "i", "j"), t2("a", "f", "m", "n")]),
        Term::new(r2.clone(), -0.5, vec![oovv(), t2("a", "b", "i", "m"), t2("e", "f", "j", "n")]),
        Term::new(r2.clone(), 0.5, vec![oovv(), t2("a", "b", "j", "m"), t2("e", "f", "i", "n")]),
        Term::new(r2.clone(), 1.0, vec![oovv(), t2("a", "e", "i", "m"), t2("b", "f", "j", "n")]),
        Term::new(r2.clone(), 1.0, vec![oovv(), t1("e", "i"), t1("f", "j"), t2("a", "b", "m", "n")]),
    ];

    let mut system = EquationSystem::new();
    system.add_equation("E", energy, e_terms)?;
    system.add_equation("r1", r1, r1_terms)?;
    system.add_equation("r2", r2, r2_terms)?;
    Ok(system)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!();
    println!("{}", "=".repeat(70));
    println!("CCSD-like intermediate extraction");
    println!("{}", "=".repeat(70));
    println!();

    let results_dir = Path::new("benchmarks/results");
    fs::create_dir_all(results_dir)?;

    let mut results = Vec::new();
    let mut optimized = None;
    for threads in [1, 2, 4] {
        let mut system = build_system()?;
        let config = CseOptimizer::new(threads, usize::MAX);
        let start = Instant::now();
        let summary = system.optimize(&config)?;
        let wall_ms = start.elapsed().as_secs_f64() * 1000.0;

        println!("threads = {threads}:");
        println!("  Terms:         {}", summary.total_terms);
        println!("  Flops before:  {}", summary.flops_before);
        println!("  Flops after:   {}", summary.flops_after);
        println!("  Temporaries:   {}", summary.num_temps);
        println!("  Scalars:       {}", summary.num_scalars);
        println!("  Merged terms:  {}", summary.terms_merged);
        println!("  Stop reason:   {:?}", summary.stop_reason);
        println!("  Time:          {wall_ms:.2} ms");
        println!();

        results.push(RunResult {
            threads,
            wall_ms,
            summary,
        });
        optimized = Some(system);
    }

    // ========== Save Results ==========
    let output_path = results_dir.join("cse_results.json");
    fs::write(&output_path, serde_json::to_string_pretty(&results)?)?;

    println!("Results saved to:");
    println!("  {}", output_path.display());

    if let Some(system) = optimized {
        let system_path = results_dir.join("ccsd_system.json");
        writejson(&system_path, &system)?;
        println!("  {}", system_path.display());
        println!();
        println!("{system}");
    }

    Ok(())
}
