//! JSON serialization for equation systems.
//!
//! Writes an [`EquationSystem`], including the declarations of every
//! promoted intermediate, to a JSON document that downstream renderers and
//! code generators can consume, and reads it back.
//!
//! # Example
//!
//! ```rust
//! use tensor_cse::json::{readjson, writejson};
//! use tensor_cse::{EquationSystem, Line, Term, Vertex};
//!
//! let lhs = Vertex::amplitude("r", vec![Line::vir("a")], vec![Line::vir("c")]);
//! let x = Vertex::amplitude("x", vec![Line::vir("a")], vec![Line::vir("b")]);
//! let y = Vertex::amplitude("y", vec![Line::vir("b")], vec![Line::vir("c")]);
//! let mut system = EquationSystem::new();
//! system
//!     .add_equation("r", lhs.clone(), vec![Term::new(lhs, 0.5, vec![x, y])])
//!     .unwrap();
//!
//! // Write to file (using temp directory for cross-platform compatibility)
//! let path = std::env::temp_dir().join("tensor_cse_doc.json");
//! writejson(&path, &system).unwrap();
//!
//! // Read back
//! let loaded = readjson(&path).unwrap();
//! assert_eq!(loaded.total_terms(), 1);
//! ```

use crate::equation::Equation;
use crate::line::Line;
use crate::linkage::compose;
use crate::system::{EquationSystem, TempCounts};
use crate::term::{Permutation, Term};
use crate::vertex::{TensorKind, Vertex};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Error type for JSON operations.
#[derive(Debug, thiserror::Error)]
pub enum JsonError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON parsing error.
    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),
    /// Well-formed JSON describing an invalid system.
    #[error("malformed system: {0}")]
    Malformed(String),
}

/// JSON format for a whole system.
///
/// Format:
/// ```json
/// {
///   "counts": { "tmps": 1, "scalars": 0 },
///   "equations": [
///     { "name": "r", "lhs": { ... }, "is-temp-equation": false, "terms": [ ... ] }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SystemJson {
    #[serde(default)]
    counts: TempCounts,
    equations: Vec<EquationJson>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct EquationJson {
    name: String,
    lhs: VertexJson,
    #[serde(default)]
    is_temp_equation: bool,
    terms: Vec<TermJson>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct TermJson {
    /// Signed prefactor
    value: f64,
    /// Declared intermediate, for declaration terms only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    defines: Option<VertexJson>,
    rhs: Vec<VertexJson>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    permutations: Vec<Permutation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    comments: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    zero_point: bool,
}

/// Operand node: a base tensor or a binary contraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VertexJson {
    /// A named base tensor.
    Tensor {
        kind: TensorKind,
        name: String,
        bra: Vec<Line>,
        ket: Vec<Line>,
    },
    /// A contraction of exactly two operands; `id` is set once promoted.
    Linkage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<usize>,
        args: Vec<VertexJson>,
    },
}

// ============================================================================
// Conversion implementations
// ============================================================================

impl From<&Vertex> for VertexJson {
    fn from(vertex: &Vertex) -> Self {
        match vertex {
            Vertex::Tensor(t) => VertexJson::Tensor {
                kind: t.kind(),
                name: t.name().to_string(),
                bra: t.bra().to_vec(),
                ket: t.ket().to_vec(),
            },
            Vertex::Linkage(l) => VertexJson::Linkage {
                id: l.id(),
                args: vec![l.left().into(), l.right().into()],
            },
        }
    }
}

impl VertexJson {
    /// Rebuild the operand, recomposing contractions.
    pub fn to_vertex(&self) -> Result<Vertex, JsonError> {
        match self {
            VertexJson::Tensor { kind, name, bra, ket } => {
                Ok(Vertex::tensor(*kind, name.clone(), bra.clone(), ket.clone()))
            }
            VertexJson::Linkage { id, args } => {
                let [left, right] = args.as_slice() else {
                    return Err(JsonError::Malformed(format!(
                        "contraction needs two operands, found {}",
                        args.len()
                    )));
                };
                let left = left.to_vertex()?;
                let right = right.to_vertex()?;
                let linkage = compose(&left, &right).ok_or_else(|| {
                    JsonError::Malformed(format!("contracting {left} with {right} repeats a label"))
                })?;
                let linkage = match id {
                    Some(id) => linkage.with_id(*id),
                    None => linkage,
                };
                Ok(Vertex::Linkage(Arc::new(linkage)))
            }
        }
    }
}

impl From<&Term> for TermJson {
    fn from(term: &Term) -> Self {
        TermJson {
            value: term.value(),
            defines: term.is_declaration().then(|| term.lhs().into()),
            rhs: term.rhs().iter().map(VertexJson::from).collect(),
            permutations: term.permutations().to_vec(),
            comments: term.comments().to_vec(),
            zero_point: term.zero_point(),
        }
    }
}

impl TermJson {
    fn to_term(&self, lhs: &Vertex) -> Result<Term, JsonError> {
        let mut term = match &self.defines {
            Some(defined) => {
                let defined = defined.to_vertex()?;
                let temp = defined
                    .as_linkage()
                    .filter(|l| l.id().is_some())
                    .ok_or_else(|| JsonError::Malformed(format!("`{defined}` is not a promoted intermediate")))?;
                let mut term = Term::declaration(temp);
                term.set_value(self.value);
                term
            }
            None => {
                let rhs = self
                    .rhs
                    .iter()
                    .map(VertexJson::to_vertex)
                    .collect::<Result<Vec<_>, _>>()?;
                Term::new(lhs.clone(), self.value, rhs)
            }
        };
        term.set_permutations(self.permutations.clone());
        term.set_comments(self.comments.clone());
        Ok(term.with_zero_point(self.zero_point))
    }
}

impl From<&EquationSystem> for SystemJson {
    fn from(system: &EquationSystem) -> Self {
        SystemJson {
            counts: system.counts(),
            equations: system
                .equations()
                .iter()
                .map(|e| EquationJson {
                    name: e.name().to_string(),
                    lhs: e.lhs().into(),
                    is_temp_equation: e.is_temp_equation(),
                    terms: e.terms().iter().map(TermJson::from).collect(),
                })
                .collect(),
        }
    }
}

fn json_to_system(json: SystemJson) -> Result<EquationSystem, JsonError> {
    let mut equations = Vec::with_capacity(json.equations.len());
    for eq in &json.equations {
        let lhs = eq.lhs.to_vertex()?;
        let mut equation = if eq.is_temp_equation {
            Equation::declarations(&eq.name)
        } else {
            Equation::new(eq.name.clone(), lhs.clone())
        };
        for term in &eq.terms {
            let term = term.to_term(&lhs)?;
            if eq.is_temp_equation {
                equation.push_declaration(term);
            } else {
                equation
                    .add_term(term)
                    .map_err(|e| JsonError::Malformed(e.to_string()))?;
            }
        }
        equations.push(equation);
    }
    Ok(EquationSystem::from_parts(equations, json.counts))
}

/// Write a system to a JSON file.
pub fn writejson<P: AsRef<Path>>(path: P, system: &EquationSystem) -> Result<(), JsonError> {
    let json_str = to_json_string(system)?;
    std::fs::write(path, json_str)?;
    Ok(())
}

/// Write a system to a JSON string.
pub fn to_json_string(system: &EquationSystem) -> Result<String, JsonError> {
    Ok(serde_json::to_string_pretty(&SystemJson::from(system))?)
}

/// Read a system from a JSON file.
pub fn readjson<P: AsRef<Path>>(path: P) -> Result<EquationSystem, JsonError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let json: SystemJson = serde_json::from_reader(reader)?;
    json_to_system(json)
}

/// Read a system from a JSON string.
pub fn from_json_str(s: &str) -> Result<EquationSystem, JsonError> {
    let json: SystemJson = serde_json::from_str(s)?;
    json_to_system(json)
}

// ============================================================================
// Tests
// ============================================================================
