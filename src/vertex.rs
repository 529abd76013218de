//! Tensor operands.

use crate::line::{join_labels, rename_lines, Line, Shape};
use crate::linkage::Linkage;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Kind of a base tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorKind {
    /// Scalar constant with no lines.
    Constant,
    /// Antisymmetrized integral such as `v(p,q,r,s)`.
    Integral,
    /// Antisymmetric cluster amplitude such as `t2(a,b,i,j)`.
    Amplitude,
    /// Kronecker delta with exactly two lines.
    Delta,
}

impl TensorKind {
    /// Swapping two same-block lines flips the sign.
    pub fn is_antisymmetric(self) -> bool {
        matches!(self, TensorKind::Integral | TensorKind::Amplitude)
    }
}

/// Ordered operand category used for factor sorting and term comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Symbol {
    Constant,
    Integral,
    Amplitude,
    Delta,
    Scalar,
    Temporary,
    Contraction,
}

impl Symbol {
    pub(crate) fn tag(self) -> &'static str {
        match self {
            Symbol::Constant => "c",
            Symbol::Integral => "g",
            Symbol::Amplitude => "t",
            Symbol::Delta => "d",
            Symbol::Scalar => "s",
            Symbol::Temporary => "x",
            Symbol::Contraction => "l",
        }
    }
}

/// A named base tensor with a bra block followed by a ket block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tensor {
    kind: TensorKind,
    name: String,
    lines: Vec<Line>,
    n_bra: usize,
}

impl Tensor {
    pub fn new(kind: TensorKind, name: impl Into<String>, bra: Vec<Line>, ket: Vec<Line>) -> Self {
        let n_bra = bra.len();
        let lines = bra
            .into_iter()
            .map(|l| l.with_bra(true))
            .chain(ket.into_iter().map(|l| l.with_bra(false)))
            .collect();
        Self {
            kind,
            name: name.into(),
            lines,
            n_bra,
        }
    }

    pub fn kind(&self) -> TensorKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    pub fn bra(&self) -> &[Line] {
        &self.lines[..self.n_bra]
    }

    pub fn ket(&self) -> &[Line] {
        &self.lines[self.n_bra..]
    }

    pub fn n_bra(&self) -> usize {
        self.n_bra
    }

    /// Lines with each block of an antisymmetric tensor sorted into
    /// canonical order, plus the number of transpositions that took.
    pub fn canonical_lines(&self) -> (Vec<Line>, usize) {
        let mut lines = self.lines.clone();
        if !self.kind.is_antisymmetric() {
            return (lines, 0);
        }
        let (bra, ket) = lines.split_at_mut(self.n_bra);
        let swaps = sort_block(bra) + sort_block(ket);
        (lines, swaps)
    }

    fn renamed(&self, from: &str, to: &str) -> Self {
        Self {
            lines: rename_lines(&self.lines, from, to),
            ..self.clone()
        }
    }
}

/// Insertion sort counting adjacent transpositions.
fn sort_block(block: &mut [Line]) -> usize {
    let mut swaps = 0;
    for i in 1..block.len() {
        let mut j = i;
        while j > 0 && block[j - 1].canonical_cmp(&block[j]).is_gt() {
            block.swap(j - 1, j);
            swaps += 1;
            j -= 1;
        }
    }
    swaps
}

/// An operand of a contraction: either a base tensor or a contraction tree.
///
/// Both variants are reference counted; cloning a vertex never copies the
/// tree beneath it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Vertex {
    Tensor(Arc<Tensor>),
    Linkage(Arc<Linkage>),
}

impl Vertex {
    pub fn tensor(kind: TensorKind, name: impl Into<String>, bra: Vec<Line>, ket: Vec<Line>) -> Self {
        Vertex::Tensor(Arc::new(Tensor::new(kind, name, bra, ket)))
    }

    pub fn amplitude(name: impl Into<String>, bra: Vec<Line>, ket: Vec<Line>) -> Self {
        Self::tensor(TensorKind::Amplitude, name, bra, ket)
    }

    pub fn integral(name: impl Into<String>, bra: Vec<Line>, ket: Vec<Line>) -> Self {
        Self::tensor(TensorKind::Integral, name, bra, ket)
    }

    pub fn delta(first: Line, second: Line) -> Self {
        Self::tensor(TensorKind::Delta, "d", vec![first], vec![second])
    }

    pub fn constant(name: impl Into<String>) -> Self {
        Self::tensor(TensorKind::Constant, name, Vec::new(), Vec::new())
    }

    pub fn lines(&self) -> &[Line] {
        match self {
            Vertex::Tensor(t) => t.lines(),
            Vertex::Linkage(l) => l.lines(),
        }
    }

    pub fn rank(&self) -> usize {
        self.lines().len()
    }

    pub fn shape(&self) -> Shape {
        Shape::of(self.lines())
    }

    /// Size of the bra block; promoted temporaries have none.
    pub fn n_bra(&self) -> usize {
        match self {
            Vertex::Tensor(t) => t.n_bra(),
            Vertex::Linkage(_) => 0,
        }
    }

    pub fn name(&self) -> Cow<'_, str> {
        match self {
            Vertex::Tensor(t) => Cow::Borrowed(t.name()),
            Vertex::Linkage(l) => Cow::Owned(l.name()),
        }
    }

    pub fn symbol(&self) -> Symbol {
        match self {
            Vertex::Tensor(t) => match t.kind() {
                TensorKind::Constant => Symbol::Constant,
                TensorKind::Integral => Symbol::Integral,
                TensorKind::Amplitude => Symbol::Amplitude,
                TensorKind::Delta => Symbol::Delta,
            },
            Vertex::Linkage(l) => match (l.id(), l.is_scalar()) {
                (Some(_), true) => Symbol::Scalar,
                (Some(_), false) => Symbol::Temporary,
                (None, _) => Symbol::Contraction,
            },
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Vertex::Tensor(t) => Some(t),
            Vertex::Linkage(_) => None,
        }
    }

    pub fn as_linkage(&self) -> Option<&Arc<Linkage>> {
        match self {
            Vertex::Tensor(_) => None,
            Vertex::Linkage(l) => Some(l),
        }
    }

    /// Promoted temporary or scalar.
    pub fn is_promoted(&self) -> bool {
        matches!(self, Vertex::Linkage(l) if l.id().is_some())
    }

    /// Whether this is the promoted intermediate `id` of the given class.
    pub fn is_temp(&self, id: usize, scalar: bool) -> bool {
        matches!(self, Vertex::Linkage(l) if l.id() == Some(id) && l.is_scalar() == scalar)
    }

    /// Number of leaves; promoted intermediates count as one.
    pub fn leaf_count(&self) -> usize {
        match self {
            Vertex::Linkage(l) if l.id().is_none() => l.leaf_count(),
            _ => 1,
        }
    }

    /// Lines in canonical order and the transpositions needed to get there.
    pub fn canonical_lines(&self) -> (Cow<'_, [Line]>, usize) {
        match self {
            Vertex::Tensor(t) => {
                let (lines, swaps) = t.canonical_lines();
                (Cow::Owned(lines), swaps)
            }
            Vertex::Linkage(l) => (Cow::Borrowed(l.lines()), 0),
        }
    }

    /// Vertex in canonical line order, with the parity of the reordering.
    pub(crate) fn canonicalized(&self) -> (Vertex, usize) {
        match self {
            Vertex::Tensor(t) if t.kind().is_antisymmetric() => {
                let (lines, swaps) = t.canonical_lines();
                if swaps == 0 {
                    return (self.clone(), 0);
                }
                let tensor = Tensor {
                    lines,
                    ..t.as_ref().clone()
                };
                (Vertex::Tensor(Arc::new(tensor)), swaps)
            }
            _ => (self.clone(), 0),
        }
    }

    /// Same tensor with its lines replaced; blocks keep their sizes.
    /// Linkages are returned unchanged.
    pub(crate) fn with_lines(&self, lines: Vec<Line>) -> Vertex {
        match self {
            Vertex::Tensor(t) if t.lines.len() == lines.len() => {
                let tensor = Tensor {
                    lines,
                    ..t.as_ref().clone()
                };
                Vertex::Tensor(Arc::new(tensor))
            }
            _ => self.clone(),
        }
    }

    /// Copy with every line labelled `from` relabelled `to`.
    pub fn renamed(&self, from: &str, to: &str) -> Vertex {
        if !self.lines().iter().any(|l| l.label == from) {
            return self.clone();
        }
        match self {
            Vertex::Tensor(t) => Vertex::Tensor(Arc::new(t.renamed(from, to))),
            Vertex::Linkage(l) => Vertex::Linkage(Arc::new(l.renamed(from, to))),
        }
    }

    pub(crate) fn sort_key(&self) -> (Symbol, Cow<'_, str>, usize) {
        (self.symbol(), self.name(), self.rank())
    }
}

impl fmt::Display for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vertex::Linkage(l) if l.id().is_none() => write!(f, "{l}"),
            _ if self.rank() == 0 => f.write_str(&self.name()),
            _ => write!(f, "{}({})", self.name(), join_labels(self.lines())),
        }
    }
}
