//! Index lines and the occupied/virtual shape classes built from them.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A single tensor index.
///
/// Two lines are equal when they share label, orbital class and bra/ket
/// position. The `significant` flag is bookkeeping only and never takes part
/// in comparisons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Line {
    /// Index label, e.g. `"i"` or `"a"`.
    pub label: String,
    /// Occupied (hole) index when true, virtual (particle) index otherwise.
    pub occupied: bool,
    /// Whether the line sits in the bra block of its tensor.
    #[serde(default)]
    pub bra: bool,
    /// Marks lines that survive to an equation's left-hand side.
    #[serde(default)]
    pub significant: bool,
}

impl Line {
    /// Create a ket-side line.
    pub fn new(label: impl Into<String>, occupied: bool) -> Self {
        Self {
            label: label.into(),
            occupied,
            bra: false,
            significant: false,
        }
    }

    /// Create an occupied line.
    pub fn occ(label: impl Into<String>) -> Self {
        Self::new(label, true)
    }

    /// Create a virtual line.
    pub fn vir(label: impl Into<String>) -> Self {
        Self::new(label, false)
    }

    /// Set the bra/ket position.
    pub fn with_bra(mut self, bra: bool) -> Self {
        self.bra = bra;
        self
    }

    /// Set the significant flag.
    pub fn with_significant(mut self, significant: bool) -> Self {
        self.significant = significant;
        self
    }

    /// Copy of this line carrying a different label.
    pub fn renamed(&self, label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..self.clone()
        }
    }

    /// Same label and orbital class, regardless of position.
    pub fn same_index(&self, other: &Line) -> bool {
        self.label == other.label && self.occupied == other.occupied
    }

    /// Ordering used to canonicalize antisymmetric blocks: occupied lines
    /// first, then by label.
    pub(crate) fn canonical_cmp(&self, other: &Line) -> Ordering {
        (!self.occupied, &self.label).cmp(&(!other.occupied, &other.label))
    }
}

impl PartialEq for Line {
    fn eq(&self, other: &Self) -> bool {
        self.label == other.label && self.occupied == other.occupied && self.bra == other.bra
    }
}

impl Eq for Line {}

impl Hash for Line {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.label.hash(state);
        self.occupied.hash(state);
        self.bra.hash(state);
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Rename every line labelled `from` to `to`.
pub(crate) fn rename_lines(lines: &[Line], from: &str, to: &str) -> Vec<Line> {
    lines
        .iter()
        .map(|l| if l.label == from { l.renamed(to) } else { l.clone() })
        .collect()
}

/// Comma-separated labels, as used in every `Display` impl of the crate.
pub(crate) fn join_labels(lines: &[Line]) -> String {
    lines
        .iter()
        .map(|l| l.label.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Scaling class of a contraction: number of distinct occupied and virtual
/// indices it touches.
///
/// Classes are ordered by total index count, then by virtual count, so that
/// `o2v4 > o3v3 > o4v2 > o2v3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Shape {
    /// Number of occupied indices.
    pub occ: usize,
    /// Number of virtual indices.
    pub vir: usize,
}

impl Shape {
    pub fn new(occ: usize, vir: usize) -> Self {
        Self { occ, vir }
    }

    /// Total number of indices.
    pub fn total(&self) -> usize {
        self.occ + self.vir
    }

    /// Shape of a set of lines, counting each label once.
    pub fn of<'a, I>(lines: I) -> Self
    where
        I: IntoIterator<Item = &'a Line>,
    {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut shape = Shape::default();
        for line in lines {
            if seen.insert(line.label.as_str()) {
                if line.occupied {
                    shape.occ += 1;
                } else {
                    shape.vir += 1;
                }
            }
        }
        shape
    }
}

impl Ord for Shape {
    fn cmp(&self, other: &Self) -> Ordering {
        self.total()
            .cmp(&other.total())
            .then(self.vir.cmp(&other.vir))
            .then(self.occ.cmp(&other.occ))
    }
}

impl PartialOrd for Shape {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "o{}v{}", self.occ, self.vir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_equality_ignores_significance() {
        let a = Line::occ("i").with_significant(true);
        let b = Line::occ("i");
        assert_eq!(a, b);
        assert_ne!(a, Line::occ("i").with_bra(true));
        assert_ne!(Line::occ("i"), Line::vir("i"));
    }

    #[test]
    fn test_shape_counts_labels_once() {
        let lines = vec![Line::occ("i"), Line::vir("a"), Line::vir("a"), Line::occ("j")];
        assert_eq!(Shape::of(&lines), Shape::new(2, 1));
    }

    #[test]
    fn test_shape_ordering() {
        assert!(Shape::new(2, 4) > Shape::new(3, 3));
        assert!(Shape::new(3, 3) > Shape::new(4, 2));
        assert!(Shape::new(4, 2) > Shape::new(2, 3));
        assert_eq!(Shape::new(1, 2).to_string(), "o1v2");
    }

    #[test]
    fn test_canonical_order_puts_occupied_first() {
        let i = Line::occ("i");
        let a = Line::vir("a");
        assert_eq!(i.canonical_cmp(&a), Ordering::Less);
        assert_eq!(Line::occ("j").canonical_cmp(&i), Ordering::Greater);
    }

    #[test]
    fn test_rename_lines() {
        let lines = vec![Line::occ("i"), Line::vir("a")];
        let renamed = rename_lines(&lines, "i", "k");
        assert_eq!(join_labels(&renamed), "k,a");
        assert!(renamed[0].occupied);
    }
}
