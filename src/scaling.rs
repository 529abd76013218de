//! Asymptotic cost model.
//!
//! A [`ScalingMap`] counts operations (or stored intermediates) per
//! [`Shape`] class. Maps are ranked by walking classes from the most
//! expensive down: the first class whose counts differ decides.

use crate::line::Shape;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::{Add, AddAssign};

/// Outcome of [`ScalingMap::compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    ThisBetter,
    OtherBetter,
    Same,
    /// Both maps are non-empty and share no class.
    Incomparable,
}

impl Comparison {
    /// `Incomparable` never counts as an improvement.
    pub fn is_better(self) -> bool {
        self == Comparison::ThisBetter
    }
}

/// Shape class to count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ScalingMap {
    counts: BTreeMap<Shape, u64>,
}

impl ScalingMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map holding a single entry.
    pub fn single(shape: Shape) -> Self {
        let mut map = Self::new();
        map.add_count(shape, 1);
        map
    }

    /// Add `count` entries at `shape`.
    pub fn add_count(&mut self, shape: Shape, count: u64) {
        if count > 0 {
            *self.counts.entry(shape).or_insert(0) += count;
        }
    }

    pub fn get(&self, shape: &Shape) -> u64 {
        self.counts.get(shape).copied().unwrap_or(0)
    }

    /// Sum of every count. Used for reporting only.
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Most expensive class present.
    pub fn leading(&self) -> Option<Shape> {
        self.counts.keys().next_back().copied()
    }

    /// Entries from the most expensive class down.
    pub fn iter(&self) -> impl Iterator<Item = (&Shape, &u64)> {
        self.counts.iter().rev()
    }

    /// Rank `self` against `other`; fewer operations in the highest
    /// differing class is better.
    pub fn compare(&self, other: &ScalingMap) -> Comparison {
        if !self.is_empty()
            && !other.is_empty()
            && self.counts.keys().all(|k| !other.counts.contains_key(k))
        {
            return Comparison::Incomparable;
        }

        let classes: BTreeSet<&Shape> = self.counts.keys().chain(other.counts.keys()).collect();
        for shape in classes.into_iter().rev() {
            let mine = self.get(shape);
            let theirs = other.get(shape);
            if mine < theirs {
                return Comparison::ThisBetter;
            }
            if mine > theirs {
                return Comparison::OtherBetter;
            }
        }
        Comparison::Same
    }

    /// Total order over maps: the same class walk as [`compare`](Self::compare)
    /// without the disjointness rule. Picks between contraction trees of
    /// one product.
    pub fn cost_cmp(&self, other: &ScalingMap) -> Ordering {
        let classes: BTreeSet<&Shape> = self.counts.keys().chain(other.counts.keys()).collect();
        classes
            .into_iter()
            .rev()
            .map(|shape| self.get(shape).cmp(&other.get(shape)))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl AddAssign<&ScalingMap> for ScalingMap {
    fn add_assign(&mut self, rhs: &ScalingMap) {
        for (shape, count) in &rhs.counts {
            self.add_count(*shape, *count);
        }
    }
}

impl Add<&ScalingMap> for ScalingMap {
    type Output = ScalingMap;

    fn add(mut self, rhs: &ScalingMap) -> ScalingMap {
        self += rhs;
        self
    }
}

impl<'a> std::iter::Sum<&'a ScalingMap> for ScalingMap {
    fn sum<I: Iterator<Item = &'a ScalingMap>>(iter: I) -> Self {
        iter.fold(ScalingMap::new(), |acc, m| acc + m)
    }
}

impl fmt::Display for ScalingMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .iter()
            .map(|(shape, count)| format!("{shape}: {count}"))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

impl Serialize for ScalingMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.counts.len()))?;
        for (shape, count) in self.iter() {
            map.serialize_entry(&shape.to_string(), count)?;
        }
        map.end()
    }
}
