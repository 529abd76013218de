//! Signature-keyed collection of candidate contractions.

use crate::linkage::Linkage;
use indexmap::IndexMap;
use std::ops::SubAssign;
use std::sync::Arc;

/// Linkages deduplicated by structural signature.
///
/// Iteration follows discovery order, which is also the tie-break order of
/// the substitution search.
#[derive(Debug, Clone, Default)]
pub struct LinkageSet {
    items: IndexMap<String, Arc<Linkage>>,
}

impl LinkageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless an element with the same signature is present.
    /// Returns whether the set grew.
    pub fn insert(&mut self, linkage: Arc<Linkage>) -> bool {
        if self.items.contains_key(linkage.signature()) {
            return false;
        }
        self.items.insert(linkage.signature().to_string(), linkage);
        true
    }

    pub fn contains(&self, linkage: &Linkage) -> bool {
        self.items.contains_key(linkage.signature())
    }

    pub fn union(&mut self, other: &LinkageSet) {
        for linkage in other.iter() {
            self.insert(Arc::clone(linkage));
        }
    }

    /// Remove every element whose signature appears in `other`.
    pub fn difference(&mut self, other: &LinkageSet) {
        self.items.retain(|key, _| !other.items.contains_key(key));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Linkage>> {
        self.items.values()
    }
}

impl SubAssign<&LinkageSet> for LinkageSet {
    fn sub_assign(&mut self, rhs: &LinkageSet) {
        self.difference(rhs);
    }
}

impl Extend<Arc<Linkage>> for LinkageSet {
    fn extend<I: IntoIterator<Item = Arc<Linkage>>>(&mut self, iter: I) {
        for linkage in iter {
            self.insert(linkage);
        }
    }
}

impl FromIterator<Arc<Linkage>> for LinkageSet {
    fn from_iter<I: IntoIterator<Item = Arc<Linkage>>>(iter: I) -> Self {
        let mut set = LinkageSet::new();
        set.extend(iter);
        set
    }
}
