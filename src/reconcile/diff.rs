use std::collections::BTreeSet;

use crate::models::Api;

/// Changes needed to move a recorded API set to a desired one.
///
/// Both sides are sets keyed by (name, version), so ordering and duplicates in the
/// caller's submission cannot produce spurious differences. Iteration order of
/// `added` and `removed` is the sorted order of the set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiDiff {
    pub added: BTreeSet<Api>,
    pub removed: BTreeSet<Api>,
}

impl ApiDiff {
    pub fn between(existing: &BTreeSet<Api>, desired: &BTreeSet<Api>) -> Self {
        Self {
            added: desired.difference(existing).cloned().collect(),
            removed: existing.difference(desired).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}
