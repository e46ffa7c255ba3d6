use std::collections::BTreeSet;

/// Players that appeared and disappeared between two consecutive polls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceDiff {
    pub joined: BTreeSet<String>,
    pub left: BTreeSet<String>,
}

impl PresenceDiff {
    pub fn between(old: &BTreeSet<String>, new: &BTreeSet<String>) -> Self {
        Self {
            joined: new.difference(old).cloned().collect(),
            left: old.difference(new).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}
