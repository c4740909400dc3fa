use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Bidirectional many-to-many map over two key types.
///
/// Both sides are kept in lockstep so lookup and removal work from either
/// end. Empty buckets are dropped eagerly; `lefts()`/`rights_of()` never
/// report a key with no remaining links.
#[derive(Debug)]
pub struct Relation<L, R> {
    by_left: HashMap<L, HashSet<R>>,
    by_right: HashMap<R, HashSet<L>>,
}

impl<L, R> Default for Relation<L, R> {
    fn default() -> Self {
        Self {
            by_left: HashMap::new(),
            by_right: HashMap::new(),
        }
    }
}

impl<L, R> Relation<L, R>
where
    L: Eq + Hash + Clone,
    R: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Link `left` and `right`. Returns false if the pair already existed.
    pub fn insert(&mut self, left: L, right: R) -> bool {
        let fresh = self
            .by_left
            .entry(left.clone())
            .or_default()
            .insert(right.clone());
        if fresh {
            self.by_right.entry(right).or_default().insert(left);
        }
        fresh
    }

    /// Unlink `left` from everything; returns the rights it was linked to.
    pub fn remove_left(&mut self, left: &L) -> HashSet<R> {
        let rights = self.by_left.remove(left).unwrap_or_default();
        for right in &rights {
            if let Some(lefts) = self.by_right.get_mut(right) {
                lefts.remove(left);
                if lefts.is_empty() {
                    self.by_right.remove(right);
                }
            }
        }
        rights
    }

    /// Unlink `right` from everything; returns the lefts it was linked to.
    pub fn remove_right(&mut self, right: &R) -> HashSet<L> {
        let lefts = self.by_right.remove(right).unwrap_or_default();
        for left in &lefts {
            if let Some(rights) = self.by_left.get_mut(left) {
                rights.remove(right);
                if rights.is_empty() {
                    self.by_left.remove(left);
                }
            }
        }
        lefts
    }

    pub fn rights_of(&self, left: &L) -> Option<&HashSet<R>> {
        self.by_left.get(left)
    }

    pub fn lefts_of(&self, right: &R) -> Option<&HashSet<L>> {
        self.by_right.get(right)
    }

    pub fn contains_left(&self, left: &L) -> bool {
        self.by_left.contains_key(left)
    }

    pub fn contains_right(&self, right: &R) -> bool {
        self.by_right.contains_key(right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_are_visible_from_both_sides() {
        let mut relation = Relation::new();
        assert!(relation.insert("c1", "alice"));
        assert!(relation.insert("c2", "alice"));
        assert!(relation.insert("c2", "bob"));
        assert!(!relation.insert("c1", "alice"));

        assert_eq!(relation.rights_of(&"c2").map(HashSet::len), Some(2));
        assert_eq!(relation.lefts_of(&"alice").map(HashSet::len), Some(2));
        assert!(relation.contains_right(&"bob"));
    }

    #[test]
    fn remove_left_reports_and_unlinks() {
        let mut relation = Relation::new();
        relation.insert(1u64, "a".to_string());
        relation.insert(1u64, "b".to_string());
        relation.insert(2u64, "a".to_string());

        let dropped = relation.remove_left(&1);
        assert_eq!(dropped.len(), 2);
        assert!(!relation.contains_left(&1));
        // "a" survives through the other link, "b" is gone entirely.
        assert!(relation.contains_right(&"a".to_string()));
        assert!(!relation.contains_right(&"b".to_string()));
    }

    #[test]
    fn remove_right_cleans_empty_buckets() {
        let mut relation = Relation::new();
        relation.insert("conn", "session");
        let lefts = relation.remove_right(&"session");
        assert_eq!(lefts.len(), 1);
        assert!(!relation.contains_left(&"conn"));
        assert!(relation.remove_left(&"conn").is_empty());
    }
}
