//! Resource set diffing between what a task holds and what it should hold.

use std::collections::{HashMap, HashSet};

use crate::model::Resource;

/// Calls needed to move a task from one resource set to another.
/// `revoke` must be issued before `assign`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResourceDiff {
    /// Ids present before but absent now.
    pub revoke: Vec<String>,
    /// New resources plus resources whose fields changed.
    pub assign: Vec<Resource>,
}

impl ResourceDiff {
    pub fn between(old: &[Resource], new: &[Resource]) -> Self {
        let new_ids: HashSet<&str> = new.iter().map(|r| r.id.as_str()).collect();
        let old_by_id: HashMap<&str, &Resource> = old.iter().map(|r| (r.id.as_str(), r)).collect();

        let mut seen = HashSet::new();
        let revoke = old
            .iter()
            .filter(|r| !new_ids.contains(r.id.as_str()))
            .filter(|r| seen.insert(r.id.as_str()))
            .map(|r| r.id.clone())
            .collect();

        let assign = new
            .iter()
            .filter(|r| old_by_id.get(r.id.as_str()).copied() != Some(*r))
            .cloned()
            .collect();

        Self { revoke, assign }
    }

    pub fn is_empty(&self) -> bool {
        self.revoke.is_empty() && self.assign.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(id: &str, ip: &str) -> Resource {
        Resource {
            id: id.into(),
            mvc_ip: ip.into(),
            ..Default::default()
        }
    }

    #[test]
    fn removed_changed_and_added() {
        let old = [res("a", "1"), res("b", "1"), res("c", "1")];
        let new = [res("b", "1"), res("c", "2"), res("d", "1")];
        let diff = ResourceDiff::between(&old, &new);

        assert_eq!(diff.revoke, ["a"]);
        let assigned: Vec<_> = diff.assign.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(assigned, ["c", "d"]);
    }

    #[test]
    fn identical_sets_are_empty() {
        let set = [res("a", "1"), res("b", "2")];
        assert!(ResourceDiff::between(&set, &set).is_empty());
    }

    #[test]
    fn whole_bundle_swap() {
        let r1 = [res("a", "1"), res("b", "1")];
        let r2 = [res("x", "1")];
        let diff = ResourceDiff::between(&r1, &r2);
        assert_eq!(diff.revoke, ["a", "b"]);
        assert_eq!(diff.assign, r2.to_vec());
    }

    #[test]
    fn empty_old_side_assigns_everything() {
        let new = [res("a", "1")];
        let diff = ResourceDiff::between(&[], &new);
        assert!(diff.revoke.is_empty());
        assert_eq!(diff.assign.len(), 1);
    }
}
