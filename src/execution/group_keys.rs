//! Group key lineage
//!
//! Every regroup produces a new level of groups. A level stores, per group
//! id, the key that created the group and the id of its parent group in the
//! previous level. Group 0 is the sentinel and never holds documents.
//!
//! ```text
//! level 0:            1:[]
//! level 1 (country):  1:[us] 2:[gb]            parents 1 1
//! level 2 (day):      1:[us,Mon] 2:[us,Tue] 3:[gb,Mon]   parents 1 1 2
//! ```

use std::fmt;
use std::sync::Arc;

use super::{ExecutionError, ExecutionResult};
use crate::term::Term;

/// Key of one group at one level
#[derive(Debug, Clone, PartialEq)]
pub enum GroupKey {
    /// The single group before any regroup
    Initial,
    Term(Term),
    /// Bucket `[lower, upper)`
    Range { lower: i64, upper: i64 },
    /// Values below the first bucket
    LowGutter(i64),
    /// Values at or above the last bucket
    HighGutter(i64),
    Label(String),
    /// Catch-all group for documents matching no explicit key
    Default,
}

impl GroupKey {
    pub fn is_default(&self) -> bool {
        matches!(self, GroupKey::Default)
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Initial => Ok(()),
            GroupKey::Term(term) => f.write_str(&term.as_string()),
            GroupKey::Range { lower, upper } => write!(f, "[{}, {})", lower, upper),
            GroupKey::LowGutter(upper) => write!(f, "[-infinity, {})", upper),
            GroupKey::HighGutter(lower) => write!(f, "[{}, infinity)", lower),
            GroupKey::Label(label) => f.write_str(label),
            GroupKey::Default => f.write_str("DEFAULT"),
        }
    }
}

/// One level of groups; earlier levels are shared through `previous`
#[derive(Debug, Clone)]
pub struct GroupKeySet {
    previous: Option<Arc<GroupKeySet>>,
    parents: Vec<usize>,
    keys: Vec<GroupKey>,
}

impl GroupKeySet {
    /// The level before any regroup: group 1 with the initial key
    pub fn root() -> Arc<GroupKeySet> {
        Arc::new(GroupKeySet {
            previous: None,
            parents: vec![0, 0],
            keys: vec![GroupKey::Initial, GroupKey::Initial],
        })
    }

    /// New level whose groups are numbered in the order of `children`.
    /// Each child names its parent group in `previous`.
    pub fn explode(
        previous: &Arc<GroupKeySet>,
        children: Vec<(usize, GroupKey)>,
    ) -> ExecutionResult<Arc<GroupKeySet>> {
        let mut parents = Vec::with_capacity(children.len() + 1);
        let mut keys = Vec::with_capacity(children.len() + 1);
        parents.push(0);
        keys.push(GroupKey::Initial);
        for (parent, key) in children {
            if !previous.is_present(parent) {
                return Err(ExecutionError::GroupOutOfRange(parent));
            }
            parents.push(parent);
            keys.push(key);
        }
        Ok(Arc::new(GroupKeySet {
            previous: Some(Arc::clone(previous)),
            parents,
            keys,
        }))
    }

    pub fn num_groups(&self) -> usize {
        self.keys.len() - 1
    }

    pub fn is_present(&self, group: usize) -> bool {
        group >= 1 && group < self.keys.len()
    }

    /// Parent id in the previous level; 0 for out-of-range groups
    pub fn parent_group(&self, group: usize) -> usize {
        self.parents.get(group).copied().unwrap_or(0)
    }

    pub fn key(&self, group: usize) -> Option<&GroupKey> {
        if self.is_present(group) {
            self.keys.get(group)
        } else {
            None
        }
    }

    pub fn is_default(&self, group: usize) -> bool {
        self.key(group).map(GroupKey::is_default).unwrap_or(false)
    }

    pub fn previous(&self) -> Option<&Arc<GroupKeySet>> {
        self.previous.as_ref()
    }

    /// Keys from the outermost regroup down to `group`, skipping the initial key
    pub fn key_path(&self, group: usize) -> Vec<&GroupKey> {
        let mut path = Vec::new();
        let mut level = Some(self);
        let mut current = group;
        while let Some(set) = level {
            match set.key(current) {
                Some(GroupKey::Initial) | None => {}
                Some(key) => path.push(key),
            }
            current = set.parent_group(current);
            level = set.previous.as_deref();
        }
        path.reverse();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_levels() -> Arc<GroupKeySet> {
        let root = GroupKeySet::root();
        let countries = GroupKeySet::explode(
            &root,
            vec![
                (1, GroupKey::Term(Term::string("us"))),
                (1, GroupKey::Term(Term::string("gb"))),
            ],
        )
        .unwrap();
        GroupKeySet::explode(
            &countries,
            vec![
                (1, GroupKey::Label("Mon".into())),
                (1, GroupKey::Label("Tue".into())),
                (2, GroupKey::Default),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_root() {
        let root = GroupKeySet::root();
        assert_eq!(root.num_groups(), 1);
        assert!(root.key_path(1).is_empty());
        assert!(!root.is_present(0));
    }

    #[test]
    fn test_lineage() {
        let days = two_levels();
        assert_eq!(days.num_groups(), 3);
        assert_eq!(days.parent_group(3), 2);
        assert!(days.is_default(3));
        assert!(!days.is_default(1));

        let path: Vec<String> = days.key_path(2).iter().map(|k| k.to_string()).collect();
        assert_eq!(path, vec!["us", "Tue"]);
    }

    #[test]
    fn test_explode_rejects_unknown_parent() {
        let root = GroupKeySet::root();
        let err = GroupKeySet::explode(&root, vec![(2, GroupKey::Default)]).unwrap_err();
        assert_eq!(err, ExecutionError::GroupOutOfRange(2));
    }

    #[test]
    fn test_key_display() {
        assert_eq!(GroupKey::Range { lower: 0, upper: 10 }.to_string(), "[0, 10)");
        assert_eq!(GroupKey::HighGutter(10).to_string(), "[10, infinity)");
        assert_eq!(GroupKey::Term(Term::term("007")).to_string(), "007");
    }
}
