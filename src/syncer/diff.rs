//! Outcome of reconciling sourced repos against the store.

use crate::types::{Repo, RepoModifiedFields};
use serde::Serialize;

/// A repo whose stored copy was changed, with the fields that changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModifiedRepo {
    pub repo: Repo,
    pub fields: RepoModifiedFields,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diff {
    pub added: Vec<Repo>,
    pub deleted: Vec<Repo>,
    pub modified: Vec<ModifiedRepo>,
    pub unmodified: Vec<Repo>,
}

impl Diff {
    /// Number of repos across all buckets.
    pub fn len(&self) -> usize {
        self.added.len() + self.deleted.len() + self.modified.len() + self.unmodified.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every repo in the diff, bucket by bucket.
    pub fn repos(&self) -> impl Iterator<Item = &Repo> {
        self.added
            .iter()
            .chain(&self.deleted)
            .chain(self.modified.iter().map(|m| &m.repo))
            .chain(&self.unmodified)
    }

    /// Orders each bucket by repo id, then name.
    pub fn sort(&mut self) {
        let key = |r: &Repo| (r.id, r.name.clone());
        self.added.sort_by_key(key);
        self.deleted.sort_by_key(key);
        self.modified.sort_by_key(|m| key(&m.repo));
        self.unmodified.sort_by_key(key);
    }
}
