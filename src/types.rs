//! # Domain Types
//!
//! Repository and external-service types shared by the syncer, the store and
//! the update scheduler. These are decoupled from the SeaORM entities so the
//! reconciliation logic can be exercised without a database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Kind used by services that list plain clone URLs.
pub const KIND_OTHER: &str = "OTHER";

/// Identifier of a stored repo. Zero means "not yet persisted".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RepoId(pub i32);

impl RepoId {
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an external service row.
pub type ExternalServiceId = i32;

/// Code-host identity of a repo. Two repos with the same external spec are the same
/// repo regardless of name.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ExternalRepoSpec {
    /// Code-host native id
    pub id: String,
    /// Code-host kind, e.g. `github`
    pub service_type: String,
    /// Code-host instance, usually its base URL
    pub service_id: String,
}

impl ExternalRepoSpec {
    pub fn is_set(&self) -> bool {
        !self.id.is_empty() && !self.service_type.is_empty() && !self.service_id.is_empty()
    }
}

/// Where a repo was yielded from and how to clone it from there.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// URN of the external service, see [`ExternalService::urn`]
    pub id: String,
    pub clone_url: String,
}

/// A repository as yielded by a source or loaded from the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Repo {
    pub id: RepoId,
    pub name: String,
    pub uri: String,
    pub description: String,
    pub external_repo: ExternalRepoSpec,
    pub archived: bool,
    pub fork: bool,
    pub private: bool,
    pub stars: i32,
    pub metadata: Option<JsonValue>,
    /// Keyed by external service URN
    pub sources: BTreeMap<String, SourceInfo>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Repo {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// The minimal identity the update scheduler keeps for this repo.
    pub fn configured(&self) -> ConfiguredRepo {
        ConfiguredRepo {
            id: self.id,
            name: self.name.clone(),
        }
    }

    /// Applies the fields of `sourced` onto `self` and reports what changed.
    ///
    /// An empty external spec on `sourced` never overwrites a stored one.
    /// Sources are merged per URN: new or changed entries are written,
    /// entries only present on `self` are kept. A soft-deleted repo is
    /// brought back to life.
    pub fn update(&mut self, sourced: &Repo) -> RepoModifiedFields {
        let mut modified = RepoModifiedFields::empty();

        if self.name != sourced.name {
            self.name = sourced.name.clone();
            modified |= RepoModifiedFields::NAME;
        }
        if self.uri != sourced.uri {
            self.uri = sourced.uri.clone();
            modified |= RepoModifiedFields::URI;
        }
        if self.description != sourced.description {
            self.description = sourced.description.clone();
            modified |= RepoModifiedFields::DESCRIPTION;
        }
        if sourced.external_repo != ExternalRepoSpec::default()
            && self.external_repo != sourced.external_repo
        {
            self.external_repo = sourced.external_repo.clone();
            modified |= RepoModifiedFields::EXTERNAL_REPO;
        }
        if self.archived != sourced.archived {
            self.archived = sourced.archived;
            modified |= RepoModifiedFields::ARCHIVED;
        }
        if self.fork != sourced.fork {
            self.fork = sourced.fork;
            modified |= RepoModifiedFields::FORK;
        }
        if self.private != sourced.private {
            self.private = sourced.private;
            modified |= RepoModifiedFields::PRIVATE;
        }
        if self.stars != sourced.stars {
            self.stars = sourced.stars;
            modified |= RepoModifiedFields::STARS;
        }
        if self.metadata != sourced.metadata {
            self.metadata = sourced.metadata.clone();
            modified |= RepoModifiedFields::METADATA;
        }
        for (urn, info) in &sourced.sources {
            if self.sources.get(urn) != Some(info) {
                self.sources.insert(urn.clone(), info.clone());
                modified |= RepoModifiedFields::SOURCES;
            }
        }
        if self.deleted_at.is_some() {
            self.deleted_at = None;
            modified |= RepoModifiedFields::DELETED_AT;
        }

        modified
    }
}

/// Bitmask of the fields [`Repo::update`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RepoModifiedFields(u32);

impl RepoModifiedFields {
    pub const NAME: Self = Self(1);
    pub const URI: Self = Self(1 << 1);
    pub const DESCRIPTION: Self = Self(1 << 2);
    pub const EXTERNAL_REPO: Self = Self(1 << 3);
    pub const ARCHIVED: Self = Self(1 << 4);
    pub const FORK: Self = Self(1 << 5);
    pub const PRIVATE: Self = Self(1 << 6);
    pub const STARS: Self = Self(1 << 7);
    pub const METADATA: Self = Self(1 << 8);
    pub const SOURCES: Self = Self(1 << 9);
    pub const DELETED_AT: Self = Self(1 << 10);

    const NAMES: [(Self, &'static str); 11] = [
        (Self::NAME, "name"),
        (Self::URI, "uri"),
        (Self::DESCRIPTION, "description"),
        (Self::EXTERNAL_REPO, "external_repo"),
        (Self::ARCHIVED, "archived"),
        (Self::FORK, "fork"),
        (Self::PRIVATE, "private"),
        (Self::STARS, "stars"),
        (Self::METADATA, "metadata"),
        (Self::SOURCES, "sources"),
        (Self::DELETED_AT, "deleted_at"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Names of the set fields, in declaration order.
    pub fn field_names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl BitOr for RepoModifiedFields {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for RepoModifiedFields {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for RepoModifiedFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.field_names().join("|"))
    }
}

impl Serialize for RepoModifiedFields {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.field_names())
    }
}

/// The identity the update scheduler tracks: enough to request a fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfiguredRepo {
    pub id: RepoId,
    pub name: String,
}

/// A configured connection to a code host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalService {
    pub id: ExternalServiceId,
    pub kind: String,
    pub display_name: String,
    pub config: JsonValue,
    pub namespace_user_id: Option<i32>,
    pub namespace_org_id: Option<i32>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub next_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ExternalService {
    /// Key under which this service appears in [`Repo::sources`].
    pub fn urn(&self) -> String {
        format!("extsvc:{}:{}", self.kind.to_lowercase(), self.id)
    }

    /// Services added by a user or an organization rather than a site admin.
    pub fn is_namespaced(&self) -> bool {
        self.namespace_user_id.is_some() || self.namespace_org_id.is_some()
    }
}

/// Counters reported while an external service is synced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub synced: i32,
    pub errors: i32,
    pub added: i32,
    pub removed: i32,
    pub modified: i32,
    pub unmodified: i32,
}
