//! # snapvault-types: Core types for `snapvault`
//!
//! This crate contains shared types used across the `snapvault` system:
//! - Repository generations ([`RepoGen`]) and their sentinels
//! - Format markers ([`Version`]) used for backward-compatible (de)serialization
//! - Identities ([`SnapshotId`], [`IndexId`], [`ShardId`])
//! - Shard-level generation tokens ([`ShardGeneration`])
//! - Snapshot outcomes ([`SnapshotState`])
//! - Key/value repository settings ([`Settings`])

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

mod settings;

pub use settings::{Settings, SettingsBuilder, SettingsError};

// ============================================================================
// Repository Generations
// ============================================================================

/// Generation of a repository's root metadata blob (`index-<N>`).
///
/// Generations are strictly increasing on every successful commit. Two
/// negative sentinels exist:
/// - [`RepoGen::EMPTY`]: tracked, but nothing has been written yet
/// - [`RepoGen::UNKNOWN`]: no generation tracked in cluster state yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoGen(i64);

impl RepoGen {
    /// The repository is tracked but contains no root metadata blob.
    pub const EMPTY: RepoGen = RepoGen(-1);

    /// No generation is tracked for the repository.
    pub const UNKNOWN: RepoGen = RepoGen(-2);

    pub fn new(generation: i64) -> Self {
        debug_assert!(generation >= -2, "invalid repository generation {generation}");
        Self(generation)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    /// Returns true unless this is [`RepoGen::UNKNOWN`].
    pub fn is_known(self) -> bool {
        self != Self::UNKNOWN
    }

    /// Returns true if a root blob exists at this generation.
    pub fn is_materialized(self) -> bool {
        self.0 >= 0
    }

    /// Returns the generation a successful commit on top of `self` produces.
    ///
    /// # Panics
    ///
    /// Panics when called on [`RepoGen::UNKNOWN`]; the latest generation must
    /// be resolved before writing.
    pub fn next(self) -> Self {
        assert!(self.is_known(), "cannot advance an unknown repository generation");
        Self(self.0 + 1)
    }
}

impl Display for RepoGen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<RepoGen> for i64 {
    fn from(generation: RepoGen) -> Self {
        generation.0
    }
}

// ============================================================================
// Format Versions
// ============================================================================

/// Software version that wrote a piece of repository metadata.
///
/// Versions gate which fields appear in serialized documents; a repository
/// last written by an older release is read and written in that release's
/// format until its old snapshots are gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    major: u8,
    minor: u8,
    patch: u8,
}

impl Version {
    pub const V_7_5_0: Version = Version::new(7, 5, 0);
    pub const V_7_6_0: Version = Version::new(7, 6, 0);
    pub const V_7_9_0: Version = Version::new(7, 9, 0);
    pub const V_7_12_0: Version = Version::new(7, 12, 0);
    pub const V_8_0_0: Version = Version::new(8, 0, 0);

    /// The version written by this build.
    pub const CURRENT: Version = Version::V_8_0_0;

    /// First version that tracks UUID shard generations in the root blob.
    pub const SHARD_GEN_IN_REPO_DATA: Version = Version::V_7_6_0;

    /// First version that tracks deduplicated index metadata blobs.
    pub const INDEX_GEN_IN_REPO_DATA: Version = Version::V_7_9_0;

    /// Format used for snapshots injected to simulate an old repository.
    pub const OLD_SNAPSHOT_FORMAT: Version = Version::V_7_5_0;

    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Numeric identifier, e.g. `7050099` for 7.5.0.
    pub fn id(self) -> u32 {
        u32::from(self.major) * 1_000_000
            + u32::from(self.minor) * 10_000
            + u32::from(self.patch) * 100
            + 99
    }

    /// Parses a numeric identifier produced by [`Version::id`].
    pub fn from_id(id: u32) -> Result<Self, ParseVersionError> {
        if id % 100 != 99 {
            return Err(ParseVersionError::InvalidId(id));
        }
        let major = id / 1_000_000;
        let minor = (id / 10_000) % 100;
        let patch = (id / 100) % 100;
        let major = u8::try_from(major).map_err(|_| ParseVersionError::InvalidId(id))?;
        Ok(Self::new(major, minor as u8, patch as u8))
    }

    /// Whether documents written at this version carry UUID shard generations.
    pub fn includes_shard_uuids(self) -> bool {
        self >= Self::SHARD_GEN_IN_REPO_DATA
    }

    /// Whether documents written at this version carry index metadata generations.
    pub fn includes_index_generations(self) -> bool {
        self >= Self::INDEX_GEN_IN_REPO_DATA
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let mut next = || -> Result<u8, ParseVersionError> {
            parts
                .next()
                .and_then(|p| p.parse::<u8>().ok())
                .ok_or_else(|| ParseVersionError::Malformed(s.to_string()))
        };
        let version = Self::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(ParseVersionError::Malformed(s.to_string()));
        }
        Ok(version)
    }
}

impl TryFrom<String> for Version {
    type Error = ParseVersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.to_string()
    }
}

/// Errors parsing a [`Version`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseVersionError {
    #[error("malformed version string: {0}")]
    Malformed(String),

    #[error("invalid version id: {0}")]
    InvalidId(u32),
}

// ============================================================================
// Identities
// ============================================================================

/// Generates a fresh opaque identifier.
pub fn random_uuid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Identity of a snapshot: a user-facing name plus a unique UUID.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId {
    name: String,
    uuid: String,
}

impl SnapshotId {
    pub fn new(name: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: uuid.into(),
        }
    }

    /// Creates a snapshot id with a fresh UUID.
    pub fn random(name: impl Into<String>) -> Self {
        Self::new(name, random_uuid())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}

impl Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.uuid)
    }
}

/// Identity of an index inside a repository.
///
/// The `id` is the repository-level folder name under `indices/`; it is
/// assigned the first time an index is snapshotted and reused afterwards.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexId {
    name: String,
    id: String,
}

impl IndexId {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }

    pub fn random(name: impl Into<String>) -> Self {
        Self::new(name, random_uuid())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}]", self.name, self.id)
    }
}

/// A single shard of an index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId {
    index: IndexId,
    shard: u32,
}

impl ShardId {
    pub fn new(index: IndexId, shard: u32) -> Self {
        Self { index, shard }
    }

    pub fn index(&self) -> &IndexId {
        &self.index
    }

    pub fn shard(&self) -> u32 {
        self.shard
    }
}

impl Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index.name, self.shard)
    }
}

// ============================================================================
// Shard Generations
// ============================================================================

/// Token identifying one version of a shard's `index-<gen>` blob.
///
/// Repositories written before [`Version::SHARD_GEN_IN_REPO_DATA`] use
/// numeric tokens that count up per shard; newer ones use opaque UUIDs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShardGeneration {
    Legacy(u64),
    Uuid(String),
}

impl ShardGeneration {
    /// A fresh opaque generation.
    pub fn random() -> Self {
        Self::Uuid(random_uuid())
    }

    /// The numeric generation following `previous`, starting at 0.
    pub fn next_legacy(previous: Option<&ShardGeneration>) -> Self {
        match previous {
            Some(Self::Legacy(n)) => Self::Legacy(n + 1),
            _ => Self::Legacy(0),
        }
    }

    /// Parses a serialized token.
    ///
    /// Numeric tokens are read as [`ShardGeneration::Legacy`] only when
    /// `numeric_is_legacy` is set; otherwise every token is opaque.
    pub fn parse(token: &str, numeric_is_legacy: bool) -> Self {
        match token.parse::<u64>() {
            Ok(n) if numeric_is_legacy => Self::Legacy(n),
            _ => Self::Uuid(token.to_string()),
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::Legacy(_))
    }

    /// Name of the shard-level blob holding this generation.
    pub fn blob_name(&self) -> String {
        format!("index-{self}")
    }
}

impl Display for ShardGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy(n) => write!(f, "{n}"),
            Self::Uuid(uuid) => f.write_str(uuid),
        }
    }
}

// ============================================================================
// Snapshot State
// ============================================================================

/// Outcome of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotState {
    InProgress,
    Success,
    Failed,
    Partial,
}

impl SnapshotState {
    /// Compact encoding used in the root metadata blob.
    pub fn value(self) -> u8 {
        match self {
            Self::InProgress => 0,
            Self::Success => 1,
            Self::Failed => 2,
            Self::Partial => 3,
        }
    }

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::InProgress),
            1 => Some(Self::Success),
            2 => Some(Self::Failed),
            3 => Some(Self::Partial),
            _ => None,
        }
    }

    /// Returns true for terminal states.
    pub fn completed(self) -> bool {
        self != Self::InProgress
    }

    /// Derives the terminal state from shard counts.
    pub fn from_shard_counts(total: u32, failed: u32) -> Self {
        if failed == 0 {
            Self::Success
        } else if failed >= total {
            Self::Failed
        } else {
            Self::Partial
        }
    }
}

impl Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Partial => "PARTIAL",
        };
        f.write_str(s)
    }
}
