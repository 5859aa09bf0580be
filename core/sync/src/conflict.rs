//! Conflict classification and resolution outcome types.

use serde::{Deserialize, Serialize};
use std::fmt;

use fieldsync_common::{Error, Result, Snapshot, Timestamp};

/// Conflict taxonomy, derived from which sides still hold the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    /// Both sides hold a (different) snapshot.
    BothModified,
    /// Deleted locally, still present remotely.
    LocalDeletedRemoteModified,
    /// Deleted remotely, still present locally.
    RemoteDeletedLocalModified,
    /// Absent on both sides.
    BothDeleted,
}

impl ConflictType {
    /// All conflict types, in declaration order.
    pub const ALL: [ConflictType; 4] = [
        ConflictType::BothModified,
        ConflictType::LocalDeletedRemoteModified,
        ConflictType::RemoteDeletedLocalModified,
        ConflictType::BothDeleted,
    ];

    /// Presence flags `(local, remote)` implied by this type.
    pub fn presence(self) -> (bool, bool) {
        match self {
            ConflictType::BothModified => (true, true),
            ConflictType::LocalDeletedRemoteModified => (false, true),
            ConflictType::RemoteDeletedLocalModified => (true, false),
            ConflictType::BothDeleted => (false, false),
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictType::BothModified => "BOTH_MODIFIED",
            ConflictType::LocalDeletedRemoteModified => "LOCAL_DELETED_REMOTE_MODIFIED",
            ConflictType::RemoteDeletedLocalModified => "REMOTE_DELETED_LOCAL_MODIFIED",
            ConflictType::BothDeleted => "BOTH_DELETED",
        };
        f.write_str(name)
    }
}

/// Classify a conflict from presence flags.
pub fn classify(local_present: bool, remote_present: bool) -> ConflictType {
    match (local_present, remote_present) {
        (true, true) => ConflictType::BothModified,
        (false, true) => ConflictType::LocalDeletedRemoteModified,
        (true, false) => ConflictType::RemoteDeletedLocalModified,
        (false, false) => ConflictType::BothDeleted,
    }
}

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStrategy {
    /// Keep the local side, including a local deletion.
    LocalWins,
    /// Keep the remote side, including a remote deletion.
    RemoteWins,
    /// Keep the side with the strictly newer timestamp.
    LatestWins,
    /// Combine both sides with an entity-type merge function.
    Merge,
    /// Defer to an external manual resolver.
    Manual,
}

impl Default for ResolutionStrategy {
    fn default() -> Self {
        ResolutionStrategy::LatestWins
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolutionStrategy::LocalWins => "LOCAL_WINS",
            ResolutionStrategy::RemoteWins => "REMOTE_WINS",
            ResolutionStrategy::LatestWins => "LATEST_WINS",
            ResolutionStrategy::Merge => "MERGE",
            ResolutionStrategy::Manual => "MANUAL",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ResolutionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "local-wins" | "local" => Ok(ResolutionStrategy::LocalWins),
            "remote-wins" | "remote" => Ok(ResolutionStrategy::RemoteWins),
            "latest-wins" | "latest" => Ok(ResolutionStrategy::LatestWins),
            "merge" => Ok(ResolutionStrategy::Merge),
            "manual" => Ok(ResolutionStrategy::Manual),
            other => Err(Error::InvalidInput(format!(
                "Unknown resolution strategy: {}",
                other
            ))),
        }
    }
}

/// One side of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

/// Winner of a `LATEST_WINS` comparison when both timestamps are equal.
pub const LATEST_WINS_TIE_BREAK: Side = Side::Remote;

/// Pick the newer side; equal timestamps go to [`LATEST_WINS_TIE_BREAK`].
pub fn latest_side(local: Timestamp, remote: Timestamp) -> Side {
    if local > remote {
        Side::Local
    } else if remote > local {
        Side::Remote
    } else {
        LATEST_WINS_TIE_BREAK
    }
}

/// Classified comparison of a local and a remote snapshot for one entity.
///
/// The conflict type always matches the presence of both sides; the
/// checked constructor rejects any other combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDescriptor {
    #[serde(rename = "type")]
    conflict_type: ConflictType,
    id: String,
    local_data: Option<Snapshot>,
    local_timestamp: Timestamp,
    remote_data: Option<Snapshot>,
    remote_timestamp: Timestamp,
}

impl ConflictDescriptor {
    /// Build a descriptor, classifying it from the snapshots.
    pub fn from_snapshots(
        id: impl Into<String>,
        local_data: Option<Snapshot>,
        local_timestamp: Timestamp,
        remote_data: Option<Snapshot>,
        remote_timestamp: Timestamp,
    ) -> Self {
        Self {
            conflict_type: classify(local_data.is_some(), remote_data.is_some()),
            id: id.into(),
            local_data,
            local_timestamp,
            remote_data,
            remote_timestamp,
        }
    }

    /// Build a descriptor with an explicit type.
    ///
    /// # Errors
    /// - `Error::MalformedDescriptor` if presence does not match `conflict_type`
    pub fn new(
        conflict_type: ConflictType,
        id: impl Into<String>,
        local_data: Option<Snapshot>,
        local_timestamp: Timestamp,
        remote_data: Option<Snapshot>,
        remote_timestamp: Timestamp,
    ) -> Result<Self> {
        let descriptor = Self {
            conflict_type,
            id: id.into(),
            local_data,
            local_timestamp,
            remote_data,
            remote_timestamp,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Check that presence flags match the conflict type.
    ///
    /// Only descriptors that bypassed the constructors (e.g. deserialized
    /// ones) can fail this.
    pub fn validate(&self) -> Result<()> {
        let actual = (self.local_data.is_some(), self.remote_data.is_some());
        if actual != self.conflict_type.presence() {
            return Err(Error::MalformedDescriptor(format!(
                "{} declared as {} but local present={}, remote present={}",
                self.id, self.conflict_type, actual.0, actual.1
            )));
        }
        Ok(())
    }

    /// Whether both sides are present, equal, and equally old.
    ///
    /// Such a pair is not a conflict; the resolver keeps it unchanged.
    pub fn is_identical(&self) -> bool {
        match (&self.local_data, &self.remote_data) {
            (Some(local), Some(remote)) => {
                local == remote && self.local_timestamp == self.remote_timestamp
            }
            _ => false,
        }
    }

    pub fn conflict_type(&self) -> ConflictType {
        self.conflict_type
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_data(&self) -> Option<&Snapshot> {
        self.local_data.as_ref()
    }

    pub fn local_timestamp(&self) -> Timestamp {
        self.local_timestamp
    }

    pub fn remote_data(&self) -> Option<&Snapshot> {
        self.remote_data.as_ref()
    }

    pub fn remote_timestamp(&self) -> Timestamp {
        self.remote_timestamp
    }

    /// Snapshot held by one side.
    pub fn side(&self, side: Side) -> Option<&Snapshot> {
        match side {
            Side::Local => self.local_data.as_ref(),
            Side::Remote => self.remote_data.as_ref(),
        }
    }
}

/// Result of resolving one conflict.
///
/// `resolved_data` is `None` exactly when the entity must be deleted; an
/// empty placeholder is never produced for a deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionOutcome {
    resolved_data: Option<Snapshot>,
    strategy_used: ResolutionStrategy,
}

impl ResolutionOutcome {
    /// Keep `data`.
    pub fn keep(data: Snapshot, strategy_used: ResolutionStrategy) -> Self {
        Self {
            resolved_data: Some(data),
            strategy_used,
        }
    }

    /// Delete the entity.
    pub fn delete(strategy_used: ResolutionStrategy) -> Self {
        Self {
            resolved_data: None,
            strategy_used,
        }
    }

    /// Keep `data` if present, otherwise delete.
    pub fn from_option(data: Option<Snapshot>, strategy_used: ResolutionStrategy) -> Self {
        Self {
            resolved_data: data,
            strategy_used,
        }
    }

    pub fn resolved_data(&self) -> Option<&Snapshot> {
        self.resolved_data.as_ref()
    }

    pub fn into_resolved_data(self) -> Option<Snapshot> {
        self.resolved_data
    }

    pub fn should_delete(&self) -> bool {
        self.resolved_data.is_none()
    }

    pub fn strategy_used(&self) -> ResolutionStrategy {
        self.strategy_used
    }
}
