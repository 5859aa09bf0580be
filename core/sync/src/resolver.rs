//! Conflict resolution by strategy.

use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, warn};

use fieldsync_common::Result;

use crate::conflict::{latest_side, ConflictDescriptor, ResolutionOutcome, ResolutionStrategy, Side};
use crate::policy::PolicyRegistry;

/// Outcome where `side` wins, deletion included.
pub fn side_wins(
    descriptor: &ConflictDescriptor,
    side: Side,
    strategy_used: ResolutionStrategy,
) -> ResolutionOutcome {
    ResolutionOutcome::from_option(descriptor.side(side).cloned(), strategy_used)
}

/// Outcome under `LATEST_WINS`.
pub fn latest_wins(descriptor: &ConflictDescriptor) -> ResolutionOutcome {
    let side = latest_side(descriptor.local_timestamp(), descriptor.remote_timestamp());
    side_wins(descriptor, side, ResolutionStrategy::LatestWins)
}

/// Applies the registry's policy to classified conflicts.
pub struct ConflictResolver {
    policy: Arc<PolicyRegistry>,
}

impl ConflictResolver {
    /// Create a resolver reading from `policy`.
    pub fn new(policy: Arc<PolicyRegistry>) -> Self {
        Self { policy }
    }

    /// Get the policy registry.
    pub fn policy(&self) -> &Arc<PolicyRegistry> {
        &self.policy
    }

    /// Resolve a conflict.
    ///
    /// The effective strategy is the override for the descriptor's conflict
    /// type, else the default. `MERGE` without a merge function for
    /// `entity_type` and `MANUAL` without a resolver (or past the manual
    /// timeout) fall back to `LATEST_WINS`, which is then reported in
    /// `strategy_used`. An identical pair is kept as is without running
    /// merge functions or the manual resolver.
    ///
    /// # Errors
    /// - `Error::MalformedDescriptor` if presence does not match the type
    /// - Any error returned by the manual resolver
    pub async fn resolve(
        &self,
        descriptor: &ConflictDescriptor,
        entity_type: Option<&str>,
    ) -> Result<ResolutionOutcome> {
        descriptor.validate()?;

        let policy = self.policy.snapshot(descriptor.conflict_type(), entity_type);
        debug!(
            "Resolving {} conflict for {} with {}",
            descriptor.conflict_type(),
            descriptor.id(),
            policy.strategy
        );

        if descriptor.is_identical() {
            debug!("{} is identical on both sides, keeping it", descriptor.id());
            return Ok(ResolutionOutcome::from_option(
                descriptor.local_data().cloned(),
                policy.strategy,
            ));
        }

        match policy.strategy {
            ResolutionStrategy::LocalWins => Ok(side_wins(
                descriptor,
                Side::Local,
                ResolutionStrategy::LocalWins,
            )),
            ResolutionStrategy::RemoteWins => Ok(side_wins(
                descriptor,
                Side::Remote,
                ResolutionStrategy::RemoteWins,
            )),
            ResolutionStrategy::LatestWins => Ok(latest_wins(descriptor)),
            ResolutionStrategy::Merge => match policy.merge_fn {
                Some(merge) => {
                    let merged = merge(descriptor.local_data(), descriptor.remote_data());
                    Ok(ResolutionOutcome::from_option(merged, ResolutionStrategy::Merge))
                }
                None => {
                    debug!(
                        "No merge function for {:?}, falling back to LATEST_WINS",
                        entity_type
                    );
                    Ok(latest_wins(descriptor))
                }
            },
            ResolutionStrategy::Manual => match policy.manual_resolver {
                Some(resolver) => {
                    match timeout(policy.manual_timeout, resolver.resolve(descriptor)).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            warn!(
                                "Manual resolution of {} timed out after {:?}, falling back to LATEST_WINS",
                                descriptor.id(),
                                policy.manual_timeout
                            );
                            Ok(latest_wins(descriptor))
                        }
                    }
                }
                None => {
                    warn!(
                        "No manual resolver registered for {}, falling back to LATEST_WINS",
                        descriptor.id()
                    );
                    Ok(latest_wins(descriptor))
                }
            },
        }
    }
}
