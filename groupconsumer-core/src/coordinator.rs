use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;

use crate::config::LeaseConfig;
use crate::error::Result;
use crate::partition::{InstanceId, PartitionId};

/// Ownership claims kept in a KV bucket.
pub mod kv;

/// What a [`ChangeNotifier`] completed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipChange {
    /// The claim was released, taken over, or its lease ran out.
    Changed,
    /// The coordinator stopped watching the claim. Changes after this point go unnoticed.
    Lost,
}

/// Completes once after the ownership of the watched partition may have changed.
///
/// A notifier that completes does not say who the new owner is, the claimant has to query
/// again. After [`OwnershipChange::Lost`] it should back off first, the coordination service
/// is likely unavailable. Dropping it stops watching.
pub struct ChangeNotifier(Pin<Box<dyn Future<Output = OwnershipChange> + Send>>);

impl ChangeNotifier {
    pub fn new(changed: impl Future<Output = OwnershipChange> + Send + 'static) -> Self {
        Self(Box::pin(changed))
    }
}

impl Future for ChangeNotifier {
    type Output = OwnershipChange;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.as_mut().poll(cx)
    }
}

impl fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeNotifier").finish_non_exhaustive()
    }
}

/// Registers and releases exclusive ownership of partitions in a service shared by every
/// member of the group. At most one member may hold the claim of a partition at a time.
///
/// Claims are leases. The owner renews them every [`LeaseConfig::renew_interval`], a claim
/// that goes unrenewed for [`LeaseConfig::ttl`] is abandoned and other members may take over.
#[async_trait]
pub trait OwnershipCoordinator: Send + Sync {
    /// The member this coordinator claims partitions for.
    fn instance_id(&self) -> &InstanceId;

    fn lease(&self) -> LeaseConfig;

    /// Returns the current owner of `partition`, if any, together with a notifier for the
    /// next ownership change. Changes made after this call returns are never missed.
    async fn current_owner(
        &self,
        partition: &PartitionId,
    ) -> Result<(Option<InstanceId>, ChangeNotifier)>;

    /// Atomically registers this member as the owner of `partition`. Fails when another
    /// member got there first.
    async fn claim(&self, partition: &PartitionId) -> Result<()>;

    /// Extends the lease of this member's claim on `partition`. Fails with
    /// [`crate::Error::LeaseLost`] once the claim was removed or taken over.
    async fn renew(&self, partition: &PartitionId) -> Result<()>;

    /// Removes this member's claim on `partition`, unless it changed hands in the meantime.
    async fn release(&self, partition: &PartitionId) -> Result<()>;
}
