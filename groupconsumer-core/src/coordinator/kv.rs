use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use groupconsumer_shared::kv::{KVStore, KVValue, KVWatchOp, KVWatchStream};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{ChangeNotifier, OwnershipChange, OwnershipCoordinator};
use crate::config::LeaseConfig;
use crate::error::{Error, Result};
use crate::partition::{InstanceId, PartitionId};

const OWNERS_PREFIX: &str = "owners";

/// Keeps ownership claims in a KV bucket. The claim of a partition is the key
/// `owners/<topic>/<partition>` holding the owner's instance id, created atomically so only
/// one member can win.
///
/// The owner renews a claim by rewriting it against the revision it last wrote. A claim whose
/// latest write is older than the lease TTL is abandoned: the next member that looks at it
/// deletes exactly that revision, so a late renewal and the takeover cannot both succeed.
#[derive(Clone)]
pub struct KVCoordinator {
    store: Arc<dyn KVStore>,
    instance: InstanceId,
    lease: LeaseConfig,
    /// Revision of the latest write of every claim this instance holds.
    claims: Arc<Mutex<HashMap<PartitionId, u64>>>,
}

impl KVCoordinator {
    pub fn new(store: Arc<dyn KVStore>, instance: InstanceId, lease: LeaseConfig) -> Self {
        Self {
            store,
            instance,
            lease,
            claims: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn key(partition: &PartitionId) -> String {
        format!("{OWNERS_PREFIX}/{partition}")
    }

    fn owner_of(claim: &KVValue) -> InstanceId {
        InstanceId::from(String::from_utf8_lossy(&claim.value).into_owned())
    }

    async fn read_claim(&self, key: &str) -> Result<Option<KVValue>> {
        let claim = self
            .store
            .entry(key)
            .await
            .map_err(|e| Error::Coordinator(format!("Failed to read owner of {key}: {e}")))?;
        Ok(claim.filter(|claim| !claim.value.is_empty()))
    }

    /// Time since the claim was last written, zero if the store's clock is ahead of ours.
    fn age(claim: &KVValue) -> Duration {
        SystemTime::now()
            .duration_since(claim.updated)
            .unwrap_or_default()
    }

    /// Completes on the first change of the claim other than a renewal by `owner`, or once
    /// the claim went unrenewed for the lease TTL.
    fn notifier(
        &self,
        mut watch: KVWatchStream,
        owner: Bytes,
        expires_in: Duration,
    ) -> ChangeNotifier {
        let ttl = self.lease.ttl;
        ChangeNotifier::new(async move {
            let expiry = tokio::time::sleep(expires_in);
            tokio::pin!(expiry);
            loop {
                tokio::select! {
                    entry = watch.next() => match entry {
                        // the owner renewing its lease
                        Some(entry)
                            if entry.operation == KVWatchOp::Put && entry.value == owner =>
                        {
                            expiry.as_mut().reset(Instant::now() + ttl);
                        }
                        Some(_) => return OwnershipChange::Changed,
                        None => return OwnershipChange::Lost,
                    },
                    _ = &mut expiry => return OwnershipChange::Changed,
                }
            }
        })
    }

    fn lease_lost(&self, partition: &PartitionId) -> Error {
        Error::LeaseLost {
            partition: partition.clone(),
            instance: self.instance.clone(),
        }
    }
}

#[async_trait]
impl OwnershipCoordinator for KVCoordinator {
    fn instance_id(&self) -> &InstanceId {
        &self.instance
    }

    fn lease(&self) -> LeaseConfig {
        self.lease
    }

    async fn current_owner(
        &self,
        partition: &PartitionId,
    ) -> Result<(Option<InstanceId>, ChangeNotifier)> {
        let key = Self::key(partition);

        // subscribe before reading, a release between the two would otherwise go unnoticed
        let mut watch = self
            .store
            .watch(&key)
            .await
            .map_err(|e| Error::Coordinator(format!("Failed to watch owner of {key}: {e}")))?;

        loop {
            let Some(claim) = self.read_claim(&key).await? else {
                let changed = ChangeNotifier::new(async move {
                    match watch.next().await {
                        Some(_) => OwnershipChange::Changed,
                        None => OwnershipChange::Lost,
                    }
                });
                return Ok((None, changed));
            };

            let owner = Self::owner_of(&claim);
            let age = Self::age(&claim);
            if age < self.lease.ttl {
                let changed = self.notifier(watch, claim.value, self.lease.ttl - age);
                return Ok((Some(owner), changed));
            }

            // the owner stopped renewing, a concurrent renewal makes this delete a no-op
            let removed = self
                .store
                .delete_revision(&key, claim.revision)
                .await
                .map_err(|e| {
                    Error::Coordinator(format!("Failed to remove expired claim on {key}: {e}"))
                })?;
            if removed {
                info!(%partition, %owner, ?age, "Removed expired claim");
            }
        }
    }

    async fn claim(&self, partition: &PartitionId) -> Result<()> {
        let key = Self::key(partition);
        let revision = self
            .store
            .create(&key, Bytes::from(self.instance.to_string()))
            .await
            .map_err(|e| Error::Coordinator(format!("Failed to claim {partition}: {e}")))?;

        let Some(revision) = revision else {
            return Err(Error::Coordinator(format!(
                "{partition} was claimed by another instance"
            )));
        };
        self.claims.lock().insert(partition.clone(), revision);
        debug!(%partition, instance = %self.instance, revision, "Registered partition claim");
        Ok(())
    }

    async fn renew(&self, partition: &PartitionId) -> Result<()> {
        let Some(revision) = self.claims.lock().get(partition).copied() else {
            return Err(self.lease_lost(partition));
        };

        let key = Self::key(partition);
        let renewed = self
            .store
            .update(&key, Bytes::from(self.instance.to_string()), revision)
            .await
            .map_err(|e| {
                Error::Coordinator(format!("Failed to renew claim on {partition}: {e}"))
            })?;

        match renewed {
            Some(renewed) => {
                self.claims.lock().insert(partition.clone(), renewed);
                Ok(())
            }
            None => {
                self.claims.lock().remove(partition);
                Err(self.lease_lost(partition))
            }
        }
    }

    async fn release(&self, partition: &PartitionId) -> Result<()> {
        let Some(revision) = self.claims.lock().remove(partition) else {
            return Err(Error::Coordinator(format!(
                "{partition} is not claimed by {}",
                self.instance
            )));
        };

        let key = Self::key(partition);
        let deleted = self
            .store
            .delete_revision(&key, revision)
            .await
            .map_err(|e| Error::Coordinator(format!("Failed to release {partition}: {e}")))?;

        if !deleted {
            return Err(Error::Coordinator(format!(
                "{partition} is no longer claimed by {}",
                self.instance
            )));
        }
        Ok(())
    }
}
