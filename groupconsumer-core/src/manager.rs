//! The partition manager owns one partition of a topic for as long as it runs.
//!
//! It moves through a fixed sequence of phases:
//!
//! ```text
//! Claiming -> ResolvingOffset -> AttachingReader -> Relaying -> Unwinding -> Done
//! ```
//!
//! * `Claiming` registers this instance as the owner of the partition, waiting for the current
//!   owner (if any) to let go or for its lease to run out.
//! * `ResolvingOffset` reads the committed offset, falling back to the configured initial
//!   offset when nothing was committed.
//! * `AttachingReader` opens a reader at that offset. If the log no longer holds the offset the
//!   reader is attached at the initial offset instead.
//! * `Relaying` forwards records and reader errors to the shared output channels.
//! * `Unwinding` closes the reader and releases the claim. It is only entered once the claim
//!   was registered.
//!
//! From the claim until the release the lease on the claim is renewed in the background. A
//! manager that loses its claim stops, unwinds and fails with [`Error::LeaseLost`].
//!
//! Failing calls to the collaborators are retried with the configured backoff, without limit.
//! Interrupting the manager cuts every wait short (a backoff sleep, the wait for the current
//! owner, a blocked send on the output) but never abandons a claim or an attach that is in
//! flight, so whatever was acquired is always given back.

use std::future::Future;
use std::sync::Arc;

use backoff::retry::{Retry, RetryError};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::ManagerConfig;
use crate::coordinator::{OwnershipChange, OwnershipCoordinator};
use crate::error::{Error, Result};
use crate::metrics::{manager_metrics, mode_labels, partition_labels, phase_labels};
use crate::offset::{OffsetStore, StartOffset};
use crate::partition::PartitionId;
use crate::reader::{ConsumerError, ConsumerRecord, PartitionReader, ReaderFactory};

/// The phase a partition manager is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Claiming,
    ResolvingOffset,
    AttachingReader,
    Relaying,
    Unwinding,
    Done,
}

/// Where the managers of a consumer group deliver what their readers produce. The senders are
/// shared by every manager, the aggregating consumer holds the receivers.
#[derive(Debug, Clone)]
pub struct Output {
    pub records: mpsc::Sender<ConsumerRecord>,
    pub errors: mpsc::Sender<ConsumerError>,
}

/// Calls that are retried, used to label logs and metrics.
#[derive(Debug, Clone, Copy)]
enum Phase {
    OwnerQuery,
    Claim,
    Renew,
    FetchOffset,
    AttachReader,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::OwnerQuery => "owner_query",
            Phase::Claim => "claim",
            Phase::Renew => "renew",
            Phase::FetchOffset => "fetch_offset",
            Phase::AttachReader => "attach_reader",
        }
    }
}

pub struct PartitionManager {
    partition: PartitionId,
    coordinator: Arc<dyn OwnershipCoordinator>,
    offset_store: Arc<dyn OffsetStore>,
    reader_factory: Arc<dyn ReaderFactory>,
    config: ManagerConfig,
    output: Output,
    cln_token: CancellationToken,
    state: watch::Sender<PartitionState>,
    labels: Vec<(String, String)>,
}

impl PartitionManager {
    /// Creates a manager for `partition`. It stops when [`PartitionHandle::interrupt`] is called
    /// or when `parent_token` is cancelled.
    pub fn new(
        partition: PartitionId,
        coordinator: Arc<dyn OwnershipCoordinator>,
        offset_store: Arc<dyn OffsetStore>,
        reader_factory: Arc<dyn ReaderFactory>,
        config: ManagerConfig,
        output: Output,
        parent_token: &CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(PartitionState::Claiming);
        let labels = partition_labels(&partition);
        Self {
            partition,
            coordinator,
            offset_store,
            reader_factory,
            config,
            output,
            cln_token: parent_token.child_token(),
            state,
            labels,
        }
    }

    /// Starts the run loop in a background task.
    pub fn start(self) -> PartitionHandle {
        let partition = self.partition.clone();
        let cln_token = self.cln_token.clone();
        let state = self.state.subscribe();

        let span = info_span!(
            "partition_manager",
            topic = %partition.topic,
            partition = partition.partition,
            instance = %self.coordinator.instance_id(),
        );
        let task = tokio::spawn(self.run().instrument(span));

        PartitionHandle {
            partition,
            cln_token,
            state,
            task,
        }
    }

    async fn run(self) -> Result<()> {
        // nothing to unwind until the claim is registered
        if let Err(e) = self.claim_partition().await {
            self.set_state(PartitionState::Done);
            return Err(e);
        }

        let stop_renewing = CancellationToken::new();
        let (result, lease_lost) = tokio::join!(
            async {
                let result = self.consume().await;
                stop_renewing.cancel();
                result
            },
            self.keep_lease(&stop_renewing),
        );
        let result = match lease_lost {
            Some(e) => Err(e),
            None => result,
        };

        self.set_state(PartitionState::Unwinding);
        self.release_partition().await;
        self.set_state(PartitionState::Done);

        match &result {
            Ok(()) | Err(Error::Cancelled) => debug!("Partition manager stopped"),
            Err(e) => error!(?e, "Partition manager failed"),
        }
        result
    }

    /// Resolves the start offset, attaches a reader and relays until interrupted. The reader is
    /// always closed before returning.
    async fn consume(&self) -> Result<()> {
        self.set_state(PartitionState::ResolvingOffset);
        let start = self.fetch_start_offset().await?;

        self.set_state(PartitionState::AttachingReader);
        let mut reader = self.start_reader(start).await?;

        self.set_state(PartitionState::Relaying);
        let result = self.relay(reader.as_mut()).await;

        self.set_state(PartitionState::Unwinding);
        self.close_reader(reader).await;
        result
    }

    fn set_state(&self, state: PartitionState) {
        self.state.send_replace(state);
    }

    /// Retries `op` with the configured backoff while it fails with a retryable error, until
    /// the manager is interrupted.
    async fn with_retry<T, F, Fut>(&self, phase: Phase, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let labels = &self.labels;
        let condition = |e: &Error| {
            if !e.is_retryable() {
                return false;
            }
            warn!(?e, phase = phase.as_str(), "Call failed, retrying after backoff");
            manager_metrics()
                .retries_total
                .get_or_create(&phase_labels(labels, phase.as_str()))
                .inc();
            true
        };

        Retry::new(self.config.retry.backoff(), op, condition)
            .with_cancellation(self.cln_token.clone())
            .await
            .map_err(|e| match e {
                RetryError::Cancelled => Error::Cancelled,
                RetryError::Failed(e) => e,
            })
    }

    /// Waits for `delay` unless the manager is interrupted first.
    async fn pause(&self, delay: Option<std::time::Duration>) -> Result<()> {
        let Some(delay) = delay else {
            return Ok(());
        };
        tokio::select! {
            _ = self.cln_token.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Registers this instance as the owner of the partition. Returns `Ok` once the claim is
    /// held, [`Error::Cancelled`] if interrupted first, and [`Error::AlreadyOwner`] if the
    /// claim is found to be held by this very instance already.
    async fn claim_partition(&self) -> Result<()> {
        self.set_state(PartitionState::Claiming);
        info!("Trying to claim partition");

        let instance = self.coordinator.instance_id();
        let mut backoff = self.config.retry.backoff();

        loop {
            let (owner, changed) = self
                .with_retry(Phase::OwnerQuery, move || {
                    self.coordinator.current_owner(&self.partition)
                })
                .await?;

            match owner {
                Some(owner) if &owner == instance => {
                    return Err(Error::AlreadyOwner {
                        partition: self.partition.clone(),
                        instance: owner,
                    });
                }
                Some(owner) => {
                    info!(%owner, "Partition is claimed by another instance, waiting for it to be released");
                    let change = tokio::select! {
                        change = changed => change,
                        _ = self.cln_token.cancelled() => return Err(Error::Cancelled),
                    };
                    if change == OwnershipChange::Lost {
                        warn!("Stopped watching the owner of the partition, looking again after backoff");
                        manager_metrics()
                            .retries_total
                            .get_or_create(&phase_labels(&self.labels, Phase::OwnerQuery.as_str()))
                            .inc();
                        self.pause(backoff.next()).await?;
                    }
                }
                None => {
                    drop(changed);
                    if self.cln_token.is_cancelled() {
                        return Err(Error::Cancelled);
                    }

                    match self.coordinator.claim(&self.partition).await {
                        Ok(()) => {
                            info!("Claimed partition");
                            let metrics = manager_metrics();
                            metrics.claims_total.get_or_create(&self.labels).inc();
                            metrics.owned.get_or_create(&self.labels).set(1);
                            return Ok(());
                        }
                        Err(e) => {
                            // lost the race or the coordinator failed, look again who owns it
                            warn!(?e, "Failed to claim partition");
                            manager_metrics()
                                .retries_total
                                .get_or_create(&phase_labels(&self.labels, Phase::Claim.as_str()))
                                .inc();
                            self.pause(backoff.next()).await?;
                        }
                    }
                }
            }
        }
    }

    async fn release_partition(&self) {
        match self.coordinator.release(&self.partition).await {
            Ok(()) => {
                info!("Released partition");
                let metrics = manager_metrics();
                metrics.releases_total.get_or_create(&self.labels).inc();
                metrics.owned.get_or_create(&self.labels).set(0);
            }
            Err(e) => error!(?e, "Failed to release partition"),
        }
    }

    /// Renews the lease on the claim every renew interval until `stop` is cancelled. If the
    /// claim is lost first, the manager is interrupted and the error is returned.
    ///
    /// Transient renewal failures are retried at the next interval for as long as the lease
    /// would still be valid.
    async fn keep_lease(&self, stop: &CancellationToken) -> Option<Error> {
        let lease = self.coordinator.lease();
        let mut renewed_at = Instant::now();
        let mut ticker =
            tokio::time::interval_at(renewed_at + lease.renew_interval, lease.renew_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let lost = loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return None,
                _ = ticker.tick() => {}
            }

            match self.coordinator.renew(&self.partition).await {
                Ok(()) => {
                    renewed_at = Instant::now();
                    debug!("Renewed claim");
                }
                Err(e) if e.is_retryable() && renewed_at.elapsed() < lease.ttl => {
                    warn!(?e, "Failed to renew claim, trying again at the next interval");
                    manager_metrics()
                        .retries_total
                        .get_or_create(&phase_labels(&self.labels, Phase::Renew.as_str()))
                        .inc();
                }
                // others may have taken over by now
                Err(e) if e.is_retryable() => {
                    warn!(?e, "Could not renew claim before the lease ran out");
                    break Error::LeaseLost {
                        partition: self.partition.clone(),
                        instance: self.coordinator.instance_id().clone(),
                    };
                }
                Err(e) => break e,
            }
        };

        error!(?lost, "Lost the claim on the partition, stopping");
        manager_metrics().owned.get_or_create(&self.labels).set(0);
        self.cln_token.cancel();
        Some(lost)
    }

    async fn fetch_start_offset(&self) -> Result<StartOffset> {
        let committed = self
            .with_retry(Phase::FetchOffset, move || {
                self.offset_store.fetch(&self.partition)
            })
            .await?;

        let start = StartOffset::resolve(committed, self.config.initial_offset);
        if committed < 0 {
            info!(%start, "No committed offset, using the initial offset");
        } else {
            debug!(committed, "Resuming from committed offset");
        }
        Ok(start)
    }

    /// Attaches a reader at `start`. A start offset the log does not hold anymore is replaced by
    /// the initial offset for this and every later attempt.
    async fn start_reader(&self, start: StartOffset) -> Result<Box<dyn PartitionReader>> {
        let current = Mutex::new(start);
        let current = &current;
        let initial = StartOffset::from(self.config.initial_offset);

        let (reader, start) = self
            .with_retry(Phase::AttachReader, move || async move {
                loop {
                    let start = *current.lock();
                    match self.reader_factory.attach(&self.partition, start).await {
                        Ok(reader) => return Ok((reader, start)),
                        // the initial offset is always in range, a second miss is the log's fault
                        Err(Error::OffsetOutOfRange { offset, .. }) if start != initial => {
                            warn!(
                                offset,
                                fallback = %initial,
                                "Offset is no longer available, trying again from the initial offset"
                            );
                            *current.lock() = initial;
                        }
                        Err(Error::OffsetOutOfRange { partition, offset }) => {
                            return Err(Error::Reader(format!(
                                "Offset {offset} of {partition} out of range when attaching at {start}"
                            )));
                        }
                        Err(e) => return Err(e),
                    }
                }
            })
            .await?;

        let mode = match start {
            StartOffset::Newest => {
                info!("Started reader for new records only");
                "newest"
            }
            StartOffset::Oldest => {
                info!("Started reader at the oldest available offset");
                "oldest"
            }
            StartOffset::At(offset) => {
                info!(offset, "Started reader at offset");
                "offset"
            }
        };
        manager_metrics()
            .reader_attach_total
            .get_or_create(&mode_labels(&self.labels, mode))
            .inc();

        Ok(reader)
    }

    async fn close_reader(&self, reader: Box<dyn PartitionReader>) {
        match reader.close().await {
            Ok(()) => debug!("Closed reader"),
            Err(e) => error!(?e, "Failed to close reader"),
        }
    }

    /// Forwards records and errors until interrupted. Returns `Ok` when there is nothing left
    /// to relay, because both reader streams ended or the output is gone.
    async fn relay(&self, reader: &mut dyn PartitionReader) -> Result<()> {
        let (records, errors) = reader.streams();
        let mut records_done = false;
        let mut errors_done = false;
        let metrics = manager_metrics();

        loop {
            if records_done && errors_done {
                info!("Reader streams ended, stopping relay");
                return Ok(());
            }

            tokio::select! {
                biased;
                _ = self.cln_token.cancelled() => return Err(Error::Cancelled),
                record = records.next(), if !records_done => match record {
                    Some(record) => {
                        if !self.forward(&self.output.records, record).await? {
                            return Ok(());
                        }
                        metrics.records_relayed_total.get_or_create(&self.labels).inc();
                    }
                    None => records_done = true,
                },
                error = errors.next(), if !errors_done => match error {
                    Some(error) => {
                        if !self.forward(&self.output.errors, error).await? {
                            return Ok(());
                        }
                        metrics.errors_relayed_total.get_or_create(&self.labels).inc();
                    }
                    None => errors_done = true,
                },
            }
        }
    }

    /// Sends `item` downstream. Returns `false` if the receiving side is gone.
    async fn forward<T>(&self, tx: &mpsc::Sender<T>, item: T) -> Result<bool> {
        tokio::select! {
            biased;
            _ = self.cln_token.cancelled() => Err(Error::Cancelled),
            sent = tx.send(item) => match sent {
                Ok(()) => Ok(true),
                Err(_) => {
                    warn!("Output channel closed, stopping relay");
                    Ok(false)
                }
            },
        }
    }
}

/// Handle to a running [`PartitionManager`].
pub struct PartitionHandle {
    partition: PartitionId,
    cln_token: CancellationToken,
    state: watch::Receiver<PartitionState>,
    task: JoinHandle<Result<()>>,
}

impl PartitionHandle {
    pub fn partition(&self) -> &PartitionId {
        &self.partition
    }

    /// Asks the manager to stop and returns immediately.
    pub fn interrupt(&self) {
        self.cln_token.cancel();
    }

    /// Asks the manager to stop and waits until it has closed its reader and released its
    /// claim. Returns the error that stopped the manager, if it failed before being asked.
    pub async fn close(self) -> Result<()> {
        self.interrupt();
        self.wait().await
    }

    /// Waits for the manager to stop on its own. Being interrupted is not a failure.
    pub async fn wait(self) -> Result<()> {
        match self.task.await {
            Ok(Ok(())) | Ok(Err(Error::Cancelled)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(Error::Task(format!(
                "Partition manager for {} did not complete: {e}",
                self.partition
            ))),
        }
    }

    pub fn state(&self) -> PartitionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<PartitionState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
