//! Fan-in of everything the partition managers relay.

use groupconsumer_core::reader::{ConsumerError, ConsumerRecord};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// What [`drain`] has seen.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DrainStats {
    pub(crate) records: u64,
    pub(crate) errors: u64,
}

/// Logs every relayed record and error. Returns once every manager has dropped its output.
pub(crate) async fn drain(
    mut records: mpsc::Receiver<ConsumerRecord>,
    mut errors: mpsc::Receiver<ConsumerError>,
) -> DrainStats {
    let mut stats = DrainStats::default();
    let (mut records_done, mut errors_done) = (false, false);

    while !(records_done && errors_done) {
        tokio::select! {
            record = records.recv(), if !records_done => match record {
                Some(record) => {
                    stats.records += 1;
                    info!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        size = record.value.len(),
                        "Consumed record"
                    );
                }
                None => records_done = true,
            },
            consumer_error = errors.recv(), if !errors_done => match consumer_error {
                Some(consumer_error) => {
                    stats.errors += 1;
                    warn!(%consumer_error, "Consumer error");
                }
                None => errors_done = true,
            },
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    fn record(partition: i32, offset: i64) -> ConsumerRecord {
        ConsumerRecord {
            topic: "orders".to_string(),
            partition,
            offset,
            key: None,
            value: Bytes::from("payload"),
            headers: vec![],
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_drain_until_outputs_dropped() {
        let (records_tx, records_rx) = mpsc::channel(10);
        let (errors_tx, errors_rx) = mpsc::channel(10);
        let task = tokio::spawn(drain(records_rx, errors_rx));

        records_tx.send(record(0, 4)).await.unwrap();
        records_tx.send(record(0, 5)).await.unwrap();
        records_tx.send(record(1, 0)).await.unwrap();
        errors_tx
            .send(ConsumerError {
                topic: "orders".to_string(),
                partition: 1,
                message: "leader not available".to_string(),
            })
            .await
            .unwrap();

        // a clone held by another manager keeps the drain alive
        let other_records = records_tx.clone();
        drop(records_tx);
        drop(errors_tx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        drop(other_records);
        let stats = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("drain should end once the outputs are dropped")
            .unwrap();
        assert_eq!(
            stats,
            DrainStats {
                records: 3,
                errors: 1
            }
        );
    }
}
