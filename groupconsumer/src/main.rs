use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use groupconsumer_core::config::{LeaseConfig, ManagerConfig};
use groupconsumer_core::coordinator::kv::KVCoordinator;
use groupconsumer_core::manager::{Output, PartitionHandle, PartitionManager};
use groupconsumer_core::metrics::start_metrics_server;
use groupconsumer_core::offset::OffsetStore;
use groupconsumer_core::offset::kv::KVOffsetStore;
use groupconsumer_core::partition::PartitionId;
use groupconsumer_kafka::offset::KafkaOffsetStore;
use groupconsumer_kafka::reader::KafkaReaderFactory;
use groupconsumer_shared::jetstream::config::ClientConfig;
use groupconsumer_shared::jetstream::{create_js_context, get_or_create_bucket};
use groupconsumer_shared::kv::jetstream::JetstreamKVStore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cmdline::{OffsetBackend, Settings};

mod cmdline;
mod setup_tracing;
mod sink;

const OUTPUT_CHANNEL_SIZE: usize = 1000;
const OFFSET_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let matches = cmdline::root_cli().get_matches();
    let settings = Settings::try_from(&matches)?;
    let env_vars: HashMap<String, String> = env::vars().collect();
    let manager_config = ManagerConfig::try_from(env_vars.clone())?;
    let lease = LeaseConfig::try_from(env_vars.clone())?;
    let js_config = ClientConfig::load(&env_vars)?;

    info!(
        topic = %settings.topic,
        partitions = ?settings.partitions,
        group = %settings.group,
        instance = %settings.instance,
        ?manager_config,
        ?lease,
        "Starting consumer group member"
    );

    let cln_token = CancellationToken::new();
    let shutdown_token = cln_token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(?e, "Failed to listen for ctrl-c");
            return;
        }
        info!("Received ctrl-c, shutting down");
        shutdown_token.cancel();
    });

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], settings.metrics_port));
    let metrics_server = tokio::spawn(start_metrics_server(metrics_addr, cln_token.clone()));

    let js_context = create_js_context(js_config).await?;
    let bucket = match get_or_create_bucket(&js_context, &settings.bucket, cln_token.clone()).await
    {
        Ok(bucket) => bucket,
        Err(groupconsumer_shared::error::Error::Cancelled) => {
            info!("Cancelled before the kv bucket was opened");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let kv = Arc::new(JetstreamKVStore::new(bucket, settings.bucket.clone()));

    let coordinator = Arc::new(KVCoordinator::new(
        Arc::<JetstreamKVStore>::clone(&kv),
        settings.instance.clone(),
        lease,
    ));
    let offset_store: Arc<dyn OffsetStore> = match settings.offsets {
        OffsetBackend::Kafka => Arc::new(KafkaOffsetStore::new(
            &settings.kafka,
            OFFSET_FETCH_TIMEOUT,
        )?),
        OffsetBackend::Kv => Arc::new(KVOffsetStore::new(kv)),
    };
    let reader_factory = Arc::new(KafkaReaderFactory::new(settings.kafka.clone()));

    let (records_tx, records_rx) = mpsc::channel(OUTPUT_CHANNEL_SIZE);
    let (errors_tx, errors_rx) = mpsc::channel(OUTPUT_CHANNEL_SIZE);
    let output = Output {
        records: records_tx,
        errors: errors_tx,
    };

    let handles: Vec<PartitionHandle> = settings
        .partitions
        .iter()
        .map(|&partition| {
            PartitionManager::new(
                PartitionId::new(settings.topic.clone(), partition),
                Arc::<KVCoordinator>::clone(&coordinator),
                Arc::clone(&offset_store),
                Arc::<KafkaReaderFactory>::clone(&reader_factory),
                manager_config.clone(),
                output.clone(),
                &cln_token,
            )
            .start()
        })
        .collect();
    // the drain ends once the last manager drops its output
    drop(output);

    let drain = tokio::spawn(sink::drain(records_rx, errors_rx));

    let results = futures::future::join_all(handles.into_iter().map(|handle| async move {
        let partition = handle.partition().clone();
        (partition, handle.wait().await)
    }))
    .await;

    let mut failures = 0;
    for (partition, result) in results {
        match result {
            Ok(()) => info!(%partition, "Partition manager stopped"),
            Err(e) => {
                failures += 1;
                error!(%partition, ?e, "Partition manager failed");
            }
        }
    }

    cln_token.cancel();
    let stats = drain.await?;
    info!(records = stats.records, errors = stats.errors, "Drained partition managers");
    metrics_server.await??;

    if failures > 0 {
        return Err(format!("{failures} partition manager(s) failed").into());
    }
    Ok(())
}
