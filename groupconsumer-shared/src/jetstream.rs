use std::time::Duration;

use async_nats::ConnectOptions;
use async_nats::jetstream::kv::{Config as KVConfig, Store};
use async_nats::jetstream::{self, Context};
use backoff::retry::{Retry, RetryError};
use backoff::strategy::fixed;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};

const BUCKET_RETRY_INTERVAL_MILLIS: u64 = 1000;

pub async fn create_js_context(config: config::ClientConfig) -> Result<Context> {
    let mut opts = ConnectOptions::new()
        .max_reconnects(None) // unlimited reconnects
        .ping_interval(Duration::from_secs(3))
        .retry_on_initial_connect();

    if let (Some(user), Some(password)) = (config.user, config.password) {
        opts = opts.user_and_password(user, password);
    }

    if config.tls_enabled {
        opts = opts.require_tls(true);
    }

    let js_client = async_nats::connect_with_options(&config.url, opts)
        .await
        .map_err(|e| Error::Connection(e.to_string()))?;

    Ok(jetstream::new(js_client))
}

/// Opens the KV bucket that holds a consumer group's ownership claims and offsets, creating
/// it when it does not exist yet. Retries until it succeeds or `cln_token` is cancelled.
pub async fn get_or_create_bucket(
    js_context: &Context,
    bucket: &str,
    cln_token: CancellationToken,
) -> Result<Store> {
    let interval = fixed::Interval::from_millis(BUCKET_RETRY_INTERVAL_MILLIS);

    let store = Retry::new(
        interval,
        move || async move {
            if let Ok(store) = js_context.get_key_value(bucket).await {
                return Ok(store);
            }
            js_context
                .create_key_value(KVConfig {
                    bucket: bucket.to_string(),
                    history: 1,
                    ..Default::default()
                })
                .await
                .map_err(|e| {
                    warn!(?e, bucket, "Failed to open kv bucket, retrying");
                    Error::Jetstream(format!("Failed to create kv bucket {bucket}: {e}"))
                })
        },
        |_: &Error| true,
    )
    .with_cancellation(cln_token)
    .await
    .map_err(|e| match e {
        RetryError::Cancelled => Error::Cancelled,
        RetryError::Failed(e) => e,
    })?;

    info!(bucket, "Opened consumer group kv bucket");
    Ok(store)
}

/// Build Jetstream client configuration.
pub mod config {
    use std::collections::HashMap;

    use crate::error::{Error, Result};

    const DEFAULT_URL: &str = "localhost:4222";

    const ENV_JETSTREAM_URL: &str = "GROUPCONSUMER_JETSTREAM_URL";
    const ENV_JETSTREAM_USER: &str = "GROUPCONSUMER_JETSTREAM_USER";
    const ENV_JETSTREAM_PASSWORD: &str = "GROUPCONSUMER_JETSTREAM_PASSWORD";
    const ENV_JETSTREAM_TLS_ENABLED: &str = "GROUPCONSUMER_JETSTREAM_TLS_ENABLED";

    /// Jetstream client configuration.
    #[derive(Debug, Clone, PartialEq)]
    pub struct ClientConfig {
        /// NATS server URL.
        pub url: String,
        /// NATS server username.
        pub user: Option<String>,
        /// NATS server password.
        pub password: Option<String>,
        /// Whether to enable TLS.
        pub tls_enabled: bool,
    }

    impl Default for ClientConfig {
        fn default() -> Self {
            ClientConfig {
                url: DEFAULT_URL.to_string(),
                user: None,
                password: None,
                tls_enabled: false,
            }
        }
    }

    impl ClientConfig {
        pub fn load(env_vars: &HashMap<String, String>) -> Result<Self> {
            let get_var = |var: &str| -> Result<String> {
                env_vars
                    .get(var)
                    .cloned()
                    .ok_or_else(|| Error::Config(format!("Environment variable {var} is not set")))
            };

            let tls_enabled = match env_vars.get(ENV_JETSTREAM_TLS_ENABLED) {
                None => false,
                Some(v) => v.parse::<bool>().map_err(|e| {
                    Error::Config(format!("Invalid {ENV_JETSTREAM_TLS_ENABLED} {v:?}: {e}"))
                })?,
            };

            Ok(Self {
                url: get_var(ENV_JETSTREAM_URL)?,
                user: get_var(ENV_JETSTREAM_USER).ok(),
                password: get_var(ENV_JETSTREAM_PASSWORD).ok(),
                tls_enabled,
            })
        }
    }

}
