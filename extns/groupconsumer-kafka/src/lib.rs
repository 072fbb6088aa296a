//! Kafka backed [`groupconsumer_core::reader::ReaderFactory`] and
//! [`groupconsumer_core::offset::OffsetStore`].

use std::collections::HashMap;

use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use tracing::{info, warn};

/// Committed offsets read from the consumer group.
pub mod offset;

/// Readers assigned to a single partition.
pub mod reader;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Kafka - {0}")]
    Kafka(String),

    #[error("{0}")]
    Other(String),
}

/// Represents the authentication method used to connect to Kafka.
#[derive(Debug, Clone, PartialEq)]
pub enum KafkaAuth {
    Sasl {
        mechanism: String,
        username: String,
        password: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsConfig {
    pub insecure_skip_verify: bool,
    pub ca_cert: Option<String>,
    pub client_auth: Option<TlsClientAuthCerts>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsClientAuthCerts {
    pub client_cert: String,
    pub client_cert_private_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaConfig {
    /// The list of Kafka brokers to connect to.
    pub brokers: Vec<String>,
    /// The consumer group the committed offsets belong to.
    pub consumer_group: String,
    pub auth: Option<KafkaAuth>,
    pub tls: Option<TlsConfig>,
    /// Any supported kafka client configuration options from
    /// https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
    pub kafka_raw_config: HashMap<String, String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            consumer_group: "groupconsumer".to_string(),
            auth: None,
            tls: None,
            kafka_raw_config: HashMap::new(),
        }
    }
}

// A context can be used to change the behavior of consumers by adding callbacks
// that will be executed by librdkafka.
pub(crate) struct KafkaContext;

impl ClientContext for KafkaContext {}

impl ConsumerContext for KafkaContext {
    // partitions are assigned explicitly, a rebalance means someone subscribed with our group
    fn pre_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        warn!("Unexpected pre rebalance {:?}", rebalance);
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        warn!("Unexpected post rebalance {:?}", rebalance);
    }
}

pub(crate) type GroupConsumer = StreamConsumer<KafkaContext>;

/// Builds the librdkafka configuration shared by readers and offset stores.
pub(crate) fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        // an explicit start offset is validated against the watermarks before assigning,
        // anything that still falls outside is reported instead of silently skipped
        .set("auto.offset.reset", "error");
    if !config.kafka_raw_config.is_empty() {
        info!(
            "Applying user-specified kafka config: {}",
            config
                .kafka_raw_config
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<String>>()
                .join(", ")
        );
        for (key, value) in &config.kafka_raw_config {
            client_config.set(key, value);
        }
    }
    client_config
        .set("group.id", &config.consumer_group)
        .set("bootstrap.servers", config.brokers.join(","))
        .set("enable.auto.commit", "false")
        .set_log_level(RDKafkaLogLevel::Warning);

    update_auth_config(&mut client_config, config.tls.as_ref(), config.auth.as_ref());
    client_config
}

fn update_auth_config(
    client_config: &mut ClientConfig,
    tls: Option<&TlsConfig>,
    auth: Option<&KafkaAuth>,
) {
    if let Some(KafkaAuth::Sasl {
        mechanism,
        username,
        password,
    }) = auth
    {
        let protocol = if tls.is_some() { "SASL_SSL" } else { "SASL_PLAINTEXT" };
        client_config
            .set("security.protocol", protocol)
            .set("sasl.mechanisms", mechanism)
            .set("sasl.username", username)
            .set("sasl.password", password);
    }

    let Some(tls_config) = tls else {
        return;
    };
    if auth.is_none() {
        client_config.set("security.protocol", "SSL");
    }
    if tls_config.insecure_skip_verify {
        warn!(
            "'insecureSkipVerify' is set to true, certificate validation will not be performed when connecting to Kafka server"
        );
        client_config
            .set("enable.ssl.certificate.verification", "false")
            .set("ssl.endpoint.identification.algorithm", "none");
    }
    if let Some(ca_cert) = &tls_config.ca_cert {
        client_config.set("ssl.ca.pem", ca_cert);
    }
    if let Some(client_auth) = &tls_config.client_auth {
        client_config
            .set("ssl.certificate.pem", &client_auth.client_cert)
            .set("ssl.key.pem", &client_auth.client_cert_private_key);
    }
}

/// Creates a consumer of the group. Partitions are assigned by the caller, the consumer never
/// subscribes.
pub(crate) fn create_consumer(config: &KafkaConfig) -> Result<GroupConsumer> {
    client_config(config)
        .create_with_context(KafkaContext)
        .map_err(|err| Error::Connection {
            server: config.brokers.join(","),
            error: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_defaults() {
        let config = KafkaConfig {
            brokers: vec!["broker-1:9092".to_string(), "broker-2:9092".to_string()],
            consumer_group: "orders-consumers".to_string(),
            ..Default::default()
        };
        let client_config = client_config(&config);

        assert_eq!(
            client_config.get("bootstrap.servers"),
            Some("broker-1:9092,broker-2:9092")
        );
        assert_eq!(client_config.get("group.id"), Some("orders-consumers"));
        assert_eq!(client_config.get("enable.auto.commit"), Some("false"));
        assert_eq!(client_config.get("auto.offset.reset"), Some("error"));
        assert_eq!(client_config.get("security.protocol"), None);
    }

    #[test]
    fn test_raw_config_cannot_override_group() {
        let config = KafkaConfig {
            consumer_group: "orders-consumers".to_string(),
            kafka_raw_config: HashMap::from([
                ("group.id".to_string(), "other".to_string()),
                ("fetch.min.bytes".to_string(), "1024".to_string()),
            ]),
            ..Default::default()
        };
        let client_config = client_config(&config);

        assert_eq!(client_config.get("group.id"), Some("orders-consumers"));
        assert_eq!(client_config.get("fetch.min.bytes"), Some("1024"));
    }

    #[test]
    fn test_sasl_and_tls_config() {
        let config = KafkaConfig {
            auth: Some(KafkaAuth::Sasl {
                mechanism: "SCRAM-SHA-512".to_string(),
                username: "user".to_string(),
                password: "secret".to_string(),
            }),
            tls: Some(TlsConfig {
                insecure_skip_verify: true,
                ca_cert: Some("ca-pem".to_string()),
                client_auth: Some(TlsClientAuthCerts {
                    client_cert: "cert-pem".to_string(),
                    client_cert_private_key: "key-pem".to_string(),
                }),
            }),
            ..Default::default()
        };
        let client_config = client_config(&config);

        assert_eq!(client_config.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(client_config.get("sasl.mechanisms"), Some("SCRAM-SHA-512"));
        assert_eq!(client_config.get("sasl.username"), Some("user"));
        assert_eq!(client_config.get("sasl.password"), Some("secret"));
        assert_eq!(
            client_config.get("enable.ssl.certificate.verification"),
            Some("false")
        );
        assert_eq!(client_config.get("ssl.ca.pem"), Some("ca-pem"));
        assert_eq!(client_config.get("ssl.certificate.pem"), Some("cert-pem"));
        assert_eq!(client_config.get("ssl.key.pem"), Some("key-pem"));
    }

    #[test]
    fn test_sasl_without_tls() {
        let config = KafkaConfig {
            auth: Some(KafkaAuth::Sasl {
                mechanism: "PLAIN".to_string(),
                username: "user".to_string(),
                password: "secret".to_string(),
            }),
            ..Default::default()
        };
        let client_config = client_config(&config);
        assert_eq!(client_config.get("security.protocol"), Some("SASL_PLAINTEXT"));
    }

    #[test]
    fn test_tls_without_sasl() {
        let config = KafkaConfig {
            tls: Some(TlsConfig {
                insecure_skip_verify: false,
                ca_cert: None,
                client_auth: None,
            }),
            ..Default::default()
        };
        let client_config = client_config(&config);
        assert_eq!(client_config.get("security.protocol"), Some("SSL"));
        assert_eq!(client_config.get("ssl.endpoint.identification.algorithm"), None);
    }
}
