use std::collections::HashMap;

use clap::{Arg, ArgAction, ArgMatches, Command};
use groupconsumer_core::partition::InstanceId;
use groupconsumer_core::{Error, Result};
use groupconsumer_kafka::KafkaConfig;

pub(super) fn root_cli() -> Command {
    Command::new("groupconsumer")
        .about("Consumes the partitions of a topic on behalf of a consumer group")
        .arg_required_else_help(true)
        .arg(
            Arg::new("topic")
                .long("topic")
                .help("Topic to consume")
                .required(true)
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(String)),
        )
        .arg(
            Arg::new("partitions")
                .long("partitions")
                .help("Partitions this instance competes for, e.g. 0,1,2")
                .required(true)
                .num_args(1..)
                .value_delimiter(',')
                .action(ArgAction::Append)
                .value_parser(clap::value_parser!(i32).range(0..)),
        )
        .arg(
            Arg::new("brokers")
                .long("brokers")
                .help("Kafka bootstrap servers")
                .num_args(1..)
                .value_delimiter(',')
                .action(ArgAction::Append)
                .default_value("localhost:9092"),
        )
        .arg(
            Arg::new("group")
                .long("group")
                .help("Name of the consumer group")
                .required(true)
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(String)),
        )
        .arg(
            Arg::new("bucket")
                .long("bucket")
                .help("JetStream KV bucket holding the claims, defaults to <group>-owners"),
        )
        .arg(
            Arg::new("instance-id")
                .long("instance-id")
                .help("Identity of this instance, a random one is generated when omitted"),
        )
        .arg(
            Arg::new("offset-store")
                .long("offset-store")
                .help("Where the committed offsets to resume from are read")
                .value_parser(["kafka", "kv"])
                .default_value("kafka"),
        )
        .arg(
            Arg::new("metrics-port")
                .long("metrics-port")
                .help("Port serving /metrics and /livez")
                .value_parser(clap::value_parser!(u16))
                .default_value("2469"),
        )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OffsetBackend {
    Kafka,
    Kv,
}

/// Everything the binary is told on the command line.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Settings {
    pub(crate) topic: String,
    pub(crate) partitions: Vec<i32>,
    pub(crate) group: String,
    pub(crate) bucket: String,
    pub(crate) instance: InstanceId,
    pub(crate) offsets: OffsetBackend,
    pub(crate) metrics_port: u16,
    pub(crate) kafka: KafkaConfig,
}

impl TryFrom<&ArgMatches> for Settings {
    type Error = Error;

    fn try_from(matches: &ArgMatches) -> Result<Self> {
        let required = |name: &str| {
            matches
                .get_one::<String>(name)
                .cloned()
                .ok_or_else(|| Error::Config(format!("--{name} is required")))
        };

        let topic = required("topic")?;
        let group = required("group")?;

        let mut partitions: Vec<i32> = matches
            .get_many::<i32>("partitions")
            .map(|values| values.copied().collect())
            .unwrap_or_default();
        partitions.sort_unstable();
        partitions.dedup();
        if partitions.is_empty() {
            return Err(Error::Config("at least one partition is required".to_string()));
        }

        let brokers: Vec<String> = matches
            .get_many::<String>("brokers")
            .map(|values| values.cloned().collect())
            .unwrap_or_default();

        let bucket = matches
            .get_one::<String>("bucket")
            .cloned()
            .unwrap_or_else(|| format!("{group}-owners"));

        let instance = matches
            .get_one::<String>("instance-id")
            .map(|id| InstanceId::from(id.as_str()))
            .unwrap_or_else(InstanceId::generate);

        let offsets = match matches.get_one::<String>("offset-store").map(String::as_str) {
            Some("kv") => OffsetBackend::Kv,
            _ => OffsetBackend::Kafka,
        };

        let metrics_port = matches
            .get_one::<u16>("metrics-port")
            .copied()
            .unwrap_or(2469);

        Ok(Self {
            kafka: KafkaConfig {
                brokers,
                consumer_group: group.clone(),
                auth: None,
                tls: None,
                kafka_raw_config: HashMap::new(),
            },
            topic,
            partitions,
            group,
            bucket,
            instance,
            offsets,
            metrics_port,
        })
    }
}
