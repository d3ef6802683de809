//! Kafka producer over `rskafka`.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use engine_logging::{engine_debug, engine_info};
use pagestream_core::Compression;
use rskafka::client::partition::{self, PartitionClient, UnknownTopicHandling};
use rskafka::client::{Client, ClientBuilder, Credentials as SaslCredentials, SaslConfig};
use rskafka::record::Record;
use tokio::sync::Mutex;

use crate::publish::{
    partition_index, BrokerMessage, DeliveryReceipt, MessageProducer, ProducerError,
    TransportConfig,
};

pub struct KafkaProducer {
    client: Client,
    compression: partition::Compression,
    partitions: Mutex<HashMap<String, Vec<i32>>>,
    clients: Mutex<HashMap<(String, i32), Arc<PartitionClient>>>,
}

impl KafkaProducer {
    pub async fn connect(config: &TransportConfig) -> Result<Self, ProducerError> {
        let mut builder = ClientBuilder::new(config.brokers.clone())
            .max_message_size(config.tuning.max_request_size);
        if let Some(client_id) = &config.client_id {
            builder = builder.client_id(client_id.clone());
        }
        if let Some(credentials) = &config.credentials {
            builder = builder.sasl_config(SaslConfig::Plain(SaslCredentials::new(
                credentials.username.clone(),
                credentials.password.clone(),
            )));
        }
        if config.use_tls {
            builder = builder.tls_config(Arc::new(tls_config()?));
        }

        let client = builder
            .build()
            .await
            .map_err(|err| ProducerError::fatal(format!("connecting to {:?}: {err}", config.brokers)))?;
        engine_info!("connected to brokers {:?}", config.brokers);

        Ok(Self {
            client,
            compression: compression(config.tuning.compression),
            partitions: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
        })
    }

    async fn partition_for(&self, topic: &str, key: &str) -> Result<(i32, Arc<PartitionClient>), ProducerError> {
        let ids = {
            let mut known = self.partitions.lock().await;
            match known.get(topic) {
                Some(ids) => ids.clone(),
                None => {
                    let topics = self
                        .client
                        .list_topics()
                        .await
                        .map_err(|err| ProducerError::retryable(err.to_string()))?;
                    let ids: Vec<i32> = topics
                        .into_iter()
                        .find(|t| t.name == topic)
                        .map(|t| t.partitions.into_iter().collect())
                        .unwrap_or_default();
                    if ids.is_empty() {
                        return Err(ProducerError::fatal(format!("topic {topic} does not exist")));
                    }
                    known.insert(topic.to_string(), ids.clone());
                    ids
                }
            }
        };
        let partition = ids[partition_index(key, ids.len())];

        let mut clients = self.clients.lock().await;
        let slot = (topic.to_string(), partition);
        if let Some(client) = clients.get(&slot) {
            return Ok((partition, Arc::clone(client)));
        }
        let client = self
            .client
            .partition_client(topic.to_string(), partition, UnknownTopicHandling::Retry)
            .await
            .map_err(|err| ProducerError::retryable(err.to_string()))?;
        let client = Arc::new(client);
        clients.insert(slot, Arc::clone(&client));
        Ok((partition, client))
    }
}

#[async_trait::async_trait]
impl MessageProducer for KafkaProducer {
    async fn send(&self, topic: &str, message: &BrokerMessage) -> Result<DeliveryReceipt, ProducerError> {
        let (partition, client) = self.partition_for(topic, &message.key).await?;
        let headers: BTreeMap<String, Vec<u8>> = message
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone().into_bytes()))
            .collect();
        let record = Record {
            key: Some(message.key.clone().into_bytes()),
            value: Some(message.value.clone()),
            headers,
            timestamp: Utc::now(),
        };

        let offsets = client
            .produce(vec![record], self.compression)
            .await
            .map_err(|err| ProducerError::retryable(err.to_string()))?;
        let offset = offsets
            .first()
            .copied()
            .ok_or_else(|| ProducerError::retryable("broker returned no offset"))?;
        engine_debug!("{} -> {}/{} @ {}", message.key, topic, partition, offset);
        Ok(DeliveryReceipt { partition, offset })
    }

    /// Every produce call already waits for the acknowledgment.
    async fn flush(&self) -> Result<(), ProducerError> {
        Ok(())
    }
}

fn compression(compression: Compression) -> partition::Compression {
    match compression {
        Compression::None => partition::Compression::NoCompression,
        Compression::Gzip => partition::Compression::Gzip,
        Compression::Snappy => partition::Compression::Snappy,
        Compression::Lz4 => partition::Compression::Lz4,
        Compression::Zstd => partition::Compression::Zstd,
    }
}

fn tls_config() -> Result<rustls::ClientConfig, ProducerError> {
    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|err| ProducerError::fatal(format!("tls setup: {err}")))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(config)
}
