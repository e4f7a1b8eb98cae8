//! Kafka producer backed by `rskafka`.
//!
//! Works against Kafka and Kafka-compatible services such as Azure Event Hubs.
//! Messages are produced uncompressed at the protocol level; the payload is
//! already compressed by the sender.
//!
//! Partitions are discovered through a metadata request and cached for
//! `metadata_max_age`; messages are spread over them round-robin. A connection
//! level failure drops the client and emits [`ConnectionEvent::Disconnected`];
//! the next send reconnects and emits [`ConnectionEvent::Connected`].
//!
//! `rskafka` owns its sockets and exposes no keep-alive or no-delay options,
//! so none are set here. Idle connections the broker closes surface as a
//! connection error on the next send and go through the reconnect path.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use rskafka::client::error::Error as KafkaError;
use rskafka::client::partition::{Compression, PartitionClient, UnknownTopicHandling};
use rskafka::client::{Client, ClientBuilder, Credentials, SaslConfig};
use rskafka::record::Record;
use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::{BrokerError, BrokerProducer, ConnectionEvent, EVENT_CHANNEL_CAPACITY};
use crate::config::{BrokerConnectionConfig, SaslMechanism, TlsSettings};

struct TopicPartitions {
    clients: Vec<Arc<PartitionClient>>,
    fetched_at: Instant,
}

struct Connection {
    client: Arc<Client>,
    topics: HashMap<String, TopicPartitions>,
}

pub struct KafkaProducer {
    config: BrokerConnectionConfig,
    tls: Option<Arc<rustls::ClientConfig>>,
    events: broadcast::Sender<ConnectionEvent>,
    connection: Mutex<Option<Connection>>,
    next_partition: AtomicUsize,
}

impl KafkaProducer {
    /// Create a producer. TLS material is loaded here; nothing is connected
    /// until [`BrokerProducer::connect`].
    pub fn new(config: BrokerConnectionConfig) -> Result<Self, BrokerError> {
        let tls = match &config.tls {
            Some(settings) => Some(build_tls_config(settings)?),
            None => None,
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            tls,
            events,
            connection: Mutex::new(None),
            next_partition: AtomicUsize::new(0),
        })
    }

    async fn build_client(&self) -> Result<Client, BrokerError> {
        let mut builder = ClientBuilder::new(vec![self.config.broker.clone()])
            .client_id(self.config.client_id.clone());

        if let Some(tls) = &self.tls {
            // rustls only sends SNI for DNS names, never for literal IPs
            debug!(server_name = ?self.config.tls_server_name(), "Using TLS");
            builder = builder.tls_config(Arc::clone(tls));
        }

        if let Some(sasl) = &self.config.sasl {
            let credentials = Credentials::new(sasl.username.clone(), sasl.password.clone());
            builder = builder.sasl_config(match sasl.mechanism {
                SaslMechanism::Plain => SaslConfig::Plain(credentials),
                SaslMechanism::ScramSha256 => SaslConfig::ScramSha256(credentials),
                SaslMechanism::ScramSha512 => SaslConfig::ScramSha512(credentials),
            });
        }

        match timeout(self.config.connection_timeout, builder.build()).await {
            Ok(Ok(client)) => Ok(client),
            Ok(Err(e)) => Err(classify(e)),
            Err(_) => Err(BrokerError::Timeout(self.config.connection_timeout)),
        }
    }

    async fn partition_for(
        &self,
        connection: &mut Connection,
        topic: &str,
    ) -> Result<Arc<PartitionClient>, BrokerError> {
        let stale = connection
            .topics
            .get(topic)
            .map(|t| t.fetched_at.elapsed() >= self.config.metadata_max_age || t.clients.is_empty())
            .unwrap_or(true);

        if stale {
            let topics = timeout(self.config.request_timeout, connection.client.list_topics())
                .await
                .map_err(|_| BrokerError::Timeout(self.config.request_timeout))?
                .map_err(classify)?;

            let partitions: Vec<i32> = topics
                .into_iter()
                .find(|t| t.name == topic)
                .map(|t| t.partitions.into_keys().collect())
                .ok_or_else(|| BrokerError::Rejected {
                    code: 3, // UNKNOWN_TOPIC_OR_PARTITION
                    message: format!("topic {} does not exist", topic),
                })?;

            let mut clients = Vec::with_capacity(partitions.len());
            for partition in partitions {
                let client = connection
                    .client
                    .partition_client(topic.to_string(), partition, UnknownTopicHandling::Retry)
                    .await
                    .map_err(classify)?;
                clients.push(Arc::new(client));
            }
            debug!(topic, partitions = clients.len(), "Refreshed topic partitions");

            connection.topics.insert(
                topic.to_string(),
                TopicPartitions {
                    clients,
                    fetched_at: Instant::now(),
                },
            );
        }

        let clients = connection
            .topics
            .get(topic)
            .map(|t| t.clients.as_slice())
            .unwrap_or_default();
        if clients.is_empty() {
            return Err(BrokerError::Rejected {
                code: 3,
                message: format!("topic {} has no partitions", topic),
            });
        }
        let index = self.next_partition.fetch_add(1, Ordering::Relaxed) % clients.len();
        Ok(Arc::clone(&clients[index]))
    }

    async fn mark_disconnected(&self) {
        if self.connection.lock().await.take().is_some() {
            warn!(broker = %self.config.broker, "Broker connection lost");
            let _ = self.events.send(ConnectionEvent::Disconnected);
        }
    }
}

#[async_trait]
impl BrokerProducer for KafkaProducer {
    async fn connect(&self) -> Result<(), BrokerError> {
        let mut connection = self.connection.lock().await;
        if connection.is_some() {
            return Ok(());
        }

        let client = self.build_client().await?;
        *connection = Some(Connection {
            client: Arc::new(client),
            topics: HashMap::new(),
        });
        info!(broker = %self.config.broker, client_id = %self.config.client_id, "Connected to broker");
        let _ = self.events.send(ConnectionEvent::Connected);
        Ok(())
    }

    async fn send(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        if self.connection.lock().await.is_none() {
            self.connect().await?;
        }

        let partition = {
            let mut guard = self.connection.lock().await;
            let connection = guard.as_mut().ok_or(BrokerError::Disconnected)?;
            self.partition_for(connection, topic).await
        };
        let partition = match partition {
            Ok(partition) => partition,
            Err(e) => {
                if matches!(e, BrokerError::Connection(_)) {
                    self.mark_disconnected().await;
                }
                return Err(e);
            }
        };

        let record = Record {
            key: None,
            value: Some(payload.to_vec()),
            headers: BTreeMap::new(),
            timestamp: Utc::now(),
        };

        let result = timeout(
            self.config.request_timeout,
            partition.produce(vec![record], Compression::NoCompression),
        )
        .await;

        match result {
            Ok(Ok(_offsets)) => Ok(()),
            Ok(Err(e)) => {
                let err = classify(e);
                if matches!(err, BrokerError::Connection(_)) {
                    self.mark_disconnected().await;
                }
                Err(err)
            }
            Err(_) => {
                info!(topic, "Broker producer: request timeout");
                Err(BrokerError::Timeout(self.config.request_timeout))
            }
        }
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.mark_disconnected().await;
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

fn classify(error: KafkaError) -> BrokerError {
    match error {
        KafkaError::ServerError {
            protocol_error,
            error_message,
            ..
        } => {
            let message = error_message.unwrap_or_else(|| format!("{:?}", protocol_error));
            let name = format!("{:?}", protocol_error);
            if name.contains("MessageTooLarge") || name.contains("RecordListTooLarge") {
                BrokerError::MessageTooLarge { size: 0, limit: 0 }
            } else if name.contains("Sasl") || name.contains("Authorization") {
                BrokerError::Authentication(message)
            } else {
                BrokerError::Rejected { code: -1, message }
            }
        }
        other => {
            let message = other.to_string();
            if message.to_ascii_lowercase().contains("sasl") {
                BrokerError::Authentication(message)
            } else {
                BrokerError::Connection(message)
            }
        }
    }
}

fn build_tls_config(settings: &TlsSettings) -> Result<Arc<rustls::ClientConfig>, BrokerError> {
    let mut roots = RootCertStore::empty();

    match &settings.ca_path {
        Some(path) => {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| BrokerError::Connection(format!("Failed to add CA cert: {}", e)))?;
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs();
            for error in &native.errors {
                warn!(error = %error, "Failed to load a native root certificate");
            }
            let (added, ignored) = roots.add_parsable_certificates(native.certs);
            debug!(added, ignored, "Loaded native root certificates");
        }
    }

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| BrokerError::Connection(format!("Failed to build TLS config: {}", e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, BrokerError> {
    let file = File::open(path).map_err(|e| {
        BrokerError::Connection(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .filter_map(|result| result.ok())
        .collect();

    if certs.is_empty() {
        return Err(BrokerError::Connection(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}
