//! Kafka backend built on rdkafka.
//!
//! librdkafka connects lazily, so `connect` forces a metadata round trip
//! to prove the cluster is reachable within the connection timeout.
//! Metadata and group queries are blocking calls and run on the blocking
//! pool.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use murmur_shared::constants::{MAX_RECORD_BYTES, RECORD_QUEUE_DEPTH};
use murmur_shared::GroupState;

use super::{BrokerRecord, BrokerResult, BrokerTransport, ClientChannel};
use crate::config::GatewayConfig;
use crate::error::BrokerError;

#[derive(Default)]
struct Clients {
    producer: Option<FutureProducer>,
    consumer: Option<Arc<StreamConsumer>>,
    admin: Option<Arc<AdminClient<DefaultClientContext>>>,
    pump: Option<JoinHandle<()>>,
}

/// A Kafka connection set for one chat session.
pub struct KafkaTransport {
    brokers: String,
    client_id: String,
    connection_timeout: Duration,
    request_timeout: Duration,
    clients: Mutex<Clients>,
}

impl KafkaTransport {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            brokers: config.brokers.clone(),
            client_id: config.client_id.clone(),
            connection_timeout: config.connection_timeout,
            request_timeout: config.request_timeout,
            clients: Mutex::new(Clients::default()),
        }
    }

    fn clients(&self) -> MutexGuard<'_, Clients> {
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("client.id", &self.client_id)
            .set(
                "socket.connection.setup.timeout.ms",
                self.connection_timeout.as_millis().to_string(),
            );
        config
    }

    fn producer(&self) -> BrokerResult<FutureProducer> {
        self.clients()
            .producer
            .clone()
            .ok_or(BrokerError::NotConnected)
    }

    fn consumer(&self) -> BrokerResult<Arc<StreamConsumer>> {
        self.clients()
            .consumer
            .clone()
            .ok_or(BrokerError::NotConnected)
    }

    fn admin(&self) -> BrokerResult<Arc<AdminClient<DefaultClientContext>>> {
        self.clients()
            .admin
            .clone()
            .ok_or(BrokerError::NotConnected)
    }

    async fn fetch_group_list(
        &self,
        group: Option<String>,
    ) -> BrokerResult<Vec<(String, GroupState)>> {
        let admin = self.admin()?;
        let timeout = self.request_timeout;

        tokio::task::spawn_blocking(move || {
            let list = admin
                .inner()
                .fetch_group_list(group.as_deref(), Timeout::After(timeout))
                .map_err(backend)?;
            Ok(list
                .groups()
                .iter()
                .map(|g| (g.name().to_string(), GroupState::parse(g.state())))
                .collect())
        })
        .await
        .map_err(|e| BrokerError::Backend(format!("group query task failed: {e}")))?
    }
}

fn backend(e: KafkaError) -> BrokerError {
    BrokerError::Backend(e.to_string())
}

#[async_trait]
impl BrokerTransport for KafkaTransport {
    async fn connect(&self, group_id: &str) -> BrokerResult<()> {
        let producer: FutureProducer = self
            .base_config()
            .set("message.timeout.ms", self.request_timeout.as_millis().to_string())
            .set("message.max.bytes", MAX_RECORD_BYTES.to_string())
            .create()
            .map_err(backend)?;

        let consumer: StreamConsumer = self
            .base_config()
            .set("group.id", group_id)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .create()
            .map_err(backend)?;

        let admin: AdminClient<DefaultClientContext> =
            self.base_config().create().map_err(backend)?;

        // Prove reachability before handing out the clients.
        let reachability = producer.clone();
        let timeout = self.connection_timeout;
        tokio::task::spawn_blocking(move || {
            reachability
                .client()
                .fetch_metadata(None, Timeout::After(timeout))
                .map(|_| ())
        })
        .await
        .map_err(|e| BrokerError::Backend(format!("metadata fetch task failed: {e}")))?
        .map_err(|e| BrokerError::Unreachable(e.to_string()))?;

        let mut clients = self.clients();
        clients.producer = Some(producer);
        clients.consumer = Some(Arc::new(consumer));
        clients.admin = Some(Arc::new(admin));

        info!(brokers = %self.brokers, group = %group_id, "Kafka clients connected");
        Ok(())
    }

    async fn create_topics(&self, topics: &[&str]) -> BrokerResult<()> {
        let admin = self.admin()?;
        let new_topics: Vec<NewTopic<'_>> = topics
            .iter()
            .map(|name| NewTopic::new(name, 1, TopicReplication::Fixed(1)))
            .collect();
        let options = AdminOptions::new().operation_timeout(Some(self.request_timeout));

        let results = admin
            .create_topics(&new_topics, &options)
            .await
            .map_err(backend)?;

        for result in results {
            match result {
                Ok(topic) => debug!(topic = %topic, "Topic created"),
                Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %topic, "Topic already exists")
                }
                Err((topic, code)) => {
                    return Err(BrokerError::Backend(format!(
                        "creating topic {topic} failed: {code}"
                    )))
                }
            }
        }
        Ok(())
    }

    async fn send(&self, topic: &str, payload: Vec<u8>) -> BrokerResult<()> {
        let producer = self.producer()?;
        let record: FutureRecord<'_, (), Vec<u8>> = FutureRecord::to(topic).payload(&payload);

        producer
            .send(record, Timeout::After(self.request_timeout))
            .await
            .map(|_| ())
            .map_err(|(e, _)| backend(e))
    }

    async fn subscribe(&self, topics: &[&str]) -> BrokerResult<mpsc::Receiver<BrokerRecord>> {
        let consumer = self.consumer()?;
        consumer.subscribe(topics).map_err(backend)?;

        let (tx, rx) = mpsc::channel(RECORD_QUEUE_DEPTH);
        let pump = tokio::spawn(async move {
            loop {
                let record = match consumer.recv().await {
                    Ok(message) => BrokerRecord {
                        topic: message.topic().to_string(),
                        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                    },
                    Err(e) => {
                        warn!(error = %e, "Kafka consume error");
                        continue;
                    }
                };
                if tx.send(record).await.is_err() {
                    debug!("Record receiver dropped, stopping consumer pump");
                    break;
                }
            }
        });

        if let Some(previous) = self.clients().pump.replace(pump) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn list_groups(&self) -> BrokerResult<Vec<String>> {
        Ok(self
            .fetch_group_list(None)
            .await?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    async fn describe_group(&self, group_id: &str) -> BrokerResult<GroupState> {
        let groups = self.fetch_group_list(Some(group_id.to_string())).await?;
        Ok(groups
            .into_iter()
            .find(|(name, _)| name == group_id)
            .map(|(_, state)| state)
            .unwrap_or(GroupState::Dead))
    }

    async fn disconnect(&self, channel: ClientChannel) -> BrokerResult<()> {
        match channel {
            ClientChannel::Consumer => {
                let (consumer, pump) = {
                    let mut clients = self.clients();
                    (clients.consumer.take(), clients.pump.take())
                };
                if let Some(pump) = pump {
                    pump.abort();
                }
                if let Some(consumer) = consumer {
                    consumer.unsubscribe();
                }
            }
            ClientChannel::Producer => {
                let producer = self.clients().producer.take();
                if let Some(producer) = producer {
                    let timeout = self.request_timeout;
                    tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
                        .await
                        .map_err(|e| BrokerError::Backend(format!("flush task failed: {e}")))?
                        .map_err(backend)?;
                }
            }
            ClientChannel::Admin => {
                self.clients().admin.take();
            }
        }
        Ok(())
    }
}
