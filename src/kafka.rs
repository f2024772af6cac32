use crate::config::Config;
use crate::feed::{FeedClient, FeedError, FeedPoll};
use crate::record::{Position, Record};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::topic_partition_list::TopicPartitionList;
use std::sync::Arc;
use std::time::Duration;

struct RelayContext;

impl ClientContext for RelayContext {}

impl ConsumerContext for RelayContext {
    fn pre_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                tracing::info!(partitions = tpl.count(), "kafka rebalance: revoking partitions")
            }
            Rebalance::Assign(tpl) => {
                tracing::info!(partitions = tpl.count(), "kafka rebalance: assigning partitions")
            }
            Rebalance::Error(err) => tracing::warn!(error = %err, "kafka rebalance error"),
        }
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        tracing::debug!(?rebalance, "kafka rebalance complete");
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => tracing::debug!(partitions = offsets.count(), "committed consumer offsets"),
            // nothing stored since the last commit
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(err) => tracing::warn!(error = %err, "offset commit failed"),
        }
    }
}

type RelayConsumer = StreamConsumer<RelayContext>;

/// Kafka consumer-group member feeding the relay.
///
/// Offsets are stored explicitly once the writer has persisted or dropped a
/// record, and committed by librdkafka in the background, so a crash never
/// skips a record that was polled but not yet written.
pub struct KafkaFeed {
    consumer: Arc<RelayConsumer>,
    brokers: String,
}

impl KafkaFeed {
    pub fn new(config: &Config) -> Result<Self> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.broker_list)
            .set("group.id", &config.group_id)
            .set("client.id", &config.client_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.partition.eof", "false")
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set_log_level(RDKafkaLogLevel::Warning);

        if let Some(tls) = &config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("ssl.key.location", &tls.key_location)
                .set("ssl.certificate.location", &tls.certificate_location)
                .set("ssl.ca.location", &tls.ca_location);
        }

        let consumer: RelayConsumer = client_config
            .create_with_context(RelayContext)
            .with_context(|| format!("creating kafka consumer for {}", config.broker_list))?;

        Ok(Self {
            consumer: Arc::new(consumer),
            brokers: config.broker_list.clone(),
        })
    }
}

#[async_trait]
impl FeedClient for KafkaFeed {
    async fn subscribe(&self, topic: &str) -> Result<(), FeedError> {
        // librdkafka accepts unknown topics here; they surface later as poll errors
        self.consumer
            .subscribe(&[topic])
            .map_err(|err| FeedError::Subscribe {
                topic: topic.to_string(),
                reason: err.to_string(),
            })?;
        tracing::info!(brokers = %self.brokers, topic, "kafka consumer subscribed");
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> FeedPoll {
        let message = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return FeedPoll::Empty,
            Ok(Err(err)) => return FeedPoll::Error(FeedError::Poll(err.to_string())),
            Ok(Ok(message)) => message,
        };

        FeedPoll::Record(Record {
            payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
            key: message
                .key()
                .map(|key| String::from_utf8_lossy(key).into_owned()),
            position: Position {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
            },
        })
    }

    async fn advance(&self, position: &Position) -> Result<(), FeedError> {
        // the committed offset names the next record to read
        self.consumer
            .store_offset(&position.topic, position.partition, position.offset + 1)
            .map_err(|err| FeedError::Advance {
                position: position.clone(),
                reason: err.to_string(),
            })
    }

    async fn close(&self) {
        // commit while the partitions are still assigned, then leave the group
        let consumer = self.consumer.clone();
        let committed = tokio::task::spawn_blocking(move || {
            let result = consumer.commit_consumer_state(CommitMode::Sync);
            consumer.unsubscribe();
            result
        })
        .await;
        match committed {
            Ok(Ok(())) => tracing::info!(brokers = %self.brokers, "kafka consumer closed"),
            Ok(Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset))) => {
                tracing::info!(brokers = %self.brokers, "kafka consumer closed; nothing to commit")
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, brokers = %self.brokers, "final offset commit failed")
            }
            Err(err) => tracing::warn!(error = %err, "final offset commit task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned()).unwrap()
    }

    // StreamConsumer spawns its wakeup task on the current runtime
    #[tokio::test]
    async fn builds_consumer_without_contacting_brokers() {
        let feed = KafkaFeed::new(&config(&[("KAPG_BROKER_LIST", "127.0.0.1:1")])).unwrap();
        assert_eq!(feed.brokers, "127.0.0.1:1");
    }
}
