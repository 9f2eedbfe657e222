use std::time::Duration;

use async_trait::async_trait;
use rdkafka::{
    ClientConfig,
    producer::{FutureProducer, FutureRecord, Producer},
    util::Timeout,
};
use crate::{
    config::KafkaSinkConfig,
    sink::{DecodedLog, Sink, SinkError},
};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Queue sink producing one JSON message per log, keyed by transaction
/// hash so logs of one transaction land in one partition, in order.
pub struct KafkaSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaSink {
    pub fn new(config: &KafkaSinkConfig) -> Result<Self, SinkError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000");
        if !config.username.is_empty() {
            client_config
                .set("security.protocol", "sasl_plaintext")
                .set("sasl.mechanism", "PLAIN")
                .set("sasl.username", &config.username)
                .set("sasl.password", &config.password);
        }

        let producer = client_config.create().map_err(SinkError::backend)?;
        Ok(Self { producer, topic: config.topic.clone() })
    }
}

#[async_trait]
impl Sink for KafkaSink {
    fn name(&self) -> &str {
        "kafka"
    }

    async fn send(&self, logs: &[DecodedLog]) -> Result<(), SinkError> {
        for entry in logs {
            let payload = serde_json::to_vec(entry)?;
            let key = entry
                .log
                .transaction_hash
                .map(|hash| format!("{hash:#x}"))
                .unwrap_or_default();

            self.producer
                .send(
                    FutureRecord::to(&self.topic).key(&key).payload(&payload),
                    Timeout::After(DELIVERY_TIMEOUT),
                )
                .await
                .map_err(|(e, _)| SinkError::backend(e))?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.producer.flush(Timeout::After(DELIVERY_TIMEOUT)).map_err(SinkError::backend)
    }
}
