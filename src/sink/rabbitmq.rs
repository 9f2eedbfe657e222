use async_trait::async_trait;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
    options::{
        BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
};
use crate::{
    config::RabbitMqSinkConfig,
    sink::{DecodedLog, Sink, SinkError},
};

/// AMQP persistent delivery mode.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Queue sink publishing one persistent JSON message per log to a topic
/// exchange.
pub struct RabbitMqSink {
    connection: Connection,
    channel: Channel,
    exchange: String,
    routing_key: String,
}

impl RabbitMqSink {
    pub async fn connect(config: &RabbitMqSinkConfig) -> Result<Self, SinkError> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(SinkError::backend)?;
        let channel = connection.create_channel().await.map_err(SinkError::backend)?;

        if !config.exchange.is_empty() {
            channel
                .exchange_declare(
                    &config.exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions { durable: config.durable, ..Default::default() },
                    FieldTable::default(),
                )
                .await
                .map_err(SinkError::backend)?;
        }

        if !config.queue.is_empty() {
            channel
                .queue_declare(
                    &config.queue,
                    QueueDeclareOptions { durable: config.durable, ..Default::default() },
                    FieldTable::default(),
                )
                .await
                .map_err(SinkError::backend)?;
            channel
                .queue_bind(
                    &config.queue,
                    &config.exchange,
                    &config.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(SinkError::backend)?;
        }

        Ok(Self {
            connection,
            channel,
            exchange: config.exchange.clone(),
            routing_key: config.routing_key.clone(),
        })
    }
}

#[async_trait]
impl Sink for RabbitMqSink {
    fn name(&self) -> &str {
        "rabbitmq"
    }

    async fn send(&self, logs: &[DecodedLog]) -> Result<(), SinkError> {
        for entry in logs {
            let payload = serde_json::to_vec(entry)?;
            self.channel
                .basic_publish(
                    &self.exchange,
                    &self.routing_key,
                    BasicPublishOptions::default(),
                    &payload,
                    BasicProperties::default()
                        .with_content_type("application/json".into())
                        .with_delivery_mode(DELIVERY_MODE_PERSISTENT),
                )
                .await
                .map_err(SinkError::backend)?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.channel.close(200, "closing").await.map_err(SinkError::backend)?;
        self.connection.close(200, "closing").await.map_err(SinkError::backend)
    }
}
