//! AMQP (RabbitMQ) connection.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
    acker::Acker as LapinAcker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{
    Acker, CloseCallback, ConnectionError, ConnectionHooks, ConnectionState, Delivery,
    DeliveryStream, Disposition, QueueConnection, QueueSession,
};
use crate::config::BrokerConfig;

/// Persistent delivery mode for published messages.
const PERSISTENT: u8 = 2;

/// Single shared connection to a RabbitMQ broker.
pub struct AmqpConnection {
    uri: String,
    endpoint: String,
    hooks: ConnectionHooks,
    connection: Mutex<Option<Connection>>,
}

impl AmqpConnection {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            uri: config.uri(),
            endpoint: config.endpoint(),
            hooks: ConnectionHooks::default(),
            connection: Mutex::new(None),
        }
    }

    async fn open_channel(conn: &Connection) -> Result<Channel, ConnectionError> {
        conn.create_channel()
            .await
            .map_err(|e| ConnectionError::operation("create_channel")(e.to_string()))
    }
}

#[async_trait]
impl QueueConnection for AmqpConnection {
    async fn connect(&self) -> Result<Box<dyn QueueSession>, ConnectionError> {
        let mut guard = self.connection.lock().await;

        if let Some(conn) = guard.as_ref() {
            if conn.status().connected() {
                let channel = Self::open_channel(conn).await?;
                return Ok(Box::new(AmqpSession { channel }));
            }
        }

        self.hooks.connecting();
        let conn = match Connection::connect(&self.uri, ConnectionProperties::default()).await {
            Ok(conn) => conn,
            Err(e) => {
                self.hooks.disconnected();
                return Err(ConnectionError::Connect {
                    endpoint: self.endpoint.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let epoch = self.hooks.connected();
        let hooks = self.hooks.clone();
        conn.on_error(move |err| {
            warn!(error = %err, "RabbitMQ connection closed");
            hooks.closed_by_peer(epoch);
        });

        info!(endpoint = %self.endpoint, "Connected to RabbitMQ");

        let channel = Self::open_channel(&conn).await;
        let channel = keep_if_channel_opens(&self.hooks, channel, async {
            conn.close(200, "channel setup failed")
                .await
                .map_err(|e| e.to_string())
        })
        .await?;
        *guard = Some(conn);
        Ok(Box::new(AmqpSession { channel }))
    }

    fn on_close(&self, callback: CloseCallback) {
        self.hooks.register(callback);
    }

    fn state(&self) -> ConnectionState {
        self.hooks.state()
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        let Some(conn) = self.connection.lock().await.take() else {
            return Ok(());
        };

        // Flip the state first so the error listener treats the close as ours.
        self.hooks.disconnected();
        if !conn.status().connected() {
            return Ok(());
        }

        conn.close(200, "shutdown")
            .await
            .map_err(|e| ConnectionError::operation("close")(e.to_string()))?;
        info!(endpoint = %self.endpoint, "RabbitMQ connection closed gracefully");
        Ok(())
    }
}

/// Accept a fresh connection only if its first channel opened. Otherwise
/// mark it down before closing it, so the close is not reported to observers.
async fn keep_if_channel_opens<T>(
    hooks: &ConnectionHooks,
    channel: Result<T, ConnectionError>,
    close: impl Future<Output = Result<(), String>>,
) -> Result<T, ConnectionError> {
    match channel {
        Ok(channel) => Ok(channel),
        Err(e) => {
            hooks.disconnected();
            if let Err(reason) = close.await {
                warn!(error = %reason, "Failed to close RabbitMQ connection after channel error");
            }
            Err(e)
        }
    }
}

struct AmqpSession {
    channel: Channel,
}

#[async_trait]
impl QueueSession for AmqpSession {
    async fn declare_fanout(&mut self, exchange: &str) -> Result<(), ConnectionError> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConnectionError::operation("exchange_declare")(e.to_string()))
    }

    async fn declare_queue(&mut self, queue: &str) -> Result<(), ConnectionError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| ConnectionError::operation("queue_declare")(e.to_string()))
    }

    async fn bind(&mut self, queue: &str, exchange: &str) -> Result<(), ConnectionError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConnectionError::operation("queue_bind")(e.to_string()))
    }

    async fn set_prefetch(&mut self, count: u16) -> Result<(), ConnectionError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| ConnectionError::operation("basic_qos")(e.to_string()))
    }

    async fn consume(
        &mut self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, ConnectionError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    exclusive: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConnectionError::operation("basic_consume")(e.to_string()))?;

        Ok(consumer
            .map(|delivery| match delivery {
                Ok(delivery) => Ok(Delivery::new(
                    delivery.data,
                    delivery.redelivered,
                    Box::new(AmqpAcker(delivery.acker)),
                )),
                Err(e) => Err(ConnectionError::operation("consume")(e.to_string())),
            })
            .boxed())
    }

    async fn publish(&mut self, exchange: &str, body: &[u8]) -> Result<(), ConnectionError> {
        self.channel
            .basic_publish(
                exchange,
                "",
                BasicPublishOptions::default(),
                body,
                BasicProperties::default()
                    .with_delivery_mode(PERSISTENT)
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| ConnectionError::operation("basic_publish")(e.to_string()))?
            .await
            .map_err(|e| ConnectionError::operation("publisher_confirm")(e.to_string()))?;
        Ok(())
    }
}

struct AmqpAcker(LapinAcker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn settle(&self, disposition: Disposition) -> Result<(), ConnectionError> {
        match disposition {
            Disposition::Ack => self
                .0
                .ack(BasicAckOptions::default())
                .await
                .map_err(|e| ConnectionError::operation("basic_ack")(e.to_string())),
            Disposition::Reject { requeue } => self
                .0
                .reject(BasicRejectOptions { requeue })
                .await
                .map_err(|e| ConnectionError::operation("basic_reject")(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    #[test]
    fn new_connection_starts_disconnected() {
        let conn = AmqpConnection::new(&BrokerConfig::default());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.endpoint, "amqp://localhost:5672");
    }

    #[tokio::test]
    async fn unreachable_broker_leaves_connection_down() {
        let conn = AmqpConnection::new(&BrokerConfig {
            host: "127.0.0.1".into(),
            port: 1,
            ..BrokerConfig::default()
        });

        assert!(matches!(
            conn.connect().await,
            Err(ConnectionError::Connect { .. })
        ));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn channel_failure_closes_fresh_connection_silently() {
        let hooks = ConnectionHooks::default();
        let notified = Arc::new(AtomicUsize::new(0));
        let n = notified.clone();
        hooks.register(Box::new(move || {
            n.fetch_add(1, Ordering::SeqCst);
        }));
        let epoch = hooks.connected();
        let closed = AtomicBool::new(false);

        let result: Result<(), _> = keep_if_channel_opens(
            &hooks,
            Err(ConnectionError::operation("create_channel")("refused".into())),
            async {
                closed.store(true, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;

        assert!(matches!(result, Err(ConnectionError::Operation { .. })));
        assert_eq!(hooks.state(), ConnectionState::Disconnected);
        assert!(closed.load(Ordering::SeqCst));
        assert!(!hooks.closed_by_peer(epoch));
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn opened_channel_keeps_connection_up() {
        let hooks = ConnectionHooks::default();
        hooks.connected();
        let closed = AtomicBool::new(false);

        let channel = keep_if_channel_opens(&hooks, Ok(7), async {
            closed.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(channel, 7);
        assert_eq!(hooks.state(), ConnectionState::Connected);
        assert!(!closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn close_without_connect_is_a_noop() {
        let conn = AmqpConnection::new(&BrokerConfig::default());
        conn.close().await.expect("first close");
        conn.close().await.expect("second close");
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }
}
