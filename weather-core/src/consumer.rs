//! Queue consumer: subscribe, process one message at a time, recover after
//! the broker drops the connection.

use futures::StreamExt;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    model::WeatherRequest,
    processor::{IngestionProcessor, ProcessError},
    queue::{ConnectionError, Delivery, DeliveryStream, Disposition, QueueConnection, QueueSession},
    validate::{ValidationError, validate},
};

/// Unsettled deliveries the broker may hand us at once.
pub const PREFETCH: u16 = 1;

/// Bytes of an unparsable body echoed into the log.
const BODY_EXCERPT: usize = 200;

/// Why a single message could not be ingested.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message body is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl MessageError {
    /// The weather API failed in a way a later attempt could get past.
    pub fn is_transient(&self) -> bool {
        matches!(self, MessageError::Process(ProcessError::Provider(e)) if e.is_transient())
    }
}

/// What to do with a message whose processing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Reject without requeue. The message is gone.
    #[default]
    Never,
    /// Requeue a transient failure once; a second failure is rejected for good.
    RequeueTransientOnce,
}

impl RetryPolicy {
    pub fn requeue(&self, err: &MessageError, redelivered: bool) -> bool {
        match self {
            RetryPolicy::Never => false,
            RetryPolicy::RequeueTransientOnce => err.is_transient() && !redelivered,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub exchange: String,
    pub queue: String,
    pub consumer_tag: String,
    pub reconnect_delay: Duration,
    pub retry: RetryPolicy,
}

impl ConsumerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            exchange: config.broker.exchange.clone(),
            queue: config.broker.queue.clone(),
            consumer_tag: config.consumer.consumer_tag.clone(),
            reconnect_delay: config.consumer.reconnect_delay(),
            retry: if config.consumer.requeue_transient {
                RetryPolicy::RequeueTransientOnce
            } else {
                RetryPolicy::Never
            },
        }
    }
}

/// Parse and validate one message body.
pub fn decode(body: &[u8]) -> Result<WeatherRequest, MessageError> {
    let value: Value = serde_json::from_slice(body)?;
    debug!(payload = %value, "Received message");
    Ok(validate(&value)?)
}

enum DrainEnd {
    Shutdown,
    ConnectionLost,
}

/// Long-running subscriber feeding deliveries to an [`IngestionProcessor`].
pub struct ConsumerLoop {
    connection: Arc<dyn QueueConnection>,
    processor: Arc<IngestionProcessor>,
    settings: ConsumerSettings,
}

impl ConsumerLoop {
    pub fn new(
        connection: Arc<dyn QueueConnection>,
        processor: Arc<IngestionProcessor>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            connection,
            processor,
            settings,
        }
    }

    /// Consume until `shutdown` fires.
    ///
    /// A failure to subscribe on the very first attempt is returned to the
    /// caller. After that, every loss of the connection is followed by one
    /// cooldown of `reconnect_delay` and a fresh subscription, indefinitely.
    /// A message being processed when shutdown fires is finished and settled
    /// before the connection is closed. A subscription still being set up is
    /// abandoned.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ConnectionError> {
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        self.connection.on_close(Box::new(move || {
            let _ = closed_tx.send(());
        }));

        let mut first_attempt = true;
        loop {
            // Close reports from a previous connection are already handled.
            while closed_rx.try_recv().is_ok() {}

            let subscription = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.subscribe() => result,
            };
            match subscription {
                Ok((_session, deliveries)) => {
                    first_attempt = false;
                    info!(
                        exchange = %self.settings.exchange,
                        queue = %self.settings.queue,
                        "Consumer started, listening for marine weather requests"
                    );
                    match self.drain(deliveries, &mut closed_rx, &shutdown).await {
                        DrainEnd::Shutdown => break,
                        DrainEnd::ConnectionLost => {
                            warn!(state = %self.connection.state(), "Lost connection to broker");
                        }
                    }
                }
                Err(e) if first_attempt => {
                    error!(error = %e, "Failed to start consumer");
                    return Err(e);
                }
                Err(e) => error!(error = %e, "Failed to restart consumer"),
            }

            info!(
                delay_secs = self.settings.reconnect_delay.as_secs(),
                "Waiting before restarting queue bind"
            );
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
            }
            info!("Restarting queue bind after connection close");
        }

        info!("Consumer stopping");
        if let Err(e) = self.connection.close().await {
            warn!(error = %e, "Error while closing broker connection");
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<(Box<dyn QueueSession>, DeliveryStream), ConnectionError> {
        let s = &self.settings;
        let mut session = self.connection.connect().await?;
        session.declare_fanout(&s.exchange).await?;
        session.declare_queue(&s.queue).await?;
        session.bind(&s.queue, &s.exchange).await?;
        session.set_prefetch(PREFETCH).await?;
        let deliveries = session.consume(&s.queue, &s.consumer_tag).await?;
        Ok((session, deliveries))
    }

    async fn drain(
        &self,
        mut deliveries: DeliveryStream,
        closed: &mut mpsc::UnboundedReceiver<()>,
        shutdown: &CancellationToken,
    ) -> DrainEnd {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return DrainEnd::Shutdown,
                Some(()) = closed.recv() => return DrainEnd::ConnectionLost,
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        self.handle(delivery).await;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Delivery stream failed");
                        return DrainEnd::ConnectionLost;
                    }
                    None => return DrainEnd::ConnectionLost,
                },
            }
        }
    }

    /// Process one delivery and settle it. Returns how it was settled.
    pub async fn handle(&self, delivery: Delivery) -> Disposition {
        let redelivered = delivery.redelivered();
        let disposition = match self.ingest(delivery.body()).await {
            Ok(request) => {
                info!(
                    asset_id = %request.asset_id,
                    date = %request.date_key(),
                    "Message processed"
                );
                Disposition::Ack
            }
            Err((request, err)) => {
                let requeue = self.settings.retry.requeue(&err, redelivered);
                match (&err, request) {
                    (MessageError::Malformed(_), _) => error!(
                        error = %err,
                        body = %excerpt(delivery.body()),
                        "Discarding malformed message"
                    ),
                    (MessageError::Invalid(invalid), _) => error!(
                        fields = ?invalid.fields(),
                        error = %err,
                        "Validation error for message"
                    ),
                    (_, Some(request)) => error!(
                        asset_id = %request.asset_id,
                        date = %request.date_key(),
                        error = %err,
                        requeue,
                        "Error processing message"
                    ),
                    (_, None) => error!(error = %err, requeue, "Error processing message"),
                }
                Disposition::Reject { requeue }
            }
        };

        if let Err(e) = delivery.settle(disposition).await {
            error!(error = %e, ?disposition, "Failed to settle message");
        }
        disposition
    }

    async fn ingest(
        &self,
        body: &[u8],
    ) -> Result<WeatherRequest, (Option<WeatherRequest>, MessageError)> {
        let request = decode(body).map_err(|e| (None, e))?;
        match self.processor.process_and_store(&request).await {
            Ok(_) => Ok(request),
            Err(e) => Err((Some(request), e.into())),
        }
    }
}

fn excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    match text.char_indices().nth(BODY_EXCERPT) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.into_owned(),
    }
}
