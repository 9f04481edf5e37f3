//! Offer Notifier port. Delivery is best-effort: the engine bounds every call
//! with the send timeout and only counts failures.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::order::OrderSummary;
use crate::observability::Metrics;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum NotifyError {
    #[error("notification timed out after {0:?}")]
    Timeout(Duration),

    #[error("recipient unreachable: {0}")]
    Unreachable(Uuid),

    #[error("delivery failed: {0}")]
    Delivery(String),
}

impl NotifyError {
    pub fn kind(&self) -> &'static str {
        match self {
            NotifyError::Timeout(_) => "timeout",
            NotifyError::Unreachable(_) => "unreachable",
            NotifyError::Delivery(_) => "delivery",
        }
    }
}

#[async_trait]
pub trait OfferNotifier: Send + Sync {
    async fn offer(
        &self,
        driver_id: Uuid,
        order: &OrderSummary,
        price_multiplier: f64,
        expires_at: DateTime<Utc>,
    ) -> Result<(), NotifyError>;

    async fn notify_assigned(&self, driver_id: Uuid, order_id: Uuid) -> Result<(), NotifyError>;

    async fn notify_superseded(&self, driver_id: Uuid, order_id: Uuid) -> Result<(), NotifyError>;

    async fn notify_exhausted(&self, user_id: Uuid, order_id: Uuid) -> Result<(), NotifyError>;

    async fn notify_cancelled(
        &self,
        recipients: &[Uuid],
        order_id: Uuid,
        reason: &str,
    ) -> Result<(), NotifyError>;
}

/// Everything the engine tells the outside world, as published on `/ws`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    Offer {
        driver_id: Uuid,
        order: OrderSummary,
        price_multiplier: f64,
        expires_at: DateTime<Utc>,
    },
    Assigned {
        driver_id: Uuid,
        order_id: Uuid,
    },
    Superseded {
        driver_id: Uuid,
        order_id: Uuid,
    },
    Exhausted {
        user_id: Uuid,
        order_id: Uuid,
    },
    Cancelled {
        recipients: Vec<Uuid>,
        order_id: Uuid,
        reason: String,
    },
}

/// Publishes events on a broadcast channel. Having no subscribers is not a
/// failure; drivers pick their offers up again on reconnect.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    events_tx: broadcast::Sender<DispatchEvent>,
}

impl BroadcastNotifier {
    pub fn new(events_tx: broadcast::Sender<DispatchEvent>) -> Self {
        Self { events_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events_tx.subscribe()
    }

    fn publish(&self, event: DispatchEvent) -> Result<(), NotifyError> {
        if self.events_tx.send(event).is_err() {
            debug!("dispatch event dropped: no subscribers");
        }
        Ok(())
    }
}

#[async_trait]
impl OfferNotifier for BroadcastNotifier {
    async fn offer(
        &self,
        driver_id: Uuid,
        order: &OrderSummary,
        price_multiplier: f64,
        expires_at: DateTime<Utc>,
    ) -> Result<(), NotifyError> {
        self.publish(DispatchEvent::Offer {
            driver_id,
            order: order.clone(),
            price_multiplier,
            expires_at,
        })
    }

    async fn notify_assigned(&self, driver_id: Uuid, order_id: Uuid) -> Result<(), NotifyError> {
        self.publish(DispatchEvent::Assigned {
            driver_id,
            order_id,
        })
    }

    async fn notify_superseded(&self, driver_id: Uuid, order_id: Uuid) -> Result<(), NotifyError> {
        self.publish(DispatchEvent::Superseded {
            driver_id,
            order_id,
        })
    }

    async fn notify_exhausted(&self, user_id: Uuid, order_id: Uuid) -> Result<(), NotifyError> {
        self.publish(DispatchEvent::Exhausted { user_id, order_id })
    }

    async fn notify_cancelled(
        &self,
        recipients: &[Uuid],
        order_id: Uuid,
        reason: &str,
    ) -> Result<(), NotifyError> {
        self.publish(DispatchEvent::Cancelled {
            recipients: recipients.to_vec(),
            order_id,
            reason: reason.to_string(),
        })
    }
}

/// Runs one notifier call under `limit`. Failures are logged and counted,
/// never returned.
pub async fn deliver<F>(limit: Duration, metrics: &Metrics, what: &'static str, call: F) -> bool
where
    F: Future<Output = Result<(), NotifyError>>,
{
    let result = match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(NotifyError::Timeout(limit)),
    };

    match result {
        Ok(()) => true,
        Err(err) => {
            metrics
                .notify_failures_total
                .with_label_values(&[err.kind()])
                .inc();
            warn!(notification = what, error = %err, "notification not delivered");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::GeoPoint;
    use crate::models::order::ScheduleType;

    fn summary() -> OrderSummary {
        OrderSummary {
            order_id: Uuid::from_u128(1),
            pickup: GeoPoint::new(52.52, 13.40),
            dropoff: GeoPoint::new(52.50, 13.45),
            passenger_count: 2,
            schedule_type: ScheduleType::Instant,
            scheduled_at: None,
        }
    }

    #[tokio::test]
    async fn broadcast_notifier_publishes_tagged_events() {
        let (tx, _) = broadcast::channel(16);
        let notifier = BroadcastNotifier::new(tx);
        let mut rx = notifier.subscribe();

        let expires_at = Utc::now();
        notifier
            .offer(Uuid::from_u128(9), &summary(), 1.2, expires_at)
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "offer");
        assert_eq!(json["price_multiplier"], 1.2);
        assert_eq!(json["order"]["passenger_count"], 2);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_fine() {
        let (tx, _) = broadcast::channel(16);
        let notifier = BroadcastNotifier::new(tx);

        assert!(
            notifier
                .notify_exhausted(Uuid::from_u128(1), Uuid::from_u128(2))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn slow_delivery_times_out_and_is_counted() {
        let metrics = Metrics::new();
        let delivered = deliver(Duration::from_millis(10), &metrics, "offer", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(!delivered);
        assert_eq!(
            metrics
                .notify_failures_total
                .with_label_values(&["timeout"])
                .get(),
            1
        );
    }
}
