use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoPoint;
use crate::models::order::{Order, OrderStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OnlineStatus {
    Online,
    Offline,
    Busy,
}

/// Order work a driver already carries, kept for time-window reasoning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedOrder {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub estimated_duration_min: u32,
    pub passenger_count: u8,
}

impl QueuedOrder {
    pub fn from_order(order: &Order) -> Self {
        Self {
            order_id: order.order_id,
            status: order.status,
            scheduled_at: order.scheduled_at,
            start_at: None,
            end_at: None,
            pickup: order.pickup,
            dropoff: order.dropoff,
            estimated_duration_min: order.estimated_duration_min,
            passenger_count: order.passenger_count,
        }
    }
}

/// Thresholds behind `is_available`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Staleness {
    pub heartbeat: Duration,
    pub update: Duration,
    /// Skip both checks and treat every online driver as available.
    pub lenient: bool,
}

impl Default for Staleness {
    fn default() -> Self {
        Self {
            heartbeat: Duration::seconds(120),
            update: Duration::seconds(300),
            lenient: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverRuntime {
    pub driver_id: Uuid,
    pub online_status: OnlineStatus,
    pub lat: f64,
    pub lng: f64,
    pub heading: f64,
    pub speed: f64,
    pub accuracy: f64,
    pub location_updated_at: DateTime<Utc>,
    pub current_order: Option<QueuedOrder>,
    pub queued_orders: Vec<QueuedOrder>,
    pub max_queue_capacity: u32,
    pub consecutive_rejects: u32,
    pub last_dispatch_at: Option<DateTime<Utc>>,
    pub last_response_at: Option<DateTime<Utc>>,
    pub acceptance_rate: f64,
    pub rating: f64,
    pub experience_level: u32,
    pub vehicle_id: String,
    pub vehicle_category: String,
    pub vehicle_level: u8,
    pub last_heartbeat_at: DateTime<Utc>,
    pub next_available_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl DriverRuntime {
    pub fn location(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }

    pub fn is_online(&self) -> bool {
        self.online_status == OnlineStatus::Online
    }

    pub fn is_available(&self, now: DateTime<Utc>, staleness: &Staleness) -> bool {
        if !self.is_online() {
            return false;
        }
        if staleness.lenient {
            return true;
        }
        now - self.last_heartbeat_at <= staleness.heartbeat
            && now - self.updated_at <= staleness.update
    }

    pub fn total_queue_size(&self) -> u32 {
        self.queued_orders.len() as u32 + u32::from(self.current_order.is_some())
    }

    /// True while one more order still fits under the queue capacity.
    pub fn can_accept_more_orders(&self) -> bool {
        self.max_queue_capacity == 0 || self.total_queue_size() < self.max_queue_capacity
    }

    pub fn carries_order(&self, order_id: Uuid) -> bool {
        self.current_order
            .iter()
            .chain(self.queued_orders.iter())
            .any(|o| o.order_id == order_id)
    }

    /// Current order first, then the queue in arrival order.
    pub fn committed_work(&self) -> impl Iterator<Item = &QueuedOrder> {
        self.current_order.iter().chain(self.queued_orders.iter())
    }
}

/// What a driver app reports when a session starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverProfile {
    pub driver_id: Uuid,
    pub location: GeoPoint,
    pub vehicle_id: String,
    pub vehicle_category: String,
    pub vehicle_level: u8,
    pub rating: f64,
    pub acceptance_rate: f64,
    pub experience_level: u32,
    #[serde(default)]
    pub max_queue_capacity: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LocationUpdate {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub heading: f64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub accuracy: f64,
    pub ts: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(now: DateTime<Utc>) -> DriverRuntime {
        DriverRuntime {
            driver_id: Uuid::from_u128(7),
            online_status: OnlineStatus::Online,
            lat: 0.0,
            lng: 0.0,
            heading: 0.0,
            speed: 0.0,
            accuracy: 5.0,
            location_updated_at: now,
            current_order: None,
            queued_orders: Vec::new(),
            max_queue_capacity: 2,
            consecutive_rejects: 0,
            last_dispatch_at: None,
            last_response_at: None,
            acceptance_rate: 0.9,
            rating: 4.8,
            experience_level: 3,
            vehicle_id: "v-7".to_string(),
            vehicle_category: "standard".to_string(),
            vehicle_level: 1,
            last_heartbeat_at: now,
            next_available_at: None,
            updated_at: now,
            version: 1,
        }
    }

    fn work(id: u128) -> QueuedOrder {
        QueuedOrder {
            order_id: Uuid::from_u128(id),
            status: OrderStatus::Accepted,
            scheduled_at: None,
            start_at: None,
            end_at: None,
            pickup: GeoPoint::new(0.0, 0.0),
            dropoff: GeoPoint::new(0.0, 0.1),
            estimated_duration_min: 10,
            passenger_count: 1,
        }
    }

    #[test]
    fn stale_heartbeat_makes_driver_unavailable() {
        let now = Utc::now();
        let mut driver = runtime(now);
        driver.last_heartbeat_at = now - Duration::seconds(121);

        assert!(!driver.is_available(now, &Staleness::default()));

        let lenient = Staleness {
            lenient: true,
            ..Staleness::default()
        };
        assert!(driver.is_available(now, &lenient));
    }

    #[test]
    fn full_queue_blocks_more_orders() {
        let now = Utc::now();
        let mut driver = runtime(now);
        assert!(driver.can_accept_more_orders());

        driver.current_order = Some(work(1));
        assert!(driver.can_accept_more_orders());

        driver.queued_orders.push(work(2));
        assert_eq!(driver.total_queue_size(), 2);
        assert!(!driver.can_accept_more_orders());

        driver.max_queue_capacity = 0;
        assert!(driver.can_accept_more_orders());
    }

    #[test]
    fn busy_driver_is_not_online() {
        let now = Utc::now();
        let mut driver = runtime(now);
        driver.online_status = OnlineStatus::Busy;
        assert!(!driver.is_online());
        assert!(!driver.is_available(now, &Staleness::default()));
    }
}
