use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, DispatchResult};
use crate::geo::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Requested,
    Dispatching,
    Accepted,
    Cancelled,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Accepted | OrderStatus::Cancelled | OrderStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    #[default]
    Instant,
    Scheduled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VehicleFilter {
    pub category: Option<String>,
    pub level: Option<u8>,
}

impl VehicleFilter {
    pub fn matches(&self, category: &str, level: u8) -> bool {
        self.category.as_deref().is_none_or(|c| c == category)
            && self.level.is_none_or(|l| l == level)
    }
}

/// The dispatch view of a ride order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub status: OrderStatus,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub passenger_count: u8,
    #[serde(default)]
    pub vehicle_filter: VehicleFilter,
    #[serde(default)]
    pub schedule_type: ScheduleType,
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_duration_min: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl Order {
    pub fn validate(&self) -> DispatchResult<()> {
        if !self.pickup.is_valid() {
            return Err(DispatchError::invalid("pickup coordinates out of range"));
        }
        if !self.dropoff.is_valid() {
            return Err(DispatchError::invalid("dropoff coordinates out of range"));
        }
        if self.passenger_count == 0 {
            return Err(DispatchError::invalid("passenger_count must be > 0"));
        }
        match (self.schedule_type, self.scheduled_at) {
            (ScheduleType::Scheduled, None) => Err(DispatchError::invalid(
                "scheduled orders require scheduled_at",
            )),
            (ScheduleType::Instant, Some(_)) => Err(DispatchError::invalid(
                "instant orders cannot carry scheduled_at",
            )),
            _ => Ok(()),
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.schedule_type == ScheduleType::Scheduled
    }

    pub fn summary(&self) -> OrderSummary {
        OrderSummary {
            order_id: self.order_id,
            pickup: self.pickup,
            dropoff: self.dropoff,
            passenger_count: self.passenger_count,
            schedule_type: self.schedule_type,
            scheduled_at: self.scheduled_at,
        }
    }
}

/// Payload pushed to a driver alongside an offer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderSummary {
    pub order_id: Uuid,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub passenger_count: u8,
    pub schedule_type: ScheduleType,
    pub scheduled_at: Option<DateTime<Utc>>,
}
