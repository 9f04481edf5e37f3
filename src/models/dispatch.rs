use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DispatchError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Pending,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl DispatchStatus {
    pub fn is_terminal(self) -> bool {
        self != DispatchStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OfferState {
    Offered,
    Accepted,
    Rejected,
    Timeout,
    Superseded,
}

impl OfferState {
    pub fn is_terminal(self) -> bool {
        self != OfferState::Offered
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    DistanceTooFar,
    PickupLocationIssue,
    DriverBusy,
    TrafficJam,
    BreakTime,
    DestinationUnsafe,
    ShortTrip,
    PaymentMethod,
    WeatherBad,
    VehicleIssue,
    PersonalEmergency,
    Other,
}

impl RejectReason {
    pub const ALL: [RejectReason; 12] = [
        RejectReason::DistanceTooFar,
        RejectReason::PickupLocationIssue,
        RejectReason::DriverBusy,
        RejectReason::TrafficJam,
        RejectReason::BreakTime,
        RejectReason::DestinationUnsafe,
        RejectReason::ShortTrip,
        RejectReason::PaymentMethod,
        RejectReason::WeatherBad,
        RejectReason::VehicleIssue,
        RejectReason::PersonalEmergency,
        RejectReason::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::DistanceTooFar => "distance_too_far",
            RejectReason::PickupLocationIssue => "pickup_location_issue",
            RejectReason::DriverBusy => "driver_busy",
            RejectReason::TrafficJam => "traffic_jam",
            RejectReason::BreakTime => "break_time",
            RejectReason::DestinationUnsafe => "destination_unsafe",
            RejectReason::ShortTrip => "short_trip",
            RejectReason::PaymentMethod => "payment_method",
            RejectReason::WeatherBad => "weather_bad",
            RejectReason::VehicleIssue => "vehicle_issue",
            RejectReason::PersonalEmergency => "personal_emergency",
            RejectReason::Other => "other",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RejectReason {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RejectReason::ALL
            .into_iter()
            .find(|reason| reason.as_str() == s)
            .ok_or_else(|| DispatchError::invalid(format!("invalid_reason: {s}")))
    }
}

/// Per-round parameters. Field names follow the `rounds.round_strategys[]`
/// configuration keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoundStrategy {
    #[serde(default)]
    pub max_drivers: u32,
    pub search_radius: f64,
    #[serde(default = "default_price_multiplier")]
    pub price_multiplier: f64,
    #[serde(default)]
    pub min_rating_score: f64,
    #[serde(default)]
    pub min_acceptance_rate: f64,
    #[serde(default = "default_max_consecutive_rejects")]
    pub max_consecutive_rejects: u32,
}

fn default_price_multiplier() -> f64 {
    1.0
}

fn default_max_consecutive_rejects() -> u32 {
    u32::MAX
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Accepted,
    Rejected,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverResponse {
    pub kind: ResponseKind,
    pub responded_at: DateTime<Utc>,
    pub reject_reason_type: Option<RejectReason>,
}

/// One round of offering an order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dispatch {
    pub dispatch_id: Uuid,
    pub order_id: Uuid,
    pub round: u32,
    /// 1-based count of dispatches created for the order, this one included.
    pub round_seq: u32,
    pub status: DispatchStatus,
    pub created_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
    pub selected_driver_id: Option<Uuid>,
    pub responses: BTreeMap<Uuid, DriverResponse>,
    pub strategy: RoundStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchOffer {
    pub offer_id: Uuid,
    pub dispatch_id: Uuid,
    pub order_id: Uuid,
    pub driver_id: Uuid,
    pub round: u32,
    pub offered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub driver_distance_km: f64,
    pub price_multiplier: f64,
    pub state: OfferState,
    pub reject_reason_type: Option<RejectReason>,
    pub reject_reason: Option<String>,
    pub responded_at: Option<DateTime<Utc>>,
}

/// Winning claim on an order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcceptanceLock {
    pub order_id: Uuid,
    pub driver_id: Uuid,
    pub dispatch_id: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", content = "driver_id", rename_all = "snake_case")]
pub enum TerminalState {
    Open,
    Accepted(Uuid),
    Cancelled,
    Expired,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelInitiator {
    Passenger,
    Driver,
    Operator,
    System,
}
