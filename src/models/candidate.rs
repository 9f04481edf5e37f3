use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ScoreBreakdown {
    pub distance_score: f64,
    pub time_score: f64,
    pub queue_score: f64,
    pub rating_score: f64,
    pub acceptance_score: f64,
    pub experience_score: f64,
}

impl ScoreBreakdown {
    pub fn is_finite(&self) -> bool {
        [
            self.distance_score,
            self.time_score,
            self.queue_score,
            self.rating_score,
            self.acceptance_score,
            self.experience_score,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IneligibleReason {
    Unavailable,
    TooManyRejects,
    AlreadyOffered,
    QueueFull,
    TimeWindowConflict,
    OutOfTolerance,
    ScoringFailed,
}

/// A driver considered for one round. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub driver_id: Uuid,
    pub is_eligible: bool,
    pub distance_km: f64,
    pub scores: ScoreBreakdown,
    pub final_score: f64,
    /// 1-based rank within the round; 0 for drivers that were filtered out.
    pub round_seq: u32,
    pub last_dispatch_at: Option<DateTime<Utc>>,
    pub reject_reason: Option<IneligibleReason>,
}
