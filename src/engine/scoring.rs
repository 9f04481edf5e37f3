use crate::config::ScoringFactors;
use crate::models::candidate::ScoreBreakdown;
use crate::models::driver::DriverRuntime;

/// Experience level that earns the full experience score.
const EXPERIENCE_CAP: f64 = 10.0;
const MAX_RATING: f64 = 5.0;

/// Per-round context the factor scores are normalized against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreContext {
    pub search_radius_km: f64,
    pub max_wait_min: f64,
}

pub fn compute_score(
    driver: &DriverRuntime,
    distance_km: f64,
    wait_min: f64,
    ctx: &ScoreContext,
    factors: &ScoringFactors,
) -> (f64, ScoreBreakdown) {
    let breakdown = ScoreBreakdown {
        distance_score: distance_score(distance_km, ctx.search_radius_km),
        time_score: time_score(wait_min, ctx.max_wait_min),
        queue_score: queue_score(driver.total_queue_size(), driver.max_queue_capacity),
        rating_score: rating_score(driver.rating),
        acceptance_score: driver.acceptance_rate.clamp(0.0, 1.0),
        experience_score: experience_score(driver.experience_level),
    };

    let score = weighted_score(&breakdown, factors);
    (score, breakdown)
}

/// Queue and time scores are reported but do not feed the final score; they
/// already act as eligibility filters.
pub fn weighted_score(breakdown: &ScoreBreakdown, factors: &ScoringFactors) -> f64 {
    (breakdown.rating_score * factors.rating)
        + (breakdown.acceptance_score * factors.acceptance_rate)
        + (breakdown.distance_score * factors.distance)
        + (breakdown.experience_score * factors.experience)
}

fn distance_score(distance_km: f64, search_radius_km: f64) -> f64 {
    if search_radius_km <= 0.0 {
        return 1.0;
    }
    (1.0 - distance_km / search_radius_km).max(0.0)
}

fn time_score(wait_min: f64, max_wait_min: f64) -> f64 {
    if max_wait_min <= 0.0 {
        return 0.0;
    }
    (1.0 - wait_min.max(0.0) / max_wait_min).max(0.0)
}

fn queue_score(queue_size: u32, capacity: u32) -> f64 {
    if capacity == 0 {
        return 1.0;
    }
    (1.0 - queue_size as f64 / capacity.max(1) as f64).clamp(0.0, 1.0)
}

fn rating_score(rating: f64) -> f64 {
    (rating / MAX_RATING).clamp(0.0, 1.0)
}

fn experience_score(level: u32) -> f64 {
    (level as f64 / EXPERIENCE_CAP).min(1.0)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::geo::GeoPoint;
    use crate::models::driver::{OnlineStatus, QueuedOrder};
    use crate::models::order::OrderStatus;

    const CTX: ScoreContext = ScoreContext {
        search_radius_km: 5.0,
        max_wait_min: 15.0,
    };

    fn driver(rating: f64, acceptance_rate: f64, experience_level: u32) -> DriverRuntime {
        let now = Utc::now();
        DriverRuntime {
            driver_id: Uuid::from_u128(1),
            online_status: OnlineStatus::Online,
            lat: 53.5512,
            lng: 9.9938,
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
            acceptance_rate,
            rating,
            experience_level,
            vehicle_id: "v-1".to_string(),
            vehicle_category: "standard".to_string(),
            vehicle_level: 1,
            last_heartbeat_at: now,
            next_available_at: None,
            updated_at: now,
            version: 1,
        }
    }

    fn queued(id: u128) -> QueuedOrder {
        QueuedOrder {
            order_id: Uuid::from_u128(id),
            status: OrderStatus::Accepted,
            scheduled_at: None,
            start_at: None,
            end_at: None,
            pickup: GeoPoint::new(53.55, 9.99),
            dropoff: GeoPoint::new(53.56, 10.0),
            estimated_duration_min: 20,
            passenger_count: 1,
        }
    }

    #[test]
    fn closer_driver_gets_higher_score_when_other_factors_match() {
        let d = driver(4.5, 0.8, 5);
        let factors = ScoringFactors::default();

        let (near, _) = compute_score(&d, 1.0, 0.0, &CTX, &factors);
        let (far, _) = compute_score(&d, 4.0, 0.0, &CTX, &factors);

        assert!(near > far);
    }

    #[test]
    fn factor_scores_follow_their_formulas() {
        let d = driver(4.0, 0.75, 25);
        let (_, breakdown) = compute_score(&d, 2.5, 7.5, &CTX, &ScoringFactors::default());

        assert!((breakdown.distance_score - 0.5).abs() < 1e-9);
        assert!((breakdown.rating_score - 0.8).abs() < 1e-9);
        assert!((breakdown.acceptance_score - 0.75).abs() < 1e-9);
        assert_eq!(breakdown.experience_score, 1.0);
        assert!((breakdown.time_score - 0.5).abs() < 1e-9);
        assert_eq!(breakdown.queue_score, 1.0);
    }

    #[test]
    fn outside_radius_scores_zero_distance_and_zero_radius_scores_full() {
        let d = driver(4.0, 0.5, 1);
        let factors = ScoringFactors::default();

        let (_, outside) = compute_score(&d, 9.0, 0.0, &CTX, &factors);
        assert_eq!(outside.distance_score, 0.0);

        let pinpoint = ScoreContext {
            search_radius_km: 0.0,
            ..CTX
        };
        let (_, at_zero) = compute_score(&d, 9.0, 0.0, &pinpoint, &factors);
        assert_eq!(at_zero.distance_score, 1.0);
    }

    #[test]
    fn busier_queue_lowers_queue_score_only() {
        let idle = driver(4.5, 0.9, 3);
        let mut busy = idle.clone();
        busy.current_order = Some(queued(7));

        let factors = ScoringFactors::default();
        let (idle_total, idle_breakdown) = compute_score(&idle, 1.0, 0.0, &CTX, &factors);
        let (busy_total, busy_breakdown) = compute_score(&busy, 1.0, 0.0, &CTX, &factors);

        assert!((busy_breakdown.queue_score - 0.5).abs() < 1e-9);
        assert!(idle_breakdown.queue_score > busy_breakdown.queue_score);
        assert_eq!(idle_total, busy_total);
    }

    #[test]
    fn final_score_uses_configured_weights() {
        let d = driver(5.0, 0.0, 0);
        let rating_only = ScoringFactors {
            rating: 1.0,
            acceptance_rate: 0.0,
            distance: 0.0,
            experience: 0.0,
        };

        let (score, _) = compute_score(&d, 4.0, 0.0, &CTX, &rating_only);
        assert!((score - 1.0).abs() < 1e-9);
    }
}
