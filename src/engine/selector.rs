//! Candidate Selector: geo prefilter, eligibility, scoring and ranking for
//! one round.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::config::{DispatchSettings, TimeWindowConfig};
use crate::engine::Engine;
use crate::engine::scoring::{ScoreContext, compute_score};
use crate::error::{DispatchError, DispatchResult};
use crate::geo::{GeoPoint, haversine_km};
use crate::models::candidate::{Candidate, IneligibleReason};
use crate::models::dispatch::RoundStrategy;
use crate::models::driver::DriverRuntime;
use crate::models::order::Order;
use crate::runtime::{DriverFilter, NearbyDriver};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SelectionReport {
    /// Ranked best first, capped at the strategy's `max_drivers`.
    pub candidates: Vec<Candidate>,
    /// Drivers the prefilter returned that did not make it, with the reason.
    pub excluded: Vec<Candidate>,
}

/// Queries the driver index and the offer history under the query timeout,
/// then ranks.
pub async fn select_candidates(
    engine: &Engine,
    order: &Order,
    strategy: &RoundStrategy,
    radius_km: f64,
) -> DispatchResult<SelectionReport> {
    let settings = engine.settings.as_ref();
    let filter = DriverFilter {
        vehicle: order.vehicle_filter.clone(),
        min_rating: strategy.min_rating_score,
        min_acceptance_rate: strategy.min_acceptance_rate,
    };

    let lookup = async {
        let drivers = if settings.driver_selection.use_geolocation {
            engine
                .runtime
                .query_nearby(&order.pickup, radius_km, &filter)?
        } else {
            engine.runtime.query_all(&order.pickup, &filter)?
        };
        let offered = engine.store.offered_drivers(order.order_id).await?;
        Ok::<_, DispatchError>((drivers, offered))
    };

    let limit = settings.timeouts.query();
    let (drivers, offered) = tokio::time::timeout(limit, lookup)
        .await
        .map_err(|_| DispatchError::storage(format!("candidate query exceeded {limit:?}")))??;

    Ok(rank_candidates(
        settings,
        order,
        strategy,
        radius_km,
        drivers,
        &offered,
        engine.clock.now(),
    ))
}

/// Pure part of the selection. Identical inputs give identical output.
pub fn rank_candidates(
    settings: &DispatchSettings,
    order: &Order,
    strategy: &RoundStrategy,
    radius_km: f64,
    drivers: Vec<NearbyDriver>,
    offered: &HashSet<Uuid>,
    now: DateTime<Utc>,
) -> SelectionReport {
    let staleness = settings.runtime.staleness();
    let window = &settings.time_window;
    let ctx = ScoreContext {
        search_radius_km: radius_km,
        max_wait_min: window.max_wait_time_min,
    };

    let mut report = SelectionReport::default();
    for NearbyDriver {
        runtime: driver,
        distance_km,
    } in drivers
    {
        let plan = WorkPlan::for_driver(&driver, now);
        let arrival = plan.arrival_at(&order.pickup, window);
        let wait_min = match order.scheduled_at.filter(|_| order.is_scheduled()) {
            Some(pickup_at) => minutes(arrival - pickup_at).max(0.0),
            None => minutes(arrival - now),
        };

        let (final_score, scores) =
            compute_score(&driver, distance_km, wait_min, &ctx, &settings.scoring.factors);

        let mut reason = if !driver.is_available(now, &staleness) {
            Some(IneligibleReason::Unavailable)
        } else if driver.consecutive_rejects > strategy.max_consecutive_rejects {
            Some(IneligibleReason::TooManyRejects)
        } else if offered.contains(&driver.driver_id) {
            Some(IneligibleReason::AlreadyOffered)
        } else if !driver.can_accept_more_orders() {
            Some(IneligibleReason::QueueFull)
        } else if order.is_scheduled() {
            time_window_conflict(order, &plan, wait_min, window)
        } else {
            None
        };
        if reason.is_none() && !(scores.is_finite() && final_score.is_finite()) {
            reason = Some(IneligibleReason::ScoringFailed);
        }

        let candidate = Candidate {
            driver_id: driver.driver_id,
            is_eligible: reason.is_none(),
            distance_km,
            scores,
            final_score,
            round_seq: 0,
            last_dispatch_at: driver.last_dispatch_at,
            reject_reason: reason,
        };
        match reason {
            None => report.candidates.push(candidate),
            Some(reason) => {
                debug!(
                    order_id = %order.order_id,
                    driver_id = %driver.driver_id,
                    reason = ?reason,
                    "driver excluded from round"
                );
                report.excluded.push(candidate);
            }
        }
    }

    report.candidates.sort_by(compare_candidates);
    if strategy.max_drivers > 0 {
        report.candidates.truncate(strategy.max_drivers as usize);
    }
    for (idx, candidate) in report.candidates.iter_mut().enumerate() {
        candidate.round_seq = idx as u32 + 1;
    }
    report
}

/// Score descending, then distance, then least recently dispatched, then id.
fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    b.final_score
        .total_cmp(&a.final_score)
        .then(a.distance_km.total_cmp(&b.distance_km))
        .then(a.last_dispatch_at.cmp(&b.last_dispatch_at))
        .then(a.driver_id.cmp(&b.driver_id))
}

fn time_window_conflict(
    order: &Order,
    plan: &WorkPlan,
    lateness_min: f64,
    window: &TimeWindowConfig,
) -> Option<IneligibleReason> {
    if lateness_min > window.max_wait_time_min {
        return Some(IneligibleReason::TimeWindowConflict);
    }
    if window.route_check_enabled && plan.busy {
        let gap_m = haversine_km(&plan.free_at_location, &order.pickup) * 1000.0;
        if gap_m > window.location_tolerance_m {
            return Some(IneligibleReason::OutOfTolerance);
        }
    }
    None
}

/// When and where a driver runs out of committed work.
struct WorkPlan {
    free_at: DateTime<Utc>,
    free_at_location: GeoPoint,
    busy: bool,
}

impl WorkPlan {
    fn for_driver(driver: &DriverRuntime, now: DateTime<Utc>) -> Self {
        let mut plan = WorkPlan {
            free_at: now,
            free_at_location: driver.location(),
            busy: false,
        };
        for job in driver.committed_work() {
            let start = job
                .start_at
                .or(job.scheduled_at)
                .map_or(plan.free_at, |at| at.max(plan.free_at));
            let end = job
                .end_at
                .unwrap_or(start + Duration::minutes(i64::from(job.estimated_duration_min)));
            plan.free_at = plan.free_at.max(end);
            plan.free_at_location = job.dropoff;
            plan.busy = true;
        }
        plan
    }

    /// Travel is only estimated when route checks are on; otherwise the
    /// driver is assumed to be at the pickup once free.
    fn arrival_at(&self, pickup: &GeoPoint, window: &TimeWindowConfig) -> DateTime<Utc> {
        if !window.route_check_enabled || window.average_speed_kmh <= 0.0 {
            return self.free_at;
        }
        let km = haversine_km(&self.free_at_location, pickup);
        let travel_ms = km / window.average_speed_kmh * 3_600_000.0;
        self.free_at + Duration::milliseconds(travel_ms.round() as i64)
    }
}

fn minutes(span: Duration) -> f64 {
    span.num_milliseconds() as f64 / 60_000.0
}
