//! Driver Runtime Index: real-time driver state with a geospatial lookup.
//!
//! Every mutation bumps the runtime's `version`. Writers that care about
//! interleaving go through [`DriverRuntimeIndex::cas_update`] or
//! [`DriverRuntimeIndex::assign_order`] and get a conflict back instead of an
//! internal retry.

pub mod geo_index;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::RuntimeConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::geo::{GeoPoint, haversine_km};
use crate::models::driver::{
    DriverProfile, DriverRuntime, LocationUpdate, OnlineStatus, QueuedOrder, Staleness,
};
use crate::models::order::VehicleFilter;

use self::geo_index::GeoIndex;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexSettings {
    pub staleness: Staleness,
    pub tombstone_ttl: Duration,
    pub strict_location: bool,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            staleness: Staleness::default(),
            tombstone_ttl: Duration::seconds(300),
            strict_location: false,
        }
    }
}

impl From<&RuntimeConfig> for IndexSettings {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            staleness: config.staleness(),
            tombstone_ttl: Duration::seconds(config.tombstone_secs),
            strict_location: config.strict_location,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverFilter {
    pub vehicle: VehicleFilter,
    pub min_rating: f64,
    pub min_acceptance_rate: f64,
}

impl DriverFilter {
    fn matches(&self, driver: &DriverRuntime) -> bool {
        self.vehicle
            .matches(&driver.vehicle_category, driver.vehicle_level)
            && driver.rating >= self.min_rating
            && driver.acceptance_rate >= self.min_acceptance_rate
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearbyDriver {
    pub runtime: DriverRuntime,
    pub distance_km: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CasOutcome {
    Ok { version: u64 },
    Conflict { actual: u64 },
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AssignOutcome {
    Ok { version: u64 },
    Conflict { actual: u64 },
    CapacityExceeded,
    Ineligible,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationOutcome {
    Updated,
    Inserted,
    /// Older than the position already held.
    OutOfOrder,
    /// Unknown driver without a recent heartbeat, lenient mode.
    Ignored,
}

enum Step<R> {
    Commit(R),
    Skip(R),
}

pub struct DriverRuntimeIndex {
    drivers: DashMap<Uuid, DriverRuntime>,
    tombstones: DashMap<Uuid, DateTime<Utc>>,
    sightings: DashMap<Uuid, DateTime<Utc>>,
    /// Highest version held by any purged runtime. Re-created runtimes start
    /// above it so a version is never handed out twice for one driver.
    retired_version: AtomicU64,
    geo: GeoIndex,
    clock: Arc<dyn Clock>,
    settings: IndexSettings,
}

impl DriverRuntimeIndex {
    pub fn new(clock: Arc<dyn Clock>, settings: IndexSettings) -> Self {
        Self {
            drivers: DashMap::new(),
            tombstones: DashMap::new(),
            sightings: DashMap::new(),
            retired_version: AtomicU64::new(0),
            geo: GeoIndex::new(),
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Starts or refreshes a driver session. The driver comes back online.
    pub fn register(&self, profile: DriverProfile) -> DispatchResult<DriverRuntime> {
        if !profile.location.is_valid() {
            return Err(DispatchError::invalid("driver location out of range"));
        }
        let now = self.clock.now();
        let floor = self.retired_version.load(Ordering::Acquire);
        let mut entry = self
            .drivers
            .entry(profile.driver_id)
            .or_insert_with(|| blank_runtime(profile.driver_id, profile.location, now, floor));

        let runtime = entry.value_mut();
        runtime.online_status = OnlineStatus::Online;
        runtime.lat = profile.location.lat;
        runtime.lng = profile.location.lng;
        runtime.location_updated_at = now;
        runtime.vehicle_id = profile.vehicle_id;
        runtime.vehicle_category = profile.vehicle_category;
        runtime.vehicle_level = profile.vehicle_level;
        runtime.rating = profile.rating.clamp(0.0, 5.0);
        runtime.acceptance_rate = profile.acceptance_rate.clamp(0.0, 1.0);
        runtime.experience_level = profile.experience_level;
        runtime.max_queue_capacity = profile.max_queue_capacity;
        runtime.last_heartbeat_at = now;
        runtime.updated_at = now;
        runtime.version += 1;

        self.geo.upsert(runtime.driver_id, &runtime.location())?;
        self.tombstones.remove(&runtime.driver_id);
        self.sightings.remove(&runtime.driver_id);

        info!(driver_id = %runtime.driver_id, version = runtime.version, "driver session registered");
        Ok(runtime.clone())
    }

    pub fn get(&self, driver_id: Uuid) -> Option<DriverRuntime> {
        self.drivers.get(&driver_id).map(|entry| entry.value().clone())
    }

    /// All known drivers, tombstoned ones included, ordered by id.
    pub fn list(&self) -> Vec<DriverRuntime> {
        let mut drivers: Vec<DriverRuntime> = self
            .drivers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        drivers.sort_by_key(|d| d.driver_id);
        drivers
    }

    pub fn online_count(&self) -> usize {
        self.drivers
            .iter()
            .filter(|entry| entry.value().is_online())
            .count()
    }

    pub fn upsert_location(
        &self,
        driver_id: Uuid,
        update: LocationUpdate,
    ) -> DispatchResult<LocationOutcome> {
        let point = GeoPoint::new(update.lat, update.lng);
        if !point.is_valid() {
            return Err(DispatchError::invalid("location out of range"));
        }

        if !self.drivers.contains_key(&driver_id) {
            return self.insert_from_sighting(driver_id, update);
        }

        let outcome = self.apply(driver_id, None, |runtime| {
            if update.ts < runtime.location_updated_at {
                return Ok(Step::Skip(LocationOutcome::OutOfOrder));
            }
            runtime.lat = update.lat;
            runtime.lng = update.lng;
            runtime.heading = update.heading;
            runtime.speed = update.speed;
            runtime.accuracy = update.accuracy;
            runtime.location_updated_at = update.ts;
            Ok(Step::Commit(LocationOutcome::Updated))
        })?;

        match outcome {
            Some(outcome) => Ok(outcome),
            // removed between the lookup and the write
            None => self.insert_from_sighting(driver_id, update),
        }
    }

    fn insert_from_sighting(
        &self,
        driver_id: Uuid,
        update: LocationUpdate,
    ) -> DispatchResult<LocationOutcome> {
        let now = self.clock.now();
        let recent = self
            .sightings
            .get(&driver_id)
            .is_some_and(|seen| now - *seen <= self.settings.staleness.heartbeat);

        if !recent {
            if self.settings.strict_location {
                return Err(DispatchError::NotFound(format!("driver {driver_id}")));
            }
            debug!(driver_id = %driver_id, "location for unknown driver ignored");
            return Ok(LocationOutcome::Ignored);
        }

        let point = GeoPoint::new(update.lat, update.lng);
        let floor = self.retired_version.load(Ordering::Acquire);
        let mut runtime = blank_runtime(driver_id, point, now, floor + 1);
        runtime.heading = update.heading;
        runtime.speed = update.speed;
        runtime.accuracy = update.accuracy;
        runtime.location_updated_at = update.ts;
        if let Some((_, seen)) = self.sightings.remove(&driver_id) {
            runtime.last_heartbeat_at = seen;
        }

        let inserted = match self.drivers.entry(driver_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                self.geo.upsert(driver_id, &point)?;
                slot.insert(runtime);
                true
            }
        };
        if !inserted {
            // lost a race with another insert; take the regular path
            return self.upsert_location(driver_id, update);
        }
        info!(driver_id = %driver_id, "driver inserted from location update");
        Ok(LocationOutcome::Inserted)
    }

    pub fn set_status(
        &self,
        driver_id: Uuid,
        status: OnlineStatus,
        ts: DateTime<Utc>,
    ) -> DispatchResult<u64> {
        let version = self
            .apply(driver_id, None, |runtime| {
                runtime.online_status = status;
                if status != OnlineStatus::Offline && ts > runtime.last_heartbeat_at {
                    runtime.last_heartbeat_at = ts;
                }
                Ok(Step::Commit(runtime.version + 1))
            })?
            .ok_or_else(|| DispatchError::NotFound(format!("driver {driver_id}")))?;

        info!(driver_id = %driver_id, status = ?status, "driver status changed");
        Ok(version)
    }

    /// Refreshes liveness. Heartbeats from drivers without a runtime are
    /// remembered so a following location update can create one.
    pub fn heartbeat(&self, driver_id: Uuid, ts: DateTime<Utc>) -> DispatchResult<()> {
        let applied = self.apply(driver_id, None, |runtime| {
            if ts > runtime.last_heartbeat_at {
                runtime.last_heartbeat_at = ts;
            }
            Ok(Step::Commit(()))
        })?;

        if applied.is_none() {
            self.sightings
                .entry(driver_id)
                .and_modify(|seen| *seen = (*seen).max(ts))
                .or_insert(ts);
        }
        Ok(())
    }

    /// Online drivers within `radius_km` of `center` passing `filter`, nearest
    /// first. Drivers with a stale heartbeat are left out.
    pub fn query_nearby(
        &self,
        center: &GeoPoint,
        radius_km: f64,
        filter: &DriverFilter,
    ) -> DispatchResult<Vec<NearbyDriver>> {
        let ids = self.geo.near(center, radius_km)?;
        Ok(self.collect(ids, center, Some(radius_km), filter))
    }

    /// Same as [`Self::query_nearby`] without the radius bound.
    pub fn query_all(
        &self,
        center: &GeoPoint,
        filter: &DriverFilter,
    ) -> DispatchResult<Vec<NearbyDriver>> {
        let ids = self.geo.all()?;
        Ok(self.collect(ids, center, None, filter))
    }

    fn collect(
        &self,
        ids: Vec<Uuid>,
        center: &GeoPoint,
        radius_km: Option<f64>,
        filter: &DriverFilter,
    ) -> Vec<NearbyDriver> {
        let now = self.clock.now();
        let mut found: Vec<NearbyDriver> = ids
            .into_iter()
            .filter_map(|id| self.get(id))
            .filter(|d| d.online_status != OnlineStatus::Offline)
            .filter(|d| now - d.last_heartbeat_at <= self.settings.staleness.heartbeat)
            .filter(|d| filter.matches(d))
            .filter_map(|runtime| {
                let distance_km = haversine_km(center, &runtime.location());
                match radius_km {
                    Some(radius) if distance_km > radius => None,
                    _ => Some(NearbyDriver {
                        runtime,
                        distance_km,
                    }),
                }
            })
            .collect();

        found.sort_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then(a.runtime.driver_id.cmp(&b.runtime.driver_id))
        });
        found
    }

    /// Applies `mutator` to a copy of the runtime if its version still equals
    /// `expected_version`, then stores the copy under the next version.
    pub fn cas_update<F>(
        &self,
        driver_id: Uuid,
        expected_version: u64,
        mutator: F,
    ) -> DispatchResult<CasOutcome>
    where
        F: FnOnce(&mut DriverRuntime),
    {
        let result = self.apply(driver_id, Some(expected_version), |runtime| {
            mutator(runtime);
            Ok(Step::Commit(()))
        });

        match result {
            Ok(Some(())) => Ok(CasOutcome::Ok {
                version: expected_version + 1,
            }),
            Ok(None) => Ok(CasOutcome::NotFound),
            Err(ApplyError::Conflict(actual)) => Ok(CasOutcome::Conflict { actual }),
            Err(ApplyError::Failed(err)) => Err(err),
        }
    }

    /// Hands an order to a driver: it becomes the current order, or joins the
    /// queue when one is already running.
    pub fn assign_order(
        &self,
        driver_id: Uuid,
        order: QueuedOrder,
        expected_version: u64,
    ) -> DispatchResult<AssignOutcome> {
        let now = self.clock.now();
        let staleness = self.settings.staleness;
        let result = self.apply(driver_id, Some(expected_version), move |runtime| {
            if runtime.carries_order(order.order_id) {
                return Ok(Step::Skip(AssignOutcome::Ok {
                    version: runtime.version,
                }));
            }
            if !runtime.is_online() {
                return Ok(Step::Skip(AssignOutcome::Ineligible));
            }
            if !runtime.can_accept_more_orders() {
                return Ok(Step::Skip(AssignOutcome::CapacityExceeded));
            }
            if !runtime.is_available(now, &staleness) {
                debug!(driver_id = %runtime.driver_id, "assigning to a driver with stale liveness");
            }

            let mut order = order;
            if runtime.current_order.is_none() {
                order.start_at.get_or_insert(now);
                runtime.current_order = Some(order);
            } else {
                runtime.queued_orders.push(order);
            }
            runtime.consecutive_rejects = 0;
            runtime.last_response_at = Some(now);
            Ok(Step::Commit(AssignOutcome::Ok {
                version: runtime.version + 1,
            }))
        });

        match result {
            Ok(Some(outcome)) => Ok(outcome),
            Ok(None) => Ok(AssignOutcome::NotFound),
            Err(ApplyError::Conflict(actual)) => Ok(AssignOutcome::Conflict { actual }),
            Err(ApplyError::Failed(err)) => Err(err),
        }
    }

    /// Finishes the driver's current order and promotes the oldest queued one.
    pub fn complete_order(&self, driver_id: Uuid, order_id: Uuid) -> DispatchResult<DriverRuntime> {
        let now = self.clock.now();
        let done = self.apply(driver_id, None, |runtime| {
            match &runtime.current_order {
                Some(current) if current.order_id == order_id => {
                    runtime.current_order = None;
                    if !runtime.queued_orders.is_empty() {
                        let mut next = runtime.queued_orders.remove(0);
                        next.start_at.get_or_insert(now);
                        runtime.current_order = Some(next);
                    }
                }
                _ => {
                    let before = runtime.queued_orders.len();
                    runtime.queued_orders.retain(|o| o.order_id != order_id);
                    if runtime.queued_orders.len() == before {
                        return Err(DispatchError::NotFound(format!(
                            "order {order_id} on driver {driver_id}"
                        )));
                    }
                }
            }
            Ok(Step::Commit(()))
        })?;

        done.and_then(|_| self.get(driver_id))
            .ok_or_else(|| DispatchError::NotFound(format!("driver {driver_id}")))
    }

    /// Drops drivers that have been offline longer than the tombstone TTL.
    pub fn purge_tombstones(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let ttl = self.settings.tombstone_ttl;
        let expired: Vec<Uuid> = self
            .tombstones
            .iter()
            .filter(|entry| now - *entry.value() >= ttl)
            .map(|entry| *entry.key())
            .collect();

        let mut purged = Vec::new();
        for driver_id in expired {
            self.tombstones.remove(&driver_id);
            let removed = self
                .drivers
                .remove_if(&driver_id, |_, d| d.online_status == OnlineStatus::Offline);
            if let Some((_, runtime)) = removed {
                self.retired_version
                    .fetch_max(runtime.version, Ordering::AcqRel);
                purged.push(driver_id);
            }
        }

        let heartbeat = self.settings.staleness.heartbeat;
        self.sightings.retain(|_, seen| now - *seen <= heartbeat);

        purged
    }

    /// Runs `f` against a copy of the runtime under the entry lock and commits
    /// it with the next version. `Ok(None)` means the driver is unknown.
    fn apply<R, F>(
        &self,
        driver_id: Uuid,
        expected_version: Option<u64>,
        f: F,
    ) -> Result<Option<R>, ApplyError>
    where
        F: FnOnce(&mut DriverRuntime) -> DispatchResult<Step<R>>,
    {
        let Some(mut entry) = self.drivers.get_mut(&driver_id) else {
            return Ok(None);
        };
        let current = entry.value();
        if let Some(expected) = expected_version {
            if current.version != expected {
                return Err(ApplyError::Conflict(current.version));
            }
        }

        let mut next = current.clone();
        match f(&mut next).map_err(ApplyError::Failed)? {
            Step::Skip(result) => Ok(Some(result)),
            Step::Commit(result) => {
                next.driver_id = driver_id;
                next.version = current.version + 1;
                next.updated_at = self.clock.now();

                let was_offline = current.online_status == OnlineStatus::Offline;
                if next.online_status == OnlineStatus::Offline {
                    self.geo.remove(driver_id).map_err(ApplyError::Failed)?;
                    if !was_offline {
                        self.tombstones.insert(driver_id, next.updated_at);
                    }
                } else {
                    if was_offline {
                        self.tombstones.remove(&driver_id);
                    }
                    self.geo
                        .upsert(driver_id, &next.location())
                        .map_err(ApplyError::Failed)?;
                }
                *entry.value_mut() = next;
                Ok(Some(result))
            }
        }
    }
}

enum ApplyError {
    Conflict(u64),
    Failed(DispatchError),
}

impl From<ApplyError> for DispatchError {
    fn from(err: ApplyError) -> Self {
        match err {
            ApplyError::Conflict(actual) => {
                DispatchError::ConflictRetry(format!("driver version moved to {actual}"))
            }
            ApplyError::Failed(err) => err,
        }
    }
}

fn blank_runtime(
    driver_id: Uuid,
    location: GeoPoint,
    now: DateTime<Utc>,
    version: u64,
) -> DriverRuntime {
    DriverRuntime {
        driver_id,
        online_status: OnlineStatus::Online,
        lat: location.lat,
        lng: location.lng,
        heading: 0.0,
        speed: 0.0,
        accuracy: 0.0,
        location_updated_at: now,
        current_order: None,
        queued_orders: Vec::new(),
        max_queue_capacity: 0,
        consecutive_rejects: 0,
        last_dispatch_at: None,
        last_response_at: None,
        acceptance_rate: 0.0,
        rating: 0.0,
        experience_level: 0,
        vehicle_id: String::new(),
        vehicle_category: String::new(),
        vehicle_level: 0,
        last_heartbeat_at: now,
        next_available_at: None,
        updated_at: now,
        version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::order::OrderStatus;

    const PICKUP: GeoPoint = GeoPoint {
        lat: 52.5200,
        lng: 13.4050,
    };

    fn setup() -> (Arc<ManualClock>, DriverRuntimeIndex) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let index = DriverRuntimeIndex::new(clock.clone(), IndexSettings::default());
        (clock, index)
    }

    fn profile(id: u128, lat: f64, lng: f64) -> DriverProfile {
        DriverProfile {
            driver_id: Uuid::from_u128(id),
            location: GeoPoint::new(lat, lng),
            vehicle_id: format!("v-{id}"),
            vehicle_category: "standard".to_string(),
            vehicle_level: 1,
            rating: 4.5,
            acceptance_rate: 0.8,
            experience_level: 4,
            max_queue_capacity: 2,
        }
    }

    fn work(id: u128) -> QueuedOrder {
        QueuedOrder {
            order_id: Uuid::from_u128(id),
            status: OrderStatus::Accepted,
            scheduled_at: None,
            start_at: None,
            end_at: None,
            pickup: PICKUP,
            dropoff: GeoPoint::new(52.50, 13.45),
            estimated_duration_min: 20,
            passenger_count: 1,
        }
    }

    fn location(lat: f64, lng: f64, ts: DateTime<Utc>) -> LocationUpdate {
        LocationUpdate {
            lat,
            lng,
            heading: 90.0,
            speed: 30.0,
            accuracy: 5.0,
            ts,
        }
    }

    #[test]
    fn query_returns_drivers_inside_radius_nearest_first() {
        let (_clock, index) = setup();
        // ~2 km, ~1 km and ~12 km north of the pickup
        index.register(profile(1, 52.5380, 13.4050)).unwrap();
        index.register(profile(2, 52.5290, 13.4050)).unwrap();
        index.register(profile(3, 52.6280, 13.4050)).unwrap();

        let found = index
            .query_nearby(&PICKUP, 5.0, &DriverFilter::default())
            .unwrap();
        let ids: Vec<Uuid> = found.iter().map(|d| d.runtime.driver_id).collect();

        assert_eq!(ids, vec![Uuid::from_u128(2), Uuid::from_u128(1)]);
        assert!(found[0].distance_km < found[1].distance_km);
    }

    #[test]
    fn query_applies_rating_and_vehicle_filter() {
        let (_clock, index) = setup();
        let mut low = profile(1, 52.521, 13.405);
        low.rating = 3.0;
        let mut xl = profile(2, 52.521, 13.406);
        xl.vehicle_category = "xl".to_string();
        index.register(low).unwrap();
        index.register(xl).unwrap();
        index.register(profile(3, 52.522, 13.405)).unwrap();

        let filter = DriverFilter {
            vehicle: VehicleFilter {
                category: Some("standard".to_string()),
                level: None,
            },
            min_rating: 4.0,
            min_acceptance_rate: 0.5,
        };
        let found = index.query_nearby(&PICKUP, 5.0, &filter).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].runtime.driver_id, Uuid::from_u128(3));
    }

    #[test]
    fn stale_heartbeat_is_excluded_but_not_mutated() {
        let (clock, index) = setup();
        let d = index.register(profile(1, 52.521, 13.405)).unwrap();

        clock.advance(Duration::seconds(121));
        let found = index
            .query_nearby(&PICKUP, 5.0, &DriverFilter::default())
            .unwrap();
        assert!(found.is_empty());
        assert_eq!(index.get(d.driver_id).unwrap().version, d.version);

        index.heartbeat(d.driver_id, clock.now()).unwrap();
        let found = index
            .query_nearby(&PICKUP, 5.0, &DriverFilter::default())
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn every_update_bumps_version() {
        let (clock, index) = setup();
        let id = index.register(profile(1, 52.521, 13.405)).unwrap().driver_id;
        let mut last = index.get(id).unwrap().version;

        clock.advance(Duration::seconds(1));
        index
            .upsert_location(id, location(52.522, 13.406, clock.now()))
            .unwrap();
        let v = index.get(id).unwrap().version;
        assert!(v > last);
        last = v;

        index.heartbeat(id, clock.now()).unwrap();
        let v = index.get(id).unwrap().version;
        assert!(v > last);
        last = v;

        index.set_status(id, OnlineStatus::Busy, clock.now()).unwrap();
        assert!(index.get(id).unwrap().version > last);
    }

    #[test]
    fn older_location_loses_to_newer() {
        let (clock, index) = setup();
        let id = index.register(profile(1, 52.521, 13.405)).unwrap().driver_id;
        let t1 = clock.advance(Duration::seconds(5));
        index.upsert_location(id, location(52.53, 13.41, t1)).unwrap();

        let outcome = index
            .upsert_location(id, location(52.40, 13.30, t1 - Duration::seconds(3)))
            .unwrap();
        assert_eq!(outcome, LocationOutcome::OutOfOrder);
        assert_eq!(index.get(id).unwrap().lat, 52.53);
    }

    #[test]
    fn unknown_driver_location_needs_recent_heartbeat() {
        let (clock, index) = setup();
        let id = Uuid::from_u128(9);

        let outcome = index
            .upsert_location(id, location(52.52, 13.40, clock.now()))
            .unwrap();
        assert_eq!(outcome, LocationOutcome::Ignored);
        assert!(index.get(id).is_none());

        index.heartbeat(id, clock.now()).unwrap();
        let outcome = index
            .upsert_location(id, location(52.52, 13.40, clock.now()))
            .unwrap();
        assert_eq!(outcome, LocationOutcome::Inserted);
        assert!(index.get(id).unwrap().is_online());
    }

    #[test]
    fn strict_mode_rejects_unknown_driver() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let settings = IndexSettings {
            strict_location: true,
            ..IndexSettings::default()
        };
        let index = DriverRuntimeIndex::new(clock.clone(), settings);

        let err = index
            .upsert_location(Uuid::from_u128(9), location(52.52, 13.40, clock.now()))
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn offline_driver_leaves_index_and_is_purged_after_ttl() {
        let (clock, index) = setup();
        let id = index.register(profile(1, 52.521, 13.405)).unwrap().driver_id;

        index.set_status(id, OnlineStatus::Offline, clock.now()).unwrap();
        let found = index
            .query_nearby(&PICKUP, 5.0, &DriverFilter::default())
            .unwrap();
        assert!(found.is_empty());
        assert!(index.get(id).is_some());

        clock.advance(Duration::seconds(200));
        assert!(index.purge_tombstones(clock.now()).is_empty());

        clock.advance(Duration::seconds(101));
        assert_eq!(index.purge_tombstones(clock.now()), vec![id]);
        assert!(index.get(id).is_none());
    }

    #[test]
    fn coming_back_online_clears_tombstone() {
        let (clock, index) = setup();
        let id = index.register(profile(1, 52.521, 13.405)).unwrap().driver_id;
        index.set_status(id, OnlineStatus::Offline, clock.now()).unwrap();
        index.set_status(id, OnlineStatus::Online, clock.now()).unwrap();

        clock.advance(Duration::seconds(301));
        index.heartbeat(id, clock.now()).unwrap();
        assert!(index.purge_tombstones(clock.now()).is_empty());
        assert_eq!(
            index
                .query_nearby(&PICKUP, 5.0, &DriverFilter::default())
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn re_registration_after_purge_keeps_counting_up() {
        let (clock, index) = setup();
        let id = index.register(profile(1, 52.521, 13.405)).unwrap().driver_id;
        index.heartbeat(id, clock.now()).unwrap();
        let old = index.set_status(id, OnlineStatus::Offline, clock.now()).unwrap();

        clock.advance(Duration::seconds(301));
        assert_eq!(index.purge_tombstones(clock.now()), vec![id]);

        let again = index.register(profile(1, 52.521, 13.405)).unwrap();
        assert!(again.version > old, "{} <= {old}", again.version);
    }

    #[test]
    fn sighting_insert_after_purge_keeps_counting_up() {
        let (clock, index) = setup();
        let id = index.register(profile(1, 52.521, 13.405)).unwrap().driver_id;
        let old = index.set_status(id, OnlineStatus::Offline, clock.now()).unwrap();

        clock.advance(Duration::seconds(301));
        assert_eq!(index.purge_tombstones(clock.now()), vec![id]);

        index.heartbeat(id, clock.now()).unwrap();
        let outcome = index
            .upsert_location(id, location(52.52, 13.40, clock.now()))
            .unwrap();
        assert_eq!(outcome, LocationOutcome::Inserted);
        assert!(index.get(id).unwrap().version > old);
    }

    #[test]
    fn cas_offline_transition_is_tombstoned() {
        let (clock, index) = setup();
        let d = index.register(profile(1, 52.521, 13.405)).unwrap();

        let outcome = index
            .cas_update(d.driver_id, d.version, |r| {
                r.online_status = OnlineStatus::Offline
            })
            .unwrap();
        assert_eq!(outcome, CasOutcome::Ok { version: d.version + 1 });
        assert!(
            index
                .query_nearby(&PICKUP, 5.0, &DriverFilter::default())
                .unwrap()
                .is_empty()
        );

        clock.advance(Duration::seconds(301));
        assert_eq!(index.purge_tombstones(clock.now()), vec![d.driver_id]);
    }

    #[test]
    fn cas_back_online_clears_tombstone() {
        let (clock, index) = setup();
        let d = index.register(profile(1, 52.521, 13.405)).unwrap();
        index.set_status(d.driver_id, OnlineStatus::Offline, clock.now()).unwrap();

        let v = index.get(d.driver_id).unwrap().version;
        index
            .cas_update(d.driver_id, v, |r| r.online_status = OnlineStatus::Online)
            .unwrap();

        clock.advance(Duration::seconds(301));
        assert!(index.purge_tombstones(clock.now()).is_empty());
        assert!(index.get(d.driver_id).is_some());
    }

    #[test]
    fn cas_update_detects_conflicts() {
        let (_clock, index) = setup();
        let d = index.register(profile(1, 52.521, 13.405)).unwrap();

        let ok = index
            .cas_update(d.driver_id, d.version, |r| r.consecutive_rejects += 1)
            .unwrap();
        assert_eq!(ok, CasOutcome::Ok { version: d.version + 1 });

        let stale = index
            .cas_update(d.driver_id, d.version, |r| r.consecutive_rejects += 1)
            .unwrap();
        assert_eq!(stale, CasOutcome::Conflict { actual: d.version + 1 });
        assert_eq!(index.get(d.driver_id).unwrap().consecutive_rejects, 1);

        let missing = index
            .cas_update(Uuid::from_u128(99), 1, |r| r.consecutive_rejects += 1)
            .unwrap();
        assert_eq!(missing, CasOutcome::NotFound);
    }

    #[test]
    fn assign_sets_current_then_queues_then_refuses() {
        let (_clock, index) = setup();
        let id = index.register(profile(1, 52.521, 13.405)).unwrap().driver_id;

        let v = index.get(id).unwrap().version;
        assert_eq!(
            index.assign_order(id, work(10), v).unwrap(),
            AssignOutcome::Ok { version: v + 1 }
        );
        let v = v + 1;
        assert_eq!(
            index.assign_order(id, work(11), v).unwrap(),
            AssignOutcome::Ok { version: v + 1 }
        );

        let driver = index.get(id).unwrap();
        assert_eq!(driver.current_order.as_ref().unwrap().order_id, Uuid::from_u128(10));
        assert_eq!(driver.queued_orders.len(), 1);
        assert!(driver.total_queue_size() <= driver.max_queue_capacity);

        assert_eq!(
            index.assign_order(id, work(12), driver.version).unwrap(),
            AssignOutcome::CapacityExceeded
        );
        assert_eq!(index.get(id).unwrap().version, driver.version);
    }

    #[test]
    fn assign_requires_online_and_current_version() {
        let (clock, index) = setup();
        let id = index.register(profile(1, 52.521, 13.405)).unwrap().driver_id;
        let v = index.get(id).unwrap().version;

        assert_eq!(
            index.assign_order(id, work(10), v - 1).unwrap(),
            AssignOutcome::Conflict { actual: v }
        );

        let v = index.set_status(id, OnlineStatus::Busy, clock.now()).unwrap();
        assert_eq!(
            index.assign_order(id, work(10), v).unwrap(),
            AssignOutcome::Ineligible
        );
    }

    #[test]
    fn completing_current_order_promotes_queue() {
        let (_clock, index) = setup();
        let id = index.register(profile(1, 52.521, 13.405)).unwrap().driver_id;
        let v = index.get(id).unwrap().version;
        index.assign_order(id, work(10), v).unwrap();
        index.assign_order(id, work(11), v + 1).unwrap();

        let driver = index.complete_order(id, Uuid::from_u128(10)).unwrap();
        assert_eq!(driver.current_order.unwrap().order_id, Uuid::from_u128(11));
        assert!(driver.queued_orders.is_empty());

        let err = index.complete_order(id, Uuid::from_u128(77)).unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
