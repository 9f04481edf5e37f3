#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ride_dispatch::clock::{Clock, ManualClock};
use ride_dispatch::config::DispatchSettings;
use ride_dispatch::engine::Engine;
use ride_dispatch::engine::notifier::{DispatchEvent, NotifyError, OfferNotifier};
use ride_dispatch::engine::scheduler::Dispatcher;
use ride_dispatch::error::{DispatchError, DispatchResult};
use ride_dispatch::geo::GeoPoint;
use ride_dispatch::models::dispatch::{
    AcceptanceLock, Dispatch, DispatchOffer, DispatchStatus, RoundStrategy, TerminalState,
};
use ride_dispatch::models::driver::DriverProfile;
use ride_dispatch::models::order::{Order, OrderStatus, OrderSummary, ScheduleType, VehicleFilter};
use ride_dispatch::store::{AcceptOutcome, CancelOutcome, DispatchStore, OfferResponse};
use uuid::Uuid;

pub const PICKUP: GeoPoint = GeoPoint {
    lat: 52.52,
    lng: 13.405,
};

const KM_PER_DEGREE: f64 = 6_371.0 * std::f64::consts::PI / 180.0;

/// Point `km` due north of `origin`, on the haversine sphere.
pub fn north_of(origin: GeoPoint, km: f64) -> GeoPoint {
    GeoPoint::new(origin.lat + km / KM_PER_DEGREE, origin.lng)
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
}

/// Notifier that keeps every event in order and can be switched to fail.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<DispatchEvent>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<DispatchEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn fail_deliveries(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn offered_drivers(&self, order_id: Uuid) -> Vec<Uuid> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                DispatchEvent::Offer { driver_id, order, .. } if order.order_id == order_id => {
                    Some(driver_id)
                }
                _ => None,
            })
            .collect()
    }

    pub fn exhausted_count(&self, order_id: Uuid) -> usize {
        self.events()
            .iter()
            .filter(|event| {
                matches!(event, DispatchEvent::Exhausted { order_id: id, .. } if *id == order_id)
            })
            .count()
    }

    fn record(&self, event: DispatchEvent) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Delivery("push gateway down".to_string()));
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[async_trait]
impl OfferNotifier for RecordingNotifier {
    async fn offer(
        &self,
        driver_id: Uuid,
        order: &OrderSummary,
        price_multiplier: f64,
        expires_at: DateTime<Utc>,
    ) -> Result<(), NotifyError> {
        self.record(DispatchEvent::Offer {
            driver_id,
            order: order.clone(),
            price_multiplier,
            expires_at,
        })
    }

    async fn notify_assigned(&self, driver_id: Uuid, order_id: Uuid) -> Result<(), NotifyError> {
        self.record(DispatchEvent::Assigned { driver_id, order_id })
    }

    async fn notify_superseded(&self, driver_id: Uuid, order_id: Uuid) -> Result<(), NotifyError> {
        self.record(DispatchEvent::Superseded { driver_id, order_id })
    }

    async fn notify_exhausted(&self, user_id: Uuid, order_id: Uuid) -> Result<(), NotifyError> {
        self.record(DispatchEvent::Exhausted { user_id, order_id })
    }

    async fn notify_cancelled(
        &self,
        recipients: &[Uuid],
        order_id: Uuid,
        reason: &str,
    ) -> Result<(), NotifyError> {
        self.record(DispatchEvent::Cancelled {
            recipients: recipients.to_vec(),
            order_id,
            reason: reason.to_string(),
        })
    }
}

/// A dispatcher over the in-memory engine with a hand-driven clock.
pub struct Harness {
    pub dispatcher: Dispatcher,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new(settings: DispatchSettings) -> Self {
        Self::with_shards(settings, 2)
    }

    pub fn with_shards(settings: DispatchSettings, shards: usize) -> Self {
        Self::with_store(settings, shards, |store| store)
    }

    /// Same as [`Harness::with_shards`] with the dispatch store replaced by
    /// whatever `wrap` makes of the in-memory one.
    pub fn with_store(
        settings: DispatchSettings,
        shards: usize,
        wrap: impl FnOnce(Arc<dyn DispatchStore>) -> Arc<dyn DispatchStore>,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let notifier = Arc::new(RecordingNotifier::default());
        let mut engine = Engine::in_memory(settings, clock.clone(), notifier.clone());
        engine.store = wrap(engine.store);
        Self {
            dispatcher: Dispatcher::start(engine, shards, 64),
            clock,
            notifier,
        }
    }

    /// Harness whose store can be told to fail individual calls.
    pub fn flaky(settings: DispatchSettings) -> (Self, Arc<FlakyStore>) {
        let mut flaky = None;
        let harness = Self::with_store(settings, 2, |inner| {
            let store = Arc::new(FlakyStore::new(inner));
            flaky = Some(store.clone());
            store as Arc<dyn DispatchStore>
        });
        let store = flaky.expect("store wrapped");
        (harness, store)
    }

    pub fn engine(&self) -> &Engine {
        self.dispatcher.engine()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Moves the clock and runs one tick at the new time.
    pub async fn advance_secs(&self, secs: i64) {
        let now = self.clock.advance(chrono::Duration::seconds(secs));
        self.dispatcher.tick(now).await.unwrap();
    }

    pub fn register(&self, id: u128, location: GeoPoint, rating: f64, acceptance: f64) -> Uuid {
        let driver_id = Uuid::from_u128(id);
        self.engine()
            .runtime
            .register(profile(driver_id, location, rating, acceptance))
            .unwrap();
        driver_id
    }
}

pub fn profile(driver_id: Uuid, location: GeoPoint, rating: f64, acceptance: f64) -> DriverProfile {
    DriverProfile {
        driver_id,
        location,
        vehicle_id: format!("v-{}", driver_id.as_u128()),
        vehicle_category: "standard".to_string(),
        vehicle_level: 1,
        rating,
        acceptance_rate: acceptance,
        experience_level: 4,
        max_queue_capacity: 2,
    }
}

pub fn instant_order(id: u128, created_at: DateTime<Utc>) -> Order {
    Order {
        order_id: Uuid::from_u128(id),
        user_id: Uuid::from_u128(9_000 + id),
        status: OrderStatus::Requested,
        pickup: PICKUP,
        dropoff: north_of(PICKUP, 8.0),
        passenger_count: 1,
        vehicle_filter: VehicleFilter::default(),
        schedule_type: ScheduleType::Instant,
        scheduled_at: None,
        estimated_duration_min: 20,
        created_at,
        version: 0,
    }
}

/// Rounds with no rating or acceptance floors, one radius per round.
pub fn settings_with_rounds(max_drivers: u32, radii: &[f64], timeout_seconds: u64) -> DispatchSettings {
    let mut doc = format!(
        "[dispatch]\ntimeout_seconds = {timeout_seconds}\n\n[dispatch.rounds]\nmax_rounds = {}\ndrivers_per_round = {max_drivers}\nradius_growth = 1.0\n",
        radii.len()
    );
    for radius in radii {
        doc.push_str(&format!(
            "\n[[dispatch.rounds.round_strategys]]\nmax_drivers = {max_drivers}\nsearch_radius = {radius}\nprice_multiplier = 1.0\nmin_rating_score = 0.0\nmin_acceptance_rate = 0.0\nmax_consecutive_rejects = 10\n"
        ));
    }
    DispatchSettings::from_toml_str(&doc).unwrap()
}

/// Store that delegates to the in-memory one and fails chosen calls once.
pub struct FlakyStore {
    inner: Arc<dyn DispatchStore>,
    armed: Mutex<HashMap<&'static str, usize>>,
    failures: Mutex<Vec<&'static str>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn DispatchStore>) -> Self {
        Self {
            inner,
            armed: Mutex::new(HashMap::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// The `nth` next call (1-based) to `operation` fails with a storage error.
    pub fn fail_nth(&self, operation: &'static str, nth: usize) {
        self.armed.lock().unwrap().insert(operation, nth.max(1));
    }

    pub fn failures(&self) -> Vec<&'static str> {
        self.failures.lock().unwrap().clone()
    }

    fn check(&self, operation: &'static str) -> DispatchResult<()> {
        let mut armed = self.armed.lock().unwrap();
        let Some(left) = armed.get_mut(operation) else {
            return Ok(());
        };
        *left -= 1;
        if *left > 0 {
            return Ok(());
        }
        armed.remove(operation);
        self.failures.lock().unwrap().push(operation);
        Err(DispatchError::storage(format!("{operation}: connection reset")))
    }
}

#[async_trait]
impl DispatchStore for FlakyStore {
    async fn begin_order(&self, order: Order, now: DateTime<Utc>) -> DispatchResult<Order> {
        self.check("begin_order")?;
        self.inner.begin_order(order, now).await
    }

    async fn get_order(&self, order_id: Uuid) -> DispatchResult<Option<Order>> {
        self.inner.get_order(order_id).await
    }

    async fn create_dispatch(
        &self,
        order_id: Uuid,
        round: u32,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        strategy: RoundStrategy,
    ) -> DispatchResult<Dispatch> {
        self.check("create_dispatch")?;
        self.inner
            .create_dispatch(order_id, round, now, expires_at, strategy)
            .await
    }

    async fn record_offer(
        &self,
        dispatch_id: Uuid,
        driver_id: Uuid,
        distance_km: f64,
        price_multiplier: f64,
        now: DateTime<Utc>,
    ) -> DispatchResult<DispatchOffer> {
        self.check("record_offer")?;
        self.inner
            .record_offer(dispatch_id, driver_id, distance_km, price_multiplier, now)
            .await
    }

    async fn record_response(
        &self,
        offer_id: Uuid,
        response: OfferResponse,
        ts: DateTime<Utc>,
    ) -> DispatchResult<DispatchOffer> {
        self.check("record_response")?;
        self.inner.record_response(offer_id, response, ts).await
    }

    async fn try_accept(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
        dispatch_id: Uuid,
        now: DateTime<Utc>,
    ) -> DispatchResult<AcceptOutcome> {
        self.check("try_accept")?;
        self.inner
            .try_accept(order_id, driver_id, dispatch_id, now)
            .await
    }

    async fn revert_accept(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
        now: DateTime<Utc>,
    ) -> DispatchResult<()> {
        self.inner.revert_accept(order_id, driver_id, now).await
    }

    async fn expire_offers(&self, now: DateTime<Utc>) -> DispatchResult<Vec<Uuid>> {
        self.inner.expire_offers(now).await
    }

    async fn prune_closed_orders(&self, closed_before: DateTime<Utc>) -> DispatchResult<usize> {
        self.inner.prune_closed_orders(closed_before).await
    }

    async fn close_dispatch(
        &self,
        dispatch_id: Uuid,
        status: DispatchStatus,
    ) -> DispatchResult<Dispatch> {
        self.check("close_dispatch")?;
        self.inner.close_dispatch(dispatch_id, status).await
    }

    async fn cancel_dispatch(
        &self,
        order_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<CancelOutcome> {
        self.inner.cancel_dispatch(order_id, reason, now).await
    }

    async fn expire_order(&self, order_id: Uuid, now: DateTime<Utc>) -> DispatchResult<bool> {
        self.check("expire_order")?;
        self.inner.expire_order(order_id, now).await
    }

    async fn get_order_terminal_state(&self, order_id: Uuid) -> DispatchResult<TerminalState> {
        self.inner.get_order_terminal_state(order_id).await
    }

    async fn get_offer(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
    ) -> DispatchResult<Option<DispatchOffer>> {
        self.inner.get_offer(order_id, driver_id).await
    }

    async fn get_dispatch(&self, dispatch_id: Uuid) -> DispatchResult<Option<Dispatch>> {
        self.inner.get_dispatch(dispatch_id).await
    }

    async fn offers_for_dispatch(&self, dispatch_id: Uuid) -> DispatchResult<Vec<DispatchOffer>> {
        self.inner.offers_for_dispatch(dispatch_id).await
    }

    async fn offers_for_order(&self, order_id: Uuid) -> DispatchResult<Vec<DispatchOffer>> {
        self.inner.offers_for_order(order_id).await
    }

    async fn dispatches_for_order(&self, order_id: Uuid) -> DispatchResult<Vec<Dispatch>> {
        self.inner.dispatches_for_order(order_id).await
    }

    async fn offered_drivers(&self, order_id: Uuid) -> DispatchResult<HashSet<Uuid>> {
        self.inner.offered_drivers(order_id).await
    }

    async fn acceptance_lock(&self, order_id: Uuid) -> DispatchResult<Option<AcceptanceLock>> {
        self.inner.acceptance_lock(order_id).await
    }
}
