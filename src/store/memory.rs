//! In-process [`DispatchStore`]. A single mutex makes every operation
//! serializable, which is what `try_accept` needs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::{AcceptOutcome, CancelOutcome, DispatchStore, OfferResponse};
use crate::error::{DispatchError, DispatchResult};
use crate::models::dispatch::{
    AcceptanceLock, Dispatch, DispatchOffer, DispatchStatus, DriverResponse, OfferState,
    ResponseKind, RoundStrategy, TerminalState,
};
use crate::models::order::{Order, OrderStatus};

#[derive(Debug)]
struct StoredOrder {
    order: Order,
    winner: Option<Uuid>,
    cancel_reason: Option<String>,
    closed_at: Option<DateTime<Utc>>,
}

impl StoredOrder {
    fn set_status(&mut self, status: OrderStatus, now: DateTime<Utc>) {
        self.order.status = status;
        self.order.version += 1;
        self.closed_at = status.is_terminal().then_some(now);
    }
}

#[derive(Debug)]
struct HeldLock {
    lock: AcceptanceLock,
    winner_offer: Uuid,
    superseded: Vec<Uuid>,
}

#[derive(Debug, Default)]
struct State {
    orders: HashMap<Uuid, StoredOrder>,
    dispatches: HashMap<Uuid, Dispatch>,
    dispatch_rounds: HashMap<(Uuid, u32), Uuid>,
    order_dispatches: HashMap<Uuid, Vec<Uuid>>,
    offers: HashMap<Uuid, DispatchOffer>,
    offer_keys: HashMap<(Uuid, Uuid), Uuid>,
    order_offers: HashMap<Uuid, Vec<Uuid>>,
    locks: HashMap<Uuid, HeldLock>,
}

impl State {
    fn order(&self, order_id: Uuid) -> DispatchResult<&StoredOrder> {
        self.orders
            .get(&order_id)
            .ok_or_else(|| DispatchError::NotFound(format!("order {order_id}")))
    }

    fn order_mut(&mut self, order_id: Uuid) -> DispatchResult<&mut StoredOrder> {
        self.orders
            .get_mut(&order_id)
            .ok_or_else(|| DispatchError::NotFound(format!("order {order_id}")))
    }

    fn live_offer_ids(&self, order_id: Uuid) -> Vec<Uuid> {
        self.order_offers
            .get(&order_id)
            .into_iter()
            .flatten()
            .filter(|id| {
                self.offers
                    .get(id)
                    .is_some_and(|o| o.state == OfferState::Offered)
            })
            .copied()
            .collect()
    }

    fn pending_dispatch_ids(&self, order_id: Uuid) -> Vec<Uuid> {
        self.order_dispatches
            .get(&order_id)
            .into_iter()
            .flatten()
            .filter(|id| {
                self.dispatches
                    .get(id)
                    .is_some_and(|d| d.status == DispatchStatus::Pending)
            })
            .copied()
            .collect()
    }

    /// Moves a live offer to a terminal state and mirrors it on its dispatch.
    fn close_offer(
        &mut self,
        offer_id: Uuid,
        state: OfferState,
        ts: DateTime<Utc>,
    ) -> Option<DispatchOffer> {
        let offer = self.offers.get_mut(&offer_id)?;
        if offer.state != OfferState::Offered {
            return None;
        }
        offer.state = state;
        offer.responded_at = Some(ts);

        let kind = match state {
            OfferState::Accepted => Some(ResponseKind::Accepted),
            OfferState::Rejected => Some(ResponseKind::Rejected),
            OfferState::Timeout => Some(ResponseKind::Timeout),
            OfferState::Offered | OfferState::Superseded => None,
        };
        if let (Some(kind), Some(dispatch)) = (kind, self.dispatches.get_mut(&offer.dispatch_id)) {
            dispatch.responses.insert(
                offer.driver_id,
                DriverResponse {
                    kind,
                    responded_at: ts,
                    reject_reason_type: offer.reject_reason_type,
                },
            );
        }
        Some(offer.clone())
    }

    fn reopen_offer(&mut self, offer_id: Uuid, now: DateTime<Utc>) {
        let Some(offer) = self.offers.get_mut(&offer_id) else {
            return;
        };
        if let Some(dispatch) = self.dispatches.get_mut(&offer.dispatch_id) {
            dispatch.responses.remove(&offer.driver_id);
        }
        offer.state = OfferState::Offered;
        offer.responded_at = None;
        if offer.expires_at <= now {
            self.close_offer(offer_id, OfferState::Timeout, now);
        }
    }
}

#[derive(Debug)]
pub struct InMemoryDispatchStore {
    state: Mutex<State>,
    lock_ttl: Duration,
}

impl InMemoryDispatchStore {
    pub fn new(lock_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            lock_ttl,
        }
    }

    pub fn order_count(&self) -> usize {
        self.state.lock().map(|s| s.orders.len()).unwrap_or(0)
    }

    pub fn cancel_reason(&self, order_id: Uuid) -> Option<String> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.orders.get(&order_id).and_then(|o| o.cancel_reason.clone()))
    }
}

#[async_trait]
impl DispatchStore for InMemoryDispatchStore {
    async fn begin_order(&self, mut order: Order, _now: DateTime<Utc>) -> DispatchResult<Order> {
        let mut state = self.state.lock()?;

        if let Some(existing) = state.orders.get(&order.order_id) {
            if existing.order.status.is_terminal() {
                return Err(DispatchError::OrderTerminal(order.order_id));
            }
            return Err(DispatchError::Duplicate(format!(
                "order {} is already dispatching",
                order.order_id
            )));
        }
        if order.status.is_terminal() {
            return Err(DispatchError::OrderTerminal(order.order_id));
        }

        order.status = OrderStatus::Dispatching;
        order.version += 1;
        state.orders.insert(
            order.order_id,
            StoredOrder {
                order: order.clone(),
                winner: None,
                cancel_reason: None,
                closed_at: None,
            },
        );
        Ok(order)
    }

    async fn get_order(&self, order_id: Uuid) -> DispatchResult<Option<Order>> {
        let state = self.state.lock()?;
        Ok(state.orders.get(&order_id).map(|o| o.order.clone()))
    }

    async fn create_dispatch(
        &self,
        order_id: Uuid,
        round: u32,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        strategy: RoundStrategy,
    ) -> DispatchResult<Dispatch> {
        let mut state = self.state.lock()?;

        if state.order(order_id)?.order.status.is_terminal() {
            return Err(DispatchError::OrderTerminal(order_id));
        }
        if state.dispatch_rounds.contains_key(&(order_id, round)) {
            return Err(DispatchError::Duplicate(format!(
                "dispatch for order {order_id} round {round}"
            )));
        }
        if !state.pending_dispatch_ids(order_id).is_empty() {
            return Err(DispatchError::Duplicate(format!(
                "order {order_id} still has an open round"
            )));
        }

        let round_seq = state
            .order_dispatches
            .get(&order_id)
            .map_or(0, |ids| ids.len() as u32)
            + 1;
        let dispatch = Dispatch {
            dispatch_id: Uuid::new_v4(),
            order_id,
            round,
            round_seq,
            status: DispatchStatus::Pending,
            created_at: now,
            expired_at: expires_at,
            selected_driver_id: None,
            responses: BTreeMap::new(),
            strategy,
        };

        state
            .dispatch_rounds
            .insert((order_id, round), dispatch.dispatch_id);
        state
            .order_dispatches
            .entry(order_id)
            .or_default()
            .push(dispatch.dispatch_id);
        state.dispatches.insert(dispatch.dispatch_id, dispatch.clone());
        Ok(dispatch)
    }

    async fn record_offer(
        &self,
        dispatch_id: Uuid,
        driver_id: Uuid,
        distance_km: f64,
        price_multiplier: f64,
        now: DateTime<Utc>,
    ) -> DispatchResult<DispatchOffer> {
        let mut state = self.state.lock()?;

        let dispatch = state
            .dispatches
            .get(&dispatch_id)
            .ok_or_else(|| DispatchError::NotFound(format!("dispatch {dispatch_id}")))?;
        let order_id = dispatch.order_id;
        let (round, expires_at, status) = (dispatch.round, dispatch.expired_at, dispatch.status);

        if let Some(existing) = state
            .offer_keys
            .get(&(order_id, driver_id))
            .and_then(|id| state.offers.get(id))
        {
            if existing.state == OfferState::Offered {
                return Ok(existing.clone());
            }
            return Err(DispatchError::Duplicate(format!(
                "driver {driver_id} already answered order {order_id}"
            )));
        }
        if state.order(order_id)?.order.status.is_terminal() {
            return Err(DispatchError::OrderTerminal(order_id));
        }
        if status != DispatchStatus::Pending {
            return Err(DispatchError::invalid(format!(
                "dispatch {dispatch_id} is closed"
            )));
        }

        let offer = DispatchOffer {
            offer_id: Uuid::new_v4(),
            dispatch_id,
            order_id,
            driver_id,
            round,
            offered_at: now,
            expires_at,
            driver_distance_km: distance_km,
            price_multiplier,
            state: OfferState::Offered,
            reject_reason_type: None,
            reject_reason: None,
            responded_at: None,
        };
        state.offer_keys.insert((order_id, driver_id), offer.offer_id);
        state
            .order_offers
            .entry(order_id)
            .or_default()
            .push(offer.offer_id);
        state.offers.insert(offer.offer_id, offer.clone());
        Ok(offer)
    }

    async fn record_response(
        &self,
        offer_id: Uuid,
        response: OfferResponse,
        ts: DateTime<Utc>,
    ) -> DispatchResult<DispatchOffer> {
        let mut state = self.state.lock()?;

        let offer = state
            .offers
            .get_mut(&offer_id)
            .ok_or_else(|| DispatchError::NotFound(format!("offer {offer_id}")))?;
        if offer.state != OfferState::Offered {
            return Err(DispatchError::NotOffered {
                order_id: offer.order_id,
                driver_id: offer.driver_id,
            });
        }

        let next = match response {
            OfferResponse::Rejected {
                reason_type,
                reason,
            } => {
                offer.reject_reason_type = Some(reason_type);
                offer.reject_reason = reason;
                OfferState::Rejected
            }
            OfferResponse::Timeout => OfferState::Timeout,
        };

        state
            .close_offer(offer_id, next, ts)
            .ok_or_else(|| DispatchError::storage(format!("offer {offer_id} vanished")))
    }

    async fn try_accept(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
        dispatch_id: Uuid,
        now: DateTime<Utc>,
    ) -> DispatchResult<AcceptOutcome> {
        let mut state = self.state.lock()?;

        let stored = state.order(order_id)?;
        if let Some(winner) = stored.winner {
            return Ok(AcceptOutcome::AlreadyAccepted { winner });
        }
        if let Some(held) = state.locks.get(&order_id) {
            if held.lock.expires_at > now {
                return Ok(AcceptOutcome::AlreadyAccepted {
                    winner: held.lock.driver_id,
                });
            }
        }
        if stored.order.status.is_terminal() {
            return Ok(AcceptOutcome::Stale);
        }

        let Some(offer_id) = state.offer_keys.get(&(order_id, driver_id)).copied() else {
            return Ok(AcceptOutcome::Stale);
        };
        let live = state.offers.get(&offer_id).is_some_and(|o| {
            o.dispatch_id == dispatch_id && o.state == OfferState::Offered && now < o.expires_at
        });
        let dispatch_open = state
            .dispatches
            .get(&dispatch_id)
            .is_some_and(|d| d.status == DispatchStatus::Pending);
        if !live || !dispatch_open {
            return Ok(AcceptOutcome::Stale);
        }

        let siblings: Vec<Uuid> = state
            .live_offer_ids(order_id)
            .into_iter()
            .filter(|id| *id != offer_id)
            .collect();

        let offer = state
            .close_offer(offer_id, OfferState::Accepted, now)
            .ok_or_else(|| DispatchError::storage(format!("offer {offer_id} vanished")))?;
        let superseded: Vec<DispatchOffer> = siblings
            .iter()
            .filter_map(|id| state.close_offer(*id, OfferState::Superseded, now))
            .collect();

        if let Some(dispatch) = state.dispatches.get_mut(&dispatch_id) {
            dispatch.status = DispatchStatus::Completed;
            dispatch.selected_driver_id = Some(driver_id);
        }
        let stored = state.order_mut(order_id)?;
        stored.winner = Some(driver_id);
        stored.set_status(OrderStatus::Accepted, now);

        state.locks.insert(
            order_id,
            HeldLock {
                lock: AcceptanceLock {
                    order_id,
                    driver_id,
                    dispatch_id,
                    acquired_at: now,
                    expires_at: now + self.lock_ttl,
                },
                winner_offer: offer_id,
                superseded: siblings,
            },
        );

        Ok(AcceptOutcome::Won { offer, superseded })
    }

    async fn revert_accept(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
        now: DateTime<Utc>,
    ) -> DispatchResult<()> {
        let mut state = self.state.lock()?;

        match state.locks.get(&order_id) {
            None => return Ok(()),
            Some(held) if held.lock.driver_id != driver_id => {
                return Err(DispatchError::Lost {
                    order_id,
                    winner: held.lock.driver_id,
                });
            }
            Some(_) => {}
        }
        let Some(held) = state.locks.remove(&order_id) else {
            return Ok(());
        };

        let stored = state.order_mut(order_id)?;
        stored.winner = None;
        stored.set_status(OrderStatus::Dispatching, now);

        if let Some(dispatch) = state.dispatches.get_mut(&held.lock.dispatch_id) {
            dispatch.status = DispatchStatus::Pending;
            dispatch.selected_driver_id = None;
        }
        state.reopen_offer(held.winner_offer, now);
        for offer_id in held.superseded {
            state.reopen_offer(offer_id, now);
        }
        Ok(())
    }

    async fn expire_offers(&self, now: DateTime<Utc>) -> DispatchResult<Vec<Uuid>> {
        let mut state = self.state.lock()?;

        let mut due: Vec<(DateTime<Utc>, Uuid)> = state
            .offers
            .values()
            .filter(|o| o.state == OfferState::Offered && o.expires_at <= now)
            .map(|o| (o.expires_at, o.offer_id))
            .collect();
        due.sort();

        let expired = due
            .into_iter()
            .filter_map(|(_, id)| state.close_offer(id, OfferState::Timeout, now))
            .map(|o| o.offer_id)
            .collect();
        state.locks.retain(|_, held| held.lock.expires_at > now);
        Ok(expired)
    }

    async fn prune_closed_orders(&self, closed_before: DateTime<Utc>) -> DispatchResult<usize> {
        let mut state = self.state.lock()?;

        let closed: Vec<Uuid> = state
            .orders
            .iter()
            .filter(|(_, o)| o.closed_at.is_some_and(|at| at <= closed_before))
            .map(|(id, _)| *id)
            .collect();

        for order_id in &closed {
            state.orders.remove(order_id);
            state.locks.remove(order_id);
            for dispatch_id in state.order_dispatches.remove(order_id).unwrap_or_default() {
                if let Some(dispatch) = state.dispatches.remove(&dispatch_id) {
                    state.dispatch_rounds.remove(&(*order_id, dispatch.round));
                }
            }
            for offer_id in state.order_offers.remove(order_id).unwrap_or_default() {
                if let Some(offer) = state.offers.remove(&offer_id) {
                    state.offer_keys.remove(&(*order_id, offer.driver_id));
                }
            }
        }
        Ok(closed.len())
    }

    async fn close_dispatch(
        &self,
        dispatch_id: Uuid,
        status: DispatchStatus,
    ) -> DispatchResult<Dispatch> {
        if !status.is_terminal() {
            return Err(DispatchError::invalid("dispatch can only close to a terminal status"));
        }
        let mut state = self.state.lock()?;
        let dispatch = state
            .dispatches
            .get_mut(&dispatch_id)
            .ok_or_else(|| DispatchError::NotFound(format!("dispatch {dispatch_id}")))?;
        if dispatch.status == DispatchStatus::Pending {
            dispatch.status = status;
        }
        Ok(dispatch.clone())
    }

    async fn cancel_dispatch(
        &self,
        order_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<CancelOutcome> {
        let mut state = self.state.lock()?;

        let stored = state.order(order_id)?;
        if let Some(driver_id) = stored.winner {
            return Ok(CancelOutcome::AlreadyAccepted { driver_id });
        }
        match stored.order.status {
            OrderStatus::Cancelled => {
                return Ok(CancelOutcome::Cancelled {
                    superseded: Vec::new(),
                    changed: false,
                });
            }
            OrderStatus::Expired | OrderStatus::Accepted => {
                return Err(DispatchError::OrderTerminal(order_id));
            }
            OrderStatus::Requested | OrderStatus::Dispatching => {}
        }

        let superseded = state
            .live_offer_ids(order_id)
            .into_iter()
            .filter_map(|id| state.close_offer(id, OfferState::Superseded, now))
            .collect();
        for dispatch_id in state.pending_dispatch_ids(order_id) {
            if let Some(dispatch) = state.dispatches.get_mut(&dispatch_id) {
                dispatch.status = DispatchStatus::Cancelled;
            }
        }

        let stored = state.order_mut(order_id)?;
        stored.cancel_reason = Some(reason.to_string());
        stored.set_status(OrderStatus::Cancelled, now);

        Ok(CancelOutcome::Cancelled {
            superseded,
            changed: true,
        })
    }

    async fn expire_order(&self, order_id: Uuid, now: DateTime<Utc>) -> DispatchResult<bool> {
        let mut state = self.state.lock()?;

        if state.order(order_id)?.order.status.is_terminal() {
            return Ok(false);
        }
        for offer_id in state.live_offer_ids(order_id) {
            state.close_offer(offer_id, OfferState::Timeout, now);
        }
        for dispatch_id in state.pending_dispatch_ids(order_id) {
            if let Some(dispatch) = state.dispatches.get_mut(&dispatch_id) {
                dispatch.status = DispatchStatus::Timeout;
            }
        }
        state.order_mut(order_id)?.set_status(OrderStatus::Expired, now);
        Ok(true)
    }

    async fn get_order_terminal_state(&self, order_id: Uuid) -> DispatchResult<TerminalState> {
        let state = self.state.lock()?;
        let stored = state.order(order_id)?;
        Ok(match (stored.order.status, stored.winner) {
            (_, Some(winner)) => TerminalState::Accepted(winner),
            (OrderStatus::Cancelled, None) => TerminalState::Cancelled,
            (OrderStatus::Expired, None) => TerminalState::Expired,
            _ => TerminalState::Open,
        })
    }

    async fn get_offer(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
    ) -> DispatchResult<Option<DispatchOffer>> {
        let state = self.state.lock()?;
        Ok(state
            .offer_keys
            .get(&(order_id, driver_id))
            .and_then(|id| state.offers.get(id))
            .cloned())
    }

    async fn get_dispatch(&self, dispatch_id: Uuid) -> DispatchResult<Option<Dispatch>> {
        let state = self.state.lock()?;
        Ok(state.dispatches.get(&dispatch_id).cloned())
    }

    async fn offers_for_dispatch(&self, dispatch_id: Uuid) -> DispatchResult<Vec<DispatchOffer>> {
        let state = self.state.lock()?;
        let Some(order_id) = state.dispatches.get(&dispatch_id).map(|d| d.order_id) else {
            return Ok(Vec::new());
        };
        Ok(state
            .order_offers
            .get(&order_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.offers.get(id))
            .filter(|o| o.dispatch_id == dispatch_id)
            .cloned()
            .collect())
    }

    async fn offers_for_order(&self, order_id: Uuid) -> DispatchResult<Vec<DispatchOffer>> {
        let state = self.state.lock()?;
        Ok(state
            .order_offers
            .get(&order_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.offers.get(id))
            .cloned()
            .collect())
    }

    async fn dispatches_for_order(&self, order_id: Uuid) -> DispatchResult<Vec<Dispatch>> {
        let state = self.state.lock()?;
        Ok(state
            .order_dispatches
            .get(&order_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.dispatches.get(id))
            .cloned()
            .collect())
    }

    async fn offered_drivers(&self, order_id: Uuid) -> DispatchResult<HashSet<Uuid>> {
        let state = self.state.lock()?;
        Ok(state
            .order_offers
            .get(&order_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.offers.get(id))
            .map(|o| o.driver_id)
            .collect())
    }

    async fn acceptance_lock(&self, order_id: Uuid) -> DispatchResult<Option<AcceptanceLock>> {
        let state = self.state.lock()?;
        Ok(state.locks.get(&order_id).map(|held| held.lock.clone()))
    }
}
