//! Durable dispatch state: rounds, offers and the per-order acceptance lock.
//!
//! Unique keys: one dispatch per `(order_id, round)`, one offer per
//! `(order_id, driver_id)`, one acceptance lock per `order_id`. Once an order
//! is terminal every state change against it is refused.

pub mod memory;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::DispatchResult;
use crate::models::dispatch::{
    AcceptanceLock, Dispatch, DispatchOffer, DispatchStatus, RejectReason, RoundStrategy,
    TerminalState,
};
use crate::models::order::Order;

pub use memory::InMemoryDispatchStore;

#[derive(Debug, Clone, PartialEq)]
pub enum OfferResponse {
    Rejected {
        reason_type: RejectReason,
        reason: Option<String>,
    },
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AcceptOutcome {
    Won {
        offer: DispatchOffer,
        superseded: Vec<DispatchOffer>,
    },
    AlreadyAccepted {
        winner: Uuid,
    },
    Stale,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled {
        superseded: Vec<DispatchOffer>,
        /// False when the order had already been cancelled earlier.
        changed: bool,
    },
    AlreadyAccepted {
        driver_id: Uuid,
    },
}

#[async_trait]
pub trait DispatchStore: Send + Sync {
    /// Records a new order and moves it to `dispatching`.
    async fn begin_order(&self, order: Order, now: DateTime<Utc>) -> DispatchResult<Order>;

    async fn get_order(&self, order_id: Uuid) -> DispatchResult<Option<Order>>;

    /// Opens round `round` for an order. Fails on a duplicate round, on a
    /// terminal order, and while an earlier round is still pending.
    async fn create_dispatch(
        &self,
        order_id: Uuid,
        round: u32,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        strategy: RoundStrategy,
    ) -> DispatchResult<Dispatch>;

    /// Returns the live offer when one already exists for the pair.
    async fn record_offer(
        &self,
        dispatch_id: Uuid,
        driver_id: Uuid,
        distance_km: f64,
        price_multiplier: f64,
        now: DateTime<Utc>,
    ) -> DispatchResult<DispatchOffer>;

    /// Moves an `offered` offer to `rejected` or `timeout`.
    async fn record_response(
        &self,
        offer_id: Uuid,
        response: OfferResponse,
        ts: DateTime<Utc>,
    ) -> DispatchResult<DispatchOffer>;

    /// First-accept-wins. Checks the order is open and the offer live, takes
    /// the acceptance lock, accepts the offer, supersedes its live siblings and
    /// completes the dispatch, all in one step.
    async fn try_accept(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
        dispatch_id: Uuid,
        now: DateTime<Utc>,
    ) -> DispatchResult<AcceptOutcome>;

    /// Undoes a won acceptance whose driver assignment could not be applied.
    async fn revert_accept(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
        now: DateTime<Utc>,
    ) -> DispatchResult<()>;

    /// Times out every `offered` offer past its expiry and releases expired
    /// acceptance locks.
    async fn expire_offers(&self, now: DateTime<Utc>) -> DispatchResult<Vec<Uuid>>;

    /// Forgets orders that turned terminal at or before `closed_before`,
    /// together with their rounds, offers and lock. Returns how many went.
    async fn prune_closed_orders(&self, closed_before: DateTime<Utc>) -> DispatchResult<usize>;

    /// Moves a pending dispatch to a terminal status. No-op if already terminal.
    async fn close_dispatch(
        &self,
        dispatch_id: Uuid,
        status: DispatchStatus,
    ) -> DispatchResult<Dispatch>;

    async fn cancel_dispatch(
        &self,
        order_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<CancelOutcome>;

    /// Marks an open order `expired`. Returns false if it was already terminal.
    async fn expire_order(&self, order_id: Uuid, now: DateTime<Utc>) -> DispatchResult<bool>;

    async fn get_order_terminal_state(&self, order_id: Uuid) -> DispatchResult<TerminalState>;

    async fn get_offer(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
    ) -> DispatchResult<Option<DispatchOffer>>;

    async fn get_dispatch(&self, dispatch_id: Uuid) -> DispatchResult<Option<Dispatch>>;

    async fn offers_for_dispatch(&self, dispatch_id: Uuid) -> DispatchResult<Vec<DispatchOffer>>;

    async fn offers_for_order(&self, order_id: Uuid) -> DispatchResult<Vec<DispatchOffer>>;

    async fn dispatches_for_order(&self, order_id: Uuid) -> DispatchResult<Vec<Dispatch>>;

    /// Every driver that has ever held an offer for the order.
    async fn offered_drivers(&self, order_id: Uuid) -> DispatchResult<HashSet<Uuid>>;

    async fn acceptance_lock(&self, order_id: Uuid) -> DispatchResult<Option<AcceptanceLock>>;
}
