//! Round Scheduler. Orders are hash-partitioned over shard workers; each
//! worker owns the round state of its orders and processes their commands
//! one at a time, so per-order transitions are totally ordered.
//!
//! Accept, reject and cancel are routed to the order's shard as well. The
//! store's acceptance lock still decides first-accept-wins on its own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::TimerQueue;
use crate::engine::Engine;
use crate::engine::notifier::deliver;
use crate::engine::selector::select_candidates;
use crate::error::{DispatchError, DispatchResult};
use crate::models::dispatch::{
    CancelInitiator, DispatchOffer, DispatchStatus, OfferState, RejectReason, TerminalState,
};
use crate::models::driver::QueuedOrder;
use crate::models::order::{Order, OrderStatus};
use crate::runtime::{AssignOutcome, CasOutcome};
use crate::store::{AcceptOutcome, CancelOutcome, OfferResponse};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitReceipt {
    pub order_id: Uuid,
    /// Dispatch of the round that is running, if any.
    pub dispatch_id: Option<Uuid>,
    pub round: u32,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AcceptResult {
    Won {
        order_id: Uuid,
        driver_id: Uuid,
        dispatch_id: Uuid,
    },
    Lost {
        winner: Uuid,
    },
    Stale,
    ConflictRetry,
}

impl AcceptResult {
    fn label(&self) -> &'static str {
        match self {
            AcceptResult::Won { .. } => "won",
            AcceptResult::Lost { .. } => "lost",
            AcceptResult::Stale => "stale",
            AcceptResult::ConflictRetry => "conflict_retry",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CancelResult {
    Cancelled,
    AlreadyAccepted { driver_id: Uuid },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub expired_offers: usize,
    pub purged_drivers: usize,
    pub pruned_orders: usize,
}

enum Command {
    Submit {
        order: Order,
        reply: oneshot::Sender<DispatchResult<SubmitReceipt>>,
    },
    Accept {
        order_id: Uuid,
        driver_id: Uuid,
        reply: oneshot::Sender<DispatchResult<AcceptResult>>,
    },
    Reject {
        order_id: Uuid,
        driver_id: Uuid,
        reason_type: RejectReason,
        reason: Option<String>,
        reply: oneshot::Sender<DispatchResult<()>>,
    },
    Cancel {
        order_id: Uuid,
        initiator: CancelInitiator,
        reason: String,
        reply: oneshot::Sender<DispatchResult<CancelResult>>,
    },
    Tick {
        now: DateTime<Utc>,
        reply: oneshot::Sender<()>,
    },
}

/// Front door of the engine API. Clones share the same shard workers.
#[derive(Clone)]
pub struct Dispatcher {
    engine: Engine,
    shards: Arc<[mpsc::Sender<Command>]>,
}

impl Dispatcher {
    /// Spawns `shard_count` workers on the current runtime.
    pub fn start(engine: Engine, shard_count: usize, queue_size: usize) -> Self {
        let shards: Vec<mpsc::Sender<Command>> = (0..shard_count.max(1))
            .map(|id| {
                let (tx, rx) = mpsc::channel(queue_size.max(1));
                tokio::spawn(Shard::new(id, engine.clone()).run(rx));
                tx
            })
            .collect();

        info!(shards = shards.len(), "dispatcher started");
        Self {
            engine,
            shards: shards.into(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub async fn submit(&self, order: Order) -> DispatchResult<SubmitReceipt> {
        if !self.engine.settings.enabled {
            return Err(DispatchError::Disabled);
        }
        order.validate()?;
        self.call(order.order_id, |reply| Command::Submit { order, reply })
            .await
    }

    pub async fn accept(&self, order_id: Uuid, driver_id: Uuid) -> DispatchResult<AcceptResult> {
        self.call(order_id, |reply| Command::Accept {
            order_id,
            driver_id,
            reply,
        })
        .await
    }

    /// `reason_type` must be one of the exact reject reason tokens.
    pub async fn reject(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
        reason_type: &str,
        reason: Option<String>,
    ) -> DispatchResult<()> {
        let reason_type: RejectReason = reason_type.parse()?;
        self.call(order_id, |reply| Command::Reject {
            order_id,
            driver_id,
            reason_type,
            reason,
            reply,
        })
        .await
    }

    pub async fn cancel(
        &self,
        order_id: Uuid,
        initiator: CancelInitiator,
        reason: impl Into<String>,
    ) -> DispatchResult<CancelResult> {
        let reason = reason.into();
        self.call(order_id, |reply| Command::Cancel {
            order_id,
            initiator,
            reason,
            reply,
        })
        .await
    }

    /// Times out expired offers, purges tombstoned drivers, then lets every
    /// shard advance the rounds that are due. Once all shards have, orders
    /// closed longer than the retention window are pruned.
    pub async fn tick(&self, now: DateTime<Utc>) -> DispatchResult<TickReport> {
        let expired = self.engine.store.expire_offers(now).await?;
        self.engine.metrics.count_offers("timeout", expired.len());

        let purged = self.engine.runtime.purge_tombstones(now);
        if !purged.is_empty() {
            info!(count = purged.len(), "tombstoned drivers purged");
        }
        self.engine
            .metrics
            .drivers_online
            .set(self.engine.runtime.online_count() as i64);

        let mut pending = Vec::with_capacity(self.shards.len());
        for shard in self.shards.iter() {
            let (reply, done) = oneshot::channel();
            shard
                .send(Command::Tick { now, reply })
                .await
                .map_err(|err| DispatchError::storage(format!("shard unavailable: {err}")))?;
            pending.push(done);
        }
        for done in pending {
            done.await
                .map_err(|_| DispatchError::storage("shard dropped a tick"))?;
        }

        let pruned = self
            .engine
            .store
            .prune_closed_orders(now - self.engine.settings.retention())
            .await?;
        if pruned > 0 {
            debug!(count = pruned, "closed orders pruned");
        }

        Ok(TickReport {
            expired_offers: expired.len(),
            purged_drivers: purged.len(),
            pruned_orders: pruned,
        })
    }

    async fn call<T>(
        &self,
        order_id: Uuid,
        command: impl FnOnce(oneshot::Sender<DispatchResult<T>>) -> Command,
    ) -> DispatchResult<T> {
        let (reply, response) = oneshot::channel();
        self.shard_for(order_id)
            .send(command(reply))
            .await
            .map_err(|err| DispatchError::storage(format!("shard unavailable: {err}")))?;
        response
            .await
            .map_err(|_| DispatchError::storage("shard dropped the request"))?
    }

    fn shard_for(&self, order_id: Uuid) -> &mpsc::Sender<Command> {
        let idx = (order_id.as_u128() % self.shards.len() as u128) as usize;
        &self.shards[idx]
    }
}

/// Drives [`Dispatcher::tick`] every `interval` with the engine clock.
pub fn spawn_ticker(dispatcher: Dispatcher, interval: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let now = dispatcher.engine().clock.now();
            if let Err(err) = dispatcher.tick(now).await {
                warn!(error = %err, "dispatch tick failed");
            }
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    /// Scheduled order waiting for its lead time.
    Deferred,
    /// A storage failure interrupted the round; retried on wake.
    CoolOff,
    Waiting {
        dispatch_id: Uuid,
        expires_at: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct OrderTask {
    order: Order,
    round: u32,
    phase: Phase,
}

enum RoundStart {
    Offered {
        dispatch_id: Uuid,
        expires_at: DateTime<Utc>,
    },
    NoCandidates,
    Terminal,
}

struct RoundFailure {
    /// Set when the failure hit after the round's dispatch was created.
    dispatch_id: Option<Uuid>,
    error: DispatchError,
}

impl RoundFailure {
    fn before(error: DispatchError) -> Self {
        Self {
            dispatch_id: None,
            error,
        }
    }
}

struct Shard {
    id: usize,
    engine: Engine,
    tasks: HashMap<Uuid, OrderTask>,
    timers: TimerQueue,
}

impl Shard {
    fn new(id: usize, engine: Engine) -> Self {
        Self {
            id,
            engine,
            tasks: HashMap::new(),
            timers: TimerQueue::new(),
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        debug!(shard = self.id, "dispatch shard started");

        while let Some(command) = commands.recv().await {
            match command {
                Command::Submit { order, reply } => {
                    let _ = reply.send(self.submit(order).await);
                }
                Command::Accept {
                    order_id,
                    driver_id,
                    reply,
                } => {
                    let _ = reply.send(self.accept(order_id, driver_id).await);
                }
                Command::Reject {
                    order_id,
                    driver_id,
                    reason_type,
                    reason,
                    reply,
                } => {
                    let _ = reply.send(self.reject(order_id, driver_id, reason_type, reason).await);
                }
                Command::Cancel {
                    order_id,
                    initiator,
                    reason,
                    reply,
                } => {
                    let _ = reply.send(self.cancel(order_id, initiator, reason).await);
                }
                Command::Tick { now, reply } => {
                    for order_id in self.timers.due(now) {
                        self.wake(order_id, now).await;
                    }
                    let _ = reply.send(());
                }
            }
        }

        warn!(shard = self.id, "dispatch shard stopped: command channel closed");
    }

    async fn submit(&mut self, order: Order) -> DispatchResult<SubmitReceipt> {
        let now = self.engine.clock.now();
        let order = self.engine.store.begin_order(order, now).await?;
        let order_id = order.order_id;
        self.engine.metrics.orders_in_flight.inc();
        info!(order_id = %order_id, scheduled = order.is_scheduled(), "order submitted");

        let deferred_until = self.deferral(&order, now);
        self.tasks.insert(
            order_id,
            OrderTask {
                order,
                round: 0,
                phase: Phase::Deferred,
            },
        );

        match deferred_until {
            Some(start_at) => {
                info!(order_id = %order_id, start_at = %start_at, "scheduled order deferred");
                self.timers.schedule_wake(order_id, start_at);
            }
            None => self.run_rounds(order_id, now).await,
        }

        let status = self
            .engine
            .store
            .get_order(order_id)
            .await?
            .map_or(OrderStatus::Dispatching, |o| o.status);
        let (dispatch_id, round) = match self.tasks.get(&order_id) {
            Some(OrderTask {
                round,
                phase: Phase::Waiting { dispatch_id, .. },
                ..
            }) => (Some(*dispatch_id), *round),
            Some(task) => (None, task.round),
            None => (None, 0),
        };
        Ok(SubmitReceipt {
            order_id,
            dispatch_id,
            round,
            status,
        })
    }

    fn deferral(&self, order: &Order, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let pickup_at = order.scheduled_at.filter(|_| order.is_scheduled())?;
        let start_at = pickup_at - Duration::minutes(self.engine.settings.scheduled_lead_minutes);
        (start_at > now).then_some(start_at)
    }

    async fn wake(&mut self, order_id: Uuid, now: DateTime<Utc>) {
        let Some(phase) = self.tasks.get(&order_id).map(|t| t.phase) else {
            return;
        };
        match phase {
            Phase::Deferred => self.run_rounds(order_id, now).await,
            Phase::CoolOff => self.recover(order_id, now).await,
            Phase::Waiting {
                dispatch_id,
                expires_at,
            } => {
                if now < expires_at {
                    self.timers.schedule_wake(order_id, expires_at);
                    return;
                }
                self.advance(order_id, dispatch_id, now).await;
            }
        }
    }

    /// Starts the task's current round, moving on through rounds that find
    /// nobody until one offers or the rounds run out.
    async fn run_rounds(&mut self, order_id: Uuid, now: DateTime<Utc>) {
        let max_rounds = self.engine.settings.rounds.max_rounds;
        loop {
            let Some(task) = self.tasks.get(&order_id) else {
                return;
            };
            let order = task.order.clone();
            let round = task.round;

            match self.start_round(&order, round, now).await {
                Ok(RoundStart::Offered {
                    dispatch_id,
                    expires_at,
                }) => {
                    if let Some(task) = self.tasks.get_mut(&order_id) {
                        task.phase = Phase::Waiting {
                            dispatch_id,
                            expires_at,
                        };
                    }
                    self.timers.schedule_wake(order_id, expires_at);
                    return;
                }
                Ok(RoundStart::NoCandidates) => {
                    if round + 1 >= max_rounds {
                        self.exhaust(order_id, now).await;
                        return;
                    }
                    if let Some(task) = self.tasks.get_mut(&order_id) {
                        task.round = round + 1;
                    }
                }
                Ok(RoundStart::Terminal) => {
                    self.forget(order_id);
                    return;
                }
                Err(failure) => {
                    self.cool_off(order_id, failure, now);
                    return;
                }
            }
        }
    }

    async fn start_round(
        &self,
        order: &Order,
        round: u32,
        now: DateTime<Utc>,
    ) -> Result<RoundStart, RoundFailure> {
        let engine = &self.engine;
        let order_id = order.order_id;

        let terminal = engine
            .store
            .get_order_terminal_state(order_id)
            .await
            .map_err(RoundFailure::before)?;
        if terminal != TerminalState::Open {
            return Ok(RoundStart::Terminal);
        }

        let strategy = engine.settings.rounds.strategy_for(round);
        let radius_km = engine.settings.rounds.effective_radius(&strategy, round);
        let report = select_candidates(engine, order, &strategy, radius_km)
            .await
            .map_err(RoundFailure::before)?;
        engine.metrics.rounds_total.inc();

        if report.candidates.is_empty() {
            info!(
                order_id = %order_id,
                round,
                radius_km,
                excluded = report.excluded.len(),
                "no eligible drivers for round"
            );
            return Ok(RoundStart::NoCandidates);
        }

        let expires_at = now + engine.settings.round_timeout();
        let dispatch = engine
            .store
            .create_dispatch(order_id, round, now, expires_at, strategy.clone())
            .await
            .map_err(RoundFailure::before)?;
        info!(
            order_id = %order_id,
            dispatch_id = %dispatch.dispatch_id,
            round,
            radius_km,
            candidates = report.candidates.len(),
            "round started"
        );

        let summary = order.summary();
        let send_limit = engine.settings.timeouts.notify_send();
        for candidate in &report.candidates {
            let offer = engine
                .store
                .record_offer(
                    dispatch.dispatch_id,
                    candidate.driver_id,
                    candidate.distance_km,
                    strategy.price_multiplier,
                    now,
                )
                .await
                .map_err(|error| RoundFailure {
                    dispatch_id: Some(dispatch.dispatch_id),
                    error,
                })?;
            engine.metrics.count_offers("offered", 1);

            deliver(
                send_limit,
                &engine.metrics,
                "offer",
                engine.notifier.offer(
                    candidate.driver_id,
                    &summary,
                    offer.price_multiplier,
                    offer.expires_at,
                ),
            )
            .await;
            self.stamp_dispatched(candidate.driver_id, now);
        }

        Ok(RoundStart::Offered {
            dispatch_id: dispatch.dispatch_id,
            expires_at,
        })
    }

    /// Best effort: a concurrent driver update simply wins.
    fn stamp_dispatched(&self, driver_id: Uuid, now: DateTime<Utc>) {
        let Some(driver) = self.engine.runtime.get(driver_id) else {
            return;
        };
        match self
            .engine
            .runtime
            .cas_update(driver_id, driver.version, |d| d.last_dispatch_at = Some(now))
        {
            Ok(CasOutcome::Ok { .. }) => {}
            Ok(outcome) => {
                debug!(driver_id = %driver_id, outcome = ?outcome, "last_dispatch_at not stamped")
            }
            Err(err) => warn!(driver_id = %driver_id, error = %err, "last_dispatch_at not stamped"),
        }
    }

    fn cool_off(&mut self, order_id: Uuid, failure: RoundFailure, now: DateTime<Utc>) {
        let Some(task) = self.tasks.get_mut(&order_id) else {
            return;
        };
        if failure.dispatch_id.is_some() {
            task.round += 1;
        }
        task.phase = Phase::CoolOff;
        let retry_at = now + self.engine.settings.timeouts.cooloff();
        self.timers.schedule_wake(order_id, retry_at);
        warn!(
            order_id = %order_id,
            round = task.round,
            error = %failure.error,
            retry_at = %retry_at,
            "round aborted; retrying after cool-off"
        );
    }

    /// Fails whatever round a storage error left open, then resumes.
    async fn recover(&mut self, order_id: Uuid, now: DateTime<Utc>) {
        if let Err(error) = self.fail_open_rounds(order_id, now).await {
            self.cool_off(
                order_id,
                RoundFailure {
                    dispatch_id: None,
                    error,
                },
                now,
            );
            return;
        }

        let exhausted = self
            .tasks
            .get(&order_id)
            .is_some_and(|t| t.round >= self.engine.settings.rounds.max_rounds);
        if exhausted {
            self.exhaust(order_id, now).await;
        } else {
            self.run_rounds(order_id, now).await;
        }
    }

    async fn fail_open_rounds(&self, order_id: Uuid, now: DateTime<Utc>) -> DispatchResult<()> {
        let store = &self.engine.store;
        for dispatch in store.dispatches_for_order(order_id).await? {
            if dispatch.status != DispatchStatus::Pending {
                continue;
            }
            let mut closed = 0;
            for offer in store.offers_for_dispatch(dispatch.dispatch_id).await? {
                if offer.state == OfferState::Offered {
                    store
                        .record_response(offer.offer_id, OfferResponse::Timeout, now)
                        .await?;
                    closed += 1;
                }
            }
            self.engine.metrics.count_offers("timeout", closed);
            store
                .close_dispatch(dispatch.dispatch_id, DispatchStatus::Failed)
                .await?;
            info!(
                order_id = %order_id,
                dispatch_id = %dispatch.dispatch_id,
                round = dispatch.round,
                "interrupted round marked failed"
            );
        }
        Ok(())
    }

    /// Closes the waiting round and starts the next one, or exhausts.
    async fn advance(&mut self, order_id: Uuid, dispatch_id: Uuid, now: DateTime<Utc>) {
        if let Err(error) = self.close_round(dispatch_id, now).await {
            // the dispatch is still pending; recovery marks it failed and the
            // retry moves on to the next round
            self.cool_off(
                order_id,
                RoundFailure {
                    dispatch_id: Some(dispatch_id),
                    error,
                },
                now,
            );
            return;
        }

        let Some(task) = self.tasks.get_mut(&order_id) else {
            return;
        };
        let next = task.round + 1;
        if next >= self.engine.settings.rounds.max_rounds {
            self.exhaust(order_id, now).await;
            return;
        }
        task.round = next;
        info!(order_id = %order_id, round = next, "advancing to next round");
        self.run_rounds(order_id, now).await;
    }

    /// Times out leftover live offers and closes the dispatch: `timeout` when
    /// any offer timed out, `failed` when every driver rejected.
    async fn close_round(&self, dispatch_id: Uuid, now: DateTime<Utc>) -> DispatchResult<()> {
        let store = &self.engine.store;
        let mut offers = store.offers_for_dispatch(dispatch_id).await?;
        let mut closed = 0;
        for offer in offers.iter_mut() {
            if offer.state == OfferState::Offered {
                *offer = store
                    .record_response(offer.offer_id, OfferResponse::Timeout, now)
                    .await?;
                closed += 1;
            }
        }
        self.engine.metrics.count_offers("timeout", closed);

        let status = if offers.iter().any(|o| o.state == OfferState::Timeout) {
            DispatchStatus::Timeout
        } else {
            DispatchStatus::Failed
        };
        let dispatch = store.close_dispatch(dispatch_id, status).await?;
        debug!(
            dispatch_id = %dispatch_id,
            round = dispatch.round,
            status = ?dispatch.status,
            "round closed"
        );
        Ok(())
    }

    async fn exhaust(&mut self, order_id: Uuid, now: DateTime<Utc>) {
        let engine = self.engine.clone();
        match engine.store.expire_order(order_id, now).await {
            Ok(true) => {
                info!(order_id = %order_id, "order exhausted all rounds");
                engine
                    .metrics
                    .orders_total
                    .with_label_values(&["expired"])
                    .inc();
                engine.metrics.orders_in_flight.dec();
                if let Some(task) = self.tasks.get(&order_id) {
                    deliver(
                        engine.settings.timeouts.notify_send(),
                        &engine.metrics,
                        "exhausted",
                        engine.notifier.notify_exhausted(task.order.user_id, order_id),
                    )
                    .await;
                }
            }
            Ok(false) => {}
            Err(err) => {
                if let Some(task) = self.tasks.get_mut(&order_id) {
                    task.round = task.round.max(engine.settings.rounds.max_rounds);
                }
                self.cool_off(order_id, RoundFailure::before(err), now);
                return;
            }
        }
        self.forget(order_id);
    }

    fn forget(&mut self, order_id: Uuid) {
        self.tasks.remove(&order_id);
        self.timers.cancel(order_id);
    }

    async fn accept(&mut self, order_id: Uuid, driver_id: Uuid) -> DispatchResult<AcceptResult> {
        let started = Instant::now();
        let result = self.try_accept(order_id, driver_id).await;

        let outcome = match &result {
            Ok(accepted) => accepted.label(),
            Err(err) => err.kind(),
        };
        self.engine
            .metrics
            .accept_latency_seconds
            .with_label_values(&[outcome])
            .observe(started.elapsed().as_secs_f64());
        result
    }

    async fn try_accept(
        &mut self,
        order_id: Uuid,
        driver_id: Uuid,
    ) -> DispatchResult<AcceptResult> {
        let engine = self.engine.clone();
        let now = engine.clock.now();
        let offer = self.live_or_past_offer(order_id, driver_id).await?;

        let limit = engine.settings.timeouts.accept_txn();
        let outcome = match tokio::time::timeout(
            limit,
            engine
                .store
                .try_accept(order_id, driver_id, offer.dispatch_id, now),
        )
        .await
        {
            Ok(outcome) => outcome?,
            Err(_) => {
                warn!(order_id = %order_id, driver_id = %driver_id, "acceptance timed out");
                return Ok(AcceptResult::ConflictRetry);
            }
        };

        match outcome {
            AcceptOutcome::AlreadyAccepted { winner } if winner == driver_id => {
                let dispatch_id = engine
                    .store
                    .acceptance_lock(order_id)
                    .await?
                    .map_or(offer.dispatch_id, |lock| lock.dispatch_id);
                Ok(AcceptResult::Won {
                    order_id,
                    driver_id,
                    dispatch_id,
                })
            }
            AcceptOutcome::AlreadyAccepted { winner } => {
                info!(order_id = %order_id, driver_id = %driver_id, winner = %winner, "accept lost");
                Ok(AcceptResult::Lost { winner })
            }
            AcceptOutcome::Stale => Ok(AcceptResult::Stale),
            AcceptOutcome::Won { offer, superseded } => {
                self.assign_winner(order_id, offer, superseded, now).await
            }
        }
    }

    /// The driver's offer for the order, whatever its state.
    async fn live_or_past_offer(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
    ) -> DispatchResult<DispatchOffer> {
        let store = &self.engine.store;
        if let Some(offer) = store.get_offer(order_id, driver_id).await? {
            return Ok(offer);
        }
        if store.get_order(order_id).await?.is_none() {
            return Err(DispatchError::NotFound(format!("order {order_id}")));
        }
        Err(DispatchError::NotOffered {
            order_id,
            driver_id,
        })
    }

    /// Puts the won order on the driver, retrying version conflicts. When the
    /// driver cannot take it the acceptance is reverted.
    async fn assign_winner(
        &mut self,
        order_id: Uuid,
        offer: DispatchOffer,
        superseded: Vec<DispatchOffer>,
        now: DateTime<Utc>,
    ) -> DispatchResult<AcceptResult> {
        let engine = self.engine.clone();
        let driver_id = offer.driver_id;

        let order = match self.tasks.get(&order_id) {
            Some(task) => task.order.clone(),
            None => engine
                .store
                .get_order(order_id)
                .await?
                .ok_or_else(|| DispatchError::NotFound(format!("order {order_id}")))?,
        };
        let mut queued = QueuedOrder::from_order(&order);
        queued.status = OrderStatus::Accepted;

        let attempts = engine.settings.assign_retries.max(1);
        let mut attempt = 0;
        let failure = loop {
            attempt += 1;
            let Some(driver) = engine.runtime.get(driver_id) else {
                break DispatchError::NotFound(format!("driver {driver_id}"));
            };
            match engine
                .runtime
                .assign_order(driver_id, queued.clone(), driver.version)
            {
                Ok(AssignOutcome::Ok { version }) => {
                    debug!(driver_id = %driver_id, version, "order assigned to driver");
                    return Ok(self.finish_accept(order, offer, superseded).await);
                }
                Ok(AssignOutcome::Conflict { actual }) if attempt < attempts => {
                    debug!(driver_id = %driver_id, actual, attempt, "driver version moved; retrying");
                }
                Ok(AssignOutcome::Conflict { actual }) => {
                    break DispatchError::ConflictRetry(format!(
                        "driver {driver_id} version still moving ({actual})"
                    ));
                }
                Ok(AssignOutcome::CapacityExceeded) => {
                    break DispatchError::CapacityExceeded(driver_id);
                }
                Ok(AssignOutcome::Ineligible) => {
                    break DispatchError::ConflictRetry(format!("driver {driver_id} is not online"));
                }
                Ok(AssignOutcome::NotFound) => {
                    break DispatchError::NotFound(format!("driver {driver_id}"));
                }
                Err(err) => break err,
            }
        };

        if let Err(err) = engine.store.revert_accept(order_id, driver_id, now).await {
            error!(
                order_id = %order_id,
                driver_id = %driver_id,
                error = %err,
                "failed to revert acceptance"
            );
            return Err(err);
        }
        warn!(
            order_id = %order_id,
            driver_id = %driver_id,
            error = %failure,
            "driver assignment failed; acceptance reverted"
        );
        match failure {
            DispatchError::ConflictRetry(_) => Ok(AcceptResult::ConflictRetry),
            other => Err(other),
        }
    }

    async fn finish_accept(
        &mut self,
        order: Order,
        offer: DispatchOffer,
        superseded: Vec<DispatchOffer>,
    ) -> AcceptResult {
        let engine = self.engine.clone();
        let order_id = order.order_id;
        let driver_id = offer.driver_id;
        info!(
            order_id = %order_id,
            driver_id = %driver_id,
            dispatch_id = %offer.dispatch_id,
            round = offer.round,
            "order accepted"
        );

        engine
            .metrics
            .orders_total
            .with_label_values(&["accepted"])
            .inc();
        engine.metrics.orders_in_flight.dec();
        engine.metrics.count_offers("accepted", 1);
        engine.metrics.count_offers("superseded", superseded.len());
        self.forget(order_id);

        let limit = engine.settings.timeouts.notify_send();
        deliver(
            limit,
            &engine.metrics,
            "assigned",
            engine.notifier.notify_assigned(driver_id, order_id),
        )
        .await;
        for other in &superseded {
            deliver(
                limit,
                &engine.metrics,
                "superseded",
                engine.notifier.notify_superseded(other.driver_id, order_id),
            )
            .await;
        }

        AcceptResult::Won {
            order_id,
            driver_id,
            dispatch_id: offer.dispatch_id,
        }
    }

    async fn reject(
        &mut self,
        order_id: Uuid,
        driver_id: Uuid,
        reason_type: RejectReason,
        reason: Option<String>,
    ) -> DispatchResult<()> {
        let now = self.engine.clock.now();
        let offer = self.live_or_past_offer(order_id, driver_id).await?;
        if offer.state != OfferState::Offered {
            return Err(DispatchError::NotOffered {
                order_id,
                driver_id,
            });
        }

        self.engine
            .store
            .record_response(
                offer.offer_id,
                OfferResponse::Rejected {
                    reason_type,
                    reason,
                },
                now,
            )
            .await?;
        self.engine.metrics.count_offers("rejected", 1);
        info!(
            order_id = %order_id,
            driver_id = %driver_id,
            reason = %reason_type,
            "offer rejected"
        );
        self.count_reject(driver_id, now);

        let waiting_on = match self.tasks.get(&order_id).map(|t| t.phase) {
            Some(Phase::Waiting { dispatch_id, .. }) if dispatch_id == offer.dispatch_id => {
                dispatch_id
            }
            _ => return Ok(()),
        };
        let offers = self.engine.store.offers_for_dispatch(waiting_on).await?;
        if offers.iter().all(|o| o.state.is_terminal()) {
            debug!(order_id = %order_id, "every offer answered; advancing early");
            self.timers.cancel(order_id);
            self.advance(order_id, waiting_on, now).await;
        }
        Ok(())
    }

    fn count_reject(&self, driver_id: Uuid, now: DateTime<Utc>) {
        let runtime = &self.engine.runtime;
        for _ in 0..self.engine.settings.assign_retries.max(1) {
            let Some(driver) = runtime.get(driver_id) else {
                return;
            };
            let outcome = runtime.cas_update(driver_id, driver.version, |d| {
                d.consecutive_rejects = d.consecutive_rejects.saturating_add(1);
                d.last_response_at = Some(now);
            });
            match outcome {
                Ok(CasOutcome::Conflict { .. }) => continue,
                Ok(_) => return,
                Err(err) => {
                    warn!(driver_id = %driver_id, error = %err, "reject not counted");
                    return;
                }
            }
        }
        warn!(driver_id = %driver_id, "reject not counted: driver kept changing");
    }

    async fn cancel(
        &mut self,
        order_id: Uuid,
        initiator: CancelInitiator,
        reason: String,
    ) -> DispatchResult<CancelResult> {
        let engine = self.engine.clone();
        let now = engine.clock.now();

        match engine.store.cancel_dispatch(order_id, &reason, now).await? {
            CancelOutcome::AlreadyAccepted { driver_id } => {
                info!(order_id = %order_id, driver_id = %driver_id, "cancel refused: order already accepted");
                Ok(CancelResult::AlreadyAccepted { driver_id })
            }
            CancelOutcome::Cancelled {
                superseded,
                changed,
            } => {
                self.forget(order_id);
                if changed {
                    info!(order_id = %order_id, initiator = ?initiator, reason = %reason, "order cancelled");
                    engine
                        .metrics
                        .orders_total
                        .with_label_values(&["cancelled"])
                        .inc();
                    engine.metrics.orders_in_flight.dec();
                    engine.metrics.count_offers("superseded", superseded.len());

                    let recipients: Vec<Uuid> = superseded.iter().map(|o| o.driver_id).collect();
                    if !recipients.is_empty() {
                        deliver(
                            engine.settings.timeouts.notify_send(),
                            &engine.metrics,
                            "cancelled",
                            engine.notifier.notify_cancelled(&recipients, order_id, &reason),
                        )
                        .await;
                    }
                }
                Ok(CancelResult::Cancelled)
            }
        }
    }
}
