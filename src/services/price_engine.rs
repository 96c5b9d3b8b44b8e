use crate::broadcaster::{PriceBroadcaster, PriceUpdate};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{AppError, AppResult, RepositoryError};
use crate::models::{Opportunity, PricePoint, PriceTrend};
use crate::pricing::history::{self, next_timestamp};
use crate::pricing::PricingModel;
use crate::repositories::{
    OpportunityRepository, PitchRepository, PriceHistoryRepository, Repositories,
};
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Counts from one pass over the unfrozen opportunities
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub computed: usize,
    pub changed: usize,
    pub frozen: usize,
    /// Points that exhausted their retries and wait for the next tick
    pub parked: usize,
    pub failed: usize,
}

impl TickReport {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Unchanged => self.computed += 1,
            Outcome::Changed => {
                self.computed += 1;
                self.changed += 1;
            }
            Outcome::Parked => {
                self.computed += 1;
                self.parked += 1;
            }
            Outcome::Frozen => self.frozen += 1,
        }
    }

    fn log(&self) {
        if self.changed + self.frozen + self.parked + self.failed > 0 {
            info!(
                computed = self.computed,
                changed = self.changed,
                frozen = self.frozen,
                parked = self.parked,
                failed = self.failed,
                "Price engine tick"
            );
        } else {
            debug!(computed = self.computed, "Price engine tick, no changes");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Unchanged,
    Changed,
    Parked,
    Frozen,
}

enum EngineCommand {
    TickNow(oneshot::Sender<TickReport>),
}

/// Control surface for a running engine
#[derive(Clone)]
pub struct EngineHandle {
    demand_tx: mpsc::Sender<Uuid>,
    command_tx: mpsc::Sender<EngineCommand>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl EngineHandle {
    /// Ask for an immediate recompute of one opportunity. Never blocks; when
    /// the queue is full the next tick picks the change up instead.
    pub fn notify_demand(&self, opportunity_id: Uuid) -> bool {
        match self.demand_tx.try_send(opportunity_id) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Demand queue full, opportunity {} waits for the next tick",
                    opportunity_id
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Run one full tick now and wait for its report
    pub async fn tick_now(&self) -> AppResult<TickReport> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(EngineCommand::TickNow(reply_tx))
            .await
            .map_err(|_| AppError::Message("Price engine is not running".to_string()))?;
        reply_rx
            .await
            .map_err(|_| AppError::Message("Price engine stopped before replying".to_string()))
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Background price engine.
///
/// A single loop owns every write to `current_price`, `final_price` and the
/// price ledger. Ticks and demand events are handled one at a time, so an
/// opportunity is never recomputed concurrently with itself; within a tick
/// opportunities are processed with bounded concurrency.
pub struct PriceEngine {
    opportunities: Arc<dyn OpportunityRepository>,
    price_history: Arc<dyn PriceHistoryRepository>,
    pitches: Arc<dyn PitchRepository>,
    pricing: Arc<PricingModel>,
    broadcaster: PriceBroadcaster,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    /// Computed points the ledger has not accepted yet, oldest first
    pending: Mutex<HashMap<Uuid, VecDeque<PricePoint>>>,
}

impl PriceEngine {
    pub fn new(
        repos: &Repositories,
        pricing: Arc<PricingModel>,
        broadcaster: PriceBroadcaster,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            opportunities: repos.opportunities.clone(),
            price_history: repos.price_history.clone(),
            pitches: repos.pitches.clone(),
            pricing,
            broadcaster,
            clock,
            config,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Start the engine loop on its own task
    pub fn spawn(self) -> (EngineHandle, JoinHandle<()>) {
        let (demand_tx, demand_rx) = mpsc::channel(self.config.demand_queue_capacity.max(1));
        let (command_tx, command_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = EngineHandle {
            demand_tx,
            command_tx,
            shutdown_tx: Arc::new(shutdown_tx),
        };
        let task = tokio::spawn(self.run(demand_rx, command_rx, shutdown_rx));
        (handle, task)
    }

    async fn run(
        self,
        mut demand_rx: mpsc::Receiver<Uuid>,
        mut command_rx: mpsc::Receiver<EngineCommand>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut interval = time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Price engine started, ticking every {:?} with concurrency {}",
            self.config.tick_interval(),
            self.config.max_concurrency
        );

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Price engine stopping");
                        break;
                    }
                }

                Some(command) = command_rx.recv() => match command {
                    EngineCommand::TickNow(reply) => {
                        let report = self.tick().await;
                        report.log();
                        let _ = reply.send(report);
                    }
                },

                Some(opportunity_id) = demand_rx.recv() => {
                    // Coalesce whatever else is already queued
                    let mut batch = HashSet::from([opportunity_id]);
                    while let Ok(id) = demand_rx.try_recv() {
                        batch.insert(id);
                    }
                    for id in batch {
                        if let Err(e) = self.recompute(id).await {
                            warn!("Demand recompute for opportunity {} failed: {}", id, e);
                        }
                    }
                }

                _ = interval.tick() => {
                    let report = self.tick().await;
                    report.log();
                }
            }
        }
    }

    /// One pass over every opportunity that is not frozen yet
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        let opportunities = match self.opportunities.find_unfrozen().await {
            Ok(opportunities) => opportunities,
            Err(e) => {
                error!("Price engine could not list opportunities: {}", e);
                report.failed += 1;
                return report;
            }
        };

        // At most `max_concurrency` in flight; refill as each one finishes
        let mut queued = opportunities.into_iter();
        let mut in_flight = FuturesUnordered::new();
        for opportunity in queued.by_ref().take(self.config.max_concurrency.max(1)) {
            in_flight.push(self.process_tracked(opportunity));
        }

        while let Some((id, result)) = in_flight.next().await {
            match result {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    // Skipped this tick; the next one tries again
                    warn!("Price computation for opportunity {} failed: {}", id, e);
                    report.failed += 1;
                }
            }
            if let Some(opportunity) = queued.next() {
                in_flight.push(self.process_tracked(opportunity));
            }
        }

        report
    }

    async fn process_tracked(&self, opportunity: Opportunity) -> (Uuid, AppResult<Outcome>) {
        let id = opportunity.id;
        (id, self.process(opportunity).await)
    }

    /// Recompute a single opportunity now, freezing it if it has closed.
    /// Returns the opportunity's price after the pass.
    pub async fn recompute(&self, opportunity_id: Uuid) -> AppResult<Decimal> {
        let opportunity = self
            .opportunities
            .find_by_id(opportunity_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Opportunity {} not found", opportunity_id))
            })?;

        if let Some(final_price) = opportunity.final_price {
            return Ok(final_price);
        }

        self.process(opportunity.clone()).await?;

        let refreshed = self
            .opportunities
            .find_by_id(opportunity_id)
            .await?
            .unwrap_or(opportunity);
        Ok(refreshed.effective_price())
    }

    async fn quote(&self, opportunity: &Opportunity, now: DateTime<Utc>) -> AppResult<Decimal> {
        let demand = self.pitches.demand_stats(opportunity.id).await?;
        let inputs = self.pricing.inputs_for(opportunity, &demand, now);
        self.pricing
            .quote(&inputs)
            .map_err(|e| AppError::Computation(format!("opportunity {}: {}", opportunity.id, e)))
    }

    async fn process(&self, opportunity: Opportunity) -> AppResult<Outcome> {
        let now = self.clock.now();
        if !opportunity.is_open(now) {
            return self.freeze(&opportunity).await;
        }

        let mut latest = self.ensure_initial(&opportunity).await?;
        let mut current_price = opportunity.current_price;

        if let Some(flushed) = self.flush_pending(opportunity.id).await? {
            current_price = flushed.price;
            latest = flushed;
        }

        let price = self.quote(&opportunity, now).await?;

        if price == latest.price {
            // Heal a current_price write that failed after its append landed
            if current_price != latest.price {
                self.opportunities
                    .update_current_price(opportunity.id, latest.price)
                    .await?;
            }
            return Ok(Outcome::Unchanged);
        }

        let point = PricePoint::new(
            opportunity.id,
            next_timestamp(now, latest.recorded_at),
            price,
            opportunity.slots_remaining,
            PriceTrend::between(latest.price, price),
        );

        if let Err(e) = self.append_with_retry(&point).await {
            warn!(
                "Parking price point for opportunity {} after retries: {}",
                opportunity.id, e
            );
            self.pending
                .lock()
                .await
                .entry(opportunity.id)
                .or_default()
                .push_back(point);
            return Ok(Outcome::Parked);
        }

        self.opportunities.update_current_price(opportunity.id, price).await?;
        self.broadcaster.publish(PriceUpdate::from(&point)).await;

        debug!(
            "Opportunity {} price {} -> {} ({})",
            opportunity.id, latest.price, price, point.trend
        );
        Ok(Outcome::Changed)
    }

    /// Latest ledger point, writing the base-price initial point first when
    /// the ledger is empty
    async fn ensure_initial(&self, opportunity: &Opportunity) -> AppResult<PricePoint> {
        if let Some(latest) = self.price_history.latest(opportunity.id).await? {
            return Ok(latest);
        }

        let base_price = self.pricing.tier_base_price(opportunity);
        if base_price <= Decimal::ZERO {
            return Err(AppError::Computation(format!(
                "opportunity {} has no base price for tier {}",
                opportunity.id, opportunity.tier
            )));
        }

        let initial = history::base_point(opportunity, base_price);
        self.append_with_retry(&initial).await?;
        self.broadcaster.publish(PriceUpdate::from(&initial)).await;

        info!(
            "Recorded initial price {} for opportunity {}",
            initial.price, opportunity.id
        );
        Ok(initial)
    }

    /// Append parked points in order. Returns the last one that landed;
    /// anything still failing stays parked.
    async fn flush_pending(&self, opportunity_id: Uuid) -> AppResult<Option<PricePoint>> {
        let queued = self.pending.lock().await.remove(&opportunity_id);
        let mut queued = match queued {
            Some(queued) => queued,
            None => return Ok(None),
        };

        let mut landed = None;
        while let Some(point) = queued.pop_front() {
            if let Err(e) = self.append_with_retry(&point).await {
                queued.push_front(point);
                self.pending.lock().await.insert(opportunity_id, queued);
                return Err(e.into());
            }
            self.broadcaster.publish(PriceUpdate::from(&point)).await;
            landed = Some(point);
        }

        if let Some(point) = &landed {
            self.opportunities
                .update_current_price(opportunity_id, point.price)
                .await?;
            info!("Flushed parked price points for opportunity {}", opportunity_id);
        }
        Ok(landed)
    }

    /// Final write for a closed opportunity: record `final_price`, publish the
    /// freeze point if the ledger does not already end at it, close the channel
    async fn freeze(&self, opportunity: &Opportunity) -> AppResult<Outcome> {
        let mut latest = self.ensure_initial(opportunity).await?;
        let mut final_price = opportunity.current_price;

        match self.flush_pending(opportunity.id).await {
            Ok(Some(flushed)) => {
                final_price = flushed.price;
                latest = flushed;
            }
            Ok(None) => {}
            Err(e) => {
                if let Some(dropped) = self.pending.lock().await.remove(&opportunity.id) {
                    warn!(
                        "Discarding {} parked points for closed opportunity {}: {}",
                        dropped.len(),
                        opportunity.id,
                        e
                    );
                }
            }
        }

        let freeze_point = if latest.price != final_price {
            let point = PricePoint::new(
                opportunity.id,
                next_timestamp(self.clock.now(), latest.recorded_at),
                final_price,
                opportunity.slots_remaining,
                PriceTrend::between(latest.price, final_price),
            );
            self.append_with_retry(&point).await?;
            Some(point)
        } else {
            None
        };

        self.opportunities.freeze(opportunity.id, final_price).await?;

        if let Some(point) = &freeze_point {
            self.broadcaster.publish(PriceUpdate::from(point)).await;
        }
        self.broadcaster.close_channel(opportunity.id).await;

        info!(
            "Froze opportunity {} at final price {}",
            opportunity.id, final_price
        );
        Ok(Outcome::Frozen)
    }

    /// Append with exponential backoff. A `Duplicate` means an earlier attempt
    /// already landed.
    async fn append_with_retry(&self, point: &PricePoint) -> Result<(), RepositoryError> {
        let attempts = self.config.append_retry_attempts.max(1);
        let mut backoff = self.config.retry_backoff();
        let mut attempt = 1;

        loop {
            match self.price_history.append(point).await {
                Ok(()) | Err(RepositoryError::Duplicate(_)) => return Ok(()),
                Err(e) if e.is_transient() && attempt < attempts => {
                    debug!(
                        "Append for opportunity {} failed (attempt {}/{}): {}",
                        point.opportunity_id, attempt, attempts, e
                    );
                    time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
