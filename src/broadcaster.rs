//! Per-opportunity fan-out of price changes.
//!
//! The engine publishes into a `tokio::sync::broadcast` channel per
//! opportunity. A send never waits on subscribers: a slow one lags and is
//! resynced from the ledger, a disconnected one simply drops its receiver.

use crate::clock::Clock;
use crate::config::BroadcastConfig;
use crate::error::{AppError, AppResult};
use crate::models::{Opportunity, OpportunityStatus, PricePoint, PriceTrend};
use crate::pricing::{history, PricingModel};
use crate::repositories::{OpportunityRepository, PriceHistoryRepository};
use chrono::{DateTime, Utc};
use futures::Stream;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::runtime::Handle;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One live price change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub opportunity_id: Uuid,
    pub price: Decimal,
    pub trend: PriceTrend,
    pub timestamp: DateTime<Utc>,
    pub slots_remaining: i32,
}

impl From<&PricePoint> for PriceUpdate {
    fn from(point: &PricePoint) -> Self {
        Self {
            opportunity_id: point.opportunity_id,
            price: point.price,
            trend: point.trend_enum(),
            timestamp: point.recorded_at,
            slots_remaining: point.slots_remaining,
        }
    }
}

/// What a subscriber receives: a resync first, then live updates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PriceEvent {
    Resync {
        opportunity_id: Uuid,
        current_price: Decimal,
        status: OpportunityStatus,
        points: Vec<PricePoint>,
    },
    #[serde(rename = "price_update")]
    Update(PriceUpdate),
}

struct Channel {
    tx: broadcast::Sender<PriceUpdate>,
    subscribers: Arc<AtomicUsize>,
}

impl Channel {
    fn is_idle(&self) -> bool {
        self.tx.receiver_count() == 0
    }
}

/// A channel exists only while someone listens to an unfrozen opportunity
type Channels = HashMap<Uuid, Channel>;

struct Snapshot {
    event: PriceEvent,
    /// Live updates at or before this were already covered
    last_seen: Option<DateTime<Utc>>,
    frozen: bool,
}

/// Price broadcaster shared by the engine and the live transports
#[derive(Clone)]
pub struct PriceBroadcaster {
    channels: Arc<RwLock<Channels>>,
    opportunities: Arc<dyn OpportunityRepository>,
    price_history: Arc<dyn PriceHistoryRepository>,
    pricing: Arc<PricingModel>,
    clock: Arc<dyn Clock>,
    config: BroadcastConfig,
}

impl PriceBroadcaster {
    pub fn new(
        opportunities: Arc<dyn OpportunityRepository>,
        price_history: Arc<dyn PriceHistoryRepository>,
        pricing: Arc<PricingModel>,
        clock: Arc<dyn Clock>,
        config: BroadcastConfig,
    ) -> Self {
        Self {
            channels: Arc::new(RwLock::new(Channels::default())),
            opportunities,
            price_history,
            pricing,
            clock,
            config,
        }
    }

    /// Send an update to every current subscriber. Returns how many
    /// receivers it was queued for.
    pub async fn publish(&self, update: PriceUpdate) -> usize {
        let channels = self.channels.read().await;
        match channels.get(&update.opportunity_id) {
            // No receivers is not an error: nobody is watching
            Some(channel) => channel.tx.send(update).unwrap_or(0),
            None => 0,
        }
    }

    /// Stop all live delivery for an opportunity. Subscribers drain what is
    /// already queued and then end.
    pub async fn close_channel(&self, opportunity_id: Uuid) {
        let mut channels = self.channels.write().await;
        if channels.remove(&opportunity_id).is_some() {
            info!("Closed price channel for opportunity {}", opportunity_id);
        }
    }

    /// Number of live subscriptions for an opportunity
    pub async fn connection_count(&self, opportunity_id: Uuid) -> usize {
        let channels = self.channels.read().await;
        channels
            .get(&opportunity_id)
            .map(|c| c.subscribers.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Number of opportunities with an open channel
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Subscribe to an opportunity's price stream.
    ///
    /// The first event is always a `Resync`: points strictly after `since`
    /// when given, otherwise the trailing window. The receiver is registered
    /// before the snapshot is read, and live updates at or before the
    /// snapshot's last timestamp are dropped, so the stream has neither gaps
    /// nor duplicates.
    pub async fn subscribe(
        &self,
        opportunity_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> AppResult<PriceSubscription> {
        let (rx, counter) = self.register(opportunity_id).await;

        let snapshot = match self.snapshot(opportunity_id, since).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                drop(rx);
                self.prune(opportunity_id).await;
                return Err(e);
            }
        };

        // Frozen opportunities never publish again
        let (receiver, subscribers) = if snapshot.frozen {
            drop(rx);
            self.prune(opportunity_id).await;
            (None, None)
        } else {
            counter.fetch_add(1, Ordering::SeqCst);
            (Some(rx), Some(counter))
        };

        debug!(
            "Subscription opened for opportunity {} (live: {})",
            opportunity_id,
            receiver.is_some()
        );

        let mut pending = VecDeque::with_capacity(1);
        pending.push_back(snapshot.event);

        Ok(PriceSubscription {
            opportunity_id,
            broadcaster: self.clone(),
            pending,
            receiver,
            last_seen: snapshot.last_seen,
            subscribers,
        })
    }

    async fn register(
        &self,
        opportunity_id: Uuid,
    ) -> (broadcast::Receiver<PriceUpdate>, Arc<AtomicUsize>) {
        let mut channels = self.channels.write().await;
        let capacity = self.config.channel_capacity.max(1);
        let channel = channels.entry(opportunity_id).or_insert_with(|| Channel {
            tx: broadcast::channel(capacity).0,
            subscribers: Arc::new(AtomicUsize::new(0)),
        });
        (channel.tx.subscribe(), channel.subscribers.clone())
    }

    /// Remove a channel nobody listens to
    async fn prune(&self, opportunity_id: Uuid) {
        let mut channels = self.channels.write().await;
        remove_if_idle(&mut channels, opportunity_id);
    }

    /// `prune` for drop paths, which cannot await. A busy map defers the
    /// prune to a task.
    fn prune_soon(&self, opportunity_id: Uuid) {
        match self.channels.try_write() {
            Ok(mut channels) => remove_if_idle(&mut channels, opportunity_id),
            Err(_) => {
                if let Ok(handle) = Handle::try_current() {
                    let broadcaster = self.clone();
                    handle.spawn(async move { broadcaster.prune(opportunity_id).await });
                }
            }
        }
    }

    async fn load_opportunity(&self, opportunity_id: Uuid) -> AppResult<Opportunity> {
        self.opportunities
            .find_by_id(opportunity_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Opportunity {} not found", opportunity_id)))
    }

    async fn snapshot(
        &self,
        opportunity_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> AppResult<Snapshot> {
        let opportunity = self.load_opportunity(opportunity_id).await?;

        let points = match since {
            Some(since) => {
                self.price_history
                    .find_since(opportunity_id, Some(since))
                    .await?
            }
            None => {
                let recent = self
                    .price_history
                    .find_recent(opportunity_id, self.config.resync_points.max(1))
                    .await?;
                if recent.is_empty() {
                    let base = self.pricing.tier_base_price(&opportunity);
                    vec![history::base_point(&opportunity, base)]
                } else {
                    recent
                }
            }
        };

        let last_seen = points.last().map(|p| p.recorded_at).or(since);

        let event = PriceEvent::Resync {
            opportunity_id,
            current_price: opportunity.effective_price(),
            status: opportunity.status(self.clock.now()),
            points,
        };

        Ok(Snapshot {
            event,
            last_seen,
            frozen: opportunity.is_frozen(),
        })
    }
}

fn remove_if_idle(channels: &mut Channels, opportunity_id: Uuid) {
    if channels.get(&opportunity_id).map_or(false, Channel::is_idle) {
        channels.remove(&opportunity_id);
        debug!("Dropped idle price channel for opportunity {}", opportunity_id);
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct PriceSubscription {
    opportunity_id: Uuid,
    broadcaster: PriceBroadcaster,
    pending: VecDeque<PriceEvent>,
    receiver: Option<broadcast::Receiver<PriceUpdate>>,
    last_seen: Option<DateTime<Utc>>,
    subscribers: Option<Arc<AtomicUsize>>,
}

impl PriceSubscription {
    pub fn opportunity_id(&self) -> Uuid {
        self.opportunity_id
    }

    /// Whether live updates can still arrive
    pub fn is_live(&self) -> bool {
        self.receiver.is_some()
    }

    /// Next event, or `None` once the opportunity's channel is closed
    pub async fn next(&mut self) -> Option<PriceEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }

        loop {
            let receiver = self.receiver.as_mut()?;
            match receiver.recv().await {
                Ok(update) => {
                    if matches!(self.last_seen, Some(seen) if update.timestamp <= seen) {
                        continue;
                    }
                    self.last_seen = Some(update.timestamp);
                    return Some(PriceEvent::Update(update));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "Subscriber on opportunity {} lagged by {} updates, resyncing",
                        self.opportunity_id, skipped
                    );
                    match self
                        .broadcaster
                        .snapshot(self.opportunity_id, self.last_seen)
                        .await
                    {
                        Ok(snapshot) => {
                            self.last_seen = snapshot.last_seen;
                            return Some(snapshot.event);
                        }
                        Err(e) => {
                            warn!("Resync for opportunity {} failed: {}", self.opportunity_id, e);
                            continue;
                        }
                    }
                }
                Err(RecvError::Closed) => {
                    self.release();
                    return None;
                }
            }
        }
    }

    /// Consume the subscription as a stream of events
    pub fn into_stream(self) -> impl Stream<Item = PriceEvent> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.next().await.map(|event| (event, subscription))
        })
    }

    /// Release the subscription immediately
    pub fn unsubscribe(self) {}

    fn release(&mut self) {
        self.receiver = None;
        if let Some(counter) = self.subscribers.take() {
            if counter.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.broadcaster.prune_soon(self.opportunity_id);
            }
        }
    }
}

impl Drop for PriceSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::PricingConfig;
    use crate::models::NewOpportunity;
    use crate::repositories::MemoryStore;
    use chrono::Duration;

    fn sample_opportunity() -> Opportunity {
        let posted_at = Utc::now() - Duration::hours(1);
        NewOpportunity {
            title: "Retail earnings".into(),
            industry: "retail".into(),
            tags: vec![],
            tier: 1,
            base_price: None,
            slots_total: 3,
            posted_at,
            deadline: posted_at + Duration::days(2),
        }
        .into_opportunity(Decimal::new(225, 0))
    }

    async fn setup() -> (Arc<MemoryStore>, PriceBroadcaster, Opportunity) {
        let store = Arc::new(MemoryStore::new());
        let opp = store.insert(&sample_opportunity()).await.unwrap();

        let broadcaster = PriceBroadcaster::new(
            store.clone(),
            store.clone(),
            Arc::new(PricingModel::new(PricingConfig::default()).unwrap()),
            Arc::new(ManualClock::new(Utc::now())),
            BroadcastConfig::default(),
        );
        (store, broadcaster, opp)
    }

    fn update(opp: &Opportunity, at: DateTime<Utc>, price: i64) -> PriceUpdate {
        PriceUpdate {
            opportunity_id: opp.id,
            price: Decimal::new(price, 0),
            trend: PriceTrend::Up,
            timestamp: at,
            slots_remaining: 3,
        }
    }

    #[tokio::test]
    async fn test_resync_then_live_updates() {
        let (_store, broadcaster, opp) = setup().await;
        let mut sub = broadcaster.subscribe(opp.id, None).await.unwrap();

        match sub.next().await.unwrap() {
            PriceEvent::Resync { points, status, .. } => {
                assert_eq!(status, OpportunityStatus::Open);
                assert_eq!(points.len(), 1);
                assert!(points[0].is_initial());
            }
            other => panic!("expected resync, got {:?}", other),
        }

        let at = opp.posted_at + Duration::minutes(5);
        assert_eq!(broadcaster.publish(update(&opp, at, 230)).await, 1);
        match sub.next().await.unwrap() {
            PriceEvent::Update(u) => assert_eq!(u.price, Decimal::new(230, 0)),
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_live_updates_are_dropped() {
        let (store, broadcaster, opp) = setup().await;
        let t1 = opp.posted_at + Duration::minutes(1);
        store
            .append(&PricePoint::initial(opp.id, opp.posted_at, opp.base_price, 3))
            .await
            .unwrap();
        store
            .append(&PricePoint::new(opp.id, t1, Decimal::new(230, 0), 3, PriceTrend::Up))
            .await
            .unwrap();

        let mut sub = broadcaster.subscribe(opp.id, Some(opp.posted_at)).await.unwrap();
        match sub.next().await.unwrap() {
            PriceEvent::Resync { points, .. } => {
                assert_eq!(points.len(), 1);
                assert_eq!(points[0].recorded_at, t1);
            }
            other => panic!("expected resync, got {:?}", other),
        }

        // Already covered by the resync
        broadcaster.publish(update(&opp, t1, 230)).await;
        let t2 = t1 + Duration::minutes(1);
        broadcaster.publish(update(&opp, t2, 235)).await;

        match sub.next().await.unwrap() {
            PriceEvent::Update(u) => assert_eq!(u.timestamp, t2),
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_count_tracks_drops() {
        let (_store, broadcaster, opp) = setup().await;
        let a = broadcaster.subscribe(opp.id, None).await.unwrap();
        let b = broadcaster.subscribe(opp.id, None).await.unwrap();
        assert_eq!(broadcaster.connection_count(opp.id).await, 2);

        a.unsubscribe();
        assert_eq!(broadcaster.connection_count(opp.id).await, 1);
        drop(b);
        assert_eq!(broadcaster.connection_count(opp.id).await, 0);
    }

    #[tokio::test]
    async fn test_closed_channel_ends_stream() {
        let (store, broadcaster, opp) = setup().await;
        let mut sub = broadcaster.subscribe(opp.id, None).await.unwrap();
        sub.next().await.unwrap();

        store.freeze(opp.id, Decimal::new(230, 0)).await.unwrap();
        broadcaster.close_channel(opp.id).await;
        assert!(sub.next().await.is_none());
        assert_eq!(broadcaster.publish(update(&opp, Utc::now(), 240)).await, 0);

        let late = broadcaster.subscribe(opp.id, None).await.unwrap();
        assert!(!late.is_live());
        assert_eq!(broadcaster.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_channels_are_removed_once_nobody_listens() {
        let (store, broadcaster, opp) = setup().await;

        // As after a restart: frozen in the store, never closed here
        for _ in 0..10 {
            let frozen = store.insert(&sample_opportunity()).await.unwrap();
            store.freeze(frozen.id, Decimal::new(200, 0)).await.unwrap();
            let sub = broadcaster.subscribe(frozen.id, None).await.unwrap();
            assert!(!sub.is_live());
            drop(sub);
        }
        assert_eq!(broadcaster.channel_count().await, 0);

        let first = broadcaster.subscribe(opp.id, None).await.unwrap();
        let second = broadcaster.subscribe(opp.id, None).await.unwrap();
        assert_eq!(broadcaster.channel_count().await, 1);

        first.unsubscribe();
        assert_eq!(broadcaster.channel_count().await, 1);
        second.unsubscribe();
        assert_eq!(broadcaster.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_opportunity_is_not_found() {
        let (_store, broadcaster, _opp) = setup().await;
        let err = broadcaster.subscribe(Uuid::new_v4(), None).await.err().unwrap();
        assert!(err.is_not_found());
    }
}
