//! Filtering subscriptions and per-feed convenience wrappers.

use super::{StreamEngine, Subscription};
use crate::events::ids::{normalize_address, normalize_id_str};
use crate::events::{CanonicalEvent, EventType};
use crate::transport::channels;
use std::sync::Arc;

impl StreamEngine {
    /// Invoke `callback` only for events matching `predicate`.
    pub fn subscribe_filtered<P, F>(&self, event_type: EventType, predicate: P, callback: F) -> Subscription
    where
        P: Fn(&CanonicalEvent) -> bool + Send + Sync + 'static,
        F: Fn(&CanonicalEvent) + Send + Sync + 'static,
    {
        self.attach(event_type, filtered(predicate, callback), Vec::new())
    }

    /// Events for one pool or cycle. Types with per-entity socket channels
    /// also hold that channel open for the life of the subscription.
    pub fn subscribe_entity<F>(&self, event_type: EventType, entity_id: &str, callback: F) -> Subscription
    where
        F: Fn(&CanonicalEvent) + Send + Sync + 'static,
    {
        let wanted = normalize_id_str(entity_id);
        let extra = channels::entity_channel(event_type, &wanted)
            .into_iter()
            .collect();
        let predicate = move |e: &CanonicalEvent| e.entity_id == wanted;
        self.attach(event_type, filtered(predicate, callback), extra)
    }

    /// Events whose actor is `address`, compared case-insensitively.
    pub fn subscribe_actor<F>(&self, event_type: EventType, address: &str, callback: F) -> Subscription
    where
        F: Fn(&CanonicalEvent) + Send + Sync + 'static,
    {
        let wanted = normalize_address(address).unwrap_or_else(|| address.trim().to_ascii_lowercase());
        let predicate = move |e: &CanonicalEvent| e.actor_address == wanted;
        self.attach(event_type, filtered(predicate, callback), Vec::new())
    }

    pub fn on_pool_created<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&CanonicalEvent) + Send + Sync + 'static,
    {
        self.subscribe(EventType::PoolCreated, callback)
    }

    pub fn on_pool_settled<F>(&self, pool_id: &str, callback: F) -> Subscription
    where
        F: Fn(&CanonicalEvent) + Send + Sync + 'static,
    {
        self.subscribe_entity(EventType::PoolSettled, pool_id, callback)
    }

    pub fn on_bet_placed<F>(&self, pool_id: &str, callback: F) -> Subscription
    where
        F: Fn(&CanonicalEvent) + Send + Sync + 'static,
    {
        self.subscribe_entity(EventType::BetPlaced, pool_id, callback)
    }

    pub fn on_pool_progress<F>(&self, pool_id: &str, callback: F) -> Subscription
    where
        F: Fn(&CanonicalEvent) + Send + Sync + 'static,
    {
        self.subscribe_entity(EventType::PoolProgress, pool_id, callback)
    }

    pub fn on_reputation_changed<F>(&self, user: &str, callback: F) -> Subscription
    where
        F: Fn(&CanonicalEvent) + Send + Sync + 'static,
    {
        self.subscribe_actor(EventType::ReputationChanged, user, callback)
    }

    pub fn on_liquidity_added<F>(&self, pool_id: &str, callback: F) -> Subscription
    where
        F: Fn(&CanonicalEvent) + Send + Sync + 'static,
    {
        self.subscribe_entity(EventType::LiquidityAdded, pool_id, callback)
    }

    pub fn on_cycle_resolved<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&CanonicalEvent) + Send + Sync + 'static,
    {
        self.subscribe(EventType::CycleResolved, callback)
    }

    pub fn on_slip_evaluated<F>(&self, player: &str, callback: F) -> Subscription
    where
        F: Fn(&CanonicalEvent) + Send + Sync + 'static,
    {
        self.subscribe_actor(EventType::SlipEvaluated, player, callback)
    }

    pub fn on_prize_claimed<F>(&self, player: &str, callback: F) -> Subscription
    where
        F: Fn(&CanonicalEvent) + Send + Sync + 'static,
    {
        self.subscribe_actor(EventType::PrizeClaimed, player, callback)
    }
}

fn filtered<P, F>(predicate: P, callback: F) -> crate::registry::Callback
where
    P: Fn(&CanonicalEvent) -> bool + Send + Sync + 'static,
    F: Fn(&CanonicalEvent) + Send + Sync + 'static,
{
    Arc::new(move |event: &CanonicalEvent| {
        if predicate(event) {
            callback(event);
        }
    })
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::decode::Payload;
    use crate::engine::tests::{engine_with, FakeUpstream, ALICE};
    use crate::engine::StreamEngine;
    use crate::events::{CanonicalEvent, EventType};
    use crate::pipeline::{Inbound, Moment, Source};
    use crate::storage::MemoryKvStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn bet(pool: &str, bettor: &str, now: Moment) -> Inbound {
        Inbound::new(
            EventType::BetPlaced,
            Payload::Value(json!({"poolId": pool, "bettor": bettor, "timestamp": now.unix_secs})),
            Source::Injected,
        )
    }

    #[tokio::test]
    async fn test_entity_filter_normalises_ids() {
        let engine = engine_with(Arc::new(FakeUpstream::default()));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _sub = engine.on_bet_placed("0x2a", move |e: &CanonicalEvent| {
            assert_eq!(e.entity_id, "42");
            h.fetch_add(1, Ordering::SeqCst);
        });

        let now = Moment::now();
        assert_eq!(engine.ingest_at(bet("42", ALICE, now), now).unwrap(), 1);
        // broadcast reaches the filtered callback, which ignores other pools
        engine.ingest_at(bet("43", ALICE, now), now).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_actor_filter_is_case_insensitive() {
        let engine = engine_with(Arc::new(FakeUpstream::default()));
        let hits = Arc::new(Mutex::new(Vec::new()));
        let h = hits.clone();
        let upper = format!("0x{}", ALICE[2..].to_uppercase());
        let _sub = engine.on_slip_evaluated(&upper, move |e: &CanonicalEvent| {
            h.lock().unwrap().push(e.secondary_id.clone());
        });

        let now = Moment::now();
        for (slip, player) in [("1", ALICE), ("2", "0x8617e340b3d01fa5f11f306f4090fd50e238070d")] {
            let inbound = Inbound::new(
                EventType::SlipEvaluated,
                Payload::Value(json!({
                    "cycleId": slip,
                    "slipId": slip,
                    "player": player,
                    "timestamp": now.unix_secs,
                })),
                Source::Injected,
            );
            engine.ingest_at(inbound, now).unwrap();
        }
        assert_eq!(*hits.lock().unwrap(), vec![Some("1".to_string())]);
    }

    #[tokio::test]
    async fn test_predicate_filter() {
        let engine = engine_with(Arc::new(FakeUpstream::default()));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _sub = engine.subscribe_filtered(
            EventType::PoolProgress,
            |e: &CanonicalEvent| e.fill_percentage().is_some_and(|p| p >= 50.0),
            move |_: &CanonicalEvent| {
                h.fetch_add(1, Ordering::SeqCst);
            },
        );

        let now = Moment::now();
        for (pool, fill) in [("1", 20), ("2", 75)] {
            let inbound = Inbound::new(
                EventType::PoolProgress,
                Payload::Value(json!({"poolId": pool, "fillPercentage": fill, "timestamp": now.unix_secs})),
                Source::Injected,
            );
            engine.ingest_at(inbound, now).unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_entity_channel_held_while_subscribed() {
        let mut config = Config::default();
        // nothing listens here; the socket task just keeps retrying
        config.secondary.ws_url = "ws://127.0.0.1:9".into();
        let engine = StreamEngine::builder(&config)
            .upstream(Arc::new(FakeUpstream::default()))
            .store(Arc::new(MemoryKvStore::new()))
            .build()
            .unwrap();

        let sub = engine.on_pool_progress("7", |_| {});
        assert_eq!(sub.channels(), ["pool:7:progress".to_string()]);
        let other = engine.on_pool_created(|_| {});
        assert!(other.channels().is_empty());

        sub.unsubscribe();
        engine.shutdown();
    }
}
