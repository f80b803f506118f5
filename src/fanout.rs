//! Realtime event fanout.
//!
//! Three logical streams keyed by market, option, and user, multiplexed
//! over one broadcast channel. Events are published after commit, in
//! commit order per subject; each envelope carries the mutating user's id
//! (so clients can drop self-originated echoes) and a per-subject sequence
//! number (so clients can dedupe on (subject, seq, timestamp)).
//!
//! Writers never block: publishing to a full channel evicts the oldest
//! buffered event, and a subscriber that observes the resulting `Lagged`
//! error must drop its view and re-read snapshots.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::lmsr_core::Side;

pub const DEFAULT_FANOUT_CAPACITY: usize = 1024;

/// The stream an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum Subject {
    Market(Uuid),
    Option(Uuid),
    User(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentEventKind {
    Created,
    Updated,
    Deleted,
    Voted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    PriceUpdate {
        option_id: Uuid,
        yes_price: i64,
        no_price: i64,
        yes_quantity: i64,
        no_quantity: i64,
    },
    TradeCreated {
        trade_id: Uuid,
        market_id: Uuid,
        option_id: Uuid,
        user_id: Uuid,
        side: Side,
        quantity: i64,
        total_cost: i64,
    },
    PositionUpdate {
        user_id: Uuid,
        option_id: Uuid,
        yes_shares: i64,
        no_shares: i64,
        realized_pnl: i64,
    },
    BalanceUpdate {
        user_id: Uuid,
        balance_usdc: i64,
    },
    Resolved {
        option_id: Uuid,
        winning_side: i16,
    },
    CommentUpdate {
        market_id: Uuid,
        comment_id: Uuid,
        event: CommentEventKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        upvotes: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        downvotes: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
    },
}

impl EngineEvent {
    pub fn subject(&self) -> Subject {
        match self {
            EngineEvent::PriceUpdate { option_id, .. } => Subject::Option(*option_id),
            EngineEvent::TradeCreated { market_id, .. } => Subject::Market(*market_id),
            EngineEvent::PositionUpdate { user_id, .. } => Subject::User(*user_id),
            EngineEvent::BalanceUpdate { user_id, .. } => Subject::User(*user_id),
            EngineEvent::Resolved { option_id, .. } => Subject::Option(*option_id),
            EngineEvent::CommentUpdate { market_id, .. } => Subject::Market(*market_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub subject: Subject,
    /// Per-subject sequence in commit order.
    pub seq: u64,
    /// The user whose committed action produced this event.
    pub actor: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: EngineEvent,
}

pub struct Fanout {
    sender: broadcast::Sender<EventEnvelope>,
    sequences: Mutex<HashMap<Subject, u64>>,
}

impl Fanout {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequences: Mutex::new(HashMap::new()),
        }
    }

    /// Publish one post-commit event. Delivery is best-effort: with no
    /// subscribers the event is dropped, which is fine — reconnecting
    /// clients reconcile from snapshots.
    pub fn publish(&self, actor: Uuid, event: EngineEvent) {
        let subject = event.subject();
        let seq = {
            let mut sequences = self.sequences.lock().expect("fanout sequence lock poisoned");
            let counter = sequences.entry(subject).or_insert(0);
            *counter += 1;
            *counter
        };
        let envelope = EventEnvelope {
            subject,
            seq,
            actor,
            timestamp: Utc::now(),
            event,
        };
        let _ = self.sender.send(envelope);
    }

    pub fn publish_all(&self, actor: Uuid, events: Vec<EngineEvent>) {
        for event in events {
            self.publish(actor, event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }
}

/// Server-side filter for one websocket subscription. A subscriber names
/// a market, a set of options, a user, or any combination; an envelope is
/// delivered when its subject matches any of them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionFilter {
    pub market_id: Option<Uuid>,
    #[serde(default)]
    pub option_ids: Vec<Uuid>,
    pub user_id: Option<Uuid>,
}

impl SubscriptionFilter {
    pub fn is_empty(&self) -> bool {
        self.market_id.is_none() && self.option_ids.is_empty() && self.user_id.is_none()
    }

    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        match envelope.subject {
            Subject::Market(id) => self.market_id == Some(id),
            Subject::Option(id) => self.option_ids.contains(&id),
            Subject::User(id) => self.user_id == Some(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price_update(option_id: Uuid) -> EngineEvent {
        EngineEvent::PriceUpdate {
            option_id,
            yes_price: 500_000,
            no_price: 500_000,
            yes_quantity: 0,
            no_quantity: 0,
        }
    }

    #[test]
    fn per_subject_sequences_are_monotone_and_independent() {
        let fanout = Fanout::new(64);
        let mut rx = fanout.subscribe();
        let actor = Uuid::new_v4();
        let option_a = Uuid::new_v4();
        let option_b = Uuid::new_v4();

        fanout.publish(actor, price_update(option_a));
        fanout.publish(actor, price_update(option_b));
        fanout.publish(actor, price_update(option_a));

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        let third = rx.try_recv().unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 1);
        assert_eq!(third.seq, 2);
        assert_eq!(first.subject, third.subject);
        assert_eq!(first.actor, actor);
    }

    #[test]
    fn filters_route_by_subject() {
        let market_id = Uuid::new_v4();
        let option_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        let filter = SubscriptionFilter {
            market_id: Some(market_id),
            option_ids: vec![option_id],
            user_id: None,
        };

        let fanout = Fanout::new(8);
        let mut rx = fanout.subscribe();
        fanout.publish(user_id, price_update(option_id));
        fanout.publish(
            user_id,
            EngineEvent::BalanceUpdate {
                user_id,
                balance_usdc: 0,
            },
        );

        let price = rx.try_recv().unwrap();
        let balance = rx.try_recv().unwrap();
        assert!(filter.matches(&price));
        assert!(!filter.matches(&balance));
    }

    #[test]
    fn slow_subscribers_observe_lag_instead_of_blocking_writers() {
        let fanout = Fanout::new(2);
        let mut rx = fanout.subscribe();
        let actor = Uuid::new_v4();
        let option_id = Uuid::new_v4();
        for _ in 0..5 {
            fanout.publish(actor, price_update(option_id));
        }
        match rx.try_recv() {
            Err(tokio::sync::broadcast::error::TryRecvError::Lagged(skipped)) => {
                assert!(skipped > 0);
            }
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[test]
    fn events_serialize_with_flat_type_tags() {
        let envelope = EventEnvelope {
            subject: Subject::Option(Uuid::nil()),
            seq: 7,
            actor: Uuid::nil(),
            timestamp: Utc::now(),
            event: price_update(Uuid::nil()),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "price_update");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["subject"]["scope"], "option");
    }
}
