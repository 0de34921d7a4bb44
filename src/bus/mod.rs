//! In-process typed publish/subscribe.
//!
//! Subscriptions are append-only and delivered in registration order.
//! Delivery is spawned onto the runtime so a slow subscriber never
//! blocks the publisher, and a failing subscriber is logged and
//! isolated from its peers. A subscription may carry a coalescing rate
//! limit: publishes that arrive before the window has elapsed are
//! dropped, not queued.

mod events;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::error::Result;

pub use events::{AccountCommand, BusEvent, CompoundEchoes, EventKey, LegErrors};

pub type Callback = Arc<dyn Fn(BusEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure into a registrable [`Callback`].
pub fn handler<F, Fut>(f: F) -> Callback
where
    F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

struct Subscription {
    callback: Callback,
    rate_limit: Option<Duration>,
    last_delivery: Mutex<Option<Instant>>,
}

impl Subscription {
    /// The coalescing filter: within the rate-limit window the publish
    /// is dropped; outside it the window restarts.
    fn should_deliver(&self, now: Instant) -> bool {
        let Some(limit) = self.rate_limit else {
            return true;
        };
        let mut last = self.last_delivery.lock();
        if let Some(previous) = *last {
            if now.duration_since(previous) < limit {
                return false;
            }
        }
        *last = Some(now);
        true
    }
}

#[derive(Default)]
pub struct EventBus {
    subscriptions: RwLock<HashMap<EventKey, Vec<Subscription>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subscriber for `key`. There is no unregister; the
    /// table lives as long as the process wiring does.
    pub fn register(&self, key: EventKey, callback: Callback) {
        self.register_subscription(key, callback, None);
    }

    /// Append a subscriber whose deliveries are coalesced to at most
    /// one per `rate_limit`.
    pub fn register_rate_limited(&self, key: EventKey, rate_limit: Duration, callback: Callback) {
        self.register_subscription(key, callback, Some(rate_limit));
    }

    fn register_subscription(
        &self,
        key: EventKey,
        callback: Callback,
        rate_limit: Option<Duration>,
    ) {
        self.subscriptions
            .write()
            .entry(key)
            .or_default()
            .push(Subscription {
                callback,
                rate_limit,
                last_delivery: Mutex::new(None),
            });
    }

    /// Dispatch `event` to every subscriber of its key, in
    /// registration order. Each delivery runs as its own task; the
    /// publisher does not await completion.
    pub fn publish(&self, event: BusEvent) {
        let key = event.key();
        let now = Instant::now();
        let subscriptions = self.subscriptions.read();
        let Some(list) = subscriptions.get(&key) else {
            trace!(key = key.as_str(), "no subscribers");
            return;
        };

        for subscription in list {
            if !subscription.should_deliver(now) {
                trace!(key = key.as_str(), "delivery coalesced by rate limit");
                continue;
            }
            let callback = Arc::clone(&subscription.callback);
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(error) = callback(event).await {
                    warn!(key = key.as_str(), %error, "event subscriber failed");
                }
            });
        }
    }
}
