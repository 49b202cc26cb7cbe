//! # Subscription Manager
//!
//! Owns every live feed. There is at most one provider connection per topic
//! no matter how many consumers subscribe; consumers are reference counted and
//! the connection is torn down when the last one detaches.
//!
//! Each topic is pumped by its own task, so callbacks for one topic run one at
//! a time in delivery order while distinct topics progress concurrently.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_util::StreamExt;
use metrics::counter;
use serde::Serialize;
use shared::Topic;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backoff::BackoffPolicy,
    event::{ChangeEvent, EntityType},
    lock,
    normalizer::{ErrorSink, Normalizer},
    provider::{FeedProvider, RawFeed},
};

/// Consumer callback invoked for every change on a topic.
pub type EventCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Lifecycle state of a topic's feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Opening, or reopening after a disconnect.
    Connecting,
    /// Receiving changes.
    Active,
    /// Torn down, or reconnects exhausted. Terminal.
    Closed,
}

type Consumers = Arc<Mutex<BTreeMap<u64, EventCallback>>>;

struct FeedEntry {
    generation: u64,
    consumers: Consumers,
    status: Arc<watch::Sender<SubscriptionStatus>>,
    cancel: CancellationToken,
}

trait Detach: Send + Sync {
    fn detach(&self, topic: &Topic, generation: u64, consumer: u64);
}

struct Registry<P> {
    provider: Arc<P>,
    backoff: BackoffPolicy,
    error_sink: Option<ErrorSink>,
    feeds: Mutex<HashMap<Topic, FeedEntry>>,
    next_generation: AtomicU64,
    next_consumer: AtomicU64,
}

impl<P> Registry<P> {
    /// Drops the entry for `topic` if it still belongs to `generation`.
    fn retire(&self, topic: &Topic, generation: u64) {
        let mut feeds = lock(&self.feeds);
        if feeds.get(topic).is_some_and(|entry| entry.generation == generation) {
            feeds.remove(topic);
        }
    }
}

impl<P: Send + Sync> Detach for Registry<P> {
    fn detach(&self, topic: &Topic, generation: u64, consumer: u64) {
        let mut feeds = lock(&self.feeds);
        let Some(entry) = feeds.get(topic) else {
            return;
        };
        if entry.generation != generation {
            return;
        }

        let remaining = {
            let mut consumers = lock(&entry.consumers);
            consumers.remove(&consumer);
            consumers.len()
        };
        debug!(topic = %topic, remaining, "consumer detached");

        if remaining == 0 {
            if let Some(entry) = feeds.remove(topic) {
                entry.cancel.cancel();
                info!(topic = %topic, "last consumer left, tearing down feed");
            }
        }
    }
}

/// Reference-counted registry of live feeds.
pub struct SubscriptionManager<P> {
    registry: Arc<Registry<P>>,
}

impl<P> Clone for SubscriptionManager<P> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<P> fmt::Debug for SubscriptionManager<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topics: Vec<Topic> = lock(&self.registry.feeds).keys().copied().collect();
        f.debug_struct("SubscriptionManager")
            .field("backoff", &self.registry.backoff)
            .field("topics", &topics)
            .finish_non_exhaustive()
    }
}

impl<P> SubscriptionManager<P> {
    /// Tears down every feed regardless of attached consumers.
    pub fn close_all(&self) {
        let drained: Vec<(Topic, FeedEntry)> = lock(&self.registry.feeds).drain().collect();
        for (topic, entry) in drained {
            entry.cancel.cancel();
            debug!(topic = %topic, "feed cancelled by shutdown");
        }
    }
}

impl<P: FeedProvider + 'static> SubscriptionManager<P> {
    /// Creates a manager over `provider`.
    #[must_use]
    pub fn new(provider: Arc<P>, backoff: BackoffPolicy, error_sink: Option<ErrorSink>) -> Self {
        Self {
            registry: Arc::new(Registry {
                provider,
                backoff,
                error_sink,
                feeds: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                next_consumer: AtomicU64::new(0),
            }),
        }
    }

    /// Attaches `on_event` to `topic`, opening the feed if this is the first consumer.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime, since a new feed spawns its pump task.
    pub fn subscribe(&self, topic: Topic, on_event: EventCallback) -> SubscriptionHandle {
        let consumer = self.registry.next_consumer.fetch_add(1, Ordering::Relaxed);
        let mut feeds = lock(&self.registry.feeds);
        let entry = feeds
            .entry(topic)
            .or_insert_with(|| self.spawn_feed(topic));
        lock(&entry.consumers).insert(consumer, on_event);

        let detach: Weak<dyn Detach> = Arc::downgrade(&self.registry) as Weak<dyn Detach>;
        SubscriptionHandle {
            topic,
            generation: entry.generation,
            consumer,
            status: entry.status.subscribe(),
            registry: detach,
            closed: false,
        }
    }

    /// Topics with a live (or reconnecting) feed.
    #[must_use]
    pub fn active_topics(&self) -> Vec<Topic> {
        lock(&self.registry.feeds).keys().copied().collect()
    }

    /// Consumers attached to `topic`.
    #[must_use]
    pub fn consumer_count(&self, topic: &Topic) -> usize {
        lock(&self.registry.feeds)
            .get(topic)
            .map_or(0, |entry| lock(&entry.consumers).len())
    }

    fn spawn_feed(&self, topic: Topic) -> FeedEntry {
        let generation = self.registry.next_generation.fetch_add(1, Ordering::Relaxed);
        let consumers: Consumers = Arc::new(Mutex::new(BTreeMap::new()));
        let (status, _) = watch::channel(SubscriptionStatus::Connecting);
        let status = Arc::new(status);
        let cancel = CancellationToken::new();

        let mut normalizer = Normalizer::new(topic);
        if let Some(sink) = &self.registry.error_sink {
            normalizer = normalizer.with_error_sink(Arc::clone(sink));
        }

        let pump = FeedPump {
            registry: Arc::downgrade(&self.registry),
            provider: Arc::clone(&self.registry.provider),
            backoff: self.registry.backoff,
            topic,
            generation,
            normalizer,
            consumers: Arc::clone(&consumers),
            status: Arc::clone(&status),
            cancel: cancel.clone(),
        };
        tokio::spawn(pump.run());
        info!(topic = %topic, generation, "feed task started");

        FeedEntry {
            generation,
            consumers,
            status,
            cancel,
        }
    }
}

enum PumpExit {
    Cancelled,
    Disconnected(String),
}

struct FeedPump<P> {
    registry: Weak<Registry<P>>,
    provider: Arc<P>,
    backoff: BackoffPolicy,
    topic: Topic,
    generation: u64,
    normalizer: Normalizer,
    consumers: Consumers,
    status: Arc<watch::Sender<SubscriptionStatus>>,
    cancel: CancellationToken,
}

impl<P: FeedProvider + 'static> FeedPump<P> {
    async fn run(self) {
        let entities = EntityType::for_topic(&self.topic);
        let mut failures: u32 = 0;

        loop {
            self.status.send_replace(SubscriptionStatus::Connecting);
            let opened = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                opened = self.provider.open(&self.topic, entities) => opened,
            };

            match opened {
                Ok(mut feed) => {
                    counter!("feedsync_feed_opens_total").increment(1);
                    failures = 0;
                    self.status.send_replace(SubscriptionStatus::Active);
                    debug!(topic = %self.topic, "feed active");

                    let exit = self.pump(&mut feed, entities).await;
                    drop(feed);
                    self.provider.close(&self.topic).await;
                    match exit {
                        PumpExit::Cancelled => break,
                        PumpExit::Disconnected(reason) => {
                            warn!(topic = %self.topic, reason = %reason, "feed disconnected");
                        }
                    }
                }
                Err(err) => warn!(topic = %self.topic, error = %err, "feed open failed"),
            }

            failures += 1;
            if !self.backoff.allows(failures) {
                warn!(topic = %self.topic, attempts = failures - 1, "reconnect attempts exhausted");
                counter!("feedsync_feed_exhausted_total").increment(1);
                self.status.send_replace(SubscriptionStatus::Closed);
                if let Some(registry) = self.registry.upgrade() {
                    registry.retire(&self.topic, self.generation);
                }
                return;
            }

            counter!("feedsync_feed_reconnects_total").increment(1);
            let delay = self.backoff.delay_for(failures);
            debug!(topic = %self.topic, attempt = failures, delay_ms = delay.as_millis(), "scheduling reconnect");
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.status.send_replace(SubscriptionStatus::Closed);
        debug!(topic = %self.topic, "feed task finished");
    }

    async fn pump(&self, feed: &mut RawFeed, entities: &[EntityType]) -> PumpExit {
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return PumpExit::Cancelled,
                next = feed.next() => next,
            };

            let raw = match next {
                Some(Ok(raw)) => raw,
                Some(Err(err)) => return PumpExit::Disconnected(err.to_string()),
                None => return PumpExit::Disconnected("feed ended".to_string()),
            };

            let entity_type = raw
                .table()
                .and_then(EntityType::from_table)
                .filter(|entity_type| entities.contains(entity_type))
                .unwrap_or(entities[0]);
            let Some(event) = self.normalizer.normalize_or_report(&raw, entity_type) else {
                continue;
            };

            if !self.topic.admits(event.topic()) {
                counter!("feedsync_events_dropped_total", "reason" => "other_topic").increment(1);
                continue;
            }

            // Changes already in flight when the topic closes are discarded.
            if self.cancel.is_cancelled() {
                return PumpExit::Cancelled;
            }

            let callbacks: Vec<EventCallback> = lock(&self.consumers).values().cloned().collect();
            for callback in callbacks {
                callback(&event);
            }
        }
    }
}

/// A consumer's attachment to a topic. Dropping it detaches the consumer.
pub struct SubscriptionHandle {
    topic: Topic,
    generation: u64,
    consumer: u64,
    status: watch::Receiver<SubscriptionStatus>,
    registry: Weak<dyn Detach>,
    closed: bool,
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("topic", &self.topic)
            .field("generation", &self.generation)
            .field("consumer", &self.consumer)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl SubscriptionHandle {
    /// Topic this handle is attached to.
    #[must_use]
    pub const fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Current feed status.
    #[must_use]
    pub fn status(&self) -> SubscriptionStatus {
        *self.status.borrow()
    }

    /// Receiver observing every status change of the feed.
    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<SubscriptionStatus> {
        self.status.clone()
    }

    /// Waits until the feed reports `wanted`. Returns `false` if the feed went
    /// away without ever reaching it.
    pub async fn wait_for_status(&mut self, wanted: SubscriptionStatus) -> bool {
        self.status.wait_for(|status| *status == wanted).await.is_ok()
    }

    /// Detaches this consumer; the feed closes once no consumers remain.
    pub fn close(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(&self.topic, self.generation, self.consumer);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.detach();
    }
}
