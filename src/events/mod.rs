//! Routing of typed gateway events to application handlers and collectors.
//!
//! Handlers are registered per [`EventType`] and run synchronously, in
//! registration order, on the shard task which received the event. A handler
//! returning an error (or panicking) is logged and skipped: dispatch carries on
//! to the remaining handlers, and the shard keeps reading.
//!
//! Collectors are short-lived listeners keyed by channel and message, for
//! awaiting reactions or component interactions on one message.

use crate::model::{CollectorKey, Event, EventType};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    error::Error as StdError,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{error, trace, warn};

/// Information about where an event came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct EventContext {
    /// Index of the shard which received the event.
    pub shard: u64,
}

impl EventContext {
    /// Context for an event received by `shard`.
    #[must_use]
    pub fn new(shard: u64) -> Self {
        Self { shard }
    }
}

/// Trait to handle an event which can be fired by the gateway.
pub trait EventHandler: Send + Sync {
    /// Respond to one event.
    fn act(&self, ctx: &EventContext, event: &Event) -> HandlerResult;
}

impl<F> EventHandler for F
where
    F: Fn(&EventContext, &Event) -> HandlerResult + Send + Sync,
{
    fn act(&self, ctx: &EventContext, event: &Event) -> HandlerResult {
        self(ctx, event)
    }
}

/// An error returned by an [`EventHandler`].
pub struct HandlerError(Box<dyn StdError + Send + Sync>);

impl HandlerError {
    /// Wraps any error.
    pub fn new(e: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self(e.into())
    }
}

impl<E: StdError + Send + Sync + 'static> From<E> for HandlerError {
    fn from(e: E) -> Self {
        Self(Box::new(e))
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Result type of event handlers.
pub type HandlerResult = Result<(), HandlerError>;

type CollectorMap = DashMap<CollectorKey, Vec<(u64, flume::Sender<Event>)>>;

/// Maps event types to handlers, and composite keys to collectors.
#[derive(Default)]
pub struct EventRouter {
    handlers: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
    collectors: Arc<CollectorMap>,
    next_collector: AtomicU64,
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers: usize = self.handlers.read().values().map(Vec::len).sum();
        f.debug_struct("EventRouter")
            .field("handlers", &handlers)
            .field("collectors", &self.collectors.len())
            .finish()
    }
}

impl EventRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler for `event_type`, after any already registered.
    pub fn register(&self, event_type: EventType, handler: impl EventHandler + 'static) {
        self.handlers
            .write()
            .entry(event_type)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Number of handlers registered for `event_type`.
    #[must_use]
    pub fn handler_count(&self, event_type: EventType) -> usize {
        self.handlers.read().get(&event_type).map_or(0, Vec::len)
    }

    /// Runs every handler for the event's type, then feeds matching collectors.
    pub fn dispatch(&self, ctx: &EventContext, event: &Event) {
        let event_type = event.event_type();

        // Handlers run without the lock held, so they may register others.
        let handlers = self
            .handlers
            .read()
            .get(&event_type)
            .cloned()
            .unwrap_or_default();

        trace!("Dispatching {:?} to {} handler(s).", event_type, handlers.len());

        for (i, handler) in handlers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| handler.act(ctx, event))) {
                Ok(Ok(())) => {},
                Ok(Err(e)) => warn!("Handler {} for {:?} failed: {}.", i, event_type, e),
                Err(_) => error!("Handler {} for {:?} panicked.", i, event_type),
            }
        }

        if let Some(key) = event.collector_key() {
            if let Some(mut entry) = self.collectors.get_mut(&key) {
                entry.retain(|(_, tx)| tx.send(event.clone()).is_ok());
            }
            self.collectors.remove_if(&key, |_, v| v.is_empty());
        }
    }

    /// Starts collecting every event concerning the given channel and message.
    ///
    /// Collection stops when the returned [`Collector`] is dropped.
    #[must_use]
    pub fn collect(&self, key: CollectorKey) -> Collector {
        let id = self.next_collector.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = flume::unbounded();

        self.collectors.entry(key).or_default().push((id, tx));

        Collector {
            key,
            id,
            rx,
            map: self.collectors.clone(),
        }
    }

    /// Number of keys with live collectors.
    #[must_use]
    pub fn collector_count(&self) -> usize {
        self.collectors.len()
    }
}

/// Receives events matching one [`CollectorKey`].
pub struct Collector {
    key: CollectorKey,
    id: u64,
    rx: flume::Receiver<Event>,
    map: Arc<CollectorMap>,
}

impl Collector {
    /// Key this collector listens on.
    #[must_use]
    pub fn key(&self) -> CollectorKey {
        self.key
    }

    /// Waits for the next matching event.
    pub async fn next(&self) -> Option<Event> {
        self.rx.recv_async().await.ok()
    }

    /// Waits up to `wait` for the next matching event.
    pub async fn next_timeout(&self, wait: Duration) -> Option<Event> {
        tokio::time::timeout(wait, self.next()).await.ok().flatten()
    }

    /// Returns an already-received event, if any.
    #[must_use]
    pub fn try_next(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("key", &self.key)
            .field("pending", &self.rx.len())
            .finish()
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        if let Some(mut entry) = self.map.get_mut(&self.key) {
            entry.retain(|(id, _)| *id != self.id);
        }
        self.map.remove_if(&self.key, |_, v| v.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{ChannelId, MessageId};
    use parking_lot::Mutex;
    use serde_json::json;

    fn reaction(channel: u64, message: u64) -> Event {
        Event::from_dispatch(
            "MESSAGE_REACTION_ADD",
            json!({
                "user_id": "1",
                "channel_id": channel.to_string(),
                "message_id": message.to_string(),
            }),
        )
        .unwrap()
    }

    fn key(channel: u64, message: u64) -> CollectorKey {
        CollectorKey {
            channel_id: ChannelId(channel),
            message_id: MessageId(message),
        }
    }

    #[derive(Debug)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("boom")
        }
    }

    impl StdError for Boom {}

    #[test]
    fn handlers_run_in_order_despite_failures() {
        let router = EventRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = log.clone();
        router.register(EventType::ReactionAdd, move |_: &EventContext, _: &Event| -> HandlerResult {
            l.lock().push(1);
            Err(HandlerError::from(Boom))
        });
        router.register(EventType::ReactionAdd, |_: &EventContext, _: &Event| -> HandlerResult {
            panic!("handler bug")
        });
        let l = log.clone();
        router.register(EventType::ReactionAdd, move |_: &EventContext, _: &Event| -> HandlerResult {
            l.lock().push(3);
            Ok(())
        });
        let l = log.clone();
        router.register(EventType::MessageCreate, move |_: &EventContext, _: &Event| -> HandlerResult {
            l.lock().push(99);
            Ok(())
        });

        router.dispatch(&EventContext::new(0), &reaction(1, 2));
        router.dispatch(&EventContext::new(0), &reaction(1, 2));

        assert_eq!(*log.lock(), vec![1, 3, 1, 3]);
        assert_eq!(router.handler_count(EventType::ReactionAdd), 3);
    }

    #[test]
    fn handler_sees_shard_context() {
        let router = EventRouter::new();
        let seen = Arc::new(Mutex::new(None));

        let s = seen.clone();
        router.register(EventType::ReactionAdd, move |ctx: &EventContext, _: &Event| -> HandlerResult {
            *s.lock() = Some(ctx.shard);
            Ok(())
        });

        router.dispatch(&EventContext::new(3), &reaction(1, 2));
        assert_eq!(*seen.lock(), Some(3));
    }

    #[tokio::test]
    async fn collectors_receive_only_matching_events() {
        let router = EventRouter::new();
        let collector = router.collect(key(1, 2));

        router.dispatch(&EventContext::new(0), &reaction(1, 3));
        router.dispatch(&EventContext::new(0), &reaction(1, 2));

        let got = collector.next_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.collector_key(), Some(key(1, 2)));
        assert!(collector.try_next().is_none());
    }

    #[test]
    fn dropping_a_collector_unregisters_it() {
        let router = EventRouter::new();
        let first = router.collect(key(1, 2));
        let second = router.collect(key(1, 2));
        assert_eq!(router.collector_count(), 1);

        drop(first);
        assert_eq!(router.collector_count(), 1);
        router.dispatch(&EventContext::new(0), &reaction(1, 2));
        assert!(second.try_next().is_some());

        drop(second);
        assert_eq!(router.collector_count(), 0);
    }
}
