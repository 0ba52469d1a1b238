//! Typed publish/subscribe dispatcher driving the session lifecycle.
//!
//! Every topic has exactly one [`Event`] variant carrying its own payload, so
//! handlers match on variants instead of casting untyped tuples.
//!
//! ## Rules
//! - Delivery is synchronous, on the publishing thread, in subscription order.
//! - A handler only ever sees events of the topic it subscribed to.
//! - A handler that errors or panics is logged and skipped; the remaining
//!   handlers of the same publish still run.
//! - `publish` dispatches to a snapshot of the subscriber list, so a handler
//!   subscribed while an event is being dispatched does not receive it, and
//!   handlers may publish or subscribe re-entrantly.
//!
//! Lifecycle order for one session:
//! `init` → `start` → `tick`* → `stop-requested`? → `pre-shutdown` →
//! `post-shutdown` → `report`.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::error;

use crate::queue::QueueLengths;
use crate::termination::StopReason;

/// Event topic, one per [`Event`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Init,
    Start,
    Tick,
    StopRequested,
    Stop,
    AssertFailed,
    PreShutdown,
    PostShutdown,
    Report,
}

impl Topic {
    pub fn name(&self) -> &'static str {
        match self {
            Topic::Init => "init",
            Topic::Start => "start",
            Topic::Tick => "tick",
            Topic::StopRequested => "stop-requested",
            Topic::Stop => "stop",
            Topic::AssertFailed => "assert-failed",
            Topic::PreShutdown => "pre-shutdown",
            Topic::PostShutdown => "post-shutdown",
            Topic::Report => "report",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Progress snapshot carried by every `tick`.
#[derive(Debug, Clone, Serialize)]
pub struct TickStatus {
    pub elapsed: Duration,
    pub outstanding: i64,
    pub completed: u64,
    pub queues: QueueLengths,
}

#[derive(Debug, Clone)]
pub enum Event {
    Init,
    Start,
    Tick(TickStatus),
    /// Published once, when a session is stopped before running out of work.
    StopRequested(StopReason),
    /// A program termination point was reached.
    Stop(Option<String>),
    /// An assertion violation was observed.
    AssertFailed(Option<String>),
    PreShutdown,
    PostShutdown,
    Report,
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::Init => Topic::Init,
            Event::Start => Topic::Start,
            Event::Tick(_) => Topic::Tick,
            Event::StopRequested(_) => Topic::StopRequested,
            Event::Stop(_) => Topic::Stop,
            Event::AssertFailed(_) => Topic::AssertFailed,
            Event::PreShutdown => Topic::PreShutdown,
            Event::PostShutdown => Topic::PostShutdown,
            Event::Report => Topic::Report,
        }
    }
}

pub type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Topic-keyed subscription table.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<Topic, Vec<Handler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to `topic`'s delivery list.
    pub fn subscribe<F>(&self, topic: Topic, handler: F)
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Deliver `event` to every current subscriber of its topic.
    ///
    /// Returns the number of handlers that failed.
    pub fn publish(&self, event: Event) -> usize {
        let topic = event.topic();
        let snapshot: Vec<Handler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&topic)
            .cloned()
            .unwrap_or_default();

        let mut failures = 0;
        for (index, handler) in snapshot.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failures += 1;
                    error!(%topic, handler = index, error = %err, "event handler failed");
                }
                Err(payload) => {
                    failures += 1;
                    error!(
                        %topic,
                        handler = index,
                        panic = %panic_message(payload.as_ref()),
                        "event handler panicked"
                    );
                }
            }
        }
        failures
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&topic)
            .map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let counts: HashMap<&'static str, usize> =
            handlers.iter().map(|(t, h)| (t.name(), h.len())).collect();
        f.debug_struct("EventBus").field("handlers", &counts).finish()
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(
        log: &Arc<Mutex<Vec<&'static str>>>,
        tag: &'static str,
    ) -> impl Fn(&Event) -> anyhow::Result<()> {
        let log = Arc::clone(log);
        move |_| {
            log.lock().unwrap().push(tag);
            Ok(())
        }
    }

    #[test]
    fn test_subscription_order_is_delivery_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Topic::Start, recorder(&log, "h1"));
        bus.subscribe(Topic::Start, recorder(&log, "h2"));
        bus.subscribe(Topic::Start, recorder(&log, "h3"));

        assert_eq!(bus.publish(Event::Start), 0);
        assert_eq!(*log.lock().unwrap(), vec!["h1", "h2", "h3"]);
    }

    #[test]
    fn test_other_topics_not_delivered() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Topic::Report, recorder(&log, "report"));
        bus.publish(Event::Init);
        bus.publish(Event::PreShutdown);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(bus.subscriber_count(Topic::Report), 1);
        assert_eq!(bus.subscriber_count(Topic::Init), 0);
    }

    #[test]
    fn test_late_subscriber_misses_dispatched_event() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Topic::Init, recorder(&log, "early"));
        bus.publish(Event::Init);
        bus.subscribe(Topic::Init, recorder(&log, "late"));
        assert_eq!(*log.lock().unwrap(), vec!["early"]);
    }

    #[test]
    fn test_failing_handlers_do_not_stop_dispatch() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Topic::Report, |_| Err(anyhow::anyhow!("reporter broke")));
        bus.subscribe(Topic::Report, |_| panic!("reporter exploded"));
        bus.subscribe(Topic::Report, recorder(&log, "survivor"));

        assert_eq!(bus.publish(Event::Report), 2);
        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
    }

    #[test]
    fn test_handler_may_subscribe_during_dispatch() {
        let bus = Arc::new(EventBus::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let inner_bus = Arc::clone(&bus);
            let inner_log = Arc::clone(&log);
            bus.subscribe(Topic::Tick, move |_| {
                inner_bus.subscribe(Topic::Tick, recorder(&inner_log, "added"));
                Ok(())
            });
        }
        let tick = || {
            Event::Tick(TickStatus {
                elapsed: Duration::ZERO,
                outstanding: 1,
                completed: 0,
                queues: QueueLengths::default(),
            })
        };
        bus.publish(tick());
        assert!(log.lock().unwrap().is_empty());
        bus.publish(tick());
        assert_eq!(*log.lock().unwrap(), vec!["added"]);
    }

    #[test]
    fn test_payload_reaches_handler() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(None));
        {
            let seen = Arc::clone(&seen);
            bus.subscribe(Topic::AssertFailed, move |event| {
                if let Event::AssertFailed(message) = event {
                    *seen.lock().unwrap() = message.clone();
                }
                Ok(())
            });
        }
        bus.publish(Event::AssertFailed(Some("x < 0".into())));
        assert_eq!(seen.lock().unwrap().as_deref(), Some("x < 0"));
    }

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::StopRequested.name(), "stop-requested");
        assert_eq!(Event::PostShutdown.topic(), Topic::PostShutdown);
        assert_eq!(Event::Stop(None).topic().to_string(), "stop");
    }
}
