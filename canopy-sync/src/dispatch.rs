//! Outbound event dispatch with per-widget debounce.
//!
//! Coalesced events (slider drags, text typing) wait for the debounce
//! window and only the last value per widget is sent. Action events
//! (clicks, submits) first flush every pending coalesced value, so the
//! server sees the state an action depends on before the action itself.

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::client::EventSink;
use crate::protocol::OutboundMessage;

/// Dispatch configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Debounce window for coalesced events, in milliseconds.
    pub debounce_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { debounce_ms: 150 }
    }
}

impl DispatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// How a single event is delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Debounce this event instead of sending it now.
    pub coalesce: bool,
    /// Ask the server not to rerun the script for this event.
    pub no_rerun: bool,
}

impl DispatchOptions {
    pub fn coalesced() -> Self {
        Self {
            coalesce: true,
            no_rerun: false,
        }
    }

    pub fn action() -> Self {
        Self::default()
    }

    pub fn no_rerun(mut self) -> Self {
        self.no_rerun = true;
        self
    }
}

struct PendingEvent {
    value: Value,
    no_rerun: bool,
    /// Distinguishes this entry from the one a stale timer was armed for.
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct PendingQueue {
    events: IndexMap<String, PendingEvent>,
    next_generation: u64,
}

type Shared = Arc<Mutex<PendingQueue>>;

fn lock(pending: &Shared) -> MutexGuard<'_, PendingQueue> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Send every queued event in first-pending order. Callers hold the queue
/// lock across the sends, which keeps removal and delivery atomic.
fn send_all<S: EventSink>(sink: &S, queue: &mut PendingQueue) {
    if !queue.events.is_empty() {
        log::debug!("Flushing {} pending events", queue.events.len());
    }
    for (id, event) in queue.events.drain(..) {
        event.timer.abort();
        sink.send(OutboundMessage::widget_event(id, event.value, event.no_rerun));
    }
}

/// Debouncing front of the connection.
pub struct EventDispatcher<S: EventSink + 'static> {
    sink: Arc<S>,
    debounce: Duration,
    pending: Shared,
    /// Runtime current at construction, for dispatches from outside one.
    runtime: Option<Handle>,
}

impl<S: EventSink + 'static> EventDispatcher<S> {
    pub fn new(sink: S, config: &DispatchConfig) -> Self {
        Self::with_shared_sink(Arc::new(sink), config)
    }

    pub fn with_shared_sink(sink: Arc<S>, config: &DispatchConfig) -> Self {
        Self {
            sink,
            debounce: config.debounce(),
            pending: Arc::new(Mutex::new(PendingQueue::default())),
            runtime: Handle::try_current().ok(),
        }
    }

    pub fn sink(&self) -> &Arc<S> {
        &self.sink
    }

    /// Send or schedule an event. Without a tokio runtime coalesced
    /// events are sent right away.
    pub fn dispatch(&self, id: &str, value: Value, options: DispatchOptions) {
        if options.coalesce {
            self.schedule(id, value, options.no_rerun);
        } else {
            let mut queue = lock(&self.pending);
            send_all(&*self.sink, &mut queue);
            self.sink
                .send(OutboundMessage::widget_event(id, value, options.no_rerun));
        }
    }

    /// Send every pending coalesced event now, in first-pending order.
    pub fn flush(&self) {
        send_all(&*self.sink, &mut lock(&self.pending));
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).events.len()
    }

    /// Drop every pending event without sending it.
    pub fn cancel_all(&self) {
        for (_, event) in lock(&self.pending).events.drain(..) {
            event.timer.abort();
        }
    }

    fn schedule(&self, id: &str, value: Value, no_rerun: bool) {
        let mut queue = lock(&self.pending);
        let Some(runtime) = Handle::try_current().ok().or_else(|| self.runtime.clone()) else {
            log::warn!("No tokio runtime to debounce '{id}', sending now");
            send_all(&*self.sink, &mut queue);
            self.sink
                .send(OutboundMessage::widget_event(id, value, no_rerun));
            return;
        };
        queue.next_generation += 1;
        let generation = queue.next_generation;

        let timer = runtime.spawn(fire_after(
            self.debounce,
            id.to_owned(),
            generation,
            self.pending.clone(),
            self.sink.clone(),
        ));

        let event = PendingEvent {
            value,
            no_rerun,
            generation,
            timer,
        };
        // An existing id keeps its queue position.
        if let Some(previous) = queue.events.insert(id.to_owned(), event) {
            previous.timer.abort();
        }
    }
}

impl<S: EventSink + 'static> Drop for EventDispatcher<S> {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

async fn fire_after<S: EventSink + 'static>(
    delay: Duration,
    id: String,
    generation: u64,
    pending: Shared,
    sink: Arc<S>,
) {
    tokio::time::sleep(delay).await;

    // Held through the send so a concurrent flush cannot overtake it.
    let mut queue = lock(&pending);
    let event = match queue.events.get(&id) {
        Some(event) if event.generation == generation => queue.events.shift_remove(&id),
        // Replaced or flushed while this timer was waking up.
        _ => None,
    };

    if let Some(event) = event {
        sink.send(OutboundMessage::widget_event(id, event.value, event.no_rerun));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Records everything sent through it.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        sent: Mutex<Vec<OutboundMessage>>,
    }

    impl RecordingSink {
        pub(crate) fn sent(&self) -> Vec<OutboundMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl EventSink for RecordingSink {
        fn send(&self, message: OutboundMessage) {
            self.sent.lock().unwrap().push(message);
        }
    }

    fn event(id: &str, value: Value) -> OutboundMessage {
        OutboundMessage::widget_event(id, value, false)
    }

    fn dispatcher() -> EventDispatcher<RecordingSink> {
        EventDispatcher::new(RecordingSink::default(), &DispatchConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_sends_last_value_once() {
        let dispatcher = dispatcher();
        for v in [1, 2, 3] {
            dispatcher.dispatch("slider", json!(v), DispatchOptions::coalesced());
        }
        assert!(dispatcher.sink().sent().is_empty());
        assert_eq!(dispatcher.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(dispatcher.sink().sent(), vec![event("slider", json!(3))]);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_value_restarts_window() {
        let dispatcher = dispatcher();
        dispatcher.dispatch("slider", json!(1), DispatchOptions::coalesced());
        tokio::time::sleep(Duration::from_millis(100)).await;
        dispatcher.dispatch("slider", json!(2), DispatchOptions::coalesced());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(dispatcher.sink().sent().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(dispatcher.sink().sent(), vec![event("slider", json!(2))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_flushes_pending_first() {
        let dispatcher = dispatcher();
        dispatcher.dispatch("a", json!(10), DispatchOptions::coalesced());
        dispatcher.dispatch("b", json!(true), DispatchOptions::action());

        assert_eq!(
            dispatcher.sink().sent(),
            vec![event("a", json!(10)), event("b", json!(true))]
        );

        // The flushed value's timer must not fire a second send.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(dispatcher.sink().sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_keeps_first_pending_order() {
        let dispatcher = dispatcher();
        dispatcher.dispatch("x", json!(1), DispatchOptions::coalesced());
        dispatcher.dispatch("y", json!(1), DispatchOptions::coalesced());
        dispatcher.dispatch("x", json!(2), DispatchOptions::coalesced());
        dispatcher.flush();

        assert_eq!(
            dispatcher.sink().sent(),
            vec![event("x", json!(2)), event("y", json!(1))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_widgets_each_send() {
        let dispatcher = dispatcher();
        dispatcher.dispatch("x", json!("a"), DispatchOptions::coalesced());
        dispatcher.dispatch("y", json!("b"), DispatchOptions::coalesced());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let sent = dispatcher.sink().sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.contains(&event("x", json!("a"))));
        assert!(sent.contains(&event("y", json!("b"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_drops_pending() {
        let dispatcher = dispatcher();
        dispatcher.dispatch("x", json!(1), DispatchOptions::coalesced());
        dispatcher.cancel_all();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(dispatcher.sink().sent().is_empty());
        assert_eq!(dispatcher.pending_count(), 0);
    }

    /// Stalls inside its first send, like a congested socket.
    #[derive(Default)]
    struct StallingSink {
        inner: RecordingSink,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl EventSink for StallingSink {
        fn send(&self, message: OutboundMessage) {
            if self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                std::thread::sleep(Duration::from_millis(100));
            }
            self.inner.send(message);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_action_waits_for_timer_send_in_flight() {
        let config = DispatchConfig { debounce_ms: 20 };
        let dispatcher = EventDispatcher::new(StallingSink::default(), &config);

        dispatcher.dispatch("a", json!(1), DispatchOptions::coalesced());
        // The timer has fired and is stuck sending "a".
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.dispatch("b", json!(true), DispatchOptions::action());

        assert_eq!(
            dispatcher.sink().inner.sent(),
            vec![event("a", json!(1)), event("b", json!(true))]
        );
    }

    #[test]
    fn test_coalesced_without_runtime_sends_now() {
        let dispatcher = dispatcher();
        dispatcher.dispatch("slider", json!(4), DispatchOptions::coalesced());

        assert_eq!(dispatcher.sink().sent(), vec![event("slider", json!(4))]);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_no_rerun_passes_through() {
        let dispatcher = dispatcher();
        dispatcher.dispatch("toggle", json!(false), DispatchOptions::action().no_rerun());
        assert_eq!(
            dispatcher.sink().sent(),
            vec![OutboundMessage::widget_event("toggle", json!(false), true)]
        );
    }
}
