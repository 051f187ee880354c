//! Generic single-consumer event dispatch.
//!
//! A dispatcher serializes all events posted from any number of producer
//! threads onto one handler thread, in strict post order. It has no domain
//! knowledge; a pipeline uses one to serialize the completion, failure, and
//! timeout signals of all its stages.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{trace, warn};

struct MailboxState<E> {
    events: VecDeque<E>,
    stopping: bool,
}

struct Mailbox<E> {
    state: Mutex<MailboxState<E>>,
    cv: Condvar,
}

/// Cheap clonable producer handle.
pub struct EventSink<E> {
    inner: Arc<Mailbox<E>>,
}

impl<E> Clone for EventSink<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> EventSink<E> {
    /// Enqueue an event and wake the handler thread.
    ///
    /// Events posted after `stop` are silently discarded.
    pub fn post(&self, event: E) {
        let mut state = self.inner.state.lock().unwrap();
        if state.stopping {
            trace!("event posted after dispatcher stop, dropped");
            return;
        }
        state.events.push_back(event);
        self.inner.cv.notify_one();
    }
}

/// Single-consumer async mailbox with a dedicated handler thread.
///
/// `stop` does not drain: pending events may be dropped. Callers must stop
/// the dispatcher only after all producers are quiesced.
pub struct EventDispatcher<E> {
    inner: Arc<Mailbox<E>>,
    handler: Mutex<Option<JoinHandle<()>>>,
    name: String,
}

impl<E: Send + 'static> EventDispatcher<E> {
    /// Create a dispatcher. The mailbox accepts events immediately; the
    /// handler thread starts on [`run`](Self::run).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mailbox {
                state: Mutex::new(MailboxState {
                    events: VecDeque::new(),
                    stopping: false,
                }),
                cv: Condvar::new(),
            }),
            handler: Mutex::new(None),
            name: name.into(),
        }
    }

    /// Get a producer handle.
    pub fn sink(&self) -> EventSink<E> {
        EventSink {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Spawn the handler thread. Events are handed to `handler` one at a
    /// time, in post order.
    pub fn run(&self, mut handler: impl FnMut(E) + Send + 'static) {
        let inner = Arc::clone(&self.inner);
        let name = self.name.clone();
        let thread = std::thread::Builder::new()
            .name(format!("events-{name}"))
            .spawn(move || {
                let mut state = inner.state.lock().unwrap();
                loop {
                    if state.stopping {
                        let dropped = state.events.len();
                        if dropped > 0 {
                            warn!(dispatcher = %name, dropped, "dropping pending events on stop");
                        }
                        return;
                    }
                    if let Some(event) = state.events.pop_front() {
                        drop(state);
                        handler(event);
                        state = inner.state.lock().unwrap();
                        continue;
                    }
                    state = inner.cv.wait(state).unwrap();
                }
            })
            .expect("failed to spawn event dispatcher thread");
        *self.handler.lock().unwrap() = Some(thread);
    }

    /// Stop the handler thread and join it. Pending events are dropped.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.stopping = true;
            self.inner.cv.notify_all();
        }
        if let Some(handle) = self.handler.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Number of events waiting to be handled.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().unwrap().events.len()
    }

    /// The dispatcher's name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<E> Drop for EventDispatcher<E> {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.stopping = true;
            self.inner.cv.notify_all();
        }
        if let Some(handle) = self.handler.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    #[test]
    fn test_events_handled_in_post_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let dispatcher = EventDispatcher::<u64>::new("order");
        let sink = dispatcher.sink();
        dispatcher.run(move |e| seen_clone.lock().unwrap().push(e));

        for i in 0..100 {
            sink.post(i);
        }
        while dispatcher.pending() > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_multiple_producers_serialized() {
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = Arc::clone(&count);

        let dispatcher = EventDispatcher::<u64>::new("producers");
        dispatcher.run(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sink = dispatcher.sink();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        sink.post(i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        while count.load(Ordering::SeqCst) < 1000 {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn test_post_after_stop_is_dropped() {
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = Arc::clone(&count);

        let dispatcher = EventDispatcher::<u64>::new("stopped");
        let sink = dispatcher.sink();
        dispatcher.run(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.stop();

        sink.post(1);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
