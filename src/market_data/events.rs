//! Typed publish/subscribe surface keyed by event kind.
//!
//! Listeners run synchronously, in registration order, on the thread that emits.
//! A panicking listener is caught and reported through an [`FeedEvent::Error`]; a
//! panic inside an error listener is logged and swallowed so reporting cannot recurse.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::error::FeedError;
use crate::market_data::adapters::Venue;
use crate::market_data::types::{IntradayTrade, NormalizedOption, NormalizedTicker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Error,
    TickerUpdated,
    OptionUpdated,
    TradeClassified,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Connected { venue: Venue },
    Disconnected { venue: Venue, reason: String },
    Error { venue: Option<Venue>, error: FeedError },
    TickerUpdated(NormalizedTicker),
    /// `trade` is set when the update came from a classified print.
    OptionUpdated { option: NormalizedOption, trade: Option<IntradayTrade> },
    TradeClassified(IntradayTrade),
}

impl FeedEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            FeedEvent::Connected { .. } => EventKind::Connected,
            FeedEvent::Disconnected { .. } => EventKind::Disconnected,
            FeedEvent::Error { .. } => EventKind::Error,
            FeedEvent::TickerUpdated(_) => EventKind::TickerUpdated,
            FeedEvent::OptionUpdated { .. } => EventKind::OptionUpdated,
            FeedEvent::TradeClassified(_) => EventKind::TradeClassified,
        }
    }
}

/// Returned by [`EventBus::on`]; pass to [`EventBus::off`] to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

type Callback = Arc<dyn Fn(&FeedEvent) + Send + Sync>;

struct Listener {
    id: u64,
    kind: EventKind,
    once: bool,
    callback: Callback,
}

thread_local! {
    static DISPATCHING_ERROR: Cell<bool> = const { Cell::new(false) };
}

#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<Listener>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, f: F) -> ListenerHandle
    where
        F: Fn(&FeedEvent) + Send + Sync + 'static,
    {
        self.register(kind, false, Arc::new(f))
    }

    /// Runs at most once, then removes itself.
    pub fn once<F>(&self, kind: EventKind, f: F) -> ListenerHandle
    where
        F: Fn(&FeedEvent) + Send + Sync + 'static,
    {
        self.register(kind, true, Arc::new(f))
    }

    /// Returns false if the handle was already removed.
    pub fn off(&self, handle: ListenerHandle) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| l.id != handle.0);
        listeners.len() != before
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.lock().iter().filter(|l| l.kind == kind).count()
    }

    pub fn clear(&self) {
        self.listeners.lock().clear();
    }

    fn register(&self, kind: EventKind, once: bool, callback: Callback) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push(Listener { id, kind, once, callback });
        ListenerHandle(id)
    }

    pub fn emit(&self, event: &FeedEvent) {
        let kind = event.kind();
        // Snapshot under the lock, call outside it so listeners may call on/off
        let targets: Vec<(u64, Callback)> = {
            let mut listeners = self.listeners.lock();
            let targets = listeners
                .iter()
                .filter(|l| l.kind == kind)
                .map(|l| (l.id, Arc::clone(&l.callback)))
                .collect();
            listeners.retain(|l| !(l.once && l.kind == kind));
            targets
        };

        if kind == EventKind::Error {
            self.dispatch_error(event, targets);
            return;
        }

        for (id, callback) in targets {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
                let message = panic_message(&panic);
                warn!(listener = id, ?kind, %message, "listener panicked");
                let venue = match event {
                    FeedEvent::Connected { venue } | FeedEvent::Disconnected { venue, .. } => Some(*venue),
                    _ => None,
                };
                self.emit(&FeedEvent::Error {
                    venue,
                    error: FeedError::Listener(format!("{:?} listener: {}", kind, message)),
                });
            }
        }
    }

    fn dispatch_error(&self, event: &FeedEvent, targets: Vec<(u64, Callback)>) {
        if DISPATCHING_ERROR.with(|d| d.replace(true)) {
            // Already inside an error dispatch on this thread
            error!(?event, "error raised while reporting an error; dropped");
            return;
        }
        for (id, callback) in targets {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
                error!(listener = id, message = %panic_message(&panic), "error listener panicked");
            }
        }
        DISPATCHING_ERROR.with(|d| d.set(false));
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
