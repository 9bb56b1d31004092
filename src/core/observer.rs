//! Lifecycle observers
//!
//! Every subscription remembers the execution context it was made from and
//! callbacks are always posted back to it, never run on the emitting thread.
//! A context is, in order of preference: an [`EventLoop`] entered on the
//! subscribing thread, the tokio runtime the subscriber runs in, or a shared
//! dispatch thread.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use tracing::{debug, error};

use super::appid::AppId;
use super::helper::HelperType;
use crate::jobs::FailureType;
use crate::platform::Pid;

/// Token returned by `connect`, used to disconnect
pub type SubscriptionId = u64;

type Task = Box<dyn FnOnce() + Send>;

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_LOOP: RefCell<Option<LoopHandle>> = const { RefCell::new(None) };
}

/// Sender side of an [`EventLoop`]
#[derive(Clone)]
pub struct LoopHandle {
    tx: Sender<Task>,
}

impl LoopHandle {
    /// Queue a task. False if the loop is gone.
    pub fn post(&self, task: Task) -> bool {
        self.tx.send(task).is_ok()
    }
}

/// A queue of callbacks drained by the thread that owns it
pub struct EventLoop {
    tx: Sender<Task>,
    rx: Receiver<Task>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            tx: self.tx.clone(),
        }
    }

    /// Make this loop the delivery context for subscriptions made on the
    /// current thread until the guard drops
    pub fn enter(&self) -> LoopGuard {
        let previous = CURRENT_LOOP.with(|cell| cell.borrow_mut().replace(self.handle()));
        LoopGuard { previous }
    }

    /// Run every queued callback, returning how many ran
    pub fn dispatch_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Run callbacks as they arrive until `timeout` elapses
    pub fn run_for(&self, timeout: Duration) -> usize {
        self.run_until(timeout, || false);
        self.dispatch_pending()
    }

    /// Run callbacks until `done` returns true or `timeout` elapses
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return done();
            }
            if let Ok(task) = self.rx.recv_timeout(remaining) {
                task();
            }
        }
    }
}

/// Restores the previous thread context on drop
pub struct LoopGuard {
    previous: Option<LoopHandle>,
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_LOOP.with(|cell| *cell.borrow_mut() = previous);
    }
}

/// Shared thread for subscribers with no context of their own
static DISPATCHER: Lazy<LoopHandle> = Lazy::new(|| {
    let (tx, rx) = mpsc::channel::<Task>();
    let spawned = std::thread::Builder::new()
        .name("observer-dispatch".to_string())
        .spawn(move || {
            for task in rx {
                task();
            }
        });
    if let Err(e) = spawned {
        error!("Unable to start observer dispatch thread: {}", e);
    }
    LoopHandle { tx }
});

/// Where a subscription's callbacks run
#[derive(Clone)]
pub enum DeliveryContext {
    /// The thread that drains the loop
    Loop(LoopHandle),
    /// A task spawned on the runtime. On a current-thread runtime that is
    /// the subscribing thread; on a multi-thread runtime it is whichever
    /// runtime worker picks the task up, not necessarily the subscriber's.
    /// Subscribers that need their own thread should enter an [`EventLoop`].
    Runtime(tokio::runtime::Handle),
    /// The shared `observer-dispatch` thread
    Dispatcher,
}

impl DeliveryContext {
    /// The context of the calling thread
    pub fn current() -> Self {
        if let Some(handle) = CURRENT_LOOP.with(|cell| cell.borrow().clone()) {
            return Self::Loop(handle);
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => Self::Runtime(handle),
            Err(_) => Self::Dispatcher,
        }
    }

    fn post(&self, task: Task) {
        let delivered = match self {
            Self::Loop(handle) => handle.post(task),
            Self::Runtime(handle) => {
                handle.spawn(async move { task() });
                true
            }
            Self::Dispatcher => DISPATCHER.post(task),
        };
        if !delivered {
            debug!("Dropping event for a subscriber whose loop has gone");
        }
    }
}

struct Slot<E> {
    id: SubscriptionId,
    context: DeliveryContext,
    callback: Arc<dyn Fn(E) + Send + Sync>,
}

/// One typed event channel
pub struct Signal<E> {
    slots: Mutex<Vec<Slot<E>>>,
}

impl<E> Default for Signal<E> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }
}

impl<E: Clone + Send + 'static> Signal<E> {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Slot<E>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe from the calling thread's context
    pub fn connect(&self, callback: impl Fn(E) + Send + Sync + 'static) -> SubscriptionId {
        self.connect_on(DeliveryContext::current(), callback)
    }

    pub fn connect_on(
        &self,
        context: DeliveryContext,
        callback: impl Fn(E) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed);
        self.slots().push(Slot {
            id,
            context,
            callback: Arc::new(callback),
        });
        id
    }

    /// False if `id` was never connected here or is already gone
    pub fn disconnect(&self, id: SubscriptionId) -> bool {
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|s| s.id != id);
        slots.len() != before
    }

    /// Post `event` to every subscriber's context
    pub fn emit(&self, event: &E) {
        for slot in self.slots().iter() {
            let callback = Arc::clone(&slot.callback);
            let event = event.clone();
            slot.context.post(Box::new(move || callback(event)));
        }
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An application instance changed state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppEvent {
    pub app_id: AppId,
    pub instance_id: String,
}

/// An application instance was paused or resumed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidsEvent {
    pub app_id: AppId,
    pub instance_id: String,
    pub pids: Vec<Pid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedEvent {
    pub app_id: AppId,
    pub instance_id: String,
    pub kind: FailureType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperEvent {
    pub helper_type: HelperType,
    pub app_id: AppId,
    pub instance_id: String,
}

/// The set of installed applications changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoEvent {
    pub app_id: AppId,
}

type HelperSignals = Mutex<HashMap<HelperType, Arc<Signal<HelperEvent>>>>;

/// Every lifecycle signal of one registry
#[derive(Default)]
pub struct ObserverBus {
    app_starting: Signal<AppEvent>,
    app_started: Signal<AppEvent>,
    app_stopped: Signal<AppEvent>,
    app_focused: Signal<AppEvent>,
    app_paused: Signal<PidsEvent>,
    app_resumed: Signal<PidsEvent>,
    app_failed: Signal<FailedEvent>,
    app_added: Signal<InfoEvent>,
    app_info_updated: Signal<InfoEvent>,
    app_removed: Signal<InfoEvent>,
    helper_started: HelperSignals,
    helper_stopped: HelperSignals,
}

fn helper_signal(map: &HelperSignals, helper_type: &HelperType) -> Arc<Signal<HelperEvent>> {
    let mut map = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    Arc::clone(map.entry(helper_type.clone()).or_default())
}

fn existing_helper_signal(
    map: &HelperSignals,
    helper_type: &HelperType,
) -> Option<Arc<Signal<HelperEvent>>> {
    let map = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    map.get(helper_type).cloned()
}

impl ObserverBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A launch is about to be handed to the supervisor
    pub fn app_starting(&self) -> &Signal<AppEvent> {
        &self.app_starting
    }

    pub fn app_started(&self) -> &Signal<AppEvent> {
        &self.app_started
    }

    pub fn app_stopped(&self) -> &Signal<AppEvent> {
        &self.app_stopped
    }

    pub fn app_focused(&self) -> &Signal<AppEvent> {
        &self.app_focused
    }

    pub fn app_paused(&self) -> &Signal<PidsEvent> {
        &self.app_paused
    }

    pub fn app_resumed(&self) -> &Signal<PidsEvent> {
        &self.app_resumed
    }

    pub fn app_failed(&self) -> &Signal<FailedEvent> {
        &self.app_failed
    }

    pub fn app_added(&self) -> &Signal<InfoEvent> {
        &self.app_added
    }

    pub fn app_info_updated(&self) -> &Signal<InfoEvent> {
        &self.app_info_updated
    }

    pub fn app_removed(&self) -> &Signal<InfoEvent> {
        &self.app_removed
    }

    /// Started events for one helper type
    pub fn helper_started(&self, helper_type: &HelperType) -> Arc<Signal<HelperEvent>> {
        helper_signal(&self.helper_started, helper_type)
    }

    /// Stopped events for one helper type
    pub fn helper_stopped(&self, helper_type: &HelperType) -> Arc<Signal<HelperEvent>> {
        helper_signal(&self.helper_stopped, helper_type)
    }

    pub(crate) fn emit_helper_started(&self, event: &HelperEvent) {
        if let Some(signal) = existing_helper_signal(&self.helper_started, &event.helper_type) {
            signal.emit(event);
        }
    }

    pub(crate) fn emit_helper_stopped(&self, event: &HelperEvent) {
        if let Some(signal) = existing_helper_signal(&self.helper_stopped, &event.helper_type) {
            signal.emit(event);
        }
    }

    /// Disconnect from whichever signal issued `id`
    pub fn disconnect(&self, id: SubscriptionId) -> bool {
        let plain = self.app_starting.disconnect(id)
            || self.app_started.disconnect(id)
            || self.app_stopped.disconnect(id)
            || self.app_focused.disconnect(id)
            || self.app_paused.disconnect(id)
            || self.app_resumed.disconnect(id)
            || self.app_failed.disconnect(id)
            || self.app_added.disconnect(id)
            || self.app_info_updated.disconnect(id)
            || self.app_removed.disconnect(id);
        if plain {
            return true;
        }
        [&self.helper_started, &self.helper_stopped].iter().any(|map| {
            let signals: Vec<_> = map
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .values()
                .cloned()
                .collect();
            signals.iter().any(|s| s.disconnect(id))
        })
    }
}
