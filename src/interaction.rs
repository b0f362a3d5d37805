//! Interaction state and notification
//!
//! Each declared interaction of an [`ExposedThing`](crate::exposed::ExposedThing) pairs its
//! affordance with a mutable state:
//!
//! - [`PropertyState`]: current value, optional read/write handlers and a [`Notifier`] for
//!   observers;
//! - [`ActionState`]: optional handler;
//! - [`EventState`]: a [`Notifier`] for subscribers.
//!
//! Handlers of the same interaction share an explicit [`Scope`], received through their
//! [`HandlerContext`].

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};

use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};

use crate::{
    error::BoxError,
    thing::{ActionAffordance, EventAffordance, PropertyAffordance},
};

/// Callback receiving property changes or event data.
///
/// Two listeners are the same listener when they point to the same allocation.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Outcome of a user handler.
pub type HandlerResult<T> = Result<T, BoxError>;

/// Produces the value of a property on read.
pub type PropertyReadHandler =
    Arc<dyn Fn(HandlerContext) -> BoxFuture<'static, HandlerResult<Value>> + Send + Sync>;

/// Accepts a written value.
///
/// Returning `Some(value)` stores `value` instead of the written one, `None` stores the written
/// value as is.
pub type PropertyWriteHandler = Arc<
    dyn Fn(Value, HandlerContext) -> BoxFuture<'static, HandlerResult<Option<Value>>>
        + Send
        + Sync,
>;

/// Runs an action with its optional input.
pub type ActionHandler = Arc<
    dyn Fn(Option<Value>, HandlerContext) -> BoxFuture<'static, HandlerResult<Value>>
        + Send
        + Sync,
>;

/// Box an async closure into a [`PropertyReadHandler`].
pub fn read_handler<F, Fut>(f: F) -> PropertyReadHandler
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<Value>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Box an async closure into a [`PropertyWriteHandler`].
pub fn write_handler<F, Fut>(f: F) -> PropertyWriteHandler
where
    F: Fn(Value, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<Option<Value>>> + Send + 'static,
{
    Arc::new(move |value, ctx| f(value, ctx).boxed())
}

/// Box an async closure into an [`ActionHandler`].
pub fn action_handler<F, Fut>(f: F) -> ActionHandler
where
    F: Fn(Option<Value>, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<Value>> + Send + 'static,
{
    Arc::new(move |input, ctx| f(input, ctx).boxed())
}

/// Mutable storage shared by the handlers of one interaction.
#[derive(Clone, Default)]
pub struct Scope(Arc<Mutex<Map<String, Value>>>);

impl Scope {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.lock().get(key).cloned()
    }

    /// Store a value, returning the previous one.
    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.lock().insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.lock().remove(key)
    }

    /// Run `f` with exclusive access to the whole scope.
    pub fn with<R>(&self, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
        f(&mut self.0.lock())
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Scope").field(&*self.0.lock()).finish()
    }
}

/// What a handler knows about the call it is serving.
#[derive(Clone, Debug)]
pub struct HandlerContext {
    pub thing_id: Arc<str>,
    pub name: Arc<str>,
    pub scope: Scope,
}

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of a [`Subscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type CancelFn = Box<dyn FnOnce() + Send>;

/// Handle to an active observation or subscription.
///
/// Dropping the handle does not cancel it, call [`Subscription::unsubscribe`].
pub struct Subscription {
    id: SubscriptionId,
    active: Arc<AtomicBool>,
    cancel: Mutex<Option<CancelFn>>,
}

impl Subscription {
    /// A subscription that runs `cancel` the first time it is unsubscribed.
    ///
    /// Used by protocol clients to hand out their own subscriptions.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self::with_flag(
            SubscriptionId::next(),
            Arc::new(AtomicBool::new(true)),
            Box::new(cancel),
        )
    }

    fn with_flag(id: SubscriptionId, active: Arc<AtomicBool>, cancel: CancelFn) -> Self {
        Self {
            id,
            active,
            cancel: Mutex::new(Some(cancel)),
        }
    }

    #[inline]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop receiving notifications. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        self.active.store(false, Ordering::Release);
        let cancel = self.cancel.lock().take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

struct Entry {
    id: SubscriptionId,
    listener: Listener,
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct Subscribers(Mutex<Vec<Entry>>);

impl Subscribers {
    fn remove(&self, id: SubscriptionId) {
        self.0.lock().retain(|entry| entry.id != id);
    }
}

#[inline]
fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Fan-out of values to any number of independent listeners.
///
/// Delivery happens on the notifying task, outside of the internal lock, so a listener may
/// subscribe or unsubscribe from inside its own callback. A listener is never called after its
/// subscription has been cancelled.
#[derive(Default)]
pub struct Notifier {
    subscribers: Arc<Subscribers>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    ///
    /// Subscribing a listener that is already registered replaces its previous subscription,
    /// which becomes inactive.
    pub fn subscribe(&self, listener: Listener) -> Subscription {
        let id = SubscriptionId::next();
        let active = Arc::new(AtomicBool::new(true));
        let weak: Weak<Subscribers> = Arc::downgrade(&self.subscribers);

        let mut entries = self.subscribers.0.lock();
        if let Some(pos) = entries
            .iter()
            .position(|entry| same_listener(&entry.listener, &listener))
        {
            entries.remove(pos).active.store(false, Ordering::Release);
        }
        entries.push(Entry {
            id,
            listener,
            active: Arc::clone(&active),
        });

        Subscription::with_flag(
            id,
            active,
            Box::new(move || {
                if let Some(subscribers) = weak.upgrade() {
                    subscribers.remove(id);
                }
            }),
        )
    }

    /// Deliver `value` to every active listener, returning how many were called.
    pub fn notify(&self, value: &Value) -> usize {
        let snapshot: Vec<_> = self
            .subscribers
            .0
            .lock()
            .iter()
            .map(|entry| (Arc::clone(&entry.listener), Arc::clone(&entry.active)))
            .collect();

        let mut delivered = 0;
        for (listener, active) in snapshot {
            if active.load(Ordering::Acquire) {
                listener(value);
                delivered += 1;
            }
        }

        delivered
    }

    /// Cancel every subscription.
    pub fn clear(&self) {
        for entry in self.subscribers.0.lock().drain(..) {
            entry.active.store(false, Ordering::Release);
        }
    }

    /// Whether the subscription `id` is currently registered here.
    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.subscribers.0.lock().iter().any(|entry| entry.id == id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.0.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("subscribers", &self.len())
            .finish()
    }
}

/// Mutable side of a property
#[derive(Default)]
pub struct PropertyState {
    value: RwLock<Value>,
    // Serializes compare, store and notify
    commit: tokio::sync::Mutex<()>,
    notifier: Notifier,
    scope: Scope,
    read_handler: RwLock<Option<PropertyReadHandler>>,
    write_handler: RwLock<Option<PropertyWriteHandler>>,
}

impl PropertyState {
    pub fn new(initial: Value) -> Self {
        Self {
            value: RwLock::new(initial),
            ..Default::default()
        }
    }

    /// The last committed value.
    #[inline]
    pub fn value(&self) -> Value {
        self.value.read().clone()
    }

    /// Store `value` and notify observers if it differs from the current one.
    ///
    /// Concurrent commits are applied one at a time, in the order they are requested. Returns
    /// whether observers were notified.
    pub async fn commit(&self, value: Value) -> bool {
        let _guard = self.commit.lock().await;
        {
            let mut current = self.value.write();
            if *current == value {
                return false;
            }
            *current = value.clone();
        }

        self.notifier.notify(&value);
        true
    }

    #[inline]
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    #[inline]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn read_handler(&self) -> Option<PropertyReadHandler> {
        self.read_handler.read().clone()
    }

    pub fn set_read_handler(&self, handler: Option<PropertyReadHandler>) {
        *self.read_handler.write() = handler;
    }

    pub fn write_handler(&self) -> Option<PropertyWriteHandler> {
        self.write_handler.read().clone()
    }

    pub fn set_write_handler(&self, handler: Option<PropertyWriteHandler>) {
        *self.write_handler.write() = handler;
    }
}

/// Mutable side of an action
#[derive(Default)]
pub struct ActionState {
    scope: Scope,
    handler: RwLock<Option<ActionHandler>>,
}

impl ActionState {
    pub fn handler(&self) -> Option<ActionHandler> {
        self.handler.read().clone()
    }

    pub fn set_handler(&self, handler: Option<ActionHandler>) {
        *self.handler.write() = handler;
    }

    #[inline]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

/// Mutable side of an event
#[derive(Default)]
pub struct EventState {
    notifier: Notifier,
}

impl EventState {
    /// Deliver `data` to every subscriber.
    #[inline]
    pub fn emit(&self, data: &Value) -> usize {
        self.notifier.notify(data)
    }

    #[inline]
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }
}

/// A declared interaction: its affordance together with its runtime state.
pub struct Interaction<A, S> {
    pub affordance: A,
    pub state: Arc<S>,
}

pub type ExposedProperty = Interaction<PropertyAffordance, PropertyState>;
pub type ExposedAction = Interaction<ActionAffordance, ActionState>;
pub type ExposedEvent = Interaction<EventAffordance, EventState>;

impl<A, S: Default> Interaction<A, S> {
    pub fn new(affordance: A) -> Self {
        Self {
            affordance,
            state: Arc::new(S::default()),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;

    fn recorder() -> (Listener, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Listener = Arc::new(move |value: &Value| sink.lock().push(value.clone()));
        (listener, seen)
    }

    #[test]
    fn fan_out_to_every_listener() {
        let notifier = Notifier::new();
        let (a, seen_a) = recorder();
        let (b, seen_b) = recorder();
        let _sub_a = notifier.subscribe(a);
        let _sub_b = notifier.subscribe(b);

        assert_eq!(notifier.notify(&json!(1)), 2);
        assert_eq!(*seen_a.lock(), vec![json!(1)]);
        assert_eq!(*seen_b.lock(), vec![json!(1)]);
    }

    #[test]
    fn unsubscribe_is_independent_and_idempotent() {
        let notifier = Notifier::new();
        let (a, seen_a) = recorder();
        let (b, seen_b) = recorder();
        let sub_a = notifier.subscribe(a);
        let _sub_b = notifier.subscribe(b);

        sub_a.unsubscribe();
        sub_a.unsubscribe();
        assert!(!sub_a.is_active());
        assert_eq!(notifier.len(), 1);

        notifier.notify(&json!("x"));
        assert!(seen_a.lock().is_empty());
        assert_eq!(*seen_b.lock(), vec![json!("x")]);
    }

    #[test]
    fn same_listener_replaces_its_slot() {
        let notifier = Notifier::new();
        let (a, seen) = recorder();
        let first = notifier.subscribe(Arc::clone(&a));
        let second = notifier.subscribe(a);

        assert!(!first.is_active());
        assert!(second.is_active());
        assert_eq!(notifier.len(), 1);

        notifier.notify(&json!(true));
        assert_eq!(seen.lock().len(), 1);

        // the stale handle must not cancel the new registration
        first.unsubscribe();
        assert_eq!(notifier.notify(&json!(false)), 1);
    }

    #[test]
    fn listener_can_unsubscribe_itself() {
        let notifier = Notifier::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::default();

        let listener: Listener = {
            let calls = Arc::clone(&calls);
            let slot = Arc::clone(&slot);
            Arc::new(move |_: &Value| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(sub) = slot.lock().as_ref() {
                    sub.unsubscribe();
                }
            })
        };
        *slot.lock() = Some(notifier.subscribe(listener));

        notifier.notify(&json!(1));
        notifier.notify(&json!(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(notifier.is_empty());
    }

    #[test]
    fn clear_deactivates_handles() {
        let notifier = Notifier::new();
        let (a, _) = recorder();
        let sub = notifier.subscribe(a);

        notifier.clear();
        assert!(!sub.is_active());
        assert_eq!(notifier.notify(&json!(null)), 0);
    }

    #[test]
    fn custom_subscription_cancels_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let sub = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn commit_notifies_only_on_change() {
        let state = PropertyState::new(json!(20));
        let (listener, seen) = recorder();
        let _sub = state.notifier().subscribe(listener);

        assert!(!state.commit(json!(20)).await);
        assert!(state.commit(json!(25)).await);
        assert!(!state.commit(json!(25)).await);

        assert_eq!(state.value(), json!(25));
        assert_eq!(*seen.lock(), vec![json!(25)]);
    }

    #[test]
    fn scope_is_shared_between_clones() {
        let scope = Scope::default();
        let other = scope.clone();

        scope.set("count", json!(1));
        assert_eq!(other.get("count"), Some(json!(1)));
        other.with(|map| map.insert("count".into(), json!(2)));
        assert_eq!(scope.remove("count"), Some(json!(2)));
        assert_eq!(scope.get("count"), None);
    }
}
