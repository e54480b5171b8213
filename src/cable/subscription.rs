#![expect(
    clippy::module_name_repetitions,
    reason = "Subscription types deliberately include the module name for clarity"
)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_stream::stream;
use dashmap::{DashMap, Entry};
use futures::Stream;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::channel::Channel;
use super::types::request::Command;
use crate::error::Error;
use crate::ws::Transmit;

/// Payload key naming the server-side action of a message command.
pub const ACTION_KEY: &str = "action";

type Hook = Arc<dyn Fn() + Send + Sync>;
type ReceivedHook = Arc<dyn Fn(&Value) + Send + Sync>;
type FailedHook = Arc<dyn Fn(Arc<Error>) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    connected: Option<Hook>,
    disconnected: Option<Hook>,
    rejected: Option<Hook>,
    received: Option<ReceivedHook>,
    failed: Option<FailedHook>,
}

/// Opaque handle distinguishing subscriptions that share an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey(u64);

/// Event delivered through [`Subscriptions::create_stream`].
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// The server confirmed the subscription
    Connected,
    /// The connection closed
    Disconnected,
    /// The server refused the subscription; the stream ends after this event
    Rejected,
    /// Data broadcast on the channel
    Received(Value),
    /// The connection failed
    Failed(Arc<Error>),
}

/// One local subscription to a channel.
///
/// Callbacks run on the connection's worker task and must not block. They may
/// call back into the [`Subscriptions`] registry.
pub struct Subscription {
    key: SubscriptionKey,
    channel: Channel,
    transmitter: Arc<dyn Transmit>,
    callbacks: RwLock<Callbacks>,
}

impl Subscription {
    fn new(key: SubscriptionKey, channel: Channel, transmitter: Arc<dyn Transmit>) -> Self {
        Self {
            key,
            channel,
            transmitter,
            callbacks: RwLock::new(Callbacks::default()),
        }
    }

    #[must_use]
    pub fn key(&self) -> SubscriptionKey {
        self.key
    }

    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    #[must_use]
    pub fn identifier(&self) -> &str {
        self.channel.identifier()
    }

    pub fn on_connected<F: Fn() + Send + Sync + 'static>(&self, f: F) -> &Self {
        self.callbacks_mut().connected = Some(Arc::new(f));
        self
    }

    pub fn on_disconnected<F: Fn() + Send + Sync + 'static>(&self, f: F) -> &Self {
        self.callbacks_mut().disconnected = Some(Arc::new(f));
        self
    }

    pub fn on_rejected<F: Fn() + Send + Sync + 'static>(&self, f: F) -> &Self {
        self.callbacks_mut().rejected = Some(Arc::new(f));
        self
    }

    pub fn on_received<F: Fn(&Value) + Send + Sync + 'static>(&self, f: F) -> &Self {
        self.callbacks_mut().received = Some(Arc::new(f));
        self
    }

    pub fn on_failed<F: Fn(Arc<Error>) + Send + Sync + 'static>(&self, f: F) -> &Self {
        self.callbacks_mut().failed = Some(Arc::new(f));
        self
    }

    /// Invoke `action` on the server-side channel without extra data.
    ///
    /// Returns `false` if the connection is not open.
    pub fn perform(&self, action: &str) -> bool {
        self.send_action(action, Map::new())
    }

    /// Invoke `action` with `data`.
    ///
    /// An `action` key already present in `data` is overwritten in place.
    /// Returns `false` if the connection is not open.
    pub fn perform_with(&self, action: &str, data: Map<String, Value>) -> bool {
        self.send_action(action, data)
    }

    fn send_action(&self, action: &str, mut data: Map<String, Value>) -> bool {
        data.insert(ACTION_KEY.to_owned(), Value::String(action.to_owned()));
        transmit(
            self.transmitter.as_ref(),
            &Command::message(self.identifier(), data),
        )
    }

    pub(crate) fn notify_connected(&self) {
        let hook = self.callbacks().connected.clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub(crate) fn notify_disconnected(&self) {
        let hook = self.callbacks().disconnected.clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub(crate) fn notify_rejected(&self) {
        let hook = self.callbacks().rejected.clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub(crate) fn notify_received(&self, data: &Value) {
        let hook = self.callbacks().received.clone();
        if let Some(hook) = hook {
            hook(data);
        }
    }

    pub(crate) fn notify_failed(&self, error: Arc<Error>) {
        let hook = self.callbacks().failed.clone();
        if let Some(hook) = hook {
            hook(error);
        }
    }

    // We can recover from a poisoned lock because each slot is replaced wholesale.
    fn callbacks(&self) -> RwLockReadGuard<'_, Callbacks> {
        self.callbacks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn callbacks_mut(&self) -> RwLockWriteGuard<'_, Callbacks> {
        self.callbacks.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("identifier", &self.identifier())
            .finish_non_exhaustive()
    }
}

/// Registry multiplexing local subscriptions over one connection.
///
/// Subscriptions are keyed by an opaque [`SubscriptionKey`], not by identifier:
/// several local subscriptions may share one server-side identifier. The
/// registry counts them per identifier and only unsubscribes on the server
/// when the last one is removed.
pub struct Subscriptions {
    transmitter: Arc<dyn Transmit>,
    entries: DashMap<SubscriptionKey, Arc<Subscription>>,
    /// Registered subscriptions per identifier
    refcounts: DashMap<String, usize>,
    next_key: AtomicU64,
}

impl Subscriptions {
    #[must_use]
    pub fn new(transmitter: Arc<dyn Transmit>) -> Self {
        Self {
            transmitter,
            entries: DashMap::new(),
            refcounts: DashMap::new(),
            next_key: AtomicU64::new(0),
        }
    }

    /// Register a subscription to `channel` and send its subscribe command.
    ///
    /// The command is dropped if the connection is not open; it is sent again
    /// when the connection opens.
    pub fn create(&self, channel: Channel) -> Arc<Subscription> {
        self.create_with(channel, |_| {})
    }

    /// Like [`create`](Self::create), with `configure` run before the
    /// subscription is registered so no event is missed.
    pub fn create_with<F: FnOnce(&Subscription)>(
        &self,
        channel: Channel,
        configure: F,
    ) -> Arc<Subscription> {
        let key = SubscriptionKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        let subscription = Arc::new(Subscription::new(
            key,
            channel,
            Arc::clone(&self.transmitter),
        ));
        configure(&subscription);

        self.entries.insert(key, Arc::clone(&subscription));

        let mut count = self
            .refcounts
            .entry(subscription.identifier().to_owned())
            .or_insert(0);
        *count += 1;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            identifier = %subscription.identifier(),
            count = *count,
            "Subscribing to channel"
        );

        // Sent while holding the entry so a concurrent remove cannot
        // unsubscribe between the count update and this command.
        self.send_subscribe(&subscription);
        drop(count);

        subscription
    }

    /// Register a subscription whose events are delivered as a stream.
    ///
    /// The stream ends after [`SubscriptionEvent::Rejected`], or once the
    /// subscription has been removed and dropped.
    pub fn create_stream(
        &self,
        channel: Channel,
    ) -> (
        Arc<Subscription>,
        impl Stream<Item = SubscriptionEvent> + use<>,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let subscription = self.create_with(channel, |subscription| {
            let events = tx.clone();
            subscription.on_connected(move || {
                _ = events.send(SubscriptionEvent::Connected);
            });
            let events = tx.clone();
            subscription.on_disconnected(move || {
                _ = events.send(SubscriptionEvent::Disconnected);
            });
            let events = tx.clone();
            subscription.on_rejected(move || {
                _ = events.send(SubscriptionEvent::Rejected);
            });
            let events = tx.clone();
            subscription.on_received(move |data| {
                _ = events.send(SubscriptionEvent::Received(data.clone()));
            });
            let events = tx.clone();
            subscription.on_failed(move |error| {
                _ = events.send(SubscriptionEvent::Failed(error));
            });
        });
        drop(tx);

        let events = stream! {
            while let Some(event) = rx.recv().await {
                let rejected = matches!(event, SubscriptionEvent::Rejected);
                yield event;
                if rejected {
                    break;
                }
            }
        };

        (subscription, events)
    }

    /// Unregister `subscription`. Returns `false` if it was not registered.
    ///
    /// The server is only told to unsubscribe once no other registered
    /// subscription shares the identifier.
    pub fn remove(&self, subscription: &Subscription) -> bool {
        let removed = self.entries.remove_if(&subscription.key, |_, registered| {
            std::ptr::eq(registered.as_ref(), subscription)
        });
        if removed.is_none() {
            return false;
        }

        self.release(subscription.identifier(), true);
        true
    }

    #[must_use]
    pub fn contains(&self, subscription: &Subscription) -> bool {
        self.entries
            .get(&subscription.key)
            .is_some_and(|entry| std::ptr::eq(entry.value().as_ref(), subscription))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All registered subscriptions in registration order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        let mut subscriptions: Vec<_> = self
            .entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        subscriptions.sort_by_key(|subscription| subscription.key);
        subscriptions
    }

    /// Re-send a subscribe command for every registered subscription.
    pub(crate) fn reload(&self) {
        let subscriptions = self.subscriptions();

        #[cfg(feature = "tracing")]
        tracing::debug!(count = subscriptions.len(), "Re-subscribing to channels");

        for subscription in subscriptions {
            self.send_subscribe(&subscription);
        }
    }

    /// Forget every subscription with `identifier` and notify it of the rejection.
    pub(crate) fn reject(&self, identifier: &str) {
        for subscription in self.matching(identifier) {
            if self.entries.remove(&subscription.key).is_some() {
                self.release(identifier, false);
            }

            #[cfg(feature = "tracing")]
            tracing::debug!(%identifier, "Subscription rejected");

            subscription.notify_rejected();
        }
    }

    pub(crate) fn notify_connected(&self, identifier: &str) {
        for subscription in self.matching(identifier) {
            subscription.notify_connected();
        }
    }

    pub(crate) fn notify_received(&self, identifier: &str, data: &Value) {
        for subscription in self.matching(identifier) {
            subscription.notify_received(data);
        }
    }

    pub(crate) fn notify_disconnected(&self) {
        for subscription in self.subscriptions() {
            subscription.notify_disconnected();
        }
    }

    pub(crate) fn notify_failed(&self, error: Error) {
        let error = Arc::new(error);
        for subscription in self.subscriptions() {
            subscription.notify_failed(Arc::clone(&error));
        }
    }

    /// Snapshot of the subscriptions with `identifier`, so callbacks run without
    /// holding any registry lock.
    fn matching(&self, identifier: &str) -> Vec<Arc<Subscription>> {
        let mut subscriptions: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| entry.value().identifier() == identifier)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        subscriptions.sort_by_key(|subscription| subscription.key);
        subscriptions
    }

    fn release(&self, identifier: &str, unsubscribe: bool) {
        if let Entry::Occupied(mut entry) = self.refcounts.entry(identifier.to_owned()) {
            let count = entry.get_mut();
            *count = count.saturating_sub(1);
            if *count == 0 {
                if unsubscribe {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(%identifier, "Unsubscribing from channel");

                    // Sent while holding the entry to keep a concurrent create from racing.
                    transmit(
                        self.transmitter.as_ref(),
                        &Command::unsubscribe(identifier),
                    );
                }
                entry.remove();
            }
        }
    }

    fn send_subscribe(&self, subscription: &Subscription) -> bool {
        transmit(
            self.transmitter.as_ref(),
            &Command::subscribe(subscription.identifier()),
        )
    }
}

fn transmit(transmitter: &dyn Transmit, command: &Command) -> bool {
    match command.to_json() {
        Ok(text) => transmitter.transmit(text),
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "Failed to encode command");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use futures::StreamExt as _;
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct RecordingTransmitter {
        open: AtomicBool,
        sent: Mutex<Vec<Value>>,
    }

    impl RecordingTransmitter {
        fn opened() -> Arc<Self> {
            let transmitter = Self::default();
            transmitter.open.store(true, Ordering::SeqCst);
            Arc::new(transmitter)
        }

        fn take(&self) -> Vec<Value> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl Transmit for RecordingTransmitter {
        fn transmit(&self, text: String) -> bool {
            if !self.open.load(Ordering::SeqCst) {
                return false;
            }
            self.sent
                .lock()
                .unwrap()
                .push(serde_json::from_str(&text).unwrap());
            true
        }
    }

    fn chat(room: i64) -> Channel {
        Channel::new("ChatChannel").with_param("room_id", room).unwrap()
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hook = {
            let count = Arc::clone(&count);
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        };
        (count, hook)
    }

    #[test]
    fn create_sends_subscribe_when_open() {
        let transmitter = RecordingTransmitter::opened();
        let subscriptions = Subscriptions::new(transmitter.clone());

        let subscription = subscriptions.create(chat(1));

        assert!(subscriptions.contains(&subscription));
        assert_eq!(
            transmitter.take(),
            vec![json!({"command": "subscribe", "identifier": subscription.identifier()})]
        );
    }

    #[test]
    fn create_while_closed_is_sent_on_reload() {
        let transmitter = Arc::new(RecordingTransmitter::default());
        let subscriptions = Subscriptions::new(transmitter.clone());

        let first = subscriptions.create(chat(1));
        let second = subscriptions.create(Channel::new("AppearanceChannel"));
        assert!(transmitter.take().is_empty());

        transmitter.open.store(true, Ordering::SeqCst);
        subscriptions.reload();

        assert_eq!(
            transmitter.take(),
            vec![
                json!({"command": "subscribe", "identifier": first.identifier()}),
                json!({"command": "subscribe", "identifier": second.identifier()}),
            ]
        );
    }

    #[test]
    fn reload_resubscribes_everything() {
        let transmitter = RecordingTransmitter::opened();
        let subscriptions = Subscriptions::new(transmitter.clone());
        subscriptions.create(chat(1));
        subscriptions.create(chat(1));
        subscriptions.create(chat(2));
        transmitter.take();

        subscriptions.reload();

        assert_eq!(transmitter.take().len(), 3);
    }

    #[test]
    fn shared_identifier_unsubscribes_once() {
        let transmitter = RecordingTransmitter::opened();
        let subscriptions = Subscriptions::new(transmitter.clone());
        let first = subscriptions.create(chat(1));
        let second = subscriptions.create(chat(1));
        transmitter.take();

        assert!(subscriptions.remove(&first));
        assert!(!subscriptions.contains(&first));
        assert!(subscriptions.contains(&second));
        assert!(transmitter.take().is_empty());

        assert!(subscriptions.remove(&second));
        assert_eq!(
            transmitter.take(),
            vec![json!({"command": "unsubscribe", "identifier": second.identifier()})]
        );

        assert!(!subscriptions.remove(&second));
        assert!(transmitter.take().is_empty());
        assert!(subscriptions.is_empty());
    }

    #[test]
    fn remove_ignores_subscription_of_another_registry() {
        let transmitter = RecordingTransmitter::opened();
        let subscriptions = Subscriptions::new(transmitter.clone());
        let other = Subscriptions::new(transmitter.clone());
        let registered = subscriptions.create(chat(1));
        let foreign = other.create(chat(1));
        transmitter.take();

        assert!(!subscriptions.contains(&foreign));
        assert!(!subscriptions.remove(&foreign));
        assert!(subscriptions.contains(&registered));
        assert!(transmitter.take().is_empty());
    }

    #[test]
    fn received_fans_out_by_identifier() {
        let subscriptions = Subscriptions::new(RecordingTransmitter::opened());
        let received = Arc::new(Mutex::new(Vec::new()));

        for (name, room) in [("a", 1), ("b", 1), ("c", 2)] {
            let received = Arc::clone(&received);
            subscriptions.create(chat(room)).on_received(move |data| {
                received.lock().unwrap().push((name, data.clone()));
            });
        }

        subscriptions.notify_received(chat(1).identifier(), &json!({"body": "hi"}));

        assert_eq!(
            *received.lock().unwrap(),
            vec![("a", json!({"body": "hi"})), ("b", json!({"body": "hi"}))]
        );
    }

    #[test]
    fn connected_only_for_matching_identifier() {
        let subscriptions = Subscriptions::new(RecordingTransmitter::opened());
        let (first_count, first_hook) = counter();
        let (second_count, second_hook) = counter();
        subscriptions.create(chat(1)).on_connected(first_hook);
        subscriptions.create(chat(2)).on_connected(second_hook);

        subscriptions.notify_connected(chat(1).identifier());

        assert_eq!(first_count.load(Ordering::SeqCst), 1);
        assert_eq!(second_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reject_forgets_matching_without_unsubscribing() {
        let transmitter = RecordingTransmitter::opened();
        let subscriptions = Subscriptions::new(transmitter.clone());
        let (rejected_count, rejected_hook) = counter();
        let (other_count, other_hook) = counter();
        let rejected_hook = Arc::new(rejected_hook);

        let first = subscriptions.create(chat(1));
        let hook = Arc::clone(&rejected_hook);
        first.on_rejected(move || hook());
        let second = subscriptions.create(chat(1));
        let hook = Arc::clone(&rejected_hook);
        second.on_rejected(move || hook());
        let other = subscriptions.create(chat(2));
        other.on_rejected(other_hook);
        transmitter.take();

        subscriptions.reject(first.identifier());

        assert_eq!(rejected_count.load(Ordering::SeqCst), 2);
        assert_eq!(other_count.load(Ordering::SeqCst), 0);
        assert!(!subscriptions.contains(&first));
        assert!(!subscriptions.contains(&second));
        assert!(subscriptions.contains(&other));
        assert!(transmitter.take().is_empty());

        // Subscribing again starts a fresh count.
        let again = subscriptions.create(chat(1));
        transmitter.take();
        assert!(subscriptions.remove(&again));
        assert_eq!(transmitter.take().len(), 1);
    }

    #[test]
    fn disconnected_and_failed_reach_everyone() {
        let subscriptions = Subscriptions::new(RecordingTransmitter::opened());
        let (disconnected, disconnected_hook) = counter();
        let disconnected_hook = Arc::new(disconnected_hook);
        let failures = Arc::new(AtomicUsize::new(0));

        for room in [1, 1, 2] {
            let hook = Arc::clone(&disconnected_hook);
            let failures = Arc::clone(&failures);
            subscriptions
                .create(chat(room))
                .on_disconnected(move || hook())
                .on_failed(move |error| {
                    assert_eq!(error.kind(), crate::error::Kind::State);
                    failures.fetch_add(1, Ordering::SeqCst);
                });
        }

        subscriptions.notify_disconnected();
        subscriptions.notify_failed(Error::state("already open"));

        assert_eq!(disconnected.load(Ordering::SeqCst), 3);
        assert_eq!(failures.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn callbacks_may_remove_their_subscription() {
        let transmitter = RecordingTransmitter::opened();
        let subscriptions = Arc::new(Subscriptions::new(transmitter.clone()));
        let registry = Arc::downgrade(&subscriptions);

        let subscription = subscriptions.create(chat(1));
        let handle = Arc::downgrade(&subscription);
        subscription.on_received(move |_| {
            if let (Some(registry), Some(subscription)) = (registry.upgrade(), handle.upgrade()) {
                registry.remove(&subscription);
            }
        });
        transmitter.take();

        subscriptions.notify_received(subscription.identifier(), &Value::Null);

        assert!(subscriptions.is_empty());
        assert_eq!(
            transmitter.take(),
            vec![json!({"command": "unsubscribe", "identifier": subscription.identifier()})]
        );
    }

    #[test]
    fn perform_sends_double_encoded_message() {
        let transmitter = RecordingTransmitter::opened();
        let subscriptions = Subscriptions::new(transmitter.clone());
        let subscription = subscriptions.create(chat(1));
        transmitter.take();

        assert!(subscription.perform("appear"));
        let Value::Object(data) = json!({"body": "hello"}) else {
            unreachable!()
        };
        assert!(subscription.perform_with("speak", data));

        assert_eq!(
            transmitter.take(),
            vec![
                json!({
                    "command": "message",
                    "identifier": subscription.identifier(),
                    "data": r#"{"action":"appear"}"#,
                }),
                json!({
                    "command": "message",
                    "identifier": subscription.identifier(),
                    "data": r#"{"body":"hello","action":"speak"}"#,
                }),
            ]
        );
    }

    #[test]
    fn perform_overwrites_action_in_data() {
        let transmitter = RecordingTransmitter::opened();
        let subscriptions = Subscriptions::new(transmitter.clone());
        let subscription = subscriptions.create(chat(1));
        transmitter.take();
        let Value::Object(data) = json!({"action": "other", "body": "hello"}) else {
            unreachable!()
        };

        assert!(subscription.perform_with("speak", data));

        assert_eq!(
            transmitter.take(),
            vec![json!({
                "command": "message",
                "identifier": subscription.identifier(),
                "data": r#"{"action":"speak","body":"hello"}"#,
            })]
        );
    }

    #[test]
    fn perform_while_closed_returns_false() {
        let subscriptions = Subscriptions::new(Arc::new(RecordingTransmitter::default()));
        let subscription = subscriptions.create(chat(1));

        assert!(!subscription.perform("appear"));
    }

    #[tokio::test]
    async fn stream_ends_after_rejection() {
        let subscriptions = Subscriptions::new(RecordingTransmitter::opened());
        let (subscription, events) = subscriptions.create_stream(chat(1));
        let identifier = subscription.identifier().to_owned();

        subscriptions.notify_connected(&identifier);
        subscriptions.notify_received(&identifier, &json!(42));
        subscriptions.notify_disconnected();
        subscriptions.reject(&identifier);
        subscriptions.notify_received(&identifier, &json!(43));

        let events: Vec<_> = events.collect().await;

        assert!(matches!(
            events.as_slice(),
            [
                SubscriptionEvent::Connected,
                SubscriptionEvent::Received(value),
                SubscriptionEvent::Disconnected,
                SubscriptionEvent::Rejected,
            ] if *value == json!(42)
        ));
        assert!(!subscriptions.contains(&subscription));
    }
}
