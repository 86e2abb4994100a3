//! Observer list used for every event the core publishes.
//!
//! Subscribers are independent and fire-and-forget: a callback cannot
//! veto or answer an event. `subscribe` hands back a token; dropping the
//! token does nothing, passing it to `unsubscribe` removes the callback.

/// Owners of a bus must stay `Send + Sync`.
type Callback<E> = Box<dyn FnMut(&E) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

pub struct EventBus<E> {
    subscribers: Vec<(Subscription, Callback<E>)>,
    next_token: u64,
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            next_token: 1,
        }
    }

    pub fn subscribe<F>(&mut self, callback: F) -> Subscription
    where
        F: FnMut(&E) + Send + Sync + 'static,
    {
        let token = Subscription(self.next_token);
        self.next_token += 1;
        self.subscribers.push((token, Box::new(callback)));
        token
    }

    /// Returns false if the token was unknown or already removed.
    pub fn unsubscribe(&mut self, token: Subscription) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(t, _)| *t != token);
        self.subscribers.len() != before
    }

    pub fn emit(&mut self, event: &E) {
        for (_, callback) in self.subscribers.iter_mut() {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
