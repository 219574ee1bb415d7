use std::collections::HashSet;

/// Server-assigned identity of a registered client.
pub type ClientId = String;

/// A named pub/sub channel and the clients currently subscribed to it.
///
/// Subscribing twice, or unsubscribing a client that is not subscribed, has no effect.
#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    subscribers: HashSet<ClientId>,
}

impl Topic {
    /// Creates a topic with no subscribers.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: HashSet::new(),
        }
    }

    /// Adds the client; returns `false` when it was already subscribed.
    pub fn subscribe(&mut self, id: ClientId) -> bool {
        self.subscribers.insert(id)
    }

    /// Removes the client; returns `false` when it was not subscribed.
    pub fn unsubscribe(&mut self, id: &str) -> bool {
        self.subscribers.remove(id)
    }

    pub fn is_subscribed(&self, id: &str) -> bool {
        self.subscribers.contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Copy of the subscriber set, taken so fan-out never holds the registry lock.
    pub fn snapshot(&self) -> Vec<ClientId> {
        self.subscribers.iter().cloned().collect()
    }
}
