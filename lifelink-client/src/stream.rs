//! Live, bounded, ascending view of the most recent messages.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};

use lifelink_core::{MESSAGE_WINDOW, Message, MessageId};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::DocumentStore;

pub struct MessageStream<S> {
    store: Arc<S>,
    limit: usize,
}

impl<S: DocumentStore> MessageStream<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            limit: MESSAGE_WINDOW,
        }
    }

    /// Start the live query. `on_update` receives the complete replacement
    /// window, oldest first, once per backend notification.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe<F>(&self, on_update: F) -> Subscription
    where
        F: FnMut(Vec<Message>) + Send + 'static,
    {
        let gate = Arc::new(Mutex::new(true));
        let task = tokio::spawn(run_live_query(
            self.store.clone(),
            self.limit,
            gate.clone(),
            on_update,
        ));
        Subscription {
            task: Some(task),
            gate,
        }
    }
}

/// Owned handle to a running live query.
#[derive(Debug)]
pub struct Subscription {
    task: Option<JoinHandle<()>>,
    gate: Arc<Mutex<bool>>,
}

impl Subscription {
    /// Stop the live query. Once this returns no further updates are
    /// delivered, including one that was already in flight.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn release(&mut self) {
        // Waits for a callback that is currently running to return.
        *self.gate.lock().unwrap_or_else(PoisonError::into_inner) = false;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.task.is_some() {
            warn!("message subscription dropped without unsubscribe; releasing");
            self.release();
        }
    }
}

async fn run_live_query<S, F>(store: Arc<S>, limit: usize, gate: Arc<Mutex<bool>>, mut on_update: F)
where
    S: DocumentStore,
    F: FnMut(Vec<Message>) + Send + 'static,
{
    let mut query = match store.live_query(limit).await {
        Ok(query) => query,
        Err(err) => {
            warn!("live query could not be started: {}", err);
            return;
        }
    };
    info!(limit, "live query started");

    while let Some(snapshot) = query.next_snapshot().await {
        let messages = normalize_snapshot(snapshot, limit);
        {
            let active = gate.lock().unwrap_or_else(PoisonError::into_inner);
            if !*active {
                break;
            }
            debug!(count = messages.len(), "delivering message window");
            on_update(messages);
        }
    }

    info!("live query ended");
}

/// Remembers which delivered messages were already shown, bounded by the
/// latest window.
#[derive(Debug, Default)]
pub struct SeenMessages {
    ids: HashSet<MessageId>,
}

impl SeenMessages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored messages in `window` not returned before. Ids that left the
    /// window are forgotten, since older messages never come back into it.
    pub fn fresh<'a>(&mut self, window: &'a [Message]) -> Vec<&'a Message> {
        let fresh = window
            .iter()
            .filter(|m| !m.is_pending())
            .filter(|m| self.ids.insert(m.id.clone()))
            .collect();
        self.ids.retain(|id| window.iter().any(|m| &m.id == id));
        fresh
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Turn a newest-first backend window into display order: ascending by
/// server timestamp, ties by backend sequence, pending writes last, and at
/// most `limit` entries (the newest ones).
pub fn normalize_snapshot(mut messages: Vec<Message>, limit: usize) -> Vec<Message> {
    messages.reverse();
    messages.sort_by_key(Message::display_key);
    if messages.len() > limit {
        let excess = messages.len() - limit;
        messages.drain(..excess);
    }
    messages
}
