//! Bridges publishing to local visibility.
//!
//! A publisher registers a [`Watch`] for an event id before broadcasting, and
//! the ingestion pipeline calls [`Visibility::notify`] once that id has been
//! materialized. Watches are single use and remove themselves when dropped.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::sync::oneshot;

type Waiters = HashMap<String, Vec<oneshot::Sender<()>>>;

#[derive(Clone, Default)]
pub struct Visibility {
    waiters: Arc<Mutex<Waiters>>,
}

impl Visibility {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Waiters> {
        // Waiter lists stay consistent even if a holder panicked.
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register interest in `id`.
    pub fn watch(&self, id: &str) -> Watch {
        let (tx, rx) = oneshot::channel();
        self.lock().entry(id.to_string()).or_default().push(tx);
        Watch {
            id: id.to_string(),
            rx,
            registry: self.clone(),
        }
    }

    /// Wake every watch registered for `id`.
    pub fn notify(&self, id: &str) {
        let Some(senders) = self.lock().remove(id) else {
            return;
        };
        for tx in senders {
            let _ = tx.send(());
        }
    }

    /// Number of ids with at least one outstanding watch.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }
}

/// Single-use handle returned by [`Visibility::watch`].
pub struct Watch {
    id: String,
    rx: oneshot::Receiver<()>,
    registry: Visibility,
}

impl Watch {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait up to `timeout` for the id to become visible.
    pub async fn wait(mut self, timeout: Duration) -> bool {
        matches!(tokio::time::timeout(timeout, &mut self.rx).await, Ok(Ok(())))
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.rx.close();
        let mut waiters = self.registry.lock();
        if let Some(senders) = waiters.get_mut(&self.id) {
            senders.retain(|tx| !tx.is_closed());
            if senders.is_empty() {
                waiters.remove(&self.id);
            }
        }
    }
}
