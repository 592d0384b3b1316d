//! Background initialization with an observable state.
//!
//! Slow handles (the database index, for one) load on a spawned task while the
//! run starts. Callers that need the handle either check [`LazyInit::state`]
//! or block on [`LazyInit::wait`] with a deadline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug)]
pub enum LoadState<T> {
    NotStarted,
    Loading,
    Ready(Arc<T>),
    Failed(String),
}

impl<T> Clone for LoadState<T> {
    fn clone(&self) -> Self {
        match self {
            Self::NotStarted => Self::NotStarted,
            Self::Loading => Self::Loading,
            Self::Ready(v) => Self::Ready(v.clone()),
            Self::Failed(e) => Self::Failed(e.clone()),
        }
    }
}

impl<T> LoadState<T> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready(_) | Self::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Loading => "loading",
            Self::Ready(_) => "ready",
            Self::Failed(_) => "failed",
        }
    }
}

pub struct LazyInit<T> {
    tx: Arc<watch::Sender<LoadState<T>>>,
}

impl<T> Clone for LazyInit<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Default for LazyInit<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> LazyInit<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LoadState::NotStarted);
        Self { tx: Arc::new(tx) }
    }

    /// Spawn `load` unless a load has already been started. Returns whether
    /// this call started it.
    pub fn start<F>(&self, load: F) -> bool
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let claimed = self.tx.send_if_modified(|state| {
            if matches!(state, LoadState::NotStarted) {
                *state = LoadState::Loading;
                true
            } else {
                false
            }
        });
        if !claimed {
            return false;
        }

        let tx = self.tx.clone();
        tokio::spawn(async move {
            let next = match load.await {
                Ok(value) => LoadState::Ready(Arc::new(value)),
                Err(e) => {
                    tracing::warn!(error = %format!("{:#}", e), "background initialization failed");
                    LoadState::Failed(format!("{:#}", e))
                }
            };
            tx.send_replace(next);
        });
        true
    }

    pub fn state(&self) -> LoadState<T> {
        self.tx.borrow().clone()
    }

    /// Wait up to `timeout` for a terminal state; returns whatever state is
    /// current when the wait ends.
    pub async fn wait(&self, timeout: Duration) -> LoadState<T> {
        if matches!(*self.tx.borrow(), LoadState::NotStarted) {
            return LoadState::NotStarted;
        }
        let mut rx = self.tx.subscribe();
        let _ = tokio::time::timeout(timeout, rx.wait_for(|s| s.is_terminal())).await;
        self.state()
    }
}
