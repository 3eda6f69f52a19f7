//! Tunnel state cell shared between a supervisor, its reader task and
//! blocked callers.
//!
//! Each supervisor owns one [`StateNotifier`]. Transitions are published on a
//! `tokio::sync::watch` channel so waiters wake on every change, and are
//! dispatched to an optional [`TunnelObserver`].

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

/// Lifecycle state of one tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Error,
    Disconnected,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Receives tunnel lifecycle transitions. Exactly one hook fires per change.
///
/// Hooks run while the notifier holds its transition lock; they must not
/// trigger another transition on the same notifier.
pub trait TunnelObserver: Send + Sync {
    /// Not every protocol passes through `Connecting`.
    fn on_connecting(&self) {}

    fn on_connected(&self);

    fn on_disconnected(&self);

    fn on_error(&self, message: Option<&str>);
}

#[derive(Clone)]
pub struct StateNotifier {
    inner: Arc<Inner>,
}

struct Inner {
    state: watch::Sender<TunnelState>,
    last_error: Mutex<Option<String>>,
    observer: Mutex<Option<Arc<dyn TunnelObserver>>>,
    transition_lock: Mutex<()>,
}

impl fmt::Debug for StateNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateNotifier")
            .field("state", &self.state())
            .field("last_error", &self.last_error())
            .finish_non_exhaustive()
    }
}

impl Default for StateNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl StateNotifier {
    pub fn new() -> Self {
        let (state, _) = watch::channel(TunnelState::Idle);
        Self {
            inner: Arc::new(Inner {
                state,
                last_error: Mutex::new(None),
                observer: Mutex::new(None),
                transition_lock: Mutex::new(()),
            }),
        }
    }

    pub fn set_observer(&self, observer: Arc<dyn TunnelObserver>) {
        *self
            .inner
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    pub fn state(&self) -> TunnelState {
        *self.inner.state.borrow()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_error(&self, message: Option<String>) {
        *self
            .inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = message;
    }

    /// Record `message` and move to [`TunnelState::Error`].
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.set_error(Some(message.into()));
        self.transition(TunnelState::Error)
    }

    /// Move to `new`. Returns false, and notifies nobody, if already there.
    pub fn transition(&self, new: TunnelState) -> bool {
        let _guard = self
            .inner
            .transition_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let changed = self.inner.state.send_if_modified(|state| {
            if *state == new {
                false
            } else {
                *state = new;
                true
            }
        });
        if !changed {
            return false;
        }

        if new != TunnelState::Error {
            self.set_error(None);
        }
        self.dispatch(new);
        true
    }

    fn dispatch(&self, state: TunnelState) {
        let observer = self
            .inner
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match state {
            TunnelState::Idle => {}
            TunnelState::Connecting => {
                info!("Tunnel connecting");
                if let Some(o) = &observer {
                    o.on_connecting();
                }
            }
            TunnelState::Connected => {
                info!("Tunnel connected");
                if let Some(o) = &observer {
                    o.on_connected();
                }
            }
            TunnelState::Disconnected => {
                info!("Tunnel disconnected");
                if let Some(o) = &observer {
                    o.on_disconnected();
                }
            }
            TunnelState::Error => {
                let message = self.last_error();
                info!(error = ?message, "Tunnel error");
                if let Some(o) = &observer {
                    o.on_error(message.as_deref());
                }
            }
        }
    }

    /// Receiver that observes every subsequent transition.
    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.inner.state.subscribe()
    }

    /// Wait until `predicate` holds for the current state, for at most
    /// `timeout`. Returns the matching state, or `None` on timeout.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(TunnelState) -> bool,
        timeout: Duration,
    ) -> Option<TunnelState> {
        let mut rx = self.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|state| predicate(*state)).await.map(|s| *s)
        })
        .await;
        match waited {
            Ok(Ok(state)) => Some(state),
            Ok(Err(_)) | Err(_) => None,
        }
    }
}
