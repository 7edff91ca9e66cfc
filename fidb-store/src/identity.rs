//! Signed-in identity and the source that reports changes to it.
//!
//! The store never authenticates anyone; it only reacts to whatever the
//! [`IdentitySource`] reports. Every notification is delivered in order on an
//! unbounded channel, so rapid sign-out/sign-in sequences are never coalesced.

use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

/// A signed-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    id: String,
    token: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Stable unique id of the user.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bearer token for remote calls, if the provider issued one.
    pub fn bearer_token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

/// Stream of identity notifications; `None` means signed out.
pub type IdentityStream = mpsc::UnboundedReceiver<Option<Identity>>;

/// Supplies the current identity and notifies on change.
pub trait IdentitySource: Send + Sync {
    fn current(&self) -> Option<Identity>;

    /// Subscribe to changes. When `deliver_current` is set the current value
    /// is queued first. Dropping the stream unsubscribes.
    fn subscribe(&self, deliver_current: bool) -> IdentityStream;
}

struct WatcherState {
    current: Option<Identity>,
    subscribers: Vec<mpsc::UnboundedSender<Option<Identity>>>,
}

/// In-process [`IdentitySource`] driven by explicit sign-in/sign-out calls.
pub struct IdentityWatcher {
    state: Mutex<WatcherState>,
}

impl IdentityWatcher {
    pub fn new(initial: Option<Identity>) -> Self {
        Self {
            state: Mutex::new(WatcherState {
                current: initial,
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn signed_out() -> Self {
        Self::new(None)
    }

    pub fn signed_in(identity: Identity) -> Self {
        Self::new(Some(identity))
    }

    /// Replace the current identity and notify every live subscriber.
    pub fn set(&self, identity: Option<Identity>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.current = identity.clone();
        state
            .subscribers
            .retain(|tx| tx.send(identity.clone()).is_ok());
    }

    pub fn sign_in(&self, identity: Identity) {
        self.set(Some(identity));
    }

    pub fn sign_out(&self) {
        self.set(None);
    }

    /// Number of subscribers still listening.
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }
}

impl Default for IdentityWatcher {
    fn default() -> Self {
        Self::signed_out()
    }
}

impl IdentitySource for IdentityWatcher {
    fn current(&self) -> Option<Identity> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .clone()
    }

    fn subscribe(&self, deliver_current: bool) -> IdentityStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if deliver_current {
            let _ = tx.send(state.current.clone());
        }
        state.subscribers.push(tx);
        rx
    }
}
