//! Per-identifier callback registry.
//!
//! A [`HandlerManager`] stores callbacks by identifier. Entries can expire
//! after a number of calls, handlers registered under [`WILDCARD`] receive
//! every dispatch, and optional lifecycle hooks fire when an identifier gains
//! its first handler or loses its last one (never for the wildcard).
//!
//! The handler map lock is released before callbacks or hooks run, so
//! callbacks may re-enter the manager. Hooks are serialized by a second lock
//! and run in the order of the transitions they report; they must not
//! re-enter the manager.

use crate::error::{ClientError, ClientResult};
use futures::future::{BoxFuture, FutureExt};
use rotonde_types::WILDCARD;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// A registered callback. Detaching compares the `Arc` pointer.
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Hook invoked with an identifier on first attach / last detach.
pub type LifecycleHook = Box<dyn Fn(&str) + Send + Sync>;

/// Wraps a closure as a [`Handler`].
pub fn handler<T, F>(f: F) -> Handler<T>
where
    F: Fn(&T) + Send + Sync + 'static,
{
    Arc::new(f)
}

struct HandlerEntry<T> {
    callback: Handler<T>,
    /// `None` never expires.
    remaining_calls: Option<usize>,
}

/// Stores handlers by identifier.
pub struct HandlerManager<T> {
    handlers: Mutex<HashMap<String, Vec<HandlerEntry<T>>>>,
    /// Held from a map change until its hook has run.
    hooks: Mutex<()>,
    on_first_attached: Option<LifecycleHook>,
    on_last_detached: Option<LifecycleHook>,
}

impl<T> fmt::Debug for HandlerManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerManager")
            .field("identifiers", &self.registered_identifiers())
            .finish()
    }
}

impl<T> Default for HandlerManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandlerManager<T> {
    /// Creates a manager without lifecycle hooks.
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            hooks: Mutex::new(()),
            on_first_attached: None,
            on_last_detached: None,
        }
    }

    /// Creates a manager that reports first-attached / last-detached
    /// transitions of non-wildcard identifiers.
    pub fn with_hooks(
        on_first_attached: impl Fn(&str) + Send + Sync + 'static,
        on_last_detached: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            hooks: Mutex::new(()),
            on_first_attached: Some(Box::new(on_first_attached)),
            on_last_detached: Some(Box::new(on_last_detached)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<HandlerEntry<T>>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_hooks(&self) -> MutexGuard<'_, ()> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches a handler that never expires.
    pub fn attach(&self, identifier: impl Into<String>, callback: Handler<T>) {
        self.insert(identifier.into(), callback, None);
    }

    /// Attaches a handler removed after its first call.
    pub fn attach_once(&self, identifier: impl Into<String>, callback: Handler<T>) {
        self.insert(identifier.into(), callback, Some(1));
    }

    /// Attaches a handler removed after `calls` calls. Zero registers nothing.
    pub fn attach_with_limit(
        &self,
        identifier: impl Into<String>,
        callback: Handler<T>,
        calls: usize,
    ) {
        if calls == 0 {
            return;
        }
        self.insert(identifier.into(), callback, Some(calls));
    }

    fn insert(&self, identifier: String, callback: Handler<T>, remaining_calls: Option<usize>) {
        let _hooks = self.lock_hooks();
        let first = {
            let mut handlers = self.lock();
            let entries = handlers.entry(identifier.clone()).or_default();
            entries.push(HandlerEntry {
                callback,
                remaining_calls,
            });
            entries.len() == 1
        };
        if first {
            self.first_attached(&identifier);
        }
    }

    /// Removes every entry of `identifier` whose callback is `callback`.
    pub fn detach(&self, identifier: &str, callback: &Handler<T>) {
        let _hooks = self.lock_hooks();
        let emptied = {
            let mut handlers = self.lock();
            let Some(entries) = handlers.get_mut(identifier) else {
                return;
            };
            let before = entries.len();
            entries.retain(|entry| !Arc::ptr_eq(&entry.callback, callback));
            let emptied = before != entries.len() && entries.is_empty();
            if emptied {
                handlers.remove(identifier);
            }
            emptied
        };
        if emptied {
            self.last_detached(identifier);
        }
    }

    /// Removes every entry, reporting each identifier that lost its handlers.
    pub fn detach_all(&self) {
        let _hooks = self.lock_hooks();
        let removed = std::mem::take(&mut *self.lock());
        for identifier in removed.keys() {
            self.last_detached(identifier);
        }
    }

    /// Dispatches `param` to the handlers of `identifier`, then to the
    /// wildcard handlers, each in attach order.
    ///
    /// An expiring entry is removed before its final call is made. Dispatch
    /// works on a snapshot: changes made by callbacks apply from the next
    /// dispatch on.
    pub fn call_handlers(&self, identifier: &str, param: &T) {
        let mut keys = vec![identifier];
        if identifier != WILDCARD {
            keys.push(WILDCARD);
        }

        let mut callbacks = Vec::new();
        {
            let _hooks = self.lock_hooks();
            let mut emptied = Vec::new();
            {
                let mut handlers = self.lock();
                for key in keys {
                    let Some(entries) = handlers.get_mut(key) else {
                        continue;
                    };
                    entries.retain_mut(|entry| {
                        callbacks.push(Arc::clone(&entry.callback));
                        match entry.remaining_calls.as_mut() {
                            None => true,
                            Some(remaining) => {
                                *remaining -= 1;
                                *remaining > 0
                            }
                        }
                    });
                    if entries.is_empty() {
                        debug!("detaching consumed handlers from {key}");
                        handlers.remove(key);
                        emptied.push(key);
                    }
                }
            }
            for key in emptied {
                self.last_detached(key);
            }
        }

        for callback in callbacks {
            callback(param);
        }
    }

    /// Snapshot of the identifiers holding at least one handler.
    pub fn registered_identifiers(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Number of handlers attached under `identifier`.
    pub fn handler_count(&self, identifier: &str) -> usize {
        self.lock().get(identifier).map_or(0, Vec::len)
    }

    pub fn is_registered(&self, identifier: &str) -> bool {
        self.handler_count(identifier) > 0
    }

    fn first_attached(&self, identifier: &str) {
        if identifier == WILDCARD {
            return;
        }
        if let Some(hook) = &self.on_first_attached {
            hook(identifier);
        }
    }

    fn last_detached(&self, identifier: &str) {
        if identifier == WILDCARD {
            return;
        }
        if let Some(hook) = &self.on_last_detached {
            hook(identifier);
        }
    }
}

impl<T> HandlerManager<T>
where
    T: Clone + Send + 'static,
{
    /// Waits for the next value dispatched to `identifier`.
    ///
    /// The one-shot handler is attached before this returns, so packets
    /// arriving after the call are observed even if the future is polled
    /// later. With a timeout the future fails with
    /// [`ClientError::Timeout`] once `timeout` has elapsed since this call,
    /// however late it is first polled. Whichever of the value and the timer is
    /// observed first wins. The handler is detached on every exit path,
    /// including when the future is dropped.
    pub fn make_promise(
        self: &Arc<Self>,
        identifier: impl Into<String>,
        timeout: Option<Duration>,
    ) -> BoxFuture<'static, ClientResult<T>> {
        let identifier = identifier.into();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let (reply_tx, reply_rx) = oneshot::channel();
        let reply_tx = Mutex::new(Some(reply_tx));
        let callback: Handler<T> = Arc::new(move |param: &T| {
            let sender = reply_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(sender) = sender {
                let _ = sender.send(param.clone());
            }
        });
        self.attach_once(identifier.clone(), Arc::clone(&callback));

        let guard = PendingHandler {
            manager: Arc::clone(self),
            identifier,
            callback,
        };

        async move {
            // The guard keeps the sender alive, so `ChannelClosed` is unreachable here.
            let outcome = match deadline {
                None => reply_rx.await.map_err(|_| ClientError::ChannelClosed),
                Some(deadline) => match tokio::time::timeout_at(deadline, reply_rx).await {
                    Ok(reply) => reply.map_err(|_| ClientError::ChannelClosed),
                    Err(_) => {
                        debug!("timed out waiting for {}", guard.identifier);
                        Err(ClientError::Timeout {
                            identifiers: vec![guard.identifier.clone()],
                        })
                    }
                },
            };
            drop(guard);
            outcome
        }
        .boxed()
    }
}

/// Detaches a promise's one-shot handler when dropped. After a successful
/// call the entry is already gone and the detach is a no-op.
struct PendingHandler<T> {
    manager: Arc<HandlerManager<T>>,
    identifier: String,
    callback: Handler<T>,
}

impl<T> Drop for PendingHandler<T> {
    fn drop(&mut self) {
        self.manager.detach(&self.identifier, &self.callback);
    }
}
