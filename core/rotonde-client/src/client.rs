//! The Rotonde client.
//!
//! [`RotondeClient`] owns at most one [`ConnectionTransport`], the local and
//! remote definition registries, and four handler managers. Inbound packets
//! are routed as follows:
//!
//! | packet  | effect |
//! |---------|--------|
//! | `event` | dispatched to the event handlers |
//! | `action`| dispatched to the action handlers |
//! | `def`   | merged into the remote registry, dispatched to the definition handlers, and re-subscribed if event handlers already wait for it |
//! | `undef` | removed from the remote registry, dispatched to the undefinition handlers |
//!
//! Every time a transport connects, the client runs its ready callbacks,
//! subscribes to every identifier that has event handlers and publishes its
//! local definitions. The client never reconnects on its own; call
//! [`RotondeClient::connect`] again after a failure.

use crate::error::{ClientError, ClientResult};
use crate::handlers::HandlerManager;
use crate::registry::CategoryRegistries;
use crate::transport::{ConnectionState, ConnectionTransport, Connector};
use crate::ws::WsConnector;
use futures::future::{self, BoxFuture, FutureExt};
use rotonde_types::{Action, Category, Definition, Event, Field, Packet, WILDCARD};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Default endpoint of a local Rotonde bus.
pub const DEFAULT_URL: &str = "ws://localhost:4224/";

/// Configuration for the client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Endpoint address of the bus.
    pub url: String,
    /// Timeout for bootstrap waits without an explicit timeout (ms).
    pub timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            timeout_ms: 5_000,
        }
    }
}

impl ClientConfig {
    /// Default configuration for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// What a bootstrap sends and waits for.
#[derive(Debug, Clone, Default)]
pub struct BootstrapRequest {
    actions: Vec<Action>,
    events: Vec<String>,
    definitions: Vec<String>,
    timeout: Option<Duration>,
}

impl BootstrapRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `data` as action `identifier` once its definition is known.
    pub fn action(mut self, identifier: impl Into<String>, data: Value) -> Self {
        self.actions.push(Action::new(identifier, data));
        self
    }

    /// Waits for one `identifier` event after the actions are sent.
    pub fn expect_event(mut self, identifier: impl Into<String>) -> Self {
        self.events.push(identifier.into());
        self
    }

    /// Requires a remote definition for `identifier` before sending anything.
    pub fn require_definition(mut self, identifier: impl Into<String>) -> Self {
        self.definitions.push(identifier.into());
        self
    }

    /// Timeout applied to every wait. Defaults to [`ClientConfig::timeout`].
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.actions
            .iter()
            .map(|action| action.identifier.as_str())
            .chain(self.events.iter().map(String::as_str))
            .chain(self.definitions.iter().map(String::as_str))
    }
}

type ReadyCallback = Arc<dyn Fn() + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The transport currently owned by the client, shared with the event
/// handler hooks.
#[derive(Clone, Default)]
struct ConnectionSlot(Arc<Mutex<Option<ConnectionTransport>>>);

impl ConnectionSlot {
    fn current(&self) -> Option<ConnectionTransport> {
        lock(&self.0).clone()
    }

    fn connected(&self) -> Option<ConnectionTransport> {
        self.current().filter(ConnectionTransport::is_connected)
    }
}

struct ClientInner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    connection: ConnectionSlot,
    local_definitions: Mutex<CategoryRegistries>,
    remote_definitions: Mutex<CategoryRegistries>,
    event_handlers: Arc<HandlerManager<Event>>,
    action_handlers: Arc<HandlerManager<Action>>,
    definition_handlers: Arc<HandlerManager<Definition>>,
    undefinition_handlers: Arc<HandlerManager<Definition>>,
    ready_callbacks: Mutex<Vec<ReadyCallback>>,
}

/// Client for a Rotonde bus. Cloning yields another handle to the same
/// client.
#[derive(Clone)]
pub struct RotondeClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for RotondeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotondeClient")
            .field("url", &self.inner.config.url)
            .field("state", &self.connection_state())
            .finish()
    }
}

impl RotondeClient {
    /// Creates a WebSocket client for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(ClientConfig::new(url))
    }

    /// Creates a WebSocket client.
    pub fn with_config(config: ClientConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    /// Creates a client opening its channels through `connector`.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let connection = ConnectionSlot::default();

        let subscribe_slot = connection.clone();
        let unsubscribe_slot = connection.clone();
        let event_handlers = HandlerManager::with_hooks(
            move |identifier| {
                if let Some(transport) = subscribe_slot.connected() {
                    if let Err(e) = transport.send_subscribe(identifier) {
                        warn!("Failed to subscribe to {identifier}: {e}");
                    }
                }
            },
            move |identifier| {
                if let Some(transport) = unsubscribe_slot.connected() {
                    if let Err(e) = transport.send_unsubscribe(identifier) {
                        warn!("Failed to unsubscribe from {identifier}: {e}");
                    }
                }
            },
        );

        Self {
            inner: Arc::new(ClientInner {
                config,
                connector,
                connection,
                local_definitions: Mutex::new(CategoryRegistries::new()),
                remote_definitions: Mutex::new(CategoryRegistries::new()),
                event_handlers: Arc::new(event_handlers),
                action_handlers: Arc::new(HandlerManager::new()),
                definition_handlers: Arc::new(HandlerManager::new()),
                undefinition_handlers: Arc::new(HandlerManager::new()),
                ready_callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn url(&self) -> &str {
        &self.inner.config.url
    }

    // ── Connection ───────────────────────────────────────────────

    /// Opens a new transport, replacing (and closing) any previous one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let ready = Arc::downgrade(&self.inner);
        let routing = Arc::downgrade(&self.inner);

        let previous = {
            let mut slot = lock(&self.inner.connection.0);
            let transport = ConnectionTransport::open(
                Arc::clone(&self.inner.connector),
                self.inner.config.url.clone(),
                move |transport| {
                    if let Some(inner) = ready.upgrade() {
                        inner.on_connected(transport);
                    }
                },
                move |transport, packet| {
                    if let Some(inner) = routing.upgrade() {
                        inner.route(packet, Some(transport));
                    }
                },
            );
            slot.replace(transport)
        };
        drop(previous);
    }

    /// Drops the current transport, closing its channel.
    pub fn disconnect(&self) {
        let previous = lock(&self.inner.connection.0).take();
        drop(previous);
    }

    /// Waits until the current transport is connected.
    pub async fn wait_connected(&self) -> ClientResult<()> {
        let transport = self
            .inner
            .connection
            .current()
            .ok_or(ClientError::NotConnected)?;
        transport.wait_connected().await
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.connected().is_some()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner
            .connection
            .current()
            .map_or(ConnectionState::Idle, |transport| transport.state())
    }

    /// Runs `callback` now if connected; otherwise every time a transport
    /// connects.
    pub fn on_ready(&self, callback: impl Fn() + Send + Sync + 'static) {
        {
            let mut callbacks = lock(&self.inner.ready_callbacks);
            if !self.is_connected() {
                callbacks.push(Arc::new(callback));
                return;
            }
        }
        callback();
    }

    // ── Sending ──────────────────────────────────────────────────

    fn transport(&self) -> ClientResult<ConnectionTransport> {
        self.inner
            .connection
            .current()
            .ok_or(ClientError::NotConnected)
    }

    pub fn send_event(&self, identifier: &str, data: Value) -> ClientResult<()> {
        self.transport()?.send_event(identifier, data)
    }

    pub fn send_action(&self, identifier: &str, data: Value) -> ClientResult<()> {
        self.transport()?.send_action(identifier, data)
    }

    pub fn send_subscribe(&self, identifier: &str) -> ClientResult<()> {
        self.transport()?.send_subscribe(identifier)
    }

    pub fn send_unsubscribe(&self, identifier: &str) -> ClientResult<()> {
        self.transport()?.send_unsubscribe(identifier)
    }

    // ── Definitions ──────────────────────────────────────────────

    /// Stores a local definition (merging fields with an existing one) and
    /// publishes the stored record if connected.
    pub fn add_local_definition(
        &self,
        category: Category,
        identifier: impl Into<String>,
        fields: Vec<Field>,
        is_array: bool,
    ) -> ClientResult<()> {
        let definition = Definition::new(category, identifier)
            .with_fields(fields)
            .with_array(is_array);
        let stored = lock(&self.inner.local_definitions)
            .get_mut(category)
            .add(definition)
            .clone();
        match self.inner.connection.connected() {
            Some(transport) => transport.send_definition(&stored),
            None => Ok(()),
        }
    }

    /// Removes a local definition and retracts it if connected. Unknown
    /// identifiers are ignored.
    pub fn remove_local_definition(&self, category: Category, identifier: &str) -> ClientResult<()> {
        let Some(removed) = lock(&self.inner.local_definitions)
            .get_mut(category)
            .remove(identifier)
        else {
            debug!("no local {category} definition for {identifier}");
            return Ok(());
        };
        match self.inner.connection.connected() {
            Some(transport) => transport.send_undefinition(&removed),
            None => Ok(()),
        }
    }

    pub fn get_local_definition(&self, category: Category, identifier: &str) -> Option<Definition> {
        lock(&self.inner.local_definitions)
            .get(category)
            .get(identifier)
            .cloned()
    }

    pub fn get_remote_definition(&self, category: Category, identifier: &str) -> Option<Definition> {
        lock(&self.inner.remote_definitions)
            .get(category)
            .get(identifier)
            .cloned()
    }

    // ── Handlers ─────────────────────────────────────────────────

    /// Handlers for inbound events. The first handler of an identifier
    /// subscribes to it and the last one unsubscribes.
    pub fn event_handlers(&self) -> &Arc<HandlerManager<Event>> {
        &self.inner.event_handlers
    }

    pub fn action_handlers(&self) -> &Arc<HandlerManager<Action>> {
        &self.inner.action_handlers
    }

    pub fn definition_handlers(&self) -> &Arc<HandlerManager<Definition>> {
        &self.inner.definition_handlers
    }

    pub fn undefinition_handlers(&self) -> &Arc<HandlerManager<Definition>> {
        &self.inner.undefinition_handlers
    }

    /// Routes an inbound packet as if it had arrived on the channel.
    pub fn handle_packet(&self, packet: Packet) {
        let transport = self.inner.connection.current();
        self.inner.route(packet, transport.as_ref());
    }

    // ── Negotiation ──────────────────────────────────────────────

    /// Waits for a remote definition of every identifier.
    ///
    /// The waits are registered before this returns. Resolves with the
    /// definitions in request order; on timeout the error lists every
    /// identifier that did not arrive.
    pub fn require_definitions<I, S>(
        &self,
        identifiers: I,
        timeout: Duration,
    ) -> BoxFuture<'static, ClientResult<Vec<Definition>>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let waits: Vec<_> = identifiers
            .into_iter()
            .map(|identifier| {
                self.inner
                    .definition_handlers
                    .make_promise(identifier, Some(timeout))
            })
            .collect();
        join_waits(waits).boxed()
    }

    /// Ensures the remote schema is known, sends the request's actions and
    /// waits for its events.
    ///
    /// Identifiers of the request without a known remote definition (action
    /// or event) are awaited first; no action is sent before they all
    /// arrive. Then one wait per expected event is registered, the actions
    /// are sent, and the call resolves with the events in request order.
    ///
    /// Failure does not retract actions already sent; callers clean up
    /// speculative state themselves.
    pub async fn bootstrap(&self, request: BootstrapRequest) -> ClientResult<Vec<Event>> {
        let timeout = request.timeout.unwrap_or_else(|| self.inner.config.timeout());

        let missing = self.missing_definitions(&request);
        if !missing.is_empty() {
            debug!("bootstrap waiting for definitions: {}", missing.join(", "));
            self.require_definitions(missing, timeout).await?;
        }

        let waits: Vec<_> = request
            .events
            .iter()
            .map(|identifier| {
                self.inner
                    .event_handlers
                    .make_promise(identifier.clone(), Some(timeout))
            })
            .collect();

        for action in &request.actions {
            self.send_action(&action.identifier, action.data.clone())?;
        }

        join_waits(waits).await
    }

    fn missing_definitions(&self, request: &BootstrapRequest) -> Vec<String> {
        let remote = lock(&self.inner.remote_definitions);
        let mut seen = HashSet::new();
        request
            .identifiers()
            .filter(|identifier| seen.insert(*identifier))
            .filter(|identifier| !remote.knows(identifier))
            .map(String::from)
            .collect()
    }
}

impl ClientInner {
    fn on_connected(&self, transport: &ConnectionTransport) {
        let callbacks = lock(&self.ready_callbacks).clone();
        for callback in callbacks {
            callback();
        }

        for identifier in self.event_handlers.registered_identifiers() {
            if identifier == WILDCARD {
                continue;
            }
            if let Err(e) = transport.send_subscribe(&identifier) {
                warn!("Failed to subscribe to {identifier}: {e}");
            }
        }

        let definitions = lock(&self.local_definitions).all();
        for definition in &definitions {
            if let Err(e) = transport.send_definition(definition) {
                warn!("Failed to publish definition {}: {e}", definition.identifier);
            }
        }
    }

    fn route(&self, packet: Packet, transport: Option<&ConnectionTransport>) {
        match packet {
            Packet::Event(event) => {
                debug!("received event: {}", event.identifier);
                self.event_handlers.call_handlers(&event.identifier, &event);
            }
            Packet::Action(action) => {
                debug!("received action: {}", action.identifier);
                self.action_handlers.call_handlers(&action.identifier, &action);
            }
            Packet::Definition(definition) => {
                debug!(
                    "received definition: {} {}",
                    definition.identifier, definition.category
                );
                let category = definition.category;
                let stored = lock(&self.remote_definitions)
                    .get_mut(category)
                    .add(definition)
                    .clone();
                self.definition_handlers
                    .call_handlers(&stored.identifier, &stored);

                // Handlers attached before the schema arrived need a fresh subscription.
                if category == Category::Event && self.event_handlers.is_registered(&stored.identifier) {
                    match transport.filter(|transport| transport.is_connected()) {
                        Some(transport) => {
                            if let Err(e) = transport.send_subscribe(&stored.identifier) {
                                warn!("Failed to subscribe to {}: {e}", stored.identifier);
                            }
                        }
                        None => debug!("not connected, {} subscribes on connect", stored.identifier),
                    }
                }
            }
            Packet::UnDefinition(definition) => {
                debug!(
                    "received undefinition: {} {}",
                    definition.identifier, definition.category
                );
                lock(&self.remote_definitions)
                    .get_mut(definition.category)
                    .remove(&definition.identifier);
                self.undefinition_handlers
                    .call_handlers(&definition.identifier, &definition);
            }
            Packet::Subscribe(subscription) | Packet::Unsubscribe(subscription) => {
                debug!("ignoring subscription request for {}", subscription.identifier);
            }
        }
    }
}

/// Joins waits, merging every timeout into one error.
async fn join_waits<T>(waits: Vec<BoxFuture<'static, ClientResult<T>>>) -> ClientResult<Vec<T>> {
    let mut values = Vec::with_capacity(waits.len());
    let mut timed_out = Vec::new();
    for result in future::join_all(waits).await {
        match result {
            Ok(value) => values.push(value),
            Err(ClientError::Timeout { identifiers }) => timed_out.extend(identifiers),
            Err(e) => return Err(e),
        }
    }
    if !timed_out.is_empty() {
        return Err(ClientError::Timeout {
            identifiers: timed_out,
        });
    }
    Ok(values)
}
