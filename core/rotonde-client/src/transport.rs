//! Connection transport.
//!
//! A [`Connector`] opens a [`Channel`], a reliable message-oriented duplex
//! text channel. [`ConnectionTransport`] owns one channel through a driver
//! task: outbound packets are queued and written in order, inbound frames are
//! decoded and handed to the message callback one at a time.
//!
//! Sends made before the transport reaches [`ConnectionState::Connected`]
//! fail with [`ClientError::NotConnected`]; nothing is queued for later.

use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use rotonde_types::{Action, Definition, Event, Packet, Subscription};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// A duplex text channel carrying one packet per message.
#[async_trait]
pub trait Channel: Send {
    /// Writes one message.
    async fn send_text(&mut self, text: String) -> ClientResult<()>;

    /// Reads the next message. Returns `None` once the channel is closed.
    /// Must be cancel-safe.
    async fn next_text(&mut self) -> Option<ClientResult<String>>;

    /// Closes the channel.
    async fn close(&mut self) -> ClientResult<()>;
}

/// Opens channels to an endpoint address.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> ClientResult<Box<dyn Channel>>;
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport has been created.
    Idle,
    /// The channel is being opened.
    Connecting,
    /// The channel is open and the ready sequence has run.
    Connected,
    /// The channel could not be opened or failed while in use.
    Failed,
    /// The channel was closed by either side.
    Closed,
}

type ReadyCallback = Box<dyn FnOnce(&ConnectionTransport) + Send>;
type MessageCallback = Box<dyn Fn(&ConnectionTransport, Packet) + Send + Sync>;

struct TransportShared {
    url: String,
    state: Mutex<ConnectionState>,
    /// Published once the ready sequence has finished or the connection ended.
    settled: watch::Sender<ConnectionState>,
}

impl TransportShared {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn settle(&self, state: ConnectionState) {
        self.set_state(state);
        self.settled.send_replace(state);
    }
}

/// Handle to one connection. Dropping the last handle closes the channel.
#[derive(Clone)]
pub struct ConnectionTransport {
    shared: Arc<TransportShared>,
    outbound: mpsc::UnboundedSender<String>,
}

impl std::fmt::Debug for ConnectionTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTransport")
            .field("url", &self.shared.url)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionTransport {
    /// Starts connecting to `url` on a background task.
    ///
    /// `on_ready` runs once when the channel opens, before
    /// [`wait_connected`](Self::wait_connected) resolves. `on_message`
    /// receives every decoded inbound packet in delivery order; frames that
    /// fail to decode are logged and dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        connector: Arc<dyn Connector>,
        url: impl Into<String>,
        on_ready: impl FnOnce(&ConnectionTransport) + Send + 'static,
        on_message: impl Fn(&ConnectionTransport, Packet) + Send + Sync + 'static,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (settled, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(TransportShared {
            url: url.into(),
            state: Mutex::new(ConnectionState::Connecting),
            settled,
        });

        tokio::spawn(drive(
            connector,
            Arc::clone(&shared),
            outbound.downgrade(),
            outbound_rx,
            Box::new(on_ready),
            Box::new(on_message),
        ));

        Self { shared, outbound }
    }

    /// The endpoint address this transport connects to.
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Waits until the ready sequence has run, or the connection failed.
    pub async fn wait_connected(&self) -> ClientResult<()> {
        let mut settled = self.shared.settled.subscribe();
        let state = *settled
            .wait_for(|state| *state != ConnectionState::Connecting)
            .await
            .map_err(|_| ClientError::ChannelClosed)?;
        match state {
            ConnectionState::Connected => Ok(()),
            other => Err(ClientError::Connection(format!(
                "connection to {} ended in state {other:?}",
                self.shared.url
            ))),
        }
    }

    /// Encodes and queues a packet.
    pub fn send(&self, packet: &Packet) -> ClientResult<()> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let text = packet.encode()?;
        self.outbound
            .send(text)
            .map_err(|_| ClientError::ChannelClosed)
    }

    pub fn send_event(&self, identifier: &str, data: Value) -> ClientResult<()> {
        self.send(&Packet::Event(Event::new(identifier, data)))
    }

    pub fn send_action(&self, identifier: &str, data: Value) -> ClientResult<()> {
        self.send(&Packet::Action(Action::new(identifier, data)))
    }

    pub fn send_definition(&self, definition: &Definition) -> ClientResult<()> {
        self.send(&Packet::Definition(definition.clone()))
    }

    pub fn send_undefinition(&self, definition: &Definition) -> ClientResult<()> {
        self.send(&Packet::UnDefinition(definition.clone()))
    }

    pub fn send_subscribe(&self, identifier: &str) -> ClientResult<()> {
        self.send(&Packet::Subscribe(Subscription::new(identifier)))
    }

    pub fn send_unsubscribe(&self, identifier: &str) -> ClientResult<()> {
        self.send(&Packet::Unsubscribe(Subscription::new(identifier)))
    }
}

/// Rebuilds a handle for callbacks; `None` once every handle was dropped.
fn handle(
    shared: &Arc<TransportShared>,
    outbound: &mpsc::WeakUnboundedSender<String>,
) -> Option<ConnectionTransport> {
    Some(ConnectionTransport {
        shared: Arc::clone(shared),
        outbound: outbound.upgrade()?,
    })
}

async fn drive(
    connector: Arc<dyn Connector>,
    shared: Arc<TransportShared>,
    outbound: mpsc::WeakUnboundedSender<String>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    on_ready: ReadyCallback,
    on_message: MessageCallback,
) {
    let mut channel = match connector.open(&shared.url).await {
        Ok(channel) => channel,
        Err(e) => {
            error!("Connection to {} failed: {e}", shared.url);
            shared.settle(ConnectionState::Failed);
            return;
        }
    };

    info!("Connected to {}", shared.url);
    shared.set_state(ConnectionState::Connected);
    match handle(&shared, &outbound) {
        Some(transport) => on_ready(&transport),
        None => {
            let _ = channel.close().await;
            shared.settle(ConnectionState::Closed);
            return;
        }
    }
    shared.settle(ConnectionState::Connected);

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => match outgoing {
                Some(text) => {
                    if let Err(e) = channel.send_text(text).await {
                        error!("Send to {} failed: {e}", shared.url);
                        shared.settle(ConnectionState::Failed);
                        break;
                    }
                }
                None => {
                    debug!("transport for {} dropped, closing channel", shared.url);
                    if let Err(e) = channel.close().await {
                        debug!("close failed: {e}");
                    }
                    shared.settle(ConnectionState::Closed);
                    break;
                }
            },
            incoming = channel.next_text() => match incoming {
                Some(Ok(text)) => match Packet::decode(&text) {
                    Ok(packet) => {
                        let Some(transport) = handle(&shared, &outbound) else {
                            shared.settle(ConnectionState::Closed);
                            break;
                        };
                        on_message(&transport, packet);
                    }
                    Err(e) => warn!("Dropping malformed packet: {e}"),
                },
                Some(Err(e)) => {
                    error!("Connection to {} failed: {e}", shared.url);
                    shared.settle(ConnectionState::Failed);
                    break;
                }
                None => {
                    warn!("Connection to {} closed", shared.url);
                    shared.settle(ConnectionState::Closed);
                    break;
                }
            },
        }
    }
}

/// In-memory channels for testing.
pub mod mock {
    use super::*;
    use std::collections::VecDeque;

    /// Hands out queued in-memory channels, one per `open`.
    #[derive(Debug, Default)]
    pub struct MockConnector {
        pending: Mutex<VecDeque<MockChannel>>,
    }

    impl MockConnector {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queues a channel for the next `open` and returns its remote end.
        pub fn add_peer(&self) -> MockPeer {
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(MockChannel {
                    inbound: inbound_rx,
                    outbound: outbound_tx,
                });
            MockPeer {
                inbound: Some(inbound_tx),
                outbound: outbound_rx,
            }
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn open(&self, url: &str) -> ClientResult<Box<dyn Channel>> {
            let channel = self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            match channel {
                Some(channel) => Ok(Box::new(channel)),
                None => Err(ClientError::Connection(format!("{url}: connection refused"))),
            }
        }
    }

    /// Client side of an in-memory channel.
    #[derive(Debug)]
    pub struct MockChannel {
        inbound: mpsc::UnboundedReceiver<String>,
        outbound: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl Channel for MockChannel {
        async fn send_text(&mut self, text: String) -> ClientResult<()> {
            self.outbound
                .send(text)
                .map_err(|_| ClientError::ChannelClosed)
        }

        async fn next_text(&mut self) -> Option<ClientResult<String>> {
            self.inbound.recv().await.map(Ok)
        }

        async fn close(&mut self) -> ClientResult<()> {
            self.inbound.close();
            Ok(())
        }
    }

    /// Remote side of an in-memory channel.
    #[derive(Debug)]
    pub struct MockPeer {
        inbound: Option<mpsc::UnboundedSender<String>>,
        outbound: mpsc::UnboundedReceiver<String>,
    }

    impl MockPeer {
        /// Delivers a packet to the client.
        pub fn deliver(&self, packet: &Packet) {
            if let Ok(text) = packet.encode() {
                self.deliver_text(text);
            }
        }

        /// Delivers a raw frame to the client.
        pub fn deliver_text(&self, text: impl Into<String>) {
            if let Some(inbound) = &self.inbound {
                let _ = inbound.send(text.into());
            }
        }

        /// Waits for the next packet written by the client. Returns `None`
        /// once the client side is gone.
        pub async fn next_sent(&mut self) -> Option<Packet> {
            let text = self.outbound.recv().await?;
            Packet::decode(&text).ok()
        }

        /// Returns the next packet already written by the client, if any.
        pub fn try_next_sent(&mut self) -> Option<Packet> {
            let text = self.outbound.try_recv().ok()?;
            Packet::decode(&text).ok()
        }

        /// Closes the channel from the remote side.
        pub fn close(&mut self) {
            self.inbound = None;
        }
    }
}
