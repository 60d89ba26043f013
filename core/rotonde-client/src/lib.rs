//! Client engine for the Rotonde message bus.
//!
//! Peers on a Rotonde bus exchange events and actions and publish the schema
//! (definitions) of each identifier before using it. This crate provides:
//!
//! - **Registry**: merges and indexes definitions per category
//! - **Handlers**: per-identifier callbacks with call-count expiry, wildcard
//!   fan-out and one-shot waits
//! - **Transport**: owns the channel, encodes and decodes packets
//! - **Client**: routes packets, replays subscriptions and definitions on
//!   connect, and negotiates schema with `bootstrap`
//!
//! # Example
//!
//! ```no_run
//! use rotonde_client::{handler, BootstrapRequest, RotondeClient};
//! use rotonde_types::Event;
//! use serde_json::json;
//!
//! # async fn run() -> rotonde_client::ClientResult<()> {
//! let client = RotondeClient::new("ws://localhost:4224/");
//!
//! client.event_handlers().attach(
//!     "MYO_POSE_EDGE",
//!     handler(|event: &Event| println!("{}", event.data)),
//! );
//! client.connect();
//! client.wait_connected().await?;
//!
//! let request = BootstrapRequest::new()
//!     .action("HAND_FINGERS", json!({"fingers": []}))
//!     .expect_event("HAND_STATUS");
//! client.bootstrap(request).await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
pub mod handlers;
pub mod registry;
pub mod transport;
pub mod ws;

pub use client::{BootstrapRequest, ClientConfig, RotondeClient, DEFAULT_URL};
pub use error::{ClientError, ClientResult};
pub use handlers::{handler, Handler, HandlerManager, LifecycleHook};
pub use registry::{CategoryRegistries, DefinitionRegistry};
pub use transport::{Channel, ConnectionState, ConnectionTransport, Connector};
pub use ws::{WsChannel, WsConnector};
