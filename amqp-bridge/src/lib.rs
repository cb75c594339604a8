//! # amqp-bridge - AMQP 1.0 messaging for application code
//!
//! The bridge exposes AMQP 1.0 addresses as producers and consumers of a
//! generic JSON [`Envelope`]. Link credit is honoured in both directions:
//! producers buffer while the peer grants no credit, consumers never let the
//! peer hold more than their credit window. Request/reply is correlated over
//! a dynamic reply address owned by the bridge.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use amqp_bridge::{AmqpBridge, BridgeConfig, Envelope, MemoryTransport};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> amqp_bridge::Result<()> {
//!     let (transport, _peer) = MemoryTransport::new();
//!     let bridge = AmqpBridge::start(&transport, BridgeConfig::default()).await?;
//!
//!     let consumer = bridge.create_consumer("orders").await?;
//!     consumer.handler_fn(|msg| async move {
//!         if msg.reply_address().is_some() {
//!             let _ = msg.reply(Envelope::value(json!({"status": "ok"}))).await;
//!         }
//!     })?;
//!
//!     let producer = bridge.create_producer("orders").await?;
//!     let reply = producer.send_with_reply(Envelope::value(json!({"id": 42})))?;
//!     println!("waiting on {}", reply.message_id());
//!
//!     bridge.stop().await;
//!     Ok(())
//! }
//! ```

pub mod amqp;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod message;
pub mod producer;
pub mod reply;
pub mod transport;

pub use bridge::{AddressLinks, AmqpBridge, BridgeStats, BridgeStatus};
pub use config::{BridgeConfig, BridgeOptions, PfxOptions};
pub use consumer::{Consumer, ConsumerOptions, ConsumerState, FunctionHandler, MessageHandler};
pub use envelope::{BodyType, Envelope};
pub use error::{BridgeError, ErrorKind, Result};
pub use message::BridgeMessage;
pub use producer::Producer;
pub use reply::ReplyHandle;
pub use transport::{MemoryPeer, MemoryTransport, Transport};
