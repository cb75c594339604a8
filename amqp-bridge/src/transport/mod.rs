//! Boundary to the AMQP 1.0 transport engine.
//!
//! The bridge never touches frames, sessions or SASL. It drives links through
//! these traits and learns about credit, deliveries and closures through
//! [`LinkEvent`]s pushed on the channel handed to [`Transport::connect`].
//! Link operations are non-blocking: an implementation queues the work for
//! its own I/O task.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::amqp::AmqpMessage;
use crate::config::BridgeConfig;
use crate::error::Result;

pub mod memory;

pub use memory::{MemoryPeer, MemoryTransport};

/// Bridge-assigned identifier of a link, used to route events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Transport-assigned delivery tag of an inbound transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub u64);

/// Where a receiver link attaches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A named node on the peer
    Address(String),
    /// A node the peer creates and names on attach
    Dynamic,
}

/// Outcome reported to the peer for an inbound delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Accepted,
    Rejected,
    Released,
}

/// An inbound transfer on a receiver link
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub message: AmqpMessage,
}

/// Events the transport reports to the bridge
#[derive(Debug)]
pub enum LinkEvent {
    /// The peer granted additional credit on a sender link
    CreditGranted { link: LinkId, credit: u32 },
    /// A message arrived on a receiver link
    Delivered { link: LinkId, delivery: Delivery },
    /// The link was detached by the peer or failed
    LinkClosed { link: LinkId, error: Option<String> },
    /// The whole connection went away
    ConnectionClosed { error: Option<String> },
}

/// Sink for transport events
pub type EventSender = mpsc::UnboundedSender<LinkEvent>;

/// Factory for connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and authenticate. Failures must map to `ConnectionFailed`.
    async fn connect(&self, config: &BridgeConfig, events: EventSender) -> Result<Arc<dyn TransportConnection>>;
}

/// One established AMQP connection
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// Attach a sending link to `address`
    async fn open_sender(&self, link: LinkId, address: &str) -> Result<Arc<dyn SenderLink>>;

    /// Attach a receiving link. No credit is issued until [`ReceiverLink::flow`].
    async fn open_receiver(&self, link: LinkId, source: Source) -> Result<Arc<dyn ReceiverLink>>;

    /// Close the connection; pending events may still be delivered
    async fn close(&self);
}

/// Sending half of a link
pub trait SenderLink: Send + Sync {
    fn address(&self) -> &str;

    /// Transfer one message, consuming one unit of credit
    fn transfer(&self, message: AmqpMessage) -> Result<()>;

    fn close(&self);
}

/// Receiving half of a link
pub trait ReceiverLink: Send + Sync {
    /// Attached address; server-assigned for dynamic sources
    fn address(&self) -> &str;

    /// Grant `credit` additional units to the sending peer
    fn flow(&self, credit: u32);

    /// Reduce the peer's credit to zero
    fn withdraw_credit(&self);

    fn settle(&self, tag: DeliveryTag, disposition: Disposition);

    fn close(&self);
}
