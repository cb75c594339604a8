//! In-process transport used by tests and demos.
//!
//! [`MemoryTransport`] plays the bridge side of the connection while a
//! [`MemoryPeer`] plays the remote container: it grants credit to sender
//! links, records what they transfer, and pushes deliveries into receiver
//! links while honouring the credit the bridge issued.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{
    DeliveryTag, Delivery, Disposition, EventSender, LinkEvent, LinkId, ReceiverLink, SenderLink, Source, Transport,
    TransportConnection,
};
use crate::amqp::AmqpMessage;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};

#[derive(Debug)]
struct SenderState {
    address: String,
    credit: u32,
    closed: bool,
}

#[derive(Debug)]
struct ReceiverState {
    address: String,
    credit: u32,
    closed: bool,
    dispositions: Vec<(DeliveryTag, Disposition)>,
}

#[derive(Debug, Default)]
struct Broker {
    refuse: Option<String>,
    events: Option<EventSender>,
    connected: bool,
    connects: usize,
    senders: BTreeMap<LinkId, SenderState>,
    receivers: BTreeMap<LinkId, ReceiverState>,
    transfers: Vec<(String, AmqpMessage)>,
    credit_violations: usize,
    next_tag: u64,
    next_dynamic: u64,
}

impl Broker {
    fn emit(&self, event: LinkEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                debug!("bridge event loop gone, dropping transport event");
            }
        }
    }
}

/// Transport whose remote end is a [`MemoryPeer`]
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    broker: Arc<Mutex<Broker>>,
}

impl MemoryTransport {
    /// Create a transport together with the peer that drives it
    pub fn new() -> (Self, MemoryPeer) {
        let transport = Self::default();
        let peer = MemoryPeer {
            broker: transport.broker.clone(),
        };
        (transport, peer)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, config: &BridgeConfig, events: EventSender) -> Result<Arc<dyn TransportConnection>> {
        let mut broker = self.broker.lock();
        if let Some(reason) = &broker.refuse {
            return Err(BridgeError::connection_failed(reason));
        }
        broker.events = Some(events);
        broker.connected = true;
        broker.connects += 1;
        debug!(host = %config.host, port = config.port, "memory transport connected");

        Ok(Arc::new(MemoryConnection {
            broker: self.broker.clone(),
        }))
    }
}

struct MemoryConnection {
    broker: Arc<Mutex<Broker>>,
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn open_sender(&self, link: LinkId, address: &str) -> Result<Arc<dyn SenderLink>> {
        let mut broker = self.broker.lock();
        if !broker.connected {
            return Err(BridgeError::connection_failed("connection closed"));
        }
        broker.senders.insert(
            link,
            SenderState {
                address: address.to_string(),
                credit: 0,
                closed: false,
            },
        );

        Ok(Arc::new(MemorySender {
            id: link,
            address: address.to_string(),
            broker: self.broker.clone(),
        }))
    }

    async fn open_receiver(&self, link: LinkId, source: Source) -> Result<Arc<dyn ReceiverLink>> {
        let mut broker = self.broker.lock();
        if !broker.connected {
            return Err(BridgeError::connection_failed("connection closed"));
        }
        let address = match source {
            Source::Address(address) => address,
            Source::Dynamic => {
                broker.next_dynamic += 1;
                format!("dynamic-{}", broker.next_dynamic)
            }
        };
        broker.receivers.insert(
            link,
            ReceiverState {
                address: address.clone(),
                credit: 0,
                closed: false,
                dispositions: Vec::new(),
            },
        );

        Ok(Arc::new(MemoryReceiver {
            id: link,
            address,
            broker: self.broker.clone(),
        }))
    }

    async fn close(&self) {
        let mut broker = self.broker.lock();
        broker.connected = false;
        broker.events = None;
        for sender in broker.senders.values_mut() {
            sender.closed = true;
        }
        for receiver in broker.receivers.values_mut() {
            receiver.closed = true;
            receiver.credit = 0;
        }
    }
}

struct MemorySender {
    id: LinkId,
    address: String,
    broker: Arc<Mutex<Broker>>,
}

impl SenderLink for MemorySender {
    fn address(&self) -> &str {
        &self.address
    }

    fn transfer(&self, message: AmqpMessage) -> Result<()> {
        let mut broker = self.broker.lock();
        let broker = &mut *broker;
        let state = broker
            .senders
            .get_mut(&self.id)
            .filter(|state| !state.closed)
            .ok_or_else(|| BridgeError::link_closed(&self.address))?;

        if state.credit == 0 {
            broker.credit_violations += 1;
            warn!(address = %self.address, "transfer attempted without credit");
            return Err(BridgeError::connection_failed("transfer without link credit"));
        }
        state.credit -= 1;
        broker.transfers.push((self.address.clone(), message));
        Ok(())
    }

    fn close(&self) {
        if let Some(state) = self.broker.lock().senders.get_mut(&self.id) {
            state.closed = true;
        }
    }
}

struct MemoryReceiver {
    id: LinkId,
    address: String,
    broker: Arc<Mutex<Broker>>,
}

impl ReceiverLink for MemoryReceiver {
    fn address(&self) -> &str {
        &self.address
    }

    fn flow(&self, credit: u32) {
        if let Some(state) = self.broker.lock().receivers.get_mut(&self.id) {
            if !state.closed {
                state.credit = state.credit.saturating_add(credit);
            }
        }
    }

    fn withdraw_credit(&self) {
        if let Some(state) = self.broker.lock().receivers.get_mut(&self.id) {
            state.credit = 0;
        }
    }

    fn settle(&self, tag: DeliveryTag, disposition: Disposition) {
        if let Some(state) = self.broker.lock().receivers.get_mut(&self.id) {
            state.dispositions.push((tag, disposition));
        }
    }

    fn close(&self) {
        if let Some(state) = self.broker.lock().receivers.get_mut(&self.id) {
            state.closed = true;
            state.credit = 0;
        }
    }
}

/// Remote end of a [`MemoryTransport`]
#[derive(Debug, Clone)]
pub struct MemoryPeer {
    broker: Arc<Mutex<Broker>>,
}

impl MemoryPeer {
    /// Make subsequent connects fail with `reason`
    pub fn refuse_connections(&self, reason: impl Into<String>) {
        self.broker.lock().refuse = Some(reason.into());
    }

    pub fn is_connected(&self) -> bool {
        self.broker.lock().connected
    }

    pub fn connection_count(&self) -> usize {
        self.broker.lock().connects
    }

    /// Grant credit to every open sender link on `address`; returns how many links were credited
    pub fn grant_credit(&self, address: &str, credit: u32) -> usize {
        let mut broker = self.broker.lock();
        let links: Vec<LinkId> = broker
            .senders
            .iter_mut()
            .filter(|(_, state)| state.address == address && !state.closed)
            .map(|(id, state)| {
                state.credit = state.credit.saturating_add(credit);
                *id
            })
            .collect();
        for link in &links {
            broker.emit(LinkEvent::CreditGranted { link: *link, credit });
        }
        links.len()
    }

    /// Credit currently held by the peer's side of sender links on `address`
    pub fn sender_credit(&self, address: &str) -> u32 {
        self.broker
            .lock()
            .senders
            .values()
            .filter(|state| state.address == address && !state.closed)
            .map(|state| state.credit)
            .sum()
    }

    /// Messages transferred to `address`, in transfer order
    pub fn sent(&self, address: &str) -> Vec<AmqpMessage> {
        self.broker
            .lock()
            .transfers
            .iter()
            .filter(|(to, _)| to == address)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Number of transfers attempted without credit
    pub fn credit_violations(&self) -> usize {
        self.broker.lock().credit_violations
    }

    /// Credit the bridge has issued on receiver links attached to `address`
    pub fn receiver_credit(&self, address: &str) -> u32 {
        self.broker
            .lock()
            .receivers
            .values()
            .filter(|state| state.address == address && !state.closed)
            .map(|state| state.credit)
            .sum()
    }

    /// Deliver to the first receiver on `address` holding credit.
    /// Returns `None` when no receiver may accept a transfer.
    pub fn deliver(&self, address: &str, message: AmqpMessage) -> Option<DeliveryTag> {
        let mut broker = self.broker.lock();
        let link = broker
            .receivers
            .iter_mut()
            .find(|(_, state)| state.address == address && !state.closed && state.credit > 0)
            .map(|(id, state)| {
                state.credit -= 1;
                *id
            })?;
        Some(Self::push_delivery(&mut broker, link, message))
    }

    /// Deliver to the first open receiver on `address` whatever its credit,
    /// as a peer whose transfer crossed a credit withdrawal would
    pub fn deliver_unsolicited(&self, address: &str, message: AmqpMessage) -> Option<DeliveryTag> {
        let mut broker = self.broker.lock();
        let link = broker
            .receivers
            .iter_mut()
            .find(|(_, state)| state.address == address && !state.closed)
            .map(|(id, state)| {
                state.credit = state.credit.saturating_sub(1);
                *id
            })?;
        Some(Self::push_delivery(&mut broker, link, message))
    }

    fn push_delivery(broker: &mut Broker, link: LinkId, message: AmqpMessage) -> DeliveryTag {
        broker.next_tag += 1;
        let tag = DeliveryTag(broker.next_tag);
        broker.emit(LinkEvent::Delivered {
            link,
            delivery: Delivery { tag, message },
        });
        tag
    }

    /// Settlements the bridge made for deliveries on `address`
    pub fn dispositions(&self, address: &str) -> Vec<(DeliveryTag, Disposition)> {
        self.broker
            .lock()
            .receivers
            .values()
            .filter(|state| state.address == address)
            .flat_map(|state| state.dispositions.iter().copied())
            .collect()
    }

    /// Open (sender and receiver) links attached to `address`
    pub fn open_links(&self, address: &str) -> usize {
        let broker = self.broker.lock();
        let senders = broker
            .senders
            .values()
            .filter(|state| state.address == address && !state.closed)
            .count();
        let receivers = broker
            .receivers
            .values()
            .filter(|state| state.address == address && !state.closed)
            .count();
        senders + receivers
    }

    /// Detach every link on `address` from the peer side
    pub fn close_links(&self, address: &str, error: Option<&str>) {
        let mut broker = self.broker.lock();
        let mut closed = Vec::new();
        for (id, state) in broker.senders.iter_mut() {
            if state.address == address && !state.closed {
                state.closed = true;
                closed.push(*id);
            }
        }
        for (id, state) in broker.receivers.iter_mut() {
            if state.address == address && !state.closed {
                state.closed = true;
                state.credit = 0;
                closed.push(*id);
            }
        }
        for link in closed {
            broker.emit(LinkEvent::LinkClosed {
                link,
                error: error.map(str::to_string),
            });
        }
    }

    /// Drop the connection from the peer side
    pub fn drop_connection(&self, error: Option<&str>) {
        let mut broker = self.broker.lock();
        broker.connected = false;
        for state in broker.senders.values_mut() {
            state.closed = true;
        }
        for state in broker.receivers.values_mut() {
            state.closed = true;
            state.credit = 0;
        }
        broker.emit(LinkEvent::ConnectionClosed {
            error: error.map(str::to_string),
        });
        broker.events = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::AmqpValue;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_sender_respects_credit() {
        let (transport, peer) = MemoryTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = transport.connect(&BridgeConfig::default(), tx).await.unwrap();
        let sender = connection.open_sender(LinkId(1), "queue").await.unwrap();

        assert!(sender.transfer(AmqpMessage::default()).is_err());
        assert_eq!(peer.credit_violations(), 1);

        assert_eq!(peer.grant_credit("queue", 1), 1);
        assert!(matches!(
            rx.recv().await,
            Some(LinkEvent::CreditGranted { link: LinkId(1), credit: 1 })
        ));
        sender.transfer(AmqpMessage::with_value(AmqpValue::Int(1))).unwrap();
        assert_eq!(peer.sent("queue").len(), 1);
        assert_eq!(peer.sender_credit("queue"), 0);
    }

    #[tokio::test]
    async fn test_receiver_credit_and_dynamic_address() {
        let (transport, peer) = MemoryTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = transport.connect(&BridgeConfig::default(), tx).await.unwrap();
        let receiver = connection.open_receiver(LinkId(2), Source::Dynamic).await.unwrap();
        let address = receiver.address().to_string();
        assert!(address.starts_with("dynamic-"));

        assert!(peer.deliver(&address, AmqpMessage::default()).is_none());
        receiver.flow(2);
        assert_eq!(peer.receiver_credit(&address), 2);

        let tag = peer.deliver(&address, AmqpMessage::default()).unwrap();
        assert!(matches!(rx.recv().await, Some(LinkEvent::Delivered { link: LinkId(2), .. })));
        receiver.settle(tag, Disposition::Accepted);
        assert_eq!(peer.dispositions(&address), vec![(tag, Disposition::Accepted)]);
        assert_eq!(peer.receiver_credit(&address), 1);
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let (transport, peer) = MemoryTransport::new();
        peer.refuse_connections("authentication failed");
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = transport.connect(&BridgeConfig::default(), tx).await.err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConnectionFailed);
    }
}
