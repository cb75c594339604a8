use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::consumer::{Consumer, ConsumerEntry, ConsumerOptions};
use crate::error::{BridgeError, Result};
use crate::producer::{Producer, ProducerEntry};
use crate::reply::{ClosedReason, ReplyCorrelator};
use crate::transport::{LinkEvent, LinkId, Transport, TransportConnection};

pub(crate) type DrainCallback = Arc<dyn Fn() + Send + Sync>;
pub(crate) type ErrorCallback = Arc<dyn Fn(&BridgeError) + Send + Sync>;

/// Application callbacks collected under the bridge lock and run after it is released
pub(crate) enum Notification {
    Drain(DrainCallback),
    Error(ErrorCallback, BridgeError),
}

pub(crate) fn notify(notifications: Vec<Notification>) {
    for notification in notifications {
        match notification {
            Notification::Drain(callback) => callback(),
            Notification::Error(callback, err) => callback(&err),
        }
    }
}

/// Bridge operational status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeStatus {
    /// Connected and accepting new producers/consumers
    Running,
    /// The transport reported the connection lost
    Disconnected(String),
    /// `stop` was called
    Stopped,
}

/// Registry and flow state of one bridge, guarded by a single lock
pub(crate) struct BridgeState {
    pub(crate) status: BridgeStatus,
    pub(crate) producers: HashMap<LinkId, ProducerEntry>,
    pub(crate) consumers: HashMap<LinkId, ConsumerEntry>,
    pub(crate) addresses: HashMap<String, Vec<LinkId>>,
    pub(crate) replies: ReplyCorrelator,
    pub(crate) reply_consumer: Option<LinkId>,
    /// Cached reply links, least recently used first
    pub(crate) reply_producers: VecDeque<(String, LinkId)>,
    pub(crate) reply_link_limit: usize,
    /// Sender links between attach request and registration
    pub(crate) attaching: HashSet<LinkId>,
    /// Credit granted to sender links still attaching
    pub(crate) unattached_credit: HashMap<LinkId, u32>,
}

impl BridgeState {
    fn new(reply_link_limit: usize) -> Self {
        Self {
            status: BridgeStatus::Running,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            addresses: HashMap::new(),
            replies: ReplyCorrelator::new(),
            reply_consumer: None,
            reply_producers: VecDeque::new(),
            reply_link_limit,
            attaching: HashSet::new(),
            unattached_credit: HashMap::new(),
        }
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        match &self.status {
            BridgeStatus::Running => Ok(()),
            BridgeStatus::Disconnected(reason) => Err(BridgeError::connection_failed(reason)),
            BridgeStatus::Stopped => Err(BridgeError::BridgeStopped),
        }
    }

    pub(crate) fn register_address(&mut self, address: &str, link: LinkId) {
        self.addresses.entry(address.to_string()).or_default().push(link);
    }

    pub(crate) fn unregister_address(&mut self, address: &str, link: LinkId) {
        if let Some(links) = self.addresses.get_mut(address) {
            links.retain(|l| *l != link);
            if links.is_empty() {
                self.addresses.remove(address);
            }
        }
    }

    fn on_link_closed(&mut self, link: LinkId, error: Option<String>) -> Vec<Notification> {
        let mut notifications = Vec::new();
        if self.producers.contains_key(&link) {
            warn!(%link, error = ?error, "sender link closed by peer");
            notifications.extend(self.fail_producer(link, ClosedReason::LinkClosed));
        } else if self.consumers.contains_key(&link) {
            warn!(%link, error = ?error, "receiver link closed by peer");
            notifications.extend(self.close_consumer(link, ClosedReason::LinkClosed));
        } else {
            debug!(%link, "close event for unknown link");
        }
        notifications
    }

    fn on_connection_closed(&mut self, error: Option<String>) -> Vec<Notification> {
        let reason = error.unwrap_or_else(|| "connection closed by peer".to_string());
        warn!(reason = %reason, "AMQP connection lost");
        self.status = BridgeStatus::Disconnected(reason);
        self.fail_all(ClosedReason::LinkClosed)
    }

    /// Tear down every link, failing buffered sends and pending replies
    fn fail_all(&mut self, reason: ClosedReason) -> Vec<Notification> {
        let mut notifications = Vec::new();
        let producers: Vec<LinkId> = self.producers.keys().copied().collect();
        for link in producers {
            notifications.extend(self.fail_producer(link, reason));
        }
        let consumers: Vec<LinkId> = self.consumers.keys().copied().collect();
        for link in consumers {
            notifications.extend(self.close_consumer(link, reason));
        }
        self.replies.close(reason);
        self.unattached_credit.clear();
        self.reply_producers.clear();
        notifications
    }
}

/// Shared core behind [`AmqpBridge`], [`Producer`] and [`Consumer`] handles
pub(crate) struct BridgeInner {
    pub(crate) config: BridgeConfig,
    pub(crate) connection: Arc<dyn TransportConnection>,
    pub(crate) state: Mutex<BridgeState>,
    next_link: AtomicU64,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeInner {
    pub(crate) fn next_link_id(&self) -> LinkId {
        LinkId(self.next_link.fetch_add(1, Ordering::Relaxed))
    }

    fn handle_event(self: &Arc<Self>, event: LinkEvent) {
        let notifications = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.status == BridgeStatus::Stopped {
                debug!(event = ?event, "ignoring transport event after stop");
                return;
            }
            match event {
                LinkEvent::CreditGranted { link, credit } => state.on_credit(link, credit),
                LinkEvent::Delivered { link, delivery } => {
                    state.on_delivery(Arc::downgrade(self), link, delivery);
                    Vec::new()
                }
                LinkEvent::LinkClosed { link, error } => state.on_link_closed(link, error),
                LinkEvent::ConnectionClosed { error } => state.on_connection_closed(error),
            }
        };
        notify(notifications);
    }
}

async fn run_event_loop(bridge: Weak<BridgeInner>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(event) = events.recv().await {
        match bridge.upgrade() {
            Some(bridge) => bridge.handle_event(event),
            None => break,
        }
    }
    debug!("transport event loop finished");
}

/// Per-address link counts from the router registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressLinks {
    pub producers: usize,
    pub consumers: usize,
}

/// Bridge statistics for monitoring
#[derive(Debug, Clone)]
pub struct BridgeStats {
    pub status: BridgeStatus,
    pub producers: usize,
    pub consumers: usize,
    pub addresses: usize,
    pub pending_replies: usize,
    pub reply_address: Option<String>,
}

/// AMQP 1.0 bridge exposing producers, consumers and request/reply over one connection
///
/// The bridge:
/// - Owns the transport connection and a single event loop for its link events
/// - Registers producers and consumers by address
/// - Owns the dynamic reply consumer used for `send_with_reply`
#[derive(Clone)]
pub struct AmqpBridge {
    inner: Arc<BridgeInner>,
}

impl AmqpBridge {
    /// Connect through `transport` and bring up the reply consumer
    pub async fn start(transport: &dyn Transport, config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        info!("🚀 Starting AMQP bridge to {}:{}", config.host, config.port);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = transport
            .connect(&config, events_tx)
            .await
            .map_err(|e| match e {
                BridgeError::ConnectionFailed { .. } => e,
                other => BridgeError::connection_failed(other),
            })?;

        let reply_link_limit = config.options.reply_link_cache_size;
        let inner = Arc::new(BridgeInner {
            config,
            connection,
            state: Mutex::new(BridgeState::new(reply_link_limit)),
            next_link: AtomicU64::new(1),
            event_loop: Mutex::new(None),
        });

        let handle = tokio::spawn(run_event_loop(Arc::downgrade(&inner), events_rx));
        *inner.event_loop.lock() = Some(handle);

        let bridge = Self { inner };
        if bridge.inner.config.options.reply_handling_support {
            if let Err(e) = bridge.inner.start_reply_consumer().await {
                warn!("Failed to attach reply consumer: {}", e);
                bridge.stop().await;
                return Err(BridgeError::connection_failed(e));
            }
        }

        info!(
            "✅ AMQP bridge connected to {}:{}",
            bridge.inner.config.host, bridge.inner.config.port
        );
        Ok(bridge)
    }

    /// Create a producer sending to `address`
    pub async fn create_producer(&self, address: impl Into<String>) -> Result<Producer> {
        self.inner.create_producer(&address.into()).await
    }

    /// Create a consumer on `address` using the bridge's default credit window
    pub async fn create_consumer(&self, address: impl Into<String>) -> Result<Consumer> {
        let options = ConsumerOptions {
            max_buffered_messages: self.inner.config.options.default_max_buffered_messages,
        };
        self.create_consumer_with_options(address, options).await
    }

    /// Create a consumer on `address`
    pub async fn create_consumer_with_options(
        &self,
        address: impl Into<String>,
        options: ConsumerOptions,
    ) -> Result<Consumer> {
        self.inner.create_consumer(&address.into(), options).await
    }

    /// Stop the bridge: consumers are deactivated, buffered sends and pending
    /// replies fail with `BridgeStopped`, then the connection is closed.
    /// Calling it again does nothing.
    pub async fn stop(&self) {
        let notifications = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.status == BridgeStatus::Stopped {
                return;
            }
            info!("🛑 Stopping AMQP bridge");
            state.status = BridgeStatus::Stopped;
            state.fail_all(ClosedReason::Stopped)
        };
        notify(notifications);

        self.inner.connection.close().await;
        if let Some(handle) = self.inner.event_loop.lock().take() {
            handle.abort();
        }
        info!("AMQP bridge stopped");
    }

    /// Dynamic address used as `reply_to` for sends with a reply handler
    pub fn reply_address(&self) -> Option<String> {
        self.inner.state.lock().replies.reply_address().map(str::to_string)
    }

    pub fn status(&self) -> BridgeStatus {
        self.inner.state.lock().status.clone()
    }

    /// Check if bridge is connected and not stopped
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().status == BridgeStatus::Running
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Live producers and consumers registered for `address`
    pub fn address_links(&self, address: &str) -> AddressLinks {
        let state = self.inner.state.lock();
        let mut links = AddressLinks::default();
        for link in state.addresses.get(address).into_iter().flatten() {
            if state.producers.contains_key(link) {
                links.producers += 1;
            } else if state.consumers.contains_key(link) {
                links.consumers += 1;
            }
        }
        links
    }

    /// Get bridge statistics
    pub fn stats(&self) -> BridgeStats {
        let state = self.inner.state.lock();
        let internal = usize::from(state.reply_consumer.is_some_and(|link| state.consumers.contains_key(&link)));
        BridgeStats {
            status: state.status.clone(),
            producers: state.producers.values().filter(|entry| !entry.internal).count(),
            consumers: state.consumers.len() - internal,
            addresses: state.addresses.len(),
            pending_replies: state.replies.pending(),
            reply_address: state.replies.reply_address().map(str::to_string),
        }
    }
}

impl std::fmt::Debug for AmqpBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpBridge")
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::transport::{EventSender, MemoryTransport, ReceiverLink, SenderLink, Source};
    use async_trait::async_trait;

    /// Grants credit on every sender link, then refuses the attach
    struct RefusingSenders {
        events: Mutex<Option<EventSender>>,
    }

    #[async_trait]
    impl Transport for Arc<RefusingSenders> {
        async fn connect(&self, _config: &BridgeConfig, events: EventSender) -> Result<Arc<dyn TransportConnection>> {
            *self.events.lock() = Some(events);
            Ok(self.clone())
        }
    }

    #[async_trait]
    impl TransportConnection for RefusingSenders {
        async fn open_sender(&self, link: LinkId, address: &str) -> Result<Arc<dyn SenderLink>> {
            let events = self.events.lock().clone();
            if let Some(events) = events {
                events.send(LinkEvent::CreditGranted { link, credit: 5 }).unwrap();
            }
            tokio::task::yield_now().await;
            Err(BridgeError::link_closed(address))
        }

        async fn open_receiver(&self, _link: LinkId, _source: Source) -> Result<Arc<dyn ReceiverLink>> {
            Err(BridgeError::link_closed("receiver"))
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_start_creates_reply_consumer() {
        let (transport, peer) = MemoryTransport::new();
        let bridge = AmqpBridge::start(&transport, BridgeConfig::default()).await.unwrap();

        let reply_address = bridge.reply_address().unwrap();
        assert_eq!(peer.receiver_credit(&reply_address), 1000);
        assert_eq!(peer.connection_count(), 1);
        assert!(bridge.is_running());

        let stats = bridge.stats();
        assert_eq!(stats.consumers, 0);
        assert_eq!(stats.pending_replies, 0);
    }

    #[tokio::test]
    async fn test_start_without_reply_support() {
        let (transport, _peer) = MemoryTransport::new();
        let mut config = BridgeConfig::default();
        config.options.reply_handling_support = false;

        let bridge = AmqpBridge::start(&transport, config).await.unwrap();
        assert!(bridge.reply_address().is_none());
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let (transport, peer) = MemoryTransport::new();
        peer.refuse_connections("SASL authentication failed");

        let err = AmqpBridge::start(&transport, BridgeConfig::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
    }

    #[tokio::test]
    async fn test_registry_allows_shared_addresses() {
        let (transport, _peer) = MemoryTransport::new();
        let bridge = AmqpBridge::start(&transport, BridgeConfig::default()).await.unwrap();

        let _p1 = bridge.create_producer("shared").await.unwrap();
        let _p2 = bridge.create_producer("shared").await.unwrap();
        let _c1 = bridge.create_consumer("shared").await.unwrap();

        assert_eq!(
            bridge.address_links("shared"),
            AddressLinks {
                producers: 2,
                consumers: 1
            }
        );
        assert_eq!(bridge.stats().addresses, 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (transport, peer) = MemoryTransport::new();
        let bridge = AmqpBridge::start(&transport, BridgeConfig::default()).await.unwrap();

        bridge.stop().await;
        bridge.stop().await;

        assert_eq!(bridge.status(), BridgeStatus::Stopped);
        assert!(!peer.is_connected());
        let err = bridge.create_consumer("q").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BridgeStopped);
    }

    #[tokio::test]
    async fn test_failed_attach_drops_early_credit() {
        let transport = Arc::new(RefusingSenders { events: Mutex::new(None) });
        let mut config = BridgeConfig::default();
        config.options.reply_handling_support = false;
        let bridge = AmqpBridge::start(&transport, config).await.unwrap();

        let err = bridge.create_producer("orders").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LinkClosed);
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        let state = bridge.inner.state.lock();
        assert!(state.unattached_credit.is_empty());
        assert!(state.attaching.is_empty());
        assert!(state.producers.is_empty());
    }
}
