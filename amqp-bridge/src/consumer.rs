use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeInner, BridgeState, ErrorCallback, Notification};
use crate::codec;
use crate::config::DEFAULT_MAX_BUFFERED_MESSAGES;
use crate::error::{BridgeError, Result};
use crate::message::BridgeMessage;
use crate::reply::ClosedReason;
use crate::transport::{Delivery, DeliveryTag, Disposition, LinkId, ReceiverLink, Source};

/// Trait for implementing message handlers
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one delivery. Returning completes it: the delivery is accepted
    /// and one unit of credit goes back to the peer.
    async fn handle(&self, message: BridgeMessage);

    /// Get handler name for debugging
    fn name(&self) -> &'static str {
        "MessageHandler"
    }
}

/// Simple function-based message handler
pub struct FunctionHandler<F> {
    name: &'static str,
    handler: F,
}

impl<F> FunctionHandler<F> {
    pub fn new(name: &'static str, handler: F) -> Self {
        Self { name, handler }
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FunctionHandler<F>
where
    F: Fn(BridgeMessage) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, message: BridgeMessage) {
        (self.handler)(message).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Consumer creation options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerOptions {
    /// Credit window granted to the peer while a handler is active
    pub max_buffered_messages: u32,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            max_buffered_messages: DEFAULT_MAX_BUFFERED_MESSAGES,
        }
    }
}

/// Consumer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// No handler, or paused; no credit outstanding
    Idle,
    /// Handler installed and credit issued
    Active,
    /// Link gone
    Closed,
}

/// What to do with an inbound delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Dispatch,
    Release,
}

/// Receive-side credit window
#[derive(Debug)]
pub(crate) struct ConsumerCredit {
    state: ConsumerState,
    window: u32,
    outstanding: u32,
}

impl ConsumerCredit {
    pub(crate) fn new() -> Self {
        Self {
            state: ConsumerState::Idle,
            window: 0,
            outstanding: 0,
        }
    }

    pub(crate) fn state(&self) -> ConsumerState {
        self.state
    }

    pub(crate) fn outstanding(&self) -> u32 {
        self.outstanding
    }

    /// Start (or keep) issuing credit; returns the credit to flow to the peer
    pub(crate) fn activate(&mut self, window: u32, address: &str) -> Result<u32> {
        if self.state == ConsumerState::Closed {
            return Err(BridgeError::ConsumerClosed {
                address: address.to_string(),
            });
        }
        if window < 1 {
            return Err(BridgeError::InvalidCreditWindow { window });
        }
        self.state = ConsumerState::Active;
        self.window = window;
        let top_up = window.saturating_sub(self.outstanding);
        self.outstanding += top_up;
        Ok(top_up)
    }

    /// Stop issuing credit; returns whether credit must be withdrawn from the peer
    pub(crate) fn deactivate(&mut self) -> bool {
        if self.state != ConsumerState::Active {
            return false;
        }
        self.state = ConsumerState::Idle;
        std::mem::take(&mut self.outstanding) > 0
    }

    pub(crate) fn on_delivery(&mut self) -> Admission {
        match self.state {
            ConsumerState::Active => {
                self.outstanding = self.outstanding.saturating_sub(1);
                Admission::Dispatch
            }
            ConsumerState::Idle | ConsumerState::Closed => Admission::Release,
        }
    }

    /// A dispatched delivery completed; returns the credit to replenish
    pub(crate) fn on_handled(&mut self) -> u32 {
        if self.state == ConsumerState::Active && self.outstanding < self.window {
            self.outstanding += 1;
            1
        } else {
            0
        }
    }

    pub(crate) fn close(&mut self) {
        self.state = ConsumerState::Closed;
        self.outstanding = 0;
    }
}

/// A decoded delivery queued for the consumer's dispatch task
struct Inbound {
    handler: Arc<dyn MessageHandler>,
    message: BridgeMessage,
    tag: DeliveryTag,
}

pub(crate) struct ConsumerEntry {
    link: Arc<dyn ReceiverLink>,
    address: String,
    credit: ConsumerCredit,
    max_buffered: u32,
    handler: Option<Arc<dyn MessageHandler>>,
    dispatch: Option<mpsc::UnboundedSender<Inbound>>,
    error_callback: Option<ErrorCallback>,
}

impl BridgeState {
    pub(crate) fn on_delivery(&mut self, bridge: Weak<BridgeInner>, link: LinkId, delivery: Delivery) {
        let Some(entry) = self.consumers.get_mut(&link) else {
            debug!(%link, "delivery for unknown link");
            return;
        };

        if entry.credit.state() == ConsumerState::Active && entry.credit.outstanding() == 0 {
            warn!(address = %entry.address, "peer delivered beyond issued credit");
        }
        if entry.credit.on_delivery() == Admission::Release {
            debug!(address = %entry.address, "releasing delivery while inactive");
            entry.link.settle(delivery.tag, Disposition::Released);
            return;
        }

        let envelope = match codec::decode(&delivery.message) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(address = %entry.address, "rejecting undecodable delivery: {}", e);
                entry.link.settle(delivery.tag, Disposition::Rejected);
                let credit = entry.credit.on_handled();
                if credit > 0 {
                    entry.link.flow(credit);
                }
                return;
            }
        };

        let (Some(handler), Some(dispatch)) = (&entry.handler, &entry.dispatch) else {
            entry.link.settle(delivery.tag, Disposition::Released);
            return;
        };
        let inbound = Inbound {
            handler: handler.clone(),
            message: BridgeMessage::new(envelope, &entry.address, bridge),
            tag: delivery.tag,
        };
        if dispatch.send(inbound).is_err() {
            entry.link.settle(delivery.tag, Disposition::Released);
        }
    }

    /// Remove a consumer. Deliveries already queued still reach the handler.
    pub(crate) fn close_consumer(&mut self, link: LinkId, reason: ClosedReason) -> Option<Notification> {
        let mut entry = self.consumers.remove(&link)?;
        self.unregister_address(&entry.address, link);
        if entry.credit.deactivate() {
            entry.link.withdraw_credit();
        }
        entry.credit.close();
        entry.link.close();

        if self.reply_consumer == Some(link) {
            self.replies.close(reason);
        }

        let callback = entry.error_callback.take()?;
        match reason {
            ClosedReason::LinkClosed => Some(Notification::Error(callback, reason.error(&entry.address))),
            ClosedReason::Stopped => None,
        }
    }
}

async fn dispatch_loop(bridge: Weak<BridgeInner>, link: LinkId, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(Inbound { handler, message, tag }) = inbound.recv().await {
        handler.handle(message).await;
        match bridge.upgrade() {
            Some(bridge) => bridge.delivery_handled(link, tag),
            None => break,
        }
    }
    debug!(%link, "dispatch task finished");
}

impl BridgeInner {
    pub(crate) async fn create_consumer(self: &Arc<Self>, address: &str, options: ConsumerOptions) -> Result<Consumer> {
        let consumer = self
            .open_consumer(Source::Address(address.to_string()), options, false)
            .await?;
        info!("📥 Created consumer for {}", address);
        Ok(consumer)
    }

    pub(crate) async fn open_consumer(
        self: &Arc<Self>,
        source: Source,
        options: ConsumerOptions,
        internal: bool,
    ) -> Result<Consumer> {
        if options.max_buffered_messages < 1 {
            return Err(BridgeError::InvalidCreditWindow {
                window: options.max_buffered_messages,
            });
        }
        self.state.lock().ensure_running()?;

        let link = self.next_link_id();
        let receiver = self.connection.open_receiver(link, source).await?;
        let address = receiver.address().to_string();

        let mut state = self.state.lock();
        if let Err(e) = state.ensure_running() {
            receiver.close();
            return Err(e);
        }

        let (dispatch, inbound) = mpsc::unbounded_channel();
        state.consumers.insert(
            link,
            ConsumerEntry {
                link: receiver,
                address: address.clone(),
                credit: ConsumerCredit::new(),
                max_buffered: options.max_buffered_messages,
                handler: None,
                dispatch: Some(dispatch),
                error_callback: None,
            },
        );
        if !internal {
            state.register_address(&address, link);
        }
        tokio::spawn(dispatch_loop(Arc::downgrade(self), link, inbound));

        Ok(Consumer {
            bridge: self.clone(),
            link,
            address,
        })
    }

    fn delivery_handled(&self, link: LinkId, tag: DeliveryTag) {
        let mut state = self.state.lock();
        let Some(entry) = state.consumers.get_mut(&link) else {
            debug!(%link, "handled delivery on a closed link");
            return;
        };
        entry.link.settle(tag, Disposition::Accepted);
        let credit = entry.credit.on_handled();
        if credit > 0 {
            entry.link.flow(credit);
        }
    }

    fn activate(&self, link: LinkId, address: &str, handler: Option<Arc<dyn MessageHandler>>) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.ensure_running()?;
        let entry = state.consumers.get_mut(&link).ok_or_else(|| BridgeError::ConsumerClosed {
            address: address.to_string(),
        })?;

        let handler = handler
            .or_else(|| entry.handler.clone())
            .ok_or_else(|| BridgeError::config_error(format!("no handler registered for {}", address)))?;
        let credit = entry.credit.activate(entry.max_buffered, address)?;
        debug!(%address, handler = handler.name(), credit, "consumer active");
        entry.handler = Some(handler);
        if credit > 0 {
            entry.link.flow(credit);
        }
        Ok(())
    }

    fn deactivate(&self, link: LinkId) {
        if let Some(entry) = self.state.lock().consumers.get_mut(&link) {
            if entry.credit.deactivate() {
                entry.link.withdraw_credit();
            }
            debug!(address = %entry.address, "consumer paused");
        }
    }
}

/// Receiving end of a link from one address
///
/// Messages flow only while a handler is installed and the consumer is not
/// paused; the peer never holds more than `max_buffered_messages` credit.
#[derive(Clone)]
pub struct Consumer {
    bridge: Arc<BridgeInner>,
    link: LinkId,
    address: String,
}

impl Consumer {
    pub(crate) fn link(&self) -> LinkId {
        self.link
    }

    /// Attached address; bridge-assigned for the reply consumer
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Install `handler` and start issuing credit. Replacing a handler keeps
    /// the credit already outstanding.
    pub fn handler<H>(&self, handler: H) -> Result<()>
    where
        H: MessageHandler + 'static,
    {
        self.bridge.activate(self.link, &self.address, Some(Arc::new(handler)))
    }

    /// Install a closure as the handler
    pub fn handler_fn<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(BridgeMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handler(FunctionHandler::new("function", handler))
    }

    /// Withdraw all credit. Deliveries already received are still handled.
    pub fn pause(&self) {
        self.bridge.deactivate(self.link);
    }

    /// Reissue the credit window for the installed handler
    pub fn resume(&self) -> Result<()> {
        self.bridge.activate(self.link, &self.address, None)
    }

    /// Change the credit window; an active consumer is topped up right away
    pub fn set_max_buffered_messages(&self, max_buffered_messages: u32) -> Result<()> {
        if max_buffered_messages < 1 {
            return Err(BridgeError::InvalidCreditWindow {
                window: max_buffered_messages,
            });
        }
        let active = {
            let mut state = self.bridge.state.lock();
            let entry = state.consumers.get_mut(&self.link).ok_or_else(|| BridgeError::ConsumerClosed {
                address: self.address.clone(),
            })?;
            entry.max_buffered = max_buffered_messages;
            entry.credit.state() == ConsumerState::Active
        };
        if active {
            self.resume()?;
        }
        Ok(())
    }

    pub fn max_buffered_messages(&self) -> u32 {
        self.bridge
            .state
            .lock()
            .consumers
            .get(&self.link)
            .map_or(0, |entry| entry.max_buffered)
    }

    /// Credit the peer currently holds
    pub fn credit(&self) -> u32 {
        self.bridge
            .state
            .lock()
            .consumers
            .get(&self.link)
            .map_or(0, |entry| entry.credit.outstanding())
    }

    pub fn state(&self) -> ConsumerState {
        self.bridge
            .state
            .lock()
            .consumers
            .get(&self.link)
            .map_or(ConsumerState::Closed, |entry| entry.credit.state())
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConsumerState::Active
    }

    /// Invoke `callback` when the link fails
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&BridgeError) + Send + Sync + 'static,
    {
        if let Some(entry) = self.bridge.state.lock().consumers.get_mut(&self.link) {
            entry.error_callback = Some(Arc::new(callback));
        }
    }

    /// Detach the link
    pub fn close(&self) {
        let mut state = self.bridge.state.lock();
        if let Some(entry) = state.consumers.get_mut(&self.link) {
            entry.error_callback = None;
        }
        state.close_consumer(self.link, ClosedReason::LinkClosed);
        debug!(address = %self.address, "consumer closed");
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("link", &self.link)
            .field("address", &self.address)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;

    #[test]
    fn test_activate_grants_window() {
        let mut credit = ConsumerCredit::new();
        assert_eq!(credit.activate(5, "q").unwrap(), 5);
        assert_eq!(credit.state(), ConsumerState::Active);
        // already topped up
        assert_eq!(credit.activate(5, "q").unwrap(), 0);
    }

    #[test]
    fn test_invalid_window() {
        let mut credit = ConsumerCredit::new();
        let err = credit.activate(0, "q").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCreditWindow);
        assert_eq!(credit.state(), ConsumerState::Idle);
    }

    #[test]
    fn test_replenish_after_handling() {
        let mut credit = ConsumerCredit::new();
        credit.activate(5, "q").unwrap();
        for _ in 0..3 {
            assert_eq!(credit.on_delivery(), Admission::Dispatch);
        }
        assert_eq!(credit.outstanding(), 2);
        for _ in 0..3 {
            assert_eq!(credit.on_handled(), 1);
        }
        assert_eq!(credit.outstanding(), 5);
        assert_eq!(credit.on_handled(), 0);
    }

    #[test]
    fn test_deactivate_withdraws() {
        let mut credit = ConsumerCredit::new();
        credit.activate(3, "q").unwrap();
        credit.on_delivery();

        assert!(credit.deactivate());
        assert_eq!(credit.outstanding(), 0);
        assert!(!credit.deactivate());
        // completion of the in-flight delivery must not reissue credit
        assert_eq!(credit.on_handled(), 0);
        assert_eq!(credit.on_delivery(), Admission::Release);

        assert_eq!(credit.activate(3, "q").unwrap(), 3);
    }

    #[test]
    fn test_closed_rejects_activation() {
        let mut credit = ConsumerCredit::new();
        credit.activate(3, "q").unwrap();
        credit.close();
        let err = credit.activate(3, "q").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConsumerClosed);
        assert_eq!(credit.on_delivery(), Admission::Release);
    }

    #[test]
    fn test_shrinking_window_stops_replenishing() {
        let mut credit = ConsumerCredit::new();
        credit.activate(4, "q").unwrap();
        credit.on_delivery();
        assert_eq!(credit.activate(2, "q").unwrap(), 0);
        assert_eq!(credit.on_handled(), 0);
        assert_eq!(credit.outstanding(), 3);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Deliver,
        Handle,
        Pause,
        Resume,
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => Just(Op::Deliver),
            4 => Just(Op::Handle),
            1 => Just(Op::Pause),
            1 => Just(Op::Resume),
        ]
    }

    proptest! {
        #[test]
        fn property_credit_never_exceeds_window(
            window in 1u32..16,
            ops in prop::collection::vec(arb_op(), 0..128),
        ) {
            let mut credit = ConsumerCredit::new();
            credit.activate(window, "q").unwrap();
            let mut in_flight = 0u32;

            for op in ops {
                match op {
                    Op::Deliver => {
                        if credit.outstanding() > 0 && credit.on_delivery() == Admission::Dispatch {
                            in_flight += 1;
                        }
                    }
                    Op::Handle => {
                        if in_flight > 0 {
                            in_flight -= 1;
                            credit.on_handled();
                        }
                    }
                    Op::Pause => {
                        credit.deactivate();
                    }
                    Op::Resume => {
                        credit.activate(window, "q").unwrap();
                    }
                }
                prop_assert!(credit.outstanding() <= window);
                if credit.state() != ConsumerState::Active {
                    prop_assert_eq!(credit.outstanding(), 0);
                }
            }
        }
    }
}
