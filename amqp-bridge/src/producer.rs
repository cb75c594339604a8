use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::amqp::AmqpMessage;
use crate::bridge::{BridgeInner, BridgeState, DrainCallback, ErrorCallback, Notification};
use crate::codec;
use crate::envelope::Envelope;
use crate::error::{BridgeError, Result};
use crate::message::BridgeMessage;
use crate::reply::{ClosedReason, ReplyHandle};
use crate::transport::{LinkId, SenderLink};

/// Send-side credit accounting for one link.
///
/// Items submitted while the peer has granted no credit are buffered and
/// released in submission order as credit arrives.
#[derive(Debug)]
pub(crate) struct ProducerFlow<T> {
    credit: u32,
    buffer: VecDeque<T>,
}

/// Outcome of a credit grant
#[derive(Debug)]
pub(crate) struct CreditGrant<T> {
    /// Buffered items that may now be transferred, oldest first
    pub ready: Vec<T>,
    /// The write queue went from full to not full
    pub drained: bool,
}

impl<T> ProducerFlow<T> {
    pub(crate) fn new() -> Self {
        Self {
            credit: 0,
            buffer: VecDeque::new(),
        }
    }

    pub(crate) fn credit(&self) -> u32 {
        self.credit
    }

    pub(crate) fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn is_write_queue_full(&self) -> bool {
        self.credit == 0
    }

    /// Returns the item back when it may be transferred immediately
    pub(crate) fn submit(&mut self, item: T) -> Option<T> {
        if self.credit > 0 && self.buffer.is_empty() {
            self.credit -= 1;
            Some(item)
        } else {
            self.buffer.push_back(item);
            None
        }
    }

    pub(crate) fn grant(&mut self, credit: u32) -> CreditGrant<T> {
        let was_full = self.is_write_queue_full();
        self.credit = self.credit.saturating_add(credit);

        let count = self.buffer.len().min(self.credit as usize);
        let ready: Vec<T> = self.buffer.drain(..count).collect();
        self.credit -= ready.len() as u32;

        CreditGrant {
            ready,
            drained: was_full && !self.is_write_queue_full(),
        }
    }

    /// Drop all credit and hand back everything still buffered
    pub(crate) fn close(&mut self) -> Vec<T> {
        self.credit = 0;
        self.buffer.drain(..).collect()
    }
}

/// A message waiting for, or holding, link credit
#[derive(Debug)]
pub(crate) struct Outgoing {
    pub message: AmqpMessage,
    pub reply_id: Option<String>,
}

pub(crate) struct ProducerEntry {
    pub link: Arc<dyn SenderLink>,
    pub address: String,
    pub flow: ProducerFlow<Outgoing>,
    pub drain_callback: Option<DrainCallback>,
    pub error_callback: Option<ErrorCallback>,
    /// Reply links stay out of the address registry and statistics
    pub internal: bool,
}

impl ProducerEntry {
    fn new(link: Arc<dyn SenderLink>, address: &str, internal: bool) -> Self {
        Self {
            link,
            address: address.to_string(),
            internal,
            flow: ProducerFlow::new(),
            drain_callback: None,
            error_callback: None,
        }
    }
}

impl BridgeState {
    pub(crate) fn on_credit(&mut self, link: LinkId, credit: u32) -> Vec<Notification> {
        let Some(entry) = self.producers.get_mut(&link) else {
            if self.attaching.contains(&link) {
                debug!(%link, credit, "credit for a link still attaching");
                let stashed = self.unattached_credit.entry(link).or_default();
                *stashed = stashed.saturating_add(credit);
            } else {
                debug!(%link, credit, "credit for unknown link dropped");
            }
            return Vec::new();
        };

        let grant = entry.flow.grant(credit);
        debug!(
            address = %entry.address,
            credit,
            released = grant.ready.len(),
            "credit granted"
        );

        let mut failed = false;
        for outgoing in grant.ready {
            if let Err(e) = entry.link.transfer(outgoing.message) {
                warn!(address = %entry.address, "transfer failed: {}", e);
                if let Some(id) = outgoing.reply_id {
                    self.replies.fail(&id, BridgeError::link_closed(&entry.address));
                }
                failed = true;
            }
        }

        if failed {
            return self.fail_producer(link, ClosedReason::LinkClosed).into_iter().collect();
        }
        let mut notifications = match (&entry.drain_callback, grant.drained) {
            (Some(callback), true) => vec![Notification::Drain(callback.clone())],
            _ => Vec::new(),
        };
        if entry.internal {
            notifications.extend(self.evict_idle_reply_producers());
        }
        notifications
    }

    /// Remove a producer, failing everything it still buffers
    pub(crate) fn fail_producer(&mut self, link: LinkId, reason: ClosedReason) -> Option<Notification> {
        let mut entry = self.producers.remove(&link)?;
        self.unregister_address(&entry.address, link);
        self.reply_producers.retain(|(_, l)| *l != link);
        entry.link.close();

        let pending = entry.flow.close();
        if !pending.is_empty() {
            warn!(
                address = %entry.address,
                count = pending.len(),
                "failing buffered sends"
            );
        }
        let had_pending = !pending.is_empty();
        for outgoing in pending {
            if let Some(id) = outgoing.reply_id {
                self.replies.fail(&id, reason.error(&entry.address));
            }
        }

        match (reason, entry.error_callback) {
            (ClosedReason::LinkClosed, Some(callback)) => {
                Some(Notification::Error(callback, reason.error(&entry.address)))
            }
            (ClosedReason::Stopped, Some(callback)) if had_pending => {
                Some(Notification::Error(callback, reason.error(&entry.address)))
            }
            _ => None,
        }
    }
}

impl BridgeInner {
    pub(crate) async fn create_producer(self: &Arc<Self>, address: &str) -> Result<Producer> {
        self.open_producer(address, false).await
    }

    pub(crate) async fn open_producer(self: &Arc<Self>, address: &str, internal: bool) -> Result<Producer> {
        let link = self.next_link_id();
        {
            let mut state = self.state.lock();
            state.ensure_running()?;
            state.attaching.insert(link);
        }

        let opened = self.connection.open_sender(link, address).await;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.attaching.remove(&link);
        let credit = state.unattached_credit.remove(&link);
        let sender = opened?;
        if let Err(e) = state.ensure_running() {
            sender.close();
            return Err(e);
        }

        let mut entry = ProducerEntry::new(sender, address, internal);
        if let Some(credit) = credit {
            entry.flow.grant(credit);
        }
        state.producers.insert(link, entry);
        if internal {
            debug!(%address, "opened reply link");
        } else {
            state.register_address(address, link);
            info!("📤 Created producer for {}", address);
        }
        Ok(Producer {
            bridge: self.clone(),
            link,
            address: address.to_string(),
        })
    }

    /// Encode and submit one envelope; returns the generated message id when
    /// a reply is expected
    fn send(
        &self,
        link: LinkId,
        address: &str,
        mut envelope: Envelope,
        reply: Option<oneshot::Sender<Result<BridgeMessage>>>,
    ) -> Result<Option<String>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.ensure_running()?;
        if !state.producers.contains_key(&link) {
            return Err(BridgeError::link_closed(address));
        }

        let reply_id = match &reply {
            Some(_) => {
                let reply_to = state.replies.check_ready()?.to_string();
                let message_id = Uuid::new_v4().to_string();
                let properties = envelope.properties_mut();
                properties.message_id = Some(message_id.clone());
                properties.reply_to = Some(reply_to);
                Some(message_id)
            }
            None => None,
        };

        let message = codec::encode(&envelope)?;
        if let (Some(id), Some(sender)) = (&reply_id, reply) {
            state.replies.register(id.clone(), sender)?;
        }

        let Some(entry) = state.producers.get_mut(&link) else {
            return Err(BridgeError::link_closed(address));
        };
        let outgoing = Outgoing {
            message,
            reply_id: reply_id.clone(),
        };
        let Some(outgoing) = entry.flow.submit(outgoing) else {
            debug!(%address, buffered = entry.flow.buffered(), "no credit, send buffered");
            return Ok(reply_id);
        };

        if let Err(e) = entry.link.transfer(outgoing.message) {
            if let Some(id) = &reply_id {
                state.replies.discard(id);
            }
            return Err(e);
        }
        Ok(reply_id)
    }
}

/// Sending end of a link to one address
///
/// Cloning yields another handle to the same link.
#[derive(Clone)]
pub struct Producer {
    bridge: Arc<BridgeInner>,
    link: LinkId,
    address: String,
}

impl Producer {
    pub(crate) fn for_link(bridge: Arc<BridgeInner>, link: LinkId, address: &str) -> Self {
        Self {
            bridge,
            link,
            address: address.to_string(),
        }
    }

    pub(crate) fn link(&self) -> LinkId {
        self.link
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send without expecting a reply. Never waits for credit: without it
    /// the message is buffered until the peer grants some.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.bridge.send(self.link, &self.address, envelope, None).map(|_| ())
    }

    /// Send and register for the reply correlated to the generated message id.
    /// Any `message_id` or `reply_to` already on the envelope is replaced.
    pub fn send_with_reply(&self, envelope: Envelope) -> Result<ReplyHandle> {
        let (tx, rx) = oneshot::channel();
        let message_id = self
            .bridge
            .send(self.link, &self.address, envelope, Some(tx))?
            .ok_or_else(|| BridgeError::config_error("reply correlation was not registered"))?;
        Ok(ReplyHandle::new(message_id, rx))
    }

    /// True while the link holds no credit; sends are still accepted and buffered
    pub fn is_write_queue_full(&self) -> bool {
        self.bridge
            .state
            .lock()
            .producers
            .get(&self.link)
            .map_or(true, |entry| entry.flow.is_write_queue_full())
    }

    /// Credit left on the link
    pub fn credit(&self) -> u32 {
        self.bridge
            .state
            .lock()
            .producers
            .get(&self.link)
            .map_or(0, |entry| entry.flow.credit())
    }

    /// Sends waiting for credit
    pub fn buffered(&self) -> usize {
        self.bridge
            .state
            .lock()
            .producers
            .get(&self.link)
            .map_or(0, |entry| entry.flow.buffered())
    }

    /// Invoke `callback` each time the write queue stops being full
    pub fn on_drain<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if let Some(entry) = self.bridge.state.lock().producers.get_mut(&self.link) {
            entry.drain_callback = Some(Arc::new(callback));
        }
    }

    /// Invoke `callback` when the link fails
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&BridgeError) + Send + Sync + 'static,
    {
        if let Some(entry) = self.bridge.state.lock().producers.get_mut(&self.link) {
            entry.error_callback = Some(Arc::new(callback));
        }
    }

    /// Detach the link. Buffered sends are dropped and their replies fail with `LinkClosed`.
    pub fn close(&self) {
        {
            let mut state = self.bridge.state.lock();
            if let Some(entry) = state.producers.get_mut(&self.link) {
                entry.error_callback = None;
            }
            state.fail_producer(self.link, ClosedReason::LinkClosed);
        }
        debug!(address = %self.address, "producer closed");
    }

    pub fn is_closed(&self) -> bool {
        !self.bridge.state.lock().producers.contains_key(&self.link)
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("link", &self.link)
            .field("address", &self.address)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_submit_without_credit_buffers() {
        let mut flow = ProducerFlow::new();
        assert!(flow.is_write_queue_full());
        assert!(flow.submit(1).is_none());
        assert!(flow.submit(2).is_none());
        assert_eq!(flow.buffered(), 2);
    }

    #[test]
    fn test_grant_releases_in_order() {
        let mut flow = ProducerFlow::new();
        for i in 0..3 {
            flow.submit(i);
        }

        let grant = flow.grant(2);
        assert_eq!(grant.ready, vec![0, 1]);
        assert!(!grant.drained);
        assert!(flow.is_write_queue_full());

        let grant = flow.grant(5);
        assert_eq!(grant.ready, vec![2]);
        assert!(grant.drained);
        assert_eq!(flow.credit(), 4);
        assert_eq!(flow.submit(3), Some(3));
        assert_eq!(flow.credit(), 3);
    }

    #[test]
    fn test_drained_only_on_transition() {
        let mut flow: ProducerFlow<u8> = ProducerFlow::new();
        assert!(flow.grant(1).drained);
        assert!(!flow.grant(1).drained);
    }

    #[test]
    fn test_submit_queues_behind_buffer() {
        let mut flow = ProducerFlow::new();
        flow.submit("a");
        flow.credit = 1;
        // credit alone must not let a later send overtake the buffer
        assert!(flow.submit("b").is_none());
        assert_eq!(flow.grant(0).ready, vec!["a"]);
    }

    #[test]
    fn test_close_returns_buffer() {
        let mut flow = ProducerFlow::new();
        flow.submit(1);
        flow.submit(2);
        assert_eq!(flow.close(), vec![1, 2]);
        assert_eq!(flow.buffered(), 0);
        assert!(flow.is_write_queue_full());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Send,
        Grant(u32),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Send), (0u32..4).prop_map(Op::Grant)]
    }

    proptest! {
        #[test]
        fn property_transfers_preserve_send_order(ops in prop::collection::vec(arb_op(), 0..64)) {
            let mut flow = ProducerFlow::new();
            let mut next = 0u32;
            let mut transferred = Vec::new();
            let mut granted = 0u64;

            for op in ops {
                match op {
                    Op::Send => {
                        if let Some(item) = flow.submit(next) {
                            transferred.push(item);
                        }
                        next += 1;
                    }
                    Op::Grant(credit) => {
                        granted += u64::from(credit);
                        transferred.extend(flow.grant(credit).ready);
                    }
                }
                prop_assert!(transferred.len() as u64 <= granted);
                prop_assert_eq!(flow.is_write_queue_full(), flow.credit() == 0);
                prop_assert!(flow.buffered() == 0 || flow.credit() == 0);
            }

            let expected: Vec<u32> = (0..transferred.len() as u32).collect();
            prop_assert_eq!(transferred, expected);
        }
    }
}
