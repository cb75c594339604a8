use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::bridge::BridgeInner;
use crate::consumer::{ConsumerOptions, MessageHandler};
use crate::error::{BridgeError, Result};
use crate::message::BridgeMessage;
use crate::transport::Source;

pub(crate) type ReplySender = oneshot::Sender<Result<BridgeMessage>>;

/// Why links or the reply consumer went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClosedReason {
    Stopped,
    LinkClosed,
}

impl ClosedReason {
    pub(crate) fn error(self, address: &str) -> BridgeError {
        match self {
            ClosedReason::Stopped => BridgeError::BridgeStopped,
            ClosedReason::LinkClosed => BridgeError::link_closed(address),
        }
    }
}

#[derive(Debug)]
enum ReplyState {
    Uninitialized,
    Ready { address: String },
    Closed { address: Option<String>, reason: ClosedReason },
}

/// Correlates inbound replies to pending `send_with_reply` calls by message id
#[derive(Debug)]
pub(crate) struct ReplyCorrelator {
    state: ReplyState,
    pending: HashMap<String, ReplySender>,
}

impl ReplyCorrelator {
    pub(crate) fn new() -> Self {
        Self {
            state: ReplyState::Uninitialized,
            pending: HashMap::new(),
        }
    }

    /// The reply consumer attached at `address`
    pub(crate) fn ready(&mut self, address: &str) {
        if let ReplyState::Uninitialized = self.state {
            self.state = ReplyState::Ready {
                address: address.to_string(),
            };
        }
    }

    pub(crate) fn reply_address(&self) -> Option<&str> {
        match &self.state {
            ReplyState::Ready { address } => Some(address),
            _ => None,
        }
    }

    /// Reply address to stamp on an outgoing request
    pub(crate) fn check_ready(&self) -> Result<&str> {
        match &self.state {
            ReplyState::Ready { address } => Ok(address),
            ReplyState::Uninitialized => Err(BridgeError::config_error(
                "reply handling support is disabled for this bridge",
            )),
            ReplyState::Closed { address, reason } => Err(reason.error(address.as_deref().unwrap_or_default())),
        }
    }

    pub(crate) fn register(&mut self, message_id: String, sender: ReplySender) -> Result<()> {
        if self.pending.contains_key(&message_id) {
            error!("Reply correlation collision for message id {}", message_id);
            return Err(BridgeError::InternalCorrelationCollision { message_id });
        }
        self.pending.insert(message_id, sender);
        Ok(())
    }

    /// Remove the waiter for `correlation_id`, if any
    pub(crate) fn take(&mut self, correlation_id: &str) -> Option<ReplySender> {
        self.pending.remove(correlation_id)
    }

    pub(crate) fn fail(&mut self, message_id: &str, err: BridgeError) {
        if let Some(sender) = self.pending.remove(message_id) {
            let _ = sender.send(Err(err));
        }
    }

    /// Forget a registration whose request never left
    pub(crate) fn discard(&mut self, message_id: &str) {
        self.pending.remove(message_id);
    }

    /// Terminal: fail every waiter and refuse new registrations
    pub(crate) fn close(&mut self, reason: ClosedReason) {
        let address = match std::mem::replace(&mut self.state, ReplyState::Uninitialized) {
            ReplyState::Ready { address } => Some(address),
            ReplyState::Closed { address, .. } => address,
            ReplyState::Uninitialized => None,
        };
        let failed = self.pending.len();
        for (_, sender) in self.pending.drain() {
            let _ = sender.send(Err(reason.error(address.as_deref().unwrap_or_default())));
        }
        if failed > 0 {
            info!("Failed {} pending replies", failed);
        }
        self.state = ReplyState::Closed { address, reason };
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Handler of the internal reply consumer
struct ReplyDispatcher {
    bridge: Weak<BridgeInner>,
}

#[async_trait]
impl MessageHandler for ReplyDispatcher {
    async fn handle(&self, message: BridgeMessage) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.dispatch_reply(message);
        }
    }

    fn name(&self) -> &'static str {
        "ReplyDispatcher"
    }
}

impl BridgeInner {
    /// Attach the dynamic reply consumer and start correlating
    pub(crate) async fn start_reply_consumer(self: &Arc<Self>) -> Result<()> {
        let options = ConsumerOptions {
            max_buffered_messages: self.config.options.default_max_buffered_messages,
        };
        let consumer = self.open_consumer(Source::Dynamic, options, true).await?;
        consumer.handler(ReplyDispatcher {
            bridge: Arc::downgrade(self),
        })?;

        let mut state = self.state.lock();
        state.reply_consumer = Some(consumer.link());
        state.replies.ready(consumer.address());
        info!("📥 Reply consumer attached at {}", consumer.address());
        Ok(())
    }

    fn dispatch_reply(&self, message: BridgeMessage) {
        let Some(correlation_id) = message.envelope().correlation_id().map(str::to_string) else {
            debug!("dropping reply without correlation id");
            return;
        };
        let waiter = self.state.lock().replies.take(&correlation_id);
        match waiter {
            Some(sender) => {
                if sender.send(Ok(message)).is_err() {
                    debug!(%correlation_id, "reply waiter gone");
                }
            }
            None => debug!(%correlation_id, "dropping unmatched reply"),
        }
    }
}

/// Pending reply to a request sent with [`Producer::send_with_reply`](crate::Producer::send_with_reply)
#[derive(Debug)]
pub struct ReplyHandle {
    message_id: String,
    receiver: oneshot::Receiver<Result<BridgeMessage>>,
}

impl ReplyHandle {
    pub(crate) fn new(message_id: String, receiver: oneshot::Receiver<Result<BridgeMessage>>) -> Self {
        Self { message_id, receiver }
    }

    /// Message id generated for the request
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Wait for the reply. Resolves at most once: with the reply, or with the
    /// error that ended the wait (`BridgeStopped`, `LinkClosed`).
    pub async fn reply(self) -> Result<BridgeMessage> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::BridgeStopped),
        }
    }
}
