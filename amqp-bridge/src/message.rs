use serde::Deserialize;
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::bridge::{notify, BridgeInner, BridgeState, Notification};
use crate::envelope::Envelope;
use crate::error::{BridgeError, Result};
use crate::producer::Producer;
use crate::reply::{ClosedReason, ReplyHandle};
use crate::transport::LinkId;

/// Message handed to a consumer handler or returned as a reply
#[derive(Clone)]
pub struct BridgeMessage {
    envelope: Envelope,
    address: String,
    bridge: Weak<BridgeInner>,
}

impl BridgeMessage {
    pub(crate) fn new(envelope: Envelope, address: &str, bridge: Weak<BridgeInner>) -> Self {
        Self {
            envelope,
            address: address.to_string(),
            bridge,
        }
    }

    /// Decoded envelope
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn into_envelope(self) -> Envelope {
        self.envelope
    }

    /// Address the message was received from
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Body of the envelope
    pub fn body(&self) -> &serde_json::Value {
        &self.envelope.body
    }

    /// Deserialize the body into a typed value
    pub fn deserialize_body<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        self.envelope.deserialize_body()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.envelope.message_id()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.envelope.correlation_id()
    }

    /// `reply_to` of the message, when the sender expects an answer
    pub fn reply_address(&self) -> Option<&str> {
        self.envelope.reply_to()
    }

    /// Send `envelope` to the reply address, correlated to this message
    pub async fn reply(&self, envelope: Envelope) -> Result<()> {
        let (bridge, producer, envelope) = self.prepare_reply(envelope).await?;
        let sent = producer.send(envelope);
        bridge.trim_reply_producers();
        sent
    }

    /// Reply and expect a reply to the reply
    pub async fn reply_with_reply(&self, envelope: Envelope) -> Result<ReplyHandle> {
        let (bridge, producer, envelope) = self.prepare_reply(envelope).await?;
        let handle = producer.send_with_reply(envelope);
        bridge.trim_reply_producers();
        handle
    }

    async fn prepare_reply(&self, mut envelope: Envelope) -> Result<(Arc<BridgeInner>, Producer, Envelope)> {
        let reply_to = self
            .reply_address()
            .ok_or_else(|| BridgeError::invalid_field("properties.reply_to", "message has no reply address"))?;
        let bridge = self.bridge.upgrade().ok_or(BridgeError::BridgeStopped)?;

        if let Some(message_id) = self.message_id() {
            envelope.properties_mut().correlation_id = Some(message_id.to_string());
        }
        let producer = bridge.reply_producer(reply_to).await?;
        Ok((bridge, producer, envelope))
    }
}

impl std::fmt::Debug for BridgeMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeMessage")
            .field("address", &self.address)
            .field("envelope", &self.envelope)
            .finish()
    }
}

impl BridgeState {
    /// Cached live reply link for `address`, marked most recently used
    fn touch_reply_producer(&mut self, address: &str) -> Option<LinkId> {
        let position = self
            .reply_producers
            .iter()
            .position(|(cached, link)| cached == address && self.producers.contains_key(link))?;
        let entry = self.reply_producers.remove(position)?;
        let link = entry.1;
        self.reply_producers.push_back(entry);
        Some(link)
    }

    /// Close least recently used reply links with nothing buffered until the
    /// cache is back within its limit
    pub(crate) fn evict_idle_reply_producers(&mut self) -> Vec<Notification> {
        let mut notifications = Vec::new();
        while self.reply_producers.len() > self.reply_link_limit {
            let idle = self.reply_producers.iter().position(|(_, link)| {
                self.producers
                    .get(link)
                    .map_or(true, |entry| entry.flow.buffered() == 0)
            });
            let Some((address, link)) = idle.and_then(|position| self.reply_producers.remove(position)) else {
                break;
            };
            debug!(%address, %link, "closing idle reply link");
            notifications.extend(self.fail_producer(link, ClosedReason::LinkClosed));
        }
        notifications
    }
}

impl BridgeInner {
    /// Producer for replies to `address`, reused while it stays in the reply link cache
    pub(crate) async fn reply_producer(self: &Arc<Self>, address: &str) -> Result<Producer> {
        let cached = self.state.lock().touch_reply_producer(address);
        if let Some(link) = cached {
            return Ok(Producer::for_link(self.clone(), link, address));
        }

        debug!(%address, "creating reply producer");
        let producer = self.open_producer(address, true).await?;
        self.state
            .lock()
            .reply_producers
            .push_back((address.to_string(), producer.link()));
        Ok(producer)
    }

    pub(crate) fn trim_reply_producers(&self) {
        let notifications = self.state.lock().evict_idle_reply_producers();
        notify(notifications);
    }
}
