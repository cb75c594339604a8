//! Request/reply over an in-process peer
//!
//! The memory peer does not route on its own, so this demo plays the broker:
//! it grants credit to sender links and forwards whatever they transfer to
//! the receiver attached at the same address.

use amqp_bridge::{AmqpBridge, BridgeConfig, Envelope, MemoryPeer, MemoryTransport};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct QuoteRequest {
    symbol: String,
    quantity: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct QuoteResponse {
    symbol: String,
    total_cents: u64,
}

/// Forward transfers on `addresses` to their receivers, granting credit as we go
async fn route(peer: MemoryPeer, addresses: Vec<String>) {
    let mut forwarded = vec![0usize; addresses.len()];
    loop {
        for (i, address) in addresses.iter().enumerate() {
            peer.grant_credit(address, 10);
            let sent = peer.sent(address);
            for message in sent.into_iter().skip(forwarded[i]) {
                if peer.deliver(address, message).is_none() {
                    break;
                }
                forwarded[i] += 1;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (transport, peer) = MemoryTransport::new();
    let bridge = AmqpBridge::start(&transport, BridgeConfig::load()?).await?;
    let reply_address = bridge
        .reply_address()
        .ok_or_else(|| anyhow::anyhow!("reply handling is disabled"))?;

    let router = tokio::spawn(route(peer, vec!["quotes".to_string(), reply_address]));

    let consumer = bridge.create_consumer("quotes").await?;
    consumer.handler_fn(|msg| async move {
        let request: QuoteRequest = match msg.deserialize_body() {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("bad quote request: {}", e);
                return;
            }
        };
        let response = QuoteResponse {
            total_cents: u64::from(request.quantity) * 1_250,
            symbol: request.symbol,
        };
        match serde_json::to_value(&response) {
            Ok(body) => {
                if let Err(e) = msg.reply(Envelope::value(body)).await {
                    tracing::warn!("reply failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("cannot encode response: {}", e),
        }
    })?;

    let producer = bridge.create_producer("quotes").await?;
    for (symbol, quantity) in [("ACME", 3), ("INITECH", 12)] {
        let request = QuoteRequest {
            symbol: symbol.to_string(),
            quantity,
        };
        let handle = producer.send_with_reply(Envelope::value(serde_json::to_value(&request)?))?;
        let reply = tokio::time::timeout(Duration::from_secs(5), handle.reply()).await??;
        let response: QuoteResponse = reply.deserialize_body()?;
        info!("💬 {} x{} = {} cents", response.symbol, quantity, response.total_cents);
    }

    info!("📊 {:?}", bridge.stats());
    bridge.stop().await;
    router.abort();
    Ok(())
}
