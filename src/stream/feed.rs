//! Upstream trade feeds.
//!
//! `BitstampFeed` keeps one websocket per topic on the Bitstamp v2 stream and
//! reconnects with backoff. `ChannelFeed` is an in-process feed for replay and tests.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::models::TradeSide;

const FEED_CHANNEL_CAPACITY: usize = 4096;

/// Raw trade as emitted by a feed, before it is tagged with an instrument
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedTrade {
    pub side: TradeSide,
    pub price: f64,
    pub size: f64,
    pub timestamp: i64,
}

pub trait TradeFeed: Send + Sync {
    /// Subscribe to a topic. The receiver closes when the feed shuts down.
    fn subscribe(&self, topic: &str) -> mpsc::Receiver<FeedTrade>;
}

/// In-process feed. `sender(topic)` returns a handle that pushes into subscribers.
#[derive(Clone, Default)]
pub struct ChannelFeed {
    topics: Arc<Mutex<HashMap<String, mpsc::Sender<FeedTrade>>>>,
    pending: Arc<Mutex<HashMap<String, mpsc::Receiver<FeedTrade>>>>,
}

impl ChannelFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sender for `topic`. Trades sent before anyone subscribes are kept.
    pub fn sender(&self, topic: &str) -> mpsc::Sender<FeedTrade> {
        let mut topics = self.topics.lock();
        if let Some(tx) = topics.get(topic) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        topics.insert(topic.to_string(), tx.clone());
        self.pending.lock().insert(topic.to_string(), rx);
        tx
    }
}

impl TradeFeed for ChannelFeed {
    fn subscribe(&self, topic: &str) -> mpsc::Receiver<FeedTrade> {
        // Make sure the topic exists, then hand out its receiver once.
        let _ = self.sender(topic);
        match self.pending.lock().remove(topic) {
            Some(rx) => rx,
            None => {
                warn!(topic, "topic already subscribed on channel feed");
                let (_tx, rx) = mpsc::channel(1);
                rx
            }
        }
    }
}

/// Bitstamp v2 websocket feed (`live_trades_<topic>` channels)
pub struct BitstampFeed {
    url: String,
}

#[derive(Debug, Deserialize)]
struct BitstampMessage {
    event: String,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct BitstampTrade {
    amount: f64,
    price: f64,
    /// 0 = buy, 1 = sell
    #[serde(rename = "type")]
    kind: u8,
    timestamp: String,
}

impl BitstampFeed {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    async fn run(url: String, topic: String, tx: mpsc::Sender<FeedTrade>) {
        let mut reconnect_delay = Duration::from_secs(1);
        let max_reconnect_delay = Duration::from_secs(30);

        loop {
            if tx.is_closed() {
                debug!(topic = %topic, "bitstamp feed subscriber gone, stopping");
                return;
            }
            match Self::connect_and_stream(&url, &topic, &tx).await {
                Ok(()) => {
                    reconnect_delay = Duration::from_secs(1);
                }
                Err(e) => {
                    warn!(topic = %topic, error = %e, "bitstamp ws disconnected; reconnecting");
                    sleep(reconnect_delay).await;
                    reconnect_delay = (reconnect_delay * 2).min(max_reconnect_delay);
                }
            }
        }
    }

    async fn connect_and_stream(url: &str, topic: &str, tx: &mpsc::Sender<FeedTrade>) -> Result<()> {
        info!(topic, "🔌 Connecting to Bitstamp trade stream");
        let (ws_stream, _resp) = connect_async(url).await.context("connect_async bitstamp")?;
        let (mut write, mut read) = ws_stream.split();

        let channel = format!("live_trades_{topic}");
        let sub = serde_json::json!({
            "event": "bts:subscribe",
            "data": { "channel": channel },
        });
        write
            .send(Message::Text(sub.to_string()))
            .await
            .context("send bitstamp subscription")?;

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => match parse_bitstamp(&text) {
                    Ok(BitstampFrame::Trade(trade)) => {
                        if tx.send(trade).await.is_err() {
                            return Ok(());
                        }
                    }
                    Ok(BitstampFrame::Reconnect) => {
                        info!(topic, "bitstamp requested reconnect");
                        return Ok(());
                    }
                    Ok(BitstampFrame::Other) => {}
                    Err(e) => debug!(topic, error = %e, "ignoring malformed bitstamp message"),
                },
                Ok(Message::Ping(payload)) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "bitstamp ws close");
                    return Err(anyhow::anyhow!("bitstamp closed the stream"));
                }
                Ok(_) => {}
                Err(e) => return Err(anyhow::anyhow!("bitstamp ws error: {e}")),
            }
        }

        Err(anyhow::anyhow!("bitstamp stream ended"))
    }
}

impl TradeFeed for BitstampFeed {
    fn subscribe(&self, topic: &str) -> mpsc::Receiver<FeedTrade> {
        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        tokio::spawn(Self::run(self.url.clone(), topic.to_string(), tx));
        rx
    }
}

/// One decoded Bitstamp text frame
#[derive(Debug, PartialEq)]
enum BitstampFrame {
    Trade(FeedTrade),
    /// The server is about to go away; open a fresh connection.
    Reconnect,
    Other,
}

fn parse_bitstamp(text: &str) -> Result<BitstampFrame> {
    let msg: BitstampMessage = serde_json::from_str(text)?;
    match msg.event.as_str() {
        "trade" => {}
        "bts:request_reconnect" => return Ok(BitstampFrame::Reconnect),
        _ => return Ok(BitstampFrame::Other),
    }
    let trade: BitstampTrade = serde_json::from_value(msg.data)
        .with_context(|| format!("trade payload on {}", msg.channel))?;
    let timestamp = trade
        .timestamp
        .parse::<i64>()
        .context("trade timestamp")?;
    let side = if trade.kind == 1 {
        TradeSide::Sell
    } else {
        TradeSide::Buy
    };
    if !(trade.price.is_finite() && trade.price > 0.0) {
        return Err(anyhow::anyhow!("non-positive price {}", trade.price));
    }
    Ok(BitstampFrame::Trade(FeedTrade {
        side,
        price: trade.price,
        size: trade.amount,
        timestamp,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_trade_event() {
        let raw = r#"{"data": {"id": 1, "timestamp": "1700000000", "amount": 0.25,
            "amount_str": "0.25", "price": 1950.5, "price_str": "1950.5", "type": 1,
            "microtimestamp": "1700000000123456"}, "channel": "live_trades_etheur", "event": "trade"}"#;
        let BitstampFrame::Trade(trade) = parse_bitstamp(raw).unwrap() else {
            panic!("expected a trade");
        };
        assert_eq!(trade.side, TradeSide::Sell);
        assert_eq!(trade.price, 1950.5);
        assert_eq!(trade.size, 0.25);
        assert_eq!(trade.timestamp, 1_700_000_000);
    }

    #[test]
    fn test_parse_ignores_control_events() {
        let raw = r#"{"event": "bts:subscription_succeeded", "channel": "live_trades_etheur", "data": {}}"#;
        assert_eq!(parse_bitstamp(raw).unwrap(), BitstampFrame::Other);
        assert!(parse_bitstamp("not json").is_err());

        let reconnect = r#"{"event": "bts:request_reconnect", "channel": "", "data": ""}"#;
        assert_eq!(parse_bitstamp(reconnect).unwrap(), BitstampFrame::Reconnect);
    }

    #[tokio::test]
    async fn test_channel_feed_delivers_in_order() {
        let feed = ChannelFeed::new();
        let tx = feed.sender("etheur");
        for ts in 0..3 {
            tx.send(FeedTrade {
                side: TradeSide::Buy,
                price: 1.0,
                size: 1.0,
                timestamp: ts,
            })
            .await
            .unwrap();
        }
        let mut rx = feed.subscribe("etheur");
        for ts in 0..3 {
            assert_eq!(rx.recv().await.unwrap().timestamp, ts);
        }
    }

    #[tokio::test]
    async fn test_request_reconnect_opens_a_new_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            // Keep earlier connections open so only a real reconnect gets the trade.
            let mut held = Vec::new();
            for attempt in 0u32.. {
                let (tcp, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                let subscribe = ws.next().await.unwrap().unwrap();
                assert!(subscribe.to_text().unwrap().contains("live_trades_etheur"));

                let frame = if attempt == 0 {
                    r#"{"event": "bts:request_reconnect", "channel": "", "data": ""}"#.to_string()
                } else {
                    format!(
                        r#"{{"event": "trade", "channel": "live_trades_etheur", "data": {{"amount": 1.5, "price": 2000.0, "type": 0, "timestamp": "{attempt}"}}}}"#
                    )
                };
                ws.send(Message::Text(frame)).await.unwrap();
                held.push(ws);
            }
        });

        let feed = BitstampFeed::new(format!("ws://{addr}"));
        let mut rx = feed.subscribe("etheur");
        let trade = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(trade.timestamp, 1);
        assert_eq!(trade.side, TradeSide::Buy);
        assert_eq!(trade.size, 1.5);
    }
}
