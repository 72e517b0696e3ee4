//! Trade ingestion: feed -> bounded dataset + unflushed buffer -> append log.

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn};

use super::{
    append_log::AppendLog,
    feed::{FeedTrade, TradeFeed},
    window::RingBuffer,
};
use crate::{
    config::IngestConfig,
    models::{IngestStats, Trade},
};

const TRADE_CHANNEL_CAPACITY: usize = 4096;

/// Runs on the ingest loop for every accepted trade, in arrival order.
///
/// The loop waits for the sink before reading the next feed trade, so a slow sink
/// pushes back on the feed instead of losing trades.
pub trait TradeSink: Send + Sync {
    fn on_trade(&self, trade: &Trade);
}

pub struct TradeIngestor {
    instrument: String,
    log: Arc<AppendLog>,
    config: IngestConfig,
    dataset: RwLock<RingBuffer<Trade>>,
    unflushed: Mutex<Vec<Trade>>,
    flush_lock: tokio::sync::Mutex<()>,
    total_ingested: AtomicU64,
    last_trade_at: RwLock<Option<DateTime<Utc>>>,
    trade_tx: broadcast::Sender<Trade>,
}

impl TradeIngestor {
    pub fn new(instrument: impl Into<String>, log: Arc<AppendLog>, config: IngestConfig) -> Arc<Self> {
        let (trade_tx, _) = broadcast::channel(TRADE_CHANNEL_CAPACITY);
        Arc::new(Self {
            instrument: instrument.into(),
            log,
            dataset: RwLock::new(RingBuffer::new(config.dataset_capacity)),
            config,
            unflushed: Mutex::new(Vec::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            total_ingested: AtomicU64::new(0),
            last_trade_at: RwLock::new(None),
            trade_tx,
        })
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn log(&self) -> &Arc<AppendLog> {
        &self.log
    }

    /// Every trade accepted by `ingest`, in arrival order. Observers that fall more
    /// than the channel capacity behind skip trades; use a `TradeSink` for lossless delivery.
    pub fn subscribe(&self) -> broadcast::Receiver<Trade> {
        self.trade_tx.subscribe()
    }

    /// Fill the dataset from the log, bounded to its capacity. Call before `start`.
    pub async fn preload(&self) -> Result<usize> {
        let history = self
            .log
            .load_all(Some(self.config.dataset_capacity))
            .await?;
        let loaded = history.len();
        {
            let mut dataset = self.dataset.write();
            for trade in history {
                dataset.push(trade);
            }
        }
        info!(instrument = %self.instrument, loaded, "📦 dataset preloaded from log");
        Ok(loaded)
    }

    /// Accept one feed trade: buffer it for the log, keep it in memory, emit it.
    pub fn ingest(&self, raw: FeedTrade) -> Trade {
        let trade = Trade::new(self.instrument.clone(), raw.side, raw.price, raw.size, raw.timestamp);

        self.unflushed.lock().push(trade.clone());
        self.dataset.write().push(trade.clone());
        self.total_ingested.fetch_add(1, Ordering::Relaxed);
        *self.last_trade_at.write() = Some(Utc::now());

        trace!(
            instrument = %self.instrument,
            side = trade.side.as_str(),
            price = trade.price,
            "trade"
        );

        // No observers is fine: persistence already has the trade.
        let _ = self.trade_tx.send(trade.clone());
        trade
    }

    /// Persist the unflushed buffer if it reached the minimum batch size.
    ///
    /// On failure the buffer is left untouched so the next tick retries it.
    pub async fn flush(&self) -> Result<usize> {
        self.flush_with_min(self.config.min_flush_batch).await
    }

    async fn flush_with_min(&self, min_batch: usize) -> Result<usize> {
        let _guard = self.flush_lock.lock().await;

        let batch = {
            let buffer = self.unflushed.lock();
            if buffer.is_empty() || buffer.len() < min_batch {
                return Ok(0);
            }
            buffer.clone()
        };

        self.log.append(&batch).await?;

        // Only pushes happen concurrently, so the flushed prefix is still in place.
        self.unflushed.lock().drain(..batch.len());
        debug!(instrument = %self.instrument, flushed = batch.len(), "stored stream");
        Ok(batch.len())
    }

    /// The newest `n` trades in memory, oldest first.
    pub fn latest(&self, n: usize) -> Vec<Trade> {
        self.dataset.read().last_n(n)
    }

    pub fn dataset_len(&self) -> usize {
        self.dataset.read().len()
    }

    pub fn buffered_len(&self) -> usize {
        self.unflushed.lock().len()
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            instrument: self.instrument.clone(),
            buffered_count: self.buffered_len(),
            dataset_size: self.dataset_len(),
            total_ingested: self.total_ingested.load(Ordering::Relaxed),
            last_trade_at: *self.last_trade_at.read(),
            log_path: self.log.path().display().to_string(),
        }
    }

    /// Subscribe to `topic` on `feed` and start the ingest and flush loops.
    ///
    /// `sink` sees every ingested trade before the next one is read from the feed.
    pub fn start(
        self: &Arc<Self>,
        feed: &dyn TradeFeed,
        topic: &str,
        sink: Option<Arc<dyn TradeSink>>,
    ) -> IngestorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut rx = feed.subscribe(topic);

        info!(instrument = %self.instrument, topic, "starting trade stream");

        let ingest_task = {
            let ingestor = self.clone();
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        next = rx.recv() => match next {
                            Some(raw) => {
                                let trade = ingestor.ingest(raw);
                                if let Some(sink) = &sink {
                                    sink.on_trade(&trade);
                                }
                            }
                            None => {
                                warn!(instrument = %ingestor.instrument, "feed closed");
                                break;
                            }
                        },
                    }
                }
            })
        };

        let flush_task = {
            let ingestor = self.clone();
            let mut shutdown = shutdown_rx;
            tokio::spawn(async move {
                let mut tick = interval(ingestor.config.flush_interval());
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // First tick fires immediately.
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tick.tick() => {
                            if let Err(e) = ingestor.flush().await {
                                warn!(
                                    instrument = %ingestor.instrument,
                                    buffered = ingestor.buffered_len(),
                                    error = %e,
                                    "flush failed, retrying next tick"
                                );
                            }
                        }
                    }
                }
            })
        };

        IngestorHandle {
            ingestor: self.clone(),
            shutdown: shutdown_tx,
            tasks: vec![ingest_task, flush_task],
        }
    }
}

/// Running ingest loops. Dropping the handle stops them without a final flush.
pub struct IngestorHandle {
    ingestor: Arc<TradeIngestor>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl IngestorHandle {
    /// Stop the loops, release the feed subscription, and try one last flush.
    pub async fn close(self) {
        debug!(instrument = %self.ingestor.instrument, "closing");
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        if let Err(e) = self.ingestor.flush_with_min(1).await {
            warn!(instrument = %self.ingestor.instrument, error = %e, "final flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::TradeSide, stream::feed::ChannelFeed};
    use std::time::Duration;
    use tempfile::tempdir;

    fn raw(ts: i64, price: f64) -> FeedTrade {
        FeedTrade {
            side: TradeSide::Buy,
            price,
            size: 1.0,
            timestamp: ts,
        }
    }

    fn config(capacity: usize, min_batch: usize) -> IngestConfig {
        IngestConfig {
            dataset_capacity: capacity,
            flush_interval_secs: 1,
            min_flush_batch: min_batch,
        }
    }

    #[tokio::test]
    async fn test_dataset_is_bounded_and_latest_is_chronological() {
        let dir = tempdir().unwrap();
        let log = Arc::new(AppendLog::for_instrument(dir.path(), "etheur"));
        let ingestor = TradeIngestor::new("etheur", log, config(5, 1));

        for ts in 0..20 {
            ingestor.ingest(raw(ts, 100.0 + ts as f64));
        }

        assert_eq!(ingestor.dataset_len(), 5);
        assert_eq!(ingestor.buffered_len(), 20);
        let stamps: Vec<i64> = ingestor.latest(3).iter().map(|t| t.timestamp).collect();
        assert_eq!(stamps, vec![17, 18, 19]);
        assert_eq!(ingestor.stats().total_ingested, 20);
    }

    #[tokio::test]
    async fn test_flush_respects_min_batch() {
        let dir = tempdir().unwrap();
        let log = Arc::new(AppendLog::for_instrument(dir.path(), "etheur"));
        let ingestor = TradeIngestor::new("etheur", log.clone(), config(100, 3));

        ingestor.ingest(raw(1, 1.0));
        ingestor.ingest(raw(2, 2.0));
        assert_eq!(ingestor.flush().await.unwrap(), 0);
        assert!(log.load_all(None).await.unwrap().is_empty());

        ingestor.ingest(raw(3, 3.0));
        assert_eq!(ingestor.flush().await.unwrap(), 3);
        assert_eq!(ingestor.buffered_len(), 0);
        assert_eq!(log.load_all(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_buffer() {
        let dir = tempdir().unwrap();
        // A directory where the log file should be makes every append fail.
        let blocked = dir.path().join("etheur.fs");
        std::fs::create_dir_all(&blocked).unwrap();
        let log = Arc::new(AppendLog::new(&blocked));
        let ingestor = TradeIngestor::new("etheur", log, config(100, 1));

        ingestor.ingest(raw(1, 1.0));
        assert!(ingestor.flush().await.is_err());
        assert_eq!(ingestor.buffered_len(), 1);
    }

    #[tokio::test]
    async fn test_preload_bounded_to_capacity() {
        let dir = tempdir().unwrap();
        let log = Arc::new(AppendLog::for_instrument(dir.path(), "etheur"));
        let history: Vec<Trade> = (0..30)
            .map(|ts| Trade::new("etheur", TradeSide::Sell, 10.0, 1.0, ts))
            .collect();
        log.append(&history).await.unwrap();

        let ingestor = TradeIngestor::new("etheur", log, config(8, 1));
        assert_eq!(ingestor.preload().await.unwrap(), 8);
        assert_eq!(ingestor.latest(1)[0].timestamp, 29);
        assert_eq!(ingestor.buffered_len(), 0);
    }

    #[tokio::test]
    async fn test_start_emits_and_close_flushes() {
        let dir = tempdir().unwrap();
        let log = Arc::new(AppendLog::for_instrument(dir.path(), "etheur"));
        let ingestor = TradeIngestor::new("etheur", log.clone(), config(100, 1_000));
        let mut trades = ingestor.subscribe();

        let feed = ChannelFeed::new();
        let tx = feed.sender("etheur");
        let handle = ingestor.start(&feed, "etheur", None);

        for ts in 0..4 {
            tx.send(raw(ts, 50.0)).await.unwrap();
        }
        for ts in 0..4 {
            let trade = tokio::time::timeout(Duration::from_secs(2), trades.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(trade.timestamp, ts);
            assert_eq!(trade.instrument, "etheur");
        }

        // min batch is never reached by the timer; close still persists everything.
        handle.close().await;
        assert_eq!(log.load_all(None).await.unwrap().len(), 4);
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<i64>>);

    impl TradeSink for Collect {
        fn on_trade(&self, trade: &Trade) {
            self.0.lock().push(trade.timestamp);
        }
    }

    #[tokio::test]
    async fn test_sink_sees_every_trade_past_channel_capacity() {
        let dir = tempdir().unwrap();
        let log = Arc::new(AppendLog::for_instrument(dir.path(), "etheur"));
        let ingestor = TradeIngestor::new("etheur", log, config(10_000, 1_000_000));
        // An observer that never reads must not hold anything back.
        let _idle = ingestor.subscribe();

        let feed = ChannelFeed::new();
        let tx = feed.sender("etheur");
        let sink = Arc::new(Collect::default());
        let handle = ingestor.start(&feed, "etheur", Some(sink.clone()));

        let burst = TRADE_CHANNEL_CAPACITY as i64 + 904;
        for ts in 0..burst {
            tx.send(raw(ts, 1.0)).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(10), async {
            while sink.0.lock().len() < burst as usize {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let seen = sink.0.lock().clone();
        assert_eq!(seen, (0..burst).collect::<Vec<_>>());
        handle.close().await;
    }
}
