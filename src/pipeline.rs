//! Per-instrument processing: every ingested trade flows through the window, the drift
//! engine and the constant cache, and whatever changed is published to subscribers.

use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tracing::{info, warn};

use crate::{
    broadcast::{BootstrapSource, BroadcastHub},
    config::{AppConfig, InstrumentDescriptor},
    drift::{ConstantPredictionCache, DriftEngine, PerformanceStats},
    model::{ModelRegistry, ModelStore, TrainError, TrainReport, TrainingSupervisor},
    models::{ConstantPrediction, DriftRecord, IngestStats, PerformanceSample, Trade, WsEnvelope, WsEvent},
    stream::{AppendLog, IngestorHandle, SlidingWindowBuffer, TradeFeed, TradeIngestor, TradeSink},
};

/// Everything owned for one tracked instrument
pub struct InstrumentPipeline {
    pub descriptor: InstrumentDescriptor,
    pub ingestor: Arc<TradeIngestor>,
    drift: Mutex<DriftEngine>,
}

impl InstrumentPipeline {
    pub fn drift_records(&self) -> Vec<DriftRecord> {
        self.drift.lock().records()
    }

    pub fn performance_history(&self) -> Vec<PerformanceSample> {
        self.drift.lock().performance_history()
    }

    pub fn performance_stats(&self) -> PerformanceStats {
        self.drift.lock().performance_stats()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamReport {
    pub ingest: IngestStats,
    pub model_loaded: bool,
    pub training: bool,
    pub constant_predictions: Vec<ConstantPrediction>,
    pub drift_records: Vec<DriftRecord>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentStats {
    pub instrument: String,
    pub pending_drifts: usize,
    #[serde(flatten)]
    pub performance: PerformanceStats,
}

pub struct Pipeline {
    config: AppConfig,
    instruments: Vec<Arc<InstrumentPipeline>>,
    by_symbol: HashMap<String, usize>,
    window: SlidingWindowBuffer,
    constants: ConstantPredictionCache,
    registry: Arc<ModelRegistry>,
    store: Arc<ModelStore>,
    supervisor: TrainingSupervisor,
    hub: Arc<BroadcastHub>,
}

impl Pipeline {
    pub fn new(config: AppConfig, store: Arc<ModelStore>) -> Arc<Self> {
        let mut instruments = Vec::with_capacity(config.instruments.len());
        let mut by_symbol = HashMap::new();
        for descriptor in &config.instruments {
            if by_symbol.contains_key(&descriptor.symbol) {
                warn!(instrument = %descriptor.symbol, "duplicate instrument in config, ignoring");
                continue;
            }
            let log = Arc::new(AppendLog::for_instrument(
                &config.storage.streams_dir,
                &descriptor.symbol,
            ));
            let ingestor = TradeIngestor::new(descriptor.symbol.clone(), log, config.ingest.clone());
            let drift = DriftEngine::new(descriptor.clone(), config.drift.clone());
            by_symbol.insert(descriptor.symbol.clone(), instruments.len());
            instruments.push(Arc::new(InstrumentPipeline {
                descriptor: descriptor.clone(),
                ingestor,
                drift: Mutex::new(drift),
            }));
        }

        let registry = Arc::new(ModelRegistry::new());
        let supervisor = TrainingSupervisor::new(store.clone(), registry.clone(), config.drift.window_size);
        let hub = Arc::new(BroadcastHub::new(
            config.broadcast.subscriber_queue,
            config.broadcast.bootstrap_trades,
        ));

        Arc::new(Self {
            window: SlidingWindowBuffer::new(config.drift.window_size),
            constants: ConstantPredictionCache::new(&config.constant, config.drift.step_secs),
            config,
            instruments,
            by_symbol,
            registry,
            store,
            supervisor,
            hub,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &TrainingSupervisor {
        &self.supervisor
    }

    pub fn pipelines(&self) -> &[Arc<InstrumentPipeline>] {
        &self.instruments
    }

    pub fn instrument(&self, symbol: &str) -> Option<&Arc<InstrumentPipeline>> {
        self.by_symbol.get(symbol).map(|i| &self.instruments[*i])
    }

    pub fn symbols(&self) -> Vec<String> {
        self.instruments.iter().map(|p| p.descriptor.symbol.clone()).collect()
    }

    /// Load persisted trades and models, and prime the window and bootstrap history.
    pub async fn preload(&self) -> Result<()> {
        for pipeline in &self.instruments {
            let symbol = pipeline.descriptor.symbol.as_str();
            pipeline.ingestor.preload().await?;
            self.window
                .prefill(symbol, pipeline.ingestor.latest(self.config.drift.window_size));
            self.hub
                .seed_trades(symbol, &pipeline.ingestor.latest(self.config.broadcast.bootstrap_trades));
        }
        let loaded = self.registry.load_available(&self.store, &self.symbols()).await;
        info!(loaded, total = self.instruments.len(), "🧠 nets loaded");
        Ok(())
    }

    /// Run one trade through the window, drift engine and constant cache, then publish.
    pub fn process_trade(&self, pipeline: &InstrumentPipeline, trade: &Trade) {
        let symbol = pipeline.descriptor.symbol.as_str();
        self.window.append(symbol, trade.clone());
        let window = self.window.get(symbol);
        let predictor = if self.window.is_full(symbol) {
            self.registry.get(symbol)
        } else {
            None
        };

        let update = pipeline
            .drift
            .lock()
            .on_trade(trade, &window, predictor.as_deref());

        self.hub
            .publish(&WsEnvelope::new(symbol, WsEvent::Trade(trade.clone())));
        for (record, sample) in update.resolved {
            self.hub
                .publish(&WsEnvelope::new(symbol, WsEvent::DriftResolved(record)));
            self.hub
                .publish(&WsEnvelope::new(symbol, WsEvent::Performance(sample)));
        }
        if let Some(record) = update.created {
            self.hub
                .publish(&WsEnvelope::new(symbol, WsEvent::DriftCreated(record)));
        }
        if let Some(forecast) = update.forecast {
            if let Some(points) =
                self.constants
                    .maybe_snapshot(symbol, &forecast.curve, forecast.anchor_timestamp)
            {
                self.hub
                    .publish(&WsEnvelope::new(symbol, WsEvent::ConstantForecast(points)));
            }
        }
    }

    /// Start the ingest loops. Each trade runs through `process_trade` on its ingest
    /// loop before the next one is read, so the per-trade path never skips a trade.
    pub fn start(self: &Arc<Self>, feed: &dyn TradeFeed) -> PipelineHandle {
        let ingestors = self
            .instruments
            .iter()
            .map(|pipeline| {
                let sink: Arc<dyn TradeSink> = Arc::new(PipelineSink {
                    pipeline: self.clone(),
                    instrument: pipeline.clone(),
                });
                pipeline
                    .ingestor
                    .start(feed, pipeline.descriptor.topic(), Some(sink))
            })
            .collect();
        PipelineHandle { ingestors }
    }

    pub fn streams(&self) -> HashMap<String, StreamReport> {
        self.instruments
            .iter()
            .map(|p| (p.descriptor.symbol.clone(), self.stream_report(p)))
            .collect()
    }

    pub fn stream_report(&self, pipeline: &InstrumentPipeline) -> StreamReport {
        let symbol = pipeline.descriptor.symbol.as_str();
        StreamReport {
            ingest: pipeline.ingestor.stats(),
            model_loaded: self.registry.get(symbol).is_some(),
            training: self.supervisor.is_training(symbol),
            constant_predictions: self.constants.latest(symbol),
            drift_records: pipeline.drift_records(),
        }
    }

    pub fn stats(&self) -> Vec<InstrumentStats> {
        self.instruments
            .iter()
            .map(|p| {
                let drift = p.drift.lock();
                InstrumentStats {
                    instrument: p.descriptor.symbol.clone(),
                    pending_drifts: drift.pending_count(),
                    performance: drift.performance_stats(),
                }
            })
            .collect()
    }

    pub fn reset_stats(&self) {
        for pipeline in &self.instruments {
            pipeline.drift.lock().reset_performance();
        }
        info!("performance counters reset");
    }

    /// Train a fresh model for `symbol` from its persisted log.
    pub async fn train(&self, pipeline: &InstrumentPipeline) -> Result<TrainReport, TrainError> {
        // Make sure the freshest trades are on disk first.
        if let Err(e) = pipeline.ingestor.flush().await {
            warn!(instrument = %pipeline.descriptor.symbol, error = %e, "flush before training failed");
        }
        self.supervisor
            .submit(&pipeline.descriptor, pipeline.ingestor.log())
            .await
    }
}

impl BootstrapSource for Pipeline {
    fn instruments(&self) -> Vec<String> {
        self.symbols()
    }

    fn performance_history(&self, instrument: &str) -> Vec<PerformanceSample> {
        self.instrument(instrument)
            .map(|p| p.performance_history())
            .unwrap_or_default()
    }

    fn constant_predictions(&self, instrument: &str) -> Vec<ConstantPrediction> {
        self.constants.latest(instrument)
    }
}

/// Feeds one instrument's ingested trades through the pipeline.
struct PipelineSink {
    pipeline: Arc<Pipeline>,
    instrument: Arc<InstrumentPipeline>,
}

impl TradeSink for PipelineSink {
    fn on_trade(&self, trade: &Trade) {
        self.pipeline.process_trade(&self.instrument, trade);
    }
}

/// Running ingest loops
pub struct PipelineHandle {
    ingestors: Vec<IngestorHandle>,
}

impl PipelineHandle {
    /// Stop feeds and timers, with a final flush each.
    pub async fn close(self) {
        for ingestor in self.ingestors {
            ingestor.close().await;
        }
        info!("pipelines closed");
    }
}
