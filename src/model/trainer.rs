//! Training jobs: one in flight per instrument, run off the async workers.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::{collections::HashSet, sync::Arc};
use thiserror::Error;
use tracing::{info, warn};

use super::{build_dataset, ModelRegistry, ModelStore};
use crate::{config::InstrumentDescriptor, stream::AppendLog};

#[derive(Debug, Error)]
pub enum TrainError {
    /// Retriable: another job for the instrument is still running.
    #[error("training already in progress for {0}")]
    Conflict(String),
    #[error("not enough data to train {instrument}: {trades} trades on disk")]
    NoData { instrument: String, trades: usize },
    #[error("training failed for {instrument}: {reason}")]
    Failed { instrument: String, reason: String },
}

impl TrainError {
    fn failed(instrument: &str, reason: impl std::fmt::Display) -> Self {
        TrainError::Failed {
            instrument: instrument.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainReport {
    pub instrument: String,
    pub trades: usize,
    pub samples: usize,
    pub trained_at: DateTime<Utc>,
}

pub struct TrainingSupervisor {
    store: Arc<ModelStore>,
    registry: Arc<ModelRegistry>,
    window: usize,
    in_flight: Mutex<HashSet<String>>,
}

/// Releases the instrument's slot however the job ends.
struct FlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    symbol: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.symbol);
    }
}

impl TrainingSupervisor {
    pub fn new(store: Arc<ModelStore>, registry: Arc<ModelRegistry>, window: usize) -> Self {
        Self {
            store,
            registry,
            window,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_training(&self, symbol: &str) -> bool {
        self.in_flight.lock().contains(symbol)
    }

    pub fn running(&self) -> Vec<String> {
        let mut running: Vec<String> = self.in_flight.lock().iter().cloned().collect();
        running.sort();
        running
    }

    fn acquire(&self, symbol: &str) -> Result<FlightGuard<'_>, TrainError> {
        let mut in_flight = self.in_flight.lock();
        if !in_flight.insert(symbol.to_string()) {
            return Err(TrainError::Conflict(symbol.to_string()));
        }
        Ok(FlightGuard {
            in_flight: &self.in_flight,
            symbol: symbol.to_string(),
        })
    }

    /// Train from the persisted log, save the model, and swap it into the registry.
    ///
    /// Concurrent requests for the same instrument are rejected, never queued.
    pub async fn submit(
        &self,
        descriptor: &InstrumentDescriptor,
        log: &AppendLog,
    ) -> Result<TrainReport, TrainError> {
        let symbol = descriptor.symbol.as_str();
        let _guard = self.acquire(symbol)?;
        info!(instrument = symbol, "🧠 training started");

        let trades = log
            .load_all(None)
            .await
            .map_err(|e| TrainError::failed(symbol, format!("{e:#}")))?;
        let rows = build_dataset(&trades, self.window, descriptor);
        if rows.is_empty() {
            return Err(TrainError::NoData {
                instrument: symbol.to_string(),
                trades: trades.len(),
            });
        }
        let samples = rows.len();

        let trainer = self.store.trainer().clone();
        let bytes = tokio::task::spawn_blocking(move || trainer.train(&rows))
            .await
            .map_err(|e| TrainError::failed(symbol, format!("training worker aborted: {e}")))?
            .map_err(|e| TrainError::failed(symbol, format!("{e:#}")))?;

        let model = self
            .store
            .trainer()
            .load(&bytes)
            .map_err(|e| TrainError::failed(symbol, format!("{e:#}")))?;
        if let Err(e) = self.store.save(symbol, &bytes).await {
            // The model is still usable in memory; it just won't survive a restart.
            warn!(instrument = symbol, error = %e, "failed to persist trained net");
        }
        self.registry.install(symbol, model);

        info!(instrument = symbol, samples, "training done");
        Ok(TrainReport {
            instrument: symbol.to_string(),
            trades: trades.len(),
            samples,
            trained_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{LinearTrainer, ModelTrainer, Predictor, TrainingRow},
        models::{Trade, TradeSide},
    };
    use std::{sync::Arc, time::Duration};
    use tempfile::tempdir;

    struct SlowTrainer;

    impl ModelTrainer for SlowTrainer {
        fn train(&self, rows: &[TrainingRow]) -> anyhow::Result<Vec<u8>> {
            std::thread::sleep(Duration::from_millis(300));
            LinearTrainer::default().train(rows)
        }

        fn load(&self, bytes: &[u8]) -> anyhow::Result<Arc<dyn Predictor>> {
            LinearTrainer::default().load(bytes)
        }
    }

    struct BrokenTrainer;

    impl ModelTrainer for BrokenTrainer {
        fn train(&self, _rows: &[TrainingRow]) -> anyhow::Result<Vec<u8>> {
            anyhow::bail!("diverged")
        }

        fn load(&self, _bytes: &[u8]) -> anyhow::Result<Arc<dyn Predictor>> {
            anyhow::bail!("nothing to load")
        }
    }

    struct PanickingTrainer;

    impl ModelTrainer for PanickingTrainer {
        fn train(&self, _rows: &[TrainingRow]) -> anyhow::Result<Vec<u8>> {
            panic!("singular matrix")
        }

        fn load(&self, bytes: &[u8]) -> anyhow::Result<Arc<dyn Predictor>> {
            LinearTrainer::default().load(bytes)
        }
    }

    async fn seeded_log(dir: &std::path::Path, n: i64) -> AppendLog {
        let log = AppendLog::for_instrument(dir, "etheur");
        let trades: Vec<Trade> = (0..n)
            .map(|i| {
                let price = 2_000.0 + (i as f64 * 0.7).sin() * 15.0 + (i % 7) as f64;
                Trade::new("etheur", TradeSide::Buy, price, 1.0, i)
            })
            .collect();
        log.append(&trades).await.unwrap();
        log
    }

    fn supervisor(dir: &std::path::Path, trainer: Arc<dyn ModelTrainer>) -> (Arc<TrainingSupervisor>, Arc<ModelRegistry>) {
        let store = Arc::new(ModelStore::new(dir.join("nets"), trainer));
        let registry = Arc::new(ModelRegistry::new());
        (
            Arc::new(TrainingSupervisor::new(store, registry.clone(), 10)),
            registry,
        )
    }

    #[tokio::test]
    async fn test_train_installs_model() {
        let dir = tempdir().unwrap();
        let log = seeded_log(dir.path(), 400).await;
        let (sup, registry) = supervisor(dir.path(), Arc::new(LinearTrainer::default()));
        let eth = InstrumentDescriptor::new("etheur", 1_000.0);

        let report = sup.submit(&eth, &log).await.unwrap();
        assert_eq!(report.samples, 20);
        assert!(registry.get("etheur").is_some());
        assert!(dir.path().join("nets").join("etheur.nn").exists());
        assert!(!sup.is_training("etheur"));
    }

    #[tokio::test]
    async fn test_concurrent_request_is_rejected() {
        let dir = tempdir().unwrap();
        let log = Arc::new(seeded_log(dir.path(), 200).await);
        let (sup, _registry) = supervisor(dir.path(), Arc::new(SlowTrainer));
        let eth = InstrumentDescriptor::new("etheur", 1_000.0);

        let first = {
            let sup = sup.clone();
            let log = log.clone();
            let eth = eth.clone();
            tokio::spawn(async move { sup.submit(&eth, &log).await })
        };
        // Let the first job claim the slot.
        while !sup.is_training("etheur") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let second = sup.submit(&eth, &log).await;
        assert!(matches!(second, Err(TrainError::Conflict(_))));

        assert!(first.await.unwrap().is_ok());
        // Slot is free again afterwards
        assert!(sup.submit(&eth, &log).await.is_ok());
    }

    #[tokio::test]
    async fn test_failures_are_surfaced() {
        let dir = tempdir().unwrap();
        let eth = InstrumentDescriptor::new("etheur", 1_000.0);

        let (sup, registry) = supervisor(dir.path(), Arc::new(BrokenTrainer));
        let empty = AppendLog::for_instrument(dir.path().join("empty"), "etheur");
        assert!(matches!(
            sup.submit(&eth, &empty).await,
            Err(TrainError::NoData { trades: 0, .. })
        ));

        let log = seeded_log(dir.path(), 100).await;
        assert!(matches!(
            sup.submit(&eth, &log).await,
            Err(TrainError::Failed { .. })
        ));
        assert!(registry.get("etheur").is_none());
        assert!(sup.running().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_trainer_is_contained() {
        let dir = tempdir().unwrap();
        let log = seeded_log(dir.path(), 100).await;
        let eth = InstrumentDescriptor::new("etheur", 1_000.0);

        let (sup, registry) = supervisor(dir.path(), Arc::new(PanickingTrainer));
        match sup.submit(&eth, &log).await {
            Err(TrainError::Failed { instrument, reason }) => {
                assert_eq!(instrument, "etheur");
                assert!(reason.contains("training worker aborted"));
            }
            other => panic!("expected a training failure, got {other:?}"),
        }
        assert!(!sup.is_training("etheur"));
        assert!(registry.get("etheur").is_none());

        // The slot was released: the next job runs instead of conflicting.
        assert!(matches!(
            sup.submit(&eth, &log).await,
            Err(TrainError::Failed { .. })
        ));
    }
}
