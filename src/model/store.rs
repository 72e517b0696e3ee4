//! On-disk model files and the live instrument -> model map.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
};
use tokio::fs;
use tracing::{debug, info};

use super::{ModelTrainer, Predictor};

/// Model files at `<dir>/<symbol>.nn`
pub struct ModelStore {
    dir: PathBuf,
    trainer: Arc<dyn ModelTrainer>,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>, trainer: Arc<dyn ModelTrainer>) -> Self {
        Self {
            dir: dir.into(),
            trainer,
        }
    }

    pub fn path_for(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{symbol}.nn"))
    }

    pub fn trainer(&self) -> &Arc<dyn ModelTrainer> {
        &self.trainer
    }

    pub async fn load(&self, symbol: &str) -> Result<Arc<dyn Predictor>> {
        let path = self.path_for(symbol);
        debug!(instrument = symbol, "loading net");
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("read model {}", path.display()))?;
        debug!(instrument = symbol, kb = bytes.len() as f64 / 1000.0, "net loaded");
        self.trainer.load(&bytes)
    }

    /// Write through a temp file so a crash never leaves a half-written model.
    pub async fn save(&self, symbol: &str, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create model dir {}", self.dir.display()))?;
        let path = self.path_for(symbol);
        let tmp = path.with_extension("nn.tmp");
        fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("write model {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("install model {}", path.display()))?;
        info!(instrument = symbol, path = %path.display(), "saved net");
        Ok(())
    }
}

/// Models currently used for inference, swapped in place after training.
#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<String, Arc<dyn Predictor>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &str) -> Option<Arc<dyn Predictor>> {
        self.models.read().get(symbol).cloned()
    }

    pub fn install(&self, symbol: &str, model: Arc<dyn Predictor>) {
        self.models.write().insert(symbol.to_string(), model);
    }

    pub fn loaded(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.models.read().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Load whatever models exist on disk. Missing or broken files are skipped.
    pub async fn load_available(&self, store: &ModelStore, symbols: &[String]) -> usize {
        let mut loaded = 0;
        for symbol in symbols {
            match store.load(symbol).await {
                Ok(model) => {
                    self.install(symbol, model);
                    info!(instrument = %symbol, "net loaded successfully");
                    loaded += 1;
                }
                Err(e) => debug!(instrument = %symbol, error = %e, "failed to load net"),
            }
        }
        loaded
    }
}
