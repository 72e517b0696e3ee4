//! Append-only trade log
//!
//! One file per instrument. Each record is a compact JSON trade followed by `\n`.
//! Compact JSON escapes newlines inside strings, so a record never contains the
//! delimiter and a torn trailing record can always be skipped on load.

use anyhow::{Context, Result};
use std::{
    collections::VecDeque,
    io::SeekFrom,
    path::{Path, PathBuf},
};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::Mutex,
};
use tracing::{debug, warn};

use crate::models::Trade;

pub const RECORD_DELIMITER: u8 = b'\n';

pub struct AppendLog {
    path: PathBuf,
    /// Serializes appends; holds whether the file may end without a delimiter.
    write_state: Mutex<WriteState>,
}

#[derive(Default)]
struct WriteState {
    checked_tail: bool,
}

impl AppendLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_state: Mutex::new(WriteState::default()),
        }
    }

    /// Log for `symbol` inside `dir` (`<dir>/<symbol>.fs`)
    pub fn for_instrument(dir: impl AsRef<Path>, symbol: &str) -> Self {
        Self::new(dir.as_ref().join(format!("{symbol}.fs")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `records` in one sequential write. Creates the file on first use.
    pub async fn append(&self, records: &[Trade]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut state = self.write_state.lock().await;

        let mut buf = Vec::with_capacity(records.len() * 96);
        if !state.checked_tail && self.ends_torn().await? {
            warn!(path = %self.path.display(), "log tail is torn, isolating it before append");
            buf.push(RECORD_DELIMITER);
        }

        for record in records {
            serde_json::to_writer(&mut buf, record).context("encode trade record")?;
            buf.push(RECORD_DELIMITER);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("create log dir {}", parent.display()))?;
            }
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open log {}", self.path.display()))?;
        file.write_all(&buf)
            .await
            .with_context(|| format!("append to log {}", self.path.display()))?;
        file.flush().await?;
        file.sync_data().await?;

        state.checked_tail = true;
        debug!(path = %self.path.display(), records = records.len(), "appended trades");
        Ok(())
    }

    /// Load every decodable record. With `max_entries`, only the newest are kept.
    pub async fn load_all(&self, max_entries: Option<usize>) -> Result<Vec<Trade>> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("read log {}", self.path.display()));
            }
        };

        debug!(
            path = %self.path.display(),
            kb = data.len() as f64 / 1000.0,
            "stream loaded"
        );
        Ok(decode_records(&data, max_entries, &self.path))
    }

    /// Whether the file ends without a delimiter. Only the last byte is read.
    async fn ends_torn(&self) -> Result<bool> {
        let mut file = match fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(e).with_context(|| format!("inspect log {}", self.path.display()));
            }
        };
        let len = file
            .metadata()
            .await
            .with_context(|| format!("inspect log {}", self.path.display()))?
            .len();
        if len == 0 {
            return Ok(false);
        }
        file.seek(SeekFrom::End(-1))
            .await
            .with_context(|| format!("seek log tail {}", self.path.display()))?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last)
            .await
            .with_context(|| format!("read log tail {}", self.path.display()))?;
        Ok(last[0] != RECORD_DELIMITER)
    }
}

fn decode_records(data: &[u8], max_entries: Option<usize>, path: &Path) -> Vec<Trade> {
    let cap = max_entries.unwrap_or(usize::MAX);
    let mut out: VecDeque<Trade> = VecDeque::new();
    let mut skipped = 0usize;

    for segment in data.split(|b| *b == RECORD_DELIMITER) {
        if segment.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<Trade>(segment) {
            Ok(trade) => {
                if cap == 0 {
                    continue;
                }
                if out.len() >= cap {
                    out.pop_front();
                }
                out.push_back(trade);
            }
            Err(e) => {
                skipped += 1;
                warn!(path = %path.display(), error = %e, "skipping undecodable log record");
            }
        }
    }

    if skipped > 0 {
        warn!(path = %path.display(), skipped, "log contained corrupt records");
    }

    out.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeSide;
    use tempfile::tempdir;

    fn trade(ts: i64, price: f64) -> Trade {
        Trade::new("etheur", TradeSide::Buy, price, 0.5, ts)
    }

    #[tokio::test]
    async fn test_missing_log_is_empty() {
        let dir = tempdir().unwrap();
        let log = AppendLog::for_instrument(dir.path(), "etheur");
        assert!(log.load_all(None).await.unwrap().is_empty());
        assert!(!log.path().exists());
    }

    #[tokio::test]
    async fn test_append_creates_and_loads_in_order() {
        let dir = tempdir().unwrap();
        let log = AppendLog::for_instrument(dir.path().join("nested"), "etheur");

        log.append(&[trade(1, 100.0), trade(2, 101.0)]).await.unwrap();
        log.append(&[trade(3, 99.0)]).await.unwrap();

        let loaded = log.load_all(None).await.unwrap();
        let stamps: Vec<i64> = loaded.iter().map(|t| t.timestamp).collect();
        assert_eq!(stamps, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_max_entries_keeps_newest() {
        let dir = tempdir().unwrap();
        let log = AppendLog::for_instrument(dir.path(), "etheur");
        let batch: Vec<Trade> = (0..50).map(|i| trade(i, 100.0 + i as f64)).collect();
        log.append(&batch).await.unwrap();

        let loaded = log.load_all(Some(5)).await.unwrap();
        let stamps: Vec<i64> = loaded.iter().map(|t| t.timestamp).collect();
        assert_eq!(stamps, vec![45, 46, 47, 48, 49]);
    }

    #[tokio::test]
    async fn test_torn_tail_is_skipped() {
        let dir = tempdir().unwrap();
        let log = AppendLog::for_instrument(dir.path(), "etheur");
        log.append(&[trade(1, 100.0), trade(2, 101.0)]).await.unwrap();

        // Simulate a crash halfway through the third record
        let full = serde_json::to_string(&trade(3, 102.0)).unwrap();
        let torn = &full[..full.len() / 2];
        let mut raw = std::fs::read(log.path()).unwrap();
        raw.extend_from_slice(torn.as_bytes());
        std::fs::write(log.path(), raw).unwrap();

        let loaded = log.load_all(None).await.unwrap();
        assert_eq!(loaded.len(), 2);

        // A fresh writer must not glue the next record onto the torn one
        let reopened = AppendLog::for_instrument(dir.path(), "etheur");
        reopened.append(&[trade(4, 103.0)]).await.unwrap();
        let stamps: Vec<i64> = reopened
            .load_all(None)
            .await
            .unwrap()
            .iter()
            .map(|t| t.timestamp)
            .collect();
        assert_eq!(stamps, vec![1, 2, 4]);
    }

    #[tokio::test]
    async fn test_tail_check_reads_last_byte_only() {
        let dir = tempdir().unwrap();
        let log = AppendLog::for_instrument(dir.path(), "etheur");
        assert!(!log.ends_torn().await.unwrap());

        std::fs::write(log.path(), b"").unwrap();
        assert!(!log.ends_torn().await.unwrap());

        // A large clean log followed by one stray byte
        let mut raw = Vec::new();
        for i in 0..20_000 {
            raw.extend_from_slice(serde_json::to_string(&trade(i, 1.0)).unwrap().as_bytes());
            raw.push(RECORD_DELIMITER);
        }
        std::fs::write(log.path(), &raw).unwrap();
        assert!(!log.ends_torn().await.unwrap());

        raw.push(b'{');
        std::fs::write(log.path(), &raw).unwrap();
        assert!(log.ends_torn().await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_middle_record_does_not_abort_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("etheur.fs");
        let good_a = serde_json::to_string(&trade(1, 1.0)).unwrap();
        let good_b = serde_json::to_string(&trade(2, 2.0)).unwrap();
        std::fs::write(&path, format!("{good_a}\n{{\"price\": oops}}\n\n{good_b}\n")).unwrap();

        let loaded = AppendLog::new(&path).load_all(None).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].timestamp, 2);
    }

    #[tokio::test]
    async fn test_concurrent_appends_stay_whole() {
        let dir = tempdir().unwrap();
        let log = std::sync::Arc::new(AppendLog::for_instrument(dir.path(), "etheur"));

        let mut handles = Vec::new();
        for worker in 0..8i64 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                let batch: Vec<Trade> = (0..25).map(|i| trade(worker * 100 + i, 1.0)).collect();
                log.append(&batch).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(log.load_all(None).await.unwrap().len(), 200);
    }
}
