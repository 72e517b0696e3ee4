use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trade direction as reported by the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }
}

/// A single executed trade on one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub instrument: String,
    pub side: TradeSide,
    pub price: f64,
    pub size: f64,
    /// Unix seconds
    pub timestamp: i64,
}

impl Trade {
    pub fn new(instrument: impl Into<String>, side: TradeSide, price: f64, size: f64, timestamp: i64) -> Self {
        Self {
            instrument: instrument.into(),
            side,
            price,
            size,
            timestamp,
        }
    }
}

/// Outcome of a resolved drift forecast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftRating {
    Good,
    Ok,
    Bad,
    Unset,
}

impl DriftRating {
    pub fn as_str(&self) -> &str {
        match self {
            DriftRating::Good => "good",
            DriftRating::Ok => "ok",
            DriftRating::Bad => "bad",
            DriftRating::Unset => "unset",
        }
    }

    /// Given the forecast and the realized movement, rate the forecast.
    ///
    /// A downward forecast is bad when the price went up and good when it fell further
    /// than forecast; an upward forecast mirrors that.
    pub fn rate(predicted_drift: f64, realized_drift: f64) -> Self {
        if predicted_drift < 0.0 {
            if realized_drift > 0.0 {
                DriftRating::Bad
            } else if realized_drift < predicted_drift {
                DriftRating::Good
            } else {
                DriftRating::Ok
            }
        } else if realized_drift < 0.0 {
            DriftRating::Bad
        } else if realized_drift > predicted_drift {
            DriftRating::Good
        } else {
            DriftRating::Ok
        }
    }
}

/// A drift forecast. Pending until a trade reaches `target_timestamp`, then resolved once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftRecord {
    pub id: Uuid,
    pub instrument: String,
    pub predicted_drift: f64,
    /// Unix seconds of the trade that produced the forecast
    pub created_at: i64,
    pub target_timestamp: i64,
    pub baseline_price: f64,
    pub forecast_price: f64,
    pub processed: bool,
    pub resolved_at: Option<i64>,
    pub resolved_price: Option<f64>,
    pub realized_drift: Option<f64>,
    pub rating: DriftRating,
}

impl DriftRecord {
    pub fn pending(
        instrument: impl Into<String>,
        baseline: &Trade,
        forecast_price: f64,
        target_timestamp: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            instrument: instrument.into(),
            predicted_drift: forecast_price - baseline.price,
            created_at: baseline.timestamp,
            target_timestamp,
            baseline_price: baseline.price,
            forecast_price,
            processed: false,
            resolved_at: None,
            resolved_price: None,
            realized_drift: None,
            rating: DriftRating::Unset,
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.processed
    }

    /// Resolve against the maturing trade. Returns false if already resolved.
    pub fn resolve(&mut self, trade: &Trade) -> bool {
        if self.processed {
            return false;
        }
        let realized = trade.price - self.baseline_price;
        self.processed = true;
        self.resolved_at = Some(trade.timestamp);
        self.resolved_price = Some(trade.price);
        self.realized_drift = Some(realized);
        self.rating = DriftRating::rate(self.predicted_drift, realized);
        true
    }
}

/// Running forecast-vs-realized comparison, appended on every resolution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSample {
    pub timestamp: i64,
    pub cumulative_expected: f64,
    pub cumulative_realized: f64,
}

/// One point of a frozen forecast curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConstantPrediction {
    pub timestamp: i64,
    pub price: f64,
}

/// Event pushed to websocket subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WsEvent {
    Trade(Trade),
    ConstantForecast(Vec<ConstantPrediction>),
    DriftCreated(DriftRecord),
    DriftResolved(DriftRecord),
    Performance(PerformanceSample),
}

/// Wire envelope: `{"instrument": ..., "<event>": ...}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEnvelope {
    pub instrument: String,
    #[serde(flatten)]
    pub event: WsEvent,
}

impl WsEnvelope {
    pub fn new(instrument: impl Into<String>, event: WsEvent) -> Self {
        Self {
            instrument: instrument.into(),
            event,
        }
    }
}

/// Message a client may send over the socket. Anything else is logged and ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsClientMessage {
    Ping {
        #[serde(default)]
        timestamp: Option<i64>,
    },
    Hello {
        #[serde(default)]
        message: Option<String>,
    },
}

/// Snapshot of an ingestor for the admin api
#[derive(Debug, Clone, Serialize)]
pub struct IngestStats {
    pub instrument: String,
    pub buffered_count: usize,
    pub dataset_size: usize,
    pub total_ingested: u64,
    pub last_trade_at: Option<DateTime<Utc>>,
    pub log_path: String,
}
