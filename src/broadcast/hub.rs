//! Subscriber registry and fan-out.
//!
//! Every subscriber owns a bounded outbound queue drained by its socket task. Publishing
//! never awaits: a full or closed queue only affects that subscriber.

use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    models::{ConstantPrediction, PerformanceSample, Trade, WsEnvelope, WsEvent},
    stream::RingBuffer,
};

/// What a socket task should do next
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(Arc<str>),
    Ping,
    Close,
}

/// Per-instrument state a new subscriber is primed with, besides recent trades.
pub trait BootstrapSource: Send + Sync {
    fn instruments(&self) -> Vec<String>;
    fn performance_history(&self, instrument: &str) -> Vec<PerformanceSample>;
    fn constant_predictions(&self, instrument: &str) -> Vec<ConstantPrediction>;
}

pub struct Subscription {
    pub id: Uuid,
    pub rx: mpsc::Receiver<Outbound>,
    /// Send these before anything from `rx`
    pub snapshot: Vec<Arc<str>>,
}

struct Subscriber {
    tx: mpsc::Sender<Outbound>,
    alive: bool,
}

#[derive(Default)]
struct HubState {
    subscribers: HashMap<Uuid, Subscriber>,
    recent_trades: HashMap<String, RingBuffer<Trade>>,
}

pub struct BroadcastHub {
    state: Mutex<HubState>,
    queue_size: usize,
    bootstrap_trades: usize,
}

impl BroadcastHub {
    pub fn new(queue_size: usize, bootstrap_trades: usize) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            queue_size: queue_size.max(1),
            bootstrap_trades: bootstrap_trades.max(1),
        }
    }

    /// Register a subscriber and snapshot what it has missed.
    ///
    /// Registration and the trade snapshot happen under one lock, so every trade lands
    /// either in the snapshot or in the queue, never both.
    pub fn connect(&self, source: &dyn BootstrapSource) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_size);
        let id = Uuid::new_v4();

        let mut snapshot = Vec::new();
        let mut state = self.state.lock();
        for instrument in source.instruments() {
            if let Some(trades) = state.recent_trades.get(&instrument) {
                for trade in trades.iter() {
                    push_encoded(&mut snapshot, &instrument, WsEvent::Trade(trade.clone()));
                }
            }
            for sample in source.performance_history(&instrument) {
                push_encoded(&mut snapshot, &instrument, WsEvent::Performance(sample));
            }
        }
        state.subscribers.insert(id, Subscriber { tx, alive: true });
        let count = state.subscribers.len();
        drop(state);

        info!(subscriber = %id, subscribers = count, "🔌 subscriber connected");
        Subscription { id, rx, snapshot }
    }

    pub fn disconnect(&self, id: Uuid) -> bool {
        let removed = self.state.lock().subscribers.remove(&id).is_some();
        if removed {
            info!(subscriber = %id, "subscriber disconnected");
        }
        removed
    }

    pub fn mark_alive(&self, id: Uuid) {
        if let Some(sub) = self.state.lock().subscribers.get_mut(&id) {
            sub.alive = true;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Seed the trade history used for bootstrap, e.g. from the persisted log.
    pub fn seed_trades(&self, instrument: &str, trades: &[Trade]) {
        let mut state = self.state.lock();
        let ring = recent_ring(&mut state, instrument, self.bootstrap_trades);
        for trade in trades {
            ring.push(trade.clone());
        }
    }

    /// Serialize once and hand the frame to every subscriber. Returns how many took it.
    pub fn publish(&self, envelope: &WsEnvelope) -> usize {
        let text: Arc<str> = match serde_json::to_string(envelope) {
            Ok(text) => text.into(),
            Err(e) => {
                warn!(instrument = %envelope.instrument, error = %e, "failed to serialize ws event");
                return 0;
            }
        };

        let mut state = self.state.lock();
        if let WsEvent::Trade(trade) = &envelope.event {
            recent_ring(&mut state, &envelope.instrument, self.bootstrap_trades).push(trade.clone());
        }

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, sub) in &state.subscribers {
            match sub.tx.try_send(Outbound::Text(text.clone())) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = %id, "subscriber queue full, dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            state.subscribers.remove(&id);
            debug!(subscriber = %id, "removed closed subscriber");
        }
        delivered
    }

    /// Send to a single subscriber. False if it is gone or its queue is full.
    pub fn send_to(&self, id: Uuid, envelope: &WsEnvelope) -> bool {
        let text: Arc<str> = match serde_json::to_string(envelope) {
            Ok(text) => text.into(),
            Err(e) => {
                warn!(error = %e, "failed to serialize ws event");
                return false;
            }
        };
        let state = self.state.lock();
        match state.subscribers.get(&id) {
            Some(sub) => sub.tx.try_send(Outbound::Text(text)).is_ok(),
            None => false,
        }
    }

    /// One liveness round: drop subscribers that missed the last probe, probe the rest.
    /// Returns the dropped ids.
    pub fn sweep(&self) -> Vec<Uuid> {
        let mut state = self.state.lock();
        let mut dropped = Vec::new();
        for (id, sub) in state.subscribers.iter_mut() {
            if !sub.alive {
                let _ = sub.tx.try_send(Outbound::Close);
                dropped.push(*id);
                continue;
            }
            sub.alive = false;
            if let Err(mpsc::error::TrySendError::Closed(_)) = sub.tx.try_send(Outbound::Ping) {
                dropped.push(*id);
            }
        }
        for id in &dropped {
            state.subscribers.remove(id);
        }
        if !dropped.is_empty() {
            info!(dropped = dropped.len(), remaining = state.subscribers.len(), "terminated dead subscribers");
        }
        dropped
    }

    pub fn spawn_liveness(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                hub.sweep();
            }
        })
    }

    /// Push the current constant predictions to one subscriber once `grace` has passed.
    pub fn schedule_constants(
        self: &Arc<Self>,
        id: Uuid,
        source: Arc<dyn BootstrapSource>,
        grace: Duration,
    ) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            for instrument in source.instruments() {
                let points = source.constant_predictions(&instrument);
                if points.is_empty() {
                    continue;
                }
                let envelope = WsEnvelope::new(instrument, WsEvent::ConstantForecast(points));
                if !hub.send_to(id, &envelope) {
                    debug!(subscriber = %id, "constant bootstrap not delivered");
                    return;
                }
            }
        })
    }
}

fn recent_ring<'a>(state: &'a mut HubState, instrument: &str, capacity: usize) -> &'a mut RingBuffer<Trade> {
    state
        .recent_trades
        .entry(instrument.to_string())
        .or_insert_with(|| RingBuffer::new(capacity))
}

fn push_encoded(out: &mut Vec<Arc<str>>, instrument: &str, event: WsEvent) {
    match serde_json::to_string(&WsEnvelope::new(instrument, event)) {
        Ok(text) => out.push(text.into()),
        Err(e) => warn!(instrument, error = %e, "failed to serialize bootstrap event"),
    }
}
