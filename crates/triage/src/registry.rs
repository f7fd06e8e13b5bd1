//! Process-local run registry.
//!
//! The orchestrator owns a write-only [`EventSink`] per run; subscribers get
//! a read-only view. Entries outlive their run by a retention window so late
//! joiners can still collect the cached terminal event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fraudesk_contracts::TriageEvent;
use tokio::sync::{RwLock, broadcast};

const RUN_CHANNEL_CAPACITY: usize = 256;

struct RunEntry {
    sender: broadcast::Sender<TriageEvent>,
    terminal: Option<TriageEvent>,
}

#[derive(Clone)]
pub struct RunRegistry {
    inner: Arc<RwLock<HashMap<String, RunEntry>>>,
    retention: Duration,
}

/// What a subscriber gets back: the live channel, or the cached terminal
/// event for a run that already finished.
pub enum Subscription {
    Live(broadcast::Receiver<TriageEvent>),
    Replay(TriageEvent),
}

impl RunRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            retention,
        }
    }

    /// Register a fresh run and hand its write-only sink to the caller.
    pub async fn register(&self, run_id: &str) -> EventSink {
        let (sender, _) = broadcast::channel(RUN_CHANNEL_CAPACITY);
        let entry = RunEntry {
            sender: sender.clone(),
            terminal: None,
        };
        self.inner.write().await.insert(run_id.to_string(), entry);

        EventSink {
            run_id: run_id.to_string(),
            sender,
            registry: self.clone(),
        }
    }

    /// The terminal check and the channel subscription happen under one read
    /// guard, while the terminal is recorded under the write lock before it
    /// is broadcast. A subscriber therefore sees the terminal either as a
    /// replay or on the channel, never neither.
    pub async fn subscribe(&self, run_id: &str) -> Option<Subscription> {
        let guard = self.inner.read().await;
        let entry = guard.get(run_id)?;
        match &entry.terminal {
            Some(terminal) => Some(Subscription::Replay(terminal.clone())),
            None => Some(Subscription::Live(entry.sender.subscribe())),
        }
    }

    pub async fn contains(&self, run_id: &str) -> bool {
        self.inner.read().await.contains_key(run_id)
    }

    async fn mark_terminal(&self, run_id: &str, terminal: TriageEvent) {
        if let Some(entry) = self.inner.write().await.get_mut(run_id) {
            entry.terminal = Some(terminal);
        }
    }

    fn schedule_removal(&self, run_id: String) {
        let inner = Arc::clone(&self.inner);
        let retention = self.retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            inner.write().await.remove(&run_id);
        });
    }
}

/// Write-only handle the orchestrator emits through. Dropping the sink does
/// not close the channel; the registry entry keeps it alive through the
/// retention window.
pub struct EventSink {
    run_id: String,
    sender: broadcast::Sender<TriageEvent>,
    registry: RunRegistry,
}

impl EventSink {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Send a non-terminal event. A send error only means nobody is
    /// listening right now, which is fine.
    pub fn emit(&self, event: TriageEvent) {
        let _ = self.sender.send(event);
    }

    /// Record the terminal event, broadcast it, and start the retention
    /// clock.
    pub async fn finish(self, terminal: TriageEvent) {
        self.registry
            .mark_terminal(&self.run_id, terminal.clone())
            .await;
        let _ = self.sender.send(terminal);
        self.registry.schedule_removal(self.run_id);
    }
}
