use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::store::models::{Phase, PhaseStatus, Run};

/// Progress events emitted on every run transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RunEvent {
    RunQueued {
        run_id: i64,
        target_id: i64,
    },
    RunStarted {
        run_id: i64,
    },
    PhaseStarted {
        run_id: i64,
        phase: Phase,
        seq: i64,
    },
    PhaseRetrying {
        run_id: i64,
        phase: Phase,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    PhaseCompleted {
        run_id: i64,
        phase: Phase,
        status: PhaseStatus,
        notes: Vec<String>,
    },
    RunCompleted {
        run: Run,
    },
    RunFailed {
        run: Run,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> i64 {
        match self {
            Self::RunQueued { run_id, .. }
            | Self::RunStarted { run_id }
            | Self::PhaseStarted { run_id, .. }
            | Self::PhaseRetrying { run_id, .. }
            | Self::PhaseCompleted { run_id, .. } => *run_id,
            Self::RunCompleted { run } | Self::RunFailed { run } => run.id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunCompleted { .. } | Self::RunFailed { .. })
    }

    /// Event name used on the SSE stream.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunQueued { .. } => "run_queued",
            Self::RunStarted { .. } => "run_started",
            Self::PhaseStarted { .. } => "phase_started",
            Self::PhaseRetrying { .. } => "phase_retrying",
            Self::PhaseCompleted { .. } => "phase_completed",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
        }
    }

    /// Terminal event matching a finished run's persisted state.
    pub fn terminal_for(run: Run) -> Self {
        if run.status == crate::store::models::RunStatus::Completed {
            Self::RunCompleted { run }
        } else {
            Self::RunFailed { run }
        }
    }
}

const RUN_CHANNEL_CAPACITY: usize = 64;

/// Fan-out for run events: one JSON feed for dashboard sockets plus one
/// typed channel per live run. A run channel exists from admission until its
/// terminal event; receivers drain buffered events and then see `Closed`.
pub struct EventHub {
    feed: broadcast::Sender<String>,
    runs: Mutex<HashMap<i64, broadcast::Sender<RunEvent>>>,
}

impl EventHub {
    pub fn new(feed_capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(feed_capacity);
        Self {
            feed,
            runs: Mutex::new(HashMap::new()),
        }
    }

    fn runs(&self) -> std::sync::MutexGuard<'_, HashMap<i64, broadcast::Sender<RunEvent>>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn feed(&self) -> broadcast::Sender<String> {
        self.feed.clone()
    }

    pub fn subscribe_feed(&self) -> broadcast::Receiver<String> {
        self.feed.subscribe()
    }

    /// Create the per-run channel. Called once at admission.
    pub fn open_run(&self, run_id: i64) {
        self.runs()
            .entry(run_id)
            .or_insert_with(|| broadcast::channel(RUN_CHANNEL_CAPACITY).0);
    }

    /// `None` once the run has finished (or was never admitted here).
    pub fn subscribe_run(&self, run_id: i64) -> Option<broadcast::Receiver<RunEvent>> {
        self.runs().get(&run_id).map(|tx| tx.subscribe())
    }

    /// Drop a run channel without a terminal event, closing its streams.
    pub fn close_run(&self, run_id: i64) {
        self.runs().remove(&run_id);
    }

    pub fn live_runs(&self) -> usize {
        self.runs().len()
    }

    pub fn emit(&self, event: RunEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => {
                // No dashboard clients is fine.
                let _ = self.feed.send(json);
            }
            Err(e) => tracing::warn!(error = %e, "Failed to serialize run event"),
        }

        let run_id = event.run_id();
        let mut runs = self.runs();
        if event.is_terminal() {
            if let Some(tx) = runs.remove(&run_id) {
                let _ = tx.send(event);
            }
        } else if let Some(tx) = runs.get(&run_id) {
            let _ = tx.send(event);
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}
