//! Run orchestration: admission, the phase pipeline and progress events.

pub mod events;
pub mod phases;
pub mod runner;
pub mod state;

pub use events::{EventHub, RunEvent};
pub use phases::{PhaseExecutor, Services, standard_phases};
pub use runner::{CancelOutcome, Orchestrator, OrchestratorSettings};
pub use state::{RunState, Transition};
