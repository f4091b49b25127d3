//! Leased remote execution environments.
//!
//! `SandboxManager` is process-wide: it owns the provider, tracks every live
//! session for the reaper and counts acquisitions and releases. Each run gets
//! its own `SandboxClient`, which holds at most one session and hides
//! provisioning latency, session recycling and single-retry recovery from
//! the phases.

pub mod client;
#[cfg(test)]
pub mod mock;
pub mod provider;

pub use client::{SandboxClient, SandboxManager, SandboxMetrics, SandboxSettings, ToolReport};
pub use provider::{CommandOutput, HttpSandboxProvider, SandboxProvider};
