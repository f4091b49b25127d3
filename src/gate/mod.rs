//! Pre-flight validation gate.
//!
//! Every external collaborator is checked by a [`HealthProbe`]; the gate runs
//! them in parallel, each under its own timeout, and publishes the result as
//! a versioned [`ValidationReport`] through a `watch` channel. Run admission
//! reads the latest report and recomputes it first when the configuration
//! changed after it was produced.

pub mod probes;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;

pub use probes::{
    CaptureProbe, CredentialsProbe, DatabaseProbe, LlmProbe, PublishProbe, SandboxProbe,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeIssue {
    pub dependency: String,
    pub message: String,
    pub level: IssueLevel,
}

impl ProbeIssue {
    pub fn error(dependency: &str, message: impl Into<String>) -> Self {
        Self {
            dependency: dependency.to_string(),
            message: message.into(),
            level: IssueLevel::Error,
        }
    }

    pub fn warning(dependency: &str, message: impl Into<String>) -> Self {
        Self {
            dependency: dependency.to_string(),
            message: message.into(),
            level: IssueLevel::Warning,
        }
    }

    pub fn render(&self) -> String {
        format!("{}: {}", self.dependency, self.message)
    }
}

/// One lightweight check against an external collaborator.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &'static str;

    /// Required collaborators block runs; optional ones only warn.
    fn required(&self) -> bool;

    /// Returns no issues when healthy.
    async fn probe(&self) -> Vec<ProbeIssue>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub version: u64,
    pub config_generation: u64,
    pub timestamp: String,
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// Placeholder published before the first run of the gate.
    pub fn pending() -> Self {
        Self {
            version: 0,
            config_generation: 0,
            timestamp: chrono::Utc::now().to_rfc3339(),
            valid: false,
            errors: vec!["gate: validation has not run yet".to_string()],
            warnings: Vec::new(),
        }
    }

    pub fn from_issues(version: u64, config_generation: u64, issues: &[ProbeIssue]) -> Self {
        let errors: Vec<String> = issues
            .iter()
            .filter(|i| i.level == IssueLevel::Error)
            .map(ProbeIssue::render)
            .collect();
        let warnings = issues
            .iter()
            .filter(|i| i.level == IssueLevel::Warning)
            .map(ProbeIssue::render)
            .collect();
        Self {
            version,
            config_generation,
            timestamp: chrono::Utc::now().to_rfc3339(),
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// What admission reports back when the report is invalid.
    pub fn failing_dependencies(&self) -> Vec<String> {
        self.errors.clone()
    }
}

pub struct ValidationGate {
    probes: RwLock<Vec<Arc<dyn HealthProbe>>>,
    probe_timeout: Duration,
    generation: AtomicU64,
    version: AtomicU64,
    report: watch::Sender<Arc<ValidationReport>>,
    /// Serializes recomputation so concurrent callers share one run.
    running: Mutex<()>,
}

impl ValidationGate {
    pub fn new(probes: Vec<Arc<dyn HealthProbe>>, probe_timeout: Duration) -> Self {
        let (report, _) = watch::channel(Arc::new(ValidationReport::pending()));
        Self {
            probes: RwLock::new(probes),
            probe_timeout,
            generation: AtomicU64::new(1),
            version: AtomicU64::new(0),
            report,
            running: Mutex::new(()),
        }
    }

    pub fn current(&self) -> Arc<ValidationReport> {
        self.report.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ValidationReport>> {
        self.report.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn is_stale(&self, report: &ValidationReport) -> bool {
        report.version == 0 || report.config_generation < self.generation()
    }

    /// Swap the probe set after a configuration change. Reports produced
    /// before this call are considered stale.
    pub async fn reconfigure(&self, probes: Vec<Arc<dyn HealthProbe>>) {
        *self.probes.write().await = probes;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(generation, "Validation gate reconfigured");
    }

    /// Run every probe and publish a new report.
    pub async fn run(&self) -> Arc<ValidationReport> {
        let _guard = self.running.lock().await;
        let generation = self.generation();
        let probes = self.probes.read().await.clone();
        let timeout = self.probe_timeout;

        let results = join_all(probes.iter().map(|probe| async move {
            match tokio::time::timeout(timeout, probe.probe()).await {
                Ok(issues) => issues,
                Err(_) => {
                    let message = format!("health check timed out after {:?}", timeout);
                    vec![if probe.required() {
                        ProbeIssue::error(probe.name(), message)
                    } else {
                        ProbeIssue::warning(probe.name(), message)
                    }]
                }
            }
        }))
        .await;
        let issues: Vec<ProbeIssue> = results.into_iter().flatten().collect();

        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let report = Arc::new(ValidationReport::from_issues(version, generation, &issues));
        if report.valid {
            tracing::info!(version, warnings = report.warnings.len(), "Validation passed");
        } else {
            tracing::warn!(version, errors = ?report.errors, "Validation failed");
        }
        for warning in &report.warnings {
            tracing::warn!(warning = %warning, "Validation warning");
        }
        self.report.send_replace(report.clone());
        report
    }

    /// Latest report, recomputed first if it predates the current
    /// configuration.
    pub async fn report_for_admission(&self) -> Arc<ValidationReport> {
        let current = self.current();
        if self.is_stale(&current) {
            tracing::debug!(version = current.version, "Validation report is stale, recomputing");
            return self.run().await;
        }
        current
    }

    pub fn spawn_revalidation(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let gate = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; startup already ran the gate.
            interval.tick().await;
            loop {
                interval.tick().await;
                gate.run().await;
            }
        })
    }
}
