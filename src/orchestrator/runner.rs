use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::FutureExt;
use futures::future::join_all;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;

use super::events::{EventHub, RunEvent};
use super::phases::{
    PhaseArtifacts, PhaseContext, PhaseExecutor, PhaseOutput, PhaseSettings, Services, standard_phases,
};
use super::state::{RunState, Transition};
use crate::config::{AppConfig, PhaseTimeouts};
use crate::errors::{AdmissionError, PhaseFailure, ReasonCode};
use crate::gate::ValidationGate;
use crate::retry::RetryPolicy;
use crate::sandbox::{SandboxClient, SandboxManager, SandboxMetrics};
use crate::store::models::{PhaseCompletion, PhaseStatus, Run, RunDetail, RunOutcome, RunStatus, Target};
use crate::store::{Admission, DbHandle};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_concurrent_runs: usize,
    pub phase_timeouts: PhaseTimeouts,
    pub phase_retry: RetryPolicy,
    pub artifact_dir: PathBuf,
    pub shutdown_grace: Duration,
    pub phase: PhaseSettings,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let o = &config.orchestrator;
        Self {
            max_concurrent_runs: o.max_concurrent_runs.max(1),
            phase_timeouts: o.phase_timeouts.clone(),
            phase_retry: o.phase_retry_policy(),
            artifact_dir: o.artifact_dir.clone(),
            shutdown_grace: Duration::from_secs(o.shutdown_grace_secs),
            phase: PhaseSettings {
                tools: config.sandbox.tools.clone(),
                command_timeout: Duration::from_secs(config.sandbox.command_timeout_secs),
                max_input_chars: config.llm.max_input_chars,
                exploit_limit: o.exploit_limit,
            },
        }
    }
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The run will stop at its next phase boundary.
    Signalled,
    /// The run exists but is not executing in this process.
    NotActive,
    NotFound,
}

struct LiveRun {
    cancel: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    db: DbHandle,
    gate: Arc<ValidationGate>,
    sandbox: SandboxManager,
    services: Services,
    events: Arc<EventHub>,
    settings: OrchestratorSettings,
    phases: Vec<Arc<dyn PhaseExecutor>>,
    permits: Arc<Semaphore>,
    live: Mutex<HashMap<i64, LiveRun>>,
    accepting: AtomicBool,
}

impl Inner {
    fn live(&self) -> MutexGuard<'_, HashMap<i64, LiveRun>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Drives targets through the phase pipeline.
///
/// Each admitted run executes as its own task. Runs for distinct targets
/// proceed concurrently up to `max_concurrent_runs`; phases within a run are
/// strictly sequential. Cancellation is cooperative and observed at phase
/// boundaries.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        db: DbHandle,
        gate: Arc<ValidationGate>,
        sandbox: SandboxManager,
        services: Services,
        events: Arc<EventHub>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self::with_phases(db, gate, sandbox, services, events, settings, standard_phases())
    }

    pub fn with_phases(
        db: DbHandle,
        gate: Arc<ValidationGate>,
        sandbox: SandboxManager,
        services: Services,
        events: Arc<EventHub>,
        settings: OrchestratorSettings,
        phases: Vec<Arc<dyn PhaseExecutor>>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_runs.max(1)));
        Self {
            inner: Arc::new(Inner {
                db,
                gate,
                sandbox,
                services,
                events,
                settings,
                phases,
                permits,
                live: Mutex::new(HashMap::new()),
                accepting: AtomicBool::new(true),
            }),
        }
    }

    pub fn db(&self) -> &DbHandle {
        &self.inner.db
    }

    pub fn gate(&self) -> &Arc<ValidationGate> {
        &self.inner.gate
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.inner.events
    }

    pub fn sandbox_metrics(&self) -> SandboxMetrics {
        self.inner.sandbox.metrics()
    }

    /// Runs whose task has not finished yet.
    pub fn in_flight(&self) -> usize {
        self.inner.live().len()
    }

    /// Admit a run for `target_id` and schedule it. Returns as soon as the
    /// run is recorded as queued.
    pub async fn start_run(&self, target_id: i64) -> Result<Run, AdmissionError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(AdmissionError::NotReady {
                failing: vec!["orchestrator: shutting down".to_string()],
            });
        }

        let report = self.inner.gate.report_for_admission().await;
        if !report.valid {
            tracing::warn!(target_id, failing = ?report.errors, "Run rejected: dependencies not ready");
            return Err(AdmissionError::NotReady {
                failing: report.failing_dependencies(),
            });
        }

        let admission = self
            .inner
            .db
            .call(move |db| db.admit_run(target_id))
            .await
            .map_err(AdmissionError::Persistence)?;
        let run = match admission {
            Admission::Admitted(run) => run,
            Admission::Conflict { run_id } => {
                tracing::info!(target_id, run_id, "Run rejected: target already has an active run");
                return Err(AdmissionError::Conflict { target_id, run_id });
            }
            Admission::TargetNotFound => return Err(AdmissionError::TargetNotFound { id: target_id }),
            Admission::TargetInactive(status) => {
                return Err(AdmissionError::TargetInactive {
                    id: target_id,
                    status: status.as_str().to_string(),
                });
            }
        };

        let run_id = run.id;
        self.inner.events.open_run(run_id);
        self.inner.events.emit(RunEvent::RunQueued { run_id, target_id });

        let (cancel, cancel_rx) = watch::channel(false);
        self.inner.live().insert(run_id, LiveRun { cancel, handle: None });
        let handle = tokio::spawn(Self::drive(self.inner.clone(), run.clone(), cancel_rx));
        // The task may already have finished and removed its entry.
        if let Some(entry) = self.inner.live().get_mut(&run_id) {
            entry.handle = Some(handle);
        }

        tracing::info!(run_id, target_id, "Run admitted");
        Ok(run)
    }

    pub async fn get_run_status(&self, run_id: i64) -> Result<Option<RunDetail>> {
        self.inner.db.call(move |db| db.run_detail(run_id)).await
    }

    pub async fn cancel_run(&self, run_id: i64) -> Result<CancelOutcome> {
        if let Some(live) = self.inner.live().get(&run_id) {
            live.cancel.send_replace(true);
            tracing::info!(run_id, "Cancellation requested");
            return Ok(CancelOutcome::Signalled);
        }
        let run = self.inner.db.call(move |db| db.get_run(run_id)).await?;
        Ok(match run {
            Some(_) => CancelOutcome::NotActive,
            None => CancelOutcome::NotFound,
        })
    }

    /// Fail every run left non-terminal by a previous process.
    pub async fn recover_interrupted(&self) -> Result<Vec<i64>> {
        let ids = self
            .inner
            .db
            .call(|db| db.mark_interrupted_runs())
            .await
            .context("Failed to recover interrupted runs")?;
        for run_id in &ids {
            tracing::warn!(run_id, reason = %ReasonCode::Interrupted, "Marked in-flight run as failed after restart");
        }
        Ok(ids)
    }

    /// Stop admitting runs, cancel in-flight ones and wait for their cleanup,
    /// then close shared capture sessions and any remaining sandboxes.
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.permits.close();

        let handles: Vec<JoinHandle<()>> = self
            .inner
            .live()
            .values_mut()
            .filter_map(|live| {
                live.cancel.send_replace(true);
                live.handle.take()
            })
            .collect();
        if !handles.is_empty() {
            tracing::info!(runs = handles.len(), "Waiting for in-flight runs to stop");
            let grace = self.inner.settings.shutdown_grace;
            if tokio::time::timeout(grace, join_all(handles)).await.is_err() {
                tracing::warn!(
                    grace_secs = grace.as_secs(),
                    "Shutdown grace period elapsed; unfinished runs will be marked interrupted on next start"
                );
            }
        }

        self.inner.services.capture.close_all().await;
        self.inner.sandbox.shutdown().await;
    }

    async fn drive(inner: Arc<Inner>, run: Run, mut cancel: watch::Receiver<bool>) {
        let run_id = run.id;
        let outcome = AssertUnwindSafe(Self::execute(&inner, &run, &mut cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                tracing::error!(run_id, "Run task panicked");
                RunOutcome::failed(ReasonCode::InternalError, "Run task panicked")
            });
        Self::finish(&inner, run_id, outcome).await;
    }

    async fn execute(inner: &Inner, run: &Run, cancel: &mut watch::Receiver<bool>) -> RunOutcome {
        let run_id = run.id;
        let _permit = tokio::select! {
            permit = inner.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    return RunOutcome::failed(ReasonCode::Cancelled, "Orchestrator shut down before the run started");
                }
            },
            _ = cancelled(cancel) => {
                return RunOutcome::failed(ReasonCode::Cancelled, "Run cancelled while queued");
            }
        };

        let target_id = run.target_id;
        let prepared = inner
            .db
            .call(move |db| {
                db.mark_run_running(run_id)?;
                db.get_target(target_id)
            })
            .await;
        let target = match prepared {
            Ok(Some(target)) => target,
            Ok(None) => return RunOutcome::failed(ReasonCode::InvalidTarget, format!("Target {} no longer exists", target_id)),
            Err(e) => return RunOutcome::failed(ReasonCode::PersistenceError, format!("{:#}", e)),
        };
        inner.events.emit(RunEvent::RunStarted { run_id });
        tracing::info!(run_id, target_id, target = %target.name, "Run started");

        let run_dir = inner.settings.artifact_dir.join(format!("run-{}", run_id));
        let mut sandbox = inner.sandbox.client();
        let outcome = Self::run_phases(inner, run, &target, &mut sandbox, &run_dir, cancel).await;
        sandbox.release().await;
        outcome
    }

    async fn run_phases(
        inner: &Inner,
        run: &Run,
        target: &Target,
        sandbox: &mut SandboxClient,
        run_dir: &Path,
        cancel: &watch::Receiver<bool>,
    ) -> RunOutcome {
        let run_id = run.id;
        let mut state = RunState::Queued;
        let mut artifacts = PhaseArtifacts::default();

        loop {
            state = match state.apply(Transition::Advance) {
                Ok(next) => next,
                Err(e) => return RunOutcome::failed(ReasonCode::InternalError, e),
            };
            let phase = match state {
                RunState::InPhase(phase) => phase,
                RunState::Completed => return RunOutcome::completed(),
                other => return RunOutcome::failed(ReasonCode::InternalError, format!("Unexpected state {}", other)),
            };

            if *cancel.borrow() {
                tracing::info!(run_id, phase = %phase, "Run cancelled at phase boundary");
                return RunOutcome::failed(ReasonCode::Cancelled, format!("Run cancelled before {}", phase));
            }
            let Some(executor) = inner.phases.iter().find(|e| e.phase() == phase) else {
                return RunOutcome::failed(ReasonCode::InternalError, format!("No executor registered for {}", phase));
            };

            let record = match inner
                .db
                .call(move |db| {
                    let record = db.begin_phase(run_id, phase)?;
                    db.set_run_phase(run_id, phase)?;
                    Ok(record)
                })
                .await
            {
                Ok(record) => record,
                Err(e) => return RunOutcome::failed(ReasonCode::PersistenceError, format!("{:#}", e)),
            };
            inner.events.emit(RunEvent::PhaseStarted {
                run_id,
                phase,
                seq: record.seq,
            });
            tracing::info!(run_id, phase = %phase, seq = record.seq, "Phase started");

            let (result, retries) =
                Self::attempt_phase(inner, executor.as_ref(), run, target, sandbox, &artifacts, run_dir).await;
            let (status, completion, failure) = match result {
                Ok(PhaseOutput {
                    artifact,
                    output_ref,
                    summary,
                    notes,
                }) => {
                    artifacts.record(artifact);
                    let completion = PhaseCompletion {
                        output_ref,
                        summary,
                        notes,
                        retry_count: retries,
                        error: None,
                    };
                    (PhaseStatus::Succeeded, completion, None)
                }
                Err(failure) => {
                    let completion = PhaseCompletion {
                        retry_count: retries,
                        error: Some(failure.to_string()),
                        ..Default::default()
                    };
                    (PhaseStatus::Failed, completion, Some(failure))
                }
            };

            let notes = completion.notes.clone();
            let record_id = record.id;
            if let Err(e) = inner
                .db
                .call(move |db| db.finish_phase(record_id, status, &completion))
                .await
            {
                return RunOutcome::failed(ReasonCode::PersistenceError, format!("{:#}", e));
            }
            inner.events.emit(RunEvent::PhaseCompleted {
                run_id,
                phase,
                status,
                notes,
            });

            if let Some(failure) = failure {
                tracing::warn!(
                    run_id,
                    phase = %phase,
                    reason = %failure.reason,
                    retries,
                    error = %failure.message,
                    "Phase failed"
                );
                return RunOutcome::failed(failure.reason, failure.message);
            }
            tracing::info!(run_id, phase = %phase, retries, "Phase completed");
        }
    }

    /// Run one phase under its time budget, retrying retryable failures with
    /// backoff. Returns the result and the number of retries made.
    async fn attempt_phase(
        inner: &Inner,
        executor: &dyn PhaseExecutor,
        run: &Run,
        target: &Target,
        sandbox: &mut SandboxClient,
        artifacts: &PhaseArtifacts,
        run_dir: &Path,
    ) -> (Result<PhaseOutput, PhaseFailure>, u32) {
        let phase = executor.phase();
        let policy = &inner.settings.phase_retry;
        let budget = inner.settings.phase_timeouts.for_phase(phase);
        let mut attempt = 1;
        loop {
            let mut ctx = PhaseContext {
                run,
                target,
                artifacts,
                sandbox: &mut *sandbox,
                services: &inner.services,
                settings: &inner.settings.phase,
                db: &inner.db,
                run_dir,
            };
            let result = match tokio::time::timeout(budget, executor.execute(&mut ctx)).await {
                Ok(result) => result,
                Err(_) => Err(PhaseFailure::retryable(
                    ReasonCode::PhaseTimeout,
                    format!("{} exceeded its {}s budget", phase, budget.as_secs()),
                )),
            };

            match result {
                Ok(output) => return (Ok(output), attempt - 1),
                Err(failure) if failure.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    tracing::warn!(
                        run_id = run.id,
                        phase = %phase,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "Phase attempt failed, retrying"
                    );
                    inner.events.emit(RunEvent::PhaseRetrying {
                        run_id: run.id,
                        phase,
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: failure.to_string(),
                    });
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(failure) => return (Err(failure.escalate(attempt)), attempt - 1),
            }
        }
    }

    async fn finish(inner: &Inner, run_id: i64, outcome: RunOutcome) {
        let result = inner
            .db
            .call(move |db| match db.finish_run(run_id, &outcome)? {
                Some(run) => Ok(run),
                // Already terminal; report what is stored.
                None => db.get_run(run_id)?.context("Run disappeared before it finished"),
            })
            .await;
        match result {
            Ok(run) => {
                match run.status {
                    RunStatus::Completed => tracing::info!(run_id, "Run completed"),
                    _ => tracing::warn!(
                        run_id,
                        reason = ?run.reason_code.map(|r| r.as_str()),
                        error = ?run.error,
                        "Run failed"
                    ),
                }
                inner.events.emit(RunEvent::terminal_for(run));
            }
            Err(e) => {
                tracing::error!(run_id, error = %format!("{:#}", e), "Failed to record run outcome");
                inner.events.close_run(run_id);
            }
        }
        inner.live().remove(&run_id);
    }
}

/// Resolves once cancellation is requested. Never resolves if the sender is
/// gone without cancelling.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureClient;
    use crate::config::PublishConfig;
    use crate::errors::SandboxError;
    use crate::gate::HealthProbe;
    use crate::gate::testing::StaticProbe;
    use crate::llm::mock::ScriptedAnalyst;
    use crate::orchestrator::phases::{AnalyzePhase, ExploitAttempt, PhaseArtifact};
    use crate::publish::ChangePublisher;
    use crate::sandbox::SandboxSettings;
    use crate::sandbox::mock::{MockProvider, output};
    use crate::store::Store;
    use crate::store::models::{NewTarget, Phase, TargetStatus, TargetUpdate};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    const NO_FINDINGS: &str = r#"{"vulnerabilities": []}"#;

    struct Harness {
        orch: Orchestrator,
        db: DbHandle,
        provider: Arc<MockProvider>,
        dir: TempDir,
    }

    fn sandbox_settings() -> SandboxSettings {
        SandboxSettings {
            template: "test".into(),
            idle_timeout: Duration::from_secs(300),
            max_age: Duration::from_secs(3600),
            max_commands: 100,
            provision_policy: RetryPolicy::exponential(2, Duration::from_millis(1)),
            acquire_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
            tools: vec!["nmap".into()],
        }
    }

    fn settings(dir: &Path) -> OrchestratorSettings {
        OrchestratorSettings {
            max_concurrent_runs: 4,
            phase_timeouts: PhaseTimeouts::default(),
            phase_retry: RetryPolicy::exponential(3, Duration::from_millis(5)),
            artifact_dir: dir.to_path_buf(),
            shutdown_grace: Duration::from_secs(5),
            phase: PhaseSettings {
                tools: vec!["nmap".into()],
                command_timeout: Duration::from_secs(5),
                ..Default::default()
            },
        }
    }

    fn build(
        provider: MockProvider,
        probes: Vec<Arc<dyn HealthProbe>>,
        analysis: &str,
        phases: Vec<Arc<dyn PhaseExecutor>>,
        tweak: impl FnOnce(&mut OrchestratorSettings),
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = DbHandle::new(Store::new_in_memory().unwrap());
        let provider = Arc::new(provider);
        let sandbox = SandboxManager::new(provider.clone(), sandbox_settings());
        let gate = Arc::new(ValidationGate::new(probes, Duration::from_secs(5)));
        let services = Services {
            analyst: Arc::new(ScriptedAnalyst::new(analysis)),
            capture: Arc::new(CaptureClient::disabled()),
            publisher: Arc::new(ChangePublisher::new(&PublishConfig::default())),
        };
        let mut settings = settings(dir.path());
        tweak(&mut settings);
        let orch = Orchestrator::with_phases(
            db.clone(),
            gate,
            sandbox,
            services,
            Arc::new(EventHub::default()),
            settings,
            phases,
        );
        Harness { orch, db, provider, dir }
    }

    fn healthy(provider: MockProvider, analysis: &str) -> Harness {
        build(provider, vec![StaticProbe::healthy("database")], analysis, standard_phases(), |_| {})
    }

    async fn create_target(db: &DbHandle, url: &str) -> Target {
        let new = NewTarget {
            name: "demo".into(),
            url: Some(url.into()),
            ..Default::default()
        };
        db.call(move |db| db.create_target(&new)).await.unwrap()
    }

    async fn wait_terminal(db: &DbHandle, run_id: i64) -> Run {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let run = db.call(move |db| db.get_run(run_id)).await.unwrap().unwrap();
                if run.status.is_terminal() {
                    return run;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("run did not finish in time")
    }

    async fn wait_for_phase_records(db: &DbHandle, run_id: i64, count: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let records = db.call(move |db| db.list_phase_records(run_id)).await.unwrap();
                if records.len() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("phase did not start in time")
    }

    async fn wait_idle(orch: &Orchestrator) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while orch.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("runs did not drain");
    }

    fn recon_output() -> PhaseOutput {
        PhaseOutput {
            artifact: PhaseArtifact::Recon {
                output: "PORT 80/tcp open http".into(),
                output_ref: "recon.txt".into(),
            },
            output_ref: None,
            summary: serde_json::Value::Null,
            notes: Vec::new(),
        }
    }

    /// Holds a sandbox and blocks until released.
    struct BlockingRecon {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl PhaseExecutor for BlockingRecon {
        fn phase(&self) -> Phase {
            Phase::Recon
        }

        async fn execute(&self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseFailure> {
            let budget = ctx.sandbox.acquire_timeout();
            ctx.sandbox.acquire(budget).await?;
            self.release.notified().await;
            Ok(recon_output())
        }
    }

    fn with_recon(recon: Arc<dyn PhaseExecutor>) -> Vec<Arc<dyn PhaseExecutor>> {
        replacing(recon)
    }

    fn replacing(executor: Arc<dyn PhaseExecutor>) -> Vec<Arc<dyn PhaseExecutor>> {
        standard_phases()
            .into_iter()
            .map(|p| if p.phase() == executor.phase() { executor.clone() } else { p })
            .collect()
    }

    fn sqlmap_confirms() -> MockProvider {
        MockProvider::with_handler(|cmd| {
            if cmd.starts_with("sqlmap") {
                Ok(output("sqlmap identified the following injection point(s)", 0))
            } else {
                Ok(output("", 0))
            }
        })
    }

    #[tokio::test]
    async fn test_healthy_run_completes_all_phases_in_order() {
        let h = healthy(MockProvider::healthy(), NO_FINDINGS);
        let target = create_target(&h.db, "http://example.test").await;

        let run = h.orch.start_run(target.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        let done = wait_terminal(&h.db, run.id).await;
        assert_eq!(done.status, RunStatus::Completed);
        assert!(done.reason_code.is_none());

        let detail = h.orch.get_run_status(run.id).await.unwrap().unwrap();
        let phases: Vec<Phase> = detail.phases.iter().map(|p| p.phase).collect();
        assert_eq!(phases, Phase::ALL.to_vec());
        assert!(detail.phases.iter().all(|p| p.status == PhaseStatus::Succeeded));
        let seqs: Vec<i64> = detail.phases.iter().map(|p| p.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert!(detail.findings.is_empty());

        let report = detail.phases.last().unwrap();
        assert!(report.notes.iter().any(|n| n.starts_with("publish skipped")));
        let report_ref = detail.run.report_ref.clone().unwrap();
        assert!(std::fs::read_to_string(report_ref).unwrap().contains("## Vulnerabilities Found"));

        wait_idle(&h.orch).await;
        let metrics = h.orch.sandbox_metrics();
        assert_eq!(metrics.acquisitions, 1);
        assert_eq!(metrics.releases, metrics.acquisitions);
        assert_eq!(h.provider.count_matching("nmap -A -T4 'example.test'"), 1);
        assert!(h.dir.path().join(format!("run-{}", run.id)).join("recon.txt").exists());
    }

    #[tokio::test]
    async fn test_sql_injection_is_exploited_and_patched() {
        let provider = sqlmap_confirms();
        let analysis = r#"{"vulnerabilities":[
            {"type":"SQLi","endpoint":"/login.php","param":"username","severity":"high"},
            {"type":"XSS","endpoint":"/search"}
        ]}"#;
        let h = healthy(provider, analysis);
        let target = create_target(&h.db, "http://example.test").await;

        let run = h.orch.start_run(target.id).await.unwrap();
        let done = wait_terminal(&h.db, run.id).await;
        assert_eq!(done.status, RunStatus::Completed);

        let detail = h.orch.get_run_status(run.id).await.unwrap().unwrap();
        assert_eq!(detail.findings.len(), 2);
        let sqli = detail.findings.iter().find(|f| f.category == "SQLi").unwrap();
        assert!(sqli.exploited);
        assert!(sqli.patched);
        let xss = detail.findings.iter().find(|f| f.category == "XSS").unwrap();
        assert!(!xss.exploited);
        assert_eq!(h.provider.count_matching("sqlmap -u"), 1);

        let exploit = &detail.phases[2];
        assert!(exploit.notes.iter().any(|n| n.contains("XSS")));
        let patch_file = h.dir.path().join(format!("run-{}/patches/login.php", run.id));
        assert!(std::fs::read_to_string(patch_file).unwrap().contains("patched"));

        let report = std::fs::read_to_string(done.report_ref.unwrap()).unwrap();
        assert!(report.contains("SQLi on /login.php (param: username) (high) [exploited, patched]"));
        let report_phase = &detail.phases[4];
        assert!(report_phase.notes.iter().any(|n| n.starts_with("evidence omitted")));
        assert!(report_phase.notes.iter().any(|n| n.starts_with("publish skipped")));
    }

    #[tokio::test]
    async fn test_patch_path_outside_run_directory_fails_the_run() {
        let analysis = r#"{"vulnerabilities":[
            {"type":"SQLi","endpoint":"/login.php","param":"username","file":"../../../escaped.php"}
        ]}"#;
        let h = healthy(sqlmap_confirms(), analysis);
        let target = create_target(&h.db, "http://example.test").await;

        let run = h.orch.start_run(target.id).await.unwrap();
        let done = wait_terminal(&h.db, run.id).await;
        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.reason_code, Some(ReasonCode::MalformedInput));

        let detail = h.orch.get_run_status(run.id).await.unwrap().unwrap();
        assert_eq!(detail.phases[3].phase, Phase::Patch);
        assert_eq!(detail.phases[3].status, PhaseStatus::Failed);
        assert!(!detail.findings[0].patched);
        let escaped = h.dir.path().parent().unwrap().join("escaped.php");
        assert!(!escaped.exists(), "patch escaped to {}", escaped.display());
    }

    /// Claims every finding was exploited, pointing at output that was
    /// never written.
    struct LostOutputExploit;

    #[async_trait]
    impl PhaseExecutor for LostOutputExploit {
        fn phase(&self) -> Phase {
            Phase::Exploit
        }

        async fn execute(&self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseFailure> {
            let missing = ctx.run_dir.join("exploit-missing.txt").display().to_string();
            let attempts = ctx
                .artifacts
                .findings
                .iter()
                .map(|f| ExploitAttempt {
                    finding_id: f.id,
                    exploited: true,
                    output_ref: Some(missing.clone()),
                })
                .collect();
            Ok(PhaseOutput {
                artifact: PhaseArtifact::Exploit { attempts },
                output_ref: None,
                summary: serde_json::Value::Null,
                notes: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_unreadable_exploit_output_fails_patch_phase() {
        let analysis = r#"{"vulnerabilities":[{"type":"SQLi","endpoint":"/login.php"}]}"#;
        let h = build(
            MockProvider::healthy(),
            vec![StaticProbe::healthy("database")],
            analysis,
            replacing(Arc::new(LostOutputExploit)),
            |_| {},
        );
        let target = create_target(&h.db, "http://example.test").await;

        let run = h.orch.start_run(target.id).await.unwrap();
        let done = wait_terminal(&h.db, run.id).await;
        assert_eq!(done.reason_code, Some(ReasonCode::InternalError));
        assert!(done.error.unwrap().contains("exploit-missing.txt"));
        let detail = h.orch.get_run_status(run.id).await.unwrap().unwrap();
        assert_eq!(detail.phases[3].status, PhaseStatus::Failed);
    }

    /// Runs the real analysis, then reports a retryable failure on the
    /// first attempt after its findings were stored.
    struct FlakyAnalyze {
        calls: AtomicU32,
    }

    #[async_trait]
    impl PhaseExecutor for FlakyAnalyze {
        fn phase(&self) -> Phase {
            Phase::Analyze
        }

        async fn execute(&self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseFailure> {
            let output = AnalyzePhase.execute(ctx).await?;
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(PhaseFailure::retryable(ReasonCode::PhaseTimeout, "analysis ran over"));
            }
            Ok(output)
        }
    }

    #[tokio::test]
    async fn test_retried_analysis_does_not_duplicate_findings() {
        let analysis = r#"{"vulnerabilities":[
            {"type":"SQLi","endpoint":"/login.php"},
            {"type":"XSS","endpoint":"/search"}
        ]}"#;
        let h = build(
            MockProvider::healthy(),
            vec![StaticProbe::healthy("database")],
            analysis,
            replacing(Arc::new(FlakyAnalyze { calls: AtomicU32::new(0) })),
            |_| {},
        );
        let target = create_target(&h.db, "http://example.test").await;

        let run = h.orch.start_run(target.id).await.unwrap();
        let done = wait_terminal(&h.db, run.id).await;
        assert_eq!(done.status, RunStatus::Completed);

        let detail = h.orch.get_run_status(run.id).await.unwrap().unwrap();
        assert_eq!(detail.phases[1].retry_count, 1);
        assert_eq!(detail.findings.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_git_is_reported_as_unavailable_tool() {
        let provider = MockProvider::with_handler(|cmd| {
            if cmd.contains("git clone") {
                Ok(output("sh: 1: git: not found", 127))
            } else {
                Ok(output("", 0))
            }
        });
        let h = healthy(provider, NO_FINDINGS);
        let new = NewTarget {
            name: "webapp".into(),
            repo_url: Some("https://github.com/acme/webapp".into()),
            ..Default::default()
        };
        let target = h.db.call(move |db| db.create_target(&new)).await.unwrap();

        let run = h.orch.start_run(target.id).await.unwrap();
        let done = wait_terminal(&h.db, run.id).await;
        assert_eq!(done.reason_code, Some(ReasonCode::ToolsUnavailable));
        assert!(done.error.unwrap().contains("git is not installed"));
        assert!(done.remediation.unwrap().contains("git"));
    }

    #[tokio::test]
    async fn test_invalid_report_rejects_without_creating_a_run() {
        let h = build(
            MockProvider::healthy(),
            vec![
                StaticProbe::healthy("database"),
                StaticProbe::failing("credentials", "E2B_API_KEY is not set"),
            ],
            NO_FINDINGS,
            standard_phases(),
            |_| {},
        );
        let target = create_target(&h.db, "http://example.test").await;

        match h.orch.start_run(target.id).await {
            Err(AdmissionError::NotReady { failing }) => {
                assert_eq!(failing, vec!["credentials: E2B_API_KEY is not set".to_string()]);
            }
            other => panic!("expected NotReady, got {:?}", other.map(|r| r.id)),
        }
        assert_eq!(h.db.call(|db| db.count_runs()).await.unwrap(), 0);
        assert_eq!(h.provider.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_and_archived_targets_are_rejected() {
        let h = healthy(MockProvider::healthy(), NO_FINDINGS);
        assert!(matches!(
            h.orch.start_run(999).await,
            Err(AdmissionError::TargetNotFound { id: 999 })
        ));

        let target = create_target(&h.db, "http://example.test").await;
        let id = target.id;
        h.db.call(move |db| {
            db.update_target(
                id,
                &TargetUpdate {
                    status: Some(TargetStatus::Archived),
                    ..Default::default()
                },
            )
        })
        .await
        .unwrap();
        assert!(matches!(
            h.orch.start_run(id).await,
            Err(AdmissionError::TargetInactive { .. })
        ));
        assert_eq!(h.db.call(|db| db.count_runs()).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_admit_exactly_one_run() {
        let release = Arc::new(Notify::new());
        let h = build(
            MockProvider::healthy(),
            vec![StaticProbe::healthy("database")],
            NO_FINDINGS,
            with_recon(Arc::new(BlockingRecon { release: release.clone() })),
            |_| {},
        );
        let target = create_target(&h.db, "http://example.test").await;

        let attempts = (0..16).map(|_| {
            let orch = h.orch.clone();
            let id = target.id;
            tokio::spawn(async move { orch.start_run(id).await })
        });
        let results: Vec<_> = join_all(attempts).await.into_iter().map(|r| r.unwrap()).collect();

        let accepted: Vec<&Run> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(accepted.len(), 1);
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(AdmissionError::Conflict { .. })))
            .count();
        assert_eq!(conflicts, 15);

        release.notify_one();
        let done = wait_terminal(&h.db, accepted[0].id).await;
        assert_eq!(done.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancellation_stops_at_phase_boundary_and_releases_once() {
        let release = Arc::new(Notify::new());
        let h = build(
            MockProvider::healthy(),
            vec![StaticProbe::healthy("database")],
            NO_FINDINGS,
            with_recon(Arc::new(BlockingRecon { release: release.clone() })),
            |_| {},
        );
        let target = create_target(&h.db, "http://example.test").await;
        let run = h.orch.start_run(target.id).await.unwrap();
        wait_for_phase_records(&h.db, run.id, 1).await;

        assert_eq!(h.orch.cancel_run(run.id).await.unwrap(), CancelOutcome::Signalled);
        release.notify_one();

        let done = wait_terminal(&h.db, run.id).await;
        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.reason_code, Some(ReasonCode::Cancelled));
        assert!(done.remediation.is_some());

        let detail = h.orch.get_run_status(run.id).await.unwrap().unwrap();
        assert_eq!(detail.phases.len(), 1);
        assert_eq!(detail.phases[0].status, PhaseStatus::Succeeded);

        wait_idle(&h.orch).await;
        let metrics = h.orch.sandbox_metrics();
        assert_eq!(metrics.acquisitions, 1);
        assert_eq!(metrics.releases, 1);
        assert_eq!(h.orch.cancel_run(run.id).await.unwrap(), CancelOutcome::NotActive);
        assert_eq!(h.orch.cancel_run(4242).await.unwrap(), CancelOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_quota_exhaustion_fails_run_without_retry() {
        let provider = MockProvider::healthy().fail_creates(vec![SandboxError::QuotaExceeded(
            "concurrent sandbox limit reached".into(),
        )]);
        let h = healthy(provider, NO_FINDINGS);
        let target = create_target(&h.db, "http://example.test").await;

        let run = h.orch.start_run(target.id).await.unwrap();
        let done = wait_terminal(&h.db, run.id).await;
        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.reason_code, Some(ReasonCode::QuotaExceeded));

        let detail = h.orch.get_run_status(run.id).await.unwrap().unwrap();
        assert_eq!(detail.phases.len(), 1);
        assert_eq!(detail.phases[0].status, PhaseStatus::Failed);
        assert_eq!(detail.phases[0].retry_count, 0);
        assert_eq!(h.provider.creates.load(Ordering::SeqCst), 0);

        wait_idle(&h.orch).await;
        let metrics = h.orch.sandbox_metrics();
        assert_eq!(metrics.acquisitions, metrics.releases);
    }

    /// Fails with a retryable error on the first attempt only.
    struct FlakyRecon {
        calls: AtomicU32,
    }

    #[async_trait]
    impl PhaseExecutor for FlakyRecon {
        fn phase(&self) -> Phase {
            Phase::Recon
        }

        async fn execute(&self, _ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseFailure> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(PhaseFailure::retryable(ReasonCode::RetriesExhausted, "connection reset"));
            }
            Ok(recon_output())
        }
    }

    #[tokio::test]
    async fn test_retryable_phase_failure_is_absorbed() {
        let h = build(
            MockProvider::healthy(),
            vec![StaticProbe::healthy("database")],
            NO_FINDINGS,
            with_recon(Arc::new(FlakyRecon { calls: AtomicU32::new(0) })),
            |_| {},
        );
        let target = create_target(&h.db, "http://example.test").await;
        let run = h.orch.start_run(target.id).await.unwrap();
        let done = wait_terminal(&h.db, run.id).await;
        assert_eq!(done.status, RunStatus::Completed);

        let detail = h.orch.get_run_status(run.id).await.unwrap().unwrap();
        assert_eq!(detail.phases[0].retry_count, 1);
        assert_eq!(detail.phases.len(), 5);
    }

    struct StuckRecon;

    #[async_trait]
    impl PhaseExecutor for StuckRecon {
        fn phase(&self) -> Phase {
            Phase::Recon
        }

        async fn execute(&self, _ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseFailure> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(recon_output())
        }
    }

    #[tokio::test]
    async fn test_phase_timeout_fails_with_its_own_reason() {
        let h = build(
            MockProvider::healthy(),
            vec![StaticProbe::healthy("database")],
            NO_FINDINGS,
            with_recon(Arc::new(StuckRecon)),
            |s| {
                s.phase_timeouts.recon_secs = 1;
                s.phase_retry = RetryPolicy::exponential(1, Duration::from_millis(1));
            },
        );
        let target = create_target(&h.db, "http://example.test").await;
        let run = h.orch.start_run(target.id).await.unwrap();
        let done = wait_terminal(&h.db, run.id).await;
        assert_eq!(done.reason_code, Some(ReasonCode::PhaseTimeout));
    }

    #[tokio::test]
    async fn test_restart_marks_in_flight_runs_interrupted() {
        let h = healthy(MockProvider::healthy(), NO_FINDINGS);
        let target = create_target(&h.db, "http://example.test").await;
        let id = target.id;
        let run_id = h
            .db
            .call(move |db| {
                let Admission::Admitted(run) = db.admit_run(id)? else {
                    anyhow::bail!("not admitted");
                };
                db.mark_run_running(run.id)?;
                db.begin_phase(run.id, Phase::Recon)?;
                Ok(run.id)
            })
            .await
            .unwrap();

        assert_eq!(h.orch.recover_interrupted().await.unwrap(), vec![run_id]);
        let detail = h.orch.get_run_status(run_id).await.unwrap().unwrap();
        assert_eq!(detail.run.status, RunStatus::Failed);
        assert_eq!(detail.run.reason_code, Some(ReasonCode::Interrupted));
        assert_eq!(detail.phases[0].status, PhaseStatus::Failed);

        // The target is admissible again.
        let run = h.orch.start_run(id).await.unwrap();
        assert_eq!(wait_terminal(&h.db, run.id).await.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_runs_and_refuses_new_ones() {
        let release = Arc::new(Notify::new());
        let h = build(
            MockProvider::healthy(),
            vec![StaticProbe::healthy("database")],
            NO_FINDINGS,
            with_recon(Arc::new(BlockingRecon { release: release.clone() })),
            |_| {},
        );
        let target = create_target(&h.db, "http://example.test").await;
        let run = h.orch.start_run(target.id).await.unwrap();
        wait_for_phase_records(&h.db, run.id, 1).await;

        let orch = h.orch.clone();
        let shutdown = tokio::spawn(async move { orch.shutdown().await });
        release.notify_one();
        shutdown.await.unwrap();

        let done = wait_terminal(&h.db, run.id).await;
        assert_eq!(done.reason_code, Some(ReasonCode::Cancelled));
        assert!(matches!(
            h.orch.start_run(target.id).await,
            Err(AdmissionError::NotReady { .. })
        ));
        let metrics = h.orch.sandbox_metrics();
        assert_eq!(metrics.acquisitions, metrics.releases);
    }

    #[tokio::test]
    async fn test_events_stream_ends_with_terminal_event() {
        let release = Arc::new(Notify::new());
        let h = build(
            MockProvider::healthy(),
            vec![StaticProbe::healthy("database")],
            NO_FINDINGS,
            with_recon(Arc::new(BlockingRecon { release: release.clone() })),
            |_| {},
        );
        let target = create_target(&h.db, "http://example.test").await;
        let run = h.orch.start_run(target.id).await.unwrap();
        let mut rx = h.orch.events().subscribe_run(run.id).unwrap();
        release.notify_one();

        let mut names = Vec::new();
        while let Ok(event) = rx.recv().await {
            names.push(event.name());
        }
        assert_eq!(names.last(), Some(&"run_completed"));
        assert_eq!(names.iter().filter(|n| **n == "phase_started").count(), 5);
        assert!(h.orch.events().subscribe_run(run.id).is_none());
    }
}
