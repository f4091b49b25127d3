use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::provider::{CommandOutput, SandboxProvider};
use crate::config::SandboxConfig;
use crate::errors::SandboxError;
use crate::retry::{RetryError, RetryPolicy, retry};

/// Shell exit status for "command not found".
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;

/// Resolved sandbox settings.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub template: String,
    pub idle_timeout: Duration,
    pub max_age: Duration,
    pub max_commands: u32,
    pub provision_policy: RetryPolicy,
    pub acquire_timeout: Duration,
    pub command_timeout: Duration,
    pub tools: Vec<String>,
}

impl From<&SandboxConfig> for SandboxSettings {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            template: config.template.clone(),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            max_age: Duration::from_secs(config.max_age_secs),
            max_commands: config.max_commands_per_session.max(1),
            provision_policy: config.provision_policy(),
            acquire_timeout: Duration::from_secs(config.acquire_timeout_secs),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            tools: config.tools.clone(),
        }
    }
}

/// Snapshot of the process-wide lease counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SandboxMetrics {
    pub acquisitions: u64,
    pub releases: u64,
    pub live: usize,
}

struct Shared {
    provider: Arc<dyn SandboxProvider>,
    settings: SandboxSettings,
    /// Live session id → deadline after which the reaper closes it.
    registry: Mutex<HashMap<String, Instant>>,
    acquisitions: AtomicU64,
    releases: AtomicU64,
}

impl Shared {
    fn register(&self, id: &str) {
        let deadline = Instant::now() + self.settings.max_age + self.settings.command_timeout;
        if let Ok(mut registry) = self.registry.lock() {
            registry.insert(id.to_string(), deadline);
        }
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
    }

    /// Close a session exactly once. Returns false if it was already closed.
    async fn close_session(&self, id: &str) -> bool {
        let removed = self
            .registry
            .lock()
            .map(|mut r| r.remove(id).is_some())
            .unwrap_or(false);
        if !removed {
            return false;
        }
        self.releases.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.provider.close(id).await {
            tracing::warn!(session_id = %id, error = %e, "Failed to close sandbox session");
        } else {
            tracing::debug!(session_id = %id, "Sandbox session closed");
        }
        true
    }
}

/// Process-wide owner of the sandbox provider. Hands out one `SandboxClient`
/// per run and reaps sessions whose owner disappeared.
#[derive(Clone)]
pub struct SandboxManager {
    shared: Arc<Shared>,
}

impl SandboxManager {
    pub fn new(provider: Arc<dyn SandboxProvider>, settings: SandboxSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                provider,
                settings,
                registry: Mutex::new(HashMap::new()),
                acquisitions: AtomicU64::new(0),
                releases: AtomicU64::new(0),
            }),
        }
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.shared.settings
    }

    pub fn client(&self) -> SandboxClient {
        SandboxClient {
            shared: self.shared.clone(),
            session: None,
            manifest: Vec::new(),
            installed: HashSet::new(),
        }
    }

    pub fn metrics(&self) -> SandboxMetrics {
        SandboxMetrics {
            acquisitions: self.shared.acquisitions.load(Ordering::SeqCst),
            releases: self.shared.releases.load(Ordering::SeqCst),
            live: self.shared.registry.lock().map(|r| r.len()).unwrap_or(0),
        }
    }

    pub async fn ping(&self) -> Result<(), SandboxError> {
        self.shared.provider.ping().await
    }

    /// Close every session past its deadline. Returns how many were closed.
    pub async fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .shared
            .registry
            .lock()
            .map(|r| {
                r.iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();
        let mut closed = 0;
        for id in expired {
            if self.shared.close_session(&id).await {
                tracing::warn!(session_id = %id, "Reaped expired sandbox session");
                closed += 1;
            }
        }
        closed
    }

    pub fn spawn_reaper(&self, period: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                manager.reap_expired().await;
            }
        })
    }

    /// Close every live session. Used at process shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self
            .shared
            .registry
            .lock()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        for id in ids {
            self.shared.close_session(&id).await;
        }
    }
}

#[derive(Debug, Clone)]
struct Session {
    id: String,
    created_at: Instant,
    last_used: Instant,
    commands: u32,
}

/// What `ensure_tools` did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolReport {
    pub installed: Vec<String>,
    pub already_present: usize,
    pub failed: Vec<String>,
}

/// Per-run lease on one sandbox session. Not shared across runs.
pub struct SandboxClient {
    shared: Arc<Shared>,
    session: Option<Session>,
    manifest: Vec<String>,
    installed: HashSet<String>,
}

impl SandboxClient {
    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }

    pub fn command_timeout(&self) -> Duration {
        self.shared.settings.command_timeout
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.shared.settings.acquire_timeout
    }

    fn is_stale(&self, session: &Session) -> bool {
        let settings = &self.shared.settings;
        session.created_at.elapsed() >= settings.max_age
            || session.last_used.elapsed() >= settings.idle_timeout
            || session.commands >= settings.max_commands
    }

    /// Hold a usable session, reusing the current one while it is fresh.
    /// Provisioning is retried with backoff inside `budget`.
    pub async fn acquire(&mut self, budget: Duration) -> Result<(), SandboxError> {
        if let Some(session) = &self.session {
            if !self.is_stale(session) {
                return Ok(());
            }
        }
        if let Some(old) = self.session.take() {
            tracing::debug!(session_id = %old.id, commands = old.commands, "Recycling sandbox session");
            self.shared.close_session(&old.id).await;
            self.installed.clear();
        }

        let provider = self.shared.provider.clone();
        let template = self.shared.settings.template.clone();
        let lifetime = self.shared.settings.max_age;
        let policy = self.shared.settings.provision_policy.clone();
        let attempts_made = Arc::new(AtomicU32::new(0));
        let counter = attempts_made.clone();

        let provisioning = retry(&policy, "sandbox.provision", SandboxError::is_retryable, |attempt| {
            let provider = provider.clone();
            let template = template.clone();
            counter.store(attempt, Ordering::SeqCst);
            async move { provider.create(&template, lifetime).await }
        });

        let id = match tokio::time::timeout(budget, provisioning).await {
            Ok(Ok((id, attempts))) => {
                tracing::info!(session_id = %id, attempts, "Sandbox session acquired");
                id
            }
            Ok(Err(RetryError {
                error,
                attempts,
                exhausted,
            })) => {
                tracing::warn!(attempts, exhausted, error = %error, "Sandbox provisioning failed");
                return Err(match error {
                    SandboxError::QuotaExceeded(_) | SandboxError::Auth(_) => error,
                    other => SandboxError::Provision {
                        attempts,
                        message: other.to_string(),
                    },
                });
            }
            Err(_) => {
                return Err(SandboxError::Provision {
                    attempts: attempts_made.load(Ordering::SeqCst),
                    message: format!("provisioning exceeded its {:?} budget", budget),
                });
            }
        };

        self.shared.register(&id);
        let now = Instant::now();
        self.session = Some(Session {
            id,
            created_at: now,
            last_used: now,
            commands: 0,
        });
        Ok(())
    }

    /// Install every tool in `manifest` that this session does not have yet.
    /// Partial failure is reported; only a total failure is an error.
    pub async fn ensure_tools(&mut self, manifest: &[String]) -> Result<ToolReport, SandboxError> {
        self.manifest = manifest.to_vec();
        self.install_missing().await
    }

    async fn install_missing(&mut self) -> Result<ToolReport, SandboxError> {
        let session_id = self.held()?.id.clone();
        let timeout = self.shared.settings.command_timeout;
        let mut report = ToolReport::default();

        let missing: Vec<String> = self
            .manifest
            .iter()
            .filter(|t| !self.installed.contains(*t))
            .cloned()
            .collect();
        report.already_present = self.manifest.len() - missing.len();
        if missing.is_empty() {
            return Ok(report);
        }

        for package in missing {
            let command = install_command(&package);
            match run_on(self.shared.provider.as_ref(), &session_id, &command, timeout).await {
                Ok(out) if out.success() => {
                    self.installed.insert(package.clone());
                    report.installed.push(package);
                }
                Ok(out) => {
                    tracing::debug!(tool = %package, exit_code = out.exit_code, "Tool install failed");
                    report.failed.push(package);
                }
                Err(e @ (SandboxError::QuotaExceeded(_) | SandboxError::Auth(_))) => return Err(e),
                Err(e) => {
                    tracing::debug!(tool = %package, error = %e, "Tool install failed");
                    report.failed.push(package);
                }
            }
        }
        self.touch(report.installed.len() as u32 + report.failed.len() as u32);

        if !report.failed.is_empty() {
            if self.installed.is_empty() {
                return Err(SandboxError::ToolsUnavailable(report.failed));
            }
            tracing::warn!(failed = ?report.failed, "Some sandbox tools could not be installed");
        }
        Ok(report)
    }

    /// Run one command. A timeout or disconnect is retried once on a fresh
    /// session; exit 127 reinstalls the manifest and retries once.
    pub async fn execute(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, SandboxError> {
        let first = self.run_once(command, timeout).await;
        self.recover(command, timeout, first).await
    }

    /// Run independent commands concurrently on the held session and join.
    /// Results are returned in input order.
    pub async fn execute_all(
        &mut self,
        commands: &[String],
        timeout: Duration,
    ) -> Result<Vec<Result<CommandOutput, SandboxError>>, SandboxError> {
        self.refresh_if_stale().await?;
        let session_id = self.held()?.id.clone();
        let provider = self.shared.provider.clone();
        let firsts = join_all(
            commands
                .iter()
                .map(|c| run_on(provider.as_ref(), &session_id, c, timeout)),
        )
        .await;
        self.touch(commands.len() as u32);

        let mut results = Vec::with_capacity(commands.len());
        for (command, first) in commands.iter().zip(firsts) {
            results.push(self.recover(command, timeout, first).await);
        }
        Ok(results)
    }

    async fn recover(
        &mut self,
        command: &str,
        timeout: Duration,
        first: Result<CommandOutput, SandboxError>,
    ) -> Result<CommandOutput, SandboxError> {
        match first {
            Ok(out) if out.exit_code == EXIT_COMMAND_NOT_FOUND => {
                let tool = command.split_whitespace().next().unwrap_or(command).to_string();
                tracing::info!(tool = %tool, "Command not found in sandbox, reinstalling tools");
                self.installed.clear();
                self.install_missing().await?;
                let retried = self.run_once(command, timeout).await?;
                if retried.exit_code == EXIT_COMMAND_NOT_FOUND {
                    return Err(SandboxError::ToolMissing(tool));
                }
                Ok(retried)
            }
            Err(err @ (SandboxError::ExecutionTimeout(_) | SandboxError::Disconnected(_))) => {
                tracing::warn!(error = %err, "Sandbox command failed, retrying on a fresh session");
                if let Some(old) = self.session.take() {
                    self.shared.close_session(&old.id).await;
                }
                self.installed.clear();
                self.acquire(self.shared.settings.acquire_timeout).await?;
                if !self.manifest.is_empty() {
                    self.install_missing().await?;
                }
                self.run_once(command, timeout).await
            }
            other => other,
        }
    }

    async fn run_once(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, SandboxError> {
        self.refresh_if_stale().await?;
        let session_id = self.held()?.id.clone();
        let result = run_on(self.shared.provider.as_ref(), &session_id, command, timeout).await;
        self.touch(1);
        result
    }

    async fn refresh_if_stale(&mut self) -> Result<(), SandboxError> {
        let stale = match &self.session {
            None => return Err(SandboxError::NotAcquired),
            Some(session) => self.is_stale(session),
        };
        if stale {
            self.acquire(self.shared.settings.acquire_timeout).await?;
            if !self.manifest.is_empty() {
                self.install_missing().await?;
            }
        }
        Ok(())
    }

    fn held(&self) -> Result<&Session, SandboxError> {
        self.session.as_ref().ok_or(SandboxError::NotAcquired)
    }

    fn touch(&mut self, commands: u32) {
        if let Some(session) = self.session.as_mut() {
            session.commands = session.commands.saturating_add(commands);
            session.last_used = Instant::now();
        }
    }

    /// Close the held session. Safe to call more than once.
    pub async fn release(&mut self) {
        if let Some(session) = self.session.take() {
            self.shared.close_session(&session.id).await;
        }
        self.installed.clear();
    }
}

impl Drop for SandboxClient {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let shared = self.shared.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    shared.close_session(&session.id).await;
                });
            }
            Err(_) => {
                tracing::warn!(session_id = %session.id, "Sandbox client dropped outside a runtime; leaving session to the reaper");
            }
        }
    }
}

async fn run_on(
    provider: &dyn SandboxProvider,
    session_id: &str,
    command: &str,
    timeout: Duration,
) -> Result<CommandOutput, SandboxError> {
    match tokio::time::timeout(timeout, provider.run(session_id, command, timeout)).await {
        Ok(result) => result,
        Err(_) => Err(SandboxError::ExecutionTimeout(timeout)),
    }
}

/// Binary that proves a package is installed.
fn tool_binary(package: &str) -> &str {
    match package {
        "dnsutils" => "dig",
        "netcat-openbsd" => "nc",
        other => other,
    }
}

fn install_command(package: &str) -> String {
    format!(
        "command -v {bin} >/dev/null 2>&1 || (apt-get update -qq >/dev/null 2>&1; DEBIAN_FRONTEND=noninteractive apt-get install -y -qq {pkg} >/dev/null 2>&1 && command -v {bin} >/dev/null 2>&1)",
        bin = tool_binary(package),
        pkg = package
    )
}
