//! Process wiring: builds every collaborator from [`AppConfig`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::capture::CaptureClient;
use crate::config::AppConfig;
use crate::gate::{
    CaptureProbe, CredentialsProbe, DatabaseProbe, HealthProbe, LlmProbe, PublishProbe, SandboxProbe,
    ValidationGate,
};
use crate::llm::{Analyst, HttpAnalyst};
use crate::orchestrator::{EventHub, Orchestrator, OrchestratorSettings, Services};
use crate::publish::ChangePublisher;
use crate::sandbox::{HttpSandboxProvider, SandboxManager, SandboxSettings};
use crate::store::{DbHandle, Store};

/// A fully wired process: store, clients, validation gate and orchestrator.
pub struct App {
    pub config: AppConfig,
    pub orchestrator: Orchestrator,
    sandbox: SandboxManager,
    background: Vec<JoinHandle<()>>,
}

/// Health probes for every collaborator, required ones first.
pub fn probes(
    config: &AppConfig,
    db: &DbHandle,
    sandbox: &SandboxManager,
    services: &Services,
) -> Vec<Arc<dyn HealthProbe>> {
    vec![
        Arc::new(CredentialsProbe::new(config)),
        Arc::new(DatabaseProbe::new(db.clone())),
        Arc::new(SandboxProbe::new(sandbox.clone(), config)),
        Arc::new(LlmProbe::new(services.analyst.clone(), config)),
        Arc::new(CaptureProbe::new(services.capture.clone())),
        Arc::new(PublishProbe::new(services.publisher.clone())),
    ]
}

impl App {
    /// Open the store and wire every client. No network calls are made.
    pub fn build(config: AppConfig) -> Result<Self> {
        let store = Store::new(&config.database.path)
            .with_context(|| format!("Failed to open database at {}", config.database.path.display()))?;
        let db = DbHandle::new(store);

        let provider = Arc::new(HttpSandboxProvider::new(&config.sandbox));
        let sandbox = SandboxManager::new(provider, SandboxSettings::from(&config.sandbox));
        let analyst: Arc<dyn Analyst> = Arc::new(HttpAnalyst::new(&config.llm));
        let services = Services {
            analyst,
            capture: Arc::new(CaptureClient::from_config(&config.capture)),
            publisher: Arc::new(ChangePublisher::new(&config.publish)),
        };

        let gate = Arc::new(ValidationGate::new(
            probes(&config, &db, &sandbox, &services),
            Duration::from_secs(config.gate.probe_timeout_secs),
        ));
        let orchestrator = Orchestrator::new(
            db,
            gate,
            sandbox.clone(),
            services,
            Arc::new(EventHub::default()),
            OrchestratorSettings::from_config(&config),
        );

        Ok(Self {
            config,
            orchestrator,
            sandbox,
            background: Vec::new(),
        })
    }

    /// Run the validation gate once so admission has a current report.
    pub async fn prepare(&self) {
        self.orchestrator.gate().run().await;
    }

    /// Fail runs left non-terminal by a previous server process.
    ///
    /// Only the long-running server may do this. A one-shot `autoctf run`
    /// can share the database with a live server, and recovering there
    /// would fail runs that server is still executing.
    pub async fn recover_interrupted(&self) -> Result<()> {
        let interrupted = self.orchestrator.recover_interrupted().await?;
        if !interrupted.is_empty() {
            tracing::warn!(runs = ?interrupted, "Failed runs interrupted by the previous shutdown");
        }
        Ok(())
    }

    /// Start the sandbox reaper and, when configured, periodic revalidation.
    pub fn spawn_background(&mut self) {
        let reaper = Duration::from_secs(self.config.sandbox.reaper_interval_secs.max(1));
        self.background.push(self.sandbox.spawn_reaper(reaper));
        if let Some(secs) = self.config.gate.revalidate_interval_secs.filter(|s| *s > 0) {
            self.background
                .push(self.orchestrator.gate().spawn_revalidation(Duration::from_secs(secs)));
        }
    }

    pub async fn shutdown(self) {
        for task in &self.background {
            task.abort();
        }
        self.orchestrator.shutdown().await;
        tracing::info!("Shutdown complete");
    }
}
