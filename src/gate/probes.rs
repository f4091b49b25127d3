use std::sync::Arc;

use async_trait::async_trait;

use super::{HealthProbe, ProbeIssue};
use crate::capture::CaptureClient;
use crate::config::{AppConfig, Secret};
use crate::errors::PublishError;
use crate::llm::Analyst;
use crate::publish::{ChangePublisher, is_placeholder};
use crate::sandbox::SandboxManager;
use crate::store::DbHandle;

fn credential_state(value: Option<&Secret>) -> CredentialState {
    match value {
        None => CredentialState::Missing,
        Some(s) if s.is_blank() => CredentialState::Missing,
        Some(s) if is_placeholder(s.expose()) => CredentialState::Placeholder,
        Some(_) => CredentialState::Present,
    }
}

fn plain_state(value: Option<&str>) -> CredentialState {
    credential_state(value.map(Secret::new).as_ref())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CredentialState {
    Missing,
    Placeholder,
    Present,
}

/// Presence and placeholder checks for every credential. No network.
pub struct CredentialsProbe {
    sandbox_key: Option<Secret>,
    llm_key: Option<Secret>,
    capture_key: Option<Secret>,
    capture_project: Option<String>,
}

impl CredentialsProbe {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            sandbox_key: config.sandbox.api_key.clone(),
            llm_key: config.llm.api_key.clone(),
            capture_key: config.capture.api_key.clone(),
            capture_project: config.capture.project_id.clone(),
        }
    }
}

#[async_trait]
impl HealthProbe for CredentialsProbe {
    fn name(&self) -> &'static str {
        "credentials"
    }

    fn required(&self) -> bool {
        true
    }

    async fn probe(&self) -> Vec<ProbeIssue> {
        let mut issues = Vec::new();
        for (dependency, key, value) in [
            ("sandbox", "E2B_API_KEY", credential_state(self.sandbox_key.as_ref())),
            ("llm", "XAI_API_KEY", credential_state(self.llm_key.as_ref())),
        ] {
            match value {
                CredentialState::Missing => issues.push(ProbeIssue::error(dependency, format!("{} is not set", key))),
                CredentialState::Placeholder => {
                    issues.push(ProbeIssue::error(dependency, format!("{} appears to be a placeholder", key)))
                }
                CredentialState::Present => {}
            }
        }

        // Optional, but a placeholder is still a configuration error.
        for (key, value) in [
            ("BROWSERBASE_API_KEY", credential_state(self.capture_key.as_ref())),
            ("BROWSERBASE_PROJECT_ID", plain_state(self.capture_project.as_deref())),
        ] {
            if value == CredentialState::Placeholder {
                issues.push(ProbeIssue::error("capture", format!("{} appears to be a placeholder", key)));
            }
        }
        issues
    }
}

pub struct SandboxProbe {
    manager: SandboxManager,
    configured: bool,
}

impl SandboxProbe {
    pub fn new(manager: SandboxManager, config: &AppConfig) -> Self {
        Self {
            manager,
            configured: credential_state(config.sandbox.api_key.as_ref()) == CredentialState::Present,
        }
    }
}

#[async_trait]
impl HealthProbe for SandboxProbe {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    fn required(&self) -> bool {
        true
    }

    async fn probe(&self) -> Vec<ProbeIssue> {
        // Missing credentials are reported by the credentials probe.
        if !self.configured {
            return Vec::new();
        }
        match self.manager.ping().await {
            Ok(()) => Vec::new(),
            Err(e) => vec![ProbeIssue::error("sandbox", e.to_string())],
        }
    }
}

pub struct LlmProbe {
    analyst: Arc<dyn Analyst>,
    configured: bool,
}

impl LlmProbe {
    pub fn new(analyst: Arc<dyn Analyst>, config: &AppConfig) -> Self {
        Self {
            analyst,
            configured: credential_state(config.llm.api_key.as_ref()) == CredentialState::Present,
        }
    }
}

#[async_trait]
impl HealthProbe for LlmProbe {
    fn name(&self) -> &'static str {
        "llm"
    }

    fn required(&self) -> bool {
        true
    }

    async fn probe(&self) -> Vec<ProbeIssue> {
        if !self.configured {
            return Vec::new();
        }
        match self.analyst.ping().await {
            Ok(()) => Vec::new(),
            Err(e) => vec![ProbeIssue::error("llm", e.to_string())],
        }
    }
}

pub struct DatabaseProbe {
    db: DbHandle,
}

impl DatabaseProbe {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl HealthProbe for DatabaseProbe {
    fn name(&self) -> &'static str {
        "database"
    }

    fn required(&self) -> bool {
        true
    }

    async fn probe(&self) -> Vec<ProbeIssue> {
        match self.db.call(|db| db.ping()).await {
            Ok(()) => Vec::new(),
            Err(e) => vec![ProbeIssue::error("database", format!("{:#}", e))],
        }
    }
}

pub struct CaptureProbe {
    capture: Arc<CaptureClient>,
}

impl CaptureProbe {
    pub fn new(capture: Arc<CaptureClient>) -> Self {
        Self { capture }
    }
}

#[async_trait]
impl HealthProbe for CaptureProbe {
    fn name(&self) -> &'static str {
        "capture"
    }

    fn required(&self) -> bool {
        false
    }

    async fn probe(&self) -> Vec<ProbeIssue> {
        if !self.capture.is_enabled() {
            return vec![ProbeIssue::warning(
                "capture",
                "BROWSERBASE_API_KEY/BROWSERBASE_PROJECT_ID not set; visual evidence will be omitted",
            )];
        }
        match self.capture.ping().await {
            Ok(()) => Vec::new(),
            Err(e) => vec![ProbeIssue::warning("capture", format!("{}; visual evidence will be omitted", e))],
        }
    }
}

pub struct PublishProbe {
    publisher: Arc<ChangePublisher>,
}

impl PublishProbe {
    pub fn new(publisher: Arc<ChangePublisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl HealthProbe for PublishProbe {
    fn name(&self) -> &'static str {
        "publish"
    }

    fn required(&self) -> bool {
        false
    }

    async fn probe(&self) -> Vec<ProbeIssue> {
        if !self.publisher.is_configured() {
            return vec![ProbeIssue::warning(
                "publish",
                "GITHUB_TOKEN/GITHUB_REPO not set; patches will only be saved locally",
            )];
        }
        match self.publisher.check_access().await {
            Ok(access) => access
                .warnings
                .into_iter()
                .map(|w| ProbeIssue::warning("publish", w))
                .collect(),
            // A present but wrong credential is a configuration error.
            Err(
                e @ (PublishError::Config(_)
                | PublishError::Auth(_)
                | PublishError::Permission(_)
                | PublishError::NotFound(_)),
            ) => vec![ProbeIssue::error(
                "publish",
                format!("{} ({})", e, e.remediation_hint()),
            )],
            Err(e) => vec![ProbeIssue::warning("publish", format!("{}; publishing may be skipped", e))],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PublishConfig;
    use crate::gate::ValidationGate;
    use crate::store::Store;
    use std::time::Duration;

    fn config_with(sandbox: Option<&str>, llm: Option<&str>) -> AppConfig {
        let mut config = AppConfig::default();
        config.sandbox.api_key = sandbox.map(Secret::new);
        config.llm.api_key = llm.map(Secret::new);
        config
    }

    #[tokio::test]
    async fn test_missing_required_credentials_are_errors() {
        let probe = CredentialsProbe::new(&config_with(None, Some("xai-4f9Qz1LmN0pR7sT2")));
        let issues = probe.probe().await;
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].dependency, "sandbox");
        assert!(issues[0].message.contains("E2B_API_KEY"));
    }

    #[tokio::test]
    async fn test_placeholder_required_credential_is_error() {
        let probe = CredentialsProbe::new(&config_with(Some("your_e2b_key"), Some("xai-4f9Qz1LmN0pR7sT2")));
        let issues = probe.probe().await;
        assert!(issues[0].message.contains("placeholder"));
    }

    #[tokio::test]
    async fn test_absent_capture_credentials_are_fine_but_placeholders_are_not() {
        let mut config = config_with(Some("e2b_4f9Qz1LmN0pR7sT2"), Some("xai-4f9Qz1LmN0pR7sT2"));
        assert!(CredentialsProbe::new(&config).probe().await.is_empty());
        config.capture.api_key = Some(Secret::new("bb_live_xxxxxxxxxxxxxxxx"));
        let issues = CredentialsProbe::new(&config).probe().await;
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].dependency, "capture");
    }

    #[tokio::test]
    async fn test_unconfigured_capture_is_a_warning() {
        let probe = CaptureProbe::new(Arc::new(CaptureClient::disabled()));
        let issues = probe.probe().await;
        assert_eq!(issues[0].level, crate::gate::IssueLevel::Warning);
    }

    #[tokio::test]
    async fn test_database_probe() {
        let db = DbHandle::new(Store::new_in_memory().unwrap());
        assert!(DatabaseProbe::new(db).probe().await.is_empty());
    }

    #[tokio::test]
    async fn test_placeholder_publish_token_invalidates_report() {
        let publisher = Arc::new(ChangePublisher::new(&PublishConfig {
            token: Some(Secret::new("ghp_xxxxxxxxxxxxxxxxxxxxxxxxxxxx")),
            repo: Some("acme/webapp".into()),
            api_url: "http://127.0.0.1:9".into(),
            ..Default::default()
        }));
        let gate = ValidationGate::new(
            vec![Arc::new(PublishProbe::new(publisher))],
            Duration::from_secs(5),
        );
        let report = gate.run().await;
        assert!(!report.valid);
        assert!(report.errors[0].starts_with("publish:"));
        assert!(report.errors[0].contains("placeholder"));
    }

    #[tokio::test]
    async fn test_absent_publish_credentials_are_a_warning() {
        let publisher = Arc::new(ChangePublisher::new(&PublishConfig::default()));
        let issues = PublishProbe::new(publisher).probe().await;
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].level, crate::gate::IssueLevel::Warning);
    }
}
