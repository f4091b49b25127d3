//! Layered configuration for autoctf.
//!
//! Values are resolved in order: built-in defaults, then `.autoctf/autoctf.toml`
//! (or the file passed with `--config`), then environment variables (a `.env`
//! file is loaded first), then CLI flags.
//!
//! ```toml
//! [sandbox]
//! template = "base"
//! idle_timeout_secs = 900
//!
//! [capture]
//! freshness_window_secs = 300
//!
//! [orchestrator]
//! max_concurrent_runs = 4
//! exploit_limit = 2
//!
//! [orchestrator.phase_timeouts]
//! recon_secs = 900
//!
//! [server]
//! port = 8000
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::store::models::Phase;

pub const DEFAULT_CONFIG_PATH: &str = ".autoctf/autoctf.toml";

/// A credential value. `Debug` never prints the secret.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Remote execution sandbox settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub api_key: Option<Secret>,
    #[serde(default = "default_sandbox_api_url")]
    pub api_url: String,
    #[serde(default = "default_sandbox_template")]
    pub template: String,
    /// Sessions unused for longer than this are recycled.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Hard lifetime after which the reaper closes a session.
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
    #[serde(default = "default_max_commands")]
    pub max_commands_per_session: u32,
    #[serde(default = "default_provision_attempts")]
    pub provision_attempts: u32,
    #[serde(default = "default_provision_backoff_ms")]
    pub provision_backoff_ms: u64,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
    #[serde(default = "default_tools")]
    pub tools: Vec<String>,
}

fn default_sandbox_api_url() -> String {
    "https://api.e2b.dev".to_string()
}
fn default_sandbox_template() -> String {
    "base".to_string()
}
fn default_idle_timeout() -> u64 {
    900
}
fn default_max_age() -> u64 {
    3600
}
fn default_max_commands() -> u32 {
    100
}
fn default_provision_attempts() -> u32 {
    3
}
fn default_provision_backoff_ms() -> u64 {
    1000
}
fn default_acquire_timeout() -> u64 {
    120
}
fn default_command_timeout() -> u64 {
    300
}
fn default_reaper_interval() -> u64 {
    60
}
fn default_tools() -> Vec<String> {
    [
        "nmap",
        "nikto",
        "gobuster",
        "sqlmap",
        "curl",
        "wget",
        "git",
        "whois",
        "dnsutils",
        "netcat-openbsd",
    ]
    .iter()
    .map(|t| t.to_string())
    .collect()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: default_sandbox_api_url(),
            template: default_sandbox_template(),
            idle_timeout_secs: default_idle_timeout(),
            max_age_secs: default_max_age(),
            max_commands_per_session: default_max_commands(),
            provision_attempts: default_provision_attempts(),
            provision_backoff_ms: default_provision_backoff_ms(),
            acquire_timeout_secs: default_acquire_timeout(),
            command_timeout_secs: default_command_timeout(),
            reaper_interval_secs: default_reaper_interval(),
            tools: default_tools(),
        }
    }
}

impl SandboxConfig {
    pub fn provision_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.provision_attempts,
            Duration::from_millis(self.provision_backoff_ms),
        )
    }
}

/// Screenshot/evidence capture service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub api_key: Option<Secret>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default = "default_capture_api_url")]
    pub api_url: String,
    #[serde(default = "default_freshness_window")]
    pub freshness_window_secs: u64,
    #[serde(default = "default_capture_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_capture_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_capture_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_capture_api_url() -> String {
    "https://api.browserbase.com/v1".to_string()
}
fn default_freshness_window() -> u64 {
    300
}
fn default_capture_attempts() -> u32 {
    3
}
fn default_capture_retry_delay_ms() -> u64 {
    5000
}
fn default_capture_request_timeout() -> u64 {
    60
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            project_id: None,
            api_url: default_capture_api_url(),
            freshness_window_secs: default_freshness_window(),
            max_attempts: default_capture_attempts(),
            retry_delay_ms: default_capture_retry_delay_ms(),
            request_timeout_secs: default_capture_request_timeout(),
        }
    }
}

impl CaptureConfig {
    pub fn is_configured(&self) -> bool {
        self.api_key.as_ref().is_some_and(|k| !k.is_blank())
            && self.project_id.as_deref().is_some_and(|p| !p.trim().is_empty())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(self.max_attempts, Duration::from_millis(self.retry_delay_ms))
    }
}

/// Source-hosting settings used for publishing patches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    #[serde(default)]
    pub token: Option<Secret>,
    /// `owner/repo` or a GitHub URL.
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default = "default_github_api_url")]
    pub api_url: String,
    #[serde(default = "default_min_rate_limit")]
    pub min_rate_limit: u64,
    #[serde(default = "default_publish_request_timeout")]
    pub request_timeout_secs: u64,
    /// Attempts per API request when throttled or on 5xx/network errors.
    #[serde(default = "default_publish_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_publish_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}
fn default_min_rate_limit() -> u64 {
    100
}
fn default_publish_request_timeout() -> u64 {
    30
}
fn default_publish_attempts() -> u32 {
    3
}
fn default_publish_retry_delay_ms() -> u64 {
    1000
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            token: None,
            repo: None,
            api_url: default_github_api_url(),
            min_rate_limit: default_min_rate_limit(),
            request_timeout_secs: default_publish_request_timeout(),
            max_attempts: default_publish_attempts(),
            retry_delay_ms: default_publish_retry_delay_ms(),
        }
    }
}

impl PublishConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_attempts, Duration::from_millis(self.retry_delay_ms))
    }
}

/// Analysis model settings (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: Option<Secret>,
    #[serde(default = "default_llm_api_url")]
    pub api_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_request_timeout")]
    pub request_timeout_secs: u64,
    /// Recon output is truncated to this many characters before analysis.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

fn default_llm_api_url() -> String {
    "https://api.x.ai/v1".to_string()
}
fn default_llm_model() -> String {
    "grok-2-1212".to_string()
}
fn default_llm_request_timeout() -> u64 {
    120
}
fn default_max_input_chars() -> usize {
    16_000
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: default_llm_api_url(),
            model: default_llm_model(),
            request_timeout_secs: default_llm_request_timeout(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".autoctf/autoctf.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Per-phase time budgets, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTimeouts {
    #[serde(default = "default_recon_timeout")]
    pub recon_secs: u64,
    #[serde(default = "default_analyze_timeout")]
    pub analyze_secs: u64,
    #[serde(default = "default_exploit_timeout")]
    pub exploit_secs: u64,
    #[serde(default = "default_patch_timeout")]
    pub patch_secs: u64,
    #[serde(default = "default_report_timeout")]
    pub report_secs: u64,
}

fn default_recon_timeout() -> u64 {
    1800
}
fn default_analyze_timeout() -> u64 {
    300
}
fn default_exploit_timeout() -> u64 {
    1200
}
fn default_patch_timeout() -> u64 {
    600
}
fn default_report_timeout() -> u64 {
    300
}

impl PhaseTimeouts {
    pub fn for_phase(&self, phase: Phase) -> Duration {
        Duration::from_secs(match phase {
            Phase::Recon => self.recon_secs,
            Phase::Analyze => self.analyze_secs,
            Phase::Exploit => self.exploit_secs,
            Phase::Patch => self.patch_secs,
            Phase::Report => self.report_secs,
        })
    }
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            recon_secs: default_recon_timeout(),
            analyze_secs: default_analyze_timeout(),
            exploit_secs: default_exploit_timeout(),
            patch_secs: default_patch_timeout(),
            report_secs: default_report_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    #[serde(default)]
    pub phase_timeouts: PhaseTimeouts,
    #[serde(default = "default_phase_attempts")]
    pub phase_max_attempts: u32,
    #[serde(default = "default_phase_backoff_ms")]
    pub phase_backoff_ms: u64,
    /// Maximum findings the exploit phase will attempt per run.
    #[serde(default = "default_exploit_limit")]
    pub exploit_limit: usize,
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_max_concurrent_runs() -> usize {
    4
}
fn default_phase_attempts() -> u32 {
    3
}
fn default_phase_backoff_ms() -> u64 {
    2000
}
fn default_exploit_limit() -> usize {
    2
}
fn default_artifact_dir() -> PathBuf {
    PathBuf::from(".autoctf/artifacts")
}
fn default_shutdown_grace() -> u64 {
    30
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            phase_timeouts: PhaseTimeouts::default(),
            phase_max_attempts: default_phase_attempts(),
            phase_backoff_ms: default_phase_backoff_ms(),
            exploit_limit: default_exploit_limit(),
            artifact_dir: default_artifact_dir(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl OrchestratorConfig {
    pub fn phase_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.phase_max_attempts,
            Duration::from_millis(self.phase_backoff_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Re-run the gate in the background on this interval. Disabled when unset.
    #[serde(default)]
    pub revalidate_interval_secs: Option<u64>,
}

fn default_probe_timeout() -> u64 {
    10
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: default_probe_timeout(),
            revalidate_interval_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS for a locally served dashboard.
    #[serde(default)]
    pub cors: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors: false,
        }
    }
}

/// Top-level configuration as parsed from `autoctf.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl AppConfig {
    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse autoctf.toml")
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Resolve file and environment layers. An explicit path must exist; the
    /// default path is optional.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::load(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overlay environment variables using the given lookup.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("E2B_API_KEY") {
            self.sandbox.api_key = Some(Secret::new(v));
        }
        if let Some(v) = get("SANDBOX_API_URL") {
            self.sandbox.api_url = v;
        }
        if let Some(v) = get("XAI_API_KEY") {
            self.llm.api_key = Some(Secret::new(v));
        }
        if let Some(v) = get("LLM_API_URL") {
            self.llm.api_url = v;
        }
        if let Some(v) = get("LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = get("GITHUB_TOKEN") {
            self.publish.token = Some(Secret::new(v));
        }
        if let Some(v) = get("GITHUB_REPO") {
            self.publish.repo = Some(v);
        }
        if let Some(v) = get("BROWSERBASE_API_KEY") {
            self.capture.api_key = Some(Secret::new(v));
        }
        if let Some(v) = get("BROWSERBASE_PROJECT_ID") {
            self.capture.project_id = Some(v);
        }
        if let Some(v) = get("DATABASE_URL") {
            self.database.path = database_path_from_url(&v);
        }
        if let Some(v) = get("AUTOCTF_MAX_CONCURRENT_RUNS") {
            match v.parse::<usize>() {
                Ok(n) if n > 0 => self.orchestrator.max_concurrent_runs = n,
                _ => tracing::warn!(value = %v, "Ignoring invalid AUTOCTF_MAX_CONCURRENT_RUNS"),
            }
        }
    }

    pub fn phase_timeout(&self, phase: Phase) -> Duration {
        self.orchestrator.phase_timeouts.for_phase(phase)
    }
}

/// Accepts `sqlite://path`, `sqlite:path` or a bare file path.
fn database_path_from_url(url: &str) -> PathBuf {
    let trimmed = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    PathBuf::from(trimmed)
}
