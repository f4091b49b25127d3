//! Typed error hierarchy for autoctf.
//!
//! Each external collaborator gets its own enum so callers can match on the
//! failure class instead of parsing messages:
//! - `AdmissionError`: rejected `StartRun` requests
//! - `PhaseFailure`: per-phase failures with a retryable/fatal classification
//! - `SandboxError`, `CaptureError`, `PublishError`, `AnalystError`: client failures
//!
//! Every terminal run failure carries a [`ReasonCode`] plus a remediation hint.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable reason attached to every failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Interrupted,
    Cancelled,
    InvalidTarget,
    MissingCredentials,
    MalformedInput,
    ProvisionFailed,
    ToolsUnavailable,
    QuotaExceeded,
    ExecutionTimeout,
    RateLimited,
    RetriesExhausted,
    PhaseTimeout,
    InconsistentArtifacts,
    PersistenceError,
    InternalError,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interrupted => "interrupted",
            Self::Cancelled => "cancelled",
            Self::InvalidTarget => "invalid_target",
            Self::MissingCredentials => "missing_credentials",
            Self::MalformedInput => "malformed_input",
            Self::ProvisionFailed => "provision_failed",
            Self::ToolsUnavailable => "tools_unavailable",
            Self::QuotaExceeded => "quota_exceeded",
            Self::ExecutionTimeout => "execution_timeout",
            Self::RateLimited => "rate_limited",
            Self::RetriesExhausted => "retries_exhausted",
            Self::PhaseTimeout => "phase_timeout",
            Self::InconsistentArtifacts => "inconsistent_artifacts",
            Self::PersistenceError => "persistence_error",
            Self::InternalError => "internal_error",
        }
    }

    /// Operator-facing hint for resolving a failure with this reason.
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::Interrupted => {
                "The process restarted while this run was in flight. Start a new run for the target."
            }
            Self::Cancelled => "The run was cancelled by an operator. Start a new run when ready.",
            Self::InvalidTarget => {
                "Check the target's URL or repository reference and make sure it is reachable."
            }
            Self::MissingCredentials => {
                "Set the missing or rejected credential in the environment or autoctf.toml, then re-run `autoctf validate`."
            }
            Self::MalformedInput => {
                "The analysis model returned output that could not be parsed. Retry the run or switch models."
            }
            Self::ProvisionFailed => {
                "The sandbox provider could not start an environment. Check provider status and the sandbox template."
            }
            Self::ToolsUnavailable => {
                "A required tool is missing from the sandbox. Add it to sandbox.tools or the sandbox template; repository targets need git."
            }
            Self::QuotaExceeded => {
                "The sandbox quota is exhausted. Close idle sandboxes, wait for the quota window, or upgrade the plan."
            }
            Self::ExecutionTimeout => {
                "A sandbox command timed out twice. Raise sandbox.command_timeout_secs or narrow the scan."
            }
            Self::RateLimited => "An external service is rate limiting requests. Wait a few minutes and retry.",
            Self::RetriesExhausted => {
                "A transient failure persisted past the retry ceiling. Check the failing service and retry."
            }
            Self::PhaseTimeout => {
                "A phase exceeded its time budget. Raise the phase timeout under [orchestrator.phase_timeouts]."
            }
            Self::InconsistentArtifacts => {
                "The run produced artifacts that reference missing findings. Report this run for investigation."
            }
            Self::PersistenceError => "The database could not be written. Check disk space and DATABASE_URL.",
            Self::InternalError => "An unexpected internal error occurred. Check the server logs for this run.",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReasonCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interrupted" => Ok(Self::Interrupted),
            "cancelled" => Ok(Self::Cancelled),
            "invalid_target" => Ok(Self::InvalidTarget),
            "missing_credentials" => Ok(Self::MissingCredentials),
            "malformed_input" => Ok(Self::MalformedInput),
            "provision_failed" => Ok(Self::ProvisionFailed),
            "tools_unavailable" => Ok(Self::ToolsUnavailable),
            "quota_exceeded" => Ok(Self::QuotaExceeded),
            "execution_timeout" => Ok(Self::ExecutionTimeout),
            "rate_limited" => Ok(Self::RateLimited),
            "retries_exhausted" => Ok(Self::RetriesExhausted),
            "phase_timeout" => Ok(Self::PhaseTimeout),
            "inconsistent_artifacts" => Ok(Self::InconsistentArtifacts),
            "persistence_error" => Ok(Self::PersistenceError),
            "internal_error" => Ok(Self::InternalError),
            _ => Err(format!("Invalid reason code: {}", s)),
        }
    }
}

/// Errors returned synchronously by `StartRun`. Never retried automatically.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Run {run_id} is already in progress for target {target_id}")]
    Conflict { target_id: i64, run_id: i64 },

    #[error("Dependencies not ready: {}", failing.join("; "))]
    NotReady { failing: Vec<String> },

    #[error("Target {id} not found")]
    TargetNotFound { id: i64 },

    #[error("Target {id} is {status} and cannot be scanned")]
    TargetInactive { id: i64, status: String },

    #[error("Failed to record run: {0}")]
    Persistence(#[source] anyhow::Error),
}

/// Whether a phase failure may be absorbed by the phase retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Retryable,
    Fatal,
}

/// Failure of a single phase attempt.
#[derive(Debug, Clone, Error)]
#[error("{reason}: {message}")]
pub struct PhaseFailure {
    pub kind: FailureKind,
    pub reason: ReasonCode,
    pub message: String,
}

impl PhaseFailure {
    pub fn retryable(reason: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            reason,
            message: message.into(),
        }
    }

    pub fn fatal(reason: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            reason,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Retryable
    }

    /// Promote a retryable failure to fatal once the attempt ceiling is hit.
    /// Phase timeouts keep their own reason code.
    pub fn escalate(self, attempts: u32) -> Self {
        if !self.is_retryable() {
            return self;
        }
        let reason = match self.reason {
            ReasonCode::PhaseTimeout => ReasonCode::PhaseTimeout,
            _ => ReasonCode::RetriesExhausted,
        };
        Self::fatal(
            reason,
            format!("{} after {} attempts ({})", self.message, attempts, self.reason),
        )
    }
}

impl From<SandboxError> for PhaseFailure {
    fn from(err: SandboxError) -> Self {
        let message = err.to_string();
        match err {
            SandboxError::QuotaExceeded(_) => Self::fatal(ReasonCode::QuotaExceeded, message),
            SandboxError::Provision { .. } => Self::fatal(ReasonCode::ProvisionFailed, message),
            SandboxError::Auth(_) => Self::fatal(ReasonCode::MissingCredentials, message),
            SandboxError::ExecutionTimeout(_) => Self::fatal(ReasonCode::ExecutionTimeout, message),
            SandboxError::ToolsUnavailable(_) | SandboxError::ToolMissing(_) => {
                Self::fatal(ReasonCode::ToolsUnavailable, message)
            }
            SandboxError::Disconnected(_) | SandboxError::Transient(_) => {
                Self::retryable(ReasonCode::RetriesExhausted, message)
            }
            SandboxError::Rejected(_) | SandboxError::NotAcquired => Self::fatal(ReasonCode::InternalError, message),
        }
    }
}

impl From<AnalystError> for PhaseFailure {
    fn from(err: AnalystError) -> Self {
        let message = err.to_string();
        match err {
            AnalystError::Malformed(_) => Self::fatal(ReasonCode::MalformedInput, message),
            AnalystError::Auth(_) => Self::fatal(ReasonCode::MissingCredentials, message),
            AnalystError::RateLimited(_) => Self::retryable(ReasonCode::RateLimited, message),
            AnalystError::Transient(_) => Self::retryable(ReasonCode::RetriesExhausted, message),
            AnalystError::Rejected(_) => Self::fatal(ReasonCode::InternalError, message),
        }
    }
}

/// Errors from the remote execution sandbox.
#[derive(Debug, Clone, Error)]
pub enum SandboxError {
    #[error("Sandbox provisioning failed after {attempts} attempt(s): {message}")]
    Provision { attempts: u32, message: String },

    #[error("Sandbox quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Sandbox command timed out after {0:?}")]
    ExecutionTimeout(Duration),

    #[error("Sandbox connection lost: {0}")]
    Disconnected(String),

    #[error("Tool '{0}' is not installed in the sandbox")]
    ToolMissing(String),

    #[error("No scanning tools could be installed: {}", .0.join(", "))]
    ToolsUnavailable(Vec<String>),

    #[error("Sandbox authentication failed: {0}")]
    Auth(String),

    #[error("Sandbox request failed: {0}")]
    Transient(String),

    #[error("Sandbox rejected the request: {0}")]
    Rejected(String),

    #[error("No sandbox session is held")]
    NotAcquired,
}

impl SandboxError {
    /// Errors worth another provisioning attempt. Quota and auth failures
    /// must reach the operator unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Disconnected(_) | Self::ExecutionTimeout(_)
        )
    }
}

/// Errors from the artifact-capture service.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("Capture service rate limited the request after {attempts} attempt(s)")]
    RateLimited { attempts: u32 },

    #[error("Capture service authentication failed: {0}")]
    Auth(String),

    #[error("Capture request failed: {0}")]
    Transient(String),

    #[error("Capture service is not configured")]
    Disabled,
}

impl CaptureError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_))
    }
}

/// Errors from the change-publishing (source hosting) client.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    #[error("Source hosting authentication failed (401): {0}")]
    Auth(String),

    #[error("Source hosting access forbidden (403): {0}")]
    Permission(String),

    #[error("Repository or resource not found (404): {0}")]
    NotFound(String),

    #[error("Source hosting rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Publishing is misconfigured: {0}")]
    Config(String),

    #[error("Source hosting request failed: {0}")]
    Request(String),
}

impl PublishError {
    /// Map a non-success HTTP status to a typed error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => Self::Auth(message),
            403 if message.to_lowercase().contains("rate limit") => Self::RateLimit(message),
            403 => Self::Permission(message),
            404 => Self::NotFound(message),
            429 => Self::RateLimit(message),
            _ => Self::Request(format!("HTTP {}: {}", status, message)),
        }
    }

    /// Throttling and transport failures are worth another attempt; auth,
    /// permission, missing resources and configuration never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimit(_) | Self::Request(_))
    }

    pub fn remediation_hint(&self) -> &'static str {
        match self {
            Self::Auth(_) => {
                "The token is invalid or expired. Generate a new one at https://github.com/settings/tokens"
            }
            Self::Permission(_) => {
                "The token lacks write access. Ensure it has the 'repo' scope and push rights on the repository."
            }
            Self::NotFound(_) => {
                "Check GITHUB_REPO uses the owner/repository format and the token can see the repository."
            }
            Self::RateLimit(_) => "The API rate limit is exhausted. Wait for the reset window before publishing.",
            Self::Config(_) => "Set GITHUB_TOKEN and GITHUB_REPO to real values, then re-run `autoctf validate`.",
            Self::Request(_) => "Check network connectivity to the source hosting API.",
        }
    }
}

/// Errors from the analysis model client.
#[derive(Debug, Clone, Error)]
pub enum AnalystError {
    #[error("Model authentication failed: {0}")]
    Auth(String),

    #[error("Model rate limited the request: {0}")]
    RateLimited(String),

    #[error("Model request failed: {0}")]
    Transient(String),

    #[error("Model rejected the request: {0}")]
    Rejected(String),

    #[error("Model output could not be parsed: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_code_round_trips_through_str() {
        for code in [
            ReasonCode::Interrupted,
            ReasonCode::QuotaExceeded,
            ReasonCode::InconsistentArtifacts,
        ] {
            assert_eq!(code.as_str().parse::<ReasonCode>().unwrap(), code);
        }
        assert!("bogus".parse::<ReasonCode>().is_err());
    }

    #[test]
    fn every_reason_code_has_a_remediation() {
        let all = [
            ReasonCode::Interrupted,
            ReasonCode::Cancelled,
            ReasonCode::InvalidTarget,
            ReasonCode::MissingCredentials,
            ReasonCode::MalformedInput,
            ReasonCode::ProvisionFailed,
            ReasonCode::ToolsUnavailable,
            ReasonCode::QuotaExceeded,
            ReasonCode::ExecutionTimeout,
            ReasonCode::RateLimited,
            ReasonCode::RetriesExhausted,
            ReasonCode::PhaseTimeout,
            ReasonCode::InconsistentArtifacts,
            ReasonCode::PersistenceError,
            ReasonCode::InternalError,
        ];
        for code in all {
            assert!(!code.remediation().is_empty(), "{} has no hint", code);
        }
    }

    #[test]
    fn not_ready_lists_every_failing_dependency() {
        let err = AdmissionError::NotReady {
            failing: vec!["sandbox: E2B_API_KEY is not set".into(), "llm: XAI_API_KEY is not set".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("E2B_API_KEY"));
        assert!(msg.contains("XAI_API_KEY"));
    }

    #[test]
    fn escalate_turns_retryable_into_retries_exhausted() {
        let failure = PhaseFailure::retryable(ReasonCode::RateLimited, "429 from model");
        let escalated = failure.escalate(3);
        assert_eq!(escalated.kind, FailureKind::Fatal);
        assert_eq!(escalated.reason, ReasonCode::RetriesExhausted);
        assert!(escalated.message.contains("3 attempts"));
    }

    #[test]
    fn escalate_keeps_phase_timeout_reason() {
        let escalated = PhaseFailure::retryable(ReasonCode::PhaseTimeout, "recon exceeded 600s").escalate(3);
        assert_eq!(escalated.kind, FailureKind::Fatal);
        assert_eq!(escalated.reason, ReasonCode::PhaseTimeout);
    }

    #[test]
    fn escalate_leaves_fatal_untouched() {
        let failure = PhaseFailure::fatal(ReasonCode::InvalidTarget, "no url");
        let escalated = failure.escalate(1);
        assert_eq!(escalated.reason, ReasonCode::InvalidTarget);
    }

    #[test]
    fn sandbox_quota_is_fatal_and_not_retryable() {
        let err = SandboxError::QuotaExceeded("limit reached".into());
        assert!(!err.is_retryable());
        let failure: PhaseFailure = err.into();
        assert_eq!(failure.kind, FailureKind::Fatal);
        assert_eq!(failure.reason, ReasonCode::QuotaExceeded);
    }

    #[test]
    fn missing_tool_is_a_dependency_failure() {
        let failure: PhaseFailure = SandboxError::ToolMissing("git".into()).into();
        assert_eq!(failure.kind, FailureKind::Fatal);
        assert_eq!(failure.reason, ReasonCode::ToolsUnavailable);
        assert!(failure.reason.remediation().contains("sandbox.tools"));
    }

    #[test]
    fn sandbox_disconnect_maps_to_retryable_phase_failure() {
        let failure: PhaseFailure = SandboxError::Disconnected("reset".into()).into();
        assert!(failure.is_retryable());
    }

    #[test]
    fn publish_status_mapping_is_distinct() {
        assert!(matches!(PublishError::from_status(401, "bad"), PublishError::Auth(_)));
        assert!(matches!(PublishError::from_status(403, "nope"), PublishError::Permission(_)));
        assert!(matches!(
            PublishError::from_status(403, "API rate limit exceeded"),
            PublishError::RateLimit(_)
        ));
        assert!(matches!(PublishError::from_status(404, "missing"), PublishError::NotFound(_)));
        assert!(matches!(PublishError::from_status(429, "slow"), PublishError::RateLimit(_)));
        assert!(matches!(PublishError::from_status(500, "boom"), PublishError::Request(_)));
    }

    #[test]
    fn only_throttling_and_transport_publish_errors_retry() {
        assert!(PublishError::from_status(429, "slow").is_retryable());
        assert!(PublishError::from_status(502, "bad gateway").is_retryable());
        assert!(!PublishError::from_status(401, "bad").is_retryable());
        assert!(!PublishError::from_status(404, "missing").is_retryable());
        assert!(!PublishError::Config("unset".into()).is_retryable());
    }

    #[test]
    fn publish_hints_differ_per_variant() {
        let auth = PublishError::Auth(String::new()).remediation_hint();
        let perm = PublishError::Permission(String::new()).remediation_hint();
        let missing = PublishError::NotFound(String::new()).remediation_hint();
        assert_ne!(auth, perm);
        assert_ne!(perm, missing);
    }

    #[test]
    fn malformed_model_output_is_fatal() {
        let failure: PhaseFailure = AnalystError::Malformed("not json".into()).into();
        assert_eq!(failure.reason, ReasonCode::MalformedInput);
        assert!(!failure.is_retryable());
    }
}
