use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ReasonCode;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Active,
    Archived,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }
}

impl FromStr for TargetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            // Older rows may carry "paused"; it is not admissible either.
            "archived" | "paused" => Ok(Self::Archived),
            _ => Err(format!("Invalid target status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    LiveUrl,
    Repository,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    pub name: String,
    pub url: Option<String>,
    pub ip_address: Option<String>,
    pub repo_url: Option<String>,
    pub status: TargetStatus,
    pub last_run_at: Option<String>,
    pub created_at: String,
}

impl Target {
    pub fn kind(&self) -> TargetKind {
        if self.repo_url.is_some() && self.url.is_none() {
            TargetKind::Repository
        } else {
            TargetKind::LiveUrl
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTarget {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub repo_url: Option<String>,
}

impl NewTarget {
    /// A target needs a live URL or a repository reference.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Target name must not be empty".into());
        }
        let has_url = self.url.as_deref().is_some_and(|u| !u.trim().is_empty());
        let has_repo = self.repo_url.as_deref().is_some_and(|r| !r.trim().is_empty());
        if !has_url && !has_repo {
            return Err("Target needs a url or a repo_url".into());
        }
        match self.url.as_deref().filter(|u| !u.trim().is_empty()) {
            Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                Err(format!("Target url must start with http:// or https://: {}", url))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    pub ip_address: Option<String>,
    pub repo_url: Option<String>,
    pub status: Option<TargetStatus>,
}

/// Pipeline phases in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Recon,
    Analyze,
    Exploit,
    Patch,
    Report,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Recon,
        Phase::Analyze,
        Phase::Exploit,
        Phase::Patch,
        Phase::Report,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recon => "recon",
            Self::Analyze => "analyze",
            Self::Exploit => "exploit",
            Self::Patch => "patch",
            Self::Report => "report",
        }
    }

    pub fn first() -> Self {
        Self::Recon
    }

    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Recon => Some(Self::Analyze),
            Self::Analyze => Some(Self::Exploit),
            Self::Exploit => Some(Self::Patch),
            Self::Patch => Some(Self::Report),
            Self::Report => None,
        }
    }

    /// 1-based position in the pipeline.
    pub fn ordinal(&self) -> i64 {
        match self {
            Self::Recon => 1,
            Self::Analyze => 2,
            Self::Exploit => 3,
            Self::Patch => 4,
            Self::Report => 5,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recon" => Ok(Self::Recon),
            "analyze" => Ok(Self::Analyze),
            "exploit" => Ok(Self::Exploit),
            "patch" => Ok(Self::Patch),
            "report" => Ok(Self::Report),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub target_id: i64,
    pub status: RunStatus,
    pub current_phase: Option<Phase>,
    pub reason_code: Option<ReasonCode>,
    pub error: Option<String>,
    pub remediation: Option<String>,
    pub pr_url: Option<String>,
    pub report_ref: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

/// How a run ended.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub reason_code: Option<ReasonCode>,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn completed() -> Self {
        Self {
            status: RunStatus::Completed,
            reason_code: None,
            error: None,
        }
    }

    pub fn failed(reason: ReasonCode, error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            reason_code: Some(reason),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Running,
    Succeeded,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid phase status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub id: i64,
    pub run_id: i64,
    pub seq: i64,
    pub phase: Phase,
    pub status: PhaseStatus,
    pub started_at: String,
    pub finished_at: Option<String>,
    /// Path of the raw output artifact, when the phase produced one.
    pub output_ref: Option<String>,
    pub summary: serde_json::Value,
    /// Explicit degradation markers such as "evidence omitted".
    pub notes: Vec<String>,
    pub retry_count: u32,
    pub error: Option<String>,
}

/// Values written when a phase record is finalized.
#[derive(Debug, Clone, Default)]
pub struct PhaseCompletion {
    pub output_ref: Option<String>,
    pub summary: serde_json::Value,
    pub notes: Vec<String>,
    pub retry_count: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Lenient parse for model output; unknown values become `Medium`.
    pub fn from_model(s: Option<&str>) -> Self {
        s.and_then(|v| v.trim().to_lowercase().parse().ok())
            .unwrap_or(Self::Medium)
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" | "informational" => Ok(Self::Info),
            "low" => Ok(Self::Low),
            "medium" | "moderate" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

/// Operator annotation on a finding. Not part of the run artifact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriageStatus {
    Open,
    Confirmed,
    FalsePositive,
    AcceptedRisk,
}

impl TriageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Confirmed => "confirmed",
            Self::FalsePositive => "false_positive",
            Self::AcceptedRisk => "accepted_risk",
        }
    }
}

impl FromStr for TriageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "confirmed" => Ok(Self::Confirmed),
            "false_positive" => Ok(Self::FalsePositive),
            "accepted_risk" => Ok(Self::AcceptedRisk),
            _ => Err(format!("Invalid triage status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: i64,
    pub run_id: i64,
    pub category: String,
    pub severity: Severity,
    pub title: String,
    pub endpoint: Option<String>,
    pub param: Option<String>,
    pub file_path: Option<String>,
    pub description: String,
    pub evidence_ref: Option<String>,
    pub exploited: bool,
    pub exploit_output_ref: Option<String>,
    pub patched: bool,
    pub proof_ref: Option<String>,
    pub triage: TriageStatus,
    pub created_at: String,
}

impl Finding {
    /// Human-readable location: endpoint (with parameter) or file path.
    pub fn location(&self) -> String {
        match (&self.endpoint, &self.param, &self.file_path) {
            (Some(endpoint), Some(param), _) => format!("{} (param: {})", endpoint, param),
            (Some(endpoint), None, _) => endpoint.clone(),
            (None, _, Some(path)) => path.clone(),
            _ => "unknown location".to_string(),
        }
    }

    pub fn is_sql_injection(&self) -> bool {
        let c = self.category.to_lowercase();
        c == "sqli" || c.contains("sql injection") || c.contains("sql_injection")
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewFinding {
    pub category: String,
    pub severity: Option<Severity>,
    pub title: String,
    pub endpoint: Option<String>,
    pub param: Option<String>,
    pub file_path: Option<String>,
    pub description: String,
    pub evidence_ref: Option<String>,
}

/// Run plus its ordered phase history and findings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDetail {
    pub run: Run,
    pub phases: Vec<PhaseRecord>,
    pub findings: Vec<Finding>,
}

/// Dashboard totals across every target and run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverviewStats {
    pub total_targets: i64,
    pub total_runs: i64,
    pub active_runs: i64,
    pub total_findings: i64,
    pub critical_findings: i64,
    pub high_findings: i64,
    pub exploited_findings: i64,
    pub patched_findings: i64,
    /// Runs that published a pull request.
    pub published_runs: i64,
    pub recent_runs: Vec<Run>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_order_is_fixed() {
        let mut walked = vec![Phase::first()];
        while let Some(next) = walked.last().and_then(|p| p.next()) {
            walked.push(next);
        }
        assert_eq!(walked, Phase::ALL.to_vec());
        for (i, p) in Phase::ALL.iter().enumerate() {
            assert_eq!(p.ordinal(), i as i64 + 1);
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn legacy_paused_status_reads_as_archived() {
        assert_eq!("paused".parse::<TargetStatus>().unwrap(), TargetStatus::Archived);
    }

    #[test]
    fn severity_from_model_is_lenient() {
        assert_eq!(Severity::from_model(Some("HIGH")), Severity::High);
        assert_eq!(Severity::from_model(Some("spicy")), Severity::Medium);
        assert_eq!(Severity::from_model(None), Severity::Medium);
    }

    #[test]
    fn new_target_requires_url_or_repo() {
        let mut t = NewTarget {
            name: "shop".into(),
            ..Default::default()
        };
        assert!(t.validate().is_err());
        t.url = Some("ftp://shop.test".into());
        assert!(t.validate().is_err());
        t.url = Some("http://shop.test".into());
        assert!(t.validate().is_ok());
        let repo = NewTarget {
            name: "repo".into(),
            repo_url: Some("https://github.com/acme/webapp".into()),
            ..Default::default()
        };
        assert!(repo.validate().is_ok());
    }

    #[test]
    fn target_kind_prefers_live_url() {
        let mut target = Target {
            id: 1,
            name: "t".into(),
            url: None,
            ip_address: None,
            repo_url: Some("https://github.com/acme/webapp".into()),
            status: TargetStatus::Active,
            last_run_at: None,
            created_at: "2026-01-01T00:00:00Z".into(),
        };
        assert_eq!(target.kind(), TargetKind::Repository);
        target.url = Some("http://webapp.test".into());
        assert_eq!(target.kind(), TargetKind::LiveUrl);
    }

    #[test]
    fn finding_detects_sql_injection_categories() {
        let mut f = Finding {
            id: 1,
            run_id: 1,
            category: "SQLi".into(),
            severity: Severity::High,
            title: String::new(),
            endpoint: Some("/login.php".into()),
            param: Some("username".into()),
            file_path: None,
            description: String::new(),
            evidence_ref: None,
            exploited: false,
            exploit_output_ref: None,
            patched: false,
            proof_ref: None,
            triage: TriageStatus::Open,
            created_at: String::new(),
        };
        assert!(f.is_sql_injection());
        assert_eq!(f.location(), "/login.php (param: username)");
        f.category = "XSS".into();
        assert!(!f.is_sql_injection());
    }
}
