//! Phase executors.
//!
//! Each executor turns the artifacts of strictly earlier phases into one
//! [`PhaseOutput`]. Executors never touch run status; the runner records
//! their output and decides what happens next.

use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::capture::CaptureClient;
use crate::errors::{PhaseFailure, ReasonCode, SandboxError};
use crate::llm::{self, Analyst};
use crate::publish::{ChangePublisher, ChangeRequest};
use crate::sandbox::SandboxClient;
use crate::store::DbHandle;
use crate::store::models::{Finding, NewFinding, Phase, Run, Severity, Target, TargetKind};

const WORDLIST: &str = "/usr/share/wordlists/dirb/common.txt";
const CLONE_DIR: &str = "/tmp/autoctf-target";

/// External collaborators available to phases.
#[derive(Clone)]
pub struct Services {
    pub analyst: Arc<dyn Analyst>,
    pub capture: Arc<CaptureClient>,
    pub publisher: Arc<ChangePublisher>,
}

#[derive(Debug, Clone)]
pub struct PhaseSettings {
    pub tools: Vec<String>,
    pub command_timeout: Duration,
    pub max_input_chars: usize,
    pub exploit_limit: usize,
}

impl Default for PhaseSettings {
    fn default() -> Self {
        Self {
            tools: Vec::new(),
            command_timeout: Duration::from_secs(300),
            max_input_chars: 16_000,
            exploit_limit: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExploitAttempt {
    pub finding_id: i64,
    pub exploited: bool,
    pub output_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchArtifact {
    pub finding_id: i64,
    /// Repository-relative path used when publishing.
    pub file_name: String,
    pub local_path: PathBuf,
    pub content: String,
}

/// What a phase hands to later phases.
#[derive(Debug, Clone)]
pub enum PhaseArtifact {
    Recon { output: String, output_ref: String },
    Analyze { findings: Vec<Finding> },
    Exploit { attempts: Vec<ExploitAttempt> },
    Patch { patches: Vec<PatchArtifact> },
    Report { report_ref: String, pr_url: Option<String> },
}

/// Outputs of completed phases only. Phases receive a shared reference.
#[derive(Debug, Clone, Default)]
pub struct PhaseArtifacts {
    pub recon: Option<(String, String)>,
    pub findings: Vec<Finding>,
    pub exploits: Vec<ExploitAttempt>,
    pub patches: Vec<PatchArtifact>,
    pub report_ref: Option<String>,
    pub pr_url: Option<String>,
}

impl PhaseArtifacts {
    pub fn record(&mut self, artifact: PhaseArtifact) {
        match artifact {
            PhaseArtifact::Recon { output, output_ref } => self.recon = Some((output, output_ref)),
            PhaseArtifact::Analyze { findings } => self.findings = findings,
            PhaseArtifact::Exploit { attempts } => self.exploits = attempts,
            PhaseArtifact::Patch { patches } => self.patches = patches,
            PhaseArtifact::Report { report_ref, pr_url } => {
                self.report_ref = Some(report_ref);
                self.pr_url = pr_url;
            }
        }
    }

    pub fn exploited(&self) -> impl Iterator<Item = &ExploitAttempt> {
        self.exploits.iter().filter(|a| a.exploited)
    }

    fn finding(&self, id: i64) -> Option<&Finding> {
        self.findings.iter().find(|f| f.id == id)
    }

    /// Every finding referenced by exploit or patch artifacts must come from
    /// the analysis phase.
    pub fn dangling_references(&self) -> Vec<i64> {
        let known: HashSet<i64> = self.findings.iter().map(|f| f.id).collect();
        self.exploits
            .iter()
            .map(|a| a.finding_id)
            .chain(self.patches.iter().map(|p| p.finding_id))
            .filter(|id| !known.contains(id))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PhaseOutput {
    pub artifact: PhaseArtifact,
    pub output_ref: Option<String>,
    pub summary: serde_json::Value,
    pub notes: Vec<String>,
}

pub struct PhaseContext<'a> {
    pub run: &'a Run,
    pub target: &'a Target,
    pub artifacts: &'a PhaseArtifacts,
    pub sandbox: &'a mut SandboxClient,
    pub services: &'a Services,
    pub settings: &'a PhaseSettings,
    pub db: &'a DbHandle,
    pub run_dir: &'a Path,
}

#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    fn phase(&self) -> Phase;

    async fn execute(&self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseFailure>;
}

/// The five built-in phases, in pipeline order.
pub fn standard_phases() -> Vec<Arc<dyn PhaseExecutor>> {
    vec![
        Arc::new(ReconPhase),
        Arc::new(AnalyzePhase),
        Arc::new(ExploitPhase),
        Arc::new(PatchPhase),
        Arc::new(ReportPhase),
    ]
}

/// Quote a value for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn persistence(err: anyhow::Error) -> PhaseFailure {
    PhaseFailure::fatal(ReasonCode::PersistenceError, format!("{:#}", err))
}

async fn write_artifact(dir: &Path, name: &str, content: &str) -> Result<String, PhaseFailure> {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PhaseFailure::fatal(ReasonCode::PersistenceError, format!("Failed to create {}: {}", parent.display(), e)))?;
    }
    tokio::fs::write(&path, content)
        .await
        .map_err(|e| PhaseFailure::fatal(ReasonCode::PersistenceError, format!("Failed to write {}: {}", path.display(), e)))?;
    Ok(path.display().to_string())
}

/// Scan commands for a live target. The IP (when known) is used for the
/// network scan, the URL for the web scans.
pub fn live_recon_commands(url: &str, ip: Option<&str>) -> Result<Vec<String>, PhaseFailure> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| PhaseFailure::fatal(ReasonCode::InvalidTarget, format!("Invalid target URL '{}': {}", url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(PhaseFailure::fatal(
            ReasonCode::InvalidTarget,
            format!("Unsupported URL scheme '{}'", parsed.scheme()),
        ));
    }
    let host = match ip.map(str::trim).filter(|s| !s.is_empty()) {
        Some(ip) => ip.to_string(),
        None => parsed
            .host_str()
            .map(str::to_string)
            .ok_or_else(|| PhaseFailure::fatal(ReasonCode::InvalidTarget, format!("Target URL '{}' has no host", url)))?,
    };
    let url = shell_quote(url);
    Ok(vec![
        format!("nmap -A -T4 {}", shell_quote(&host)),
        format!("gobuster dir -u {} -w {} -q", url, WORDLIST),
        format!("nikto -h {}", url),
    ])
}

/// Inventory commands run after the repository is cloned.
pub fn repository_inventory_commands() -> Vec<String> {
    vec![
        format!("find {} -type f -not -path '*/.git/*' | head -n 500", CLONE_DIR),
        format!(
            "grep -rnE 'mysql_query|mysqli_query|\\$_(GET|POST|REQUEST)|eval\\(|exec\\(|system\\(' {} | head -n 300",
            CLONE_DIR
        ),
    ]
}

pub struct ReconPhase;

#[async_trait]
impl PhaseExecutor for ReconPhase {
    fn phase(&self) -> Phase {
        Phase::Recon
    }

    async fn execute(&self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseFailure> {
        let timeout = ctx.settings.command_timeout;
        let mut notes = Vec::new();

        let budget = ctx.sandbox.acquire_timeout();
        ctx.sandbox.acquire(budget).await?;
        let tools = ctx.sandbox.ensure_tools(&ctx.settings.tools).await?;
        for tool in &tools.failed {
            notes.push(format!("tool unavailable: {}", tool));
        }

        let commands = match ctx.target.kind() {
            TargetKind::LiveUrl => {
                let url = ctx.target.url.as_deref().ok_or_else(|| {
                    PhaseFailure::fatal(ReasonCode::InvalidTarget, "Target has neither a URL nor a repository")
                })?;
                live_recon_commands(url, ctx.target.ip_address.as_deref())?
            }
            TargetKind::Repository => {
                let repo = ctx.target.repo_url.as_deref().unwrap_or_default();
                let clone = format!(
                    "rm -rf {dir} && git clone --depth 1 {} {dir}",
                    shell_quote(repo),
                    dir = CLONE_DIR
                );
                let out = match ctx.sandbox.execute(&clone, timeout).await {
                    Ok(out) => out,
                    Err(SandboxError::ToolMissing(_)) => {
                        return Err(PhaseFailure::fatal(
                            ReasonCode::ToolsUnavailable,
                            format!("git is not installed in the sandbox; it is needed to clone {}", repo),
                        ));
                    }
                    Err(e) => return Err(e.into()),
                };
                if !out.success() {
                    return Err(PhaseFailure::fatal(
                        ReasonCode::InvalidTarget,
                        format!("Failed to clone {}: {}", repo, llm::truncate_chars(out.stderr.trim(), 300)),
                    ));
                }
                repository_inventory_commands()
            }
        };

        let results = ctx.sandbox.execute_all(&commands, timeout).await?;
        let mut sections = Vec::with_capacity(commands.len());
        let mut failed_commands = 0;
        for (command, result) in commands.iter().zip(results) {
            match result {
                Ok(out) => sections.push(format!("$ {}\n{}", command, out.combined())),
                Err(SandboxError::ToolMissing(tool)) => {
                    failed_commands += 1;
                    notes.push(format!("tool missing: {}", tool));
                    sections.push(format!("$ {}\n[{} not available]", command, tool));
                }
                Err(e) => return Err(e.into()),
            }
        }
        let output = sections.join("\n\n");
        let output_ref = write_artifact(ctx.run_dir, "recon.txt", &output).await?;
        tracing::info!(run_id = ctx.run.id, bytes = output.len(), commands = commands.len(), "Recon complete");

        Ok(PhaseOutput {
            summary: json!({
                "commands": commands.len(),
                "failed_commands": failed_commands,
                "bytes": output.len(),
                "tools_installed": tools.installed.len(),
                "tools_failed": tools.failed,
            }),
            output_ref: Some(output_ref.clone()),
            artifact: PhaseArtifact::Recon { output, output_ref },
            notes,
        })
    }
}

pub struct AnalyzePhase;

#[async_trait]
impl PhaseExecutor for AnalyzePhase {
    fn phase(&self) -> Phase {
        Phase::Analyze
    }

    async fn execute(&self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseFailure> {
        let (recon, recon_ref) = ctx.artifacts.recon.clone().ok_or_else(|| {
            PhaseFailure::fatal(ReasonCode::InconsistentArtifacts, "Analysis started without recon output")
        })?;
        let candidates =
            llm::analyze_recon(ctx.services.analyst.as_ref(), &recon, ctx.settings.max_input_chars).await?;

        let new_findings: Vec<NewFinding> = candidates
            .into_iter()
            .map(|c| {
                let location = c
                    .endpoint
                    .clone()
                    .or_else(|| c.file.clone())
                    .unwrap_or_else(|| "target".to_string());
                NewFinding {
                    title: format!("{} on {}", c.category, location),
                    severity: Some(Severity::from_model(c.severity.as_deref())),
                    endpoint: c.endpoint,
                    param: c.param,
                    file_path: c.file,
                    description: c.description.unwrap_or_default(),
                    evidence_ref: Some(recon_ref.clone()),
                    category: c.category,
                }
            })
            .collect();

        let run_id = ctx.run.id;
        let findings = ctx
            .db
            .call(move |db| db.replace_findings(run_id, &new_findings))
            .await
            .map_err(persistence)?;

        let mut by_severity: BTreeMap<&str, usize> = BTreeMap::new();
        for f in &findings {
            *by_severity.entry(f.severity.as_str()).or_default() += 1;
        }
        let listing = serde_json::to_string_pretty(&findings).unwrap_or_default();
        let output_ref = write_artifact(ctx.run_dir, "findings.json", &listing).await?;
        tracing::info!(run_id, findings = findings.len(), "Analysis complete");

        let mut notes = Vec::new();
        if findings.is_empty() {
            notes.push("no vulnerabilities reported".to_string());
        }
        Ok(PhaseOutput {
            summary: json!({ "findings": findings.len(), "by_severity": by_severity }),
            output_ref: Some(output_ref),
            artifact: PhaseArtifact::Analyze { findings },
            notes,
        })
    }
}

/// True when sqlmap reports a confirmed injection point.
pub fn sqlmap_confirmed(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("identified the following injection point") || lower.contains(" is vulnerable")
}

pub fn sqlmap_command(base_url: &str, finding: &Finding) -> String {
    let endpoint = finding.endpoint.as_deref().unwrap_or("");
    let url = format!("{}{}", base_url.trim_end_matches('/'), endpoint);
    match finding.param.as_deref().filter(|p| !p.trim().is_empty()) {
        Some(param) => {
            let separator = if url.contains('?') { '&' } else { '?' };
            format!(
                "sqlmap -u {} -p {} --batch --level=2 --risk=1 --flush-session",
                shell_quote(&format!("{}{}{}=1", url, separator, param)),
                shell_quote(param)
            )
        }
        None => format!("sqlmap -u {} --forms --crawl=1 --batch --flush-session", shell_quote(&url)),
    }
}

pub struct ExploitPhase;

#[async_trait]
impl PhaseExecutor for ExploitPhase {
    fn phase(&self) -> Phase {
        Phase::Exploit
    }

    async fn execute(&self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseFailure> {
        let mut notes = Vec::new();
        let mut attempts = Vec::new();

        let base_url = ctx.target.url.clone().filter(|_| ctx.target.kind() == TargetKind::LiveUrl);
        let (exploitable, skipped): (Vec<&Finding>, Vec<&Finding>) =
            ctx.artifacts.findings.iter().partition(|f| f.is_sql_injection());
        for f in &skipped {
            notes.push(format!("skipped finding {} ({}): no exploit for this category", f.id, f.category));
        }
        for f in exploitable.iter().skip(ctx.settings.exploit_limit) {
            notes.push(format!("skipped finding {}: exploit limit of {} reached", f.id, ctx.settings.exploit_limit));
        }

        let selected: Vec<Finding> = exploitable
            .into_iter()
            .take(ctx.settings.exploit_limit)
            .cloned()
            .collect();
        match &base_url {
            None if !selected.is_empty() => {
                notes.push("skipped exploitation: target has no live URL".to_string());
            }
            None => {}
            Some(base_url) => {
                let budget = ctx.sandbox.acquire_timeout();
                ctx.sandbox.acquire(budget).await?;
                for finding in &selected {
                    let command = sqlmap_command(base_url, finding);
                    let output = match ctx.sandbox.execute(&command, ctx.settings.command_timeout).await {
                        Ok(out) => out.combined(),
                        Err(e @ (SandboxError::ToolMissing(_) | SandboxError::ExecutionTimeout(_))) => {
                            tracing::warn!(run_id = ctx.run.id, finding_id = finding.id, error = %e, "Exploit attempt failed");
                            notes.push(format!("exploit of finding {} failed: {}", finding.id, e));
                            attempts.push(ExploitAttempt {
                                finding_id: finding.id,
                                exploited: false,
                                output_ref: None,
                            });
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    };
                    let exploited = sqlmap_confirmed(&output);
                    let output_ref =
                        write_artifact(ctx.run_dir, &format!("exploit-{}.txt", finding.id), &output).await?;
                    if exploited {
                        let id = finding.id;
                        let stored_ref = output_ref.clone();
                        ctx.db
                            .call(move |db| db.mark_finding_exploited(id, Some(&stored_ref)))
                            .await
                            .map_err(persistence)?;
                    }
                    tracing::info!(run_id = ctx.run.id, finding_id = finding.id, exploited, "Exploit attempt finished");
                    attempts.push(ExploitAttempt {
                        finding_id: finding.id,
                        exploited,
                        output_ref: Some(output_ref),
                    });
                }
            }
        }

        let exploited = attempts.iter().filter(|a| a.exploited).count();
        Ok(PhaseOutput {
            summary: json!({
                "attempted": attempts.len(),
                "exploited": exploited,
                "skipped": skipped.len(),
            }),
            output_ref: None,
            artifact: PhaseArtifact::Exploit { attempts },
            notes,
        })
    }
}

/// Patch file name for a finding: the source file when known, otherwise
/// derived from the endpoint.
///
/// The name is joined under the run's artifact directory and used as a
/// repository path when publishing, so it must stay relative. Names that
/// climb out with `..`, are absolute, or reduce to nothing are rejected.
pub fn patch_file_name(finding: &Finding) -> Result<String, PhaseFailure> {
    let name = match finding.file_path.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        Some(path) => path.to_string(),
        None => {
            let endpoint = finding
                .endpoint
                .as_deref()
                .map(|e| e.split('?').next().unwrap_or(e))
                .map(|e| e.trim_matches('/').replace('/', "_"))
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| format!("finding_{}", finding.id));
            if Path::new(&endpoint).extension().is_some() {
                endpoint
            } else {
                format!("{}.php", endpoint)
            }
        }
    };
    contained_path(&name).ok_or_else(|| {
        PhaseFailure::fatal(
            ReasonCode::MalformedInput,
            format!("Finding {} names an unsafe patch path '{}'", finding.id, name),
        )
    })
}

/// The normal components of `path` joined with `/`, or `None` when any
/// component would leave the base directory.
fn contained_path(path: &str) -> Option<String> {
    let mut parts = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}

pub struct PatchPhase;

#[async_trait]
impl PhaseExecutor for PatchPhase {
    fn phase(&self) -> Phase {
        Phase::Patch
    }

    async fn execute(&self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseFailure> {
        let mut patches = Vec::new();
        for attempt in ctx.artifacts.exploited() {
            let finding = ctx.artifacts.finding(attempt.finding_id).ok_or_else(|| {
                PhaseFailure::fatal(
                    ReasonCode::InconsistentArtifacts,
                    format!("Exploit references unknown finding {}", attempt.finding_id),
                )
            })?;
            let file_name = patch_file_name(finding)?;
            let evidence = match &attempt.output_ref {
                Some(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                    PhaseFailure::fatal(
                        ReasonCode::InternalError,
                        format!("Failed to read exploit output {} for finding {}: {}", path, finding.id, e),
                    )
                })?,
                None => String::new(),
            };
            let content = llm::generate_patch(ctx.services.analyst.as_ref(), finding, &evidence).await?;
            let local_path = write_artifact(ctx.run_dir, &format!("patches/{}", file_name), &content).await?;

            let id = finding.id;
            ctx.db
                .call(move |db| db.mark_finding_patched(id))
                .await
                .map_err(persistence)?;
            tracing::info!(run_id = ctx.run.id, finding_id = id, file = %file_name, "Patch generated");
            patches.push(PatchArtifact {
                finding_id: id,
                file_name,
                local_path: PathBuf::from(local_path),
                content,
            });
        }

        let files: Vec<&str> = patches.iter().map(|p| p.file_name.as_str()).collect();
        Ok(PhaseOutput {
            summary: json!({ "patches": patches.len(), "files": files }),
            output_ref: (!patches.is_empty()).then(|| ctx.run_dir.join("patches").display().to_string()),
            artifact: PhaseArtifact::Patch { patches },
            notes: Vec::new(),
        })
    }
}

pub fn render_report(
    target: &Target,
    findings: &[Finding],
    proofs: &[String],
    patches: &[PatchArtifact],
    pr_url: Option<&str>,
) -> String {
    let mut md = String::from("# AutoCTF - Security Assessment Report\n\n");
    let subject = target
        .url
        .as_deref()
        .or(target.repo_url.as_deref())
        .unwrap_or(&target.name);
    md.push_str(&format!("Target: {}\n\n", subject));
    md.push_str(&format!("PR: {}\n\n", pr_url.unwrap_or("not published")));

    md.push_str("## Vulnerabilities Found\n");
    if findings.is_empty() {
        md.push_str("- none\n");
    }
    for f in findings {
        let mut flags = Vec::new();
        if f.exploited {
            flags.push("exploited");
        }
        if f.patched {
            flags.push("patched");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };
        md.push_str(&format!(
            "- {} on {} ({}){}\n",
            f.category,
            f.location(),
            f.severity.as_str(),
            flags
        ));
    }

    md.push_str("\n## Proofs\n");
    if proofs.is_empty() {
        md.push_str("- none\n");
    }
    for proof in proofs {
        md.push_str(&format!("![poc]({})\n", proof));
    }

    md.push_str("\n## Patches Applied\n");
    if patches.is_empty() {
        md.push_str("- none\n");
    }
    for p in patches {
        md.push_str(&format!("\n### {}\n```\n{}\n```\n", p.file_name, p.content.trim_end()));
    }
    md
}

fn change_narrative(target: &Target, findings: &[Finding], exploited: usize, patches: &[PatchArtifact]) -> String {
    let mut body = String::from("# Automated Security Patches by AutoCTF\n\n");
    body.push_str(&format!(
        "This change carries patches for **{} confirmed vulnerabilities**.\n\n",
        exploited
    ));
    body.push_str("## Scan Details\n");
    body.push_str(&format!(
        "- **Target**: {}\n",
        target.url.as_deref().or(target.repo_url.as_deref()).unwrap_or(&target.name)
    ));
    body.push_str(&format!("- **Vulnerabilities Found**: {}\n", findings.len()));
    body.push_str(&format!("- **Vulnerabilities Exploited**: {}\n", exploited));
    body.push_str(&format!("- **Patches Generated**: {}\n\n", patches.len()));
    body.push_str("These findings were exploited during testing. Review each patch carefully.\n\n");
    body.push_str("## Patches Included\n\n");
    for p in patches {
        body.push_str(&format!("- `{}`\n", p.file_name));
    }
    body
}

pub struct ReportPhase;

#[async_trait]
impl PhaseExecutor for ReportPhase {
    fn phase(&self) -> Phase {
        Phase::Report
    }

    async fn execute(&self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseFailure> {
        let run_id = ctx.run.id;
        let dangling = ctx.artifacts.dangling_references();
        if !dangling.is_empty() {
            return Err(PhaseFailure::fatal(
                ReasonCode::InconsistentArtifacts,
                format!("Artifacts reference findings that analysis never produced: {:?}", dangling),
            ));
        }
        let stored = ctx
            .db
            .call(move |db| db.list_findings(run_id))
            .await
            .map_err(persistence)?;
        let stored_ids: HashSet<i64> = stored.iter().map(|f| f.id).collect();
        if let Some(missing) = ctx.artifacts.findings.iter().find(|f| !stored_ids.contains(&f.id)) {
            return Err(PhaseFailure::fatal(
                ReasonCode::InconsistentArtifacts,
                format!("Finding {} is missing from the store", missing.id),
            ));
        }

        let mut notes = Vec::new();

        // Visual evidence is optional.
        let mut proofs = Vec::new();
        let exploited: Vec<&Finding> = ctx
            .artifacts
            .exploited()
            .filter_map(|a| stored.iter().find(|f| f.id == a.finding_id))
            .collect();
        let base_url = ctx.target.url.as_deref().filter(|_| ctx.target.kind() == TargetKind::LiveUrl);
        if !exploited.is_empty() {
            if !ctx.services.capture.is_enabled() {
                notes.push("evidence omitted: capture service not configured".to_string());
            } else if let Some(base_url) = base_url {
                for finding in &exploited {
                    let url = format!(
                        "{}{}",
                        base_url.trim_end_matches('/'),
                        finding.endpoint.as_deref().unwrap_or("")
                    );
                    match ctx.services.capture.capture_evidence(&url).await {
                        Ok(artifact) => {
                            let id = finding.id;
                            let proof = artifact.view_url.clone();
                            ctx.db
                                .call(move |db| db.set_finding_proof(id, &proof))
                                .await
                                .map_err(persistence)?;
                            proofs.push(artifact.view_url);
                        }
                        Err(e) => {
                            tracing::warn!(run_id, finding_id = finding.id, service = "capture", error = %e, "Evidence capture failed");
                            notes.push(format!("evidence omitted for finding {}: {}", finding.id, e));
                        }
                    }
                }
            } else {
                notes.push("evidence omitted: target has no live URL".to_string());
            }
        }

        // Publishing is optional; patches stay on disk either way.
        let patches = &ctx.artifacts.patches;
        let mut pr_url = None;
        if patches.is_empty() {
            notes.push("publish skipped: no patches generated".to_string());
        } else if !ctx.services.publisher.is_configured() {
            notes.push(format!(
                "publish skipped: publishing not configured; patches saved under {}",
                ctx.run_dir.join("patches").display()
            ));
        } else {
            let change = ChangeRequest {
                branch: format!("autoctf/run-{}", run_id),
                title: format!("[AutoCTF] Security fixes for {} vulnerabilities", exploited.len()),
                narrative: change_narrative(ctx.target, &stored, exploited.len(), patches),
                files: patches
                    .iter()
                    .map(|p| (p.file_name.clone(), p.content.clone()))
                    .collect(),
            };
            match ctx.services.publisher.publish_change(&change).await {
                Ok(url) => {
                    tracing::info!(run_id, pr_url = %url, "Patches published");
                    pr_url = Some(url);
                }
                Err(e) => {
                    tracing::warn!(run_id, service = "publish", error = %e, hint = e.remediation_hint(), "Publishing failed");
                    notes.push(format!("publish skipped: {} ({})", e, e.remediation_hint()));
                }
            }
        }

        let stored = ctx
            .db
            .call(move |db| db.list_findings(run_id))
            .await
            .map_err(persistence)?;
        let report = render_report(ctx.target, &stored, &proofs, patches, pr_url.as_deref());
        let report_ref = write_artifact(ctx.run_dir, "report.md", &report).await?;
        let (stored_ref, stored_pr) = (report_ref.clone(), pr_url.clone());
        ctx.db
            .call(move |db| db.set_run_artifacts(run_id, Some(&stored_ref), stored_pr.as_deref()))
            .await
            .map_err(persistence)?;

        Ok(PhaseOutput {
            summary: json!({
                "findings": stored.len(),
                "exploited": exploited.len(),
                "patches": patches.len(),
                "proofs": proofs.len(),
                "pr_url": pr_url,
                "evidence_omitted": notes.iter().any(|n| n.starts_with("evidence omitted")),
                "publish_skipped": pr_url.is_none(),
            }),
            output_ref: Some(report_ref.clone()),
            artifact: PhaseArtifact::Report { report_ref, pr_url },
            notes,
        })
    }
}
