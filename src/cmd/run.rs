//! One-shot assessment and run inspection: `autoctf run`, `autoctf status`.

use anyhow::{Context, Result};
use autoctf::app::App;
use autoctf::config::AppConfig;
use autoctf::orchestrator::RunEvent;
use autoctf::store::models::{NewTarget, RunDetail, RunStatus};
use tokio::sync::broadcast::error::RecvError;

use super::open_store;
use super::targets::default_name;

pub struct RunArgs {
    pub url: Option<String>,
    pub repo: Option<String>,
    pub name: Option<String>,
    pub ip: Option<String>,
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::RunQueued { run_id, .. } => println!("[run {}] queued", run_id),
        RunEvent::RunStarted { run_id } => println!("[run {}] started", run_id),
        RunEvent::PhaseStarted { phase, seq, .. } => println!("  [{}/5] {} ...", seq, phase),
        RunEvent::PhaseRetrying {
            phase,
            attempt,
            delay_ms,
            error,
            ..
        } => println!("        {} attempt {} failed ({}); retrying in {}ms", phase, attempt, error, delay_ms),
        RunEvent::PhaseCompleted { phase, status, notes, .. } => {
            println!("        {} {}", phase, status.as_str());
            for note in notes {
                println!("        - {}", note);
            }
        }
        RunEvent::RunCompleted { .. } | RunEvent::RunFailed { .. } => {}
    }
}

fn print_detail(detail: &RunDetail) {
    let run = &detail.run;
    println!("Run {} (target {}): {}", run.id, run.target_id, run.status.as_str());
    if let Some(phase) = run.current_phase {
        println!("  Phase:       {}", phase);
    }
    if let Some(reason) = run.reason_code {
        println!("  Reason:      {}", reason);
    }
    if let Some(error) = &run.error {
        println!("  Error:       {}", error);
    }
    if let Some(hint) = &run.remediation {
        println!("  Remediation: {}", hint);
    }
    for record in &detail.phases {
        let retries = if record.retry_count > 0 {
            format!(" ({} retries)", record.retry_count)
        } else {
            String::new()
        };
        println!("  {}. {:<8} {}{}", record.seq, record.phase.as_str(), record.status.as_str(), retries);
    }
    println!("  Findings:    {}", detail.findings.len());
    for f in &detail.findings {
        let mut flags = Vec::new();
        if f.exploited {
            flags.push("exploited");
        }
        if f.patched {
            flags.push("patched");
        }
        println!(
            "    #{} [{}] {} {}",
            f.id,
            f.severity.as_str(),
            f.title,
            if flags.is_empty() { String::new() } else { format!("({})", flags.join(", ")) }
        );
    }
    if let Some(report) = &run.report_ref {
        println!("  Report:      {}", report);
    }
    if let Some(pr) = &run.pr_url {
        println!("  PR:          {}", pr);
    }
}

pub async fn cmd_run(config: AppConfig, args: RunArgs) -> Result<()> {
    let app = App::build(config)?;
    app.prepare().await;
    let orchestrator = app.orchestrator.clone();

    let new = NewTarget {
        name: args
            .name
            .unwrap_or_else(|| default_name(args.url.as_deref().or(args.repo.as_deref()))),
        url: args.url,
        ip_address: args.ip,
        repo_url: args.repo,
    };
    new.validate().map_err(anyhow::Error::msg)?;
    let target = orchestrator.db().call(move |db| db.create_target(&new)).await?;

    let run = orchestrator.start_run(target.id).await?;
    println!("Assessing {} (target {}, run {})", target.name, target.id, run.id);

    if let Some(mut events) = orchestrator.events().subscribe_run(run.id) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => print_event(&event),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    println!("Cancelling run {} at the next phase boundary...", run.id);
                    orchestrator.cancel_run(run.id).await?;
                }
            }
        }
    }

    let detail = orchestrator
        .get_run_status(run.id)
        .await?
        .with_context(|| format!("Run {} disappeared", run.id))?;
    println!();
    print_detail(&detail);
    app.shutdown().await;

    if detail.run.status != RunStatus::Completed {
        anyhow::bail!(
            "Run {} failed: {}",
            detail.run.id,
            detail.run.reason_code.map(|r| r.as_str()).unwrap_or("unknown")
        );
    }
    Ok(())
}

pub async fn cmd_status(config: &AppConfig, run_id: i64, json: bool) -> Result<()> {
    let db = open_store(config)?;
    let detail = db
        .call(move |db| db.run_detail(run_id))
        .await?
        .with_context(|| format!("Run {} not found", run_id))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&detail)?);
    } else {
        print_detail(&detail);
    }
    Ok(())
}
