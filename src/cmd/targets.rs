//! Target management: `autoctf targets list|add|archive`.

use anyhow::{Context, Result};
use autoctf::config::AppConfig;
use autoctf::store::models::{NewTarget, TargetStatus, TargetUpdate};

use super::open_store;
use crate::TargetsCommands;

pub async fn cmd_targets(config: &AppConfig, command: TargetsCommands) -> Result<()> {
    let db = open_store(config)?;
    match command {
        TargetsCommands::List => {
            let targets = db.call(|db| db.list_targets()).await?;
            if targets.is_empty() {
                println!("No targets. Add one with `autoctf targets add --url <url>`.");
                return Ok(());
            }
            println!("{:<5} {:<20} {:<9} {:<40} LAST RUN", "ID", "NAME", "STATUS", "ADDRESS");
            for t in targets {
                let address = t.url.as_deref().or(t.repo_url.as_deref()).unwrap_or("-");
                println!(
                    "{:<5} {:<20} {:<9} {:<40} {}",
                    t.id,
                    t.name,
                    t.status.as_str(),
                    address,
                    t.last_run_at.as_deref().unwrap_or("never")
                );
            }
        }
        TargetsCommands::Add { name, url, repo, ip } => {
            let new = NewTarget {
                name: name.unwrap_or_else(|| default_name(url.as_deref().or(repo.as_deref()))),
                url,
                ip_address: ip,
                repo_url: repo,
            };
            new.validate().map_err(anyhow::Error::msg)?;
            let target = db.call(move |db| db.create_target(&new)).await?;
            println!("Created target {} ({})", target.id, target.name);
        }
        TargetsCommands::Archive { id } => {
            let update = TargetUpdate {
                status: Some(TargetStatus::Archived),
                ..Default::default()
            };
            db.call(move |db| db.update_target(id, &update))
                .await?
                .with_context(|| format!("Target {} not found", id))?;
            println!("Archived target {}", id);
        }
    }
    Ok(())
}

/// Target name derived from its address: the URL host or the repository name.
pub fn default_name(address: Option<&str>) -> String {
    let Some(address) = address else {
        return "target".to_string();
    };
    if let Ok(url) = reqwest::Url::parse(address)
        && let Some(host) = url.host_str()
        && !address.contains("github.com")
    {
        return host.to_string();
    }
    address
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("target")
        .to_string()
}
