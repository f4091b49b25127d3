//! Pre-flight check command: `autoctf validate`.

use anyhow::Result;
use autoctf::app::App;
use autoctf::config::AppConfig;

pub async fn cmd_validate(config: AppConfig, json: bool) -> Result<()> {
    let app = App::build(config)?;
    let report = app.orchestrator.gate().run().await;

    if json {
        println!("{}", serde_json::to_string_pretty(report.as_ref())?);
    } else {
        if report.valid {
            println!("✓ All required dependencies are ready");
        } else {
            println!("✗ Validation failed");
        }
        for error in &report.errors {
            println!("  error:   {}", error);
        }
        for warning in &report.warnings {
            println!("  warning: {}", warning);
        }
    }

    if !report.valid {
        anyhow::bail!("Validation failed with {} error(s)", report.errors.len());
    }
    Ok(())
}
