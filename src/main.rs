use anyhow::Result;
use autoctf::config::AppConfig;
use autoctf::logging::{self, LogFormat};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "autoctf")]
#[command(version, about = "Automated security assessment orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to autoctf.toml (defaults to .autoctf/autoctf.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log output format: pretty, json
    #[arg(long, global = true, default_value = "pretty")]
    pub log_format: LogFormat,

    /// Also write daily-rolling JSON logs to this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API (REST, SSE progress streams, dashboard WebSocket)
    Serve {
        /// Address to bind (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to serve on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable permissive CORS for a locally served dashboard
        #[arg(long)]
        cors: bool,
    },
    /// Run the pre-flight validation gate and print the report
    Validate {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Assess a single target in the foreground
    #[command(group(clap::ArgGroup::new("address").required(true).args(["url", "repo"])))]
    Run {
        /// Live target URL (http or https)
        #[arg(long)]
        url: Option<String>,

        /// Source repository to clone and inspect
        #[arg(long)]
        repo: Option<String>,

        /// Display name for the target
        #[arg(long)]
        name: Option<String>,

        /// IP address used for the network scan
        #[arg(long)]
        ip: Option<String>,
    },
    /// Manage targets
    Targets {
        #[command(subcommand)]
        command: TargetsCommands,
    },
    /// Show a run's status, phase history and findings
    Status {
        run_id: i64,

        /// Print the run as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum TargetsCommands {
    /// List all targets
    List,
    /// Register a target
    #[command(group(clap::ArgGroup::new("address").required(true).args(["url", "repo"])))]
    Add {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        repo: Option<String>,
        #[arg(long)]
        ip: Option<String>,
    },
    /// Archive a target so no new runs are admitted for it
    Archive { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init(cli.verbose, cli.log_format, cli.log_dir.as_deref())?;
    let config = AppConfig::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port, cors } => cmd::cmd_serve(config, host, port, cors).await?,
        Commands::Validate { json } => cmd::cmd_validate(config, json).await?,
        Commands::Run { url, repo, name, ip } => {
            cmd::cmd_run(config, cmd::run::RunArgs { url, repo, name, ip }).await?
        }
        Commands::Targets { command } => cmd::cmd_targets(&config, command).await?,
        Commands::Status { run_id, json } => cmd::cmd_status(&config, run_id, json).await?,
    }

    Ok(())
}
