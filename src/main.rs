use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use glovebox::api::{AcquireRequest, Automation, RunRequest};
use glovebox::config::Config;
use glovebox::display::VncDisplayFactory;
use glovebox::driver::CdpDriverFactory;
use glovebox::logging;
use glovebox::manager::SessionManager;
use glovebox::provider::DockerProvider;
use glovebox::step::StepRequest;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(
    name = "glovebox",
    version,
    about = "Sandbox-backed browser automation with hybrid human takeover"
)]
struct Cli {
    /// Configuration file (default: ~/.glovebox/config.toml)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a step sequence from a JSON file against a session
    Run {
        /// JSON file holding an array of step requests
        #[arg(value_name = "STEPS_FILE")]
        steps: PathBuf,
        /// Reuse or create the session under this key
        #[arg(long, value_name = "KEY")]
        session: Option<String>,
        /// Keep the session alive after the run
        #[arg(long)]
        persistent: bool,
    },
    /// Acquire a session without running anything
    Acquire {
        #[arg(long, value_name = "KEY")]
        session: Option<String>,
        #[arg(long)]
        persistent: bool,
    },
    /// Suspend automation and print the takeover display URL
    Takeover {
        #[arg(value_name = "KEY")]
        session: String,
    },
    /// Return a suspended session to automated control
    Resume {
        #[arg(value_name = "KEY")]
        session: String,
    },
    /// Release a session
    Release {
        #[arg(value_name = "KEY")]
        session: String,
        /// Tear down even a persistent session
        #[arg(long)]
        force: bool,
    },
    /// List known sessions
    List,
    /// Validate the configuration file and print the effective config
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_from_env();
    let cli = Cli::parse();
    let config = Config::load(cli.config.clone())?;

    if let Commands::CheckConfig = cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let manager = Arc::new(SessionManager::new(
        Arc::new(DockerProvider::new(config.provider.clone())),
        Arc::new(CdpDriverFactory),
        Arc::new(VncDisplayFactory::new(config.display.clone())),
        config.session.default_idle_timeout(),
    ));
    let shutdown = CancellationToken::new();
    let sweeper = manager.spawn_sweeper(config.session.sweep_interval(), shutdown.clone());
    let automation = Automation::new(manager, &config);

    let outcome = dispatch(&automation, cli.command, &shutdown).await;

    shutdown.cancel();
    let _ = sweeper.await;
    outcome
}

async fn dispatch(
    automation: &Automation,
    command: Commands,
    shutdown: &CancellationToken,
) -> Result<()> {
    match command {
        Commands::Run {
            steps,
            session,
            persistent,
        } => {
            let raw = tokio::fs::read_to_string(&steps)
                .await
                .with_context(|| format!("reading steps file {}", steps.display()))?;
            let requests: Vec<StepRequest> =
                serde_json::from_str(&raw).context("parsing steps file")?;
            let response = automation
                .run_steps(
                    RunRequest {
                        acquire: AcquireRequest {
                            session_key: session,
                            persistent,
                            idle_timeout_secs: None,
                        },
                        steps: requests,
                    },
                    shutdown,
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Acquire {
            session,
            persistent,
        } => {
            let response = automation
                .acquire_session(AcquireRequest {
                    session_key: session,
                    persistent,
                    idle_timeout_secs: None,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Takeover { session } => {
            let response = automation.request_takeover(&session).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            if let Some(url) = &response.display_url {
                eprintln!("open {url} to drive the session manually");
            }
        }
        Commands::Resume { session } => {
            let state = automation.resume(&session).await?;
            println!("{}", serde_json::to_string(&state)?);
        }
        Commands::Release { session, force } => {
            let torn_down = automation.release_session(&session, force).await?;
            println!("{}", if torn_down { "released" } else { "parked" });
        }
        Commands::List => {
            let sessions = automation.list_sessions().await;
            println!("{}", serde_json::to_string_pretty(&sessions)?);
        }
        Commands::CheckConfig => unreachable!("handled before startup"),
    }
    Ok(())
}
