mod face;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rpa_replay::chrome::BrowserSession;
use rpa_replay::{
    HttpOracle, OracleConfig, ReplayConfig, ReplayEvent, ReplayRunner, RunStatus, Script,
    StepStatus,
};

/// Replay recorded browser scripts against a live Chrome tab.
#[derive(Parser)]
#[command(name = "replay", version)]
struct Cli {
    /// Chrome remote debugging port to attach to
    #[arg(long, default_value_t = 9222, global = true)]
    debug_port: u16,

    /// Always launch a new Chrome instead of attaching
    #[arg(long, global = true)]
    launch: bool,

    /// Launch Chrome headless (implies --launch)
    #[arg(long, global = true)]
    headless: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one script file and exit
    Run {
        script: PathBuf,
        /// Print the run result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Serve the progress UI and run scripts posted to it
    Serve {
        /// First port to try for the web UI
        #[arg(long, default_value_t = 3000)]
        port: u16,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("rpa_replay=info,replay=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let config = ReplayConfig::from_env();
    let oracle = Arc::new(HttpOracle::new(OracleConfig::from_env()?)?);
    let session = open_session(&cli).await?;

    match cli.command {
        Commands::Run { script, json } => run_once(&session, oracle, config, &script, json).await,
        Commands::Serve { port } => serve(&session, oracle, config, port).await,
    }
}

async fn open_session(cli: &Cli) -> Result<BrowserSession> {
    if !cli.launch && !cli.headless {
        match BrowserSession::attach(cli.debug_port).await {
            Ok(session) => {
                info!(port = cli.debug_port, "Attached to existing Chrome");
                return Ok(session);
            }
            Err(e) => warn!(error = %e, "Could not attach, launching Chrome"),
        }
    }

    // Launching can take a while; keep it off the runtime threads.
    let headless = cli.headless;
    let session = tokio::task::spawn_blocking(move || BrowserSession::launch(headless))
        .await
        .map_err(|e| anyhow!("Browser launch panicked: {}", e))??;
    Ok(session)
}

async fn run_once(
    session: &BrowserSession,
    oracle: Arc<HttpOracle>,
    config: ReplayConfig,
    path: &PathBuf,
    json: bool,
) -> Result<()> {
    let script = Script::load(path)?;
    let runner = ReplayRunner::new(oracle, config);

    let cancel = runner.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current iteration");
            cancel.cancel();
        }
    });

    let page = session.page();
    let result = runner.run_script(&script, &page).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        for step in &result.steps {
            let mark = match step.status {
                StepStatus::Success => "ok",
                StepStatus::Failed => "FAILED",
                StepStatus::Pending | StepStatus::Running => "stopped",
            };
            println!(
                "step {:>3} [{}] after {} iteration(s): {}",
                step.step_number, mark, step.iterations, step.message
            );
        }
        println!("run: {:?}", result.status);
    }

    match result.status {
        RunStatus::Completed => Ok(()),
        status => Err(anyhow!("Script did not complete ({:?})", status)),
    }
}

async fn serve(
    session: &BrowserSession,
    oracle: Arc<HttpOracle>,
    config: ReplayConfig,
    port: u16,
) -> Result<()> {
    let (event_tx, _) = broadcast::channel::<ReplayEvent>(256);
    let (mut run_rx, control) = face::start_server(port, event_tx.clone()).await?;
    info!("Waiting for scripts...");

    let page = session.page();
    while let Some(request) = run_rx.recv().await {
        info!(title = %request.script.title, "Received script");
        let runner = ReplayRunner::new(oracle.clone(), config.clone())
            .with_events(event_tx.clone())
            .with_cancellation(request.cancel);
        let result = runner.run_script(&request.script, &page).await;
        if result.status == RunStatus::Failed {
            if let Some(step) = result.failed_step() {
                error!(step = step.step_number, message = %step.message, "Run failed");
            }
        }
        control.finish_run();
    }

    Ok(())
}
