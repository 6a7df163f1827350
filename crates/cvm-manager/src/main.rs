use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{mpsc, Arc};

use anyhow::{Context, Result};
use clap::Parser;
use cvm_scheduler::{
    CommandLauncher, NoopProvisioner, OsUserProvisioner, RequestScheduler, SchedulerConfig,
    UserProvisioner, UsersManager,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod chain_link;

use chain_link::{ChainLink, ChainListener, RemoteLedger};

const ENV_LOG: &str = "CVM_LOG";

#[derive(Parser)]
#[command(name = "cvm-manager")]
#[command(about = "Runs contract txs in pooled, per-user sandboxes.", long_about = None)]
struct Cli {
    /// Scheduler config JSON; built-in defaults when omitted.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print the effective config and exit.
    #[arg(long)]
    print_config: bool,

    /// Chain link socket path (uds) or bind host (tcp).
    #[arg(long, value_name = "PATH|ADDR")]
    listen: Option<String>,
}

fn main() -> ExitCode {
    init_logging();
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "cvm-manager failed");
            eprintln!("cvm-manager: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(cli: &Cli) -> Result<SchedulerConfig> {
    let mut cfg = match &cli.config {
        Some(path) => SchedulerConfig::load(path)?,
        None => {
            let mut cfg = SchedulerConfig::default();
            cfg.apply_env_overrides()?;
            cfg
        }
    };
    if let Some(listen) = &cli.listen {
        cfg.chain.listen = listen.clone();
    }
    cfg.validate().context("invalid scheduler config")?;
    Ok(cfg)
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let cfg = load_config(&cli)?;
    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&cfg)?);
        return Ok(ExitCode::SUCCESS);
    }
    let cfg = Arc::new(cfg);

    let provisioner: Box<dyn UserProvisioner> = if cfg.sandbox.create_os_users {
        Box::new(OsUserProvisioner)
    } else {
        Box::new(NoopProvisioner)
    };
    let users = Arc::new(UsersManager::new(&cfg, provisioner));
    let launcher = Arc::new(CommandLauncher::new(&cfg));
    let link = ChainLink::new(cfg.exec_tx_timeout(), cfg.chain.max_connection as usize);
    let ledger = Arc::new(RemoteLedger::new(Arc::clone(&link)));

    let (resp_tx, resp_rx) = mpsc::channel();
    let scheduler = RequestScheduler::new(Arc::clone(&cfg), ledger, launcher, users, resp_tx)
        .context("start request scheduler")?;
    let (inbox_tx, inbox_rx) = mpsc::channel();
    scheduler.start(inbox_rx)?;
    link.pump_responses(resp_rx)?;

    let listener = ChainListener::bind(&cfg.chain)?;
    let accept = link.serve(listener, inbox_tx)?;
    info!(
        transport = ?cfg.chain.transport,
        listen = %cfg.chain.listen,
        "cvm-manager started"
    );

    // Chain reader threads may outlive the accept loop.
    let _ = accept.join();
    scheduler.shutdown();
    info!("cvm-manager stopped");
    Ok(ExitCode::SUCCESS)
}
