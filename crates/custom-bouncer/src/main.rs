use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use bouncer_core::config::merged_yaml;
use bouncer_core::{BinaryIdentity, BouncerConfig, BouncerError, BOUNCER_NAME, VERSION};
use custom_bouncer::{logging, Agent};

#[derive(Parser, Debug)]
#[command(
    name = "crowdsec-custom-bouncer",
    version,
    about = "Relays ban decisions from the local API to a custom program"
)]
struct Cli {
    /// Path to crowdsec-custom-bouncer.yaml
    #[arg(short = 'c')]
    config: PathBuf,

    /// Set verbose mode
    #[arg(short = 'v')]
    verbose: bool,

    /// Test config and exit
    #[arg(short = 't')]
    test_config: bool,

    /// Show full config (.yaml + .yaml.local) and exit
    #[arg(short = 'T')]
    show_config: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            logging::init_fallback();
            error!("process terminated with error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if cli.show_config {
        let merged = merged_yaml(&cli.config).context("unable to read config file")?;
        println!("{merged}");
        return Ok(());
    }

    let config = BouncerConfig::load(&cli.config).context("unable to load configuration")?;
    logging::init(&config.logging, cli.verbose)?;
    info!("Starting {BOUNCER_NAME} v{VERSION}");

    let credentials = config.validate().map_err(|err| {
        let stage = match err {
            BouncerError::MissingCredential => "unable to configure bouncer",
            _ => "unable to load configuration",
        };
        anyhow::Error::new(err).context(stage)
    })?;
    let identity = BinaryIdentity::from_path(&config.bin_path)?;
    info!(
        "custom program {} (sha256 {})",
        identity.path.display(),
        identity.sha256
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    runtime.block_on(async {
        let agent = Agent::new(&config, &credentials)?;
        if cli.test_config {
            info!("config is valid");
            return Ok(());
        }

        let mut sigterm = signal(SignalKind::terminate()).context("register SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("register SIGINT handler")?;
        let stop = async move {
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received interrupt"),
            }
        };
        agent.run(stop).await?;
        Ok::<(), anyhow::Error>(())
    })
}
