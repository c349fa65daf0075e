use std::fs::{self, OpenOptions};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::EnvFilter;

use bouncer_core::{LogLevel, LogMode, LoggingConfig};

/// Picks the filter directive: `-v` forces debug, otherwise `RUST_LOG`
/// wins over the configured level.
pub fn filter_directive(level: LogLevel, verbose: bool, env: Option<&str>) -> String {
    if verbose {
        return "debug".to_string();
    }
    match env.map(str::trim).filter(|directive| !directive.is_empty()) {
        Some(directive) => directive.to_string(),
        None => level.as_str().to_string(),
    }
}

pub fn init(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directive = filter_directive(config.log_level, verbose, env.as_deref());
    let filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("invalid log filter '{directive}'"))?;

    match config.log_mode {
        LogMode::Stdout => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|err| anyhow!("install logger: {err}")),
        LogMode::File => {
            let path = config.log_file();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create log dir {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .map_err(|err| anyhow!("install logger: {err}"))
        }
    }
}

/// Installs a plain stdout logger unless one is already in place, so that
/// errors raised before the configuration is read still reach the user.
pub fn init_fallback() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
