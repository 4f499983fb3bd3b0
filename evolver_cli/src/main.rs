mod cli;
mod commands;
mod error_fmt;

use std::path::Path;

use clap::Parser;
use eyre::{Result, WrapErr};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use cli::{Cli, FILE_GUARD};
use evolver_config::{Config, Logging};

fn main() {
    let cli = Cli::parse();

    if let Err(e) = real_main(&cli) {
        if cli.json {
            eprintln!("{}", error_fmt::format_error_json(&e));
        } else {
            eprintln!("{}", error_fmt::humanize(&e));
        }
        std::process::exit(error_fmt::exit_code_for_error(&e));
    }
}

fn real_main(cli: &Cli) -> Result<()> {
    // Pretty panics and error reports for interactive runs
    if !cli.json {
        let _ = color_eyre::install();
    }

    let cfg = load_config(&cli.config)?;
    init_tracing(cli, &cfg.logging)?;
    tracing::debug!(config = %cli.config.display(), hardware = cfg.hardware.len(), "config loaded");

    let out = commands::run(&cfg, &cli.cmd)?;
    if cli.json {
        println!("{}", serde_json::to_string(&out)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&out)?);
    }
    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("read config {}", path.display()))?;
    let cfg = evolver_config::load_toml(&text).wrap_err("invalid configuration")?;
    cfg.validate().wrap_err("invalid configuration")?;
    Ok(cfg)
}

/// Console logs go to stderr so stdout carries only command output.
///
/// Filter precedence: `RUST_LOG`, then `--log-level`, then `[logging].level`.
/// With `--json` stderr is reserved for the error document, so console logs
/// are only emitted when `RUST_LOG` or `--log-level` asks for them.
fn init_tracing(cli: &Cli, logging: &Logging) -> Result<()> {
    let (filter, explicit) = match EnvFilter::try_from_default_env() {
        Ok(f) => (f, true),
        Err(_) => {
            let level = cli
                .log_level
                .as_deref()
                .or(logging.level.as_deref())
                .unwrap_or("info");
            let f = EnvFilter::try_new(level)
                .wrap_err_with(|| format!("invalid log level '{level}'"))?;
            (f, cli.log_level.is_some())
        }
    };

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if !cli.json {
        layers.push(fmt::layer().with_writer(std::io::stderr).boxed());
    } else if explicit {
        layers.push(fmt::layer().json().with_writer(std::io::stderr).boxed());
    }

    if let Some(file) = logging.file.as_deref() {
        let path = Path::new(file);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = path
            .file_name()
            .ok_or_else(|| eyre::eyre!("logging.file '{file}' has no file name"))?;
        let appender = match logging.rotation.as_deref() {
            Some("daily") => tracing_appender::rolling::daily(dir, name),
            Some("hourly") => tracing_appender::rolling::hourly(dir, name),
            _ => tracing_appender::rolling::never(dir, name),
        };
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        layers.push(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .wrap_err("install tracing subscriber")?;
    Ok(())
}
