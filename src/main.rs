//! Binary entrypoint for the closer demo daemon.
//!
//! Registers one close callback per configured step, waits for a signal or the shutdown
//! timer, then reports how every step went.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result, anyhow, bail};
use clap::{ArgAction, Parser};
use closer::config::CloseStep;
use closer::{Closer, CloserOptions, Context};
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info};
use tracing_subscriber::{EnvFilter, fmt};

/// Simple CLI
#[derive(Debug, Parser)]
#[command(name = "closer", about = "Run configured close steps on shutdown")]
struct Cli {
    /// Path to YAML config file
    #[arg(short, long, value_name = "FILE", default_value = "closer.yaml")]
    config: PathBuf,

    /// Trigger shutdown after this long, e.g. `5s` (overrides the config)
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    shutdown_after: Option<Duration>,

    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

/// Process id made available to every close step through the context.
#[derive(Debug, Clone, Copy)]
struct Pid(u32);

fn init_tracing(verbosity: u8) -> Result<()> {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::from_default_env().add_directive(format!("closer={level}").parse()?);
    fmt().with_env_filter(filter).with_target(true).init();
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = try_main().await {
        error!(error = ?err, "closer exited with error");
        std::process::exit(1);
    }
}

async fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let cfg = closer::config::from_yaml_file(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    cfg.validate().context("validating configuration")?;

    let shutdown_after = cli.shutdown_after.or(cfg.shutdown_after);
    if cfg.closer.signals.is_empty() && shutdown_after.is_none() {
        bail!("nothing would trigger shutdown; configure closer signals or shutdown-after");
    }

    // the shutdown timer cancels the base context instead of closing directly
    let shutdown = CancellationToken::new();
    let mut options = CloserOptions::from(&cfg.closer);
    if shutdown_after.is_some() {
        options = options.with_context_cancel();
    }
    let (ctx, closer) = Closer::with_options(Context::from_token(shutdown.clone()), options)
        .context("starting closer")?;
    closer.set_context(ctx.with_value(Pid(std::process::id())));

    for step in cfg.steps.iter().cloned() {
        register(&closer, step);
    }
    info!(
        steps = cfg.steps.len(),
        signals = ?cfg.closer.signals,
        "waiting for shutdown"
    );

    if let Some(after) = shutdown_after {
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            info!(after = %humantime::format_duration(after), "shutdown timer elapsed");
            shutdown.cancel();
        });
    }

    closer.done().await;
    match closer.err() {
        Some(err) => {
            for failure in err.iter() {
                error!(error = %format!("{failure:#}"), "close step failed");
            }
            Err(anyhow!("{} of {} close steps failed", err.len(), cfg.steps.len()))
        }
        None => {
            info!("all close steps finished");
            Ok(())
        }
    }
}

fn register(closer: &Closer, step: CloseStep) {
    closer.add(move |ctx| async move {
        let pid = ctx.value::<Pid>().map(|pid| pid.0);
        debug!(step = %step.name, ?pid, delay = ?step.delay, "closing");
        tokio::time::sleep(step.delay).await;
        match step.fail {
            Some(reason) => Err(anyhow!(reason).context(format!("closing {}", step.name))),
            None => {
                info!(step = %step.name, "closed");
                Ok(())
            }
        }
    });
}
