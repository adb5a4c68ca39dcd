//! Tracing setup: console output plus the append-only state/debug log.
//!
//! Reconciliation decisions, order verification attempts and breaker events
//! are emitted on the `perpguard::state` target; only those land in the
//! state log file.

use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing::{Level, Subscriber};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LogConfig;

pub const STATE_TARGET: &str = "perpguard::state";

/// Install the global subscriber. `RUST_LOG` overrides the configured filter.
pub fn init(cfg: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_filter(filter))
        .with(state_layer(&cfg.state_log)?)
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}

/// File layer that only accepts `perpguard::state` events
pub fn state_layer<S>(path: &Path) -> anyhow::Result<impl Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let file = open_append(path)?;
    Ok(fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .with_filter(Targets::new().with_target(STATE_TARGET, Level::DEBUG)))
}

fn open_append(path: &Path) -> anyhow::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening state log {}", path.display()))
}
