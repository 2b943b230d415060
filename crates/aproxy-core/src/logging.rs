//! Tracing setup. The proxy runs detached from any terminal, so the default
//! sink is a log file under the XDG state dir; stderr is the fallback.

use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Used when `RUST_LOG` is unset: chunk traffic from the engine, lifecycle
/// from everything else.
const DEFAULT_FILTER: &str = "info,aproxy_core=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// `~/.local/state/aproxy/aproxy.log`
pub fn log_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("aproxy")?;
    Ok(xdg_dirs.get_state_home().join("aproxy").join("aproxy.log"))
}

fn install<W>(writer: W) -> Result<()>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    // Thread names tell lane, assembler and connection work apart.
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(writer)
        .with_thread_names(true)
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging already initialized: {}", e))
}

/// Log to [`log_path`], appending. Errors leave no subscriber installed so
/// the caller can fall back to [`init_logging_stderr`].
pub fn init_logging() -> Result<()> {
    let path = log_path()?;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;

    install(Mutex::new(file))?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "aproxy logging to {}", path.display());
    Ok(())
}

pub fn init_logging_stderr() {
    if let Err(e) = install(io::stderr) {
        eprintln!("aproxy: {:#}", e);
    }
}
