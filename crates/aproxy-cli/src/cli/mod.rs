//! CLI for the aproxy streaming proxy.

mod commands;

use anyhow::Result;
use aproxy_core::config;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::{Path, PathBuf};

use commands::{run_checksum, run_completions, run_inspect, run_serve, run_url, ServeOptions};

/// Top-level CLI for the aproxy streaming proxy.
#[derive(Debug, Parser)]
#[command(name = "aproxy")]
#[command(about = "aproxy: loopback HTTP proxy that streams and caches remote audio", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Run the proxy until interrupted.
    Serve {
        /// Loopback port to listen on (0 picks a free one).
        #[arg(long, value_name = "PORT")]
        port: Option<u16>,
        /// Cache directory holding Incomplete/ and Complete/.
        #[arg(long, value_name = "DIR")]
        cache_dir: Option<PathBuf>,
        /// Do not prefetch the next stream.
        #[arg(long)]
        no_prefetch: bool,
    },

    /// Print the proxy URL a player should open for a stream.
    Url {
        /// Upstream stream URL.
        stream: String,
        /// Stream to prefetch once this one is playing.
        #[arg(long, value_name = "URL")]
        next: Option<String>,
        /// Port the proxy listens on.
        #[arg(long)]
        port: u16,
    },

    /// Show the cached state of a stream.
    Inspect {
        /// Upstream stream URL.
        stream: String,
        #[arg(long, value_name = "DIR")]
        cache_dir: Option<PathBuf>,
    },

    /// Print the ETag-style md5 of a file.
    Checksum {
        /// Path to the file.
        path: String,
    },

    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);

        match cli.command {
            CliCommand::Serve {
                port,
                cache_dir,
                no_prefetch,
            } => {
                let opts = ServeOptions {
                    port,
                    cache_dir,
                    no_prefetch,
                };
                run_serve(cfg, opts).await?
            }
            CliCommand::Url { stream, next, port } => run_url(&stream, next.as_deref(), port)?,
            CliCommand::Inspect { stream, cache_dir } => {
                run_inspect(&cfg, &stream, cache_dir.as_deref())?
            }
            CliCommand::Checksum { path } => run_checksum(Path::new(&path))?,
            CliCommand::Completions { shell } => run_completions(shell),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
