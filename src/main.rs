//! Runner Helper CLI
//!
//! Entry point for the `runner-helper` binary.

use std::process;

use clap::{Parser, Subcommand};
use runner_archive::CodecOptions;
use runner_helper::commands::{
    ArtifactsDownloader, ArtifactsUploader, CacheArchiver, CacheExtractor, CacheInit, Context,
    HealthCheck, ProxyExec, ReadLogs,
};
use runner_helper::logging::{self, LogFormat};
use runner_helper::{signal, HelperResult};

#[derive(Parser)]
#[command(name = "runner-helper")]
#[command(about = "Job helper for CI runners", version)]
struct Cli {
    /// Log line format
    #[arg(long = "log-format", global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and upload build artifacts
    ArtifactsUploader(ArtifactsUploader),

    /// Download and extract build artifacts
    ArtifactsDownloader(ArtifactsDownloader),

    /// Create and upload a cache archive
    CacheArchiver(CacheArchiver),

    /// Download and extract a cache archive
    CacheExtractor(CacheExtractor),

    /// Make cache directories world-writable
    CacheInit(CacheInit),

    /// Wait until a linked service accepts connections
    HealthCheck(HealthCheck),

    /// Follow a job log file with byte offsets
    ReadLogs(ReadLogs),

    /// Run a command with masked output
    ProxyExec(ProxyExec),
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    let codec = match CodecOptions::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("{e}");
            process::exit(1);
        }
    };
    let wd = match std::env::current_dir() {
        Ok(wd) => wd,
        Err(e) => {
            tracing::error!("cannot resolve working directory: {e}");
            process::exit(1);
        }
    };

    let ctx = Context::new(wd, codec);
    if let Err(e) = signal::install(ctx.cancel.clone()) {
        tracing::warn!("signal handler not installed: {e}");
    }

    let code = match run(cli.command, &ctx) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            1
        }
    };
    process::exit(code);
}

fn run(command: Commands, ctx: &Context) -> HelperResult<i32> {
    match command {
        Commands::ArtifactsUploader(cmd) => cmd.execute(ctx)?,
        Commands::ArtifactsDownloader(cmd) => cmd.execute(ctx)?,
        Commands::CacheArchiver(cmd) => cmd.execute(ctx)?,
        Commands::CacheExtractor(cmd) => cmd.execute(ctx)?,
        Commands::CacheInit(cmd) => cmd.execute(ctx)?,
        Commands::HealthCheck(cmd) => cmd.execute(ctx)?,
        Commands::ReadLogs(cmd) => cmd.execute(ctx)?,
        Commands::ProxyExec(cmd) => return cmd.execute(ctx),
    }
    Ok(0)
}
