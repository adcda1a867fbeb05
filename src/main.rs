//! ctxrelay binary: an MCP server on stdin/stdout.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Parser)]
#[command(
    name = "ctxrelay",
    version,
    about = "MCP proxy that switches between environment contexts"
)]
struct Cli {
    /// Path to contexts.yaml (default: $CTXRELAY_CONFIG, ./contexts.yaml, then the user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Shorthand for --log-level debug
    #[arg(short, long)]
    verbose: bool,

    #[arg(long, value_enum, env = "CTXRELAY_LOG_LEVEL", default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    /// Write logs to this file (rotated on startup) instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Maximum number of backend processes kept alive at once
    #[arg(long)]
    max_processes: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose && cli.log_level < LogLevel::Debug {
        LogLevel::Debug
    } else {
        cli.log_level
    };
    ctxrelay::logging::init_tracing(level.as_str(), cli.log_file.as_deref(), cli.log_json)?;

    ctxrelay::run(ctxrelay::RunOptions {
        config: cli.config,
        max_processes: cli.max_processes,
    })
    .await
}
