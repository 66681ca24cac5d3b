use anyhow::Result;
use axum::Router;
use clap::Parser;
use clap::Subcommand;
use molt_server::HandoffEnvelope;
use molt_server::ServerConfig;
use molt_server::UpgradeError;
use molt_server::coordinator;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::Duration;
use tracing::Instrument;
use tracing::error;
use tracing::info_span;
use tracing_subscriber::EnvFilter;

/// Upgradeable demo HTTP server. Send the running process SIGHUP to replace
/// it with a freshly exec'd one without dropping connections.
#[derive(Parser)]
#[command(name = "molt", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve HTTP, upgrading in place on SIGHUP (the default).
    Serve(ServeArgs),
    /// Duplicate a listening socket from a running process and serve on it.
    Adopt(AdoptArgs),
}

#[derive(Debug, Parser)]
struct ServeArgs {
    /// Address to listen on when starting without a handoff.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Ceiling in milliseconds on the overlap window before a replacement
    /// retires the previous process.
    #[arg(long, default_value_t = 5_000)]
    grace_ms: u64,

    /// Bound in milliseconds on draining in-flight connections at shutdown.
    #[arg(long, default_value_t = 5_000)]
    drain_ms: u64,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            grace_ms: 5_000,
            drain_ms: 5_000,
        }
    }
}

#[derive(Debug, Parser)]
struct AdoptArgs {
    /// Pid of the process that owns the listening descriptor.
    #[arg(long)]
    pid: u32,

    /// Descriptor number in that process's descriptor table.
    #[arg(long)]
    fd: RawFd,

    /// Bound in milliseconds on draining in-flight connections at shutdown.
    #[arg(long, default_value_t = 5_000)]
    drain_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    // Both processes of an upgrade log to the same console; the pid field is
    // what tells their lines apart.
    let span = info_span!("molt", pid = std::process::id());
    let result = async {
        match cli.command {
            Some(Command::Serve(args)) => run_serve(args).await,
            Some(Command::Adopt(args)) => run_adopt(args).await,
            None => run_serve(ServeArgs::default()).await,
        }
    }
    .instrument(span)
    .await;

    match result {
        // An expired drain deadline is still an orderly exit: accepting
        // stopped on time and the remaining connections were cut off as
        // configured.
        Err(UpgradeError::DrainTimeout { deadline }) => {
            error!("drain deadline of {deadline:?} expired, exiting with connections cut off");
            Ok(())
        }
        other => Ok(other?),
    }
}

async fn run_serve(args: ServeArgs) -> Result<(), UpgradeError> {
    let config = ServerConfig {
        listen_addr: args.listen,
        grace: Duration::from_millis(args.grace_ms),
        drain: Duration::from_millis(args.drain_ms),
    };
    coordinator::run(&config, demo_app()).await
}

async fn run_adopt(args: AdoptArgs) -> Result<(), UpgradeError> {
    let config = ServerConfig {
        drain: Duration::from_millis(args.drain_ms),
        ..ServerConfig::default()
    };
    let source = HandoffEnvelope {
        pid: args.pid,
        fd: args.fd,
    };
    coordinator::serve_adopted(&config, source, demo_app()).await
}

fn demo_app() -> Router {
    Router::new().fallback(|| async { format!("Response from process {}\n", std::process::id()) })
}
