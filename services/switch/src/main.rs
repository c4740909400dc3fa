// Switch daemon entry point.
//
// The protocol listener is bound BEFORE daemonizing so concurrent clients
// never observe connection-refused between fork and listen, and the forks
// happen BEFORE the tokio runtime exists (fork in a multi-threaded
// process is undefined behavior).
use anyhow::{Context, Result};
use clap::Parser;
use crossbar_broker::Switch;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use switch::config::SwitchConfig;
use switch::{observability, transport};

#[derive(Parser, Debug)]
#[command(name = "switchd")]
#[command(about = "crossbar message switch daemon")]
struct Args {
    /// Protocol listen port
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Protocol listen address
    #[arg(long, default_value = "127.0.0.1")]
    ip: IpAddr,

    /// Detach from the terminal after binding the listener
    #[arg(long)]
    daemon: bool,

    /// Write the daemon pid to this file
    #[arg(long)]
    pidfile: Option<PathBuf>,

    /// Static asset root served to plain GETs
    #[arg(long)]
    assets: Option<PathBuf>,

    /// Prometheus metrics listen address (disabled when absent)
    #[arg(long)]
    metrics_bind: Option<SocketAddr>,

    /// Info-level logging
    #[arg(short, long)]
    verbose: bool,

    /// Debug-level logging
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = SwitchConfig::from_env_or_yaml()?;
    config.listen = SocketAddr::new(args.ip, args.port);
    if let Some(assets) = &args.assets {
        config.assets_dir = assets.clone();
    }
    if args.metrics_bind.is_some() {
        config.metrics_bind = args.metrics_bind;
    }
    // The daemon chdirs to /; pin the asset root first so a relative
    // --assets keeps meaning what the operator typed.
    if config.assets_dir.is_relative()
        && let Ok(absolute) = std::fs::canonicalize(&config.assets_dir)
    {
        config.assets_dir = absolute;
    }

    // Bind-then-daemonize: the socket survives the forks.
    let listener = std::net::TcpListener::bind(config.listen)
        .with_context(|| format!("bind {}", config.listen))?;

    if args.daemon {
        daemonize().context("daemonize")?;
    }
    if let Some(pidfile) = &args.pidfile {
        write_pidfile(pidfile).context("write pidfile")?;
    }

    // Only now is it safe to spin up worker threads.
    let runtime = tokio::runtime::Runtime::new().context("create tokio runtime")?;
    let result = runtime.block_on(run(&args, config, listener));
    if let Some(pidfile) = &args.pidfile {
        remove_pidfile(pidfile);
    }
    result
}

async fn run(args: &Args, config: SwitchConfig, listener: std::net::TcpListener) -> Result<()> {
    let default_filter = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else {
        "warn"
    };
    let metrics_handle = observability::init_observability(default_filter);
    if let Some(addr) = config.metrics_bind {
        tokio::spawn(async move {
            if let Err(err) = observability::serve_metrics(metrics_handle, addr).await {
                tracing::warn!(error = %err, "metrics listener exited");
            }
        });
    }

    listener
        .set_nonblocking(true)
        .context("set listener nonblocking")?;
    let listener = tokio::net::TcpListener::from_std(listener).context("adopt listener")?;
    tracing::info!(addr = %config.listen, assets = %config.assets_dir.display(), "switch listening");

    let switch = Arc::new(
        Switch::new(&config.assets_dir).with_trace_capacity(config.trace_capacity),
    );
    let max_body = config.max_body_bytes;
    let accept_task = tokio::spawn(async move {
        if let Err(err) = transport::serve(listener, switch, max_body).await {
            tracing::warn!(error = %err, "accept loop exited");
        }
    });

    // Stay alive until SIGINT.
    let _ = tokio::signal::ctrl_c().await;
    accept_task.abort();
    tracing::info!("switch stopped");
    Ok(())
}

fn write_pidfile(path: &PathBuf) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, std::process::id().to_string())?;
    Ok(())
}

fn remove_pidfile(path: &PathBuf) {
    if let Err(err) = std::fs::remove_file(path)
        && err.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %err, "failed to remove pidfile");
    }
}

/// Double-fork daemonization. Must run while the process is still
/// single-threaded: fork only duplicates the calling thread, so forking
/// after the runtime starts would strand locked mutexes in the child.
#[cfg(unix)]
fn daemonize() -> Result<()> {
    use nix::unistd::{ForkResult, fork, setsid};

    // SAFETY: called before any runtime or background thread exists; the
    // child starts with a clean single-threaded slate.
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    // New session: drop the controlling terminal.
    setsid()?;
    // Second fork so the daemon can never reacquire one.
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    std::env::set_current_dir("/")?;
    Ok(())
}

#[cfg(not(unix))]
fn daemonize() -> Result<()> {
    anyhow::bail!("--daemon is only supported on unix")
}
