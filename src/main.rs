use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use geochain::config::RunConfig;
use geochain::coordinator::Coordinator;
use geochain::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "geochain")]
#[command(version)]
#[command(about = "Durable, dependency-ordered command scheduler for geoprocessing pipelines")]
struct Args {
    /// Pipeline description files (JSON), compiled in the order given.
    /// Ignored with --resume, where the store already holds the run.
    pipelines: Vec<PathBuf>,

    /// Command store (journal) path
    #[arg(long, default_value = "geochain.store")]
    store: PathBuf,

    /// Resume the existing store instead of compiling a fresh run
    #[arg(long)]
    resume: bool,

    /// Address to listen on for remote completion reports
    #[arg(long, default_value = "127.0.0.1:7700")]
    listen: SocketAddr,

    /// Remote worker pool, comma-separated host:port list.
    /// Overrides workers declared in the pipeline descriptions.
    #[arg(long, default_value = "")]
    workers: String,

    /// Maximum concurrent local commands
    #[arg(long, default_value = "4")]
    max_local: usize,

    /// Maximum remote commands in flight
    #[arg(long, default_value = "8")]
    max_remote: usize,

    /// Send attempts per remote command before it is marked failed
    #[arg(long, default_value = "3")]
    retries: u32,

    /// Dispatcher scan and monitor poll interval in milliseconds
    #[arg(long, default_value = "500")]
    poll_interval_ms: u64,

    /// Mark a running remote command failed after this many milliseconds
    /// without a completion report (default: wait indefinitely)
    #[arg(long)]
    remote_timeout_ms: Option<u64>,

    /// Write logs to this file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn parse_workers(workers: &str) -> Vec<String> {
    workers
        .split(',')
        .map(|w| w.trim().to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

fn init_logging(log_file: &Option<PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("geochain.log"));
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let log_guard = init_logging(&args.log_file);

    if !args.resume && args.pipelines.is_empty() {
        eprintln!("Error: no pipeline description files given (or use --resume)");
        drop(log_guard);
        std::process::exit(2);
    }

    let config = RunConfig {
        store_path: args.store,
        resume: args.resume,
        listen_addr: args.listen,
        workers: parse_workers(&args.workers),
        max_local: args.max_local,
        max_remote: args.max_remote,
        dispatch_retries: args.retries,
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        remote_timeout: args.remote_timeout_ms.map(Duration::from_millis),
        log_file: args.log_file,
        ..RunConfig::default()
    };

    let cancel = install_shutdown_handler();

    let code = match Coordinator::new(config).run(&args.pipelines, cancel).await {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            tracing::error!(error = %e, "Run aborted");
            eprintln!("Error: {e}");
            1
        }
    };

    // The non-blocking writer flushes on guard drop; exit would skip it.
    drop(log_guard);
    std::process::exit(code);
}
