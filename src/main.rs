use anyhow::Result;
use clap::{Parser, Subcommand};
use stationd::{config::AgentConfig, server, AgentContext};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "stationd",
    about = "Station Agent — per-node task execution daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// HTTP dispatch server port
    #[arg(long, env = "STATIOND_PORT")]
    port: Option<u16>,

    /// Data directory for machine records, recovery configs, and guards
    #[arg(long, env = "STATIOND_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "STATIOND_LOG")]
    log: Option<String>,

    /// Node identity announced to the controller (default: hostname)
    #[arg(long, env = "STATIOND_NODE_ID")]
    node_id: Option<String>,

    /// Bind address for the dispatch server (default: 127.0.0.1; use 0.0.0.0 for LAN access)
    #[arg(long, env = "STATIOND_BIND")]
    bind_address: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the agent server (default when no subcommand given).
    ///
    /// Runs stationd in the foreground and serves task dispatches from
    /// the controller until interrupted.
    ///
    /// Examples:
    ///   stationd serve
    ///   stationd
    Serve,
    /// Query a running agent and print its health summary.
    ///
    /// Examples:
    ///   stationd status
    ///   stationd status --json
    Status {
        /// Print the raw health payload as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Some(Command::Status { json }) => {
            let config = AgentConfig::new(
                args.port,
                args.data_dir,
                Some("error".to_string()),
                args.node_id,
                args.bind_address,
            );
            let exit_code = run_status(&config, json).await;
            std::process::exit(exit_code);
        }
        None | Some(Command::Serve) => {
            run_server(
                args.port,
                args.data_dir,
                args.log,
                args.node_id,
                args.bind_address,
            )
            .await?;
        }
    }

    Ok(())
}

async fn run_server(
    port: Option<u16>,
    data_dir: Option<std::path::PathBuf>,
    log: Option<String>,
    node_id: Option<String>,
    bind_address: Option<String>,
) -> Result<()> {
    let config = AgentConfig::new(port, data_dir, log, node_id, bind_address);

    // Init once — must happen before any tracing calls.
    let _file_guard = setup_logging(&config.log, &config.log_dir, &config.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), "stationd starting");
    info!(
        node = %config.node_id,
        data_dir = %config.data_dir.display(),
        port = config.port,
        task_timeout_secs = config.task_timeout_secs,
        "config loaded"
    );

    install_panic_hook(config.data_dir.clone());
    // If the previous run panicked, log the crash report and delete it.
    check_crash_log(&config.data_dir);

    let ctx = Arc::new(AgentContext::new(config)?);
    server::run(ctx).await
}

/// Initialize the tracing subscriber.
/// Logs go to stderr and a daily-rolling file under `log_dir`.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// `log_format` may be `"pretty"` (default, human-readable compact format) or
/// `"json"` (structured JSON for log aggregators).
///
/// If the log directory cannot be created, falls back to stderr-only logging
/// with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_dir: &std::path::Path,
    log_format: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let use_json = log_format == "json";

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        // Fall back to stderr-only — don't panic on a bad log path.
        eprintln!(
            "warn: could not create log directory '{}': {e} — falling back to stderr",
            log_dir.display()
        );
        if use_json {
            tracing_subscriber::fmt().json().with_env_filter(log_level).init();
        } else {
            tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        }
        return None;
    }

    let appender = tracing_appender::rolling::daily(log_dir, "stationd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    if use_json {
        tracing_subscriber::registry()
            .with(EnvFilter::new(log_level))
            .with(fmt::layer().json())
            .with(fmt::layer().json().with_writer(non_blocking))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(EnvFilter::new(log_level))
            .with(fmt::layer().compact())
            .with(fmt::layer().with_writer(non_blocking))
            .init();
    }

    Some(guard)
}

// ── Panic hook + crash log ────────────────────────────────────────────────────

/// Install a custom panic hook that writes panic info + backtrace to
/// `{data_dir}/crash.log`.
///
/// The crash log is checked and removed on the next startup (`check_crash_log`).
fn install_panic_hook(data_dir: std::path::PathBuf) {
    let original = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        // Call the original hook first (prints to stderr).
        original(info);

        let crash_path = data_dir.join("crash.log");
        let msg = info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| info.payload().downcast_ref::<String>().map(|s| s.as_str()))
            .unwrap_or("unknown panic");

        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());

        let backtrace = std::backtrace::Backtrace::capture();
        let content = format!(
            "stationd panic at {location}\n\
             message: {msg}\n\
             version: {}\n\
             backtrace:\n{backtrace:#}\n",
            env!("CARGO_PKG_VERSION")
        );

        // Best-effort write — if this fails, we can't do much.
        let _ = std::fs::write(&crash_path, &content);
    }));
}

/// Check for a crash log from the previous run, log it at error level, then delete it.
///
/// Called early in `run_server()` after logging is initialized.
fn check_crash_log(data_dir: &std::path::Path) {
    let crash_path = data_dir.join("crash.log");
    match std::fs::read_to_string(&crash_path) {
        Ok(content) => {
            tracing::error!(
                crash_report = %content.trim(),
                "previous agent run ended with a panic — see crash report above"
            );
            let _ = std::fs::remove_file(&crash_path);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(err = %e, "could not read crash.log");
        }
    }
}

// ── stationd status ───────────────────────────────────────────────────────────

/// Returns exit code: 0 = healthy, 1 = stopped/unresponsive.
async fn run_status(config: &AgentConfig, json: bool) -> i32 {
    let url = format!("http://127.0.0.1:{}/api/v1/health", config.port);
    let client = reqwest::Client::new();

    let response = match client
        .get(&url)
        .timeout(std::time::Duration::from_secs(3))
        .send()
        .await
    {
        Ok(r) => r,
        Err(_) => {
            if json {
                println!(r#"{{"status":"not_running"}}"#);
            } else {
                println!("stationd: not running");
            }
            return 1;
        }
    };

    match response.json::<serde_json::Value>().await {
        Ok(body) => {
            let version = body["version"].as_str().unwrap_or("?");
            let node = body["node"].as_str().unwrap_or("?");
            let in_flight = body["inFlight"].as_u64().unwrap_or(0);
            let uptime_str = format_uptime(body["uptimeSecs"].as_u64().unwrap_or(0));

            if json {
                println!("{}", serde_json::to_string(&body).unwrap_or_default());
            } else {
                println!(
                    "stationd {version} on {node} — Running ({in_flight} tasks in flight, uptime {uptime_str})"
                );
            }
            0
        }
        Err(_) => {
            if json {
                println!(r#"{{"status":"unresponsive"}}"#);
            } else {
                println!("stationd: unresponsive");
            }
            1
        }
    }
}

/// Format uptime seconds as "2h 14m" or "45m 3s".
fn format_uptime(secs: u64) -> String {
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{h}h {m}m")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}
