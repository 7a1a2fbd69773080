//! Jet file server - serves finished task output to file channel consumers
//!
//! Usage:
//!   jet-file-server <output-dir> [--listen 0.0.0.0:7100] [--config <dir>]
//!
//! The output directory holds one partition file (and index) per task
//! attempt under `<job id>/<task attempt id>`, as written by the file output
//! channel. Consumers connect and download partitions over the file channel
//! download protocol. SIGINT/SIGTERM stop the accept loop; downloads in
//! flight finish on their own threads.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context};
use tracing_subscriber::EnvFilter;

use jet_shuffle::channel::FileChannelServer;
use jet_shuffle::config::JetConfig;
use jet_shuffle::metrics::ChannelMetrics;

const DEFAULT_LISTEN: &str = "0.0.0.0:7100";

fn print_usage() {
    println!("Usage: jet-file-server <output-dir> [--listen <addr>] [--config <dir>]");
    println!();
    println!("Arguments:");
    println!("  <output-dir>   Directory holding task output partition files");
    println!("  --listen       Address to listen on (default: {DEFAULT_LISTEN})");
    println!("  --config       Directory containing jet_config.json");
    println!();
    println!("Flags:");
    println!("  -V, --version  Print version information");
    println!("  -h, --help     Print this help message");
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("jet-file-server {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("jet-file-server {}", env!("CARGO_PKG_VERSION"));
        println!();
        print_usage();
        return Ok(());
    }
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }
    if args[1].starts_with("--") {
        bail!("output-dir '{}' looks like a flag, not a path", args[1]);
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let output_dir = PathBuf::from(&args[1]);
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("cannot create output directory {}", output_dir.display()))?;
    let listen = flag_value(&args, "--listen").unwrap_or(DEFAULT_LISTEN);

    let loaded = match flag_value(&args, "--config") {
        Some(dir) => {
            let loaded = JetConfig::read_from(&PathBuf::from(dir))?;
            if loaded.is_none() {
                tracing::warn!(dir, "no jet_config.json found, using host-tuned defaults");
            }
            loaded
        }
        None => None,
    };
    let config = loaded.unwrap_or_else(JetConfig::tuned);
    tracing::info!(?config, "configuration in effect");

    tracing::info!("starting jet-file-server v{}", env!("CARGO_PKG_VERSION"));
    let metrics = Arc::new(ChannelMetrics::new());
    let server = FileChannelServer::bind(listen, &output_dir, Arc::clone(&metrics))
        .with_context(|| format!("cannot listen on {listen}"))?;

    let shutdown = server.shutdown_handle();
    let mut signals = signal_hook::iterator::Signals::new([signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM])
        .context("failed to register signal handlers")?;
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            tracing::info!(signal = sig, "shutting down");
            shutdown.shutdown();
        }
    });

    server.serve()?;

    let snapshot = metrics.snapshot();
    tracing::info!(
        bytes_served = snapshot.network_bytes_written,
        uptime_secs = snapshot.uptime_secs,
        "jet-file-server stopped"
    );
    Ok(())
}
