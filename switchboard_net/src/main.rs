// CLI entry point for switchboard.
//
// `serve` runs a session center in the foreground; `monitor` connects to one,
// logs in, and prints the center's listen endpoints and clients whenever they
// change. Both stop on Ctrl+C. See `center.rs` and `monitor.rs`.
//
// Usage:
//   switchboard [-v] serve   [--listen ADDR] [--poll-ms N]
//   switchboard [-v] monitor [--server ADDR] [--poll-ms N] [--no-admin]
//
// Log output goes through `tracing-subscriber`; `RUST_LOG` overrides the
// default level (`info`, or `debug` with `--verbose`).

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use switchboard_net::{CenterConfig, Monitor, MonitorConfig, SessionView, start_center};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "switchboard", about = "TCP session center and monitor")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a session center
    Serve(ServeArgs),
    /// Watch a running center's sessions
    Monitor(MonitorArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:2000")]
    listen: SocketAddr,

    /// Loop poll timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    poll_ms: u64,
}

#[derive(Args)]
struct MonitorArgs {
    /// Center to connect to
    #[arg(long, default_value = "127.0.0.1:2000")]
    server: SocketAddr,

    /// Loop poll timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    poll_ms: u64,

    /// Log in without subscribing to create/delete notices
    #[arg(long)]
    no_admin: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = running.clone();
    ctrlc::set_handler(move || running_handler.store(false, Ordering::SeqCst))
        .context("failed to install Ctrl+C handler")?;

    match cli.command {
        Commands::Serve(args) => serve(args, &running),
        Commands::Monitor(args) => monitor(args, &running),
    }
}

fn serve(args: ServeArgs, running: &AtomicBool) -> Result<()> {
    let config = CenterConfig {
        listen: args.listen,
        poll_timeout: Duration::from_millis(args.poll_ms),
    };
    let (handle, addr) = start_center(config).context("failed to start center")?;

    println!("Center listening on {addr}");
    println!("Press Ctrl+C to stop.");
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    println!("\nShutting down...");
    handle.stop();
    Ok(())
}

fn monitor(args: MonitorArgs, running: &AtomicBool) -> Result<()> {
    let config = MonitorConfig {
        server: args.server,
        poll_timeout: Duration::from_millis(args.poll_ms),
        admin: !args.no_admin,
    };
    let monitor = Monitor::connect(config).context("failed to start monitor")?;
    monitor.login();
    let handle = monitor.spawn().context("failed to start monitor loop")?;

    println!("Monitoring {}", args.server);
    let mut shown = SessionView::default();
    while running.load(Ordering::SeqCst) {
        let view = handle.view();
        if view != shown {
            print_view(&view);
            shown = view;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    handle.stop();
    Ok(())
}

fn print_view(view: &SessionView) {
    println!();
    println!("Servers ({}):", view.servers.len());
    for server in &view.servers {
        println!("  {}:{}", server.ip, server.port);
    }
    println!("Clients ({}):", view.clients.len());
    for client in &view.clients {
        match client.connect_time {
            Some(at) => println!("  {}  since {}", client.remote, at.to_rfc3339()),
            None => println!("  {}", client.remote),
        }
    }
}
