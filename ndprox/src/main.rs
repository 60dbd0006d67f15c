use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::Parser;
use ndprox::{Config, Daemon, PacketSocket};
use nix::libc;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Userspace NDP proxy daemon.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/etc/ndprox.conf")]
    config: PathBuf,

    /// Leave PROMISC/ALLMULTI flags as-is on exit.
    #[arg(long)]
    no_restore: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        error!(error = %format!("{e:#}"), "fatal");
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let cfg = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let link = PacketSocket::open().context(
        "opening the raw packet socket (this usually needs CAP_NET_RAW or root)",
    )?;

    let mut daemon = Daemon::new(cfg, Box::new(link), args.no_restore);
    daemon.startup().context("startup")?;

    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action).context("installing SIGINT handler")?;
        sigaction(Signal::SIGTERM, &action).context("installing SIGTERM handler")?;
    }

    info!("ndprox running");
    let result = daemon.run(&SHUTDOWN);

    info!("shutting down");
    daemon.cleanup();
    result.context("event loop")?;
    Ok(())
}
