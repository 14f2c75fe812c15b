use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use signal_hook::consts::signal::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook_tokio::Signals;
use sitemux::logging::init_tracing;
use sitemux::Config;
use std::net::IpAddr;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "sitemux")]
#[command(about = "Serves many HTTP and HTTPS sites from one process")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    #[arg(short, long, default_value = "/etc/sitemux/sitemux.toml")]
    config: String,

    /// Overrides the configured bind address
    #[arg(long)]
    bind: Option<IpAddr>,

    #[arg(short, long)]
    daemon: bool,

    /// Validate the configuration and certificates, then exit
    #[arg(short = 't', long)]
    test_config: bool,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind_address = bind.to_string();
    }

    init_tracing(&config.logging.log_level, config.logging.format, args.verbose)?;

    let server = config.into_server()?;

    if args.test_config {
        let groups = server.check()?;
        info!(listeners = groups.len(), "Configuration file {} is valid", args.config);
        println!("Configuration test successful");
        return Ok(());
    }

    if args.daemon {
        daemonize()?;
    }

    let signals = Signals::new([SIGINT, SIGQUIT, SIGTERM])?;
    let handle = signals.handle();

    let result = server.serve_with_shutdown(wait_for_signal(signals)).await;
    handle.close();

    if let Err(e) = &result {
        error!("Server stopped with error: {}", e);
    }
    Ok(result?)
}

async fn wait_for_signal(mut signals: Signals) {
    if let Some(signal) = signals.next().await {
        info!(signal, "Received shutdown signal");
    }
}

fn daemonize() -> Result<()> {
    #[cfg(unix)]
    {
        use std::process;
        match unsafe { libc::fork() } {
            -1 => return Err(anyhow::anyhow!("Failed to fork process")),
            0 => {
                if unsafe { libc::setsid() } == -1 {
                    return Err(anyhow::anyhow!("Failed to create new session"));
                }

                unsafe {
                    libc::close(0);
                    libc::close(1);
                    libc::close(2);
                }
            }
            _ => process::exit(0),
        }
    }

    #[cfg(not(unix))]
    {
        return Err(anyhow::anyhow!(
            "Daemon mode not supported on this platform"
        ));
    }

    Ok(())
}
