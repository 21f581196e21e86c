//! magitrickle daemon entry point
//!
//! # Usage
//!
//! ```bash
//! # Run with the default configuration path
//! magitrickle
//!
//! # Run with a custom configuration
//! magitrickle -c /opt/etc/magitrickle/config.json
//!
//! # Write the default configuration and exit
//! magitrickle -g
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use magitrickle::config::{create_default_config, load_config};
use magitrickle::App;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration and exit
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/magitrickle/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("magitrickle v{}", magitrickle::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r"magitrickle v{}

Policy-driven per-domain traffic steering daemon for Linux routers.

USAGE:
    magitrickle [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/magitrickle/config.json]
    -g, --generate-config   Write the default configuration and exit
    --check                 Validate the configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    RUST_LOG                Override the configured log level

REQUIREMENTS:
    - Linux kernel with iptables, ipset and policy routing support
    - CAP_NET_ADMIN capability (or root)
",
        magitrickle::VERSION
    );
}

/// Initialize logging
///
/// `RUST_LOG` takes precedence; otherwise the configured level is used.
fn init_logging(level: &str) {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config(&args.config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration from {:?}: {}",
            args.config_path,
            e
        )
    })?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config.app.log_level);

    info!("magitrickle v{}", magitrickle::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let app = Arc::new(App::new());
    app.import_config(config)?;

    let cancel = CancellationToken::new();

    // Cancel the run on SIGINT/SIGTERM.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    info!("Received SIGINT, initiating shutdown...");
                }
                () = wait_for_sigterm() => {
                    info!("Received SIGTERM, initiating shutdown...");
                }
            }
            cancel.cancel();
        });
    }

    let result = app.start(cancel).await;
    if let Err(e) = &result {
        warn!(error = %e, "daemon exited with error");
    }

    result.map_err(Into::into)
}

/// Wait for SIGTERM
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    sigterm.recv().await;
}
