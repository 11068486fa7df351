//! nat66-socks: per-user IPv6 egress SOCKS5 proxy
//!
//! # Usage
//!
//! ```bash
//! # Run with a prefix and the default listen address
//! sudo ./nat66-socks -p 2001:db8:1:2::/64
//!
//! # Run with a configuration file
//! sudo ./nat66-socks -c /etc/nat66-socks/config.json
//!
//! # Run with environment overrides
//! NAT66_LOG_LEVEL=debug sudo ./nat66-socks -c /etc/nat66-socks/config.json
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use nat66_socks::config::{apply_env_overrides, create_default_config, read_config, Config};
use nat66_socks::connection::{ProxyServer, SessionHandler};
use nat66_socks::identity::IdentityAllocator;
use nat66_socks::lock::PidLock;
use nat66_socks::outbound::MarkedDialer;

/// Written by `-g` when no `-c` is given
const DEFAULT_CONFIG_PATH: &str = "/etc/nat66-socks/config.json";

/// How often draining progress is logged
const DRAIN_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: Option<PathBuf>,
    /// Listen address override
    listen: Option<SocketAddr>,
    /// NAT prefix override
    prefix: Option<String>,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self {
            config_path: None,
            listen: None,
            prefix: None,
            generate_config: false,
            check_config: false,
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    parsed.config_path = Some(PathBuf::from(required_value(&arg, args.next())));
                }
                "-l" | "--listen" => {
                    let value = required_value(&arg, args.next());
                    match parse_listen(&value) {
                        Some(addr) => parsed.listen = Some(addr),
                        None => {
                            eprintln!("Invalid listen address: {value}");
                            std::process::exit(1);
                        }
                    }
                }
                "-p" | "--prefix" => {
                    parsed.prefix = Some(required_value(&arg, args.next()));
                }
                "-g" | "--generate-config" => {
                    parsed.generate_config = true;
                }
                "--check" => {
                    parsed.check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("nat66-socks v{}", nat66_socks::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        parsed
    }
}

fn required_value(flag: &str, value: Option<String>) -> String {
    value.unwrap_or_else(|| {
        eprintln!("Missing value for {flag}");
        std::process::exit(1);
    })
}

/// Accepts a full socket address or a bare `:port` (all interfaces)
fn parse_listen(value: &str) -> Option<SocketAddr> {
    if let Some(port) = value.strip_prefix(':') {
        let port = port.parse().ok()?;
        return Some(SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), port));
    }
    value.parse().ok()
}

fn print_help() {
    println!(
        r#"nat66-socks v{}

SOCKS5 proxy giving every user its own IPv6 source address.

USAGE:
    nat66-socks [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path
    -l, --listen <ADDR>     Listen address [default: [::]:10808]
    -p, --prefix <PREFIX>   IPv6 /64 prefix for user addresses
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    NAT66_LISTEN_ADDR    Override listen address
    NAT66_PREFIX         Override IPv6 prefix
    NAT66_LOG_LEVEL      Override log level (trace, debug, info, warn, error)
    NAT66_PID_FILE       Override PID file path

REQUIREMENTS:
    - nftables (`nft`) with IPv6 NAT support
    - CAP_NET_ADMIN capability (or root) for SO_MARK and nftables
    - The prefix routed to this host

EXAMPLE:
    sudo nat66-socks -l :10808 -p 2001:db8:1:2::/64
"#,
        nat66_socks::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target)
        .with_span_events(FmtSpan::NONE);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// File (or defaults), then environment, then command line, then validate
fn resolve_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config_path {
        Some(path) => read_config(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };

    apply_env_overrides(&mut config).context("Invalid environment override")?;

    if let Some(addr) = args.listen {
        config.listen.address = addr;
    }
    if let Some(prefix) = &args.prefix {
        config.nat.prefix.clone_from(prefix);
    }

    if config.nat.prefix.trim().is_empty() {
        anyhow::bail!("No IPv6 prefix configured, use -p or set nat.prefix");
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    let args = Args::parse();

    if args.generate_config {
        let path = args
            .config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        create_default_config(&path)?;
        println!("Generated default configuration at {}", path.display());
        return Ok(());
    }

    let config = resolve_config(&args)?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("nat66-socks v{}", nat66_socks::VERSION);
    if let Some(path) = &args.config_path {
        info!("Configuration loaded from {}", path.display());
    }

    let lock = PidLock::acquire(&config.pid_file).context("Failed to start")?;

    let prefix = config.prefix()?;
    let nat = nat66_socks::nat::connect(&config.nat)
        .await
        .context("Failed to initialise NAT backend")?;
    info!(prefix = %prefix, backend = %config.nat.backend, "NAT backend ready");

    let allocator = Arc::new(IdentityAllocator::new(prefix, nat));
    let dialer = Arc::new(MarkedDialer::from_config(&config.connection));
    let handler = SessionHandler::socks5(allocator, dialer, &config.connection);

    let server = ProxyServer::bind(&config.listen, handler)
        .with_context(|| format!("Failed to listen on {}", config.listen.address))?;
    let local_addr = server.local_addr()?;

    let mut sigterm =
        unix_signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

    let running = server.spawn();
    let handle = running.handle();

    info!(
        "nat66-socks ready on {} (dial network: {}, startup {:.2}ms)",
        local_addr,
        config.connection.dial_network,
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    let accept = running.wait();
    tokio::pin!(accept);

    // Run until a signal arrives or the accept loop stops on its own
    let finished = tokio::select! {
        result = &mut accept => Some(result),
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
            None
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, initiating shutdown...");
            None
        }
    };

    handle.shutdown();
    let accept_result = match finished {
        Some(result) => result,
        None => accept.await,
    };
    if let Err(e) = &accept_result {
        error!(error = %e, "Accept loop stopped");
    }

    // Sessions are never cancelled; a second signal exits without waiting
    let stopped = handle.stopped();
    tokio::pin!(stopped);
    let mut ticker = tokio::time::interval(DRAIN_LOG_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = &mut stopped => break,
            _ = ticker.tick() => {
                info!(active = handle.active_sessions(), "Waiting for sessions to finish");
            }
            _ = signal::ctrl_c() => {
                warn!(active = handle.active_sessions(), "Second signal, exiting without draining");
                break;
            }
            _ = sigterm.recv() => {
                warn!(active = handle.active_sessions(), "Second signal, exiting without draining");
                break;
            }
        }
    }

    let stats = handle.stats();
    info!(
        "Final stats: {} total connections, {} completed, {} errored",
        stats.total_accepted, stats.completed, stats.errored
    );
    info!("Transferred: {} bytes rx, {} bytes tx", stats.bytes_rx, stats.bytes_tx);

    drop(lock);
    info!("Shutdown complete");

    accept_result.map_err(|e| anyhow::anyhow!("Accept loop error: {e}"))
}
