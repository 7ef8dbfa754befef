//! tun-interceptor: userspace TCP/UDP interception on a TUN device
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! sudo ./tun-interceptor
//!
//! # Run with custom configuration
//! sudo ./tun-interceptor -c /path/to/config.json
//!
//! # Run with environment overrides
//! TUN_INTERCEPTOR_LOG_LEVEL=debug sudo ./tun-interceptor
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use tun_interceptor::config::{load_config_with_env, Config};
use tun_interceptor::{DirectDialer, Interceptor, IpRouteTable, Service, StaticResolver};

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/tun-interceptor/config.json");
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
                    println!("tun-interceptor v{}", tun_interceptor::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", arg);
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
        r#"tun-interceptor v{}

Intercept TCP and UDP traffic for configured services on a TUN device.

USAGE:
    tun-interceptor [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/tun-interceptor/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help             Print help information
    -v, --version          Print version information

ENVIRONMENT:
    TUN_INTERCEPTOR_TUN_NAME             Override TUN device name
    TUN_INTERCEPTOR_MTU                  Override device MTU
    TUN_INTERCEPTOR_LOG_LEVEL            Override log level (trace, debug, info, warn, error)
    TUN_INTERCEPTOR_UDP_MAX_CONNECTIONS  Override UDP connection limit

REQUIREMENTS:
    - Linux with /dev/net/tun
    - CAP_NET_ADMIN capability (or root) for the device and routes
"#,
        tun_interceptor::VERSION
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

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("tokio=warn".parse().unwrap_or_else(|_| level.into()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Dialer and resolver for the configured services
fn build_services(config: &Config) -> (DirectDialer, StaticResolver, Vec<Service>) {
    let mut dialer = DirectDialer::new().with_connect_timeout(config.dial.connect_timeout());
    let mut resolver = StaticResolver::new();
    let mut services = Vec::with_capacity(config.services.len());

    for svc in &config.services {
        let service = Service::new(svc.id.as_str(), svc.name.clone());
        dialer.add_upstream(service.id.clone(), svc.upstream);
        resolver.insert(service.id.clone(), svc.intercept.iter().copied());
        services.push(service);
    }

    info!("Configured {} services", services.len());
    (dialer, resolver, services)
}

#[cfg(target_os = "linux")]
fn create_device(config: &Config) -> Result<tun::AsyncDevice> {
    let mut tun_config = tun::Configuration::default();
    tun_config
        .tun_name(&config.tun.name)
        .address(config.tun.address)
        .netmask(config.tun.netmask())
        .mtu(config.tun.mtu)
        .up();

    let device = tun::create_as_async(&tun_config)
        .map_err(|e| anyhow::anyhow!("Failed to create TUN device {}: {}", config.tun.name, e))?;
    info!(
        "TUN device {} up at {}/{}",
        config.tun.name, config.tun.address, config.tun.prefix_len
    );
    Ok(device)
}

#[cfg(not(target_os = "linux"))]
fn create_device(_config: &Config) -> Result<tokio::io::DuplexStream> {
    anyhow::bail!("TUN devices are only supported on Linux")
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    // Parse arguments
    let args = Args::parse();

    // Handle generate-config
    if args.generate_config {
        tun_interceptor::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    // Load configuration
    let config = load_config_with_env(&args.config_path).map_err(|e| {
        anyhow::anyhow!("Failed to load configuration from {:?}: {}", args.config_path, e)
    })?;

    // Handle check-config
    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("tun-interceptor v{}", tun_interceptor::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let device = create_device(&config)?;
    let (dialer, resolver, services) = build_services(&config);

    let interceptor = Interceptor::new(config, Arc::new(dialer), Arc::new(IpRouteTable::new()));
    for service in &services {
        interceptor
            .intercept(service, &resolver)
            .map_err(|e| anyhow::anyhow!("Failed to intercept {}: {}", service.name, e))?;
    }
    interceptor.start(device)?;

    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
        }
        () = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    info!("Shutting down...");
    interceptor.stop().await?;

    for service in &services {
        if let Err(e) = interceptor.stop_intercepting(&service.id, true) {
            warn!("Failed to clean up {}: {}", service.name, e);
        }
    }

    let stats = interceptor.stats();
    info!(
        "Final stats: {} packets read, {} TCP, {} UDP, {} decode errors",
        stats.packets_read, stats.tcp_packets, stats.udp_packets, stats.decode_errors
    );
    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix platforms, just wait forever
    std::future::pending::<()>().await;
}
