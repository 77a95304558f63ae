use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use ptproxy::transport::managed::probe_version;
use ptproxy::{
    Controller, ControllerConfig, Error, LogSettings, ProcessEngine, ProxyEvents, ProxySettings, ProxyStats,
    SnowflakeProxy, SnowflakeSettings, TransportEvents, TransportId, TransportRegistry,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Tor pluggable transports behind local SOCKS5 listeners", long_about = None)]
struct Cli {
    /// Log level: ERROR, WARN, INFO or DEBUG
    #[arg(long, global = true, default_value = "INFO")]
    log_level: String,

    /// Keep IP addresses in log output
    #[arg(long, global = true)]
    unsafe_logging: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start transport clients and print their SOCKS5 addresses
    Client(ClientArgs),
    /// Run a Snowflake volunteer proxy
    Proxy(ProxyArgs),
    /// Print the versions of the transport executables
    Versions(Executables),
}

/// Executables the client side runs
#[derive(Args, Debug)]
struct ClientExecutables {
    /// lyrebird executable
    #[arg(long, default_value = "lyrebird")]
    lyrebird: PathBuf,

    /// snowflake-client executable
    #[arg(long, default_value = "snowflake-client")]
    snowflake_client: PathBuf,
}

#[derive(Args, Debug)]
struct Executables {
    #[command(flatten)]
    client: ClientExecutables,

    /// snowflake-proxy executable
    #[arg(long, default_value = "snowflake-proxy")]
    snowflake_proxy: PathBuf,
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// State directory for transports and the log file
    #[arg(short, long)]
    state_dir: PathBuf,

    /// Transport to start, may be repeated
    #[arg(short, long = "transport", required = true, value_parser = parse_transport)]
    transports: Vec<TransportId>,

    /// Forward proxy, e.g. socks5://127.0.0.1:9050
    #[arg(short, long)]
    proxy: Option<String>,

    /// Use stable, ordered ports instead of ephemeral ones
    #[arg(long)]
    fixed_ports: bool,

    /// Write the log to ipt.log in the state directory
    #[arg(long)]
    log_to_file: bool,

    #[command(flatten)]
    executables: ClientExecutables,

    #[command(flatten)]
    snowflake: SnowflakeArgs,
}

#[derive(Args, Debug)]
struct SnowflakeArgs {
    /// Comma separated ICE servers
    #[arg(long)]
    snowflake_ice: Option<String>,

    /// Snowflake broker URL
    #[arg(long)]
    snowflake_broker: Option<String>,

    /// Comma separated front domains
    #[arg(long)]
    snowflake_fronts: Option<String>,

    /// AMP cache URL for rendezvous
    #[arg(long)]
    snowflake_ampcache: Option<String>,

    /// SQS queue URL for rendezvous
    #[arg(long)]
    snowflake_sqs_queue: Option<String>,

    /// SQS credentials
    #[arg(long)]
    snowflake_sqs_creds: Option<String>,

    /// Number of snowflake peers to keep
    #[arg(long, default_value_t = 1)]
    snowflake_max_peers: i64,
}

impl From<SnowflakeArgs> for SnowflakeSettings {
    fn from(args: SnowflakeArgs) -> Self {
        SnowflakeSettings {
            ice_servers: args.snowflake_ice.unwrap_or_default(),
            broker_url: args.snowflake_broker.unwrap_or_default(),
            front_domains: args.snowflake_fronts.unwrap_or_default(),
            ampcache_url: args.snowflake_ampcache.unwrap_or_default(),
            sqs_queue_url: args.snowflake_sqs_queue.unwrap_or_default(),
            sqs_creds: args.snowflake_sqs_creds.unwrap_or_default(),
            max_peers: args.snowflake_max_peers,
        }
    }
}

#[derive(Args, Debug)]
struct ProxyArgs {
    /// Maximum concurrent clients, 0 for unlimited
    #[arg(short, long, default_value_t = 0)]
    capacity: i64,

    /// Broker URL
    #[arg(long, default_value = "")]
    broker: String,

    /// WebSocket relay URL
    #[arg(long, default_value = "")]
    relay: String,

    /// STUN server URL
    #[arg(long, default_value = "")]
    stun: String,

    /// NAT probe server URL
    #[arg(long, default_value = "")]
    nat_probe: String,

    /// Seconds between broker polls
    #[arg(long, default_value_t = 0)]
    poll_interval: i64,

    /// Seconds between traffic summaries
    #[arg(long)]
    summary_interval: Option<u64>,

    /// snowflake-proxy executable
    #[arg(long, default_value = "snowflake-proxy")]
    snowflake_proxy: PathBuf,

    /// Verbose proxy output
    #[arg(short, long)]
    verbose: bool,
}

fn parse_transport(s: &str) -> std::result::Result<TransportId, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

/// Logs transport events
struct LogEvents;

impl TransportEvents for LogEvents {
    fn connected(&self, method: TransportId) {
        info!("{} connected", method);
    }

    fn error(&self, method: TransportId, error: Error) {
        warn!("{} error: {}", method, error);
    }

    fn stopped(&self, method: TransportId, error: Option<Error>) {
        match error {
            Some(e) => warn!("{} connection stopped: {}", method, e),
            None => info!("{} connection closed", method),
        }
    }
}

impl ProxyEvents for LogEvents {
    fn client_connected(&self) {
        info!("client connected");
    }

    fn client_disconnected(&self, country: &str) {
        info!("client disconnected ({})", if country.is_empty() { "unknown" } else { country });
    }

    fn connection_failed(&self) {
        warn!("client connection failed");
    }

    fn stats(&self, stats: &ProxyStats) {
        info!(
            "in the last {}: {} connections, {} failed, {} {} in, {} {} out",
            stats.summary_interval,
            stats.connection_count,
            stats.failed_connection_count,
            stats.inbound_bytes,
            stats.inbound_unit,
            stats.outbound_bytes,
            stats.outbound_unit,
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log = LogSettings {
        level: cli.log_level,
        to_file: false,
        unsafe_logging: cli.unsafe_logging,
    };

    match cli.command {
        Command::Client(args) => run_client(args, log).await,
        Command::Proxy(args) => run_proxy(args, log).await,
        Command::Versions(exes) => {
            ptproxy::logging::init(&log, Path::new("."))?;
            print_versions(&exes).await;
            Ok(())
        }
    }
}

async fn run_client(args: ClientArgs, mut log: LogSettings) -> Result<()> {
    log.to_file = args.log_to_file;

    let mut config = ControllerConfig::new(&args.state_dir)
        .with_logging(log)
        .with_snowflake(args.snowflake.into());
    if args.fixed_ports {
        config = config.with_fixed_ports();
    }

    let registry = TransportRegistry::with_executables(&args.executables.lyrebird, &args.executables.snowflake_client);
    let controller = Controller::new(config, registry, Some(Arc::new(LogEvents)))?;

    for method in &args.transports {
        match controller.start(*method, args.proxy.as_deref()).await {
            Ok(addr) => println!("{method} {addr}"),
            Err(e) => {
                controller.stop_all().await;
                bail!("[ERR] failed to start {method}: {e}");
            }
        }
    }

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;

    info!("shutting down");
    controller.stop_all().await;
    Ok(())
}

async fn run_proxy(args: ProxyArgs, log: LogSettings) -> Result<()> {
    ptproxy::logging::init(&log, Path::new("."))?;

    let settings = ProxySettings {
        capacity: args.capacity,
        broker_url: args.broker,
        relay_url: args.relay,
        stun_url: args.stun,
        nat_probe_url: args.nat_probe,
        poll_interval: args.poll_interval,
        summary_interval: args.summary_interval.map(Duration::from_secs),
        unsafe_logging: log.unsafe_logging,
        verbose: args.verbose,
        ..Default::default()
    };
    // Catch bad flags before the proxy is up
    settings.args()?;

    let proxy = SnowflakeProxy::new(settings, Arc::new(ProcessEngine::new(args.snowflake_proxy)));
    proxy.start(Some(Arc::new(LogEvents)));

    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("waiting for Ctrl-C")?,
        _ = wait_stopped(&proxy) => {
            error!("snowflake proxy exited");
            bail!("[ERR] snowflake proxy exited");
        }
    }

    proxy.stop().await;
    Ok(())
}

async fn wait_stopped(proxy: &SnowflakeProxy) {
    while proxy.is_running() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn print_versions(exes: &Executables) {
    for exe in [&exes.client.lyrebird, &exes.client.snowflake_client, &exes.snowflake_proxy] {
        match probe_version(exe).await {
            Ok(version) => println!("{}: {}", exe.display(), version),
            Err(e) => println!("{}: unavailable ({})", exe.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_takes_only_client_executables() {
        let cli = Cli::try_parse_from(["ptproxy", "client", "-s", "/tmp/pt", "-t", "obfs4", "--lyrebird", "/opt/lyrebird"])
            .unwrap();
        let Command::Client(args) = cli.command else {
            panic!("expected client command");
        };
        assert_eq!(args.executables.lyrebird, PathBuf::from("/opt/lyrebird"));
        assert_eq!(args.transports, vec![TransportId::Obfs4]);

        let err = Cli::try_parse_from(["ptproxy", "client", "-s", "/tmp/pt", "-t", "obfs4", "--snowflake-proxy", "x"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
    }

    #[test]
    fn test_versions_takes_every_executable() {
        let cli = Cli::try_parse_from(["ptproxy", "versions", "--snowflake-proxy", "/opt/sfp"]).unwrap();
        let Command::Versions(exes) = cli.command else {
            panic!("expected versions command");
        };
        assert_eq!(exes.snowflake_proxy, PathBuf::from("/opt/sfp"));
        assert_eq!(exes.client.lyrebird, PathBuf::from("lyrebird"));
    }
}
