//! Snowflake volunteer proxy
//!
//! Lets an app donate bandwidth to censored users. The proxy runs through
//! a [`ProxyEngine`]; [`ProcessEngine`] drives the `snowflake-proxy`
//! executable and turns its log output into [`ProxyEvent`]s.

use crate::events::{EventBridge, EventDispatcher, ProxyEvent, ProxyEvents, ProxyStats};
use crate::{Error, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

lazy_static! {
    // In the last 1h0m0s, there were 4 completed successful connections. Traffic Relayed ↓ 321 KB (0.09 KB/s), ↑ 123 KB (0.03 KB/s).
    static ref STATS_RE: Regex = Regex::new(
        r"In the last (?P<interval>\S+), there were (?P<count>\d+) (?:completed )?(?:successful )?connections?(?:.*?(?P<failed>\d+) failed)?.*?Traffic Relayed ↓ (?P<in>[\d.]+) (?P<in_unit>\w+)[^,]*, ↑ (?P<out>[\d.]+) (?P<out_unit>\w+)"
    ).unwrap();

    static ref COUNTRY_RE: Regex = Regex::new(r"country[:= ]+(?P<cc>[A-Z]{2})\b").unwrap();
}

/// ProxySettings configures the volunteer proxy. Empty URLs leave the
/// engine's defaults in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxySettings {
    /// Clients served at once; 0 means unlimited
    pub capacity: i64,
    pub broker_url: String,
    pub relay_url: String,
    pub stun_url: String,
    pub nat_probe_url: String,
    /// Seconds between broker polls; 0 or less uses the engine default
    pub poll_interval: i64,
    pub summary_interval: Option<Duration>,
    /// Inclusive UDP port range for WebRTC
    pub ephemeral_ports: Option<(u16, u16)>,
    pub keep_local_addresses: bool,
    pub unsafe_logging: bool,
    pub verbose: bool,
}

impl ProxySettings {
    /// normalized clamps out-of-range numbers the way the engine expects
    pub fn normalized(mut self) -> Self {
        self.capacity = self.capacity.max(0);
        self.poll_interval = self.poll_interval.max(0);
        self
    }

    /// args renders the settings as snowflake-proxy flags
    pub fn args(&self) -> Result<Vec<String>> {
        let mut args = Vec::new();
        let mut flag = |name: &str, value: String| {
            args.push(format!("-{name}"));
            args.push(value);
        };

        if self.capacity > 0 {
            flag("capacity", self.capacity.to_string());
        }
        if !self.broker_url.is_empty() {
            flag("broker", self.broker_url.clone());
        }
        if !self.relay_url.is_empty() {
            flag("relay", self.relay_url.clone());
        }
        if !self.stun_url.is_empty() {
            flag("stun", self.stun_url.clone());
        }
        if !self.nat_probe_url.is_empty() {
            flag("nat-probe-server", self.nat_probe_url.clone());
        }
        if self.poll_interval > 0 {
            flag("poll-interval", format!("{}s", self.poll_interval));
        }
        if let Some(interval) = self.summary_interval {
            flag("summary-interval", format!("{}s", interval.as_secs().max(1)));
        }
        if let Some((min, max)) = self.ephemeral_ports {
            if min == 0 || min > max {
                return Err(Error::config(format!("invalid ephemeral port range {min}:{max}")));
            }
            flag("ephemeral-ports-range", format!("{min}:{max}"));
        }

        if self.keep_local_addresses {
            args.push("-keep-local-addresses".into());
        }
        if self.unsafe_logging {
            args.push("-unsafe-logging".into());
        }
        if self.verbose {
            args.push("-verbose".into());
        }

        Ok(args)
    }
}

/// ProxyEngine runs a volunteer proxy until shutdown fires or it fails.
/// Whatever happens is published on dispatcher.
#[async_trait]
pub trait ProxyEngine: Send + Sync {
    async fn run(&self, settings: ProxySettings, dispatcher: EventDispatcher, shutdown: CancellationToken) -> Result<()>;
}

/// ProcessEngine runs the snowflake-proxy executable
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    executable: PathBuf,
}

impl ProcessEngine {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

#[async_trait]
impl ProxyEngine for ProcessEngine {
    async fn run(&self, settings: ProxySettings, dispatcher: EventDispatcher, shutdown: CancellationToken) -> Result<()> {
        let mut child = Command::new(&self.executable)
            .args(settings.args()?)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::launch("snowflake-proxy", format!("{}: {e}", self.executable.display())))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::launch("snowflake-proxy", "child stderr unavailable"))?;
        let mut lines = BufReader::new(stderr).lines();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    child.kill().await.ok();
                    return Ok(());
                }
                line = lines.next_line() => match line? {
                    Some(line) => {
                        debug!("snowflake-proxy: {}", line);
                        if let Some(event) = parse_event(&line) {
                            dispatcher.publish(event);
                        }
                    }
                    None => break,
                },
            }
        }

        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::launch("snowflake-proxy", format!("exited with {status}")))
        }
    }
}

/// parse_event maps a snowflake-proxy log line to an event, if it is one
fn parse_event(line: &str) -> Option<ProxyEvent> {
    if let Some(caps) = STATS_RE.captures(line) {
        let number = |name: &str| caps.name(name).and_then(|m| m.as_str().parse().ok());
        return Some(ProxyEvent::Stats(ProxyStats {
            connection_count: number("count").unwrap_or(0),
            failed_connection_count: number("failed").unwrap_or(0),
            inbound_bytes: caps["in"].parse().unwrap_or(0.0),
            outbound_bytes: caps["out"].parse().unwrap_or(0.0),
            inbound_unit: caps["in_unit"].to_string(),
            outbound_unit: caps["out_unit"].to_string(),
            summary_interval: caps["interval"].to_string(),
        }));
    }

    let lower = line.to_ascii_lowercase();
    if lower.contains("connected to relay") {
        Some(ProxyEvent::ClientConnected)
    } else if lower.contains("datachannelhandler ends") || lower.contains("client disconnected") {
        let country = COUNTRY_RE
            .captures(line)
            .map(|caps| caps["cc"].to_string())
            .unwrap_or_default();
        Some(ProxyEvent::ClientDisconnected { country })
    } else if lower.contains("timed out waiting for client") || lower.contains("failed to connect") {
        Some(ProxyEvent::ConnectionFailed)
    } else {
        None
    }
}

struct Running {
    id: u64,
    shutdown: CancellationToken,
    bridge: Option<EventBridge>,
    task: JoinHandle<()>,
}

/// SnowflakeProxy starts and stops the volunteer proxy
pub struct SnowflakeProxy {
    settings: ProxySettings,
    engine: Arc<dyn ProxyEngine>,
    dispatcher: EventDispatcher,
    running: Arc<Mutex<Option<Running>>>,
    next_id: Mutex<u64>,
}

impl SnowflakeProxy {
    pub fn new(settings: ProxySettings, engine: Arc<dyn ProxyEngine>) -> Self {
        Self {
            settings,
            engine,
            dispatcher: EventDispatcher::new(),
            running: Arc::new(Mutex::new(None)),
            next_id: Mutex::new(0),
        }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// start runs the proxy in the background; a no-op when it already
    /// runs. delegate hears about clients until stop.
    pub fn start(&self, delegate: Option<Arc<dyn ProxyEvents>>) {
        let mut running = self.running.lock();
        if running.is_some() {
            debug!("snowflake proxy already running");
            return;
        }

        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };

        let shutdown = CancellationToken::new();
        let bridge = delegate.map(|d| EventBridge::attach(&self.dispatcher, d));

        let task = tokio::spawn({
            let engine = self.engine.clone();
            let settings = self.settings.clone().normalized();
            let dispatcher = self.dispatcher.clone();
            let shutdown = shutdown.clone();
            let slot = self.running.clone();
            async move {
                match engine.run(settings, dispatcher, shutdown).await {
                    Ok(()) => info!("snowflake proxy stopped"),
                    Err(e) => error!("snowflake proxy failed: {}", e),
                }

                // Ended on its own: nobody will call stop for this run
                let mut slot = slot.lock();
                if slot.as_ref().is_some_and(|r| r.id == id) {
                    if let Some(bridge) = slot.take().and_then(|r| r.bridge) {
                        bridge.detach();
                    }
                }
            }
        });

        *running = Some(Running {
            id,
            shutdown,
            bridge,
            task,
        });
        info!("snowflake proxy started");
    }

    /// stop shuts the proxy down and detaches the delegate
    pub async fn stop(&self) {
        let Some(run) = self.running.lock().take() else {
            return;
        };

        if let Some(bridge) = run.bridge {
            bridge.detach();
        }
        run.shutdown.cancel();
        if let Err(e) = run.task.await {
            warn!("snowflake proxy task ended abnormally: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_settings_flags() {
        let settings = ProxySettings {
            capacity: -3,
            broker_url: "https://broker.example/".into(),
            poll_interval: 20,
            ephemeral_ports: Some((50000, 51000)),
            verbose: true,
            ..Default::default()
        }
        .normalized();

        assert_eq!(settings.capacity, 0);
        let args = settings.args().unwrap();
        assert_eq!(
            args,
            vec![
                "-broker",
                "https://broker.example/",
                "-poll-interval",
                "20s",
                "-ephemeral-ports-range",
                "50000:51000",
                "-verbose",
            ]
        );
    }

    #[test]
    fn test_bad_port_range() {
        let settings = ProxySettings {
            ephemeral_ports: Some((6000, 5000)),
            ..Default::default()
        };
        assert!(matches!(settings.args(), Err(Error::Config(_))));
    }

    #[test]
    fn test_parse_stats_line() {
        let line = "2024/05/01 10:00:00 In the last 1h0m0s, there were 4 completed successful connections. \
                    Traffic Relayed ↓ 321 KB (0.09 KB/s), ↑ 123 KB (0.03 KB/s).";
        let Some(ProxyEvent::Stats(stats)) = parse_event(line) else {
            panic!("no stats in {line}");
        };
        assert_eq!(stats.connection_count, 4);
        assert_eq!(stats.failed_connection_count, 0);
        assert_eq!(stats.inbound_bytes, 321.0);
        assert_eq!(stats.outbound_unit, "KB");
        assert_eq!(stats.summary_interval, "1h0m0s");
    }

    #[test]
    fn test_parse_client_events() {
        assert_eq!(parse_event("2024/05/01 Connected to relay: wss://x"), Some(ProxyEvent::ClientConnected));
        assert_eq!(
            parse_event("datachannelHandler ends, country: BR"),
            Some(ProxyEvent::ClientDisconnected { country: "BR".into() })
        );
        assert_eq!(parse_event("sdp offer successfully received."), None);
    }

    /// Publishes one connection then idles until shut down
    struct OneClient;

    #[async_trait]
    impl ProxyEngine for OneClient {
        async fn run(&self, _settings: ProxySettings, dispatcher: EventDispatcher, shutdown: CancellationToken) -> Result<()> {
            dispatcher.publish(ProxyEvent::ClientConnected);
            shutdown.cancelled().await;
            Ok(())
        }
    }

    /// Fails straight away
    struct Broken;

    #[async_trait]
    impl ProxyEngine for Broken {
        async fn run(&self, _settings: ProxySettings, _dispatcher: EventDispatcher, _shutdown: CancellationToken) -> Result<()> {
            Err(Error::launch("snowflake-proxy", "broken"))
        }
    }

    #[derive(Default)]
    struct Connected(AtomicUsize);

    impl ProxyEvents for Connected {
        fn client_connected(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_start_stop() {
        let proxy = SnowflakeProxy::new(ProxySettings::default(), Arc::new(OneClient));
        let delegate = Arc::new(Connected::default());

        proxy.start(Some(delegate.clone()));
        proxy.start(Some(delegate.clone()));
        assert!(proxy.is_running());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(delegate.0.load(Ordering::SeqCst), 1);

        proxy.stop().await;
        assert!(!proxy.is_running());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(proxy.dispatcher().listener_count(), 0);
    }

    #[tokio::test]
    async fn test_engine_failure_resets_state() {
        let proxy = SnowflakeProxy::new(ProxySettings::default(), Arc::new(Broken));
        proxy.start(Some(Arc::new(Connected::default())));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!proxy.is_running());
    }
}
