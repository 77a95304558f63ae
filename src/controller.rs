//! Transport lifecycle
//!
//! A [`Controller`] owns every running transport: its listener, the accept
//! task, the sessions spawned from it and the client factory they dial
//! through. Starting a transport that is already running hands back the
//! existing address; stopping closes the listener and every session.

use crate::args::PtArgs;
use crate::config::ControllerConfig;
use crate::dialer::{Dialer, ProxyScheme, ProxyUrl};
use crate::ports::bind_listener;
use crate::relay::{self, SessionContext};
use crate::state::prepare_state_dir;
use crate::transport::snowflake::SnowflakeSettings;
use crate::transport::{ClientFactory, LaunchContext, TransportId, TransportRegistry};
use crate::{Error, Result, logging};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// How long stop waits for open sessions to wind down
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// TransportEvents is the caller's delegate for transport state changes.
/// Every call happens on its own blocking task, never on the caller's.
pub trait TransportEvents: Send + Sync {
    /// connected fires once a transport is usable: right after start for
    /// most transports, and for snowflake every time a connection through
    /// a proxy is up
    fn connected(&self, method: TransportId);

    /// error reports trouble a transport may recover from, such as a
    /// snowflake rendezvous that failed
    fn error(&self, method: TransportId, error: Error);

    /// stopped fires when a connection ends, with the error that ended it
    fn stopped(&self, method: TransportId, error: Option<Error>);
}

/// notify runs a delegate call on its own task
pub(crate) fn notify<F>(events: &Option<Arc<dyn TransportEvents>>, f: F)
where
    F: FnOnce(&dyn TransportEvents) + Send + 'static,
{
    if let Some(events) = events.clone() {
        tokio::task::spawn_blocking(move || f(events.as_ref()));
    }
}

struct RunningTransport {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    sessions: TaskTracker,
    accept: JoinHandle<()>,
    generation: u64,
    factory: Arc<dyn ClientFactory>,
}

struct Inner {
    config: ControllerConfig,
    registry: TransportRegistry,
    events: Option<Arc<dyn TransportEvents>>,
    running: RwLock<HashMap<TransportId, RunningTransport>>,
    snowflake: RwLock<SnowflakeSettings>,
    // start and stop run one at a time
    lifecycle: Mutex<()>,
    generation: AtomicU64,
}

impl Inner {
    /// accept_failed drops a transport whose listener died, unless it has
    /// been restarted in the meantime
    fn accept_failed(&self, method: TransportId, generation: u64, err: Error) {
        let removed = {
            let mut running = self.running.write();
            match running.get(&method) {
                Some(entry) if entry.generation == generation => running.remove(&method),
                _ => None,
            }
        };

        if let Some(entry) = removed {
            error!("{} listener failed, transport stopped: {}", method, err);
            entry.shutdown.cancel();
            entry.sessions.close();
            notify(&self.events, move |ev| ev.stopped(method, Some(err)));
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for entry in self.running.get_mut().values() {
            entry.shutdown.cancel();
        }
    }
}

/// Controller starts and stops transports
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    /// new checks the state directory and, when configured, sets up
    /// logging. events receives transport notifications.
    pub fn new(
        config: ControllerConfig,
        registry: TransportRegistry,
        events: Option<Arc<dyn TransportEvents>>,
    ) -> Result<Self> {
        prepare_state_dir(&config.state_dir)?;

        if let Some(log) = &config.log {
            logging::init(log, &config.state_dir)?;
        }

        let snowflake = config.snowflake.clone();
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry,
                events,
                running: RwLock::new(HashMap::new()),
                snowflake: RwLock::new(snowflake),
                lifecycle: Mutex::new(()),
                generation: AtomicU64::new(0),
            }),
        })
    }

    /// start brings method up and returns its SOCKS address. A forward
    /// proxy URL may be given as `http://`, `socks4://` or `socks5://`;
    /// snowflake only takes socks5.
    pub async fn start(&self, method: TransportId, proxy: Option<&str>) -> Result<SocketAddr> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        if let Some(addr) = self.local_address(method) {
            debug!("{} already running on {}", method, addr);
            return Ok(addr);
        }

        let proxy = proxy
            .filter(|p| !p.is_empty())
            .map(ProxyUrl::parse)
            .transpose()
            .inspect_err(|e| error!("failed to parse proxy address: {}", e))?;

        if let Some(p) = &proxy {
            if method == TransportId::Snowflake && p.scheme != ProxyScheme::Socks5 {
                return Err(Error::proxy_url(p.as_str(), "snowflake only supports socks5 proxies"));
            }
        }

        let state_dir = self.inner.config.state_dir.clone();
        prepare_state_dir(&state_dir)?;

        let launcher = self.inner.registry.get(method)?;

        // Snowflake takes the proxy as a connection argument, everything
        // else dials through it
        let (extra_args, launch_proxy, dialer) = match method {
            TransportId::Snowflake => (self.snowflake().extra_args(proxy.as_ref()), None, Dialer::direct()),
            _ => {
                let dialer = proxy.clone().map(Dialer::via).unwrap_or_default();
                (PtArgs::new(), proxy, dialer)
            }
        };

        let factory = launcher
            .launch(LaunchContext {
                method,
                state_dir,
                proxy: launch_proxy,
                events: self.inner.events.clone(),
            })
            .await
            .inspect_err(|e| error!("failed to initialize {}: {}", method, e))?;

        let held: Vec<(TransportId, u16)> = self
            .inner
            .running
            .read()
            .iter()
            .map(|(id, entry)| (*id, entry.local_addr.port()))
            .collect();
        let listener = bind_listener(&self.inner.config.ports, method, &held)
            .await
            .inspect_err(|e| error!("failed to initialize {}: {}", method, e))?;
        let local_addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let sessions = TaskTracker::new();
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);

        let ctx = Arc::new(SessionContext {
            method,
            factory: factory.clone(),
            dialer,
            extra_args,
            events: self.inner.events.clone(),
            shutdown: shutdown.clone(),
        });

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let accept = tokio::spawn({
            let sessions = sessions.clone();
            async move {
                if let Err(e) = relay::accept_loop(listener, ctx, sessions).await {
                    if let Some(inner) = weak.upgrade() {
                        inner.accept_failed(method, generation, e);
                    }
                }
            }
        });

        self.inner.running.write().insert(
            method,
            RunningTransport {
                local_addr,
                shutdown,
                sessions,
                accept,
                generation,
                factory,
            },
        );

        if method != TransportId::Snowflake {
            notify(&self.inner.events, move |ev| ev.connected(method));
        }

        info!("launched transport {} on {}", method, local_addr);
        Ok(local_addr)
    }

    /// stop shuts method down: the listener closes, open sessions are
    /// cancelled and the transport's resources are released. Stopping a
    /// transport that is not running does nothing.
    pub async fn stop(&self, method: TransportId) {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let Some(entry) = self.inner.running.write().remove(&method) else {
            warn!("{} is not running", method);
            return;
        };

        entry.shutdown.cancel();
        if let Err(e) = entry.accept.await {
            warn!("{} accept task ended abnormally: {}", method, e);
        }

        entry.sessions.close();
        if tokio::time::timeout(SESSION_DRAIN_TIMEOUT, entry.sessions.wait())
            .await
            .is_err()
        {
            warn!("{} still has {} sessions after shutdown", method, entry.sessions.len());
        }

        drop(entry.factory);
        info!("stopped transport {}", method);
    }

    /// stop_all stops every running transport
    pub async fn stop_all(&self) {
        for method in self.running() {
            self.stop(method).await;
        }
    }

    /// local_address is where method accepts SOCKS connections, if running
    pub fn local_address(&self, method: TransportId) -> Option<SocketAddr> {
        self.inner.running.read().get(&method).map(|e| e.local_addr)
    }

    pub fn port(&self, method: TransportId) -> Option<u16> {
        self.local_address(method).map(|addr| addr.port())
    }

    pub fn is_running(&self, method: TransportId) -> bool {
        self.inner.running.read().contains_key(&method)
    }

    /// running lists the running transports in port order
    pub fn running(&self) -> Vec<TransportId> {
        let mut methods: Vec<_> = self.inner.running.read().keys().copied().collect();
        methods.sort();
        methods
    }

    /// active_sessions counts the open connections of method
    pub fn active_sessions(&self, method: TransportId) -> usize {
        self.inner
            .running
            .read()
            .get(&method)
            .map_or(0, |e| e.sessions.len())
    }

    pub fn state_dir(&self) -> &Path {
        &self.inner.config.state_dir
    }

    /// set_snowflake replaces the static snowflake settings. They take
    /// effect the next time snowflake is started.
    pub fn set_snowflake(&self, settings: SnowflakeSettings) {
        *self.inner.snowflake.write() = settings;
    }

    pub fn snowflake(&self) -> SnowflakeSettings {
        self.inner.snowflake.read().clone()
    }
}
