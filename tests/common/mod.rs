//! Fakes shared by the integration tests: an in-process transport that
//! dials its target directly, a PING/PONG server, and a recording delegate

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use ptproxy::socks5::TargetAddr;
use ptproxy::socks5::auth::encode_credentials;
use ptproxy::socks5::client::{self, Credentials};
use ptproxy::transport::{BoxedStream, LaunchContext, ParsedArgs};
use ptproxy::{
    ClientFactory, Controller, ControllerConfig, Dialer, Error, PtArgs, Result, TransportEvents, TransportId,
    TransportLauncher, TransportRegistry,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Counters a test can inspect after the fact
#[derive(Default)]
pub struct Probe {
    pub launches: AtomicUsize,
    pub dials: AtomicUsize,
    pub last_args: Mutex<Option<PtArgs>>,
    pub last_proxy: Mutex<Option<String>>,
}

/// DirectFactory dials the SOCKS target through the session's dialer
pub struct DirectFactory {
    probe: Arc<Probe>,
    parse: fn(&PtArgs) -> Result<ParsedArgs>,
}

#[async_trait]
impl ClientFactory for DirectFactory {
    fn parse_args(&self, args: &PtArgs) -> Result<ParsedArgs> {
        *self.probe.last_args.lock() = Some(args.clone());
        (self.parse)(args)
    }

    async fn dial(&self, target: &TargetAddr, dialer: &Dialer, _args: ParsedArgs) -> Result<BoxedStream> {
        self.probe.dials.fetch_add(1, Ordering::SeqCst);
        let stream = dialer.connect(target).await?;
        Ok(Box::new(stream))
    }
}

pub struct FakeLauncher {
    probe: Arc<Probe>,
    parse: fn(&PtArgs) -> Result<ParsedArgs>,
}

#[async_trait]
impl TransportLauncher for FakeLauncher {
    async fn launch(&self, ctx: LaunchContext) -> Result<Arc<dyn ClientFactory>> {
        self.probe.launches.fetch_add(1, Ordering::SeqCst);
        *self.probe.last_proxy.lock() = ctx.proxy.map(|p| p.as_str().to_string());
        Ok(Arc::new(DirectFactory {
            probe: self.probe.clone(),
            parse: self.parse,
        }))
    }
}

/// registry maps every transport to a fake; snowflake parses its
/// arguments for real
pub fn registry(probe: &Arc<Probe>) -> TransportRegistry {
    let mut registry = TransportRegistry::new();
    for id in TransportId::ALL {
        let parse: fn(&PtArgs) -> Result<ParsedArgs> = match id {
            TransportId::Snowflake => ptproxy::transport::snowflake::parse_args,
            _ => ptproxy::transport::managed::forward_args,
        };
        registry.register(
            id,
            Arc::new(FakeLauncher {
                probe: probe.clone(),
                parse,
            }),
        );
    }
    registry
}

/// Records delegate calls
#[derive(Default)]
pub struct Recorder {
    pub connected: Mutex<Vec<TransportId>>,
    pub errors: Mutex<Vec<(TransportId, String)>>,
    pub stopped: Mutex<Vec<(TransportId, Option<String>)>>,
}

impl TransportEvents for Recorder {
    fn connected(&self, method: TransportId) {
        self.connected.lock().push(method);
    }

    fn error(&self, method: TransportId, error: Error) {
        self.errors.lock().push((method, error.to_string()));
    }

    fn stopped(&self, method: TransportId, error: Option<Error>) {
        self.stopped.lock().push((method, error.map(|e| e.to_string())));
    }
}

pub fn state_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("ptproxy-it-{}-{}", name, std::process::id()))
}

pub struct Harness {
    pub controller: Controller,
    pub probe: Arc<Probe>,
    pub events: Arc<Recorder>,
}

pub fn harness(name: &str, config: impl FnOnce(ControllerConfig) -> ControllerConfig) -> Harness {
    let probe = Arc::new(Probe::default());
    let events = Arc::new(Recorder::default());
    let controller = Controller::new(
        config(ControllerConfig::new(state_dir(name))),
        registry(&probe),
        Some(events.clone()),
    )
    .unwrap();

    Harness {
        controller,
        probe,
        events,
    }
}

/// pong_server answers every PING with PONG and counts connections
pub async fn pong_server() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));

    let count = accepted.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            count.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                while stream.read_exact(&mut buf).await.is_ok() {
                    if &buf == b"PING" && stream.write_all(b"PONG").await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    (addr, accepted)
}

/// socks_connect opens a SOCKS5 connection through a transport listener
pub async fn socks_connect(listener: SocketAddr, target: SocketAddr, args: &str) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(listener).await?;
    let args = PtArgs::parse(args)?;
    let creds = if args.is_empty() {
        None
    } else {
        let (username, password) = encode_credentials(&args)?;
        Some(Credentials { username, password })
    };

    client::connect(&mut stream, &TargetAddr::Ip(target), creds.as_ref()).await?;
    Ok(stream)
}

/// settle gives spawned delegate calls time to land
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}
