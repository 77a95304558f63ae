//! Managed pluggable transport executables
//!
//! The transport runs as a child process configured through the
//! `TOR_PT_*` environment and reports its SOCKS5 listener on stdout:
//!
//! ```text
//! VERSION 1
//! PROXY DONE
//! CMETHOD obfs4 socks5 127.0.0.1:41797
//! CMETHODS DONE
//! LOG SEVERITY=notice MESSAGE="..."
//! ```
//!
//! Dialing opens a SOCKS5 connection to that listener and passes the
//! connection's arguments along as username/password.

use crate::args::PtArgs;
use crate::controller::{TransportEvents, notify};
use crate::dialer::Dialer;
use crate::socks5::TargetAddr;
use crate::socks5::auth::encode_credentials;
use crate::socks5::client::{self, Credentials};
use crate::transport::{BoxedStream, ClientFactory, LaunchContext, ParsedArgs, TransportId, TransportLauncher};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// How long a child gets to report its listeners
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for reaching the child's listener on loopback
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The managed proxy protocol version spoken here
const PT_VERSION: &str = "1";

/// ArgParser turns connection arguments into the snapshot a dial uses
pub type ArgParser = fn(&PtArgs) -> Result<ParsedArgs>;

/// forward_args passes arguments through untouched; the executable
/// validates them itself
pub fn forward_args(args: &PtArgs) -> Result<ParsedArgs> {
    Ok(ParsedArgs::Args(args.clone()))
}

/// ManagedLauncher starts one child per started transport
#[derive(Clone)]
pub struct ManagedLauncher {
    executable: PathBuf,
    parse: ArgParser,
    setup_timeout: Duration,
}

impl ManagedLauncher {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            parse: forward_args,
            setup_timeout: SETUP_TIMEOUT,
        }
    }

    pub fn with_arg_parser(mut self, parse: ArgParser) -> Self {
        self.parse = parse;
        self
    }

    pub fn with_setup_timeout(mut self, setup_timeout: Duration) -> Self {
        self.setup_timeout = setup_timeout;
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn command(&self, ctx: &LaunchContext) -> Command {
        let mut cmd = Command::new(&self.executable);

        // Whatever the host process carries must not leak into the child
        for (key, _) in std::env::vars_os() {
            if key.to_string_lossy().starts_with("TOR_PT_") {
                cmd.env_remove(key);
            }
        }

        cmd.env("TOR_PT_MANAGED_TRANSPORT_VER", PT_VERSION)
            .env("TOR_PT_CLIENT_TRANSPORTS", ctx.method.as_str())
            .env("TOR_PT_STATE_LOCATION", &ctx.state_dir)
            .env("TOR_PT_EXIT_ON_STDIN_CLOSE", "1");
        if let Some(proxy) = &ctx.proxy {
            cmd.env("TOR_PT_PROXY", proxy.as_str());
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl TransportLauncher for ManagedLauncher {
    async fn launch(&self, ctx: LaunchContext) -> Result<Arc<dyn ClientFactory>> {
        let method = ctx.method;

        let mut child = self
            .command(&ctx)
            .spawn()
            .map_err(|e| Error::launch(method.as_str(), format!("{}: {e}", self.executable.display())))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::launch(method.as_str(), "child stdout unavailable"))?;
        let mut lines = BufReader::new(stdout).lines();

        let socks_addr = timeout(
            self.setup_timeout,
            read_setup(&mut lines, method, ctx.proxy.is_some()),
        )
        .await
        .map_err(|_| Error::launch(method.as_str(), "timed out waiting for CMETHODS DONE"))??;

        info!("{} managed transport listening on {}", method, socks_addr);

        tokio::spawn(drain_output(lines, method, ctx.events.clone()));

        Ok(Arc::new(ManagedClient {
            method,
            socks_addr,
            parse: self.parse,
            _child: Mutex::new(child),
        }))
    }
}

/// read_setup consumes the setup exchange and returns the child's SOCKS
/// listener for method
async fn read_setup(
    lines: &mut Lines<BufReader<ChildStdout>>,
    method: TransportId,
    expect_proxy: bool,
) -> Result<SocketAddr> {
    let fail = |reason: String| Error::launch(method.as_str(), reason);

    let mut proxy_done = false;
    let mut socks_addr = None;

    loop {
        let Some(line) = lines.next_line().await? else {
            return Err(fail("exited before finishing setup".into()));
        };

        match parse_line(&line) {
            Message::Version(v) if v == PT_VERSION => {}
            Message::Version(v) => return Err(fail(format!("unsupported protocol version {v}"))),
            Message::VersionError(msg) => return Err(fail(format!("VERSION-ERROR {msg}"))),
            Message::EnvError(msg) => return Err(fail(format!("ENV-ERROR {msg}"))),
            Message::ProxyError(msg) => return Err(fail(format!("PROXY-ERROR {msg}"))),
            Message::ProxyDone => proxy_done = true,
            Message::CMethod { name, protocol, addr } if name == method.as_str() => {
                if protocol != "socks5" {
                    return Err(fail(format!("unsupported CMETHOD protocol {protocol}")));
                }
                socks_addr = Some(addr);
            }
            Message::CMethod { name, .. } => debug!("ignoring CMETHOD for {}", name),
            Message::CMethodError { name, message } => {
                return Err(fail(format!("CMETHOD-ERROR {name} {message}")));
            }
            Message::CMethodsDone => break,
            Message::Log { severity, message } => log_child(method, &severity, &message),
            Message::Status(status) => debug!("{} STATUS {}", method, status),
            Message::Other(other) => debug!("{} unrecognised line: {}", method, other),
        }
    }

    if expect_proxy && !proxy_done {
        return Err(fail("forward proxy was not acknowledged".into()));
    }

    socks_addr.ok_or_else(|| fail(format!("no CMETHOD line for {method}")))
}

/// drain_output keeps reading the child's stdout after setup so it never
/// blocks on a full pipe
async fn drain_output(
    mut lines: Lines<BufReader<ChildStdout>>,
    method: TransportId,
    events: Option<Arc<dyn TransportEvents>>,
) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_line(&line) {
                Message::Log { severity, message } => {
                    log_child(method, &severity, &message);
                    if severity == "error" {
                        let err = Error::transport(method.as_str(), message);
                        notify(&events, move |ev| ev.error(method, err));
                    }
                }
                Message::Status(status) => debug!("{} STATUS {}", method, status),
                _ => debug!("{} says: {}", method, line),
            },
            Ok(None) => break,
            Err(e) => {
                warn!("{} output unreadable: {}", method, e);
                break;
            }
        }
    }

    debug!("{} managed transport exited", method);
}

fn log_child(method: TransportId, severity: &str, message: &str) {
    match severity {
        "error" => error!("[{}] {}", method, message),
        "warning" => warn!("[{}] {}", method, message),
        "notice" | "info" => info!("[{}] {}", method, message),
        _ => debug!("[{}] {}", method, message),
    }
}

/// ManagedClient dials through a running child. Dropping it kills the child.
struct ManagedClient {
    method: TransportId,
    socks_addr: SocketAddr,
    parse: ArgParser,
    _child: Mutex<Child>,
}

#[async_trait]
impl ClientFactory for ManagedClient {
    fn parse_args(&self, args: &PtArgs) -> Result<ParsedArgs> {
        (self.parse)(args)
    }

    // The child applies TOR_PT_PROXY itself, so dialer is not used here
    async fn dial(&self, target: &TargetAddr, _dialer: &Dialer, args: ParsedArgs) -> Result<BoxedStream> {
        let args = match args {
            ParsedArgs::Snowflake(config) => config.to_args(),
            ParsedArgs::Args(args) => args,
        };
        let (username, password) = encode_credentials(&args)?;
        let creds = Credentials { username, password };

        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(self.socks_addr))
            .await?
            .map_err(|e| Error::dial(format!("{} listener at {} unreachable: {e}", self.method, self.socks_addr)))?;
        stream.set_nodelay(true).ok();

        client::connect(&mut stream, target, Some(&creds)).await?;

        Ok(Box::new(stream))
    }
}

/// probe_version asks a transport executable for its version
pub async fn probe_version(executable: impl AsRef<Path>) -> Result<String> {
    let executable = executable.as_ref();
    let output = timeout(
        Duration::from_secs(5),
        Command::new(executable)
            .arg("-version")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await??;

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::config(format!("{} printed no version", executable.display())))
}

/// Message is one line of managed proxy output
#[derive(Debug, Clone, PartialEq)]
enum Message {
    Version(String),
    VersionError(String),
    EnvError(String),
    ProxyDone,
    ProxyError(String),
    CMethod { name: String, protocol: String, addr: SocketAddr },
    CMethodError { name: String, message: String },
    CMethodsDone,
    Log { severity: String, message: String },
    Status(String),
    Other(String),
}

fn parse_line(line: &str) -> Message {
    let line = line.trim_end();
    let (keyword, rest) = line.split_once(' ').unwrap_or((line, ""));

    match keyword {
        "VERSION" => Message::Version(rest.to_string()),
        "VERSION-ERROR" => Message::VersionError(rest.to_string()),
        "ENV-ERROR" => Message::EnvError(rest.to_string()),
        "PROXY" if rest == "DONE" => Message::ProxyDone,
        "PROXY-ERROR" => Message::ProxyError(rest.to_string()),
        "CMETHODS" if rest == "DONE" => Message::CMethodsDone,
        "CMETHOD" => {
            let mut parts = rest.split_whitespace();
            match (parts.next(), parts.next(), parts.next().and_then(|a| a.parse().ok())) {
                (Some(name), Some(protocol), Some(addr)) => Message::CMethod {
                    name: name.to_string(),
                    protocol: protocol.to_string(),
                    addr,
                },
                _ => Message::Other(line.to_string()),
            }
        }
        "CMETHOD-ERROR" => {
            let (name, message) = rest.split_once(' ').unwrap_or((rest, ""));
            Message::CMethodError {
                name: name.to_string(),
                message: message.to_string(),
            }
        }
        "LOG" => {
            let fields = parse_fields(rest);
            let field = |key: &str| {
                fields
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default()
            };
            Message::Log {
                severity: field("SEVERITY").to_ascii_lowercase(),
                message: field("MESSAGE"),
            }
        }
        "STATUS" => Message::Status(rest.to_string()),
        _ => Message::Other(line.to_string()),
    }
}

/// parse_fields splits `K=V K="quoted \"value\""` pairs
fn parse_fields(s: &str) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    let mut chars = s.chars().peekable();

    loop {
        while chars.next_if(|c| *c == ' ').is_some() {}

        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.next_if_eq(&'"').is_some() {
            while let Some(c) = chars.next() {
                match c {
                    '\\' => value.extend(chars.next()),
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| *c != ' ') {
                value.push(c);
            }
        }

        fields.push((key, value));
    }

    fields
}
