//! Transport factories
//!
//! Every transport, wherever its protocol logic lives, is reached through
//! the same two calls: [`ClientFactory::parse_args`] turns the arguments a
//! SOCKS client sent into a configuration snapshot, and
//! [`ClientFactory::dial`] opens a stream to the bridge with that snapshot.
//! A [`TransportLauncher`] produces a factory when a transport is started.

pub mod managed;
pub mod snowflake;

pub use managed::ManagedLauncher;
pub use snowflake::SnowflakeConfig;

use crate::args::PtArgs;
use crate::controller::TransportEvents;
use crate::dialer::{Dialer, ProxyUrl};
use crate::socks5::TargetAddr;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// TransportId names a transport. The declaration order is the fixed port
/// ordering used when deterministic ports are requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportId {
    MeekLite,
    Obfs2,
    Obfs3,
    Obfs4,
    ScrambleSuit,
    Webtunnel,
    Snowflake,
}

impl TransportId {
    pub const ALL: [TransportId; 7] = [
        TransportId::MeekLite,
        TransportId::Obfs2,
        TransportId::Obfs3,
        TransportId::Obfs4,
        TransportId::ScrambleSuit,
        TransportId::Webtunnel,
        TransportId::Snowflake,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TransportId::MeekLite => "meek_lite",
            TransportId::Obfs2 => "obfs2",
            TransportId::Obfs3 => "obfs3",
            TransportId::Obfs4 => "obfs4",
            TransportId::ScrambleSuit => "scramblesuit",
            TransportId::Webtunnel => "webtunnel",
            TransportId::Snowflake => "snowflake",
        }
    }

    /// obfs2, obfs3 and scramblesuit are kept for old bridge lines only
    pub fn is_deprecated(self) -> bool {
        matches!(
            self,
            TransportId::Obfs2 | TransportId::Obfs3 | TransportId::ScrambleSuit
        )
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TransportId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| Error::UnknownTransport(s.to_string()))
    }
}

/// Stream is anything a transport can hand back from a dial
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

/// ParsedArgs is the per-connection configuration snapshot a factory
/// produced in parse_args; dial consumes it
#[derive(Debug, Clone)]
pub enum ParsedArgs {
    Snowflake(SnowflakeConfig),
    Args(PtArgs),
}

/// ClientFactory is the uniform contract over transport implementations
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// parse_args validates the connection's arguments. Unknown keys are
    /// ignored; malformed values fail with `Error::InvalidArgument`.
    fn parse_args(&self, args: &PtArgs) -> Result<ParsedArgs>;

    /// dial connects to target using a parsed snapshot. Implementations
    /// never mutate shared state here; concurrent sessions dial at once.
    async fn dial(&self, target: &TargetAddr, dialer: &Dialer, args: ParsedArgs) -> Result<BoxedStream>;
}

/// LaunchContext is everything a launcher may need to bring a transport up
#[derive(Clone)]
pub struct LaunchContext {
    pub method: TransportId,
    pub state_dir: PathBuf,
    pub proxy: Option<ProxyUrl>,
    pub events: Option<Arc<dyn TransportEvents>>,
}

/// TransportLauncher creates the client factory for a transport when it
/// is started. The factory is dropped when the transport stops.
#[async_trait]
pub trait TransportLauncher: Send + Sync {
    async fn launch(&self, ctx: LaunchContext) -> Result<Arc<dyn ClientFactory>>;
}

/// TransportRegistry maps identifiers to launchers
#[derive(Clone, Default)]
pub struct TransportRegistry {
    launchers: HashMap<TransportId, Arc<dyn TransportLauncher>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// with_executables registers the upstream transport executables:
    /// lyrebird for every obfuscation transport, snowflake-client for
    /// snowflake
    pub fn with_executables(lyrebird: impl Into<PathBuf>, snowflake_client: impl Into<PathBuf>) -> Self {
        let lyrebird: Arc<dyn TransportLauncher> = Arc::new(ManagedLauncher::new(lyrebird));
        let snowflake: Arc<dyn TransportLauncher> =
            Arc::new(ManagedLauncher::new(snowflake_client).with_arg_parser(snowflake::parse_args));

        let mut registry = Self::new();
        for id in TransportId::ALL {
            let launcher = match id {
                TransportId::Snowflake => snowflake.clone(),
                _ => lyrebird.clone(),
            };
            registry.register(id, launcher);
        }
        registry
    }

    pub fn register(&mut self, id: TransportId, launcher: Arc<dyn TransportLauncher>) {
        self.launchers.insert(id, launcher);
    }

    pub fn get(&self, id: TransportId) -> Result<Arc<dyn TransportLauncher>> {
        self.launchers
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::UnknownTransport(id.to_string()))
    }
}
