//! Tor pluggable transports behind local SOCKS5 listeners
//!
//! Bundles the obfuscation transports (obfs4, meek_lite, webtunnel and the
//! deprecated obfs2, obfs3, scramblesuit), the Snowflake client and the
//! Snowflake volunteer proxy behind one interface, for apps that have no
//! tor process managing transports for them.
//!
//! - Features:
//!     - One SOCKS5 listener per started transport, on 127.0.0.1
//!     - Per-connection transport arguments in the SOCKS5 username/password
//!     - Forward proxy support (HTTP CONNECT, SOCKS4a, SOCKS5)
//!     - Ephemeral or stable, ordered listener ports
//!     - Event delegates for transport state and volunteer proxy clients
//! - [Pluggable Transport Specification](https://spec.torproject.org/pt-spec/)
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//!
//! # Example
//! ```no_run
//! use ptproxy::{Controller, ControllerConfig, TransportId, TransportRegistry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = TransportRegistry::with_executables("lyrebird", "snowflake-client");
//!     let controller = Controller::new(ControllerConfig::new("/var/lib/app/pt"), registry, None)?;
//!
//!     let addr = controller.start(TransportId::Obfs4, None).await?;
//!     println!("obfs4 SOCKS5 listener on {addr}");
//!
//!     controller.stop(TransportId::Obfs4).await;
//!     Ok(())
//! }
//! ```

pub mod args;
pub mod config;
pub mod controller;
pub mod dialer;
pub mod error;
pub mod events;
pub mod logging;
pub mod ports;
pub mod proxy;
pub mod relay;
pub mod socks5;
pub mod state;
pub mod transport;

// Re-export main types at crate root for convenience
pub use args::PtArgs;
pub use config::ControllerConfig;
pub use controller::{Controller, TransportEvents};
pub use dialer::{Dialer, ProxyUrl};
pub use error::{Error, Result};
pub use events::{EventDispatcher, ProxyEvent, ProxyEvents, ProxyStats};
pub use logging::LogSettings;
pub use ports::PortPolicy;
pub use proxy::{ProcessEngine, ProxyEngine, ProxySettings, SnowflakeProxy};
pub use transport::snowflake::SnowflakeSettings;
pub use transport::{ClientFactory, TransportId, TransportLauncher, TransportRegistry};
