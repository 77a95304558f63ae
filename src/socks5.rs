//! SOCKS5 as spoken by pluggable transports
//!
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928), CONNECT only
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929),
//!   used to carry per-connection transport arguments rather than credentials

pub mod address;
pub mod auth;
pub mod client;
pub mod protocol;
pub mod server;

pub use address::TargetAddr;
pub use protocol::ReplyCode;
pub use server::{SocksConn, SocksRequest};
