//! Client side of SOCKS5, for talking to managed transports and to
//! upstream SOCKS5 forward proxies

use crate::socks5::address::TargetAddr;
use crate::socks5::protocol::{AddressType, AuthMethod, AuthStatus, RSV, ReplyCode, USERPASS_VERSION, Version};
use crate::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Credentials for RFC 1929. Raw bytes since transport arguments are
/// split at a byte boundary.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: Vec<u8>,
    pub password: Vec<u8>,
}

/// connect performs the SOCKS5 handshake and CONNECT request on an
/// already established stream
pub async fn connect<S>(
    stream: &mut S,
    target: &TargetAddr,
    credentials: Option<&Credentials>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Step 1: greeting. Credentials carry transport arguments, so with
    // credentials username/password is the only method offered.
    let greeting = match credentials {
        Some(_) => vec![Version::SOCKS5 as u8, 1, AuthMethod::UserPass as u8],
        None => vec![Version::SOCKS5 as u8, 1, AuthMethod::NoAuth as u8],
    };
    stream.write_all(&greeting).await?;

    // Step 2: server's choice
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != Version::SOCKS5 as u8 {
        return Err(Error::socks("invalid SOCKS5 version in method selection"));
    }

    match (AuthMethod::from_byte(choice[1]), credentials) {
        (AuthMethod::NoAuth, None) => debug!("no authentication required"),
        (AuthMethod::NoAuth, Some(_)) => {
            return Err(Error::socks("server skipped authentication, arguments would be lost"));
        }
        (AuthMethod::UserPass, Some(creds)) => authenticate(stream, creds).await?,
        _ => return Err(Error::socks("no acceptable authentication method")),
    }

    // Step 3: CONNECT
    let mut request = vec![Version::SOCKS5 as u8, 0x01, RSV];
    target.write_to(&mut request)?;
    stream.write_all(&request).await?;

    // Step 4: reply
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != Version::SOCKS5 as u8 {
        return Err(Error::socks("invalid SOCKS5 version in reply"));
    }

    if reply[1] != ReplyCode::Succeeded as u8 {
        let reason = ReplyCode::from_byte(reply[1])
            .map(ReplyCode::message)
            .unwrap_or("unknown reply code");
        return Err(Error::dial(format!("SOCKS5 CONNECT to {target} failed: {reason}")));
    }

    // Skip bound address
    let skip = match AddressType::from_byte(reply[3]) {
        Some(AddressType::IPv4) => 4 + 2,
        Some(AddressType::IPv6) => 16 + 2,
        Some(AddressType::DomainName) => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        None => return Err(Error::socks("invalid address type in reply")),
    };
    let mut bound = vec![0u8; skip];
    stream.read_exact(&mut bound).await?;

    debug!("SOCKS5 connected to {}", target);
    Ok(())
}

async fn authenticate<S>(stream: &mut S, creds: &Credentials) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let too_long = |field: &[u8]| field.is_empty() || field.len() > 255;
    if too_long(&creds.username) || too_long(&creds.password) {
        return Err(Error::socks("username and password must be 1 to 255 bytes"));
    }

    // RFC 1929 - Username/Password Authentication
    let mut request = vec![USERPASS_VERSION, creds.username.len() as u8];
    request.extend_from_slice(&creds.username);
    request.push(creds.password.len() as u8);
    request.extend_from_slice(&creds.password);
    stream.write_all(&request).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;

    if response[1] != AuthStatus::Success as u8 {
        return Err(Error::socks("authentication rejected"));
    }

    Ok(())
}
