use crate::args::PtArgs;
use crate::socks5::protocol::{AuthMethod, AuthStatus, USERPASS_VERSION, Version};
use crate::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// negotiate_auth handles authentication negotiation between the SOCKS
/// server and client. Pluggable transports carry their per-connection
/// arguments in the RFC 1929 username/password fields, so the credentials
/// are not checked but decoded into PtArgs. A client that only offers
/// no-auth gets an empty argument set.
pub async fn negotiate_auth<S>(stream: &mut S) -> Result<PtArgs>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ClientHello format
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+

    // Instantiate handshake buffer & read
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    // Parse version and client methods from handshake
    let version = buf[0];
    let n_methods = buf[1];

    // Ensure version is 0x05 -> SOCKS5
    if version != Version::SOCKS5 as u8 {
        return Err(Error::socks(format!("unsupported SOCKS version {version:#04x}")));
    }

    let mut methods = vec![0u8; n_methods as usize];
    stream.read_exact(&mut methods).await?;

    // Retrieve desired method
    let method = select_auth_method(&methods);

    // Write response to client with selected method
    stream.write_all(&[Version::SOCKS5 as u8, method as u8]).await?;

    // Route to appropriate auth handler
    match method {
        AuthMethod::UserPass => read_pt_args(stream).await,
        AuthMethod::NoAuth => Ok(PtArgs::new()),
        AuthMethod::NoAcceptable => Err(Error::socks("no acceptable authentication method")),
    }
}

/// read_pt_args runs the RFC 1929 sub-negotiation and decodes the
/// concatenated username and password as transport arguments
async fn read_pt_args<S>(stream: &mut S) -> Result<PtArgs>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Client Username/Password Request
    // +----+------+----------+------+----------+
    // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    // +----+------+----------+------+----------+
    // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    // +----+------+----------+------+----------+

    let mut ver = [0u8; 1];
    stream.read_exact(&mut ver).await?;

    if ver[0] != USERPASS_VERSION {
        return Err(Error::socks(format!(
            "invalid username/password version {:#04x}",
            ver[0]
        )));
    }

    // Read username
    let mut username_len = [0u8; 1];
    stream.read_exact(&mut username_len).await?;
    let mut encoded = vec![0u8; username_len[0] as usize];
    stream.read_exact(&mut encoded).await?;

    // Read password
    let mut password_len = [0u8; 1];
    stream.read_exact(&mut password_len).await?;
    let mut password = vec![0u8; password_len[0] as usize];
    stream.read_exact(&mut password).await?;

    // A lone NUL field stands for an empty one, RFC 1929 forbids zero lengths
    if encoded == [0u8] {
        encoded.clear();
    }
    if password != [0u8] {
        encoded.extend_from_slice(&password);
    }

    let parsed = String::from_utf8(encoded)
        .map_err(|e| Error::socks(format!("arguments are not UTF-8: {e}")))
        .and_then(|s| PtArgs::parse(&s));

    // Username/Password Server response
    // +----+--------+
    // |VER | STATUS |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    let status = match parsed {
        Ok(_) => AuthStatus::Success,
        Err(_) => AuthStatus::Failure,
    };
    stream.write_all(&[USERPASS_VERSION, status as u8]).await?;

    parsed
}

/// select_auth_method takes the methods offered by the SOCKS client and
/// returns the one to use. Username/password is preferred since that is
/// the only way to receive transport arguments.
fn select_auth_method(client_methods: &[u8]) -> AuthMethod {
    // Preferred auth method order
    const PREFERRED_METHODS: &[AuthMethod] = &[AuthMethod::UserPass, AuthMethod::NoAuth];

    // Iterate through preferences in order. If there's a match
    // return it
    for &preferred in PREFERRED_METHODS {
        if client_methods.contains(&(preferred as u8)) {
            return preferred;
        }
    }

    AuthMethod::NoAcceptable
}

/// encode_credentials splits encoded arguments over the RFC 1929 fields:
/// the first 255 bytes go in the username, the rest in the password, and
/// an empty password is sent as a single NUL byte
pub fn encode_credentials(args: &PtArgs) -> Result<(Vec<u8>, Vec<u8>)> {
    let encoded = args.encode().into_bytes();
    if encoded.len() > 255 * 2 {
        return Err(Error::socks(format!(
            "encoded arguments too long: {} bytes",
            encoded.len()
        )));
    }

    if encoded.len() <= 255 {
        let username = if encoded.is_empty() { vec![0u8] } else { encoded };
        return Ok((username, vec![0u8]));
    }

    let (username, password) = encoded.split_at(255);
    Ok((username.to_vec(), password.to_vec()))
}
