use crate::args::PtArgs;
use crate::socks5::address::TargetAddr;
use crate::socks5::auth::negotiate_auth;
use crate::socks5::protocol::{Command, RSV, ReplyCode, Version};
use crate::{Error, Result};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// SocksRequest is what a client asked for: where to go and the
/// transport arguments it supplied on the way
#[derive(Debug, Clone)]
pub struct SocksRequest {
    pub target: TargetAddr,
    pub args: PtArgs,
}

/// SocksConn is an inbound SOCKS5 connection that has completed the
/// handshake and is waiting for a grant or a reject
pub struct SocksConn<S = TcpStream> {
    stream: S,
    pub req: SocksRequest,
}

impl<S> SocksConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// accept runs the server side of the handshake on a freshly
    /// accepted stream: method negotiation, argument sub-negotiation,
    /// then the CONNECT request
    pub async fn accept(mut stream: S) -> Result<Self> {
        let args = negotiate_auth(&mut stream).await?;
        let target = read_connect_request(&mut stream).await?;

        Ok(SocksConn {
            stream,
            req: SocksRequest { target, args },
        })
    }

    /// grant tells the client its connection is up. Transports report an
    /// unspecified bound address.
    pub async fn grant(&mut self) -> Result<()> {
        let unspecified = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        send_reply(&mut self.stream, ReplyCode::Succeeded, unspecified).await
    }

    /// reject sends a failure reply; the caller drops the connection after
    pub async fn reject(&mut self, code: ReplyCode) -> Result<()> {
        let unspecified = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        send_reply(&mut self.stream, code, unspecified).await
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

/// read_connect_request checks the incoming request for SOCKS5 version
/// number and command. Only CONNECT is served; everything else is
/// answered with CommandNotSupported.
async fn read_connect_request<S>(stream: &mut S) -> Result<TargetAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // SOCKS5 request format
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+

    // Instantiate a request buffer & read
    let mut reqbuf = [0u8; 3];
    stream.read_exact(&mut reqbuf).await?;

    let version = reqbuf[0];
    let command = reqbuf[1];

    if version != Version::SOCKS5 as u8 {
        return Err(Error::socks(format!("unsupported SOCKS version {version:#04x}")));
    }

    // The address has to be consumed either way so the reply is well formed
    let target = TargetAddr::read_from(stream).await;
    let unspecified = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));

    match Command::from_byte(command) {
        Some(Command::Connect) => match target {
            Ok(target) => Ok(target),
            Err(e) => {
                send_reply(stream, ReplyCode::AddrTypeUnsupported, unspecified).await?;
                Err(e)
            }
        },
        Some(other) => {
            send_reply(stream, ReplyCode::CommandNotSupported, unspecified).await?;
            Err(Error::socks(format!("{other:?} not supported")))
        }
        None => {
            send_reply(stream, ReplyCode::CommandNotSupported, unspecified).await?;
            Err(Error::socks(format!("unknown command {command:#04x}")))
        }
    }
}

/// send_reply handles logic for sending replies from the SOCKS server to
/// the client
async fn send_reply<S>(stream: &mut S, reply_code: ReplyCode, bound_addr: SocketAddr) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    // SOCKS5 reply format
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+

    let mut reply = vec![Version::SOCKS5 as u8, reply_code as u8, RSV];
    TargetAddr::Ip(bound_addr).write_to(&mut reply)?;

    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    const GRANT: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

    #[tokio::test]
    async fn test_accept_connect_and_grant() {
        let mut stream = Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&[0x05, 0x01, 0x00, 0x01, 192, 0, 2, 3, 0x01, 0xbb])
            .write(&GRANT)
            .build();

        let mut conn = SocksConn::accept(&mut stream).await.unwrap();
        assert_eq!(conn.req.target, "192.0.2.3:443".parse().unwrap());
        conn.grant().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_is_refused() {
        let mut stream = Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .write(&[0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .build();

        assert!(SocksConn::accept(&mut stream).await.is_err());
    }
}
