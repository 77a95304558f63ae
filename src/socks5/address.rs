use crate::socks5::protocol::AddressType;
use crate::{Error, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt};

/// TargetAddr is the destination a SOCKS client asked for: either a
/// literal socket address or a domain name that is resolved by whoever
/// dials it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(addr) => addr.ip().to_string(),
            TargetAddr::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// read_from parses ATYP | DST.ADDR | DST.PORT from a client request
    pub async fn read_from<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Self> {
        // Read address type byte from stream
        let mut atype = [0u8; 1];
        stream.read_exact(&mut atype).await?;

        // Match type and extract address or domain name
        let target = match AddressType::from_byte(atype[0]) {
            Some(AddressType::IPv4) => {
                let mut addr = [0u8; 4];
                stream.read_exact(&mut addr).await?;
                let ip = Ipv4Addr::from(addr);
                TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), read_port(stream).await?))
            }
            Some(AddressType::DomainName) => {
                // First octet in DomainName contains the number of
                // octets to follow
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                if len[0] == 0 {
                    return Err(Error::socks("domain length cannot be 0"));
                }

                let mut domain = vec![0u8; len[0] as usize];
                stream.read_exact(&mut domain).await?;
                let domain = String::from_utf8(domain)
                    .map_err(|e| Error::socks(format!("invalid domain: {e}")))?;

                TargetAddr::Domain(domain, read_port(stream).await?)
            }
            Some(AddressType::IPv6) => {
                let mut addr = [0u8; 16];
                stream.read_exact(&mut addr).await?;
                let ip = Ipv6Addr::from(addr);
                TargetAddr::Ip(SocketAddr::new(IpAddr::V6(ip), read_port(stream).await?))
            }
            None => {
                return Err(Error::socks(format!(
                    "unsupported or unknown address type: {:#04x}",
                    atype[0]
                )));
            }
        };

        Ok(target)
    }

    /// write_to appends ATYP | ADDR | PORT in wire format
    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                buf.push(AddressType::IPv4 as u8);
                buf.extend_from_slice(&addr.ip().octets());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                buf.push(AddressType::IPv6 as u8);
                buf.extend_from_slice(&addr.ip().octets());
            }
            TargetAddr::Domain(domain, _) => {
                if domain.is_empty() || domain.len() > 255 {
                    return Err(Error::socks(format!("invalid domain length: {}", domain.len())));
                }
                buf.push(AddressType::DomainName as u8);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port().to_be_bytes());
        Ok(())
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{addr}"),
            TargetAddr::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

impl FromStr for TargetAddr {
    type Err = Error;

    /// Accepts `1.2.3.4:80`, `[::1]:80` and `host.example:80`
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(TargetAddr::Ip(addr));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::socks(format!("missing port in address {s:?}")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::socks(format!("invalid port in address {s:?}")))?;
        if host.is_empty() || host.contains(':') {
            return Err(Error::socks(format!("invalid host in address {s:?}")));
        }

        Ok(TargetAddr::Domain(host.to_string(), port))
    }
}

async fn read_port<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u16> {
    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    Ok(u16::from_be_bytes(port_buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_domain() {
        let mut wire: &[u8] = &[0x03, 0x0b, b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'o', b'r', b'g', 0x01, 0xbb];
        let target = TargetAddr::read_from(&mut wire).await.unwrap();
        assert_eq!(target, TargetAddr::Domain("example.org".into(), 443));
    }

    #[tokio::test]
    async fn test_read_unknown_type() {
        let mut wire: &[u8] = &[0x02, 0, 0];
        assert!(TargetAddr::read_from(&mut wire).await.is_err());
    }

    #[test]
    fn test_write_ipv4() {
        let target: TargetAddr = "192.0.2.3:80".parse().unwrap();
        let mut buf = Vec::new();
        target.write_to(&mut buf).unwrap();
        assert_eq!(buf, vec![0x01, 192, 0, 2, 3, 0x00, 0x50]);
    }

    #[test]
    fn test_from_str() {
        assert_eq!(
            "[::1]:9050".parse::<TargetAddr>().unwrap(),
            TargetAddr::Ip("[::1]:9050".parse().unwrap())
        );
        assert_eq!(
            "bridge.example:443".parse::<TargetAddr>().unwrap(),
            TargetAddr::Domain("bridge.example".into(), 443)
        );
        assert!("bridge.example".parse::<TargetAddr>().is_err());
        assert!("::1:80".parse::<TargetAddr>().is_err());
    }
}
