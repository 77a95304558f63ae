use std::io;

// RSV: Fields marked RESERVED (RSV) must be set to X'00'.
pub const RSV: u8 = 0x00;

// RFC 1929 sub-negotiation version
pub const USERPASS_VERSION: u8 = 0x01;

/// AddressType represents the SOCKS5 address types:
/// IPv4, Domain Name, IPv6
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AddressType {
    IPv4 = 0x01,
    DomainName = 0x03,
    IPv6 = 0x04,
}

/// AddressType implementation block
impl AddressType {
    /// from_byte converts a byte to its related network address type
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(AddressType::IPv4),
            0x03 => Some(AddressType::DomainName),
            0x04 => Some(AddressType::IPv6),
            _ => None,
        }
    }
}

/// Version represents available SOCKS proxy versions
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Version {
    SOCKS4 = 0x04,
    SOCKS5 = 0x05,
}

/// AuthMethod represents available SOCKS5
/// authentication methods
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AuthMethod {
    NoAuth = 0x00,
    // Gssapi = 0x01, not supported
    UserPass = 0x02,
    // 0x03 - 0x7f: IANA reserved
    // 0x80 - 0xFE: private methods
    NoAcceptable = 0xFF,
}

impl AuthMethod {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => AuthMethod::NoAuth,
            0x02 => AuthMethod::UserPass,
            _ => AuthMethod::NoAcceptable,
        }
    }
}

/// AuthStatus is the RFC 1929 status byte
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AuthStatus {
    Success = 0x00,
    Failure = 0x01,
}

/// Command represents SOCKS5 protocol commands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

/// Command implementation block
impl Command {
    /// from_byte converts a byte to its related SOCKS5 protocol command
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Command::Connect),
            0x02 => Some(Command::Bind),
            0x03 => Some(Command::UdpAssociate),
            _ => None,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplyCode {
    Succeeded = 0x00,
    ServerFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddrTypeUnsupported = 0x08,
    // 0x09 - 0xFF: unassigned
}

impl ReplyCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(ReplyCode::Succeeded),
            0x01 => Some(ReplyCode::ServerFailure),
            0x02 => Some(ReplyCode::ConnectionNotAllowed),
            0x03 => Some(ReplyCode::NetworkUnreachable),
            0x04 => Some(ReplyCode::HostUnreachable),
            0x05 => Some(ReplyCode::ConnectionRefused),
            0x06 => Some(ReplyCode::TtlExpired),
            0x07 => Some(ReplyCode::CommandNotSupported),
            0x08 => Some(ReplyCode::AddrTypeUnsupported),
            _ => None,
        }
    }

    /// from_io_error picks the reply that best describes a failed dial
    pub fn from_io_error(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
            io::ErrorKind::HostUnreachable => ReplyCode::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => ReplyCode::NetworkUnreachable,
            io::ErrorKind::PermissionDenied => ReplyCode::ConnectionNotAllowed,
            io::ErrorKind::TimedOut => ReplyCode::TtlExpired,
            _ => ReplyCode::ServerFailure,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ReplyCode::Succeeded => "succeeded",
            ReplyCode::ServerFailure => "general SOCKS server failure",
            ReplyCode::ConnectionNotAllowed => "connection not allowed by ruleset",
            ReplyCode::NetworkUnreachable => "network unreachable",
            ReplyCode::HostUnreachable => "host unreachable",
            ReplyCode::ConnectionRefused => "connection refused",
            ReplyCode::TtlExpired => "TTL expired",
            ReplyCode::CommandNotSupported => "command not supported",
            ReplyCode::AddrTypeUnsupported => "address type not supported",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_code_from_io_error() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(ReplyCode::from_io_error(&refused), ReplyCode::ConnectionRefused);

        let other = io::Error::other("boom");
        assert_eq!(ReplyCode::from_io_error(&other), ReplyCode::ServerFailure);
    }

    #[test]
    fn test_unknown_bytes() {
        assert_eq!(AuthMethod::from_byte(0x01), AuthMethod::NoAcceptable);
        assert_eq!(Command::from_byte(0x09), None);
        assert_eq!(ReplyCode::from_byte(0x42), None);
    }
}
