//! SOCKS request parsing
//!
//! Just enough of SOCKS4/4a and SOCKS5 to learn where a client wants to go:
//! CONNECT only, no authentication. Replies are written back on the same
//! stream; the relay itself happens elsewhere.

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

mod socks5 {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_SUCCESS: u8 = 0x00;
    pub const REP_GENERAL_FAILURE: u8 = 0x01;
    pub const REP_HOST_UNREACHABLE: u8 = 0x04;
    pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
    pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;
}

mod socks4 {
    pub const VERSION: u8 = 0x04;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const REPLY_VERSION: u8 = 0x00;
    pub const GRANTED: u8 = 0x5A;
    pub const REJECTED: u8 = 0x5B;
    /// Longest userid / hostname accepted in a NUL-terminated field
    pub const MAX_FIELD: usize = 255;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    V4,
    V5,
}

/// A parsed CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    pub version: SocksVersion,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    #[error("Client offered no acceptable authentication method")]
    NoAcceptableAuth,

    #[error("Unsupported SOCKS command: {0}")]
    UnsupportedCommand(u8),

    #[error("Unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    #[error("Malformed request: {0}")]
    Malformed(String),
}

/// Read a CONNECT request, negotiating the SOCKS5 method first when needed
///
/// Unsupported commands and address types are answered with the protocol's
/// failure reply before the error is returned.
pub async fn read_request<S>(stream: &mut S) -> Result<SocksRequest, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match stream.read_u8().await? {
        socks5::VERSION => read_v5(stream).await,
        socks4::VERSION => read_v4(stream).await,
        other => Err(SocksError::UnsupportedVersion(other)),
    }
}

async fn read_v5<S>(stream: &mut S) -> Result<SocksRequest, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nmethods = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&socks5::AUTH_NONE) {
        stream
            .write_all(&[socks5::VERSION, socks5::AUTH_NO_ACCEPTABLE])
            .await?;
        return Err(SocksError::NoAcceptableAuth);
    }
    stream.write_all(&[socks5::VERSION, socks5::AUTH_NONE]).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, cmd, _reserved, atyp] = header;

    if version != socks5::VERSION {
        return Err(SocksError::UnsupportedVersion(version));
    }
    if cmd != socks5::CMD_CONNECT {
        write_v5_reply(stream, socks5::REP_CMD_NOT_SUPPORTED).await?;
        return Err(SocksError::UnsupportedCommand(cmd));
    }

    let host = match atyp {
        socks5::ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        socks5::ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain)
                .map_err(|_| SocksError::Malformed("domain is not valid UTF-8".into()))?
        }
        socks5::ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        other => {
            write_v5_reply(stream, socks5::REP_ADDR_NOT_SUPPORTED).await?;
            return Err(SocksError::UnsupportedAddressType(other));
        }
    };
    let port = stream.read_u16().await?;

    Ok(SocksRequest {
        version: SocksVersion::V5,
        host,
        port,
    })
}

async fn read_v4<S>(stream: &mut S) -> Result<SocksRequest, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let cmd = stream.read_u8().await?;
    let port = stream.read_u16().await?;
    let mut octets = [0u8; 4];
    stream.read_exact(&mut octets).await?;
    // userid is read and ignored
    read_nul_terminated(stream).await?;

    if cmd != socks4::CMD_CONNECT {
        write_v4_reply(stream, socks4::REJECTED).await?;
        return Err(SocksError::UnsupportedCommand(cmd));
    }

    // 4a: 0.0.0.x with x != 0 means a hostname follows the userid
    let host = if octets[..3] == [0, 0, 0] && octets[3] != 0 {
        let domain = read_nul_terminated(stream).await?;
        String::from_utf8(domain)
            .map_err(|_| SocksError::Malformed("domain is not valid UTF-8".into()))?
    } else {
        Ipv4Addr::from(octets).to_string()
    };

    Ok(SocksRequest {
        version: SocksVersion::V4,
        host,
        port,
    })
}

async fn read_nul_terminated<S>(stream: &mut S) -> Result<Vec<u8>, SocksError>
where
    S: AsyncRead + Unpin,
{
    let mut field = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == 0 {
            return Ok(field);
        }
        if field.len() == socks4::MAX_FIELD {
            return Err(SocksError::Malformed("unterminated SOCKS4 field".into()));
        }
        field.push(byte);
    }
}

/// Tell the client its CONNECT went through
pub async fn send_success<S>(stream: &mut S, version: SocksVersion) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    match version {
        SocksVersion::V5 => write_v5_reply(stream, socks5::REP_SUCCESS).await,
        SocksVersion::V4 => write_v4_reply(stream, socks4::GRANTED).await,
    }
}

/// Tell the client the onward channel could not be opened
pub async fn send_unreachable<S>(stream: &mut S, version: SocksVersion) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    match version {
        SocksVersion::V5 => write_v5_reply(stream, socks5::REP_HOST_UNREACHABLE).await,
        SocksVersion::V4 => write_v4_reply(stream, socks4::REJECTED).await,
    }
}

/// General failure, for errors that are not about the destination
pub async fn send_failure<S>(stream: &mut S, version: SocksVersion) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    match version {
        SocksVersion::V5 => write_v5_reply(stream, socks5::REP_GENERAL_FAILURE).await,
        SocksVersion::V4 => write_v4_reply(stream, socks4::REJECTED).await,
    }
}

async fn write_v5_reply<S>(stream: &mut S, status: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    // VER | REP | RSV | ATYP | BND.ADDR | BND.PORT, bound address left as 0.0.0.0:0
    let mut reply = BytesMut::with_capacity(10);
    reply.put_u8(socks5::VERSION);
    reply.put_u8(status);
    reply.put_u8(0x00);
    reply.put_u8(socks5::ATYP_IPV4);
    reply.put_slice(&Ipv4Addr::UNSPECIFIED.octets());
    reply.put_u16(0);
    stream.write_all(&reply).await
}

async fn write_v4_reply<S>(stream: &mut S, status: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut reply = BytesMut::with_capacity(8);
    reply.put_u8(socks4::REPLY_VERSION);
    reply.put_u8(status);
    reply.put_u16(0);
    reply.put_slice(&Ipv4Addr::UNSPECIFIED.octets());
    stream.write_all(&reply).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn v5_domain_connect() {
        let (mut client, mut server) = duplex(1024);
        let parse = tokio::spawn(async move { read_request(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let parsed = parse.await.unwrap().unwrap();
        assert_eq!(
            parsed,
            SocksRequest {
                version: SocksVersion::V5,
                host: "example.com".into(),
                port: 443,
            }
        );
    }

    #[tokio::test]
    async fn v5_ipv6_connect() {
        let (mut client, mut server) = duplex(1024);
        let parse = tokio::spawn(async move { read_request(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        let mut request = vec![0x05, 0x01, 0x00, 0x04];
        request.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        request.extend_from_slice(&22u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let parsed = parse.await.unwrap().unwrap();
        assert_eq!(parsed.host, "::1");
        assert_eq!(parsed.port, 22);
    }

    #[tokio::test]
    async fn v5_bind_is_refused_with_reply() {
        let (mut client, mut server) = duplex(1024);
        let parse = tokio::spawn(async move { read_request(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 10, 0, 0, 1, 0, 80])
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x07);
        assert!(matches!(
            parse.await.unwrap(),
            Err(SocksError::UnsupportedCommand(0x02))
        ));
    }

    #[tokio::test]
    async fn v5_requires_no_auth_method() {
        let (mut client, mut server) = duplex(1024);
        let parse = tokio::spawn(async move { read_request(&mut server).await });

        // username/password only
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0xFF]);
        assert!(matches!(
            parse.await.unwrap(),
            Err(SocksError::NoAcceptableAuth)
        ));
    }

    #[tokio::test]
    async fn v4a_hostname_after_userid() {
        let (mut client, mut server) = duplex(1024);
        let parse = tokio::spawn(async move { read_request(&mut server).await });

        let mut request = vec![0x04, 0x01];
        request.extend_from_slice(&8080u16.to_be_bytes());
        request.extend_from_slice(&[0, 0, 0, 1]);
        request.extend_from_slice(b"alice\0internal.example\0");
        client.write_all(&request).await.unwrap();

        let parsed = parse.await.unwrap().unwrap();
        assert_eq!(parsed.version, SocksVersion::V4);
        assert_eq!(parsed.host, "internal.example");
        assert_eq!(parsed.port, 8080);
    }

    #[tokio::test]
    async fn v4_replies_are_eight_bytes() {
        let (mut client, mut server) = duplex(64);
        send_success(&mut server, SocksVersion::V4).await.unwrap();
        send_unreachable(&mut server, SocksVersion::V4).await.unwrap();

        let mut replies = [0u8; 16];
        client.read_exact(&mut replies).await.unwrap();
        assert_eq!(&replies[..2], &[0x00, 0x5A]);
        assert_eq!(&replies[8..10], &[0x00, 0x5B]);
    }
}
