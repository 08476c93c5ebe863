//! PROXY protocol (v1/v2) support.
//!
//! Parses the HAProxy PROXY protocol header that some load balancers and
//! ingress proxies prepend to a TCP connection, exposing the real client
//! address to the broker instead of the proxy's own address.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use ppp::v1;
use ppp::v2;
use ppp::HeaderResult;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

/// Information extracted from a PROXY protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyInfo {
    /// The real client address as reported by the proxy.
    pub source: SocketAddr,
    /// The proxy's own address on the client-facing side.
    pub destination: SocketAddr,
}

/// Errors that can occur while reading a PROXY protocol header.
#[derive(Debug)]
pub enum ProxyError {
    Io(std::io::Error),
    Timeout,
    Malformed,
    /// The header was well-formed but carried no address (e.g. a LOCAL
    /// command health check from the proxy itself).
    Local,
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Io(e) => write!(f, "IO error reading PROXY header: {}", e),
            ProxyError::Timeout => write!(f, "timed out waiting for PROXY header"),
            ProxyError::Malformed => write!(f, "malformed PROXY protocol header"),
            ProxyError::Local => write!(f, "PROXY header carries no client address (LOCAL)"),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        ProxyError::Io(e)
    }
}

const MAX_HEADER_LEN: usize = 536;

/// Read and parse a PROXY protocol header (v1 or v2, auto-detected) from
/// the front of `stream`.
///
/// Reads one byte at a time until a complete header is parsed or
/// `MAX_HEADER_LEN` is exceeded, so no bytes belonging to the first MQTT
/// packet are consumed.
pub async fn read_proxy_header<S>(stream: &mut S, read_timeout: Duration) -> Result<ProxyInfo, ProxyError>
where
    S: AsyncRead + Unpin,
{
    timeout(read_timeout, read_proxy_header_inner(stream))
        .await
        .map_err(|_| ProxyError::Timeout)?
}

async fn read_proxy_header_inner<S>(stream: &mut S) -> Result<ProxyInfo, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(64);
    let mut byte = [0u8; 1];

    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(ProxyError::Malformed);
        }
        buf.push(byte[0]);

        match HeaderResult::parse(&buf) {
            HeaderResult::V1(Ok((_, header))) => return info_from_v1(&header),
            HeaderResult::V2(Ok((_, header))) => return info_from_v2(&header),
            HeaderResult::V1(Err(nom::Err::Incomplete(_)))
            | HeaderResult::V2(Err(nom::Err::Incomplete(_))) => {
                if buf.len() >= MAX_HEADER_LEN {
                    return Err(ProxyError::Malformed);
                }
                continue;
            }
            HeaderResult::V1(Err(_)) | HeaderResult::V2(Err(_)) => {
                if buf.len() >= MAX_HEADER_LEN {
                    return Err(ProxyError::Malformed);
                }
                continue;
            }
        }
    }
}

fn info_from_v1(header: &v1::Header<'_>) -> Result<ProxyInfo, ProxyError> {
    match header.addresses {
        v1::Addresses::Tcp4 {
            source_address,
            destination_address,
            source_port,
            destination_port,
        } => Ok(ProxyInfo {
            source: SocketAddr::from((source_address, source_port)),
            destination: SocketAddr::from((destination_address, destination_port)),
        }),
        v1::Addresses::Tcp6 {
            source_address,
            destination_address,
            source_port,
            destination_port,
        } => Ok(ProxyInfo {
            source: SocketAddr::from((source_address, source_port)),
            destination: SocketAddr::from((destination_address, destination_port)),
        }),
        v1::Addresses::Unknown => Err(ProxyError::Local),
    }
}

fn info_from_v2(header: &v2::Header<'_>) -> Result<ProxyInfo, ProxyError> {
    match header.addresses {
        v2::Addresses::IPv4(addrs) => Ok(ProxyInfo {
            source: SocketAddr::from((addrs.source_address, addrs.source_port)),
            destination: SocketAddr::from((addrs.destination_address, addrs.destination_port)),
        }),
        v2::Addresses::IPv6(addrs) => Ok(ProxyInfo {
            source: SocketAddr::from((addrs.source_address, addrs.source_port)),
            destination: SocketAddr::from((addrs.destination_address, addrs.destination_port)),
        }),
        v2::Addresses::Unix(_) | v2::Addresses::Unspecified => Err(ProxyError::Local),
    }
}
