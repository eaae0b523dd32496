//! Dialers used by the local HTTP proxy.
//!
//! The proxy only needs one capability: open a TCP stream to `host:port`.
//! [`Socks5Dialer`] does that through the ssh dynamic forward.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub type DialFuture<'a> = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send + 'a>>;

/// Opens outbound streams. Shared across connection tasks.
pub trait Dialer: Send + Sync + 'static {
    /// `network` is `"tcp"`; `addr` is `host:port` (IPv6 hosts in brackets).
    fn dial<'a>(&'a self, network: &'a str, addr: &'a str) -> DialFuture<'a>;
}

/// Connects straight to the destination.
#[derive(Debug, Clone, Default)]
pub struct DirectDialer;

impl Dialer for DirectDialer {
    fn dial<'a>(&'a self, network: &'a str, addr: &'a str) -> DialFuture<'a> {
        Box::pin(async move {
            ensure_tcp(network)?;
            TcpStream::connect(addr).await
        })
    }
}

/// Connects through a SOCKS5 proxy (no authentication), resolving names on
/// the proxy side.
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    proxy: SocketAddr,
    timeout: Duration,
}

impl Socks5Dialer {
    pub fn new(proxy: SocketAddr) -> Self {
        Self {
            proxy,
            timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy
    }

    async fn connect(&self, addr: &str) -> io::Result<TcpStream> {
        let (host, port) = split_host_port(addr)?;
        let mut stream = TcpStream::connect(self.proxy).await?;
        stream.set_nodelay(true)?;

        stream
            .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
            .await?;
        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        if choice[0] != SOCKS_VERSION {
            return Err(invalid_data(format!(
                "unexpected SOCKS version {:#04x}",
                choice[0]
            )));
        }
        if choice[1] != METHOD_NO_AUTH {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "SOCKS server requires authentication",
            ));
        }

        stream.write_all(&connect_request(host, port)?).await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            return Err(invalid_data(format!(
                "unexpected SOCKS version {:#04x} in reply",
                head[0]
            )));
        }
        if head[1] != 0x00 {
            return Err(reply_error(head[1], addr));
        }
        // skip BND.ADDR + BND.PORT
        let skip = match head[3] {
            ATYP_IPV4 => 4 + 2,
            ATYP_IPV6 => 16 + 2,
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize + 2
            }
            other => {
                return Err(invalid_data(format!(
                    "unknown SOCKS address type {other:#04x}"
                )))
            }
        };
        let mut bound = vec![0u8; skip];
        stream.read_exact(&mut bound).await?;

        Ok(stream)
    }
}

impl Dialer for Socks5Dialer {
    fn dial<'a>(&'a self, network: &'a str, addr: &'a str) -> DialFuture<'a> {
        Box::pin(async move {
            ensure_tcp(network)?;
            match tokio::time::timeout(self.timeout, self.connect(addr)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("SOCKS dial to {addr} timed out after {:?}", self.timeout),
                )),
            }
        })
    }
}

fn ensure_tcp(network: &str) -> io::Result<()> {
    if network.starts_with("tcp") {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unsupported network {network}"),
        ))
    }
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

fn reply_error(code: u8, addr: &str) -> io::Error {
    let (kind, text) = match code {
        0x01 => (io::ErrorKind::Other, "general SOCKS server failure"),
        0x02 => (io::ErrorKind::PermissionDenied, "connection not allowed by ruleset"),
        0x03 => (io::ErrorKind::Other, "network unreachable"),
        0x04 => (io::ErrorKind::Other, "host unreachable"),
        0x05 => (io::ErrorKind::ConnectionRefused, "connection refused"),
        0x06 => (io::ErrorKind::TimedOut, "TTL expired"),
        0x07 => (io::ErrorKind::Unsupported, "command not supported"),
        0x08 => (io::ErrorKind::Unsupported, "address type not supported"),
        _ => (io::ErrorKind::Other, "unknown SOCKS error"),
    };
    io::Error::new(kind, format!("{text} (dialing {addr})"))
}

/// Split `host:port`, accepting `[v6]:port`.
pub fn split_host_port(addr: &str) -> io::Result<(&str, u16)> {
    let bad = || {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid address {addr:?}"),
        )
    };
    let (host, port) = addr.rsplit_once(':').ok_or_else(bad)?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(bad());
    }
    let port = port.parse::<u16>().map_err(|_| bad())?;
    Ok((host, port))
}

fn connect_request(host: &str, port: u16) -> io::Result<Vec<u8>> {
    let mut req = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            req.push(ATYP_IPV4);
            req.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            req.push(ATYP_IPV6);
            req.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let name = host.as_bytes();
            if name.len() > u8::MAX as usize {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "host name longer than 255 bytes",
                ));
            }
            req.push(ATYP_DOMAIN);
            req.push(name.len() as u8);
            req.extend_from_slice(name);
        }
    }
    req.extend_from_slice(&port.to_be_bytes());
    Ok(req)
}
