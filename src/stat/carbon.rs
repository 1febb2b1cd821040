use std::net::SocketAddr;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tracing::{info, warn};

pub const DEFAULT_CARBON_PORT: u16 = 2003;

#[derive(Debug, Error)]
pub enum CarbonError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid carbon address {0:?}")]
    Address(String),

    #[error("can't connect to carbon at {0}")]
    Connect(String),
}

enum Conn {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// Plaintext line-protocol connection to carbon, TCP by default. The emitter
/// thread is the only owner; a failed send reconnects and retries once, and
/// a second failure surfaces to the caller (metrics are allowed to be lossy).
pub struct CarbonSink {
    host: String,
    port: u16,
    udp: bool,
    conn: Option<Conn>,
}

impl CarbonSink {
    /// `addr` is `HOST[:PORT]`; the port defaults to carbon's 2003.
    pub fn new(addr: &str, udp: bool) -> Result<Self, CarbonError> {
        let (host, port) = match addr.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse()
                    .map_err(|_| CarbonError::Address(addr.to_string()))?,
            ),
            None => (addr.to_string(), DEFAULT_CARBON_PORT),
        };
        if host.is_empty() {
            return Err(CarbonError::Address(addr.to_string()));
        }
        Ok(Self {
            host,
            port,
            udp,
            conn: None,
        })
    }

    /// Resolve and connect, trying each resolved address in order.
    async fn connect(&mut self) -> Result<(), CarbonError> {
        self.conn = None;
        let addrs: Vec<SocketAddr> = lookup_host((self.host.as_str(), self.port)).await?.collect();
        for addr in &addrs {
            match self.try_connect(*addr).await {
                Ok(conn) => {
                    info!(%addr, udp = self.udp, "connected to carbon");
                    self.conn = Some(conn);
                    return Ok(());
                }
                Err(error) => {
                    warn!(%addr, %error, "carbon candidate failed");
                }
            }
        }
        Err(CarbonError::Connect(format!("{}:{}", self.host, self.port)))
    }

    async fn try_connect(&self, addr: SocketAddr) -> Result<Conn, std::io::Error> {
        if self.udp {
            let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            let socket = UdpSocket::bind(bind_addr).await?;
            socket.connect(addr).await?;
            Ok(Conn::Udp(socket))
        } else {
            Ok(Conn::Tcp(TcpStream::connect(addr).await?))
        }
    }

    /// Write a batch of metric lines, reconnecting and retrying once on
    /// failure.
    pub async fn send(&mut self, payload: &str) -> Result<(), CarbonError> {
        if self.conn.is_none() {
            self.connect().await?;
        }
        match self.write_payload(payload).await {
            Ok(()) => Ok(()),
            Err(error) => {
                warn!(%error, "carbon send failed, reconnecting");
                self.connect().await?;
                self.write_payload(payload).await?;
                Ok(())
            }
        }
    }

    async fn write_payload(&mut self, payload: &str) -> Result<(), std::io::Error> {
        match self.conn.as_mut() {
            Some(Conn::Tcp(stream)) => {
                stream.write_all(payload.as_bytes()).await?;
                stream.flush().await
            }
            Some(Conn::Udp(socket)) => {
                // one datagram per line keeps each under the MTU
                for line in payload.split_inclusive('\n') {
                    socket.send(line.as_bytes()).await?;
                }
                Ok(())
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "not connected",
            )),
        }
    }
}
