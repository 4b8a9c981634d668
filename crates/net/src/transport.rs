//! Socket layer: a TCP listener for the reliable path plus an optional shared
//! UDP socket for best-effort datagrams.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info};

/// Server endpoint accepting stream connections and owning the datagram socket.
pub struct ServerEndpoint {
    listener: TcpListener,
    udp: Option<Arc<UdpSocket>>,
    addr: SocketAddr,
}

impl ServerEndpoint {
    /// Bind the TCP listener and, when `udp_addr` is given, the UDP socket.
    pub async fn bind(tcp_addr: SocketAddr, udp_addr: Option<SocketAddr>) -> Result<Self> {
        info!("Creating server endpoint on {}", tcp_addr);

        let listener = TcpListener::bind(tcp_addr)
            .await
            .with_context(|| format!("Failed to bind TCP listener on {}", tcp_addr))?;
        let addr = listener.local_addr()?;
        info!("Server endpoint bound to {}", addr);

        let udp = match udp_addr {
            Some(udp_addr) => {
                let socket = UdpSocket::bind(udp_addr)
                    .await
                    .with_context(|| format!("Failed to bind UDP socket on {}", udp_addr))?;
                info!("UDP socket bound to {}", socket.local_addr()?);
                Some(Arc::new(socket))
            }
            None => None,
        };

        Ok(Self {
            listener,
            udp,
            addr,
        })
    }

    /// Get the local address of the TCP listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the local address of the UDP socket, if bound.
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(|socket| socket.local_addr().ok())
    }

    /// Shared handle to the UDP socket, if bound.
    pub fn udp_socket(&self) -> Option<Arc<UdpSocket>> {
        self.udp.clone()
    }

    /// Accept an incoming stream connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, remote) = self
            .listener
            .accept()
            .await
            .context("Failed to accept connection")?;
        stream.set_nodelay(true).context("Failed to set TCP_NODELAY")?;
        debug!(%remote, "Accepted stream connection");
        Ok((stream, remote))
    }
}
