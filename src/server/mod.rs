use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, info};

use crate::actor;
use crate::shutdown::Shutdown;

/// The echo service: a TCP accept loop and a connectionless UDP responder
/// on the same port. Accepted connections are served by detached tasks the
/// accept loop never waits for; it applies no admission control.
pub struct EchoService {
    listener: TcpListener,
    udp: UdpSocket,
    recv_buffer: usize,
}

impl EchoService {
    pub async fn bind(host: &str, port: u16, recv_buffer: usize) -> Result<Self> {
        let listener = TcpListener::bind(format!("{}:{}", host, port))
            .await
            .with_context(|| format!("failed to bind tcp {}:{}", host, port))?;
        // with port 0 the udp socket follows whatever port tcp was given
        let udp_port = listener.local_addr()?.port();
        let udp = UdpSocket::bind(format!("{}:{}", host, udp_port))
            .await
            .with_context(|| format!("failed to bind udp {}:{}", host, udp_port))?;

        Ok(Self {
            listener,
            udp,
            recv_buffer,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until either transport's loop hits a fatal error. A dead
    /// accept loop stops admission only; sessions already running keep
    /// their own sockets and finish on their own terms.
    pub async fn run(self, shutdown: Shutdown) -> Result<()> {
        info!("listening on {} (tcp and udp)", self.local_addr()?);

        tokio::select! {
            res = accept_loop(self.listener, self.recv_buffer, shutdown.clone()) => {
                res.context("tcp accept loop")
            }
            res = actor::echo_datagrams(self.udp, self.recv_buffer, shutdown) => {
                res.context("udp responder")
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, recv_buffer: usize, shutdown: Shutdown) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("accept failed")?;
        debug!("{} connected", peer);

        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, peer, recv_buffer, shutdown).await {
                error!("{} session failed: {:#}", peer, e);
            }
        });
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    recv_buffer: usize,
    shutdown: Shutdown,
) -> Result<()> {
    actor::configure_stream(&stream)?;
    actor::echo_session(stream, peer, recv_buffer, shutdown).await
}
