use anyhow::Result;
use serde::Deserialize;
use socket2::TcpKeepalive;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time;
use tracing::debug;

use crate::shutdown::Shutdown;
use crate::stats::CounterHandle;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Independent send and receive loops sharing one socket.
    FullDuplex,
    /// Strict request/response: one send, one full reply, repeat.
    HalfDuplex,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn label(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

pub fn configure_stream(stream: &TcpStream) -> Result<()> {
    let sock_ref = socket2::SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(30)) // probe after 30 seconds of idle
        .with_interval(Duration::from_secs(10)); // probe every 10 seconds

    sock_ref.set_tcp_keepalive(&keepalive)?;

    // enable TCP_NODELAY so small echo messages go out immediately
    stream.set_nodelay(true)?;

    Ok(())
}

/// One client-side connection over TCP. Owns its stream for its whole
/// lifetime; the stream is closed exactly once, when the actor's future
/// completes, whichever direction finished first.
pub struct TcpActor {
    stream: TcpStream,
    mode: Mode,
    message: Arc<[u8]>,
    recv_buffer: usize,
    counter: CounterHandle,
    shutdown: Shutdown,
}

impl TcpActor {
    pub fn new(
        stream: TcpStream,
        mode: Mode,
        message: Arc<[u8]>,
        recv_buffer: usize,
        counter: CounterHandle,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            stream,
            mode,
            message,
            recv_buffer,
            counter,
            shutdown,
        }
    }

    /// Runs until an I/O failure, an orderly peer close, or shutdown.
    /// Errors end this actor only; the spawning side logs them and moves on.
    pub async fn run(self) -> Result<()> {
        match self.mode {
            Mode::FullDuplex => self.run_full_duplex().await,
            Mode::HalfDuplex => self.run_half_duplex().await,
        }
    }

    async fn run_full_duplex(self) -> Result<()> {
        let (read_half, write_half) = self.stream.into_split();

        // whichever direction finishes first ends the actor; the other
        // half is dropped with it and the socket closes
        tokio::select! {
            res = send_loop(write_half, self.message, self.shutdown.clone()) => res,
            res = recv_loop(read_half, self.recv_buffer, self.counter, self.shutdown) => res,
        }
    }

    async fn run_half_duplex(mut self) -> Result<()> {
        let mut reply = vec![0u8; self.message.len()];

        while !self.shutdown.is_triggered() {
            self.stream.write_all(&self.message).await?;

            match self.stream.read_exact(&mut reply).await {
                Ok(_) => self.counter.record(reply.len()),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("{} peer closed", self.counter.name());
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

async fn send_loop(mut half: OwnedWriteHalf, message: Arc<[u8]>, shutdown: Shutdown) -> Result<()> {
    while !shutdown.is_triggered() {
        half.write_all(&message).await?;
    }
    Ok(())
}

async fn recv_loop(
    mut half: OwnedReadHalf,
    recv_buffer: usize,
    counter: CounterHandle,
    shutdown: Shutdown,
) -> Result<()> {
    let mut buffer = vec![0u8; recv_buffer];

    while !shutdown.is_triggered() {
        let n = half.read(&mut buffer).await?;
        if n == 0 {
            debug!("{} peer closed", counter.name());
            return Ok(());
        }
        counter.record(n);
    }
    Ok(())
}

/// One client-side connection over UDP, on a connected socket. A receive
/// that times out means "no reply yet" and the loop carries on; only a
/// socket error ends the actor.
pub struct UdpActor {
    socket: UdpSocket,
    mode: Mode,
    message: Arc<[u8]>,
    recv_buffer: usize,
    recv_timeout: Duration,
    counter: CounterHandle,
    shutdown: Shutdown,
}

impl UdpActor {
    pub fn new(
        socket: UdpSocket,
        mode: Mode,
        message: Arc<[u8]>,
        recv_buffer: usize,
        recv_timeout: Duration,
        counter: CounterHandle,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            socket,
            mode,
            message,
            recv_buffer,
            recv_timeout,
            counter,
            shutdown,
        }
    }

    pub async fn run(self) -> Result<()> {
        match self.mode {
            Mode::FullDuplex => self.run_full_duplex().await,
            Mode::HalfDuplex => self.run_half_duplex().await,
        }
    }

    async fn run_full_duplex(self) -> Result<()> {
        let socket = Arc::new(self.socket);

        tokio::select! {
            res = udp_send_loop(socket.clone(), self.message, self.shutdown.clone()) => res,
            res = udp_recv_loop(
                socket,
                self.recv_buffer,
                self.recv_timeout,
                self.counter,
                self.shutdown,
            ) => res,
        }
    }

    async fn run_half_duplex(self) -> Result<()> {
        let mut buffer = vec![0u8; self.recv_buffer];

        while !self.shutdown.is_triggered() {
            self.socket.send(&self.message).await?;

            match time::timeout(self.recv_timeout, self.socket.recv(&mut buffer)).await {
                Ok(Ok(n)) => self.counter.record(n),
                Ok(Err(e)) => return Err(e.into()),
                // no reply within the window; send again
                Err(_) => continue,
            }
        }
        Ok(())
    }
}

async fn udp_send_loop(socket: Arc<UdpSocket>, message: Arc<[u8]>, shutdown: Shutdown) -> Result<()> {
    while !shutdown.is_triggered() {
        socket.send(&message).await?;
    }
    Ok(())
}

async fn udp_recv_loop(
    socket: Arc<UdpSocket>,
    recv_buffer: usize,
    recv_timeout: Duration,
    counter: CounterHandle,
    shutdown: Shutdown,
) -> Result<()> {
    let mut buffer = vec![0u8; recv_buffer];

    while !shutdown.is_triggered() {
        match time::timeout(recv_timeout, socket.recv(&mut buffer)).await {
            Ok(Ok(n)) => counter.record(n),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => continue,
        }
    }
    Ok(())
}

/// Server-side echo session for one accepted TCP connection: read a chunk,
/// write the same bytes back, until the peer closes or an I/O call fails.
pub async fn echo_session(
    mut stream: TcpStream,
    peer: SocketAddr,
    recv_buffer: usize,
    shutdown: Shutdown,
) -> Result<()> {
    let mut buffer = vec![0u8; recv_buffer];

    while !shutdown.is_triggered() {
        let n = stream.read(&mut buffer).await?;
        if n == 0 {
            debug!("{} disconnected", peer);
            return Ok(());
        }
        stream.write_all(&buffer[..n]).await?;
    }
    Ok(())
}

/// Connectionless echo on a shared UDP socket: every datagram is answered
/// at its own origin address. There is no per-sender session to isolate, so
/// a receive error is fatal for the whole loop.
pub async fn echo_datagrams(
    socket: UdpSocket,
    recv_buffer: usize,
    shutdown: Shutdown,
) -> Result<()> {
    let mut buffer = vec![0u8; recv_buffer];

    while !shutdown.is_triggered() {
        let (n, from) = socket.recv_from(&mut buffer).await?;
        socket.send_to(&buffer[..n], from).await?;
    }
    Ok(())
}
