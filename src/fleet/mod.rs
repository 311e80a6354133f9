use anyhow::{Context, Result};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{error, info};

use crate::actor::{self, Mode, TcpActor, Transport, UdpActor};
use crate::config::Config;
use crate::shutdown::Shutdown;
use crate::stats::CounterStore;

/// How long a UDP connection waits for a reply before treating the window
/// as empty and carrying on.
const UDP_RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Creates the client fleet under a ramp-up stagger, then waits for every
/// connection to reach a terminal state. The fleet size is fixed: a
/// connect failure during ramp-up fails the whole run instead of silently
/// shrinking the fleet.
pub struct FleetManager {
    target: String,
    size: usize,
    stagger: Duration,
    transport: Transport,
    mode: Mode,
    message: Arc<[u8]>,
    recv_buffer: usize,
}

impl FleetManager {
    pub fn new(
        target: String,
        size: usize,
        stagger: Duration,
        transport: Transport,
        mode: Mode,
        message: Arc<[u8]>,
        recv_buffer: usize,
    ) -> Self {
        Self {
            target,
            size,
            stagger,
            transport,
            mode,
            message,
            recv_buffer,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.target_addr(),
            config.fleet.size,
            Duration::from_millis(config.fleet.stagger_ms),
            config.fleet.transport,
            config.fleet.mode,
            Arc::from(config.payload.message.as_bytes()),
            config.payload.recv_buffer,
        )
    }

    /// Connection names in fleet index order, for the counter store.
    pub fn connection_names(&self) -> Vec<String> {
        (0..self.size)
            .map(|i| format!("{}-{}", self.transport.label(), i))
            .collect()
    }

    /// Ramps up the fleet, one connection per stagger interval, then joins
    /// every connection task. Returns only once all of them are terminal,
    /// on the error path too: a mid-ramp connect failure stops and joins
    /// the connections already started before the error is returned.
    pub async fn run(&self, store: &CounterStore, shutdown: Shutdown) -> Result<()> {
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.size);

        for index in 0..self.size {
            if index > 0 {
                time::sleep(self.stagger).await;
            }
            match self.start_connection(index, store, &shutdown).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // the fleet runs at its declared size or not at all; no
                    // connection is left running behind the failed run
                    error!("ramp-up aborted at connection {}: {:#}", index, e);
                    shutdown.trigger();
                    join_connections(handles).await;
                    return Err(e);
                }
            }
        }
        info!("fleet of {} ramped up against {}", self.size, self.target);

        join_connections(handles).await;
        Ok(())
    }

    async fn start_connection(
        &self,
        index: usize,
        store: &CounterStore,
        shutdown: &Shutdown,
    ) -> Result<JoinHandle<()>> {
        let counter = store.handle(index);
        let name = counter.name().to_string();

        match self.transport {
            Transport::Tcp => {
                let stream = TcpStream::connect(self.target.as_str())
                    .await
                    .with_context(|| format!("{} failed to connect to {}", name, self.target))?;
                actor::configure_stream(&stream)
                    .with_context(|| format!("{} socket configuration", name))?;
                info!("{} connected via {:?}", name, stream.local_addr());

                let task = TcpActor::new(
                    stream,
                    self.mode,
                    self.message.clone(),
                    self.recv_buffer,
                    counter,
                    shutdown.clone(),
                )
                .run();
                Ok(tokio::spawn(log_outcome(name, task)))
            }
            Transport::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0")
                    .await
                    .with_context(|| format!("{} failed to bind a local socket", name))?;
                socket
                    .connect(self.target.as_str())
                    .await
                    .with_context(|| format!("{} failed to connect to {}", name, self.target))?;
                info!("{} connected via {:?}", name, socket.local_addr());

                let task = UdpActor::new(
                    socket,
                    self.mode,
                    self.message.clone(),
                    self.recv_buffer,
                    UDP_RECV_TIMEOUT,
                    counter,
                    shutdown.clone(),
                )
                .run();
                Ok(tokio::spawn(log_outcome(name, task)))
            }
        }
    }
}

async fn join_connections(handles: Vec<JoinHandle<()>>) {
    for joined in join_all(handles).await {
        if let Err(e) = joined {
            error!("connection task panicked: {}", e);
        }
    }
}

/// Spawn wrapper: a connection's failure is terminal for that connection
/// only, so it is logged here and never propagated to the fleet.
async fn log_outcome(name: String, task: impl Future<Output = Result<()>>) {
    match task.await {
        Ok(()) => info!("{} finished", name),
        Err(e) => error!("{} failed: {:#}", name, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;
    use tokio::net::TcpListener;

    fn test_fleet(target: String, size: usize, stagger: Duration, mode: Mode) -> FleetManager {
        FleetManager::new(
            target,
            size,
            stagger,
            Transport::Tcp,
            mode,
            Arc::from(b"message\n".as_slice()),
            65536,
        )
    }

    #[tokio::test]
    async fn ramp_up_staggers_connection_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();

        let accept_times: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let held: Arc<Mutex<Vec<TcpStream>>> = Arc::new(Mutex::new(Vec::new()));
        let times = accept_times.clone();
        let streams = held.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                times.lock().unwrap().push(Instant::now());
                streams.lock().unwrap().push(stream);
            }
        });

        let stagger = Duration::from_millis(100);
        let fleet = test_fleet(target, 3, stagger, Mode::HalfDuplex);
        let store = CounterStore::new(fleet.connection_names());
        let shutdown = Shutdown::new();
        let run = tokio::spawn(async move { fleet.run(&store, shutdown).await });

        // let all three attempts land, then release the held sockets so the
        // connections see an orderly close and the join barrier can clear
        time::sleep(Duration::from_millis(500)).await;
        let times = accept_times.lock().unwrap().clone();
        assert_eq!(times.len(), 3, "fleet must start at its declared size");
        // measured at accept, so allow a little scheduling slack below the
        // hard lower bound the ramp driver sleeps for, and a generous one
        // above it so a stalled ramp still fails
        let epsilon = Duration::from_millis(50);
        let slack = Duration::from_millis(200);
        for i in 1..times.len() {
            let since_first = times[i].duration_since(times[0]);
            assert!(
                since_first + epsilon >= stagger * i as u32,
                "connection {} arrived {:?} after the first, before its slot",
                i,
                since_first
            );
            assert!(
                since_first <= stagger * i as u32 + slack,
                "connection {} arrived {:?} after the first, well past its slot",
                i,
                since_first
            );
        }

        held.lock().unwrap().clear();
        time::timeout(Duration::from_secs(5), run)
            .await
            .expect("fleet did not join after all peers closed")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn connect_failure_aborts_the_run() {
        // grab a port that nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        drop(listener);

        let fleet = test_fleet(target, 2, Duration::from_millis(1), Mode::FullDuplex);
        let store = CounterStore::new(fleet.connection_names());

        let outcome = fleet.run(&store, Shutdown::new()).await;
        assert!(outcome.is_err(), "a refused connection must fail the run");
    }

    #[tokio::test]
    async fn run_returns_only_after_every_connection_finished() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();

        let held: Arc<Mutex<Vec<TcpStream>>> = Arc::new(Mutex::new(Vec::new()));
        let streams = held.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                streams.lock().unwrap().push(stream);
            }
        });

        let fleet = test_fleet(target, 3, Duration::from_millis(1), Mode::HalfDuplex);
        let store = CounterStore::new(fleet.connection_names());
        let run = tokio::spawn(async move { fleet.run(&store, Shutdown::new()).await });

        // peers still open: the join barrier must hold
        time::sleep(Duration::from_millis(200)).await;
        assert!(!run.is_finished(), "run returned while connections lived");

        held.lock().unwrap().clear();
        time::timeout(Duration::from_secs(5), run)
            .await
            .expect("fleet did not join after all peers closed")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn mid_ramp_connect_failure_stops_started_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();

        // echo the first connection, then close the listener so the second
        // connect attempt is refused mid-ramp
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            drop(listener);
            let _ = actor::echo_session(stream, peer, 65536, Shutdown::new()).await;
        });

        let fleet = test_fleet(target, 2, Duration::from_millis(100), Mode::HalfDuplex);
        let store = CounterStore::new(fleet.connection_names());
        let shutdown = Shutdown::new();

        let outcome = fleet.run(&store, shutdown.clone()).await;
        assert!(outcome.is_err(), "a refused connection must fail the run");
        assert!(
            shutdown.is_triggered(),
            "an aborted ramp must stop the connections already started"
        );

        // the first connection was joined before the error came back, so
        // its counter has gone quiet
        store.drain();
        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            store.drain()[0].1,
            0,
            "a connection kept moving traffic after the aborted run returned"
        );
    }

    #[tokio::test]
    async fn one_dying_connection_does_not_stop_its_siblings() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();

        // echo every connection, but keep a handle on the first session so
        // the test can kill it from the server side mid-run
        let first_session: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));
        let slot = first_session.clone();
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let handle = tokio::spawn(async move {
                let _ = actor::echo_session(stream, peer, 65536, Shutdown::new()).await;
            });
            slot.lock().unwrap().replace(handle);

            loop {
                let (stream, peer) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let _ = actor::echo_session(stream, peer, 65536, Shutdown::new()).await;
                });
            }
        });

        let fleet = test_fleet(target, 2, Duration::from_millis(1), Mode::HalfDuplex);
        let store = CounterStore::new(fleet.connection_names());
        let shutdown = Shutdown::new();
        let counters = store.clone();
        let fleet_shutdown = shutdown.clone();
        let run = tokio::spawn(async move { fleet.run(&counters, fleet_shutdown).await });

        time::sleep(Duration::from_millis(100)).await;
        first_session
            .lock()
            .unwrap()
            .take()
            .expect("first session never started")
            .abort();

        // let the dead connection notice the close, then measure a fresh
        // interval: only the survivor should still be counting
        time::sleep(Duration::from_millis(50)).await;
        store.drain();
        time::sleep(Duration::from_millis(150)).await;
        let drained = store.drain();
        assert_eq!(drained[0].1, 0, "the dead connection must stop counting");
        assert!(drained[1].1 > 0, "the surviving connection stopped moving traffic");
        assert!(
            !run.is_finished(),
            "the fleet returned while a connection was still running"
        );

        shutdown.trigger();
        time::timeout(Duration::from_secs(5), run)
            .await
            .expect("fleet did not join after shutdown")
            .unwrap()
            .unwrap();
    }
}
