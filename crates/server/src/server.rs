//! Socket runtime around [`Broker`]: an accept task, one reader and one
//! writer task per connection, a UDP receive task, a store worker and a
//! dedicated tick thread.
//!
//! The tick thread only moves bytes between channels and sockets. File store
//! work queued by the tick runs in order on the store worker, off the broker
//! lock, and its replies go straight to the requesting connection's writer.

use crate::broker::{Broker, BrokerServices, IoBatch, Outbound};
use crate::config::BrokerConfig;
use crate::store::{FileStore, StoreRequest};
use anyhow::{Context, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tether_net::{encode_server_message, ConnectionId, Defragmenter, ServerEndpoint};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, instrument, warn};

/// Upper bound on how long shutdown waits for writers to flush.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on how long shutdown waits for queued store work.
const STORE_TIMEOUT: Duration = Duration::from_secs(5);

enum WriterCommand {
    Frame(Bytes),
    Close,
}

type Writers = Arc<Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<WriterCommand>>>>;

type StoreQueue = mpsc::UnboundedSender<StoreRequest>;

/// A running broker bound to its sockets.
pub struct BrokerServer {
    broker: Arc<Mutex<Broker>>,
    writers: Writers,
    udp: Option<Arc<UdpSocket>>,
    local_addr: SocketAddr,
    udp_addr: Option<SocketAddr>,
    running: Arc<AtomicBool>,
    stores: Option<StoreQueue>,
    store_task: Option<JoinHandle<()>>,
    tick_thread: Option<thread::JoinHandle<()>>,
    accept_task: JoinHandle<()>,
    udp_task: Option<JoinHandle<()>>,
}

impl BrokerServer {
    /// Bind the configured sockets, restore the snapshot and start serving.
    #[instrument(skip_all, fields(tcp = %config.tcp_bind))]
    pub async fn start(config: BrokerConfig, services: BrokerServices) -> Result<Self> {
        let endpoint = ServerEndpoint::bind(config.tcp_bind, config.udp_bind).await?;
        let local_addr = endpoint.local_addr();
        let udp_addr = endpoint.udp_addr();
        let udp = endpoint.udp_socket();
        let idle_sleep = config.idle_sleep();
        let max_packet_size = config.max_packet_size;

        let files = services.files.clone();

        let broker = tokio::task::spawn_blocking(move || {
            let mut broker = Broker::new(config, services);
            broker.set_local_addrs(local_addr, udp_addr);
            if let Err(err) = broker.load_from_store() {
                warn!(error = %format!("{err:#}"), "Starting without restored channels");
            }
            broker
        })
        .await
        .context("Failed to load broker state")?;
        let broker = Arc::new(Mutex::new(broker));
        let writers: Writers = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));

        let (stores, store_task) = match files {
            Some(files) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let task = tokio::spawn(store_loop(files, rx, writers.clone()));
                (Some(tx), Some(task))
            }
            None => (None, None),
        };

        let accept_task = tokio::spawn(accept_loop(
            endpoint,
            broker.clone(),
            writers.clone(),
            max_packet_size,
        ));
        let udp_task = udp
            .clone()
            .map(|socket| tokio::spawn(udp_loop(socket, broker.clone())));

        let tick_thread = {
            let broker = broker.clone();
            let writers = writers.clone();
            let udp = udp.clone();
            let running = running.clone();
            let stores = stores.clone();
            thread::Builder::new()
                .name("tether-tick".to_string())
                .spawn(move || tick_loop(broker, writers, udp, stores, running, idle_sleep))
                .context("Failed to spawn tick thread")?
        };

        info!(%local_addr, udp = ?udp_addr, "Broker listening");
        Ok(Self {
            broker,
            writers,
            udp,
            local_addr,
            udp_addr,
            running,
            stores,
            store_task,
            tick_thread: Some(tick_thread),
            accept_task,
            udp_task,
        })
    }

    /// Bound TCP address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound UDP address, if any.
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    /// Shared handle to the broker state.
    pub fn broker(&self) -> Arc<Mutex<Broker>> {
        self.broker.clone()
    }

    /// Handshaken players.
    pub fn player_count(&self) -> usize {
        self.broker.lock().player_count()
    }

    /// Stop accepting, disconnect every client and save persistent channels.
    #[instrument(skip(self), fields(addr = %self.local_addr))]
    pub async fn shutdown(mut self) -> Result<()> {
        self.accept_task.abort();
        if let Some(task) = self.udp_task.take() {
            task.abort();
        }
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.tick_thread.take() {
            tokio::task::spawn_blocking(move || handle.join())
                .await
                .context("Failed to join tick thread")?
                .map_err(|_| anyhow::anyhow!("Tick thread panicked"))?;
        }

        let io = {
            let mut broker = self.broker.lock();
            broker.shutdown("server shutting down");
            broker.take_io()
        };
        dispatch_io(io, &self.writers, self.udp.as_deref(), self.stores.as_ref());

        // The tick thread's sender is gone, so dropping ours ends the worker.
        drop(self.stores.take());
        if let Some(task) = self.store_task.take() {
            match tokio::time::timeout(STORE_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "Store worker failed"),
                Err(_) => warn!("Timed out waiting for queued store work"),
            }
        }

        let deadline = Instant::now() + FLUSH_TIMEOUT;
        while !self.writers.lock().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        info!("Broker stopped");
        Ok(())
    }
}

async fn accept_loop(
    endpoint: ServerEndpoint,
    broker: Arc<Mutex<Broker>>,
    writers: Writers,
    max_packet_size: u32,
) {
    loop {
        let (stream, addr) = match endpoint.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "Accept failed");
                continue;
            }
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = {
            let mut broker = broker.lock();
            match broker.accept(addr, Instant::now()) {
                Ok(conn) => {
                    writers.lock().insert(conn, tx);
                    conn
                }
                Err(violation) => {
                    debug!(%addr, error = %violation, "Connection refused");
                    continue;
                }
            }
        };

        let (read_half, write_half) = stream.into_split();
        let reader = tokio::spawn(read_loop(
            conn,
            read_half,
            broker.clone(),
            max_packet_size,
        ));
        tokio::spawn(write_loop(
            conn,
            write_half,
            rx,
            reader.abort_handle(),
            broker.clone(),
            writers.clone(),
        ));
    }
}

#[instrument(skip(stream, broker, max_packet_size))]
async fn read_loop(
    conn: ConnectionId,
    mut stream: OwnedReadHalf,
    broker: Arc<Mutex<Broker>>,
    max_packet_size: u32,
) {
    let mut defrag = Defragmenter::new(max_packet_size);
    let mut buf = vec![0u8; 8192];
    let reason = loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => break "connection closed by peer".to_string(),
            Ok(n) => n,
            Err(err) => break format!("read failed: {err}"),
        };
        defrag.push(&buf[..n]);

        let mut frames = Vec::new();
        let failure = loop {
            match defrag.next_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break None,
                Err(err) => break Some(format!("framing error: {err}")),
            }
        };
        {
            let mut broker = broker.lock();
            for frame in frames {
                broker.enqueue_inbound(conn, frame);
            }
        }
        if let Some(reason) = failure {
            break reason;
        }
    };
    debug!(reason = %reason, "Reader stopped");
    broker.lock().connection_lost(conn, reason);
}

#[instrument(skip(stream, rx, reader, broker, writers))]
async fn write_loop(
    conn: ConnectionId,
    mut stream: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    reader: AbortHandle,
    broker: Arc<Mutex<Broker>>,
    writers: Writers,
) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Frame(frame) => {
                if let Err(err) = stream.write_all(&frame).await {
                    debug!(error = %err, "Write failed");
                    broker.lock().connection_lost(conn, format!("write failed: {err}"));
                    break;
                }
            }
            WriterCommand::Close => {
                let _ = stream.shutdown().await;
                break;
            }
        }
    }
    reader.abort();
    writers.lock().remove(&conn);
}

async fn udp_loop(socket: Arc<UdpSocket>, broker: Arc<Mutex<Broker>>) {
    let mut buf = vec![0u8; 65_536];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, addr)) => {
                broker
                    .lock()
                    .enqueue_datagram(addr, Bytes::copy_from_slice(&buf[..n]));
            }
            Err(err) => {
                // ICMP port-unreachable surfaces here on some platforms.
                debug!(error = %err, "UDP receive failed");
            }
        }
    }
}

fn tick_loop(
    broker: Arc<Mutex<Broker>>,
    writers: Writers,
    udp: Option<Arc<UdpSocket>>,
    stores: Option<StoreQueue>,
    running: Arc<AtomicBool>,
    idle_sleep: Duration,
) {
    info!("Tick thread started");
    while running.load(Ordering::Acquire) {
        let (busy, io) = {
            let mut broker = broker.lock();
            let busy = broker.tick(Instant::now());
            (busy, broker.take_io())
        };
        dispatch_io(io, &writers, udp.as_deref(), stores.as_ref());
        if !busy {
            thread::sleep(idle_sleep);
        }
    }
    info!("Tick thread stopped");
}

fn dispatch_io(
    io: IoBatch,
    writers: &Writers,
    udp: Option<&UdpSocket>,
    stores: Option<&StoreQueue>,
) {
    if io.is_empty() {
        return;
    }
    for request in io.stores {
        match stores {
            Some(tx) => {
                if tx.send(request).is_err() {
                    warn!("Store worker gone; request dropped");
                }
            }
            None => debug!("Store request dropped without a file store"),
        }
    }
    let writers = writers.lock();
    for outbound in io.sends {
        match outbound {
            Outbound::Stream { conn, frame } => {
                if let Some(tx) = writers.get(&conn) {
                    let _ = tx.send(WriterCommand::Frame(frame));
                }
            }
            Outbound::Datagram { addr, frame } => match udp {
                Some(socket) => {
                    if let Err(err) = socket.try_send_to(&frame, addr) {
                        debug!(%addr, error = %err, "Datagram dropped");
                    }
                }
                None => debug!(%addr, "Datagram dropped without a UDP socket"),
            },
        }
    }
    for conn in io.closes {
        if let Some(tx) = writers.get(&conn) {
            let _ = tx.send(WriterCommand::Close);
        }
    }
}

/// Runs store requests one at a time, in the order the tick queued them.
async fn store_loop(
    files: Arc<dyn FileStore>,
    mut rx: mpsc::UnboundedReceiver<StoreRequest>,
    writers: Writers,
) {
    while let Some(request) = rx.recv().await {
        let files = files.clone();
        let reply = match tokio::task::spawn_blocking(move || request.execute(files.as_ref())).await
        {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = %err, "Store request failed");
                continue;
            }
        };
        let Some((conn, msg)) = reply else {
            continue;
        };
        match encode_server_message(&msg) {
            Ok(frame) => {
                if let Some(tx) = writers.lock().get(&conn) {
                    let _ = tx.send(WriterCommand::Frame(frame));
                }
            }
            Err(err) => warn!(conn, error = %err, "Failed to encode store reply"),
        }
    }
    debug!("Store worker stopped");
}
