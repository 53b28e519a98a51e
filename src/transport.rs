//! # Transports
//!
//! Two implementations of [`Transport`]:
//!
//! | Transport | Use |
//! |-----------|-----|
//! | [`TcpTransport`] | Production: JSON envelopes over TCP |
//! | [`MockNetwork`] | Tests: in-process channels keyed by address string |
//!
//! ## TCP framing
//!
//! ```text
//! +----------------+---------------------------+
//! | len: u32 (BE)  | JSON-encoded Message      |
//! +----------------+---------------------------+
//! ```
//!
//! Frames larger than `max_frame_size` are refused in both directions.
//!
//! ## Connection registry
//!
//! Dialed connections are cached per address in a bounded [`LruCache`]. A
//! connection whose write fails is marked broken and replaced on the next
//! dial, so a restarted peer is reachable again without manual eviction.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, trace, warn};

use crate::error::{DhtError, Result};
use crate::messages::Message;
use crate::protocols::{Socket, Transport};

/// Upper bound on cached outbound connections.
pub const MAX_CACHED_CONNECTIONS: usize = 256;

/// Inbound envelopes buffered per listener before readers wait.
const INBOUND_QUEUE: usize = 1024;

pub async fn write_frame<W>(writer: &mut W, msg: &Message, max_frame_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = msg.to_bytes()?;
    if bytes.len() > max_frame_size {
        return Err(DhtError::Protocol(format!(
            "frame too large: {} bytes (max {})",
            bytes.len(),
            max_frame_size
        )));
    }
    let len = bytes.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_size {
        return Err(DhtError::Protocol(format!(
            "frame too large: {} bytes (max {})",
            len, max_frame_size
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Message::from_bytes(&buf).map(Some)
}

// ============================================================================
// TCP
// ============================================================================

pub struct TcpTransport {
    max_frame_size: usize,
    connections: Mutex<LruCache<String, TcpSocket>>,
}

impl TcpTransport {
    pub fn new(max_frame_size: usize) -> Self {
        let cap = NonZeroUsize::new(MAX_CACHED_CONNECTIONS).unwrap_or(NonZeroUsize::MIN);
        Self {
            max_frame_size,
            connections: Mutex::new(LruCache::new(cap)),
        }
    }

    pub async fn cached_connections(&self) -> usize {
        self.connections.lock().await.len()
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(crate::config::DhtConfig::default().max_frame_size)
    }
}

#[derive(Clone)]
pub struct TcpSocket {
    inner: Arc<TcpSocketInner>,
}

enum TcpSocketInner {
    Listener(TcpListenerState),
    Connection(TcpConnectionState),
}

struct TcpListenerState {
    local_addr: String,
    inbound: Mutex<mpsc::Receiver<Message>>,
    accept_task: JoinHandle<()>,
}

impl Drop for TcpListenerState {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

struct TcpConnectionState {
    peer_addr: String,
    local_addr: String,
    writer: Mutex<OwnedWriteHalf>,
    broken: AtomicBool,
    max_frame_size: usize,
}

impl TcpSocket {
    fn is_broken(&self) -> bool {
        match &*self.inner {
            TcpSocketInner::Connection(c) => c.broken.load(Ordering::Relaxed),
            TcpSocketInner::Listener(_) => false,
        }
    }
}

async fn accept_loop(listener: TcpListener, inbound: mpsc::Sender<Message>, max_frame_size: usize) {
    // Dropping the set on abort tears down every reader with it.
    let mut readers = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote)) => {
                        trace!(remote = %remote, "accepted connection");
                        readers.spawn(read_loop(stream, inbound.clone(), max_frame_size));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
        }
    }
}

async fn read_loop(mut stream: TcpStream, inbound: mpsc::Sender<Message>, max_frame_size: usize) {
    loop {
        match read_frame(&mut stream, max_frame_size).await {
            Ok(Some(msg)) => {
                if inbound.send(msg).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "dropping connection after bad frame");
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Socket = TcpSocket;

    async fn listen(&self, addr: &str) -> Result<TcpSocket> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DhtError::Transport(format!("listen on {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?.to_string();
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let accept_task = tokio::spawn(accept_loop(listener, tx, self.max_frame_size));

        debug!(addr = %local_addr, "tcp listener bound");
        Ok(TcpSocket {
            inner: Arc::new(TcpSocketInner::Listener(TcpListenerState {
                local_addr,
                inbound: Mutex::new(rx),
                accept_task,
            })),
        })
    }

    async fn dial(&self, addr: &str) -> Result<TcpSocket> {
        {
            let mut cache = self.connections.lock().await;
            let cached = cache.get(addr).cloned();
            match cached {
                Some(sock) if !sock.is_broken() => return Ok(sock),
                Some(_) => {
                    trace!(addr = %addr, "evicting broken connection");
                    cache.pop(addr);
                }
                None => {}
            }
        }

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| DhtError::Transport(format!("dial {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?.to_string();
        let (_read_half, write_half) = stream.into_split();

        let sock = TcpSocket {
            inner: Arc::new(TcpSocketInner::Connection(TcpConnectionState {
                peer_addr: addr.to_string(),
                local_addr,
                writer: Mutex::new(write_half),
                broken: AtomicBool::new(false),
                max_frame_size: self.max_frame_size,
            })),
        };
        self.connections.lock().await.put(addr.to_string(), sock.clone());
        Ok(sock)
    }
}

#[async_trait]
impl Socket for TcpSocket {
    async fn send(&self, msg: &Message) -> Result<()> {
        match &*self.inner {
            TcpSocketInner::Connection(conn) => {
                let mut writer = conn.writer.lock().await;
                let res = write_frame(&mut *writer, msg, conn.max_frame_size).await;
                if let Err(e) = &res {
                    if matches!(e, DhtError::Io(_)) {
                        conn.broken.store(true, Ordering::Relaxed);
                    }
                    debug!(peer = %conn.peer_addr, error = %e, "send failed");
                }
                res.map_err(|e| match e {
                    DhtError::Io(io) => DhtError::Transport(format!("send to {}: {}", conn.peer_addr, io)),
                    other => other,
                })
            }
            TcpSocketInner::Listener(_) => Err(DhtError::Transport(
                "listening socket cannot send; dial the peer".to_string(),
            )),
        }
    }

    async fn receive(&self) -> Result<Message> {
        match &*self.inner {
            TcpSocketInner::Listener(l) => l
                .inbound
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| DhtError::Transport("listener closed".to_string())),
            TcpSocketInner::Connection(_) => Err(DhtError::Transport(
                "dialed sockets are send-only".to_string(),
            )),
        }
    }

    fn local_addr(&self) -> String {
        match &*self.inner {
            TcpSocketInner::Listener(l) => l.local_addr.clone(),
            TcpSocketInner::Connection(c) => c.local_addr.clone(),
        }
    }

    async fn close(&self) {
        match &*self.inner {
            TcpSocketInner::Listener(l) => l.accept_task.abort(),
            TcpSocketInner::Connection(c) => {
                c.broken.store(true, Ordering::Relaxed);
                let _ = c.writer.lock().await.shutdown().await;
            }
        }
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// In-process network: listeners register a channel under their address and
/// dialing looks the address up.
#[derive(Clone, Default)]
pub struct MockNetwork {
    listeners: Arc<std::sync::Mutex<HashMap<String, mpsc::Sender<Message>>>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unregister `addr`. Later dials to it fail with a transport error.
    pub fn disconnect(&self, addr: &str) -> bool {
        self.registry().remove(addr).is_some()
    }

    pub fn is_listening(&self, addr: &str) -> bool {
        self.registry().contains_key(addr)
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::Sender<Message>>> {
        // A poisoned map is still a consistent map.
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub enum MockSocket {
    Listener {
        addr: String,
        inbound: Mutex<mpsc::Receiver<Message>>,
        closed: watch::Sender<bool>,
        network: MockNetwork,
    },
    Connection {
        addr: String,
        outbound: mpsc::Sender<Message>,
    },
}

#[async_trait]
impl Transport for MockNetwork {
    type Socket = MockSocket;

    async fn listen(&self, addr: &str) -> Result<MockSocket> {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        {
            let mut registry = self.registry();
            if registry.contains_key(addr) {
                return Err(DhtError::Transport(format!("address in use: {}", addr)));
            }
            registry.insert(addr.to_string(), tx);
        }
        let (closed, _) = watch::channel(false);
        Ok(MockSocket::Listener {
            addr: addr.to_string(),
            inbound: Mutex::new(rx),
            closed,
            network: self.clone(),
        })
    }

    async fn dial(&self, addr: &str) -> Result<MockSocket> {
        let outbound = self
            .registry()
            .get(addr)
            .cloned()
            .ok_or_else(|| DhtError::Transport(format!("no such host: {}", addr)))?;
        Ok(MockSocket::Connection {
            addr: addr.to_string(),
            outbound,
        })
    }
}

#[async_trait]
impl Socket for MockSocket {
    async fn send(&self, msg: &Message) -> Result<()> {
        match self {
            MockSocket::Connection { addr, outbound } => outbound
                .send(msg.clone())
                .await
                .map_err(|_| DhtError::Transport(format!("connection to {} closed", addr))),
            MockSocket::Listener { .. } => Err(DhtError::Transport(
                "listening socket cannot send; dial the peer".to_string(),
            )),
        }
    }

    async fn receive(&self) -> Result<Message> {
        match self {
            MockSocket::Listener {
                inbound, closed, ..
            } => {
                let mut closed_rx = closed.subscribe();
                let mut inbound = inbound.lock().await;
                tokio::select! {
                    msg = inbound.recv() => {
                        msg.ok_or_else(|| DhtError::Transport("listener closed".to_string()))
                    }
                    _ = async {
                        while !*closed_rx.borrow_and_update() {
                            if closed_rx.changed().await.is_err() {
                                break;
                            }
                        }
                    } => {
                        Err(DhtError::Transport("listener closed".to_string()))
                    }
                }
            }
            MockSocket::Connection { .. } => Err(DhtError::Transport(
                "dialed sockets are send-only".to_string(),
            )),
        }
    }

    fn local_addr(&self) -> String {
        match self {
            MockSocket::Listener { addr, .. } | MockSocket::Connection { addr, .. } => addr.clone(),
        }
    }

    async fn close(&self) {
        if let MockSocket::Listener {
            addr,
            closed,
            network,
            ..
        } = self
        {
            network.disconnect(addr);
            closed.send_replace(true);
        }
    }
}
