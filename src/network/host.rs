//! Stream-multiplexing transport host
//!
//! Features:
//! - One TCP connection per remote peer, opened by whichever side dials first
//! - `Hello` exchange binding the connection to the remote peer id
//! - Many short-lived protocol streams over each connection
//! - Per-protocol stream handlers
//! - Connection and stream notifications for the connection manager
//! - Read/write timeouts on every stream operation

use crate::network::addr::{NodeAddr, PeerId};
use crate::network::codec::{Frame, FrameCodec};
use crate::network::message::{self, Protocol, NET_VERSION};
use futures::future::BoxFuture;
use futures::sink::SinkExt;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// Frames buffered per stream before the connection reader waits
pub const STREAM_BUFFER: usize = 64;

/// Frames buffered per connection writer
pub const WRITE_BUFFER: usize = 256;

/// Transport errors
#[derive(Error, Debug)]
pub enum HostError {
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("dial timed out")]
    DialTimeout,
    #[error("cannot dial self")]
    DialSelf,
    #[error("peer id mismatch: expected {expected}, got {got}")]
    PeerIdMismatch { expected: String, got: String },
    #[error("hello exchange failed: {0}")]
    Hello(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("stream operation timed out")]
    Timeout,
    #[error("stream closed")]
    Closed,
    #[error("stream reset")]
    Reset,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("host stopped")]
    Stopped,
}

impl HostError {
    /// Whether the error happened while establishing a connection
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            HostError::Dial(_)
                | HostError::DialTimeout
                | HostError::DialSelf
                | HostError::PeerIdMismatch { .. }
                | HostError::Hello(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A live connection as seen by notifiees
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub remote: NodeAddr,
    pub direction: Direction,
    closer: CancellationToken,
}

impl ConnInfo {
    /// Tear the connection down
    pub fn close(&self) {
        self.closer.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }
}

/// A newly opened stream as seen by notifiees
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub remote: NodeAddr,
    pub protocol: Protocol,
    pub direction: Direction,
}

/// Connection lifecycle observer
pub trait Notifiee: Send + Sync {
    fn connected(&self, conn: &ConnInfo);
    fn disconnected(&self, conn: &ConnInfo);
    /// Returning false resets the stream
    fn opened_stream(&self, stream: &StreamInfo) -> bool;
}

pub type StreamHandler = Arc<dyn Fn(Stream) -> BoxFuture<'static, ()> + Send + Sync>;

type StreamRegistry = Arc<Mutex<HashMap<u64, mpsc::Sender<StreamEvent>>>>;

#[derive(Debug)]
enum StreamEvent {
    Data(Vec<u8>),
    Close,
    Reset,
}

// =============================================================================
// Stream
// =============================================================================

/// One protocol exchange with a remote peer
pub struct Stream {
    id: u64,
    protocol: Protocol,
    remote: NodeAddr,
    direction: Direction,
    writer: mpsc::Sender<Frame>,
    incoming: mpsc::Receiver<StreamEvent>,
    registry: StreamRegistry,
    timeout: Duration,
    finished: bool,
    remote_closed: bool,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("remote", &self.remote)
            .field("direction", &self.direction)
            .finish()
    }
}

impl Stream {
    fn open(
        id: u64,
        protocol: Protocol,
        conn: &Connection,
        direction: Direction,
        timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        conn.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        Self {
            id,
            protocol,
            remote: conn.info.remote,
            direction,
            writer: conn.writer.clone(),
            incoming: rx,
            registry: conn.streams.clone(),
            timeout,
            finished: false,
            remote_closed: false,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn remote(&self) -> &NodeAddr {
        &self.remote
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            remote: self.remote,
            protocol: self.protocol,
            direction: self.direction,
        }
    }

    /// Encode and send one message
    pub async fn write_msg<T: Serialize>(&mut self, msg: &T) -> Result<(), HostError> {
        if self.finished {
            return Err(HostError::Closed);
        }
        let payload = message::encode(msg)?;
        let frame = Frame::Data {
            stream_id: self.id,
            payload,
        };
        timeout(self.timeout, self.writer.send(frame))
            .await
            .map_err(|_| HostError::Timeout)?
            .map_err(|_| HostError::ConnectionClosed)
    }

    /// Receive and decode one message
    pub async fn read_msg<T: DeserializeOwned>(&mut self) -> Result<T, HostError> {
        if self.remote_closed {
            return Err(HostError::Closed);
        }
        let event = timeout(self.timeout, self.incoming.recv())
            .await
            .map_err(|_| HostError::Timeout)?;

        match event {
            Some(StreamEvent::Data(payload)) => Ok(message::decode(&payload)?),
            Some(StreamEvent::Close) => {
                self.remote_closed = true;
                Err(HostError::Closed)
            }
            Some(StreamEvent::Reset) => {
                self.remote_closed = true;
                Err(HostError::Reset)
            }
            None => Err(HostError::ConnectionClosed),
        }
    }

    /// Finish the stream gracefully
    pub async fn close(mut self) {
        self.finish(Frame::Close { stream_id: self.id }).await;
    }

    /// Abort the stream
    pub async fn reset(mut self) {
        self.finish(Frame::Reset { stream_id: self.id }).await;
    }

    async fn finish(&mut self, frame: Frame) {
        self.finished = true;
        self.unregister();
        let _ = timeout(self.timeout, self.writer.send(frame)).await;
    }

    fn unregister(&self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if !self.finished {
            self.unregister();
            let _ = self.writer.try_send(Frame::Close { stream_id: self.id });
        }
    }
}

// =============================================================================
// Host
// =============================================================================

#[derive(Clone)]
struct Connection {
    conn_id: u64,
    info: ConnInfo,
    writer: mpsc::Sender<Frame>,
    streams: StreamRegistry,
    next_stream_id: Arc<AtomicU64>,
}

type FramedConn = Framed<TcpStream, FrameCodec>;

/// The local endpoint: listener, dialer and stream router
pub struct Host {
    local_id: PeerId,
    listen_addr: SocketAddr,
    timeout: Duration,
    conns: Mutex<HashMap<PeerId, Connection>>,
    handlers: RwLock<HashMap<String, (Protocol, StreamHandler)>>,
    notifiees: RwLock<Vec<Arc<dyn Notifiee>>>,
    next_conn_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Host {
    /// Bind the listener and start accepting connections
    pub async fn bind(
        local_id: PeerId,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Arc<Self>, HostError> {
        let listener = TcpListener::bind(addr).await?;
        let listen_addr = listener.local_addr()?;
        log::info!("Host listening on {}", listen_addr);

        let host = Arc::new(Self {
            local_id,
            listen_addr,
            timeout,
            conns: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            notifiees: RwLock::new(Vec::new()),
            next_conn_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });

        let accept_host = host.clone();
        tokio::spawn(async move { accept_host.accept_loop(listener).await });

        Ok(host)
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// The actually bound listen address
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn local_addr(&self) -> NodeAddr {
        NodeAddr::new(self.local_id, self.listen_addr)
    }

    pub fn set_handler(&self, protocol: Protocol, handler: StreamHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(protocol.id(), (protocol, handler));
    }

    pub fn notify(&self, notifiee: Arc<dyn Notifiee>) {
        self.notifiees
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notifiee);
    }

    pub fn is_connected(&self, id: &PeerId) -> bool {
        self.connection(id).is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.conns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|c| !c.info.is_closed())
            .count()
    }

    pub fn connected_peers(&self) -> Vec<NodeAddr> {
        self.conns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|c| !c.info.is_closed())
            .map(|c| c.info.remote)
            .collect()
    }

    /// Close the connection to a peer, if any
    pub fn close_connection(&self, id: &PeerId) {
        if let Some(conn) = self.connection(id) {
            conn.info.close();
        }
    }

    /// Stop accepting and close every connection
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            log::info!("Host {} shutting down", self.local_id.short());
            self.shutdown.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Open a protocol stream to `addr`, dialing if there is no connection yet
    pub async fn new_stream(
        self: &Arc<Self>,
        addr: &NodeAddr,
        protocol: Protocol,
    ) -> Result<Stream, HostError> {
        if self.is_stopped() {
            return Err(HostError::Stopped);
        }

        let conn = match self.connection(&addr.id) {
            Some(conn) => conn,
            None => self.dial(addr).await?,
        };

        let stream_id = conn.next_stream_id.fetch_add(2, Ordering::SeqCst);
        let stream = Stream::open(stream_id, protocol, &conn, Direction::Outbound, self.timeout);

        let open = Frame::Open {
            stream_id,
            protocol: protocol.id(),
        };
        timeout(self.timeout, conn.writer.send(open))
            .await
            .map_err(|_| HostError::Timeout)?
            .map_err(|_| HostError::ConnectionClosed)?;

        if !self.notify_opened(&stream.info()) {
            stream.reset().await;
            return Err(HostError::Stopped);
        }

        Ok(stream)
    }

    fn connection(&self, id: &PeerId) -> Option<Connection> {
        self.conns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .filter(|c| !c.info.is_closed())
            .cloned()
    }

    fn hello(&self) -> Frame {
        Frame::Hello {
            peer_id: self.local_id,
            listen_addr: self.listen_addr,
            net_version: NET_VERSION.to_string(),
        }
    }

    async fn read_hello(&self, framed: &mut FramedConn) -> Result<(PeerId, SocketAddr), HostError> {
        let frame = timeout(self.timeout, framed.next())
            .await
            .map_err(|_| HostError::Timeout)?;

        match frame {
            Some(Ok(Frame::Hello {
                peer_id,
                listen_addr,
                net_version,
            })) => {
                if net_version != NET_VERSION {
                    return Err(HostError::Hello(format!(
                        "unsupported network version {}",
                        net_version
                    )));
                }
                Ok((peer_id, listen_addr))
            }
            Some(Ok(other)) => Err(HostError::Hello(format!("unexpected frame {:?}", other))),
            Some(Err(e)) => Err(HostError::Hello(e.to_string())),
            None => Err(HostError::Hello("connection closed".to_string())),
        }
    }

    async fn dial(self: &Arc<Self>, addr: &NodeAddr) -> Result<Connection, HostError> {
        if addr.id == self.local_id {
            return Err(HostError::DialSelf);
        }

        let socket = timeout(self.timeout, TcpStream::connect(addr.socket))
            .await
            .map_err(|_| HostError::DialTimeout)?
            .map_err(|e| HostError::Dial(e.to_string()))?;

        let mut framed = Framed::new(socket, FrameCodec);
        framed
            .send(self.hello())
            .await
            .map_err(|e| HostError::Dial(e.to_string()))?;

        let (peer_id, _) = match self.read_hello(&mut framed).await {
            Err(HostError::Timeout) => return Err(HostError::DialTimeout),
            other => other?,
        };
        if peer_id != addr.id {
            return Err(HostError::PeerIdMismatch {
                expected: addr.id.to_string(),
                got: peer_id.to_string(),
            });
        }

        Ok(self.register(framed, *addr, Direction::Outbound))
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                res = listener.accept() => match res {
                    Ok((socket, remote)) => {
                        let host = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = host.accept_conn(socket, remote).await {
                                log::debug!("Rejected inbound connection from {}: {}", remote, e);
                            }
                        });
                    }
                    Err(e) => log::warn!("Accept error: {}", e),
                }
            }
        }
    }

    async fn accept_conn(
        self: &Arc<Self>,
        socket: TcpStream,
        remote: SocketAddr,
    ) -> Result<(), HostError> {
        let mut framed = Framed::new(socket, FrameCodec);
        let (peer_id, listen_addr) = self.read_hello(&mut framed).await?;
        if peer_id == self.local_id {
            return Err(HostError::DialSelf);
        }
        framed.send(self.hello()).await?;

        // Peers listening on a wildcard address are reached at the observed IP
        let socket = if listen_addr.ip().is_unspecified() {
            SocketAddr::new(remote.ip(), listen_addr.port())
        } else {
            listen_addr
        };

        self.register(framed, NodeAddr::new(peer_id, socket), Direction::Inbound);
        Ok(())
    }

    fn register(
        self: &Arc<Self>,
        framed: FramedConn,
        remote: NodeAddr,
        direction: Direction,
    ) -> Connection {
        let closer = self.shutdown.child_token();
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_BUFFER);
        let first_stream_id = match direction {
            Direction::Outbound => 0,
            Direction::Inbound => 1,
        };
        let conn = Connection {
            conn_id: self.next_conn_id.fetch_add(1, Ordering::SeqCst),
            info: ConnInfo {
                remote,
                direction,
                closer: closer.clone(),
            },
            writer: writer_tx,
            streams: Arc::new(Mutex::new(HashMap::new())),
            next_stream_id: Arc::new(AtomicU64::new(first_stream_id)),
        };

        {
            let mut conns = self.conns.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = conns.get(&remote.id) {
                if !existing.info.is_closed() {
                    // Lost a simultaneous-dial race; keep the first connection
                    return existing.clone();
                }
            }
            conns.insert(remote.id, conn.clone());
        }

        let (sink, stream) = framed.split();
        tokio::spawn(write_loop(sink, writer_rx, closer));
        tokio::spawn(self.clone().read_loop(conn.clone(), stream));

        log::debug!("Connected to {:?} ({:?})", remote, direction);
        for notifiee in self.notifiees() {
            notifiee.connected(&conn.info);
        }
        conn
    }

    fn notifiees(&self) -> Vec<Arc<dyn Notifiee>> {
        self.notifiees
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn notify_opened(&self, info: &StreamInfo) -> bool {
        self.notifiees().iter().all(|n| n.opened_stream(info))
    }

    async fn read_loop(self: Arc<Self>, conn: Connection, mut reader: SplitStream<FramedConn>) {
        loop {
            let frame = tokio::select! {
                _ = conn.info.closer.cancelled() => break,
                frame = reader.next() => frame,
            };
            match frame {
                Some(Ok(frame)) => self.dispatch(&conn, frame).await,
                Some(Err(e)) => {
                    log::debug!("Error reading from {:?}: {}", conn.info.remote, e);
                    break;
                }
                None => break,
            }
        }

        conn.info.close();
        conn.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        {
            let mut conns = self.conns.lock().unwrap_or_else(PoisonError::into_inner);
            if conns.get(&conn.info.remote.id).map(|c| c.conn_id) == Some(conn.conn_id) {
                conns.remove(&conn.info.remote.id);
            }
        }

        log::debug!("Disconnected from {:?}", conn.info.remote);
        for notifiee in self.notifiees() {
            notifiee.disconnected(&conn.info);
        }
    }

    async fn dispatch(&self, conn: &Connection, frame: Frame) {
        match frame {
            Frame::Open {
                stream_id,
                protocol,
            } => {
                let handler = self
                    .handlers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&protocol)
                    .cloned();

                let (protocol, handler) = match handler {
                    Some(h) => h,
                    None => {
                        log::debug!("No handler for {} from {:?}", protocol, conn.info.remote);
                        let _ = conn.writer.send(Frame::Reset { stream_id }).await;
                        return;
                    }
                };

                let stream =
                    Stream::open(stream_id, protocol, conn, Direction::Inbound, self.timeout);
                if !self.notify_opened(&stream.info()) {
                    stream.reset().await;
                    return;
                }
                tokio::spawn(handler(stream));
            }
            Frame::Data { stream_id, payload } => {
                let tx = conn
                    .streams
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&stream_id)
                    .cloned();
                if let Some(tx) = tx {
                    let _ = tx.send(StreamEvent::Data(payload)).await;
                }
            }
            Frame::Close { stream_id } => {
                let tx = conn
                    .streams
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&stream_id);
                if let Some(tx) = tx {
                    let _ = tx.send(StreamEvent::Close).await;
                }
            }
            Frame::Reset { stream_id } => {
                let tx = conn
                    .streams
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&stream_id);
                if let Some(tx) = tx {
                    let _ = tx.send(StreamEvent::Reset).await;
                }
            }
            Frame::Hello { .. } => {
                log::debug!("Unexpected hello from {:?}", conn.info.remote);
            }
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<FramedConn, Frame>,
    mut rx: mpsc::Receiver<Frame>,
    closer: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = closer.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if sink.send(frame).await.is_err() {
                        closer.cancel();
                        break;
                    }
                }
                None => break,
            }
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::Intro;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn make_host(seed: u64) -> Arc<Host> {
        Host::bind(PeerId::from_seed(seed), "127.0.0.1:0".parse().unwrap(), TIMEOUT)
            .await
            .unwrap()
    }

    fn echo_handler() -> StreamHandler {
        Arc::new(|mut stream: Stream| {
            async move {
                if let Ok(msg) = stream.read_msg::<Intro>().await {
                    let reply = Intro::new(format!("echo:{}", msg.peer_id));
                    let _ = stream.write_msg(&reply).await;
                }
            }
            .boxed()
        })
    }

    #[derive(Default)]
    struct Recorder {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
        opened: AtomicUsize,
    }

    impl Notifiee for Recorder {
        fn connected(&self, _conn: &ConnInfo) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn disconnected(&self, _conn: &ConnInfo) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }

        fn opened_stream(&self, _stream: &StreamInfo) -> bool {
            self.opened.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_stream_request_response() {
        let a = make_host(1).await;
        let b = make_host(2).await;
        b.set_handler(Protocol::Intro, echo_handler());

        let mut stream = a.new_stream(&b.local_addr(), Protocol::Intro).await.unwrap();
        stream.write_msg(&Intro::new("hi")).await.unwrap();
        let reply: Intro = stream.read_msg().await.unwrap();
        assert_eq!(reply.peer_id, "echo:hi");

        // The handler dropped its end, which closes the stream
        assert!(matches!(
            stream.read_msg::<Intro>().await,
            Err(HostError::Closed)
        ));

        assert!(a.is_connected(&b.local_id()));
        assert!(eventually(|| b.is_connected(&a.local_id())).await);
        assert_eq!(a.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_streams_share_one_connection() {
        let a = make_host(1).await;
        let b = make_host(2).await;
        b.set_handler(Protocol::Intro, echo_handler());

        for i in 0..3 {
            let mut stream = a.new_stream(&b.local_addr(), Protocol::Intro).await.unwrap();
            stream.write_msg(&Intro::new(i.to_string())).await.unwrap();
            let reply: Intro = stream.read_msg().await.unwrap();
            assert_eq!(reply.peer_id, format!("echo:{}", i));
            stream.close().await;
        }
        assert_eq!(a.connection_count(), 1);

        // b can open streams back over the same connection
        a.set_handler(Protocol::Intro, echo_handler());
        let mut back = b.new_stream(&a.local_addr(), Protocol::Intro).await.unwrap();
        back.write_msg(&Intro::new("back")).await.unwrap();
        let reply: Intro = back.read_msg().await.unwrap();
        assert_eq!(reply.peer_id, "echo:back");
        assert_eq!(b.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_protocol_is_reset() {
        let a = make_host(1).await;
        let b = make_host(2).await;

        let mut stream = a.new_stream(&b.local_addr(), Protocol::Ping).await.unwrap();
        assert!(matches!(
            stream.read_msg::<Intro>().await,
            Err(HostError::Reset)
        ));
    }

    #[tokio::test]
    async fn test_peer_id_mismatch() {
        let a = make_host(1).await;
        let b = make_host(2).await;
        let wrong = NodeAddr::new(PeerId::from_seed(99), b.listen_addr());

        let err = a.new_stream(&wrong, Protocol::Ping).await.unwrap_err();
        assert!(matches!(err, HostError::PeerIdMismatch { .. }));
        assert!(err.is_connect_error());
    }

    #[tokio::test]
    async fn test_dial_failure() {
        let a = make_host(1).await;
        let b = make_host(2).await;
        let addr = b.local_addr();
        b.close();
        drop(b);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = a.new_stream(&addr, Protocol::Ping).await.unwrap_err();
        assert!(err.is_connect_error(), "unexpected error: {}", err);
    }

    #[tokio::test]
    async fn test_dial_self() {
        let a = make_host(1).await;
        let err = a.new_stream(&a.local_addr(), Protocol::Ping).await.unwrap_err();
        assert!(matches!(err, HostError::DialSelf));
    }

    #[tokio::test]
    async fn test_notifications() {
        let a = make_host(1).await;
        let b = make_host(2).await;
        let recorder = Arc::new(Recorder::default());
        b.notify(recorder.clone());
        b.set_handler(Protocol::Intro, echo_handler());

        let mut stream = a.new_stream(&b.local_addr(), Protocol::Intro).await.unwrap();
        stream.write_msg(&Intro::new("x")).await.unwrap();
        let _: Intro = stream.read_msg().await.unwrap();

        assert_eq!(recorder.connected.load(Ordering::SeqCst), 1);
        assert!(eventually(|| recorder.opened.load(Ordering::SeqCst) == 1).await);

        a.close_connection(&b.local_id());
        assert!(eventually(|| recorder.disconnected.load(Ordering::SeqCst) == 1).await);
        assert!(eventually(|| !b.is_connected(&a.local_id())).await);
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let a = Host::bind(
            PeerId::from_seed(1),
            "127.0.0.1:0".parse().unwrap(),
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        let b = make_host(2).await;
        b.set_handler(
            Protocol::Intro,
            Arc::new(|stream: Stream| {
                async move {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    drop(stream);
                }
                .boxed()
            }),
        );

        let mut stream = a.new_stream(&b.local_addr(), Protocol::Intro).await.unwrap();
        assert!(matches!(
            stream.read_msg::<Intro>().await,
            Err(HostError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_stopped_host() {
        let a = make_host(1).await;
        let b = make_host(2).await;
        a.close();
        assert!(matches!(
            a.new_stream(&b.local_addr(), Protocol::Ping).await,
            Err(HostError::Stopped)
        ));
    }
}
