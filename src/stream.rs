//! Reliable, in-order record transport between the leader and its followers.
//!
//! The leader side accepts connections and exposes broadcast plus
//! per-connection unicast; the follower side holds a single connection to
//! the leader. Each connection gets a reader thread that forwards decoded
//! records to the owner's event channel; any IO error closes the
//! connection and surfaces as a `Closed` event.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::Sender;
use thiserror::Error;

use crate::frame::{FrameError, FrameReader, FrameWriter};
use crate::proto::{self, ProtoError, StreamMessage};

/// Connection identity on the leader side. Never reused within a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(u64);

impl ConnId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

fn next_conn_id() -> ConnId {
    ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error("connection {0} is gone")]
    ConnectionGone(ConnId),
}

#[derive(Debug)]
pub enum ServerEvent {
    Opened(ConnId, SocketAddr),
    Inbound(ConnId, StreamMessage),
    Closed(ConnId),
}

/// Write half of one accepted connection. The raw stream is kept so the
/// server can shut the socket down and unblock the reader thread.
struct ConnHandle {
    stream: TcpStream,
    writer: FrameWriter<TcpStream>,
}

impl ConnHandle {
    fn hang_up(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

type ConnRegistry = Arc<Mutex<HashMap<ConnId, ConnHandle>>>;

/// Leader-hosted record server.
pub struct StreamServer {
    shutdown: Arc<AtomicBool>,
    conns: ConnRegistry,
    accept_join: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl StreamServer {
    pub fn start(
        port: u16,
        events: Sender<ServerEvent>,
        max_frame_bytes: usize,
    ) -> Result<Self, StreamError> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let conns: ConnRegistry = Arc::new(Mutex::new(HashMap::new()));

        let accept_shutdown = Arc::clone(&shutdown);
        let accept_conns = Arc::clone(&conns);
        let accept_join = thread::spawn(move || {
            run_accept_loop(listener, events, accept_shutdown, accept_conns, max_frame_bytes);
        });

        tracing::info!(%local_addr, "stream server listening");
        Ok(Self {
            shutdown,
            conns,
            accept_join: Some(accept_join),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn send(&self, conn: ConnId, message: &StreamMessage) -> Result<(), StreamError> {
        let bytes = proto::encode_stream(message)?;
        let mut conns = self.conns.lock().expect("stream registry lock poisoned");
        let handle = conns
            .get_mut(&conn)
            .ok_or(StreamError::ConnectionGone(conn))?;
        if let Err(err) = handle.writer.write_frame(&bytes) {
            // Hanging up unblocks the reader thread, which reports Closed.
            handle.hang_up();
            conns.remove(&conn);
            return Err(err.into());
        }
        Ok(())
    }

    /// Best-effort fan-out; failed connections are dropped from the registry
    /// and reported through their reader threads.
    pub fn broadcast(&self, message: &StreamMessage) {
        let bytes = match proto::encode_stream(message) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!("stream broadcast encode failed: {err}");
                return;
            }
        };
        let mut conns = self.conns.lock().expect("stream registry lock poisoned");
        conns.retain(|conn, handle| match handle.writer.write_frame(&bytes) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(%conn, "dropping connection on write failure: {err}");
                handle.hang_up();
                false
            }
        });
    }

    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Ok(mut conns) = self.conns.lock() {
            for handle in conns.values() {
                handle.hang_up();
            }
            conns.clear();
        }
        if let Some(join) = self.accept_join.take() {
            let _ = join.join();
        }
    }
}

fn run_accept_loop(
    listener: TcpListener,
    events: Sender<ServerEvent>,
    shutdown: Arc<AtomicBool>,
    conns: ConnRegistry,
    max_frame_bytes: usize,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) =
                    register_connection(stream, peer, &events, &shutdown, &conns, max_frame_bytes)
                {
                    tracing::warn!(%peer, "rejecting connection: {err}");
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(25));
            }
            Err(err) => {
                tracing::warn!("accept failed: {err}");
                thread::sleep(Duration::from_millis(25));
            }
        }
    }
}

fn register_connection(
    stream: TcpStream,
    peer: SocketAddr,
    events: &Sender<ServerEvent>,
    shutdown: &Arc<AtomicBool>,
    conns: &ConnRegistry,
    max_frame_bytes: usize,
) -> Result<(), StreamError> {
    stream.set_nodelay(true)?;
    let conn = next_conn_id();
    let reader_stream = stream.try_clone()?;
    let writer_stream = stream.try_clone()?;

    conns.lock().expect("stream registry lock poisoned").insert(
        conn,
        ConnHandle {
            stream,
            writer: FrameWriter::new(writer_stream, max_frame_bytes),
        },
    );
    let _ = events.send(ServerEvent::Opened(conn, peer));

    let events = events.clone();
    let shutdown = Arc::clone(shutdown);
    let conns = Arc::clone(conns);
    thread::spawn(move || {
        let mut reader = FrameReader::new(reader_stream, max_frame_bytes);
        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            match read_message(&mut reader) {
                Ok(Some(message)) => {
                    if events.send(ServerEvent::Inbound(conn, message)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(%conn, "connection read failed: {err}");
                    break;
                }
            }
        }
        if let Some(handle) = conns
            .lock()
            .expect("stream registry lock poisoned")
            .remove(&conn)
        {
            handle.hang_up();
        }
        let _ = events.send(ServerEvent::Closed(conn));
    });

    Ok(())
}

/// Decodes one record; malformed frames are dropped, not fatal.
fn read_message<R: std::io::Read>(
    reader: &mut FrameReader<R>,
) -> Result<Option<StreamMessage>, StreamError> {
    loop {
        let Some(bytes) = reader.read_frame()? else {
            return Ok(None);
        };
        match proto::decode_stream(&bytes) {
            Ok(message) => return Ok(Some(message)),
            Err(err) => {
                tracing::debug!("malformed stream record dropped: {err}");
            }
        }
    }
}

#[derive(Debug)]
pub enum ClientEvent {
    Inbound(StreamMessage),
    Closed,
}

/// Follower-side connection to the leader.
pub struct StreamClient {
    stream: TcpStream,
    writer: FrameWriter<TcpStream>,
}

impl StreamClient {
    /// Connects and spawns a reader thread that forwards records tagged
    /// with `generation`, letting the owner discard events from a
    /// connection it already abandoned.
    pub fn connect(
        endpoint: SocketAddr,
        connect_timeout: Duration,
        generation: u64,
        events: Sender<(u64, ClientEvent)>,
        max_frame_bytes: usize,
    ) -> Result<Self, StreamError> {
        let stream = TcpStream::connect_timeout(&endpoint, connect_timeout)?;
        stream.set_nodelay(true)?;
        let reader_stream = stream.try_clone()?;
        let writer = FrameWriter::new(stream.try_clone()?, max_frame_bytes);

        thread::spawn(move || {
            let mut reader = FrameReader::new(reader_stream, max_frame_bytes);
            loop {
                match read_message(&mut reader) {
                    Ok(Some(message)) => {
                        if events.send((generation, ClientEvent::Inbound(message))).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::debug!("leader connection read failed: {err}");
                        break;
                    }
                }
            }
            let _ = events.send((generation, ClientEvent::Closed));
        });

        tracing::info!(%endpoint, "connected to leader");
        Ok(Self { stream, writer })
    }

    pub fn send(&mut self, message: &StreamMessage) -> Result<(), StreamError> {
        let bytes = proto::encode_stream(message)?;
        self.writer.write_frame(&bytes)?;
        Ok(())
    }

    pub fn close(self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
