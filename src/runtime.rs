//! Socket, thread and WAL owner that drives the engine.
//!
//! One event loop owns the engine and executes its actions in order;
//! datagram readers, stream readers, connector attempts and the ticker all
//! feed the same channel. That serialization is what makes sequencing,
//! WAL appends and catch-up servicing atomic with respect to each other.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{Receiver, Sender, unbounded};
use thiserror::Error;

use crate::bus::{BusError, DatagramBus};
use crate::config::Config;
use crate::engine::{Action, ControlTarget, Engine, EngineConfig};
use crate::ids::{NodeId, PayloadId};
use crate::net;
use crate::proto::{ControlMessage, OrderRecord, StreamMessage};
use crate::stream::{ClientEvent, ServerEvent, StreamClient, StreamServer};
use crate::wal::{OrderWal, WalError};

/// Initial role preference. A hint only: the actual role is decided by
/// election, this merely shortens the startup grace for a designated leader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleHint {
    Leader,
    Follower,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

pub struct PeerOptions {
    pub node_id: NodeId,
    pub role_hint: RoleHint,
    pub stream_port: u16,
    pub config: Config,
    /// Print every delivered order to stdout (the kitchen display).
    pub print_deliveries: bool,
    /// Optional programmatic delivery sink.
    pub delivery: Option<Sender<OrderRecord>>,
}

enum Event {
    Control(ControlMessage, SocketAddr),
    Server(ServerEvent),
    Client(u64, ClientEvent),
    ClientConnected(u64, Box<StreamClient>),
    ClientConnectFailed(u64),
    Submit { payload_id: PayloadId, body: String },
    Tick,
    Shutdown,
}

/// Running peer. Dropping the handle leaves the peer running; call
/// `shutdown` to stop it.
pub struct PeerHandle {
    events: Sender<Event>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl PeerHandle {
    /// Submit a payload through this peer. Re-submitting the same
    /// `payload_id` is idempotent end to end.
    pub fn submit(&self, payload_id: PayloadId, body: impl Into<String>) {
        let _ = self.events.send(Event::Submit {
            payload_id,
            body: body.into(),
        });
    }

    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.events.send(Event::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Start a peer: replay the WAL, bind the node's datagram port, spawn the
/// reader and ticker threads and hand the engine to its event loop.
pub fn start(options: PeerOptions) -> Result<PeerHandle, RuntimeError> {
    let config = options.config;
    let wal = OrderWal::open(&config.wal_dir, options.node_id)?;
    let replayed = wal.replay()?;

    let grace_ms = match options.role_hint {
        // A designated leader probes briefly for an incumbent, then claims.
        RoleHint::Leader => 1_000,
        // Jittered so simultaneously started followers don't all campaign
        // at once; bounded by the leader timeout.
        RoleHint::Follower => {
            use rand::Rng;
            rand::rng().random_range(1_500..=config.timing.leader_timeout_ms)
        }
    };

    let engine = Engine::new(
        EngineConfig {
            node_id: options.node_id,
            cluster: config.cluster.clone(),
            stream_port: options.stream_port,
            advertise_ip: net::primary_ip(),
            timing: config.timing.clone(),
            limits: config.limits.clone(),
            grace_ms,
        },
        replayed,
        now_ms(),
    );

    let node_bus = DatagramBus::bind(
        config.node_udp_port(options.node_id),
        config.limits.max_datagram_bytes,
    )?;
    let send_bus = node_bus.try_clone()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let (events_tx, events_rx) = unbounded::<Event>();

    spawn_bus_reader("udp-node", node_bus, events_tx.clone(), Arc::clone(&shutdown));
    spawn_ticker(
        config.timing.tick_interval_ms,
        events_tx.clone(),
        Arc::clone(&shutdown),
    );

    let (server_tx, server_rx) = unbounded::<ServerEvent>();
    spawn_forwarder(server_rx, events_tx.clone(), Event::Server);
    let (client_tx, client_rx) = unbounded::<(u64, ClientEvent)>();
    spawn_forwarder(client_rx, events_tx.clone(), |(generation, event)| {
        Event::Client(generation, event)
    });

    let mut runtime = Runtime {
        node_id: options.node_id,
        stream_port: options.stream_port,
        print_deliveries: options.print_deliveries,
        delivery: options.delivery,
        targets: net::discovery_targets(config.single_host),
        config,
        engine,
        wal,
        bus: send_bus,
        events_tx: events_tx.clone(),
        server_tx,
        client_tx,
        server: None,
        client: None,
        client_generation: 0,
        discovery_wanted: false,
        discovery_stop: None,
        wal_failures: 0,
        shutdown: Arc::clone(&shutdown),
    };

    let join = thread::Builder::new()
        .name(format!("peer-{}", options.node_id))
        .spawn(move || runtime.run(events_rx))
        .expect("spawn peer thread");

    Ok(PeerHandle {
        events: events_tx,
        shutdown,
        join: Some(join),
    })
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

fn spawn_bus_reader(
    name: &str,
    bus: DatagramBus,
    events: Sender<Event>,
    shutdown: Arc<AtomicBool>,
) {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                match bus.recv() {
                    Ok(Some((message, src))) => {
                        if events.send(Event::Control(message, src)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        tracing::warn!("datagram receive failed: {err}");
                        thread::sleep(Duration::from_millis(100));
                    }
                }
            }
        })
        .expect("spawn bus reader");
}

fn spawn_ticker(interval_ms: u64, events: Sender<Event>, shutdown: Arc<AtomicBool>) {
    thread::Builder::new()
        .name("ticker".to_string())
        .spawn(move || {
            loop {
                thread::sleep(Duration::from_millis(interval_ms));
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                if events.send(Event::Tick).is_err() {
                    break;
                }
            }
        })
        .expect("spawn ticker");
}

fn spawn_forwarder<T: Send + 'static>(
    from: Receiver<T>,
    to: Sender<Event>,
    wrap: impl Fn(T) -> Event + Send + 'static,
) {
    thread::spawn(move || {
        for item in from.iter() {
            if to.send(wrap(item)).is_err() {
                break;
            }
        }
    });
}

struct Runtime {
    node_id: NodeId,
    stream_port: u16,
    print_deliveries: bool,
    delivery: Option<Sender<OrderRecord>>,
    targets: Vec<IpAddr>,
    config: Config,
    engine: Engine,
    wal: OrderWal,
    bus: DatagramBus,
    events_tx: Sender<Event>,
    server_tx: Sender<ServerEvent>,
    client_tx: Sender<(u64, ClientEvent)>,
    server: Option<StreamServer>,
    client: Option<StreamClient>,
    client_generation: u64,
    discovery_wanted: bool,
    discovery_stop: Option<Arc<AtomicBool>>,
    wal_failures: u32,
    shutdown: Arc<AtomicBool>,
}

impl Runtime {
    fn run(&mut self, events: Receiver<Event>) {
        tracing::info!(node_id = %self.node_id, "peer running");
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let Ok(event) = events.recv() else {
                break;
            };
            if !self.handle_event(event) {
                break;
            }
        }
        self.teardown();
        tracing::info!(node_id = %self.node_id, "peer stopped");
    }

    fn handle_event(&mut self, event: Event) -> bool {
        let now = now_ms();
        let actions = match event {
            Event::Control(message, src) => self.engine.handle_control(message, src, now),
            Event::Server(ServerEvent::Opened(conn, peer)) => {
                self.engine.handle_conn_opened(conn, peer)
            }
            Event::Server(ServerEvent::Inbound(conn, message)) => {
                self.engine.handle_stream_inbound(conn, message, now)
            }
            Event::Server(ServerEvent::Closed(conn)) => self.engine.handle_conn_closed(conn),
            Event::ClientConnected(generation, client) => {
                if generation == self.client_generation && self.client.is_none() {
                    self.client = Some(*client);
                    self.engine.handle_leader_connected(now)
                } else {
                    client.close();
                    Vec::new()
                }
            }
            Event::ClientConnectFailed(generation) => {
                if generation == self.client_generation {
                    tracing::debug!("leader connection attempt failed");
                }
                Vec::new()
            }
            Event::Client(generation, event) => {
                if generation != self.client_generation {
                    Vec::new()
                } else {
                    match event {
                        ClientEvent::Inbound(message) => {
                            self.engine.handle_leader_stream(message, now)
                        }
                        ClientEvent::Closed => {
                            self.client = None;
                            self.engine.handle_leader_disconnected()
                        }
                    }
                }
            }
            Event::Submit { payload_id, body } => self.engine.handle_submit(payload_id, body, now),
            Event::Tick => {
                if self.discovery_wanted && self.discovery_stop.is_none() {
                    self.try_bind_discovery();
                }
                self.engine.tick(now)
            }
            Event::Shutdown => return false,
        };
        self.execute(actions)
    }

    /// Runs the engine's actions in order. A WAL append failure aborts the
    /// remainder of the batch (nothing may be broadcast that is not
    /// durable) and switches to the engine's recovery actions instead.
    fn execute(&mut self, actions: Vec<Action>) -> bool {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                Action::SendControl { target, message } => self.send_control(target, &message),
                Action::BroadcastOrder(record) => {
                    if let Some(server) = &self.server {
                        server.broadcast(&StreamMessage::Order(record));
                    }
                }
                Action::SendStream { conn, message } => {
                    if let Some(server) = &self.server
                        && let Err(err) = server.send(conn, &message)
                    {
                        tracing::debug!(%conn, "stream send failed: {err}");
                    }
                }
                Action::SendLeader(message) => {
                    if let Some(client) = &mut self.client {
                        if let Err(err) = client.send(&message) {
                            tracing::debug!("send to leader failed: {err}");
                        }
                    } else {
                        tracing::debug!("send to leader skipped: not connected");
                    }
                }
                Action::ConnectLeader { endpoint } => self.spawn_connect(endpoint),
                Action::DisconnectLeader => {
                    self.client_generation += 1;
                    if let Some(client) = self.client.take() {
                        client.close();
                    }
                }
                Action::StartStreamServer => self.start_server(),
                Action::StopStreamServer => {
                    if let Some(server) = self.server.take() {
                        server.stop();
                    }
                }
                Action::BindDiscovery => {
                    self.discovery_wanted = true;
                    self.try_bind_discovery();
                }
                Action::ReleaseDiscovery => {
                    self.discovery_wanted = false;
                    if let Some(stop) = self.discovery_stop.take() {
                        stop.store(true, Ordering::Relaxed);
                    }
                }
                Action::AppendWal(record) => {
                    if let Err(err) = self.wal.append(&record) {
                        tracing::error!(seq = %record.seq, "wal append failed: {err}");
                        if !self.recover_wal() {
                            return false;
                        }
                        queue.clear();
                        queue.extend(self.engine.handle_wal_failure(now_ms()));
                    } else {
                        self.wal_failures = 0;
                    }
                }
                Action::Deliver(record) => self.deliver(&record),
            }
        }
        true
    }

    fn send_control(&self, target: ControlTarget, message: &ControlMessage) {
        match target {
            ControlTarget::Peer(peer) => {
                self.bus
                    .send_to_each(message, &self.targets, self.config.node_udp_port(peer));
            }
            ControlTarget::Discovery => {
                self.bus
                    .send_to_each(message, &self.targets, self.config.discovery_port);
            }
            ControlTarget::Addr(addr) => {
                if let Err(err) = self.bus.send_to(message, addr) {
                    tracing::debug!(%addr, "unicast send failed: {err}");
                }
            }
        }
    }

    fn spawn_connect(&mut self, endpoint: SocketAddr) {
        if let Some(client) = self.client.take() {
            client.close();
        }
        self.client_generation += 1;
        let generation = self.client_generation;
        let events = self.events_tx.clone();
        let client_events = self.client_tx.clone();
        let timeout = Duration::from_millis(self.config.timing.connect_timeout_ms);
        let max_frame_bytes = self.config.limits.max_frame_bytes;
        thread::spawn(move || {
            match StreamClient::connect(endpoint, timeout, generation, client_events, max_frame_bytes)
            {
                Ok(client) => {
                    let _ = events.send(Event::ClientConnected(generation, Box::new(client)));
                }
                Err(err) => {
                    tracing::debug!(%endpoint, "connect failed: {err}");
                    let _ = events.send(Event::ClientConnectFailed(generation));
                }
            }
        });
    }

    fn start_server(&mut self) {
        if self.server.is_some() {
            return;
        }
        match StreamServer::start(
            self.stream_port,
            self.server_tx.clone(),
            self.config.limits.max_frame_bytes,
        ) {
            Ok(server) => self.server = Some(server),
            Err(err) => {
                tracing::error!(port = self.stream_port, "stream server start failed: {err}");
            }
        }
    }

    fn try_bind_discovery(&mut self) {
        if self.discovery_stop.is_some() {
            return;
        }
        match DatagramBus::bind(
            self.config.discovery_port,
            self.config.limits.max_datagram_bytes,
        ) {
            Ok(bus) => {
                let stop = Arc::new(AtomicBool::new(false));
                let reader_stop = Arc::clone(&stop);
                let events = self.events_tx.clone();
                thread::Builder::new()
                    .name("udp-discovery".to_string())
                    .spawn(move || {
                        loop {
                            if reader_stop.load(Ordering::Relaxed) {
                                break;
                            }
                            match bus.recv() {
                                Ok(Some((message, src))) => {
                                    if events.send(Event::Control(message, src)).is_err() {
                                        break;
                                    }
                                }
                                Ok(None) => {}
                                Err(err) => {
                                    tracing::warn!("discovery receive failed: {err}");
                                    thread::sleep(Duration::from_millis(100));
                                }
                            }
                        }
                    })
                    .expect("spawn discovery reader");
                self.discovery_stop = Some(stop);
            }
            Err(err) => {
                // A demoted leader may still hold the port for a moment;
                // retried on the next tick.
                tracing::debug!("discovery port bind failed: {err}");
            }
        }
    }

    /// Reopen the log after an append failure. Two consecutive failures
    /// mean the disk is gone for good; stop and let the operator look.
    fn recover_wal(&mut self) -> bool {
        self.wal_failures += 1;
        if self.wal_failures >= 2 {
            tracing::error!("wal failed twice in a row, stopping peer");
            self.shutdown.store(true, Ordering::Relaxed);
            return false;
        }
        match OrderWal::open(&self.config.wal_dir, self.node_id) {
            Ok(wal) => {
                self.wal = wal;
                true
            }
            Err(err) => {
                tracing::error!("wal reopen failed: {err}");
                self.shutdown.store(true, Ordering::Relaxed);
                false
            }
        }
    }

    fn deliver(&mut self, record: &OrderRecord) {
        tracing::info!(
            seq = %record.seq,
            epoch = %record.epoch,
            submitter = %record.submitter_id,
            "delivered order"
        );
        if self.print_deliveries {
            println!(
                "DELIVER #{} [from {}] {}",
                record.seq, record.submitter_id, record.body
            );
        }
        let sink_gone = self
            .delivery
            .as_ref()
            .is_some_and(|delivery| delivery.send(record.clone()).is_err());
        if sink_gone {
            self.delivery = None;
        }
    }

    fn teardown(&mut self) {
        if let Some(client) = self.client.take() {
            client.close();
        }
        if let Some(server) = self.server.take() {
            server.stop();
        }
        if let Some(stop) = self.discovery_stop.take() {
            stop.store(true, Ordering::Relaxed);
        }
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
