//! One directory node: a single-owner core loop multiplexing the peer link,
//! the client sessions, and the operator console.
//!
//! Listener and per-connection reader tasks only move bytes; every piece of
//! state (the tables, the session registry, the pending round-trips, the
//! peer slot) is owned by the core task and touched from nowhere else.
//! Sockets reach the core as events carrying their reader's tag, and replies
//! go back out on the writer halves the core keeps.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::ValueEnum;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::peer::{self, LinkId, Negotiation, PeerLink, PeerSlot};
use crate::protocol::{self, ErrorCode, OkCode, PeerMsg, Response, Uid};
use crate::session::{SessionId, SessionRegistry};
use crate::store::{LocationBoard, UserDirectory};

/// First delay before a node without the peer listener retries negotiation.
const RETRY_INITIAL: Duration = Duration::from_millis(500);
/// Ceiling for the doubling retry delay.
const RETRY_CAP: Duration = Duration::from_secs(8);
/// How long a departing node waits for the peer to acknowledge `REQ_DISCPEER`.
const DISCONNECT_WAIT: Duration = Duration::from_secs(2);
/// Depth of the event queue between the I/O tasks and the core.
const EVENT_QUEUE: usize = 128;

/// Which half of the directory pair this node serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// Owns identities and their special-permission flags.
    User,
    /// Owns per-identity current locations.
    Location,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Self::User => "user service",
            Self::Location => "location service",
        }
    }
}

/// Startup configuration for one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub role: Role,
    /// Well-known loopback port both nodes of the pair share.
    pub peer_port: u16,
    /// Client-facing listen address; port 0 picks an ephemeral port.
    pub listen: SocketAddr,
    pub max_clients: usize,
    pub max_users: usize,
}

/// Everything the I/O tasks report into the core.
enum Event {
    ClientConnected(TcpStream, SocketAddr),
    ClientLine { session: SessionId, line: String },
    ClientClosed { session: SessionId },
    PeerInbound(TcpStream, SocketAddr),
    PeerLine { link: LinkId, line: String },
    PeerClosed { link: LinkId },
}

/// A bound directory node, ready to run.
pub struct Node {
    config: NodeConfig,
    client_listener: TcpListener,
    peer_listener: Option<TcpListener>,
    startup_peer: Option<(BufReader<OwnedReadHalf>, OwnedWriteHalf, u32)>,
}

impl Node {
    /// Bind the client listener and negotiate the peer port.
    ///
    /// The initiator side of the handshake happens here: a node that finds
    /// the peer port taken connects and must be accepted before it starts
    /// serving, so a third node always fails fast with an error.
    pub async fn bind(config: NodeConfig) -> Result<Self> {
        let client_listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind client listener on {}", config.listen))?;
        let (peer_listener, startup_peer) = match peer::negotiate(config.peer_port).await? {
            Negotiation::Acceptor(listener) => {
                info!("peer listener on {}", listener.local_addr()?);
                (Some(listener), None)
            }
            Negotiation::Initiator(stream) => {
                let (reader, writer, id) = peer::handshake_initiator(stream).await?;
                info!(peer = id, "connected to peer");
                (None, Some((reader, writer, id)))
            }
            Negotiation::Standalone => {
                info!("peer port is unreachable; starting without a peer");
                (None, None)
            }
        };
        Ok(Self { config, client_listener, peer_listener, startup_peer })
    }

    /// Address of the client listener.
    pub fn client_addr(&self) -> io::Result<SocketAddr> {
        self.client_listener.local_addr()
    }

    /// Serve until `shutdown` resolves, then leave gracefully: close the
    /// peer link with a `REQ_DISCPEER` exchange and drop every session.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Node { config, client_listener, peer_listener, startup_peer } = self;
        let (events_tx, mut events) = mpsc::channel(EVENT_QUEUE);

        let mut core = Core::new(config, events_tx.clone());
        core.tasks.push(spawn_client_acceptor(client_listener, events_tx.clone()));
        match (peer_listener, startup_peer) {
            (Some(listener), _) => {
                core.holds_listener = true;
                core.tasks.push(spawn_peer_acceptor(listener, events_tx));
            }
            (None, Some((reader, writer, id))) => core.adopt_linked(reader, writer, id),
            (None, None) => core.schedule_retry(),
        }

        tokio::pin!(shutdown);
        loop {
            let retry_at = core.retry_at;
            tokio::select! {
                _ = &mut shutdown => break,
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => core.handle(event).await,
                    None => break,
                },
                _ = sleep_until_opt(retry_at) => core.on_retry_timer().await,
            }
        }
        core.shutdown(&mut events).await;
        Ok(())
    }

    /// Serve until Ctrl-C or an operator types `kill` on the console.
    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(error) = result {
                        warn!(%error, "failed to listen for the ctrl-c signal");
                    }
                }
                _ = console_kill() => {}
            }
        })
        .await
    }
}

/// An inspect request parked on the cross-node permission check.
#[derive(Debug)]
pub(crate) struct PendingInspect {
    pub(crate) uid: Uid,
    pub(crate) location: i32,
    pub(crate) session: SessionId,
}

/// Single owner of all node state. Only the core task touches the tables,
/// the registry, and the peer slot, so none of them needs a lock.
pub(crate) struct Core {
    pub(crate) role: Role,
    peer_port: u16,
    pub(crate) users: UserDirectory,
    pub(crate) locations: LocationBoard,
    pub(crate) sessions: SessionRegistry,
    pub(crate) peer: PeerSlot,
    /// In-flight movement registrations, keyed by uid because the wire
    /// carries no request id. Concurrent requests for one uid overwrite the
    /// waiter, so their replies can cross.
    pub(crate) pending_access: HashMap<Uid, SessionId>,
    /// The one in-flight inspect authorization; further inspects are
    /// refused while it is occupied.
    pub(crate) pending_inspect: Option<PendingInspect>,
    events: mpsc::Sender<Event>,
    tasks: Vec<JoinHandle<()>>,
    holds_listener: bool,
    next_link: LinkId,
    next_peer_id: u32,
    retry_at: Option<Instant>,
    retry_delay: Duration,
}

impl Core {
    fn new(config: NodeConfig, events: mpsc::Sender<Event>) -> Self {
        Self {
            role: config.role,
            peer_port: config.peer_port,
            users: UserDirectory::new(config.max_users),
            locations: LocationBoard::new(),
            sessions: SessionRegistry::new(config.max_clients),
            peer: PeerSlot::Empty,
            pending_access: HashMap::new(),
            pending_inspect: None,
            events,
            tasks: Vec::new(),
            holds_listener: false,
            next_link: 1,
            next_peer_id: 1,
            retry_at: None,
            retry_delay: RETRY_INITIAL,
        }
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::ClientConnected(stream, addr) => self.admit_client(stream, addr).await,
            Event::ClientLine { session, line } => self.on_client_line(session, line).await,
            Event::ClientClosed { session } => self.drop_session(session, "connection closed").await,
            Event::PeerInbound(stream, addr) => self.admit_peer(stream, addr).await,
            Event::PeerLine { link, line } => self.on_peer_line(link, line).await,
            Event::PeerClosed { link } => self.on_peer_lost(link, "peer connection closed"),
        }
    }

    async fn admit_client(&mut self, mut stream: TcpStream, addr: SocketAddr) {
        if self.sessions.at_capacity() {
            warn!(%addr, "refusing client, connection limit reached");
            let _ = protocol::write_line(&mut stream, &Response::Error(ErrorCode::ClientLimit)).await;
            return;
        }
        let (read_half, write_half) = stream.into_split();
        let session = self.sessions.insert(write_half);
        spawn_client_reader(read_half, session, self.events.clone());
        info!(session, %addr, "client connected");
    }

    pub(crate) async fn drop_session(&mut self, session: SessionId, reason: &str) {
        let Some(mut client) = self.sessions.remove(session) else { return };
        let _ = client.writer.shutdown().await;
        info!(session, location = client.location_context(), reason, "client removed");
    }

    /// Write a response to a session; a failed write tears the session down.
    pub(crate) async fn reply(&mut self, session: SessionId, response: &Response) {
        let Some(client) = self.sessions.get_mut(session) else {
            debug!(session, "dropping a reply to a session that is gone");
            return;
        };
        if let Err(error) = protocol::write_line(&mut client.writer, response).await {
            warn!(session, %error, "failed to write to client");
            self.drop_session(session, "write failed").await;
        }
    }

    async fn admit_peer(&mut self, mut stream: TcpStream, addr: SocketAddr) {
        if !self.peer.is_empty() {
            warn!(%addr, "refusing a second peer connection");
            let _ = protocol::write_line(&mut stream, &PeerMsg::Error(ErrorCode::PeerLimit)).await;
            return;
        }
        let link = self.alloc_link();
        let (read_half, write_half) = stream.into_split();
        spawn_peer_reader(BufReader::new(read_half), link, self.events.clone());
        self.peer = PeerSlot::AwaitingHello { link, writer: write_half };
        self.retry_at = Some(Instant::now() + peer::HANDSHAKE_TIMEOUT);
        debug!(%addr, "peer candidate connected, awaiting its handshake");
    }

    /// Take over a link whose handshake already ran, reusing the handshake's
    /// reader so no line pipelined behind its reply is lost.
    fn adopt_linked(&mut self, reader: BufReader<OwnedReadHalf>, writer: OwnedWriteHalf, id: u32) {
        let link = self.alloc_link();
        spawn_peer_reader(reader, link, self.events.clone());
        self.peer = PeerSlot::Linked(PeerLink { link, id, writer });
        self.link_established();
    }

    fn alloc_link(&mut self) -> LinkId {
        let link = self.next_link;
        self.next_link += 1;
        link
    }

    fn link_established(&mut self) {
        self.retry_at = None;
        self.retry_delay = RETRY_INITIAL;
    }

    async fn on_peer_line(&mut self, link: LinkId, line: String) {
        if !self.peer.matches(link) {
            debug!(link, "ignoring a line from a stale peer connection");
            return;
        }
        if matches!(self.peer, PeerSlot::AwaitingHello { .. }) {
            self.peer_hello(line).await;
        } else if matches!(self.peer, PeerSlot::AwaitingAccept { .. }) {
            self.peer_accept_reply(line).await;
        } else if self.peer.is_linked() {
            self.on_peer_msg(line).await;
        }
    }

    /// Acceptor side of the handshake: the candidate's first line must be
    /// `REQ_CONNPEER()`, anything else drops it.
    async fn peer_hello(&mut self, line: String) {
        if !matches!(PeerMsg::parse(&line), Ok(PeerMsg::ConnPeer)) {
            warn!(%line, "peer candidate opened with something other than REQ_CONNPEER");
            self.peer = PeerSlot::Empty;
            self.retry_at = None;
            return;
        }
        let PeerSlot::AwaitingHello { link, writer } = std::mem::take(&mut self.peer) else {
            return;
        };
        let id = self.next_peer_id;
        self.next_peer_id += 1;
        let mut peer = PeerLink { link, id, writer };
        if let Err(error) = protocol::write_line(&mut peer.writer, &PeerMsg::ConnPeerAccepted { id }).await {
            warn!(%error, "failed to answer the peer handshake");
            self.retry_at = None;
            return;
        }
        info!(peer = id, "peer connected");
        self.peer = PeerSlot::Linked(peer);
        self.link_established();
    }

    /// Initiator side of a renegotiated handshake.
    async fn peer_accept_reply(&mut self, line: String) {
        match PeerMsg::parse(&line) {
            Ok(PeerMsg::ConnPeerAccepted { id }) => {
                let PeerSlot::AwaitingAccept { link, writer } = std::mem::take(&mut self.peer) else {
                    return;
                };
                self.peer = PeerSlot::Linked(PeerLink { link, id, writer });
                info!(peer = id, "connected to peer");
                self.link_established();
            }
            Ok(PeerMsg::Error(ErrorCode::PeerLimit)) => {
                warn!("peer rejected the connection: peer limit exceeded");
                self.peer = PeerSlot::Empty;
                self.schedule_retry();
            }
            _ => {
                warn!(%line, "unexpected handshake reply from peer");
                self.peer = PeerSlot::Empty;
                self.schedule_retry();
            }
        }
    }

    fn on_peer_lost(&mut self, link: LinkId, reason: &str) {
        if !self.peer.matches(link) {
            return;
        }
        match std::mem::take(&mut self.peer) {
            PeerSlot::Linked(peer) => info!(peer = peer.id, reason, "peer disconnected"),
            _ => debug!(reason, "peer candidate dropped"),
        }
        self.abandon_round_trips();
        self.schedule_retry();
    }

    /// In-flight round-trips cannot complete without the link. The waiting
    /// clients are never answered and have to time out on their own.
    fn abandon_round_trips(&mut self) {
        if !self.pending_access.is_empty() {
            warn!(count = self.pending_access.len(), "dropping unanswered movement registrations");
            self.pending_access.clear();
        }
        if let Some(pending) = self.pending_inspect.take() {
            warn!(session = pending.session, "dropping an unanswered inspect authorization");
        }
    }

    /// Write to the linked peer. Returns false when no link exists or the
    /// write fails, which tears the link down.
    pub(crate) async fn send_peer(&mut self, message: &PeerMsg) -> bool {
        let Some(peer) = self.peer.linked_mut() else { return false };
        let link = peer.link;
        match protocol::write_line(&mut peer.writer, message).await {
            Ok(()) => true,
            Err(error) => {
                warn!(%error, "failed to write to peer");
                self.on_peer_lost(link, "write failed");
                false
            }
        }
    }

    /// The peer announced it is leaving: acknowledge, clear the slot, and
    /// keep serving clients while renegotiation looks for a replacement.
    pub(crate) async fn peer_disconnect_requested(&mut self) {
        self.send_peer(&PeerMsg::Ok(OkCode::Disconnected)).await;
        if let Some(link) = self.peer.link() {
            self.on_peer_lost(link, "peer requested disconnect");
        }
    }

    fn schedule_retry(&mut self) {
        if self.holds_listener {
            return;
        }
        self.retry_at = Some(Instant::now() + self.retry_delay);
        self.retry_delay = (self.retry_delay * 2).min(RETRY_CAP);
    }

    async fn on_retry_timer(&mut self) {
        self.retry_at = None;
        if matches!(self.peer, PeerSlot::AwaitingHello { .. } | PeerSlot::AwaitingAccept { .. }) {
            warn!("peer handshake timed out");
            self.peer = PeerSlot::Empty;
            self.schedule_retry();
        } else if self.peer.is_empty() && !self.holds_listener {
            self.try_negotiation().await;
        }
    }

    async fn try_negotiation(&mut self) {
        match peer::negotiate(self.peer_port).await {
            Ok(Negotiation::Acceptor(listener)) => {
                info!("peer port reclaimed, accepting peer connections");
                self.holds_listener = true;
                self.tasks.push(spawn_peer_acceptor(listener, self.events.clone()));
            }
            Ok(Negotiation::Initiator(stream)) => self.start_initiator_handshake(stream).await,
            Ok(Negotiation::Standalone) => {
                debug!("peer port is unreachable, will retry");
                self.schedule_retry();
            }
            Err(error) => {
                warn!(%error, "peer negotiation failed");
                self.schedule_retry();
            }
        }
    }

    async fn start_initiator_handshake(&mut self, stream: TcpStream) {
        let link = self.alloc_link();
        let (read_half, mut write_half) = stream.into_split();
        if let Err(error) = protocol::write_line(&mut write_half, &PeerMsg::ConnPeer).await {
            debug!(%error, "peer went away before the handshake");
            self.schedule_retry();
            return;
        }
        spawn_peer_reader(BufReader::new(read_half), link, self.events.clone());
        self.peer = PeerSlot::AwaitingAccept { link, writer: write_half };
        self.retry_at = Some(Instant::now() + peer::HANDSHAKE_TIMEOUT);
    }

    async fn shutdown(&mut self, events: &mut mpsc::Receiver<Event>) {
        if self.peer.is_linked() {
            self.disconnect_peer(events).await;
        }
        for mut client in self.sessions.drain() {
            let _ = client.writer.shutdown().await;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("node stopped");
    }

    /// Tell the peer we are leaving and wait briefly for its `OK(01)`.
    async fn disconnect_peer(&mut self, events: &mut mpsc::Receiver<Event>) {
        let Some(peer) = self.peer.linked_mut() else { return };
        let id = peer.id;
        let link = peer.link;
        info!(peer = id, "disconnecting from peer");
        if !self.send_peer(&PeerMsg::DiscPeer { id }).await {
            return;
        }
        let deadline = Instant::now() + DISCONNECT_WAIT;
        loop {
            let Ok(maybe_event) = tokio::time::timeout_at(deadline, events.recv()).await else {
                warn!(peer = id, "no acknowledgement of the disconnect, leaving anyway");
                break;
            };
            match maybe_event {
                Some(Event::PeerLine { link: from, line }) if from == link => {
                    if matches!(PeerMsg::parse(&line), Ok(PeerMsg::Ok(OkCode::Disconnected))) {
                        info!(peer = id, "peer acknowledged the disconnect");
                        break;
                    }
                }
                Some(Event::PeerClosed { link: from }) if from == link => break,
                Some(_) => {} // late client traffic, discarded during shutdown
                None => break,
            }
        }
        self.peer = PeerSlot::Empty;
    }
}

/// Resolves when the operator types `kill` on the server console. EOF on
/// stdin parks forever so daemonized nodes keep running.
async fn console_kill() {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().eq_ignore_ascii_case("kill") => return,
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => std::future::pending::<()>().await,
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn spawn_client_acceptor(listener: TcpListener, events: mpsc::Sender<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if events.send(Event::ClientConnected(stream, addr)).await.is_err() {
                        break;
                    }
                }
                Err(error) => warn!(%error, "failed to accept a client connection"),
            }
        }
    })
}

fn spawn_peer_acceptor(listener: TcpListener, events: mpsc::Sender<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if events.send(Event::PeerInbound(stream, addr)).await.is_err() {
                        break;
                    }
                }
                Err(error) => warn!(%error, "failed to accept a peer connection"),
            }
        }
    })
}

fn spawn_client_reader(read_half: OwnedReadHalf, session: SessionId, events: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        loop {
            match protocol::read_line(&mut reader).await {
                Ok(Some(line)) => {
                    if events.send(Event::ClientLine { session, line }).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    debug!(session, %error, "client read failed");
                    break;
                }
            }
        }
        let _ = events.send(Event::ClientClosed { session }).await;
    });
}

fn spawn_peer_reader(
    mut reader: BufReader<OwnedReadHalf>,
    link: LinkId,
    events: mpsc::Sender<Event>,
) {
    tokio::spawn(async move {
        loop {
            match protocol::read_line(&mut reader).await {
                Ok(Some(line)) => {
                    if events.send(Event::PeerLine { link, line }).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    debug!(link, %error, "peer read failed");
                    break;
                }
            }
        }
        let _ = events.send(Event::PeerClosed { link }).await;
    });
}
