//! Peer link negotiation and handshake.
//!
//! Both nodes are started with the same well-known peer port. Whoever binds
//! it first becomes the acceptor and keeps listening for the lifetime of the
//! process; the other node finds the port in use, connects to it, and opens
//! the link with `REQ_CONNPEER()`. At most one link exists at a time, so the
//! acceptor refuses any further peer connection with `ERROR(01)`.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::protocol::{self, ErrorCode, PeerMsg};

/// How long either side of the handshake waits before giving up on it.
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Tag distinguishing peer connections across reconnects. Reader events
/// carry the tag of the connection they came from, so lines from a
/// torn-down link cannot be mistaken for the current one.
pub type LinkId = u64;

/// Outcome of racing a bind against a connect on the shared peer port.
pub enum Negotiation {
    /// We own the peer port and accept inbound peer connections.
    Acceptor(TcpListener),
    /// The port was taken; we connected to whoever holds it.
    Initiator(TcpStream),
    /// The port was taken but its owner refused the connection.
    Standalone,
}

/// Claim the peer port, or connect to the node that already holds it.
pub async fn negotiate(peer_port: u16) -> Result<Negotiation> {
    let addr = SocketAddr::from(([127, 0, 0, 1], peer_port));
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(Negotiation::Acceptor(listener)),
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            match TcpStream::connect(addr).await {
                Ok(stream) => Ok(Negotiation::Initiator(stream)),
                Err(_) => Ok(Negotiation::Standalone),
            }
        }
        Err(err) => Err(err).with_context(|| format!("failed to bind peer port {addr}")),
    }
}

/// Run the initiator side of the handshake on a fresh connection.
///
/// Returns the peer id the acceptor assigned, together with the stream
/// halves. The returned reader keeps its buffer: any line the acceptor
/// pipelined behind the handshake reply is still in it, so the link's
/// reader task must take over this reader rather than wrap the read half
/// anew.
pub async fn handshake_initiator(
    stream: TcpStream,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf, u32)> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    protocol::write_line(&mut write_half, &PeerMsg::ConnPeer)
        .await
        .context("failed to send the peer handshake")?;
    let line = timeout(HANDSHAKE_TIMEOUT, protocol::read_line(&mut reader))
        .await
        .map_err(|_| anyhow!("timed out waiting for the peer handshake reply"))?
        .context("failed to read the peer handshake reply")?
        .context("peer closed the connection during the handshake")?;
    match PeerMsg::parse(&line)? {
        PeerMsg::ConnPeerAccepted { id } => Ok((reader, write_half, id)),
        PeerMsg::Error(ErrorCode::PeerLimit) => {
            bail!("peer rejected the connection: peer limit exceeded")
        }
        other => bail!("unexpected handshake reply: {other:?}"),
    }
}

/// An established peer link.
#[derive(Debug)]
pub struct PeerLink {
    pub link: LinkId,
    /// Id assigned during the handshake, quoted in `REQ_DISCPEER`.
    pub id: u32,
    pub writer: OwnedWriteHalf,
}

/// Lifecycle of the single peer slot.
#[derive(Debug, Default)]
pub enum PeerSlot {
    /// No peer connection, not even a candidate.
    #[default]
    Empty,
    /// Inbound connection adopted, waiting for its `REQ_CONNPEER()`.
    AwaitingHello { link: LinkId, writer: OwnedWriteHalf },
    /// Outbound connection opened and `REQ_CONNPEER()` sent, waiting for
    /// `RES_CONNPEER`.
    AwaitingAccept { link: LinkId, writer: OwnedWriteHalf },
    /// Handshake complete; replication traffic flows.
    Linked(PeerLink),
}

impl PeerSlot {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn is_linked(&self) -> bool {
        matches!(self, Self::Linked(_))
    }

    pub fn linked_mut(&mut self) -> Option<&mut PeerLink> {
        match self {
            Self::Linked(link) => Some(link),
            _ => None,
        }
    }

    /// Link tag of the current occupant, if any.
    pub fn link(&self) -> Option<LinkId> {
        match self {
            Self::Empty => None,
            Self::AwaitingHello { link, .. } | Self::AwaitingAccept { link, .. } => Some(*link),
            Self::Linked(peer) => Some(peer.link),
        }
    }

    pub fn matches(&self, link: LinkId) -> bool {
        self.link() == Some(link)
    }
}
