//! Integration tests driving in-process nodes over real sockets.
//!
//! Each test gets its own peer port so the suites can run in parallel;
//! client listeners always bind port 0. A `FakePeer` stands in for the
//! other node where a test needs to hold a round-trip open or drop the
//! link at an awkward moment.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use locdir::node::{Node, NodeConfig, Role};
use locdir::protocol::{self, Direction, PeerMsg, Request, Uid};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

fn uid(raw: &str) -> Uid {
    Uid::parse(raw).unwrap()
}

struct TestNode {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl TestNode {
    async fn spawn(role: Role, peer_port: u16) -> Result<Self> {
        Self::spawn_with(role, peer_port, 10, 30).await
    }

    async fn spawn_with(role: Role, peer_port: u16, max_clients: usize, max_users: usize) -> Result<Self> {
        let node = Node::bind(NodeConfig {
            role,
            peer_port,
            listen: "127.0.0.1:0".parse()?,
            max_clients,
            max_users,
        })
        .await?;
        let addr = node.client_addr()?;
        let (shutdown, release) = oneshot::channel();
        let task = tokio::spawn(node.run_until(async move {
            let _ = release.await;
        }));
        Ok(Self { addr, shutdown: Some(shutdown), task })
    }

    async fn stop(mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        timeout(Duration::from_secs(3), self.task)
            .await
            .context("node did not stop in time")?
            .context("node task panicked")?
    }
}

/// The user node first so it claims the peer port, then the location node
/// connecting to it. `Node::bind` only returns once its handshake is done,
/// so the pair is linked by the time this returns.
async fn spawn_pair(peer_port: u16) -> Result<(TestNode, TestNode)> {
    let user = TestNode::spawn(Role::User, peer_port).await?;
    let location = TestNode::spawn(Role::Location, peer_port).await?;
    Ok((user, location))
}

struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self { reader: BufReader::new(read_half), writer: write_half })
    }

    async fn send(&mut self, request: &Request) -> Result<()> {
        protocol::write_line(&mut self.writer, request).await?;
        Ok(())
    }

    async fn send_raw(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<String> {
        match timeout(READ_TIMEOUT, protocol::read_line(&mut self.reader)).await {
            Err(_) => bail!("timed out waiting for a response"),
            Ok(Ok(Some(line))) => Ok(line),
            Ok(Ok(None)) => bail!("server closed the connection"),
            Ok(Err(error)) => Err(error.into()),
        }
    }

    async fn request(&mut self, request: &Request) -> Result<String> {
        self.send(request).await?;
        self.recv().await
    }

    async fn expect_closed(&mut self) -> Result<()> {
        match timeout(READ_TIMEOUT, protocol::read_line(&mut self.reader)).await {
            Ok(Ok(None)) => Ok(()),
            Ok(Ok(Some(line))) => bail!("expected the connection to close, got: {line}"),
            Ok(Err(_)) => Ok(()), // a reset counts as closed
            Err(_) => bail!("timed out waiting for the connection to close"),
        }
    }

    async fn expect_silence(&mut self, wait: Duration) -> Result<()> {
        match timeout(wait, protocol::read_line(&mut self.reader)).await {
            Err(_) => Ok(()),
            Ok(Ok(Some(line))) => bail!("expected no response, got: {line}"),
            Ok(Ok(None)) => bail!("expected an open, silent connection, but it closed"),
            Ok(Err(error)) => Err(error.into()),
        }
    }
}

/// Stands in for the missing half of the pair on the peer port.
struct FakePeer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl FakePeer {
    async fn connect(peer_port: u16) -> Result<Self> {
        let stream = TcpStream::connect(("127.0.0.1", peer_port)).await?;
        let (read_half, write_half) = stream.into_split();
        let mut peer = Self { reader: BufReader::new(read_half), writer: write_half };
        peer.send(&PeerMsg::ConnPeer).await?;
        let line = peer.recv().await?;
        match PeerMsg::parse(&line)? {
            PeerMsg::ConnPeerAccepted { .. } => Ok(peer),
            other => bail!("handshake failed: {other:?}"),
        }
    }

    async fn send(&mut self, message: &PeerMsg) -> Result<()> {
        protocol::write_line(&mut self.writer, message).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<String> {
        match timeout(READ_TIMEOUT, protocol::read_line(&mut self.reader)).await {
            Err(_) => bail!("timed out waiting for peer traffic"),
            Ok(Ok(Some(line))) => Ok(line),
            Ok(Ok(None)) => bail!("node closed the peer connection"),
            Ok(Err(error)) => Err(error.into()),
        }
    }
}

#[tokio::test]
async fn usradd_creates_then_updates() -> Result<()> {
    let (user, location) = spawn_pair(47110).await?;

    let mut client = TestClient::connect(user.addr).await?;
    assert_eq!(
        client.request(&Request::UsrAdd { uid: uid("2021808080"), special: true }).await?,
        "OK(02) 2021808080"
    );
    assert_eq!(
        client.request(&Request::UsrAdd { uid: uid("2021808080"), special: false }).await?,
        "OK(03) 2021808080"
    );

    location.stop().await?;
    user.stop().await
}

#[tokio::test]
async fn movement_roundtrip_records_location() -> Result<()> {
    let (user, location) = spawn_pair(47120).await?;

    let mut reporter = TestClient::connect(user.addr).await?;
    assert_eq!(reporter.request(&Request::Conn { location: 7 }).await?, "RES_CONN(1)");
    assert_eq!(
        reporter.request(&Request::UsrAdd { uid: uid("2021808080"), special: false }).await?,
        "OK(02) 2021808080"
    );
    assert_eq!(
        reporter
            .request(&Request::UsrAccess { uid: uid("2021808080"), direction: Direction::In })
            .await?,
        "RES_USRACCESS(-1)"
    );

    let mut watcher = TestClient::connect(location.addr).await?;
    assert_eq!(
        watcher.request(&Request::UsrLoc { uid: uid("2021808080") }).await?,
        "RES_USRLOC(7)"
    );

    // A later movement reports the previous location back.
    assert_eq!(
        reporter
            .request(&Request::UsrAccess { uid: uid("2021808080"), direction: Direction::In })
            .await?,
        "RES_USRACCESS(7)"
    );

    location.stop().await?;
    user.stop().await
}

#[tokio::test]
async fn movement_for_unknown_user_is_refused() -> Result<()> {
    let (user, location) = spawn_pair(47130).await?;

    let mut client = TestClient::connect(user.addr).await?;
    assert_eq!(
        client
            .request(&Request::UsrAccess { uid: uid("2021808099"), direction: Direction::In })
            .await?,
        "ERROR(18)"
    );

    location.stop().await?;
    user.stop().await
}

#[tokio::test]
async fn movement_out_is_idempotent() -> Result<()> {
    let (user, location) = spawn_pair(47140).await?;

    let mut reporter = TestClient::connect(user.addr).await?;
    reporter.request(&Request::Conn { location: 4 }).await?;
    reporter.request(&Request::UsrAdd { uid: uid("2021808080"), special: false }).await?;
    assert_eq!(
        reporter
            .request(&Request::UsrAccess { uid: uid("2021808080"), direction: Direction::In })
            .await?,
        "RES_USRACCESS(-1)"
    );
    assert_eq!(
        reporter
            .request(&Request::UsrAccess { uid: uid("2021808080"), direction: Direction::Out })
            .await?,
        "RES_USRACCESS(4)"
    );
    assert_eq!(
        reporter
            .request(&Request::UsrAccess { uid: uid("2021808080"), direction: Direction::Out })
            .await?,
        "RES_USRACCESS(-1)"
    );

    // A user who left everywhere has no findable location.
    let mut watcher = TestClient::connect(location.addr).await?;
    assert_eq!(watcher.request(&Request::UsrLoc { uid: uid("2021808080") }).await?, "ERROR(18)");

    location.stop().await?;
    user.stop().await
}

#[tokio::test]
async fn inspect_is_permission_gated() -> Result<()> {
    let (user, location) = spawn_pair(47150).await?;

    let mut admin = TestClient::connect(user.addr).await?;
    admin.request(&Request::UsrAdd { uid: uid("2021808080"), special: true }).await?;
    admin.request(&Request::UsrAdd { uid: uid("2021808081"), special: false }).await?;

    let mut reporter = TestClient::connect(user.addr).await?;
    reporter.request(&Request::Conn { location: 3 }).await?;
    reporter.request(&Request::UsrAccess { uid: uid("2021808081"), direction: Direction::In }).await?;

    let mut inspector = TestClient::connect(location.addr).await?;
    assert_eq!(
        inspector.request(&Request::LocList { uid: uid("2021808081"), location: 3 }).await?,
        "ERROR(19)"
    );
    assert_eq!(
        inspector.request(&Request::LocList { uid: uid("2021808080"), location: 3 }).await?,
        "RES_LOCLIST 2021808081"
    );
    assert_eq!(
        inspector.request(&Request::LocList { uid: uid("2021808080"), location: 9 }).await?,
        "RES_LOCLIST EMPTY"
    );

    location.stop().await?;
    user.stop().await
}

#[tokio::test]
async fn second_inspect_is_refused_while_one_is_pending() -> Result<()> {
    let location = TestNode::spawn(Role::Location, 47160).await?;
    let mut user_stub = FakePeer::connect(47160).await?;

    let mut first = TestClient::connect(location.addr).await?;
    first.send(&Request::LocList { uid: uid("2021808080"), location: 5 }).await?;
    assert_eq!(user_stub.recv().await?, "REQ_USRAUTH 2021808080");

    let mut second = TestClient::connect(location.addr).await?;
    assert_eq!(
        second.request(&Request::LocList { uid: uid("2021808081"), location: 5 }).await?,
        "ERROR(19)"
    );

    // The authorization finally lands and the parked inspect completes.
    user_stub.send(&PeerMsg::UsrAuthReply { special: true }).await?;
    assert_eq!(first.recv().await?, "RES_LOCLIST EMPTY");

    location.stop().await
}

#[tokio::test]
async fn standalone_user_node_degrades_movement() -> Result<()> {
    let user = TestNode::spawn(Role::User, 47170).await?;

    let mut client = TestClient::connect(user.addr).await?;
    client.request(&Request::Conn { location: 2 }).await?;
    client.request(&Request::UsrAdd { uid: uid("2021808080"), special: false }).await?;
    assert_eq!(
        client
            .request(&Request::UsrAccess { uid: uid("2021808080"), direction: Direction::In })
            .await?,
        "RES_USRACCESS(-1)"
    );

    user.stop().await
}

#[tokio::test]
async fn standalone_location_node_refuses_inspect() -> Result<()> {
    let location = TestNode::spawn(Role::Location, 47180).await?;

    let mut client = TestClient::connect(location.addr).await?;
    assert_eq!(
        client.request(&Request::LocList { uid: uid("2021808080"), location: 1 }).await?,
        "ERROR(19)"
    );
    assert_eq!(client.request(&Request::UsrLoc { uid: uid("2021808080") }).await?, "ERROR(18)");

    location.stop().await
}

#[tokio::test]
async fn peer_death_mid_flight_leaves_the_client_unanswered() -> Result<()> {
    let user = TestNode::spawn(Role::User, 47190).await?;
    let mut location_stub = FakePeer::connect(47190).await?;

    let mut client = TestClient::connect(user.addr).await?;
    client.request(&Request::Conn { location: 6 }).await?;
    client.request(&Request::UsrAdd { uid: uid("2021808080"), special: false }).await?;
    client.send(&Request::UsrAccess { uid: uid("2021808080"), direction: Direction::In }).await?;
    assert_eq!(location_stub.recv().await?, "REQ_LOCREG 2021808080 6");

    // Kill the peer before it answers; the waiting client hears nothing.
    drop(location_stub);
    client.expect_silence(Duration::from_millis(700)).await?;

    // The node noticed the loss, so movement now degrades instead of parking.
    assert_eq!(
        client
            .request(&Request::UsrAccess { uid: uid("2021808080"), direction: Direction::In })
            .await?,
        "RES_USRACCESS(-1)"
    );

    user.stop().await
}

#[tokio::test]
async fn extra_peer_connections_are_rejected() -> Result<()> {
    let (user, location) = spawn_pair(47200).await?;

    let stream = TcpStream::connect(("127.0.0.1", 47200)).await?;
    let (read_half, _write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let line = timeout(READ_TIMEOUT, protocol::read_line(&mut reader))
        .await
        .context("no rejection arrived")??
        .context("connection closed before the rejection")?;
    assert_eq!(line, "ERROR(01)");
    assert!(timeout(READ_TIMEOUT, protocol::read_line(&mut reader)).await??.is_none());

    location.stop().await?;
    user.stop().await
}

#[tokio::test]
async fn client_capacity_is_enforced() -> Result<()> {
    let user = TestNode::spawn_with(Role::User, 47210, 2, 30).await?;

    let mut one = TestClient::connect(user.addr).await?;
    assert_eq!(one.request(&Request::Conn { location: 1 }).await?, "RES_CONN(1)");
    let mut two = TestClient::connect(user.addr).await?;
    assert_eq!(two.request(&Request::Conn { location: 1 }).await?, "RES_CONN(2)");

    let mut three = TestClient::connect(user.addr).await?;
    assert_eq!(three.recv().await?, "ERROR(09)");
    three.expect_closed().await?;

    // Departing clients free capacity, but ids are never reused.
    assert_eq!(one.request(&Request::Disc).await?, "OK(01)");
    one.expect_closed().await?;
    let mut four = TestClient::connect(user.addr).await?;
    assert_eq!(four.request(&Request::Conn { location: 1 }).await?, "RES_CONN(3)");

    user.stop().await
}

#[tokio::test]
async fn user_capacity_is_enforced_but_updates_pass() -> Result<()> {
    let user = TestNode::spawn_with(Role::User, 47220, 10, 1).await?;

    let mut client = TestClient::connect(user.addr).await?;
    assert_eq!(
        client.request(&Request::UsrAdd { uid: uid("2021808080"), special: false }).await?,
        "OK(02) 2021808080"
    );
    assert_eq!(
        client.request(&Request::UsrAdd { uid: uid("2021808081"), special: false }).await?,
        "ERROR(17)"
    );
    assert_eq!(
        client.request(&Request::UsrAdd { uid: uid("2021808080"), special: true }).await?,
        "OK(03) 2021808080"
    );

    user.stop().await
}

#[tokio::test]
async fn malformed_and_misrouted_requests_are_answered() -> Result<()> {
    let user = TestNode::spawn(Role::User, 47230).await?;

    let mut client = TestClient::connect(user.addr).await?;
    client.send_raw("REQ_USRADD short 1").await?;
    assert_eq!(client.recv().await?, "ERROR Invalid message format");
    client.send_raw("REQ_BOGUS 1 2 3").await?;
    assert_eq!(client.recv().await?, "ERROR Invalid message format");
    client.send(&Request::UsrLoc { uid: uid("2021808080") }).await?;
    assert_eq!(client.recv().await?, "ERROR Unknown request");

    // The session survives its mistakes.
    assert_eq!(
        client.request(&Request::UsrAdd { uid: uid("2021808080"), special: true }).await?,
        "OK(02) 2021808080"
    );

    user.stop().await
}

#[tokio::test]
async fn multiple_requests_in_one_segment_are_split() -> Result<()> {
    let user = TestNode::spawn(Role::User, 47240).await?;

    let mut client = TestClient::connect(user.addr).await?;
    client.send_raw("REQ_CONN(2)\nREQ_USRADD 2021808080 1").await?;
    assert_eq!(client.recv().await?, "RES_CONN(1)");
    assert_eq!(client.recv().await?, "OK(02) 2021808080");

    user.stop().await
}

#[tokio::test]
async fn pair_reforms_after_the_acceptor_leaves() -> Result<()> {
    let peer_port = 47250;
    let (user, location) = spawn_pair(peer_port).await?;

    let mut reporter = TestClient::connect(user.addr).await?;
    reporter.request(&Request::Conn { location: 2 }).await?;
    reporter.request(&Request::UsrAdd { uid: uid("2021808080"), special: false }).await?;
    assert_eq!(
        reporter
            .request(&Request::UsrAccess { uid: uid("2021808080"), direction: Direction::In })
            .await?,
        "RES_USRACCESS(-1)"
    );

    user.stop().await?;
    drop(reporter);

    // The survivor renegotiates the freed port; a fresh user node joins it
    // from either side of the race.
    let user = TestNode::spawn(Role::User, peer_port).await?;
    let mut reporter = TestClient::connect(user.addr).await?;
    reporter.request(&Request::Conn { location: 9 }).await?;
    reporter.request(&Request::UsrAdd { uid: uid("2021808080"), special: false }).await?;

    let deadline = Instant::now() + Duration::from_secs(8);
    loop {
        let line = reporter
            .request(&Request::UsrAccess { uid: uid("2021808080"), direction: Direction::In })
            .await?;
        if line != "RES_USRACCESS(-1)" {
            // The location node kept its board across the re-pairing.
            assert_eq!(line, "RES_USRACCESS(2)");
            break;
        }
        anyhow::ensure!(Instant::now() < deadline, "the pair did not re-form in time");
        sleep(Duration::from_millis(250)).await;
    }

    location.stop().await?;
    user.stop().await
}

#[tokio::test]
async fn lines_pipelined_behind_the_handshake_reply_are_kept() -> Result<()> {
    let peer_port = 47270;
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", peer_port)).await?;
    let joining = tokio::spawn(TestNode::spawn(Role::User, peer_port));

    let (stream, _) = listener.accept().await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let hello = timeout(READ_TIMEOUT, protocol::read_line(&mut reader))
        .await
        .context("no handshake arrived")??
        .context("connection closed before the handshake")?;
    assert_eq!(hello, "REQ_CONNPEER()");

    // Answer the handshake and a round-trip request in one segment; the
    // request must survive the node's hand-off to its link reader.
    write_half.write_all(b"RES_CONNPEER(1)\nREQ_USRAUTH 2021808080\n").await?;
    write_half.flush().await?;
    let answer = timeout(READ_TIMEOUT, protocol::read_line(&mut reader))
        .await
        .context("the pipelined request went unanswered")??
        .context("connection closed before the authorization reply")?;
    assert_eq!(answer, "RES_USRAUTH(0)");

    let user = joining.await??;
    user.stop().await
}

#[tokio::test]
async fn crossed_movement_replies_follow_the_last_waiter() -> Result<()> {
    let user = TestNode::spawn(Role::User, 47260).await?;
    let mut location_stub = FakePeer::connect(47260).await?;

    let mut first = TestClient::connect(user.addr).await?;
    first.request(&Request::Conn { location: 1 }).await?;
    first.request(&Request::UsrAdd { uid: uid("2021808080"), special: false }).await?;
    let mut second = TestClient::connect(user.addr).await?;
    second.request(&Request::Conn { location: 2 }).await?;

    first.send(&Request::UsrAccess { uid: uid("2021808080"), direction: Direction::In }).await?;
    assert_eq!(location_stub.recv().await?, "REQ_LOCREG 2021808080 1");
    second.send(&Request::UsrAccess { uid: uid("2021808080"), direction: Direction::In }).await?;
    assert_eq!(location_stub.recv().await?, "REQ_LOCREG 2021808080 2");

    // Movement replies correlate by uid alone, so the second request took
    // over the wait slot: the first reply wakes it, the second is orphaned.
    location_stub.send(&PeerMsg::LocRegReply { uid: uid("2021808080"), old: -1 }).await?;
    assert_eq!(second.recv().await?, "RES_USRACCESS(-1)");
    location_stub.send(&PeerMsg::LocRegReply { uid: uid("2021808080"), old: 1 }).await?;
    first.expect_silence(Duration::from_millis(500)).await?;

    user.stop().await
}
