//! Interactive console client for the directory pair.
//!
//! Connects to both services, declares its location context on each, and
//! turns console commands into protocol requests. Every request expects
//! exactly one response line; a server that stalls is reported after a
//! timeout instead of hanging the console.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::warn;

use crate::cli::ClientArgs;
use crate::protocol::{self, parse_direction, parse_flag, Direction, Request, Response, Uid};

/// How long to wait for a response before declaring the server stalled.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect to both services and serve the console until `kill`, EOF, or
/// Ctrl-C.
pub async fn run(args: ClientArgs) -> Result<()> {
    let mut user = ServerConn::connect("user service", args.user_server).await?;
    let mut location = ServerConn::connect("location service", args.location_server).await?;

    declare_location(&mut user, args.location).await?;
    declare_location(&mut location, args.location).await?;

    let mut console = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    loop {
        input.clear();
        tokio::select! {
            bytes_read = console.read_line(&mut input) => {
                if !handle_console_line(bytes_read, &input, &mut user, &mut location).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(%error, "failed to listen for the ctrl-c signal");
                }
                disconnect(&mut user, &mut location).await;
                break;
            }
        }
    }

    let _ = user.writer.shutdown().await;
    let _ = location.writer.shutdown().await;
    Ok(())
}

/// Returns false once the console session should end.
async fn handle_console_line(
    bytes_read: io::Result<usize>,
    input: &str,
    user: &mut ServerConn,
    location: &mut ServerConn,
) -> Result<bool> {
    if bytes_read.context("failed to read from the console")? == 0 {
        disconnect(user, location).await;
        return Ok(false);
    }
    let line = input.trim();
    if line.is_empty() {
        return Ok(true);
    }
    let command = match ConsoleCommand::parse(line) {
        Ok(command) => command,
        Err(error) => {
            write_stdout(&format!("error: {error}")).await?;
            return Ok(true);
        }
    };
    match command {
        ConsoleCommand::Add { uid, special } => relay(user, &Request::UsrAdd { uid, special }).await?,
        ConsoleCommand::Access { uid, direction } => {
            relay(user, &Request::UsrAccess { uid, direction }).await?
        }
        ConsoleCommand::Find { uid } => relay(location, &Request::UsrLoc { uid }).await?,
        ConsoleCommand::Inspect { uid, location: loc } => {
            relay(location, &Request::LocList { uid, location: loc }).await?
        }
        ConsoleCommand::Help => print_help().await?,
        ConsoleCommand::Kill => {
            disconnect(user, location).await;
            return Ok(false);
        }
    }
    Ok(true)
}

async fn relay(server: &mut ServerConn, request: &Request) -> Result<()> {
    match server.request(request).await? {
        Some(line) => write_stdout(&render(&line)).await?,
        None => {
            write_stdout(&format!("no response from the {} yet, giving up on this request", server.name))
                .await?
        }
    }
    Ok(())
}

async fn disconnect(user: &mut ServerConn, location: &mut ServerConn) {
    farewell(user).await;
    farewell(location).await;
}

async fn farewell(server: &mut ServerConn) {
    match server.request(&Request::Disc).await {
        Ok(Some(line)) => {
            let _ = write_stdout(&render(&line)).await;
        }
        Ok(None) => {
            let _ = write_stdout(&format!("no disconnect acknowledgement from the {}", server.name)).await;
        }
        Err(error) => warn!(server = server.name, %error, "disconnect failed"),
    }
}

struct ServerConn {
    name: &'static str,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Replies still owed for requests that timed out. Discarded before the
    /// next answer is read, so a late reply is never mistaken for it.
    overdue: usize,
}

impl ServerConn {
    async fn connect(name: &'static str, addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to the {name} at {addr}"))?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self { name, reader: BufReader::new(read_half), writer: write_half, overdue: 0 })
    }

    /// Send one request and wait for one response line; `None` on timeout.
    async fn request(&mut self, request: &Request) -> Result<Option<String>> {
        protocol::write_line(&mut self.writer, request)
            .await
            .with_context(|| format!("failed to send to the {}", self.name))?;
        loop {
            match timeout(REPLY_TIMEOUT, protocol::read_line(&mut self.reader)).await {
                Err(_) => {
                    self.overdue += 1;
                    return Ok(None);
                }
                Ok(Ok(Some(line))) => {
                    if self.overdue > 0 {
                        self.overdue -= 1;
                        continue;
                    }
                    return Ok(Some(line));
                }
                Ok(Ok(None)) => bail!("the {} closed the connection", self.name),
                Ok(Err(error)) => {
                    return Err(error)
                        .with_context(|| format!("failed to read from the {}", self.name))
                }
            }
        }
    }
}

async fn declare_location(server: &mut ServerConn, location: i32) -> Result<()> {
    let reply = server
        .request(&Request::Conn { location })
        .await?
        .with_context(|| format!("the {} did not answer the location declaration", server.name))?;
    match Response::parse(&reply) {
        Ok(Response::Conn { id }) => {
            write_stdout(&format!("{} session id: {id}", server.name)).await?;
            Ok(())
        }
        Ok(Response::Error(code)) => {
            bail!("the {} refused the connection: {}", server.name, code.describe())
        }
        _ => bail!("unexpected reply from the {}: {reply}", server.name),
    }
}

/// Turn a raw response line into console wording; unknown lines pass
/// through untouched.
fn render(line: &str) -> String {
    match Response::parse(line) {
        Ok(Response::Conn { id }) => format!("session id: {id}"),
        Ok(Response::Disconnected) => "successful disconnect".to_string(),
        Ok(Response::Created { uid }) => format!("new user added: {uid}"),
        Ok(Response::Updated { uid }) => format!("user updated: {uid}"),
        Ok(Response::UsrAccess { old }) => format!("last location: {old}"),
        Ok(Response::UsrLoc { location }) => format!("current location: {location}"),
        Ok(Response::LocList { uids }) if uids.is_empty() => "no users at that location".to_string(),
        Ok(Response::LocList { uids }) => format!(
            "users at that location: {}",
            uids.iter().map(Uid::as_str).collect::<Vec<_>>().join(", ")
        ),
        Ok(Response::Error(code)) => code.describe().to_string(),
        Ok(Response::Malformed) | Ok(Response::Unsupported) | Err(_) => line.to_string(),
    }
}

/// Commands accepted at the console.
#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand {
    Add { uid: Uid, special: bool },
    Access { uid: Uid, direction: Direction },
    Find { uid: Uid },
    Inspect { uid: Uid, location: i32 },
    Help,
    Kill,
}

impl ConsoleCommand {
    fn parse(line: &str) -> Result<Self> {
        let mut tokens = line.split_whitespace();
        let verb = tokens.next().context("empty command")?.to_ascii_lowercase();
        let args: Vec<&str> = tokens.collect();
        match (verb.as_str(), args.as_slice()) {
            ("add", [uid, flag]) => Ok(Self::Add {
                uid: Uid::parse(uid)?,
                special: parse_flag(flag)?,
            }),
            ("access", [uid, direction]) => Ok(Self::Access {
                uid: Uid::parse(uid)?,
                direction: parse_direction(&direction.to_ascii_lowercase())?,
            }),
            ("find", [uid]) => Ok(Self::Find { uid: Uid::parse(uid)? }),
            ("inspect", [uid, location]) => Ok(Self::Inspect {
                uid: Uid::parse(uid)?,
                location: location.parse().context("location must be an integer")?,
            }),
            ("help", []) => Ok(Self::Help),
            ("kill", []) => Ok(Self::Kill),
            _ => bail!("unknown command, type help for the list"),
        }
    }
}

async fn print_help() -> io::Result<()> {
    write_stdout("commands:").await?;
    write_stdout("  add <uid> <0|1>        register a user, or update its special flag").await?;
    write_stdout("  access <uid> <in|out>  report a movement at this client's location").await?;
    write_stdout("  find <uid>             look up a user's current location").await?;
    write_stdout("  inspect <uid> <loc>    list users at a location (uid needs the special flag)").await?;
    write_stdout("  help                   show this listing").await?;
    write_stdout("  kill                   disconnect from both services and exit").await?;
    Ok(())
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
