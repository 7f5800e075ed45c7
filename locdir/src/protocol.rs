//! Wire messages for the directory pair.
//!
//! Every channel speaks newline-terminated ASCII lines. Clients use the
//! `REQ_*`/`RES_*` verbs in [`Request`] and [`Response`]; the link between
//! the two nodes has its own verb set in [`PeerMsg`] covering the handshake
//! and the two cross-node round-trips. Status codes are a closed set carried
//! as `OK(nn)` and `ERROR(nn)` with two-digit numbers.
//!
//! A single TCP read may carry several lines or a fraction of one, so
//! [`read_line`] buffers and splits before anything is parsed.

use std::fmt;
use std::io;

use anyhow::{bail, ensure, Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

const MALFORMED_LINE: &str = "ERROR Invalid message format";
const UNSUPPORTED_LINE: &str = "ERROR Unknown request";

/// A user identifier: exactly ten printable ASCII characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(String);

impl Uid {
    pub const LEN: usize = 10;

    pub fn parse(raw: &str) -> Result<Self> {
        ensure!(
            raw.len() == Self::LEN && raw.chars().all(|c| c.is_ascii_graphic()),
            "uid must be exactly {} printable characters",
            Self::LEN
        );
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Movement direction reported through `REQ_USRACCESS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::In => f.write_str("in"),
            Self::Out => f.write_str("out"),
        }
    }
}

/// The closed set of numeric error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    PeerLimit,
    ClientLimit,
    ClientNotFound,
    UserLimit,
    UserNotFound,
    PermissionDenied,
}

impl ErrorCode {
    pub fn number(self) -> u8 {
        match self {
            Self::PeerLimit => 1,
            Self::ClientLimit => 9,
            Self::ClientNotFound => 10,
            Self::UserLimit => 17,
            Self::UserNotFound => 18,
            Self::PermissionDenied => 19,
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(Self::PeerLimit),
            9 => Some(Self::ClientLimit),
            10 => Some(Self::ClientNotFound),
            17 => Some(Self::UserLimit),
            18 => Some(Self::UserNotFound),
            19 => Some(Self::PermissionDenied),
            _ => None,
        }
    }

    /// Wording shown by the interactive client.
    pub fn describe(self) -> &'static str {
        match self {
            Self::PeerLimit => "peer limit exceeded",
            Self::ClientLimit => "client limit exceeded",
            Self::ClientNotFound => "client not found",
            Self::UserLimit => "user limit exceeded",
            Self::UserNotFound => "user not found",
            Self::PermissionDenied => "permission denied",
        }
    }
}

/// The closed set of numeric success codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OkCode {
    Disconnected,
    Created,
    Updated,
}

impl OkCode {
    pub fn number(self) -> u8 {
        match self {
            Self::Disconnected => 1,
            Self::Created => 2,
            Self::Updated => 3,
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(Self::Disconnected),
            2 => Some(Self::Created),
            3 => Some(Self::Updated),
            _ => None,
        }
    }
}

/// A request a client sends to either node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `REQ_CONN(<loc>)`: declare the location this client reports from.
    Conn { location: i32 },
    /// `REQ_USRADD <uid> <0|1>`: register a user or update its flag.
    UsrAdd { uid: Uid, special: bool },
    /// `REQ_USRACCESS <uid> <in|out>`: report a movement.
    UsrAccess { uid: Uid, direction: Direction },
    /// `REQ_USRLOC <uid>`: look up a user's current location.
    UsrLoc { uid: Uid },
    /// `REQ_LOCLIST <uid> <loc>`: list users at a location, gated on `uid`'s flag.
    LocList { uid: Uid, location: i32 },
    /// `REQ_DISC`: end this client session.
    Disc,
}

impl Request {
    pub fn parse(line: &str) -> Result<Self> {
        let mut tokens = line.split_whitespace();
        let verb = tokens.next().context("empty request line")?;
        let args: Vec<&str> = tokens.collect();

        if let Some(arg) = paren_arg(verb, "REQ_CONN") {
            ensure!(args.is_empty(), "REQ_CONN takes no further arguments");
            let location = arg.parse().context("REQ_CONN location must be an integer")?;
            return Ok(Self::Conn { location });
        }

        match (verb, args.as_slice()) {
            ("REQ_USRADD", [uid, flag]) => Ok(Self::UsrAdd {
                uid: Uid::parse(uid)?,
                special: parse_flag(flag)?,
            }),
            ("REQ_USRACCESS", [uid, direction]) => Ok(Self::UsrAccess {
                uid: Uid::parse(uid)?,
                direction: parse_direction(direction)?,
            }),
            ("REQ_USRLOC", [uid]) => Ok(Self::UsrLoc { uid: Uid::parse(uid)? }),
            ("REQ_LOCLIST", [uid, location]) => Ok(Self::LocList {
                uid: Uid::parse(uid)?,
                location: location.parse().context("REQ_LOCLIST location must be an integer")?,
            }),
            ("REQ_DISC", []) => Ok(Self::Disc),
            _ => bail!("unrecognized request: {line}"),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conn { location } => write!(f, "REQ_CONN({location})"),
            Self::UsrAdd { uid, special } => write!(f, "REQ_USRADD {uid} {}", u8::from(*special)),
            Self::UsrAccess { uid, direction } => write!(f, "REQ_USRACCESS {uid} {direction}"),
            Self::UsrLoc { uid } => write!(f, "REQ_USRLOC {uid}"),
            Self::LocList { uid, location } => write!(f, "REQ_LOCLIST {uid} {location}"),
            Self::Disc => f.write_str("REQ_DISC"),
        }
    }
}

/// A reply a node sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `RES_CONN(<id>)`: the session id assigned to this client.
    Conn { id: u64 },
    /// `OK(01)`: the session was closed on request.
    Disconnected,
    /// `OK(02) <uid>`: a new user was registered.
    Created { uid: Uid },
    /// `OK(03) <uid>`: an existing user's flag was updated.
    Updated { uid: Uid },
    /// `RES_USRACCESS(<loc>)`: the location the user was at before this movement.
    UsrAccess { old: i32 },
    /// `RES_USRLOC(<loc>)`: where the user currently is.
    UsrLoc { location: i32 },
    /// `RES_LOCLIST <uids|EMPTY>`: who is at the requested location.
    LocList { uids: Vec<Uid> },
    /// `ERROR(<nn>)`: one of the numeric error codes.
    Error(ErrorCode),
    /// Textual rejection of a line that did not parse.
    Malformed,
    /// Textual rejection of a verb the other role serves.
    Unsupported,
}

impl Response {
    pub fn parse(line: &str) -> Result<Self> {
        if line == MALFORMED_LINE {
            return Ok(Self::Malformed);
        }
        if line == UNSUPPORTED_LINE {
            return Ok(Self::Unsupported);
        }

        let mut tokens = line.split_whitespace();
        let head = tokens.next().context("empty response line")?;
        let args: Vec<&str> = tokens.collect();

        if let Some(arg) = paren_arg(head, "RES_CONN") {
            ensure!(args.is_empty(), "RES_CONN takes no further arguments");
            let id = arg.parse::<u64>().context("RES_CONN id must be an integer")?;
            return Ok(Self::Conn { id });
        }
        if let Some(arg) = paren_arg(head, "RES_USRACCESS") {
            ensure!(args.is_empty(), "RES_USRACCESS takes no further arguments");
            let old = arg.parse::<i32>().context("RES_USRACCESS location must be an integer")?;
            return Ok(Self::UsrAccess { old });
        }
        if let Some(arg) = paren_arg(head, "RES_USRLOC") {
            ensure!(args.is_empty(), "RES_USRLOC takes no further arguments");
            let location = arg.parse::<i32>().context("RES_USRLOC location must be an integer")?;
            return Ok(Self::UsrLoc { location });
        }
        if let Some(arg) = paren_arg(head, "OK") {
            let number = arg.parse::<u8>().context("OK code must be a number")?;
            let code = OkCode::from_number(number).context("unknown success code")?;
            return match (code, args.as_slice()) {
                (OkCode::Disconnected, []) => Ok(Self::Disconnected),
                (OkCode::Created, [uid]) => Ok(Self::Created { uid: Uid::parse(uid)? }),
                (OkCode::Updated, [uid]) => Ok(Self::Updated { uid: Uid::parse(uid)? }),
                _ => bail!("malformed success response: {line}"),
            };
        }
        if let Some(arg) = paren_arg(head, "ERROR") {
            ensure!(args.is_empty(), "ERROR takes no further arguments");
            let number = arg.parse::<u8>().context("ERROR code must be a number")?;
            let code = ErrorCode::from_number(number).context("unknown error code")?;
            return Ok(Self::Error(code));
        }
        if head == "RES_LOCLIST" {
            let rest = line
                .trim_start()
                .strip_prefix("RES_LOCLIST")
                .unwrap_or_default()
                .trim();
            if rest == "EMPTY" {
                return Ok(Self::LocList { uids: Vec::new() });
            }
            ensure!(!rest.is_empty(), "RES_LOCLIST requires a uid list or EMPTY");
            let uids = rest
                .split(',')
                .map(|part| Uid::parse(part.trim()))
                .collect::<Result<Vec<_>>>()?;
            return Ok(Self::LocList { uids });
        }
        bail!("unrecognized response: {line}")
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conn { id } => write!(f, "RES_CONN({id})"),
            Self::Disconnected => write!(f, "OK({:02})", OkCode::Disconnected.number()),
            Self::Created { uid } => write!(f, "OK({:02}) {uid}", OkCode::Created.number()),
            Self::Updated { uid } => write!(f, "OK({:02}) {uid}", OkCode::Updated.number()),
            Self::UsrAccess { old } => write!(f, "RES_USRACCESS({old})"),
            Self::UsrLoc { location } => write!(f, "RES_USRLOC({location})"),
            Self::LocList { uids } if uids.is_empty() => f.write_str("RES_LOCLIST EMPTY"),
            Self::LocList { uids } => {
                let joined = uids.iter().map(Uid::as_str).collect::<Vec<_>>().join(", ");
                write!(f, "RES_LOCLIST {joined}")
            }
            Self::Error(code) => write!(f, "ERROR({:02})", code.number()),
            Self::Malformed => f.write_str(MALFORMED_LINE),
            Self::Unsupported => f.write_str(UNSUPPORTED_LINE),
        }
    }
}

/// A message exchanged between the two nodes over the peer link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMsg {
    /// `REQ_CONNPEER()`: open the link.
    ConnPeer,
    /// `RES_CONNPEER(<id>)`: link accepted, with the id assigned to the caller.
    ConnPeerAccepted { id: u32 },
    /// `REQ_DISCPEER(<id>)`: the sender is leaving the pair.
    DiscPeer { id: u32 },
    /// `REQ_LOCREG <uid> <loc>`: register a movement on the location node.
    LocReg { uid: Uid, location: i32 },
    /// `RES_LOCREG <uid> <loc>`: the location the user was at before.
    LocRegReply { uid: Uid, old: i32 },
    /// `REQ_USRAUTH <uid>`: ask the user node whether `uid` has the special flag.
    UsrAuth { uid: Uid },
    /// `RES_USRAUTH(<0|1>)`: the flag's value.
    UsrAuthReply { special: bool },
    /// `OK(<nn>)` on the peer channel, only used to acknowledge a disconnect.
    Ok(OkCode),
    /// `ERROR(<nn>)` on the peer channel, only used to refuse a second link.
    Error(ErrorCode),
}

impl PeerMsg {
    pub fn parse(line: &str) -> Result<Self> {
        let mut tokens = line.split_whitespace();
        let head = tokens.next().context("empty peer line")?;
        let args: Vec<&str> = tokens.collect();

        if let Some(arg) = paren_arg(head, "REQ_CONNPEER") {
            ensure!(arg.is_empty() && args.is_empty(), "REQ_CONNPEER takes no arguments");
            return Ok(Self::ConnPeer);
        }
        if let Some(arg) = paren_arg(head, "RES_CONNPEER") {
            ensure!(args.is_empty(), "RES_CONNPEER takes no further arguments");
            let id = arg.parse::<u32>().context("RES_CONNPEER id must be an integer")?;
            return Ok(Self::ConnPeerAccepted { id });
        }
        if let Some(arg) = paren_arg(head, "REQ_DISCPEER") {
            ensure!(args.is_empty(), "REQ_DISCPEER takes no further arguments");
            let id = arg.parse::<u32>().context("REQ_DISCPEER id must be an integer")?;
            return Ok(Self::DiscPeer { id });
        }
        if let Some(arg) = paren_arg(head, "RES_USRAUTH") {
            ensure!(args.is_empty(), "RES_USRAUTH takes no further arguments");
            return Ok(Self::UsrAuthReply { special: parse_flag(arg)? });
        }
        if let Some(arg) = paren_arg(head, "OK") {
            ensure!(args.is_empty(), "OK takes no further arguments here");
            let number = arg.parse::<u8>().context("OK code must be a number")?;
            let code = OkCode::from_number(number).context("unknown success code")?;
            return Ok(Self::Ok(code));
        }
        if let Some(arg) = paren_arg(head, "ERROR") {
            ensure!(args.is_empty(), "ERROR takes no further arguments");
            let number = arg.parse::<u8>().context("ERROR code must be a number")?;
            let code = ErrorCode::from_number(number).context("unknown error code")?;
            return Ok(Self::Error(code));
        }

        match (head, args.as_slice()) {
            ("REQ_LOCREG", [uid, location]) => Ok(Self::LocReg {
                uid: Uid::parse(uid)?,
                location: location.parse().context("REQ_LOCREG location must be an integer")?,
            }),
            ("RES_LOCREG", [uid, old]) => Ok(Self::LocRegReply {
                uid: Uid::parse(uid)?,
                old: old.parse().context("RES_LOCREG location must be an integer")?,
            }),
            ("REQ_USRAUTH", [uid]) => Ok(Self::UsrAuth { uid: Uid::parse(uid)? }),
            _ => bail!("unrecognized peer message: {line}"),
        }
    }
}

impl fmt::Display for PeerMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnPeer => f.write_str("REQ_CONNPEER()"),
            Self::ConnPeerAccepted { id } => write!(f, "RES_CONNPEER({id})"),
            Self::DiscPeer { id } => write!(f, "REQ_DISCPEER({id})"),
            Self::LocReg { uid, location } => write!(f, "REQ_LOCREG {uid} {location}"),
            Self::LocRegReply { uid, old } => write!(f, "RES_LOCREG {uid} {old}"),
            Self::UsrAuth { uid } => write!(f, "REQ_USRAUTH {uid}"),
            Self::UsrAuthReply { special } => write!(f, "RES_USRAUTH({})", u8::from(*special)),
            Self::Ok(code) => write!(f, "OK({:02})", code.number()),
            Self::Error(code) => write!(f, "ERROR({:02})", code.number()),
        }
    }
}

/// Extract the argument of a `VERB(arg)` token; `None` if the verb or the
/// parentheses do not match exactly.
fn paren_arg<'a>(token: &'a str, verb: &str) -> Option<&'a str> {
    token.strip_prefix(verb)?.strip_prefix('(')?.strip_suffix(')')
}

pub(crate) fn parse_flag(token: &str) -> Result<bool> {
    match token {
        "0" => Ok(false),
        "1" => Ok(true),
        other => bail!("flag must be 0 or 1, got {other}"),
    }
}

pub(crate) fn parse_direction(token: &str) -> Result<Direction> {
    match token {
        "in" => Ok(Direction::In),
        "out" => Ok(Direction::Out),
        other => bail!("direction must be in or out, got {other}"),
    }
}

/// Read the next non-empty line, with trailing `\r`/`\n` stripped.
///
/// Returns `Ok(None)` once the stream reaches EOF.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }
        return Ok(Some(trimmed.to_string()));
    }
}

/// Write one message as a line and flush it.
pub async fn write_line<W, M>(writer: &mut W, message: &M) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    M: fmt::Display,
{
    let mut encoded = message.to_string().into_bytes();
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}
