//! A two-role directory pair: the user node tracks identities and their
//! special-permission flag, the location node tracks where each identity
//! currently is. The nodes replicate over a single peer link, and clients
//! speak a line-oriented text protocol to either side.
//!
//! - [`cli`] defines the command-line surface for both modes.
//! - [`node`] runs a directory node: the single-owner core loop that
//!   multiplexes the peer link, client sessions, and the operator console.
//! - [`peer`] negotiates which node owns the shared peer port and performs
//!   the link handshake.
//! - [`session`] tracks connected clients and enforces the connection cap.
//! - [`store`] holds the in-memory user and location tables.
//! - [`protocol`] defines the wire messages and line framing.
//! - [`client`] is the interactive console client.
//!
//! Integration tests drive in-process nodes over real sockets; the
//! end-to-end test spawns the compiled binary.

pub mod cli;
pub mod client;
mod dispatch;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod store;
