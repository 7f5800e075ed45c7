//! Role-specific interpretation of client and peer lines.
//!
//! Both roles follow the same shape: parse, validate, mutate the local
//! table, then either answer the client directly or park the request on a
//! cross-node round-trip. Round-trip replies correlate by uid (movement) or
//! through the single inspect slot (authorization); a reply nothing waits
//! for is logged and discarded.

use tracing::{debug, info, warn};

use crate::node::{Core, PendingInspect, Role};
use crate::protocol::{Direction, ErrorCode, PeerMsg, Request, Response, Uid};
use crate::session::SessionId;
use crate::store::{Upsert, NO_LOCATION};

impl Core {
    pub(crate) async fn on_client_line(&mut self, session: SessionId, line: String) {
        let request = match Request::parse(&line) {
            Ok(request) => request,
            Err(error) => {
                debug!(session, %line, %error, "malformed client request");
                self.reply(session, &Response::Malformed).await;
                return;
            }
        };
        match (self.role, request) {
            (_, Request::Conn { location }) => self.client_conn(session, location).await,
            (_, Request::Disc) => self.client_disc(session).await,
            (Role::User, Request::UsrAdd { uid, special }) => self.usradd(session, uid, special).await,
            (Role::User, Request::UsrAccess { uid, direction }) => {
                self.usraccess(session, uid, direction).await
            }
            (Role::Location, Request::UsrLoc { uid }) => self.usrloc(session, uid).await,
            (Role::Location, Request::LocList { uid, location }) => {
                self.loclist(session, uid, location).await
            }
            (_, request) => {
                debug!(session, ?request, "request not served by this role");
                self.reply(session, &Response::Unsupported).await;
            }
        }
    }

    async fn client_conn(&mut self, session: SessionId, location: i32) {
        if let Some(client) = self.sessions.get_mut(session) {
            client.location = Some(location);
        }
        info!(session, location, "client declared its location");
        self.reply(session, &Response::Conn { id: session }).await;
    }

    async fn client_disc(&mut self, session: SessionId) {
        self.reply(session, &Response::Disconnected).await;
        self.drop_session(session, "client requested disconnect").await;
    }

    async fn usradd(&mut self, session: SessionId, uid: Uid, special: bool) {
        match self.users.upsert(uid.clone(), special) {
            Ok(Upsert::Created) => {
                info!(session, user = %uid, special, "user created");
                self.reply(session, &Response::Created { uid }).await;
            }
            Ok(Upsert::Updated) => {
                info!(session, user = %uid, special, "user updated");
                self.reply(session, &Response::Updated { uid }).await;
            }
            Err(_) => {
                warn!(session, user = %uid, "user table is full");
                self.reply(session, &Response::Error(ErrorCode::UserLimit)).await;
            }
        }
    }

    async fn usraccess(&mut self, session: SessionId, uid: Uid, direction: Direction) {
        if !self.users.contains(&uid) {
            self.reply(session, &Response::Error(ErrorCode::UserNotFound)).await;
            return;
        }
        let location = match direction {
            Direction::In => self
                .sessions
                .get(session)
                .map_or(NO_LOCATION, |client| client.location_context()),
            Direction::Out => NO_LOCATION,
        };
        if !self.peer.is_linked() {
            // Without a link the movement cannot be registered anywhere, so
            // answer with an unknown previous location instead of queueing.
            debug!(session, user = %uid, "no peer link, movement not registered");
            self.reply(session, &Response::UsrAccess { old: NO_LOCATION }).await;
            return;
        }
        self.pending_access.insert(uid.clone(), session);
        self.send_peer(&PeerMsg::LocReg { uid, location }).await;
    }

    async fn usrloc(&mut self, session: SessionId, uid: Uid) {
        let response = match self.locations.location_of(&uid) {
            Some(location) if location != NO_LOCATION => Response::UsrLoc { location },
            _ => Response::Error(ErrorCode::UserNotFound),
        };
        self.reply(session, &response).await;
    }

    async fn loclist(&mut self, session: SessionId, uid: Uid, location: i32) {
        if self.pending_inspect.is_some() {
            debug!(session, "an inspect is already pending, refusing another");
            self.reply(session, &Response::Error(ErrorCode::PermissionDenied)).await;
            return;
        }
        if !self.peer.is_linked() {
            debug!(session, "no peer link, the inspect permission cannot be checked");
            self.reply(session, &Response::Error(ErrorCode::PermissionDenied)).await;
            return;
        }
        self.pending_inspect = Some(PendingInspect { uid: uid.clone(), location, session });
        self.send_peer(&PeerMsg::UsrAuth { uid }).await;
    }

    pub(crate) async fn on_peer_msg(&mut self, line: String) {
        let message = match PeerMsg::parse(&line) {
            Ok(message) => message,
            Err(error) => {
                warn!(%line, %error, "unparseable peer line");
                return;
            }
        };
        match (self.role, message) {
            (_, PeerMsg::DiscPeer { id }) => {
                info!(peer = id, "peer requested disconnect");
                self.peer_disconnect_requested().await;
            }
            (Role::User, PeerMsg::LocRegReply { uid, old }) => self.finish_usraccess(uid, old).await,
            (Role::User, PeerMsg::UsrAuth { uid }) => {
                let special = self.users.is_special(&uid).unwrap_or(false);
                self.send_peer(&PeerMsg::UsrAuthReply { special }).await;
            }
            (Role::Location, PeerMsg::LocReg { uid, location }) => {
                let old = self.locations.record(uid.clone(), location);
                info!(user = %uid, location, old, "movement recorded");
                self.send_peer(&PeerMsg::LocRegReply { uid, old }).await;
            }
            (Role::Location, PeerMsg::UsrAuthReply { special }) => self.finish_loclist(special).await,
            (_, message) => warn!(?message, "unexpected peer message for this role"),
        }
    }

    async fn finish_usraccess(&mut self, uid: Uid, old: i32) {
        let Some(session) = self.pending_access.remove(&uid) else {
            debug!(user = %uid, "location reply with no waiting movement");
            return;
        };
        self.reply(session, &Response::UsrAccess { old }).await;
    }

    async fn finish_loclist(&mut self, special: bool) {
        let Some(pending) = self.pending_inspect.take() else {
            debug!("authorization reply with no waiting inspect");
            return;
        };
        if !special {
            info!(session = pending.session, user = %pending.uid, "inspect denied");
            self.reply(pending.session, &Response::Error(ErrorCode::PermissionDenied)).await;
            return;
        }
        let uids = self.locations.occupants_of(pending.location);
        info!(
            session = pending.session,
            location = pending.location,
            count = uids.len(),
            "inspect served"
        );
        self.reply(pending.session, &Response::LocList { uids }).await;
    }
}
