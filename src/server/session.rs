// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The server-side session state machine and the registries that
//! own sessions and published media, per the "Cyclic references"
//! design note: the registry is the single owner, and everyone else
//! (connections, readers) holds a stable `session_id`/resource key and looks
//! it up rather than holding an object handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use url::Url;

use super::stream::ServerStream;
use crate::headers::transport::{Mode as TransportMode, Transport};
use crate::liveness::{CancelToken, SessionTimeoutTracker};
use crate::transport::MediaTransport;
use crate::{wrap, Error, ErrorInt};

/// `Initial -> (PreRead|PreRecord) -> (Read|Record) -> Paused`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    PreRead,
    Read,
    PreRecord,
    Record,
    Paused,
}

/// One media installed by `SETUP`, with its negotiated transport.
pub struct ServerMedia {
    pub control: Url,
    pub mode: TransportMode,
    pub transport: Option<MediaTransport>,
    pub negotiated: Transport,
    /// The resource-wide fanout point this media reads from (a reader) or
    /// writes to (a publisher); `None` until the controlling resource is
    /// resolved (set at `SETUP` time once the resource is known).
    pub stream: Option<ServerStream>,
}

/// Server-side session state (the "Session"): identifier, lifecycle
/// state, installed media/transports, and the last-activity clock that
/// drives expiry. Protected by one per-session mutex.
pub struct ServerSessionState {
    pub id: String,
    pub state: SessionState,
    /// Set when `PAUSE` is issued, so a subsequent `PLAY`/`RECORD` can
    /// restore the prior lifecycle without guessing from `Paused` alone.
    pub paused_from: Option<SessionState>,
    pub resource: Option<String>,
    pub media: Vec<ServerMedia>,
    pub timeout: SessionTimeoutTracker,
    pub conn_id: u64,
    /// Cancels every data-plane pump task installed for this session's media.
    /// Distinct from the owning connection's cancel token because a UDP
    /// media's packet pumps outlive a TCP control connection that merely
    /// goes quiet: only TCP-interleaved sessions die with their connection.
    pub cancel: CancelToken,
}

impl ServerSessionState {
    fn new(id: String, conn_id: u64, timeout_secs: u32) -> Self {
        Self {
            id,
            state: SessionState::Initial,
            paused_from: None,
            resource: None,
            media: Vec::new(),
            timeout: SessionTimeoutTracker::new(timeout_secs),
            conn_id,
            cancel: CancelToken::new(),
        }
    }

    /// Enforces the total-function transition property: for any
    /// (state, method) pair exactly one of {transition, 455} happens here
    /// (454 is handled earlier, at the point a `Session:` header fails to
    /// resolve to a live entry at all).
    pub fn check_transition(&self, method: &str) -> Result<SessionState, Error> {
        use SessionState::*;
        let next = match (self.state, method) {
            (Initial, "SETUP") => Initial,
            (PreRead, "SETUP") => PreRead,
            (PreRecord, "SETUP") => PreRecord,
            (PreRead, "PLAY") => Read,
            (Read, "PLAY") => Read,
            (PreRecord, "RECORD") => Record,
            (Record, "RECORD") => Record,
            (Read, "PAUSE") => Paused,
            (Record, "PAUSE") => Paused,
            (Paused, "PLAY") if self.paused_from == Some(Read) => Read,
            (Paused, "RECORD") if self.paused_from == Some(Record) => Record,
            (_, "TEARDOWN") => self.state, // valid from any state; caller tears down regardless
            (_, "GET_PARAMETER") | (_, "SET_PARAMETER") => self.state,
            _ => {
                return Err(wrap!(ErrorInt::StateMismatchError {
                    state: format!("{:?}", self.state),
                    description: format!("{} not valid in current state", method),
                }))
            }
        };
        Ok(next)
    }
}

/// A published resource: the set of media a `RECORD`-ing (or otherwise
/// source-providing) session exposes to `PLAY` readers, keyed by the
/// resource's request path. One [ServerStream] per media.
pub struct PublishedResource {
    pub description: sdp::session_description::SessionDescription,
    pub base_url: Url,
    pub media_controls: Vec<Url>,
    pub streams: Vec<ServerStream>,
    pub publisher_session_id: Option<String>,
}

/// The process-wide session table: a single `RwLock`-guarded
/// map from session id to its per-session mutex, plus the registry of
/// published resources DESCRIBE/SETUP/PLAY consult by URL path.
#[derive(Default)]
pub struct Registry {
    sessions: RwLock<HashMap<String, Arc<Mutex<ServerSessionState>>>>,
    resources: RwLock<HashMap<String, Arc<PublishedResource>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_session(
        &self,
        conn_id: u64,
        timeout_secs: u32,
        max_sessions: usize,
    ) -> Result<Arc<Mutex<ServerSessionState>>, Error> {
        let mut sessions = self.sessions.write().unwrap();
        if sessions.len() >= max_sessions {
            return Err(wrap!(ErrorInt::TransportError {
                conn_ctx: None,
                description: "server session table is full".to_string(),
            }));
        }
        let id = crate::headers::session::generate_session_id();
        let entry = Arc::new(Mutex::new(ServerSessionState::new(id.clone(), conn_id, timeout_secs)));
        sessions.insert(id, entry.clone());
        Ok(entry)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mutex<ServerSessionState>>> {
        self.sessions.read().unwrap().get(id).cloned()
    }

    /// Removes a session immediately. Callers wanting to drop the session
    /// entry after a short linger should schedule this via a timer instead
    /// of calling it inline from `TEARDOWN`.
    pub fn remove(&self, id: &str) {
        self.sessions.write().unwrap().remove(id);
    }

    pub fn remove_after_linger(self: &Arc<Self>, id: String, linger: Duration) {
        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            registry.remove(&id);
        });
    }

    /// Sweeps expired sessions (the periodic session-timeout check),
    /// returning the ids removed so callers can fire `on_session_close`.
    pub fn sweep_expired(&self) -> Vec<String> {
        let mut sessions = self.sessions.write().unwrap();
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.lock().unwrap().timeout.is_expired())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        expired
    }

    pub fn publish_resource(&self, path: String, resource: PublishedResource) -> Arc<PublishedResource> {
        let resource = Arc::new(resource);
        self.resources.write().unwrap().insert(path, resource.clone());
        resource
    }

    pub fn resource(&self, path: &str) -> Option<Arc<PublishedResource>> {
        self.resources.read().unwrap().get(path).cloned()
    }

    /// Finds the resource and media index whose resolved control URL
    /// matches `url`, for dispatching a `SETUP` request.
    pub fn resolve_media(&self, url: &Url) -> Option<(String, Arc<PublishedResource>, usize)> {
        let resources = self.resources.read().unwrap();
        for (path, resource) in resources.iter() {
            if let Some(idx) = resource.media_controls.iter().position(|c| c == url) {
                return Some((path.clone(), resource.clone(), idx));
            }
        }
        None
    }

    pub fn unpublish(&self, path: &str) {
        self.resources.write().unwrap().remove(path);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_function_property_over_all_states_and_methods() {
        let states = [
            SessionState::Initial,
            SessionState::PreRead,
            SessionState::Read,
            SessionState::PreRecord,
            SessionState::Record,
            SessionState::Paused,
        ];
        let methods = [
            "SETUP", "PLAY", "RECORD", "PAUSE", "TEARDOWN", "GET_PARAMETER", "SET_PARAMETER",
            "ANNOUNCE",
        ];
        for &state in &states {
            for &method in &methods {
                let mut s = ServerSessionState::new("x".into(), 0, 60);
                s.state = state;
                if state == SessionState::Paused {
                    s.paused_from = Some(SessionState::Read);
                }
                // Exactly one of {Ok(transition), Err(StateMismatch)}; never panics.
                let _ = s.check_transition(method);
            }
        }
    }

    #[test]
    fn teardown_is_valid_from_every_state() {
        for &state in &[
            SessionState::Initial,
            SessionState::PreRead,
            SessionState::Read,
            SessionState::PreRecord,
            SessionState::Record,
            SessionState::Paused,
        ] {
            let mut s = ServerSessionState::new("x".into(), 0, 60);
            s.state = state;
            assert!(s.check_transition("TEARDOWN").is_ok());
        }
    }

    #[test]
    fn play_invalid_before_setup() {
        let s = ServerSessionState::new("x".into(), 0, 60);
        assert!(s.check_transition("PLAY").is_err());
    }

    #[test]
    fn registry_create_get_remove_roundtrip() {
        let reg = Registry::new();
        let session = reg.create_session(1, 60, 100).unwrap();
        let id = session.lock().unwrap().id.clone();
        assert!(reg.get(&id).is_some());
        reg.remove(&id);
        assert!(reg.get(&id).is_none());
    }

    #[test]
    fn create_session_respects_max_sessions() {
        let reg = Registry::new();
        reg.create_session(1, 60, 1).unwrap();
        assert!(reg.create_session(1, 60, 1).is_err());
    }
}
