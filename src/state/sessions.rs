//! In-memory registry of sessions, their hosts and participants.
//!
//! Sessions are stored behind one mutex each, with an inverted index from
//! connection id to membership kept in a second map. Map guards are never
//! held while a session is locked; the lock order is session, then timers.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::{Duration, SystemTime},
};

use dashmap::{DashMap, mapref::entry::Entry};
use indexmap::IndexSet;
use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::SessionConfig, dto::validation::SESSION_CODE_ALPHABET, state::timers::TimerScheduler,
};

/// Signaling connections are identified by a UUID string.
pub type ConnectionId = String;

const MAX_CODE_ATTEMPTS: usize = 64;

/// Role a connection plays in its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Owner of the session.
    Host,
    /// Any other member.
    Participant,
}

/// Entry of the connection index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    /// Session code.
    pub code: String,
    /// Role in that session.
    pub role: Role,
}

/// Session errors surfaced to signaling clients.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// No live session with this code.
    #[error("session `{0}` not found")]
    NotFound(String),
    /// The host is disconnected and may still reclaim the session.
    #[error("host of session `{0}` is unavailable")]
    HostUnavailable(String),
    /// The connection already hosts this session.
    #[error("connection is the host of session `{0}`")]
    AlreadyHost(String),
    /// The connection already hosts another session.
    #[error("connection already hosts session `{0}`")]
    AlreadyHosting(String),
    /// Wrong recovery token.
    #[error("invalid host recovery token")]
    InvalidToken,
    /// Reclaim attempted after the grace period.
    #[error("grace period of session `{0}` has expired")]
    GraceExpired(String),
    /// Reclaim attempted while a host is attached.
    #[error("session `{0}` already has a connected host")]
    HostConnected(String),
    /// The connection does not belong to any session.
    #[error("connection is not part of a session")]
    NotInSession,
    /// No free session code could be found.
    #[error("could not allocate a unique session code")]
    CodeSpaceExhausted,
}

/// Notifications emitted by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    /// A participant joined or was re-announced.
    PeerJoined {
        /// The participant.
        peer_id: ConnectionId,
    },
    /// A participant left.
    PeerLeft {
        /// The participant.
        peer_id: ConnectionId,
    },
    /// The host dropped; the session survives until `expires_at`.
    HostPending {
        /// Session code.
        session_id: String,
        /// End of the grace period.
        expires_at: SystemTime,
    },
    /// The host came back.
    HostResumed {
        /// Session code.
        session_id: String,
    },
    /// The session was destroyed.
    Ended {
        /// Session code.
        session_id: String,
    },
}

/// Delivers store notifications to connections.
pub trait SessionNotifier: Send + Sync {
    /// Push `notice` to every connection in `recipients`. Unknown ids are skipped.
    fn notify(&self, recipients: &[ConnectionId], notice: &SessionNotice);
}

/// A live session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Shareable code.
    pub id: String,
    /// Attached host, `None` during a grace period.
    pub host_connection_id: Option<ConnectionId>,
    /// Participants in join order.
    pub participant_ids: IndexSet<ConnectionId>,
    /// Wall-clock creation time.
    pub created_at: SystemTime,
    /// Wall-clock end of the current grace period.
    pub host_grace_expires_at: Option<SystemTime>,
    host_recovery_token: String,
    host_grace_deadline: Option<Instant>,
    ended: bool,
}

impl Session {
    fn new(id: String, host: ConnectionId, token: String) -> Self {
        Self {
            id,
            host_connection_id: Some(host),
            participant_ids: IndexSet::new(),
            created_at: SystemTime::now(),
            host_grace_expires_at: None,
            host_recovery_token: token,
            host_grace_deadline: None,
            ended: false,
        }
    }

    fn grace_elapsed(&self, now: Instant) -> bool {
        self.host_grace_deadline
            .is_some_and(|deadline| now >= deadline)
    }

    /// Host to announce `connection` to, if it may join.
    fn check_joinable(&self, connection: &str) -> Result<ConnectionId, SessionError> {
        if self.ended {
            return Err(SessionError::NotFound(self.id.clone()));
        }
        let Some(host_id) = self.host_connection_id.clone() else {
            return Err(SessionError::HostUnavailable(self.id.clone()));
        };
        if host_id == connection {
            return Err(SessionError::AlreadyHost(self.id.clone()));
        }
        Ok(host_id)
    }

    fn check_reclaim(&self, token: &str, now: Instant) -> Result<(), SessionError> {
        if self.ended {
            return Err(SessionError::NotFound(self.id.clone()));
        }
        if self.host_connection_id.is_some() {
            return Err(SessionError::HostConnected(self.id.clone()));
        }
        if token != self.host_recovery_token {
            return Err(SessionError::InvalidToken);
        }
        if self.grace_elapsed(now) {
            return Err(SessionError::GraceExpired(self.id.clone()));
        }
        Ok(())
    }
}

/// Result of [`SessionStore::create_session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSession {
    /// New session code.
    pub code: String,
    /// Secret allowing the host to reclaim the session.
    pub host_recovery_token: String,
    /// Connection id of the host.
    pub host_id: ConnectionId,
}

/// Result of [`SessionStore::join_session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedSession {
    /// Session code.
    pub code: String,
    /// Joining connection.
    pub participant_id: ConnectionId,
    /// Host to negotiate with.
    pub host_id: ConnectionId,
    /// Whether the participant was already registered.
    pub rejoined: bool,
}

/// Result of [`SessionStore::reclaim_host`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimedSession {
    /// Session code.
    pub code: String,
    /// Participants still registered.
    pub participants: Vec<ConnectionId>,
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    /// Session code.
    pub code: String,
    /// Whether a host is attached.
    pub host_connected: bool,
    /// Participants in join order.
    pub participants: Vec<ConnectionId>,
    /// Creation time.
    pub created_at: SystemTime,
    /// End of the grace period, if one is running.
    pub host_grace_expires_at: Option<SystemTime>,
}

struct StoreInner {
    sessions: DashMap<String, Arc<Mutex<Session>>>,
    memberships: DashMap<ConnectionId, Membership>,
    timers: TimerScheduler,
    notifier: Arc<dyn SessionNotifier>,
    config: SessionConfig,
}

/// Authoritative session registry, cheap to clone.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

fn grace_timer_id(code: &str) -> String {
    format!("host-grace:{code}")
}

impl SessionStore {
    /// Create an empty store.
    pub fn new(
        config: SessionConfig,
        timers: TimerScheduler,
        notifier: Arc<dyn SessionNotifier>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                sessions: DashMap::new(),
                memberships: DashMap::new(),
                timers,
                notifier,
                config,
            }),
        }
    }

    /// Register `host` as the host of a brand new session.
    pub fn create_session(&self, host: &str) -> Result<CreatedSession, SessionError> {
        match self.find_by_connection(host) {
            Some(Membership {
                code,
                role: Role::Host,
            }) => return Err(SessionError::AlreadyHosting(code)),
            Some(Membership {
                code,
                role: Role::Participant,
            }) => {
                self.remove_participant(&code, host)?;
            }
            None => {}
        }

        let token = Uuid::new_v4().simple().to_string();
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = self.generate_code();
            if let Entry::Vacant(slot) = self.inner.sessions.entry(code.clone()) {
                slot.insert(Arc::new(Mutex::new(Session::new(
                    code.clone(),
                    host.to_string(),
                    token.clone(),
                ))));
                self.inner.memberships.insert(
                    host.to_string(),
                    Membership {
                        code: code.clone(),
                        role: Role::Host,
                    },
                );
                info!(session = %code, host = %host, "session created");
                return Ok(CreatedSession {
                    code,
                    host_recovery_token: token,
                    host_id: host.to_string(),
                });
            }
            debug!(session = %code, "session code collision; retrying");
        }

        warn!("session code space exhausted");
        Err(SessionError::CodeSpaceExhausted)
    }

    /// Add `connection` to session `code` and announce it to the host.
    pub fn join_session(&self, code: &str, connection: &str) -> Result<JoinedSession, SessionError> {
        match self.find_by_connection(connection) {
            Some(Membership {
                code: hosted,
                role: Role::Host,
            }) => {
                return Err(if hosted == code {
                    SessionError::AlreadyHost(hosted)
                } else {
                    SessionError::AlreadyHosting(hosted)
                });
            }
            Some(Membership {
                code: previous,
                role: Role::Participant,
            }) if previous != code => {
                let session = self.session(code)?;
                lock(&session).check_joinable(connection)?;
                self.leave_previous(&previous, connection);
            }
            _ => {}
        }

        let session = self.session(code)?;
        let (host_id, rejoined) = {
            let mut guard = lock(&session);
            let host_id = guard.check_joinable(connection)?;
            let rejoined = !guard.participant_ids.insert(connection.to_string());
            self.inner.memberships.insert(
                connection.to_string(),
                Membership {
                    code: code.to_string(),
                    role: Role::Participant,
                },
            );
            (host_id, rejoined)
        };

        info!(session = %code, participant = %connection, rejoined, "participant joined");
        self.inner.notifier.notify(
            std::slice::from_ref(&host_id),
            &SessionNotice::PeerJoined {
                peer_id: connection.to_string(),
            },
        );

        Ok(JoinedSession {
            code: code.to_string(),
            participant_id: connection.to_string(),
            host_id,
            rejoined,
        })
    }

    /// Detach the host of `code` and start its grace period. Does nothing if no host is attached.
    pub fn begin_host_grace(&self, code: &str) -> Result<(), SessionError> {
        let session = self.session(code)?;
        let grace = self.inner.config.host_grace_period;

        let (participants, expires_at) = {
            let mut guard = lock(&session);
            if guard.ended {
                return Err(SessionError::NotFound(code.to_string()));
            }
            let Some(host) = guard.host_connection_id.take() else {
                return Ok(());
            };
            self.inner
                .memberships
                .remove_if(&host, |_, membership| membership.code == code);

            let expires_at = SystemTime::now() + grace;
            guard.host_grace_deadline = Some(Instant::now() + grace);
            guard.host_grace_expires_at = Some(expires_at);
            self.arm_grace_timer(code, grace);

            info!(session = %code, host = %host, grace_secs = grace.as_secs(), "host disconnected; grace period started");
            (guard.participant_ids.iter().cloned().collect::<Vec<_>>(), expires_at)
        };

        self.inner.notifier.notify(
            &participants,
            &SessionNotice::HostPending {
                session_id: code.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    /// Give session `code` back to `connection` if it holds the recovery token and the grace period is running.
    pub fn reclaim_host(
        &self,
        code: &str,
        token: &str,
        connection: &str,
    ) -> Result<ReclaimedSession, SessionError> {
        match self.find_by_connection(connection) {
            Some(Membership {
                code: hosted,
                role: Role::Host,
            }) => {
                return Err(if hosted == code {
                    SessionError::HostConnected(hosted)
                } else {
                    SessionError::AlreadyHosting(hosted)
                });
            }
            Some(Membership {
                code: previous,
                role: Role::Participant,
            }) if previous != code => {
                let session = self.session(code)?;
                if lock(&session).check_reclaim(token, Instant::now()).is_ok() {
                    self.leave_previous(&previous, connection);
                }
            }
            _ => {}
        }

        let session = self.session(code)?;
        let mut guard = lock(&session);
        if let Err(err) = guard.check_reclaim(token, Instant::now()) {
            if matches!(err, SessionError::GraceExpired(_)) {
                let participants = self.close(&mut guard);
                drop(guard);
                info!(session = %code, "reclaim after grace deadline; session destroyed");
                self.notify_ended(code, &participants);
            } else {
                debug!(session = %code, error = %err, "reclaim rejected");
            }
            return Err(err);
        }

        guard.participant_ids.shift_remove(connection);
        self.inner.timers.cancel(&grace_timer_id(code));
        guard.host_connection_id = Some(connection.to_string());
        guard.host_grace_deadline = None;
        guard.host_grace_expires_at = None;
        self.inner.memberships.insert(
            connection.to_string(),
            Membership {
                code: code.to_string(),
                role: Role::Host,
            },
        );
        let participants: Vec<ConnectionId> = guard.participant_ids.iter().cloned().collect();
        drop(guard);

        info!(session = %code, host = %connection, participants = participants.len(), "host reclaimed session");
        self.inner.notifier.notify(
            &participants,
            &SessionNotice::HostResumed {
                session_id: code.to_string(),
            },
        );
        let host = [connection.to_string()];
        for peer_id in &participants {
            self.inner.notifier.notify(
                &host,
                &SessionNotice::PeerJoined {
                    peer_id: peer_id.clone(),
                },
            );
        }

        Ok(ReclaimedSession {
            code: code.to_string(),
            participants,
        })
    }

    /// Remove `participant` from `code` and tell the host. Returns whether it was registered.
    pub fn remove_participant(&self, code: &str, participant: &str) -> Result<bool, SessionError> {
        let session = self.session(code)?;
        let (removed, host) = {
            let mut guard = lock(&session);
            if guard.ended {
                return Err(SessionError::NotFound(code.to_string()));
            }
            let removed = guard.participant_ids.shift_remove(participant);
            self.inner
                .memberships
                .remove_if(participant, |_, membership| {
                    membership.code == code && membership.role == Role::Participant
                });
            (removed, guard.host_connection_id.clone())
        };

        if removed {
            info!(session = %code, participant = %participant, "participant left");
            if let Some(host) = host {
                self.inner.notifier.notify(
                    &[host],
                    &SessionNotice::PeerLeft {
                        peer_id: participant.to_string(),
                    },
                );
            }
        }
        Ok(removed)
    }

    /// Destroy `code` on purpose and tell its participants.
    pub fn end_session(&self, code: &str) -> Result<(), SessionError> {
        let session = self.session(code)?;
        let participants = {
            let mut guard = lock(&session);
            if guard.ended {
                return Err(SessionError::NotFound(code.to_string()));
            }
            self.close(&mut guard)
        };

        info!(session = %code, "session ended by host");
        self.notify_ended(code, &participants);
        Ok(())
    }

    /// Intentional leave: a host ends its session, a participant is removed.
    pub fn leave(&self, connection: &str) -> Result<Membership, SessionError> {
        let membership = self
            .find_by_connection(connection)
            .ok_or(SessionError::NotInSession)?;
        match membership.role {
            Role::Host => self.end_session(&membership.code)?,
            Role::Participant => {
                self.remove_participant(&membership.code, connection)?;
            }
        }
        Ok(membership)
    }

    /// Unexpected disconnect: a host enters its grace period, a participant is removed.
    pub fn disconnect(&self, connection: &str) {
        let Some(membership) = self.find_by_connection(connection) else {
            return;
        };
        let result = match membership.role {
            Role::Host => self.begin_host_grace(&membership.code),
            Role::Participant => self
                .remove_participant(&membership.code, connection)
                .map(|_| ()),
        };
        if let Err(err) = result {
            debug!(connection = %connection, error = %err, "disconnect cleanup skipped");
        }
    }

    /// Session and role of `connection`, if any.
    pub fn find_by_connection(&self, connection: &str) -> Option<Membership> {
        self.inner
            .memberships
            .get(connection)
            .map(|entry| entry.value().clone())
    }

    /// Read-only view of session `code`.
    pub fn status(&self, code: &str) -> Option<SessionInfo> {
        let session = self.session(code).ok()?;
        let guard = lock(&session);
        if guard.ended {
            return None;
        }
        Some(SessionInfo {
            code: guard.id.clone(),
            host_connected: guard.host_connection_id.is_some(),
            participants: guard.participant_ids.iter().cloned().collect(),
            created_at: guard.created_at,
            host_grace_expires_at: guard.host_grace_expires_at,
        })
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Whether the grace timer of `code` is armed.
    pub fn grace_timer_armed(&self, code: &str) -> bool {
        self.inner.timers.is_armed(&grace_timer_id(code))
    }

    fn session(&self, code: &str) -> Result<Arc<Mutex<Session>>, SessionError> {
        self.inner
            .sessions
            .get(code)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SessionError::NotFound(code.to_string()))
    }

    fn generate_code(&self) -> String {
        let mut rng = rand::rng();
        (0..self.inner.config.code_length)
            .map(|_| {
                let index = rng.random_range(0..SESSION_CODE_ALPHABET.len());
                char::from(SESSION_CODE_ALPHABET[index])
            })
            .collect()
    }

    /// Move `connection` out of `previous` once its next session has accepted it.
    fn leave_previous(&self, previous: &str, connection: &str) {
        if let Err(err) = self.remove_participant(previous, connection) {
            debug!(session = %previous, participant = %connection, error = %err, "previous session already gone");
        }
    }

    fn arm_grace_timer(&self, code: &str, grace: Duration) {
        let store: Weak<StoreInner> = Arc::downgrade(&self.inner);
        let expired = code.to_string();
        self.inner.timers.schedule(grace_timer_id(code), grace, move || {
            if let Some(inner) = store.upgrade() {
                SessionStore { inner }.expire_host_grace(&expired);
            }
        });
    }

    fn expire_host_grace(&self, code: &str) {
        let Ok(session) = self.session(code) else {
            return;
        };
        let participants = {
            let mut guard = lock(&session);
            if guard.ended || !guard.grace_elapsed(Instant::now()) {
                return;
            }
            self.close(&mut guard)
        };

        info!(session = %code, "host grace period expired; session destroyed");
        self.notify_ended(code, &participants);
    }

    /// Mark `session` ended and unregister it. Returns the participants to notify.
    fn close(&self, session: &mut Session) -> Vec<ConnectionId> {
        session.ended = true;
        self.inner.timers.cancel(&grace_timer_id(&session.id));
        self.inner.sessions.remove(&session.id);

        let code = session.id.clone();
        if let Some(host) = session.host_connection_id.take() {
            self.inner
                .memberships
                .remove_if(&host, |_, membership| membership.code == code);
        }
        let participants: Vec<ConnectionId> = session.participant_ids.drain(..).collect();
        for participant in &participants {
            self.inner
                .memberships
                .remove_if(participant, |_, membership| membership.code == code);
        }
        participants
    }

    fn notify_ended(&self, code: &str, participants: &[ConnectionId]) {
        self.inner.notifier.notify(
            participants,
            &SessionNotice::Ended {
                session_id: code.to_string(),
            },
        );
    }
}
