//! Session and connection lifecycle
//!
//! Sessions and connections are allocated by the engine. The channel keeps a
//! local record of which connections belong to which session so that an ID
//! this channel does not own, or a connection paired with the wrong session,
//! is rejected before anything crosses the boundary.

use crate::channel::ControlChannel;
use crate::engine::{EngineService, Selector};
use crate::error::{KernelError, KernelResult};
use crate::sockaddr::{self, SOCKADDR_RECORD_SIZE};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::num::{NonZeroU16, NonZeroU32};

/// Session qualifier (the engine-assigned part of the ISID)
///
/// The wire value `0` means "no session" and cannot be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(NonZeroU16);

impl SessionId {
    pub fn new(raw: u16) -> Option<Self> {
        NonZeroU16::new(raw).map(SessionId)
    }

    pub fn get(self) -> u16 {
        self.0.get()
    }
}

impl TryFrom<u16> for SessionId {
    type Error = KernelError;

    fn try_from(raw: u16) -> KernelResult<Self> {
        SessionId::new(raw)
            .ok_or_else(|| KernelError::InvalidArgument("invalid session id 0".to_string()))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection identifier, meaningful only together with its session
///
/// The wire value `0` means "no connection" and cannot be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(NonZeroU32);

impl ConnectionId {
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(ConnectionId)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl TryFrom<u32> for ConnectionId {
    type Error = KernelError;

    fn try_from(raw: u32) -> KernelResult<Self> {
        ConnectionId::new(raw)
            .ok_or_else(|| KernelError::InvalidArgument("invalid connection id 0".to_string()))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// IP address family of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    /// The family of a socket address
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        }
    }

    /// BSD `AF_*` value passed to the engine
    pub fn raw(self) -> u8 {
        match self {
            AddressFamily::Inet => sockaddr::AF_INET,
            AddressFamily::Inet6 => sockaddr::AF_INET6,
        }
    }

    pub fn from_raw(val: u8) -> Option<Self> {
        match val {
            sockaddr::AF_INET => Some(AddressFamily::Inet),
            sockaddr::AF_INET6 => Some(AddressFamily::Inet6),
            _ => None,
        }
    }
}

/// Sessions and connections owned by one channel
#[derive(Debug, Default)]
pub(crate) struct ResourceRegistry {
    sessions: HashMap<SessionId, BTreeSet<ConnectionId>>,
}

impl ResourceRegistry {
    /// Returns the connections of a previous holder of the same ID, if any
    fn insert_session(&mut self, session: SessionId) -> Option<BTreeSet<ConnectionId>> {
        self.sessions.insert(session, BTreeSet::new())
    }

    fn remove_session(&mut self, session: SessionId) -> Option<BTreeSet<ConnectionId>> {
        self.sessions.remove(&session)
    }

    /// Returns false if the session is no longer live
    fn insert_connection(&mut self, session: SessionId, connection: ConnectionId) -> bool {
        match self.sessions.get_mut(&session) {
            Some(connections) => {
                connections.insert(connection);
                true
            }
            None => false,
        }
    }

    fn remove_connection(&mut self, session: SessionId, connection: ConnectionId) -> bool {
        self.sessions
            .get_mut(&session)
            .map(|connections| connections.remove(&connection))
            .unwrap_or(false)
    }

    fn owns_connection(&self, session: SessionId, connection: ConnectionId) -> bool {
        self.sessions
            .get(&session)
            .map(|connections| connections.contains(&connection))
            .unwrap_or(false)
    }

    pub(crate) fn check_session(&self, session: SessionId) -> KernelResult<()> {
        if self.sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(KernelError::InvalidArgument(format!(
                "session {} is not live on this channel",
                session
            )))
        }
    }

    pub(crate) fn check_connection(
        &self,
        session: SessionId,
        connection: ConnectionId,
    ) -> KernelResult<()> {
        self.check_session(session)?;
        if self.owns_connection(session, connection) {
            Ok(())
        } else {
            Err(KernelError::InvalidArgument(format!(
                "connection {} does not belong to session {}",
                connection, session
            )))
        }
    }
}

impl<S: EngineService> ControlChannel<S> {
    /// Allocate a new session in the engine
    pub fn create_session(&self) -> KernelResult<SessionId> {
        let mut output = [0u64; 1];
        self.invoke(Selector::CreateSession, &[], &[], &mut output, &mut [])?;

        let session = u16::try_from(output[0])
            .ok()
            .and_then(SessionId::new)
            .ok_or_else(|| {
                KernelError::Io(format!("engine assigned invalid session id {}", output[0]))
            })?;

        if let Some(stale) = self.resources().insert_session(session) {
            log::warn!(
                "Engine reissued live session id {}; dropping {} stale connection(s)",
                session,
                stale.len()
            );
        }
        log::debug!("Created session {}", session);
        Ok(session)
    }

    /// Release a session together with all of its connections
    ///
    /// Teardown is best-effort: the session is forgotten locally whatever
    /// the engine says, and an engine failure is only logged. Releasing a
    /// session this channel no longer owns does nothing.
    pub fn release_session(&self, session: SessionId) {
        let Some(connections) = self.resources().remove_session(session) else {
            log::debug!("Session {} already released", session);
            return;
        };

        let inputs = [session.get() as u64];
        match self.invoke(Selector::ReleaseSession, &inputs, &[], &mut [], &mut []) {
            Ok(_) => log::debug!(
                "Released session {} ({} connections)",
                session,
                connections.len()
            ),
            Err(e) => log::warn!("Engine failed to release session {}: {}", session, e),
        }
    }

    /// Allocate a connection within `session`, bound to `host` and aimed at `target`
    ///
    /// Both addresses must belong to `family`.
    pub fn create_connection(
        &self,
        session: SessionId,
        family: AddressFamily,
        target: &SocketAddr,
        host: &SocketAddr,
    ) -> KernelResult<ConnectionId> {
        self.resources().check_session(session)?;

        if AddressFamily::of(target) != family || AddressFamily::of(host) != family {
            return Err(KernelError::InvalidArgument(format!(
                "addresses {} and {} do not match family {:?}",
                target, host, family
            )));
        }

        let mut addresses = [0u8; 2 * SOCKADDR_RECORD_SIZE];
        addresses[..SOCKADDR_RECORD_SIZE].copy_from_slice(&sockaddr::encode(target));
        addresses[SOCKADDR_RECORD_SIZE..].copy_from_slice(&sockaddr::encode(host));

        let mut output = [0u64; 1];
        self.invoke(
            Selector::CreateConnection,
            &[session.get() as u64, family.raw() as u64],
            &addresses,
            &mut output,
            &mut [],
        )?;

        let connection = u32::try_from(output[0])
            .ok()
            .and_then(ConnectionId::new)
            .ok_or_else(|| {
                KernelError::Io(format!("engine assigned invalid connection id {}", output[0]))
            })?;

        if !self.resources().insert_connection(session, connection) {
            log::warn!(
                "Session {} released while connection {} was being created",
                session,
                connection
            );
            return Err(KernelError::InvalidArgument(format!(
                "session {} was released during connection setup",
                session
            )));
        }

        log::debug!(
            "Created connection {} in session {} ({} via {})",
            connection,
            session,
            target,
            host
        );
        Ok(connection)
    }

    /// Release one connection; the session and its other connections stay live
    ///
    /// Any logout exchange must already have happened. Like
    /// [`release_session`](Self::release_session) this is best-effort and a
    /// second release of the same connection does nothing.
    pub fn release_connection(&self, session: SessionId, connection: ConnectionId) {
        if !self.resources().remove_connection(session, connection) {
            log::debug!(
                "Connection {} of session {} already released",
                connection,
                session
            );
            return;
        }

        let inputs = [session.get() as u64, connection.get() as u64];
        match self.invoke(Selector::ReleaseConnection, &inputs, &[], &mut [], &mut []) {
            Ok(_) => log::debug!("Released connection {} of session {}", connection, session),
            Err(e) => log::warn!(
                "Engine failed to release connection {} of session {}: {}",
                connection,
                session,
                e
            ),
        }
    }

    /// Any connection the engine currently considers usable for `session`
    pub fn active_connection(&self, session: SessionId) -> KernelResult<Option<ConnectionId>> {
        self.resources().check_session(session)?;

        let mut output = [0u64; 1];
        self.invoke(
            Selector::GetActiveConnection,
            &[session.get() as u64],
            &[],
            &mut output,
            &mut [],
        )?;

        let connection = match u32::try_from(output[0]) {
            Ok(raw) => ConnectionId::new(raw),
            Err(_) => {
                return Err(KernelError::Io(format!(
                    "engine reported invalid connection id {}",
                    output[0]
                )))
            }
        };

        if let Some(connection) = connection {
            if !self.resources().owns_connection(session, connection) {
                return Err(KernelError::Io(format!(
                    "engine reported connection {} which session {} does not own",
                    connection, session
                )));
            }
        }
        Ok(connection)
    }

    /// Connections this channel holds for `session`, in ascending order
    pub fn connections(&self, session: SessionId) -> Vec<ConnectionId> {
        self.resources()
            .sessions
            .get(&session)
            .map(|connections| connections.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether `session` is live on this channel
    pub fn is_session_live(&self, session: SessionId) -> bool {
        self.resources().check_session(session).is_ok()
    }
}
