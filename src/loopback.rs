//! In-process transport engine
//!
//! [`LoopbackEngine`] implements every selector of the engine interface in
//! memory. It is what the test suite and the demo run against, and it exposes
//! the hooks tests need to observe the boundary: per-selector call counters,
//! the size of every output buffer the bridge offered, PDUs sent on each
//! connection, queued inbound PDUs, and one-shot fault injection.
//!
//! # Example
//!
//! ```
//! use iscsi_kernel_bridge::loopback::LoopbackEngine;
//! use iscsi_kernel_bridge::ControlChannel;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = LoopbackEngine::new();
//! let channel = ControlChannel::open(&engine.registry())?;
//! let session = channel.create_session()?;
//! assert_eq!(engine.session_count(), 1);
//! channel.release_session(session);
//! channel.close()?;
//! # Ok(())
//! # }
//! ```

use crate::channel::DEFAULT_SERVICE_NAME;
use crate::engine::{
    CallOutput, EngineConnection, EngineService, ReturnCode, Selector, ServiceRegistry,
};
use crate::error::errno;
use crate::options::{
    ConnectionOptions, SessionOptions, CONNECTION_OPTIONS_SIZE, SESSION_OPTIONS_SIZE,
};
use crate::pdu::{BasicHeaderSegment, BHS_SIZE};
use crate::resources::AddressFamily;
use crate::sockaddr::{self, SOCKADDR_RECORD_SIZE};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Status reported by `RecvHeader` when no PDU is queued (Darwin `EAGAIN`)
pub const STATUS_NO_PDU: u64 = 35;

/// A one-shot failure applied to the next call of a selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail the call outright; engine state is not touched
    Return(ReturnCode),
    /// Process the call, then report this many scalar outputs
    ScalarCount(usize),
    /// Process the call, then overwrite the status scalar
    Status(u64),
    /// Process the call, then report this many output structure bytes
    ShortTransfer(usize),
}

/// A PDU the bridge delivered to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPdu {
    pub header: BasicHeaderSegment,
    pub data: Vec<u8>,
}

struct ConnectionState {
    options: ConnectionOptions,
    target: SocketAddr,
    host: SocketAddr,
    sent: Vec<SentPdu>,
    inbound: VecDeque<(BasicHeaderSegment, Vec<u8>)>,
    // Data segment of the last header handed out by RecvHeader
    pending_data: Option<Vec<u8>>,
}

struct SessionState {
    options: SessionOptions,
    connections: BTreeMap<u32, ConnectionState>,
}

struct EngineState {
    initialized: bool,
    handles_open: usize,
    open_error: Option<ReturnCode>,
    next_session: u16,
    next_connection: u32,
    sessions: BTreeMap<u16, SessionState>,
    staged_header: Option<BasicHeaderSegment>,
    echo: bool,
    calls: HashMap<Selector, usize>,
    struct_out_lens: HashMap<Selector, usize>,
    faults: HashMap<Selector, Fault>,
}

impl EngineState {
    fn new(first_session: u16, first_connection: u32) -> Self {
        EngineState {
            initialized: false,
            handles_open: 0,
            open_error: None,
            next_session: first_session.max(1),
            next_connection: first_connection.max(1),
            sessions: BTreeMap::new(),
            staged_header: None,
            echo: false,
            calls: HashMap::new(),
            struct_out_lens: HashMap::new(),
            faults: HashMap::new(),
        }
    }

    fn allocate_session_id(&mut self) -> u16 {
        let id = self.next_session;
        self.next_session = self.next_session.wrapping_add(1).max(1);
        id
    }

    fn allocate_connection_id(&mut self) -> u32 {
        let id = self.next_connection;
        self.next_connection = self.next_connection.wrapping_add(1).max(1);
        id
    }

    fn session(&mut self, scalar_in: &[u64]) -> Result<&mut SessionState, ReturnCode> {
        let sid = scalar(scalar_in, 0)?;
        u16::try_from(sid)
            .ok()
            .and_then(|sid| self.sessions.get_mut(&sid))
            .ok_or(ReturnCode::NOT_FOUND)
    }

    fn connection(&mut self, scalar_in: &[u64]) -> Result<&mut ConnectionState, ReturnCode> {
        let cid = scalar(scalar_in, 1)?;
        let session = self.session(scalar_in)?;
        u32::try_from(cid)
            .ok()
            .and_then(|cid| session.connections.get_mut(&cid))
            .ok_or(ReturnCode::NOT_FOUND)
    }

    fn dispatch(
        &mut self,
        selector: Selector,
        scalar_in: &[u64],
        struct_in: &[u8],
        scalar_out: &mut [u64],
        struct_out: &mut [u8],
    ) -> Result<CallOutput, ReturnCode> {
        if !self.initialized && !matches!(selector, Selector::Open | Selector::Close) {
            return Err(ReturnCode::NOT_OPEN);
        }

        match selector {
            Selector::Open => {
                self.initialized = true;
                Ok(CallOutput::default())
            }
            Selector::Close => {
                self.initialized = false;
                self.sessions.clear();
                self.staged_header = None;
                Ok(CallOutput::default())
            }
            Selector::CreateSession => {
                let id = self.allocate_session_id();
                self.sessions.insert(
                    id,
                    SessionState {
                        options: SessionOptions::default(),
                        connections: BTreeMap::new(),
                    },
                );
                put_scalar(scalar_out, id as u64)
            }
            Selector::ReleaseSession => {
                let sid = scalar(scalar_in, 0)?;
                u16::try_from(sid)
                    .ok()
                    .and_then(|sid| self.sessions.remove(&sid))
                    .map(|_| CallOutput::default())
                    .ok_or(ReturnCode::NOT_FOUND)
            }
            Selector::SetSessionOptions => {
                let raw: [u8; SESSION_OPTIONS_SIZE] =
                    struct_in.try_into().map_err(|_| ReturnCode::BAD_ARGUMENT)?;
                self.session(scalar_in)?.options = SessionOptions::from_bytes(raw);
                Ok(CallOutput::default())
            }
            Selector::GetSessionOptions => {
                let options = self.session(scalar_in)?.options.clone();
                put_struct(struct_out, options.as_bytes())
            }
            Selector::CreateConnection => {
                let family = scalar(scalar_in, 1)?;
                if struct_in.len() != 2 * SOCKADDR_RECORD_SIZE {
                    return Err(ReturnCode::BAD_ARGUMENT);
                }
                let target = sockaddr::decode(&struct_in[..SOCKADDR_RECORD_SIZE])
                    .map_err(|_| ReturnCode::BAD_ARGUMENT)?;
                let host = sockaddr::decode(&struct_in[SOCKADDR_RECORD_SIZE..])
                    .map_err(|_| ReturnCode::BAD_ARGUMENT)?;
                if AddressFamily::of(&target).raw() as u64 != family {
                    return Err(ReturnCode::BAD_ARGUMENT);
                }
                self.session(scalar_in)?;

                let id = self.allocate_connection_id();
                self.session(scalar_in)?.connections.insert(
                    id,
                    ConnectionState {
                        options: ConnectionOptions::default(),
                        target,
                        host,
                        sent: Vec::new(),
                        inbound: VecDeque::new(),
                        pending_data: None,
                    },
                );
                put_scalar(scalar_out, id as u64)
            }
            Selector::ReleaseConnection => {
                let cid = scalar(scalar_in, 1)?;
                let session = self.session(scalar_in)?;
                u32::try_from(cid)
                    .ok()
                    .and_then(|cid| session.connections.remove(&cid))
                    .map(|_| CallOutput::default())
                    .ok_or(ReturnCode::NOT_FOUND)
            }
            Selector::SetConnectionOptions => {
                let raw: [u8; CONNECTION_OPTIONS_SIZE] =
                    struct_in.try_into().map_err(|_| ReturnCode::BAD_ARGUMENT)?;
                self.connection(scalar_in)?.options = ConnectionOptions::from_bytes(raw);
                Ok(CallOutput::default())
            }
            Selector::GetConnectionOptions => {
                let options = self.connection(scalar_in)?.options.clone();
                put_struct(struct_out, options.as_bytes())
            }
            Selector::GetActiveConnection => {
                let session = self.session(scalar_in)?;
                let active = session.connections.keys().next().copied().unwrap_or(0);
                put_scalar(scalar_out, active as u64)
            }
            Selector::SendHeader => {
                if struct_in.len() != BHS_SIZE {
                    return Err(ReturnCode::BAD_ARGUMENT);
                }
                self.staged_header = BasicHeaderSegment::from_bytes(struct_in).ok();
                Ok(CallOutput::default())
            }
            Selector::SendData => {
                let staged = self.staged_header.take();
                let echo = self.echo;
                let connection = self.connection(scalar_in)?;
                let status = match staged {
                    Some(header) => {
                        if echo {
                            let mut data = struct_in.to_vec();
                            data.resize(header.padded_data_segment_length(), 0);
                            connection.inbound.push_back((header.clone(), data));
                        }
                        connection.sent.push(SentPdu {
                            header,
                            data: struct_in.to_vec(),
                        });
                        0
                    }
                    None => errno::EINVAL as u64,
                };
                put_scalar(scalar_out, status)
            }
            Selector::RecvHeader => {
                if struct_out.len() < BHS_SIZE {
                    return Err(ReturnCode::BAD_ARGUMENT);
                }
                let connection = self.connection(scalar_in)?;
                match connection.inbound.pop_front() {
                    Some((header, data)) => {
                        connection.pending_data = Some(data);
                        let output = put_struct(struct_out, header.as_bytes())?;
                        put_scalar(scalar_out, 0).map(|status| CallOutput {
                            struct_len: output.struct_len,
                            ..status
                        })
                    }
                    None => put_scalar(scalar_out, STATUS_NO_PDU),
                }
            }
            Selector::RecvData => {
                let connection = self.connection(scalar_in)?;
                match connection.pending_data.take() {
                    Some(data) if struct_out.len() < data.len() => {
                        connection.pending_data = Some(data);
                        Err(ReturnCode::BAD_ARGUMENT)
                    }
                    Some(data) => {
                        let output = put_struct(struct_out, &data)?;
                        put_scalar(scalar_out, 0).map(|status| CallOutput {
                            struct_len: output.struct_len,
                            ..status
                        })
                    }
                    None => put_scalar(scalar_out, errno::EIO as u64),
                }
            }
        }
    }
}

fn scalar(scalar_in: &[u64], index: usize) -> Result<u64, ReturnCode> {
    scalar_in.get(index).copied().ok_or(ReturnCode::BAD_ARGUMENT)
}

fn put_scalar(scalar_out: &mut [u64], value: u64) -> Result<CallOutput, ReturnCode> {
    let slot = scalar_out.first_mut().ok_or(ReturnCode::BAD_ARGUMENT)?;
    *slot = value;
    Ok(CallOutput {
        scalar_count: 1,
        struct_len: 0,
    })
}

fn put_struct(struct_out: &mut [u8], bytes: &[u8]) -> Result<CallOutput, ReturnCode> {
    if struct_out.len() < bytes.len() {
        return Err(ReturnCode::BAD_ARGUMENT);
    }
    struct_out[..bytes.len()].copy_from_slice(bytes);
    Ok(CallOutput {
        scalar_count: 0,
        struct_len: bytes.len(),
    })
}

/// Shared handle to an in-memory engine
///
/// Clones observe and drive the same engine.
#[derive(Clone)]
pub struct LoopbackEngine {
    state: Arc<Mutex<EngineState>>,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackEngine {
    /// Engine whose first session and connection IDs are both 1
    pub fn new() -> Self {
        Self::with_first_ids(1, 1)
    }

    /// Engine that hands out IDs counting up from the given values
    pub fn with_first_ids(first_session: u16, first_connection: u32) -> Self {
        LoopbackEngine {
            state: Arc::new(Mutex::new(EngineState::new(first_session, first_connection))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registry that publishes this engine under the default service name
    pub fn registry(&self) -> LoopbackRegistry {
        self.registry_named(DEFAULT_SERVICE_NAME)
    }

    pub fn registry_named(&self, class_name: &str) -> LoopbackRegistry {
        LoopbackRegistry {
            class_name: class_name.to_string(),
            engine: self.clone(),
        }
    }

    /// Make the next attempt to open a handle fail with `rc`
    pub fn fail_open(&self, rc: ReturnCode) {
        self.lock().open_error = Some(rc);
    }

    /// Apply `fault` to the next call of `selector`
    pub fn inject_fault(&self, selector: Selector, fault: Fault) {
        self.lock().faults.insert(selector, fault);
    }

    /// Make the next `CreateSession` hand out `id`, even if it is in use
    pub fn set_next_session_id(&self, id: u16) {
        self.lock().next_session = id.max(1);
    }

    /// Queue every sent PDU back as inbound on the same connection
    pub fn set_echo(&self, echo: bool) {
        self.lock().echo = echo;
    }

    /// Queue an inbound PDU on a connection
    ///
    /// `data` is padded (or cut) to the header's padded data segment length.
    /// Returns false if the connection does not exist.
    pub fn queue_inbound(
        &self,
        session: u16,
        connection: u32,
        header: BasicHeaderSegment,
        mut data: Vec<u8>,
    ) -> bool {
        let mut state = self.lock();
        let Some(conn) = state
            .sessions
            .get_mut(&session)
            .and_then(|s| s.connections.get_mut(&connection))
        else {
            return false;
        };
        data.resize(header.padded_data_segment_length(), 0);
        conn.inbound.push_back((header, data));
        true
    }

    /// PDUs delivered on a connection, oldest first
    pub fn sent_pdus(&self, session: u16, connection: u32) -> Vec<SentPdu> {
        self.lock()
            .sessions
            .get(&session)
            .and_then(|s| s.connections.get(&connection))
            .map(|c| c.sent.clone())
            .unwrap_or_default()
    }

    /// Target and host address a connection was created with
    pub fn connection_addresses(
        &self,
        session: u16,
        connection: u32,
    ) -> Option<(SocketAddr, SocketAddr)> {
        self.lock()
            .sessions
            .get(&session)
            .and_then(|s| s.connections.get(&connection))
            .map(|c| (c.target, c.host))
    }

    pub fn call_count(&self, selector: Selector) -> usize {
        self.lock().calls.get(&selector).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    /// Size of the output structure offered on the last call of `selector`
    pub fn last_struct_out_len(&self, selector: Selector) -> Option<usize> {
        self.lock().struct_out_lens.get(&selector).copied()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn connection_count(&self, session: u16) -> usize {
        self.lock()
            .sessions
            .get(&session)
            .map(|s| s.connections.len())
            .unwrap_or(0)
    }

    /// Whether `Open` has been called without a matching `Close`
    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    pub fn handles_open(&self) -> usize {
        self.lock().handles_open
    }
}

/// Service discovery that knows about one loopback engine
pub struct LoopbackRegistry {
    class_name: String,
    engine: LoopbackEngine,
}

impl ServiceRegistry for LoopbackRegistry {
    type Service = LoopbackService;

    fn matching_service(&self, class_name: &str) -> Option<LoopbackService> {
        (class_name == self.class_name).then(|| LoopbackService {
            engine: self.engine.clone(),
        })
    }
}

/// A located loopback engine
pub struct LoopbackService {
    engine: LoopbackEngine,
}

impl EngineService for LoopbackService {
    type Connection = LoopbackHandle;

    fn open(&self) -> Result<LoopbackHandle, ReturnCode> {
        let mut state = self.engine.lock();
        if let Some(rc) = state.open_error.take() {
            return Err(rc);
        }
        state.handles_open += 1;
        Ok(LoopbackHandle {
            engine: self.engine.clone(),
            closed: false,
        })
    }
}

/// Open handle to a loopback engine
pub struct LoopbackHandle {
    engine: LoopbackEngine,
    closed: bool,
}

impl EngineConnection for LoopbackHandle {
    fn call_method(
        &self,
        selector: Selector,
        scalar_in: &[u64],
        struct_in: &[u8],
        scalar_out: &mut [u64],
        struct_out: &mut [u8],
    ) -> Result<CallOutput, ReturnCode> {
        let mut state = self.engine.lock();
        *state.calls.entry(selector).or_insert(0) += 1;
        state.struct_out_lens.insert(selector, struct_out.len());

        let fault = state.faults.remove(&selector);
        if let Some(Fault::Return(rc)) = fault {
            return Err(rc);
        }

        let mut output = state.dispatch(selector, scalar_in, struct_in, scalar_out, struct_out)?;
        match fault {
            Some(Fault::ScalarCount(n)) => output.scalar_count = n,
            Some(Fault::Status(status)) => {
                if let Some(slot) = scalar_out.first_mut() {
                    *slot = status;
                }
            }
            Some(Fault::ShortTransfer(n)) => output.struct_len = n,
            Some(Fault::Return(_)) | None => {}
        }
        Ok(output)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.engine.lock().handles_open -= 1;
        }
    }
}
