//! Session and connection option blocks
//!
//! The engine exchanges options as fixed-size structures. Each block here is
//! stored as those exact bytes; the typed accessors read and write fields in
//! place, so whatever bytes were set are the bytes that come back.
//!
//! Field values are the operational keys of RFC 3720 Section 12, with the
//! RFC defaults used by `Default`.

use crate::channel::ControlChannel;
use crate::engine::{EngineService, Selector};
use crate::error::{KernelError, KernelResult};
use crate::resources::{ConnectionId, SessionId};
use byteorder::{ByteOrder, NativeEndian};

/// Size of the session option block in bytes
pub const SESSION_OPTIONS_SIZE: usize = 36;

/// Size of the connection option block in bytes
pub const CONNECTION_OPTIONS_SIZE: usize = 20;

mod session_layout {
    pub const MAX_CONNECTIONS: usize = 0;
    pub const MAX_OUTSTANDING_R2T: usize = 4;
    pub const FIRST_BURST_LENGTH: usize = 8;
    pub const MAX_BURST_LENGTH: usize = 12;
    pub const DEFAULT_TIME2WAIT: usize = 16;
    pub const DEFAULT_TIME2RETAIN: usize = 20;
    pub const ERROR_RECOVERY_LEVEL: usize = 24;
    pub const IMMEDIATE_DATA: usize = 25;
    pub const INITIAL_R2T: usize = 26;
    pub const DATA_PDU_IN_ORDER: usize = 27;
    pub const DATA_SEQUENCE_IN_ORDER: usize = 28;
    // 29 reserved
    pub const TSIH: usize = 30;
    pub const TARGET_PORTAL_GROUP_TAG: usize = 32;
    // 34..36 reserved
}

mod connection_layout {
    pub const HEADER_DIGEST: usize = 0;
    pub const DATA_DIGEST: usize = 1;
    pub const IF_MARKER: usize = 2;
    pub const OF_MARKER: usize = 3;
    pub const IF_MARK_INT: usize = 4;
    pub const OF_MARK_INT: usize = 6;
    pub const MAX_SEND_DATA_SEGMENT_LENGTH: usize = 8;
    pub const MAX_RECV_DATA_SEGMENT_LENGTH: usize = 12;
    pub const INITIAL_EXP_STAT_SN: usize = 16;
}

/// Digest type for header/data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestType {
    #[default]
    None,
    CRC32C,
}

impl DigestType {
    fn from_byte(b: u8) -> Self {
        if b != 0 {
            DigestType::CRC32C
        } else {
            DigestType::None
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            DigestType::None => 0,
            DigestType::CRC32C => 1,
        }
    }
}

/// Negotiated session parameters, as exchanged with the engine
#[derive(Clone, PartialEq, Eq)]
pub struct SessionOptions {
    raw: [u8; SESSION_OPTIONS_SIZE],
}

impl Default for SessionOptions {
    fn default() -> Self {
        let mut options = SessionOptions::zeroed();
        options.set_max_connections(1);
        options.set_max_outstanding_r2t(1);
        options.set_first_burst_length(65536);
        options.set_max_burst_length(262144);
        options.set_default_time2wait(2);
        options.set_default_time2retain(20);
        options.set_error_recovery_level(0);
        options.set_immediate_data(true);
        options.set_initial_r2t(true);
        options.set_data_pdu_in_order(true);
        options.set_data_sequence_in_order(true);
        options
    }
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("max_connections", &self.max_connections())
            .field("max_outstanding_r2t", &self.max_outstanding_r2t())
            .field("first_burst_length", &self.first_burst_length())
            .field("max_burst_length", &self.max_burst_length())
            .field("default_time2wait", &self.default_time2wait())
            .field("default_time2retain", &self.default_time2retain())
            .field("error_recovery_level", &self.error_recovery_level())
            .field("immediate_data", &self.immediate_data())
            .field("initial_r2t", &self.initial_r2t())
            .field("data_pdu_in_order", &self.data_pdu_in_order())
            .field("data_sequence_in_order", &self.data_sequence_in_order())
            .field("tsih", &self.tsih())
            .field("target_portal_group_tag", &self.target_portal_group_tag())
            .finish()
    }
}

impl SessionOptions {
    /// All-zero block
    pub fn zeroed() -> Self {
        SessionOptions {
            raw: [0u8; SESSION_OPTIONS_SIZE],
        }
    }

    pub fn from_bytes(raw: [u8; SESSION_OPTIONS_SIZE]) -> Self {
        SessionOptions { raw }
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_OPTIONS_SIZE] {
        &self.raw
    }

    pub fn max_connections(&self) -> u32 {
        NativeEndian::read_u32(&self.raw[session_layout::MAX_CONNECTIONS..])
    }

    pub fn set_max_connections(&mut self, v: u32) {
        NativeEndian::write_u32(&mut self.raw[session_layout::MAX_CONNECTIONS..], v);
    }

    pub fn max_outstanding_r2t(&self) -> u32 {
        NativeEndian::read_u32(&self.raw[session_layout::MAX_OUTSTANDING_R2T..])
    }

    pub fn set_max_outstanding_r2t(&mut self, v: u32) {
        NativeEndian::write_u32(&mut self.raw[session_layout::MAX_OUTSTANDING_R2T..], v);
    }

    /// Maximum unsolicited data in bytes (default: 65536)
    pub fn first_burst_length(&self) -> u32 {
        NativeEndian::read_u32(&self.raw[session_layout::FIRST_BURST_LENGTH..])
    }

    pub fn set_first_burst_length(&mut self, v: u32) {
        NativeEndian::write_u32(&mut self.raw[session_layout::FIRST_BURST_LENGTH..], v);
    }

    /// Maximum solicited data sequence in bytes (default: 262144)
    pub fn max_burst_length(&self) -> u32 {
        NativeEndian::read_u32(&self.raw[session_layout::MAX_BURST_LENGTH..])
    }

    pub fn set_max_burst_length(&mut self, v: u32) {
        NativeEndian::write_u32(&mut self.raw[session_layout::MAX_BURST_LENGTH..], v);
    }

    /// Seconds to wait before reconnecting (default: 2)
    pub fn default_time2wait(&self) -> u32 {
        NativeEndian::read_u32(&self.raw[session_layout::DEFAULT_TIME2WAIT..])
    }

    pub fn set_default_time2wait(&mut self, v: u32) {
        NativeEndian::write_u32(&mut self.raw[session_layout::DEFAULT_TIME2WAIT..], v);
    }

    /// Seconds task state is retained after a connection drop (default: 20)
    pub fn default_time2retain(&self) -> u32 {
        NativeEndian::read_u32(&self.raw[session_layout::DEFAULT_TIME2RETAIN..])
    }

    pub fn set_default_time2retain(&mut self, v: u32) {
        NativeEndian::write_u32(&mut self.raw[session_layout::DEFAULT_TIME2RETAIN..], v);
    }

    pub fn error_recovery_level(&self) -> u8 {
        self.raw[session_layout::ERROR_RECOVERY_LEVEL]
    }

    pub fn set_error_recovery_level(&mut self, v: u8) {
        self.raw[session_layout::ERROR_RECOVERY_LEVEL] = v;
    }

    pub fn immediate_data(&self) -> bool {
        self.raw[session_layout::IMMEDIATE_DATA] != 0
    }

    pub fn set_immediate_data(&mut self, v: bool) {
        self.raw[session_layout::IMMEDIATE_DATA] = v as u8;
    }

    pub fn initial_r2t(&self) -> bool {
        self.raw[session_layout::INITIAL_R2T] != 0
    }

    pub fn set_initial_r2t(&mut self, v: bool) {
        self.raw[session_layout::INITIAL_R2T] = v as u8;
    }

    pub fn data_pdu_in_order(&self) -> bool {
        self.raw[session_layout::DATA_PDU_IN_ORDER] != 0
    }

    pub fn set_data_pdu_in_order(&mut self, v: bool) {
        self.raw[session_layout::DATA_PDU_IN_ORDER] = v as u8;
    }

    pub fn data_sequence_in_order(&self) -> bool {
        self.raw[session_layout::DATA_SEQUENCE_IN_ORDER] != 0
    }

    pub fn set_data_sequence_in_order(&mut self, v: bool) {
        self.raw[session_layout::DATA_SEQUENCE_IN_ORDER] = v as u8;
    }

    /// Target Session Identifying Handle assigned at login
    pub fn tsih(&self) -> u16 {
        NativeEndian::read_u16(&self.raw[session_layout::TSIH..])
    }

    pub fn set_tsih(&mut self, v: u16) {
        NativeEndian::write_u16(&mut self.raw[session_layout::TSIH..], v);
    }

    pub fn target_portal_group_tag(&self) -> u16 {
        NativeEndian::read_u16(&self.raw[session_layout::TARGET_PORTAL_GROUP_TAG..])
    }

    pub fn set_target_portal_group_tag(&mut self, v: u16) {
        NativeEndian::write_u16(&mut self.raw[session_layout::TARGET_PORTAL_GROUP_TAG..], v);
    }
}

/// Negotiated per-connection parameters, as exchanged with the engine
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    raw: [u8; CONNECTION_OPTIONS_SIZE],
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        let mut options = ConnectionOptions::zeroed();
        options.set_if_mark_int(2048);
        options.set_of_mark_int(2048);
        options.set_max_send_data_segment_length(8192);
        options.set_max_recv_data_segment_length(8192);
        options
    }
}

impl std::fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("header_digest", &self.header_digest())
            .field("data_digest", &self.data_digest())
            .field("if_marker", &self.if_marker())
            .field("of_marker", &self.of_marker())
            .field("if_mark_int", &self.if_mark_int())
            .field("of_mark_int", &self.of_mark_int())
            .field("max_send_data_segment_length", &self.max_send_data_segment_length())
            .field("max_recv_data_segment_length", &self.max_recv_data_segment_length())
            .field("initial_exp_stat_sn", &self.initial_exp_stat_sn())
            .finish()
    }
}

impl ConnectionOptions {
    /// All-zero block
    pub fn zeroed() -> Self {
        ConnectionOptions {
            raw: [0u8; CONNECTION_OPTIONS_SIZE],
        }
    }

    pub fn from_bytes(raw: [u8; CONNECTION_OPTIONS_SIZE]) -> Self {
        ConnectionOptions { raw }
    }

    pub fn as_bytes(&self) -> &[u8; CONNECTION_OPTIONS_SIZE] {
        &self.raw
    }

    pub fn header_digest(&self) -> DigestType {
        DigestType::from_byte(self.raw[connection_layout::HEADER_DIGEST])
    }

    pub fn set_header_digest(&mut self, v: DigestType) {
        self.raw[connection_layout::HEADER_DIGEST] = v.to_byte();
    }

    pub fn data_digest(&self) -> DigestType {
        DigestType::from_byte(self.raw[connection_layout::DATA_DIGEST])
    }

    pub fn set_data_digest(&mut self, v: DigestType) {
        self.raw[connection_layout::DATA_DIGEST] = v.to_byte();
    }

    pub fn if_marker(&self) -> bool {
        self.raw[connection_layout::IF_MARKER] != 0
    }

    pub fn set_if_marker(&mut self, v: bool) {
        self.raw[connection_layout::IF_MARKER] = v as u8;
    }

    pub fn of_marker(&self) -> bool {
        self.raw[connection_layout::OF_MARKER] != 0
    }

    pub fn set_of_marker(&mut self, v: bool) {
        self.raw[connection_layout::OF_MARKER] = v as u8;
    }

    /// Initiator-to-target marker interval in 4-byte words
    pub fn if_mark_int(&self) -> u16 {
        NativeEndian::read_u16(&self.raw[connection_layout::IF_MARK_INT..])
    }

    pub fn set_if_mark_int(&mut self, v: u16) {
        NativeEndian::write_u16(&mut self.raw[connection_layout::IF_MARK_INT..], v);
    }

    /// Target-to-initiator marker interval in 4-byte words
    pub fn of_mark_int(&self) -> u16 {
        NativeEndian::read_u16(&self.raw[connection_layout::OF_MARK_INT..])
    }

    pub fn set_of_mark_int(&mut self, v: u16) {
        NativeEndian::write_u16(&mut self.raw[connection_layout::OF_MARK_INT..], v);
    }

    /// Largest data segment the target accepts (its MaxRecvDataSegmentLength)
    pub fn max_send_data_segment_length(&self) -> u32 {
        NativeEndian::read_u32(&self.raw[connection_layout::MAX_SEND_DATA_SEGMENT_LENGTH..])
    }

    pub fn set_max_send_data_segment_length(&mut self, v: u32) {
        let offset = connection_layout::MAX_SEND_DATA_SEGMENT_LENGTH;
        NativeEndian::write_u32(&mut self.raw[offset..], v);
    }

    pub fn max_recv_data_segment_length(&self) -> u32 {
        NativeEndian::read_u32(&self.raw[connection_layout::MAX_RECV_DATA_SEGMENT_LENGTH..])
    }

    pub fn set_max_recv_data_segment_length(&mut self, v: u32) {
        let offset = connection_layout::MAX_RECV_DATA_SEGMENT_LENGTH;
        NativeEndian::write_u32(&mut self.raw[offset..], v);
    }

    pub fn initial_exp_stat_sn(&self) -> u32 {
        NativeEndian::read_u32(&self.raw[connection_layout::INITIAL_EXP_STAT_SN..])
    }

    pub fn set_initial_exp_stat_sn(&mut self, v: u32) {
        NativeEndian::write_u32(&mut self.raw[connection_layout::INITIAL_EXP_STAT_SN..], v);
    }
}

impl<S: EngineService> ControlChannel<S> {
    /// Push the full session option block to the engine
    pub fn set_session_options(
        &self,
        session: SessionId,
        options: &SessionOptions,
    ) -> KernelResult<()> {
        self.resources().check_session(session)?;
        self.invoke(
            Selector::SetSessionOptions,
            &[session.get() as u64],
            options.as_bytes(),
            &mut [],
            &mut [],
        )?;
        log::debug!("Set options for session {}: {:?}", session, options);
        Ok(())
    }

    /// Fill `options` with the engine's session option block
    ///
    /// `options` is left untouched unless the engine returns a complete block.
    pub fn get_session_options(
        &self,
        session: SessionId,
        options: &mut SessionOptions,
    ) -> KernelResult<()> {
        self.resources().check_session(session)?;

        let mut raw = [0u8; SESSION_OPTIONS_SIZE];
        let output = self.invoke(
            Selector::GetSessionOptions,
            &[session.get() as u64],
            &[],
            &mut [],
            &mut raw,
        )?;
        expect_struct_len(Selector::GetSessionOptions, output.struct_len, SESSION_OPTIONS_SIZE)?;

        *options = SessionOptions::from_bytes(raw);
        Ok(())
    }

    /// Push the full connection option block to the engine
    pub fn set_connection_options(
        &self,
        session: SessionId,
        connection: ConnectionId,
        options: &ConnectionOptions,
    ) -> KernelResult<()> {
        self.resources().check_connection(session, connection)?;
        self.invoke(
            Selector::SetConnectionOptions,
            &[session.get() as u64, connection.get() as u64],
            options.as_bytes(),
            &mut [],
            &mut [],
        )?;
        log::debug!(
            "Set options for connection {} of session {}: {:?}",
            connection,
            session,
            options
        );
        Ok(())
    }

    /// Fill `options` with the engine's connection option block
    ///
    /// `options` is left untouched unless the engine returns a complete block.
    pub fn get_connection_options(
        &self,
        session: SessionId,
        connection: ConnectionId,
        options: &mut ConnectionOptions,
    ) -> KernelResult<()> {
        self.resources().check_connection(session, connection)?;

        let mut raw = [0u8; CONNECTION_OPTIONS_SIZE];
        let output = self.invoke(
            Selector::GetConnectionOptions,
            &[session.get() as u64, connection.get() as u64],
            &[],
            &mut [],
            &mut raw,
        )?;
        expect_struct_len(
            Selector::GetConnectionOptions,
            output.struct_len,
            CONNECTION_OPTIONS_SIZE,
        )?;

        *options = ConnectionOptions::from_bytes(raw);
        Ok(())
    }
}

fn expect_struct_len(selector: Selector, actual: usize, expected: usize) -> KernelResult<()> {
    if actual != expected {
        return Err(KernelError::Io(format!(
            "{} transferred {} bytes, expected {}",
            selector, actual, expected
        )));
    }
    Ok(())
}
