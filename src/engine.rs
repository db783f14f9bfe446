//! The privilege boundary between user space and the transport engine
//!
//! Every operation the bridge performs is one call through
//! [`EngineConnection::call_method`]: a selector, some scalar inputs, an
//! optional input structure, room for scalar outputs and an optional output
//! structure. Implementations wrap whatever user/kernel call mechanism the
//! host provides; [`crate::loopback`] implements it in-process for tests.

use std::fmt;

/// Method selectors understood by the transport engine
///
/// | Selector | Scalar in | Struct in | Scalar out | Struct out |
/// |---|---|---|---|---|
/// | `Open` | - | - | - | - |
/// | `Close` | - | - | - | - |
/// | `CreateSession` | - | - | session | - |
/// | `ReleaseSession` | session | - | - | - |
/// | `SetSessionOptions` | session | options | - | - |
/// | `GetSessionOptions` | session | - | - | options |
/// | `CreateConnection` | session, family | target, host | connection | - |
/// | `ReleaseConnection` | session, connection | - | - | - |
/// | `SetConnectionOptions` | session, connection | options | - | - |
/// | `GetConnectionOptions` | session, connection | - | - | options |
/// | `GetActiveConnection` | session | - | connection | - |
/// | `SendHeader` | - | BHS | - | - |
/// | `SendData` | session, connection | data | status | - |
/// | `RecvHeader` | session, connection | - | status | BHS |
/// | `RecvData` | session, connection | - | status | data |
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Selector {
    Open = 0,
    Close = 1,
    CreateSession = 2,
    ReleaseSession = 3,
    SetSessionOptions = 4,
    GetSessionOptions = 5,
    CreateConnection = 6,
    ReleaseConnection = 7,
    SetConnectionOptions = 8,
    GetConnectionOptions = 9,
    GetActiveConnection = 10,
    SendHeader = 11,
    SendData = 12,
    RecvHeader = 13,
    RecvData = 14,
}

impl Selector {
    /// All selectors in discriminant order
    pub const ALL: [Selector; 15] = [
        Selector::Open,
        Selector::Close,
        Selector::CreateSession,
        Selector::ReleaseSession,
        Selector::SetSessionOptions,
        Selector::GetSessionOptions,
        Selector::CreateConnection,
        Selector::ReleaseConnection,
        Selector::SetConnectionOptions,
        Selector::GetConnectionOptions,
        Selector::GetActiveConnection,
        Selector::SendHeader,
        Selector::SendData,
        Selector::RecvHeader,
        Selector::RecvData,
    ];

    pub fn from_u32(val: u32) -> Option<Self> {
        Self::ALL.get(val as usize).copied()
    }

    /// Get the selector name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Selector::Open => "Open",
            Selector::Close => "Close",
            Selector::CreateSession => "CreateSession",
            Selector::ReleaseSession => "ReleaseSession",
            Selector::SetSessionOptions => "SetSessionOptions",
            Selector::GetSessionOptions => "GetSessionOptions",
            Selector::CreateConnection => "CreateConnection",
            Selector::ReleaseConnection => "ReleaseConnection",
            Selector::SetConnectionOptions => "SetConnectionOptions",
            Selector::GetConnectionOptions => "GetConnectionOptions",
            Selector::GetActiveConnection => "GetActiveConnection",
            Selector::SendHeader => "SendHeader",
            Selector::SendData => "SendData",
            Selector::RecvHeader => "RecvHeader",
            Selector::RecvData => "RecvData",
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Return code of a failed privileged call (IOKit `kern_return_t` values)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReturnCode(pub i32);

impl ReturnCode {
    pub const ERROR: ReturnCode = ReturnCode(0xE000_02BC_u32 as i32);
    pub const NO_MEMORY: ReturnCode = ReturnCode(0xE000_02BD_u32 as i32);
    pub const NO_RESOURCES: ReturnCode = ReturnCode(0xE000_02BE_u32 as i32);
    pub const BAD_ARGUMENT: ReturnCode = ReturnCode(0xE000_02C2_u32 as i32);
    pub const UNSUPPORTED: ReturnCode = ReturnCode(0xE000_02C7_u32 as i32);
    pub const NOT_OPEN: ReturnCode = ReturnCode(0xE000_02CD_u32 as i32);
    pub const NOT_FOUND: ReturnCode = ReturnCode(0xE000_02F0_u32 as i32);
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0 as u32)
    }
}

/// What a successful privileged call produced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOutput {
    /// Number of scalar outputs the engine wrote
    pub scalar_count: usize,
    /// Number of bytes the engine wrote into the output structure
    pub struct_len: usize,
}

/// An open handle to the transport engine
///
/// `scalar_out` is sized to the number of scalars the caller expects and
/// `struct_out` to the exact size of the structure it expects back. Calls
/// block until the engine completes them.
pub trait EngineConnection: Send + Sync {
    fn call_method(
        &self,
        selector: Selector,
        scalar_in: &[u64],
        struct_in: &[u8],
        scalar_out: &mut [u64],
        struct_out: &mut [u8],
    ) -> Result<CallOutput, ReturnCode>;

    /// Close the handle. Called exactly once by the owning channel.
    fn close(&mut self);
}

/// A located, not yet opened, engine service
pub trait EngineService {
    type Connection: EngineConnection;

    fn open(&self) -> Result<Self::Connection, ReturnCode>;
}

/// Service discovery for the transport engine
pub trait ServiceRegistry {
    type Service: EngineService;

    /// Find the service registered under `class_name`, if any
    fn matching_service(&self, class_name: &str) -> Option<Self::Service>;
}
