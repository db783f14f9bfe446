//! User-space control channel to an in-kernel iSCSI transport engine
//!
//! The engine owns the TCP sockets and the iSCSI wire traffic. This crate is
//! the bridge a user-space initiator drives it through: it locates and opens
//! the engine, allocates sessions and connections, pushes and pulls
//! negotiated option blocks, and moves PDUs across the boundary as a 48-byte
//! Basic Header Segment plus an optional data segment.
//!
//! Every request crosses the boundary as one
//! [`EngineConnection::call_method`](engine::EngineConnection::call_method)
//! call identified by a [`Selector`](engine::Selector). Platform bindings
//! implement the traits in [`engine`]; [`loopback`] provides an in-process
//! engine for tests and demos.
//!
//! # Example
//!
//! ```no_run
//! use iscsi_kernel_bridge::loopback::LoopbackEngine;
//! use iscsi_kernel_bridge::{AddressFamily, BasicHeaderSegment, ChannelBuilder};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = LoopbackEngine::new();
//! let channel = ChannelBuilder::new().trace_pdus(true).open(&engine.registry())?;
//!
//! let session = channel.create_session()?;
//! let target = "192.0.2.10:3260".parse()?;
//! let host = "192.0.2.1:0".parse()?;
//! let connection = channel.create_connection(session, AddressFamily::Inet, &target, &host)?;
//!
//! let mut header = BasicHeaderSegment::new();
//! header.set_opcode(iscsi_kernel_bridge::pdu::opcode::LOGIN_REQUEST);
//! header.set_data_segment_length(4)?;
//! channel.send(session, connection, &header, b"ping")?;
//!
//! let mut reply = BasicHeaderSegment::new();
//! let data = channel.receive(session, connection, &mut reply)?;
//! println!("{} with {} data bytes", reply.opcode_name(), data.len());
//!
//! channel.release_connection(session, connection);
//! channel.release_session(session);
//! channel.close()?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod engine;
pub mod error;
pub mod loopback;
pub mod options;
pub mod pdu;
pub mod resources;
pub mod sockaddr;
pub mod transport;

pub use channel::{ChannelBuilder, ChannelConfig, ControlChannel, DEFAULT_SERVICE_NAME};
pub use error::{KernelError, KernelResult};
pub use options::{ConnectionOptions, DigestType, SessionOptions};
pub use pdu::{BasicHeaderSegment, DataSegment};
pub use resources::{AddressFamily, ConnectionId, SessionId};

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
