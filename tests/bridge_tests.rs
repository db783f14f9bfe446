//! Integration tests for the kernel control channel
//!
//! These drive the public API against the loopback engine. They cover:
//! - Channel lifecycle and configuration
//! - Session and connection bookkeeping
//! - Option block transfer
//! - PDU send and receive
//! - Error reporting

use iscsi_kernel_bridge::engine::Selector;
use iscsi_kernel_bridge::loopback::{Fault, LoopbackEngine, LoopbackService};
use iscsi_kernel_bridge::pdu::opcode;
use iscsi_kernel_bridge::{
    AddressFamily, BasicHeaderSegment, ChannelBuilder, ConnectionId, ConnectionOptions,
    ControlChannel, DigestType, KernelError, SessionId, SessionOptions,
};
use once_cell::sync::Lazy;
use std::env;
use std::net::SocketAddr;

// ============================================================================
// Test Configuration Module
// ============================================================================

#[derive(Debug)]
struct TestConfig {
    service_name: String,
    first_session: u16,
    first_connection: u32,
    target: SocketAddr,
    host: SocketAddr,
}

static TEST_CONFIG: Lazy<TestConfig> = Lazy::new(|| {
    let contents = std::fs::read_to_string("test-config.toml")
        .expect("Failed to read test-config.toml - config file required");

    let config = contents
        .parse::<toml::Value>()
        .expect("Failed to parse test-config.toml - invalid TOML syntax");

    let engine = config
        .get("engine")
        .expect("Missing [engine] section in test-config.toml");

    let configured_name = engine
        .get("service_name")
        .and_then(|n| n.as_str())
        .expect("Missing or invalid 'service_name' in [engine] section");

    let first_session = engine
        .get("first_session")
        .and_then(|s| s.as_integer())
        .expect("Missing or invalid 'first_session' in [engine] section") as u16;

    let first_connection = engine
        .get("first_connection")
        .and_then(|c| c.as_integer())
        .expect("Missing or invalid 'first_connection' in [engine] section")
        as u32;

    let addresses = config
        .get("addresses")
        .expect("Missing [addresses] section in test-config.toml");

    let address = |key: &str| -> SocketAddr {
        addresses
            .get(key)
            .and_then(|a| a.as_str())
            .and_then(|a| a.parse().ok())
            .unwrap_or_else(|| panic!("Missing or invalid '{}' in [addresses] section", key))
    };

    // Service name may be overridden from the environment
    let service_name = if let Ok(name) = env::var("ISCSI_BRIDGE_SERVICE") {
        eprintln!("Using service name from ISCSI_BRIDGE_SERVICE: {}", name);
        name
    } else {
        configured_name.to_string()
    };

    TestConfig {
        service_name,
        first_session,
        first_connection,
        target: address("target"),
        host: address("host"),
    }
});

// ============================================================================
// Test Helper Functions
// ============================================================================

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Engine numbered per test-config.toml
fn configured_engine() -> LoopbackEngine {
    LoopbackEngine::with_first_ids(TEST_CONFIG.first_session, TEST_CONFIG.first_connection)
}

/// Open a channel to `engine` under the configured service name
fn open_channel(engine: &LoopbackEngine) -> ControlChannel<LoopbackService> {
    init_logging();
    ChannelBuilder::new()
        .service_name(&TEST_CONFIG.service_name)
        .trace_pdus(true)
        .open(&engine.registry_named(&TEST_CONFIG.service_name))
        .unwrap_or_else(|e| {
            panic!(
                "Failed to open channel to '{}': {}",
                TEST_CONFIG.service_name, e
            )
        })
}

/// Create a session and one connection with the configured addresses
fn open_connection(channel: &ControlChannel<LoopbackService>) -> (SessionId, ConnectionId) {
    let session = channel.create_session().expect("Failed to create session");
    let family = AddressFamily::of(&TEST_CONFIG.target);
    let connection = channel
        .create_connection(session, family, &TEST_CONFIG.target, &TEST_CONFIG.host)
        .expect("Failed to create connection");
    (session, connection)
}

// ============================================================================
// Channel lifecycle
// ============================================================================

#[test]
fn test_channel_lifecycle() {
    let engine = configured_engine();
    let channel = open_channel(&engine);
    assert!(engine.is_initialized());
    assert_eq!(channel.config().service_name, TEST_CONFIG.service_name);

    channel.close().unwrap();
    assert!(!engine.is_initialized());
    assert_eq!(engine.handles_open(), 0);
}

#[test]
fn test_dropped_channel_shuts_engine_down() {
    let engine = configured_engine();
    {
        let channel = open_channel(&engine);
        open_connection(&channel);
    }
    assert_eq!(engine.call_count(Selector::Close), 1);
    assert_eq!(engine.handles_open(), 0);
}

#[test]
fn test_blank_service_name_rejected() {
    let engine = configured_engine();
    let result = ChannelBuilder::new().service_name("  ").open(&engine.registry());
    assert!(matches!(result, Err(KernelError::Config(_))));
    assert_eq!(engine.total_calls(), 0);
}

// ============================================================================
// Sessions and connections
// ============================================================================

#[test]
fn test_configured_ids_are_handed_out() {
    let engine = configured_engine();
    let channel = open_channel(&engine);
    let (session, connection) = open_connection(&channel);

    assert_eq!(session.get(), TEST_CONFIG.first_session);
    assert_eq!(connection.get(), TEST_CONFIG.first_connection);
    assert_eq!(
        engine.connection_addresses(session.get(), connection.get()),
        Some((TEST_CONFIG.target, TEST_CONFIG.host))
    );
    assert_eq!(channel.active_connection(session).unwrap(), Some(connection));
}

#[test]
fn test_zero_ids_rejected_before_engine() {
    let engine = configured_engine();
    let _channel = open_channel(&engine);
    let calls = engine.total_calls();

    assert!(matches!(
        SessionId::try_from(0u16),
        Err(KernelError::InvalidArgument(_))
    ));
    assert!(matches!(
        ConnectionId::try_from(0u32),
        Err(KernelError::InvalidArgument(_))
    ));
    assert_eq!(engine.total_calls(), calls);
}

#[test]
fn test_foreign_ids_rejected_before_engine() {
    let engine = configured_engine();
    let channel = open_channel(&engine);
    let (session, connection) = open_connection(&channel);
    let calls = engine.total_calls();

    let stranger = SessionId::new(session.get() + 100).unwrap();
    let mut options = SessionOptions::default();
    assert!(matches!(
        channel.get_session_options(stranger, &mut options),
        Err(KernelError::InvalidArgument(_))
    ));

    let other = ConnectionId::new(connection.get() + 1).unwrap();
    let header = BasicHeaderSegment::new();
    assert!(matches!(
        channel.send(session, other, &header, &[]),
        Err(KernelError::InvalidArgument(_))
    ));
    assert_eq!(engine.total_calls(), calls);
}

#[test]
fn test_release_connection_then_query_active() {
    let engine = configured_engine();
    let channel = open_channel(&engine);
    let (session, connection) = open_connection(&channel);

    channel.release_connection(session, connection);
    assert!(channel.is_session_live(session));
    assert_eq!(channel.active_connection(session).unwrap(), None);

    // Second release is a no-op
    channel.release_connection(session, connection);
    assert_eq!(engine.call_count(Selector::ReleaseConnection), 1);
    assert_eq!(engine.connection_count(session.get()), 0);
}

#[test]
fn test_released_session_has_no_active_connection() {
    let engine = configured_engine();
    let channel = open_channel(&engine);
    let session = channel.create_session().unwrap();
    channel.release_session(session);

    assert_eq!(engine.session_count(), 0);
    let calls = engine.total_calls();
    assert!(matches!(
        channel.active_connection(session),
        Err(KernelError::InvalidArgument(_))
    ));
    assert_eq!(engine.total_calls(), calls);
}

#[test]
fn test_release_session_drops_connections() {
    let engine = configured_engine();
    let channel = open_channel(&engine);
    let (session, connection) = open_connection(&channel);

    channel.release_session(session);
    assert!(!channel.is_session_live(session));
    assert!(channel.connections(session).is_empty());
    assert_eq!(engine.session_count(), 0);

    let header = BasicHeaderSegment::new();
    assert!(channel.send(session, connection, &header, &[]).is_err());
}

// ============================================================================
// Option blocks
// ============================================================================

#[test]
fn test_negotiated_options_round_trip() {
    let engine = configured_engine();
    let channel = open_channel(&engine);
    let (session, connection) = open_connection(&channel);

    let mut session_options = SessionOptions::default();
    session_options.set_max_burst_length(1024 * 1024);
    session_options.set_tsih(0x0102);
    channel.set_session_options(session, &session_options).unwrap();

    let mut fetched = SessionOptions::zeroed();
    channel.get_session_options(session, &mut fetched).unwrap();
    assert_eq!(fetched, session_options);

    let mut connection_options = ConnectionOptions::default();
    connection_options.set_header_digest(DigestType::CRC32C);
    connection_options.set_max_recv_data_segment_length(65536);
    channel
        .set_connection_options(session, connection, &connection_options)
        .unwrap();

    let mut fetched = ConnectionOptions::zeroed();
    channel
        .get_connection_options(session, connection, &mut fetched)
        .unwrap();
    assert_eq!(fetched, connection_options);
}

// ============================================================================
// PDU transfer
// ============================================================================

#[test]
fn test_send_then_receive_padded_segment() {
    let engine = configured_engine();
    let channel = open_channel(&engine);
    let (session, connection) = open_connection(&channel);

    let mut header = BasicHeaderSegment::new();
    header.set_opcode(opcode::TEXT_REQUEST);
    header.set_data_segment_length(10).unwrap();
    let payload = b"0123456789";
    channel.send(session, connection, &header, payload).unwrap();

    let sent = engine.sent_pdus(session.get(), connection.get());
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].header, header);
    assert_eq!(sent[0].data, payload);

    // Target answers with the same header; the data segment arrives padded
    let mut inbound = payload.to_vec();
    inbound.extend_from_slice(&[0xAA, 0xBB]);
    assert!(engine.queue_inbound(session.get(), connection.get(), header.clone(), inbound.clone()));

    let mut received = BasicHeaderSegment::new();
    let data = channel.receive(session, connection, &mut received).unwrap();
    assert_eq!(received, header);
    assert_eq!(data.len(), 12);
    assert_eq!(data.capacity(), 12);
    assert_eq!(&data[..], &inbound[..]);
}

#[test]
fn test_echoed_login_exchange() {
    let engine = configured_engine();
    engine.set_echo(true);
    let channel = open_channel(&engine);
    let (session, connection) = open_connection(&channel);

    let text = b"InitiatorName=iqn.2025-12.local:initiator\0";
    let mut header = BasicHeaderSegment::new();
    header.set_opcode(opcode::LOGIN_REQUEST);
    header.set_immediate(true);
    header.set_initiator_task_tag(0x1234);
    header.set_data_segment_length(text.len() as u32).unwrap();
    channel.send(session, connection, &header, text).unwrap();

    let mut reply = BasicHeaderSegment::new();
    let data = channel.receive(session, connection, &mut reply).unwrap();
    assert_eq!(reply.opcode(), opcode::LOGIN_REQUEST);
    assert_eq!(reply.initiator_task_tag(), 0x1234);
    assert_eq!(data.len(), reply.padded_data_segment_length());
    assert_eq!(&data[..text.len()], text);
}

#[test]
fn test_header_only_pdu() {
    let engine = configured_engine();
    let channel = open_channel(&engine);
    let (session, connection) = open_connection(&channel);

    let mut nop = BasicHeaderSegment::new();
    nop.set_opcode(opcode::NOP_IN);
    assert!(engine.queue_inbound(session.get(), connection.get(), nop.clone(), Vec::new()));

    let mut received = BasicHeaderSegment::new();
    let data = channel.receive(session, connection, &mut received).unwrap();
    assert_eq!(received.opcode_name(), "NOP-In");
    assert!(data.is_empty());
    assert_eq!(engine.call_count(Selector::RecvData), 0);
}

// ============================================================================
// Error reporting
// ============================================================================

#[test]
fn test_engine_status_surfaces_as_error() {
    let engine = configured_engine();
    let channel = open_channel(&engine);
    let (session, connection) = open_connection(&channel);

    engine.inject_fault(Selector::SendData, Fault::Status(32));
    let header = BasicHeaderSegment::new();
    let err = channel.send(session, connection, &header, &[]).unwrap_err();
    assert!(matches!(err, KernelError::Status { code: 32, .. }));

    let io: std::io::Error = err.into();
    assert_eq!(io.kind(), std::io::ErrorKind::Other);
}

#[test]
fn test_receive_with_nothing_pending() {
    let engine = configured_engine();
    let channel = open_channel(&engine);
    let (session, connection) = open_connection(&channel);

    let mut header = BasicHeaderSegment::new();
    header.set_opcode(opcode::SCSI_COMMAND);
    let before = header.clone();

    let err = channel.receive(session, connection, &mut header).unwrap_err();
    assert!(matches!(err, KernelError::Io(_)));
    assert_eq!(err.errno(), iscsi_kernel_bridge::error::errno::EIO);
    assert_eq!(header, before);
}
