//! Walk through a full session against the in-process engine
//!
//! This shows how to:
//! 1. Open the control channel
//! 2. Create a session and a connection
//! 3. Push negotiated options
//! 4. Exchange a login PDU
//! 5. Tear everything down
//!
//! Run with `RUST_LOG=trace` to see the boundary calls and header dumps.

use iscsi_kernel_bridge::loopback::LoopbackEngine;
use iscsi_kernel_bridge::pdu::opcode;
use iscsi_kernel_bridge::{
    AddressFamily, BasicHeaderSegment, ChannelBuilder, ConnectionOptions, DigestType,
    SessionOptions,
};
use std::net::SocketAddr;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let target: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "192.0.2.10:3260".to_string())
        .parse()?;
    let host: SocketAddr = if target.is_ipv4() {
        "192.0.2.1:0".parse()?
    } else {
        "[2001:db8::1]:0".parse()?
    };

    let engine = LoopbackEngine::new();
    engine.set_echo(true);

    let channel = ChannelBuilder::new()
        .trace_pdus(true)
        .open(&engine.registry())?;
    println!("Opened {}", channel.config().service_name);

    let session = channel.create_session()?;
    let connection =
        channel.create_connection(session, AddressFamily::of(&target), &target, &host)?;
    println!("Session {} connection {} -> {}", session, connection, target);

    let text = b"InitiatorName=iqn.2025-12.local:demo\0SessionType=Normal\0";
    let mut login = BasicHeaderSegment::new();
    login.set_opcode(opcode::LOGIN_REQUEST);
    login.set_immediate(true);
    login.set_initiator_task_tag(1);
    login.set_data_segment_length(text.len() as u32)?;
    channel.send(session, connection, &login, text)?;

    let mut reply = BasicHeaderSegment::new();
    let data = channel.receive(session, connection, &mut reply)?;
    println!(
        "Received {} (itt {:#x}) with {} data bytes",
        reply.opcode_name(),
        reply.initiator_task_tag(),
        data.len()
    );

    let mut session_options = SessionOptions::default();
    session_options.set_tsih(1);
    channel.set_session_options(session, &session_options)?;

    let mut connection_options = ConnectionOptions::default();
    connection_options.set_header_digest(DigestType::CRC32C);
    channel.set_connection_options(session, connection, &connection_options)?;

    let mut negotiated = ConnectionOptions::zeroed();
    channel.get_connection_options(session, connection, &mut negotiated)?;
    println!("Negotiated {:?}", negotiated);

    channel.release_connection(session, connection);
    channel.release_session(session);
    channel.close()?;
    println!("Channel closed");

    Ok(())
}
