//! Fixed-size BSD socket address records
//!
//! `CreateConnection` carries the target and host addresses as two records
//! of [`SOCKADDR_RECORD_SIZE`] bytes each, large enough for `sockaddr_in6`:
//!
//! ```text
//!  0      len       (u8, 16 for IPv4, 28 for IPv6)
//!  1      family    (u8, AF_INET / AF_INET6)
//!  2..4   port      (network order)
//!  IPv4:  4..8 address, 8..16 zero, rest zero
//!  IPv6:  4..8 flowinfo (network order), 8..24 address, 24..28 scope id (host order)
//! ```

use crate::error::{KernelError, KernelResult};
use byteorder::{BigEndian, ByteOrder, NativeEndian};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Size of one encoded address record (`sizeof(struct sockaddr_in6)`)
pub const SOCKADDR_RECORD_SIZE: usize = 28;

const SOCKADDR_IN_LEN: u8 = 16;
const SOCKADDR_IN6_LEN: u8 = 28;

pub const AF_INET: u8 = 2;
pub const AF_INET6: u8 = 30;

/// Encode an address into its fixed-size record
pub fn encode(addr: &SocketAddr) -> [u8; SOCKADDR_RECORD_SIZE] {
    let mut record = [0u8; SOCKADDR_RECORD_SIZE];
    BigEndian::write_u16(&mut record[2..4], addr.port());

    match addr {
        SocketAddr::V4(v4) => {
            record[0] = SOCKADDR_IN_LEN;
            record[1] = AF_INET;
            record[4..8].copy_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            record[0] = SOCKADDR_IN6_LEN;
            record[1] = AF_INET6;
            BigEndian::write_u32(&mut record[4..8], v6.flowinfo());
            record[8..24].copy_from_slice(&v6.ip().octets());
            NativeEndian::write_u32(&mut record[24..28], v6.scope_id());
        }
    }
    record
}

/// Decode one address record
pub fn decode(record: &[u8]) -> KernelResult<SocketAddr> {
    if record.len() < SOCKADDR_RECORD_SIZE {
        return Err(KernelError::InvalidArgument(format!(
            "address record too short: {} bytes, need {}",
            record.len(),
            SOCKADDR_RECORD_SIZE
        )));
    }

    let port = BigEndian::read_u16(&record[2..4]);
    match (record[0], record[1]) {
        (SOCKADDR_IN_LEN, AF_INET) => {
            let ip = Ipv4Addr::new(record[4], record[5], record[6], record[7]);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        (SOCKADDR_IN6_LEN, AF_INET6) => {
            let flowinfo = BigEndian::read_u32(&record[4..8]);
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&record[8..24]);
            let scope_id = NativeEndian::read_u32(&record[24..28]);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                flowinfo,
                scope_id,
            )))
        }
        (len, family) => Err(KernelError::InvalidArgument(format!(
            "unsupported address record: len={}, family={}",
            len, family
        ))),
    }
}
