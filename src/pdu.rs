//! iSCSI PDU (Protocol Data Unit) header and data segment buffers
//!
//! The bridge treats a PDU header as an opaque 48-byte block. The only field
//! it interprets is DataSegmentLength, which decides how large a buffer to
//! allocate when receiving. The remaining accessors exist for callers and
//! for logging.
//!
//! Layout follows RFC 3720: https://datatracker.ietf.org/doc/html/rfc3720

use crate::error::{KernelError, KernelResult};
use byteorder::{BigEndian, ByteOrder};
use std::ops::{Deref, DerefMut};

/// BHS (Basic Header Segment) size in bytes
pub const BHS_SIZE: usize = 48;

/// Data segments are padded to a multiple of this many bytes
pub const DATA_SEGMENT_ALIGNMENT: usize = 4;

/// Largest value the 24-bit DataSegmentLength field can hold
pub const MAX_DATA_SEGMENT_LENGTH: u32 = 0x00FF_FFFF;

/// iSCSI PDU Opcodes (RFC 3720 Section 10)
pub mod opcode {
    // Initiator opcodes (initiator → target)
    pub const NOP_OUT: u8 = 0x00;
    pub const SCSI_COMMAND: u8 = 0x01;
    pub const TASK_MANAGEMENT_REQUEST: u8 = 0x02;
    pub const LOGIN_REQUEST: u8 = 0x03;
    pub const TEXT_REQUEST: u8 = 0x04;
    pub const SCSI_DATA_OUT: u8 = 0x05;
    pub const LOGOUT_REQUEST: u8 = 0x06;
    pub const SNACK_REQUEST: u8 = 0x10;

    // Target opcodes (target → initiator)
    pub const NOP_IN: u8 = 0x20;
    pub const SCSI_RESPONSE: u8 = 0x21;
    pub const TASK_MANAGEMENT_RESPONSE: u8 = 0x22;
    pub const LOGIN_RESPONSE: u8 = 0x23;
    pub const TEXT_RESPONSE: u8 = 0x24;
    pub const SCSI_DATA_IN: u8 = 0x25;
    pub const LOGOUT_RESPONSE: u8 = 0x26;
    pub const R2T: u8 = 0x31;
    pub const ASYNC_MESSAGE: u8 = 0x32;
    pub const REJECT: u8 = 0x3F;
}

/// Round a data segment length up to the next alignment boundary
pub fn padded_length(len: usize) -> usize {
    len.div_ceil(DATA_SEGMENT_ALIGNMENT) * DATA_SEGMENT_ALIGNMENT
}

/// Basic Header Segment (BHS) - 48 bytes
///
/// ```text
/// Byte/     0       |       1       |       2       |       3       |
///     /              |               |               |               |
///    |0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|
///    +---------------+---------------+---------------+---------------+
///   0|.|I| Opcode    |F|  Opcode-specific fields                     |
///    +---------------+---------------+---------------+---------------+
///   4|TotalAHSLength | DataSegmentLength                             |
///    +---------------+---------------+---------------+---------------+
///   8| LUN or Opcode-specific fields                                 |
///    +                                                               +
///  12|                                                               |
///    +---------------+---------------+---------------+---------------+
///  16| Initiator Task Tag                                            |
///    +---------------+---------------+---------------+---------------+
///  20| Opcode-specific fields (28 bytes)                             |
///    +                                                               +
///  ...
///  44|                                                               |
///    +---------------+---------------+---------------+---------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicHeaderSegment {
    raw: [u8; BHS_SIZE],
}

impl Default for BasicHeaderSegment {
    fn default() -> Self {
        Self::new()
    }
}

impl BasicHeaderSegment {
    /// Create an all-zero header
    pub fn new() -> Self {
        BasicHeaderSegment { raw: [0u8; BHS_SIZE] }
    }

    /// Copy a header out of a buffer of at least 48 bytes
    pub fn from_bytes(buf: &[u8]) -> KernelResult<Self> {
        if buf.len() < BHS_SIZE {
            return Err(KernelError::InvalidArgument(format!(
                "BHS too short: {} bytes, need {}",
                buf.len(),
                BHS_SIZE
            )));
        }
        let mut raw = [0u8; BHS_SIZE];
        raw.copy_from_slice(&buf[..BHS_SIZE]);
        Ok(BasicHeaderSegment { raw })
    }

    pub fn as_bytes(&self) -> &[u8; BHS_SIZE] {
        &self.raw
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; BHS_SIZE] {
        &mut self.raw
    }

    /// Opcode (lower 6 bits of byte 0)
    pub fn opcode(&self) -> u8 {
        self.raw[0] & 0x3F
    }

    pub fn set_opcode(&mut self, opcode: u8) {
        self.raw[0] = (self.raw[0] & 0xC0) | (opcode & 0x3F);
    }

    /// Immediate delivery flag (bit 6 of byte 0)
    pub fn immediate(&self) -> bool {
        (self.raw[0] & 0x40) != 0
    }

    pub fn set_immediate(&mut self, immediate: bool) {
        if immediate {
            self.raw[0] |= 0x40;
        } else {
            self.raw[0] &= !0x40;
        }
    }

    /// Opcode-specific flags (byte 1)
    pub fn flags(&self) -> u8 {
        self.raw[1]
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.raw[1] = flags;
    }

    /// Total AHS length in 4-byte words (byte 4)
    pub fn total_ahs_length(&self) -> u8 {
        self.raw[4]
    }

    /// Data segment length in bytes, excluding padding (bytes 5-7)
    pub fn data_segment_length(&self) -> u32 {
        BigEndian::read_u24(&self.raw[5..8])
    }

    pub fn set_data_segment_length(&mut self, len: u32) -> KernelResult<()> {
        if len > MAX_DATA_SEGMENT_LENGTH {
            return Err(KernelError::InvalidArgument(format!(
                "data segment length {} exceeds 24-bit field",
                len
            )));
        }
        BigEndian::write_u24(&mut self.raw[5..8], len);
        Ok(())
    }

    /// Bytes that follow the header on the wire: the data segment plus
    /// padding to a 4-byte boundary
    pub fn padded_data_segment_length(&self) -> usize {
        padded_length(self.data_segment_length() as usize)
    }

    /// Logical Unit Number or opcode-specific (bytes 8-15)
    pub fn lun(&self) -> u64 {
        BigEndian::read_u64(&self.raw[8..16])
    }

    pub fn set_lun(&mut self, lun: u64) {
        BigEndian::write_u64(&mut self.raw[8..16], lun);
    }

    /// Initiator Task Tag (bytes 16-19)
    pub fn initiator_task_tag(&self) -> u32 {
        BigEndian::read_u32(&self.raw[16..20])
    }

    pub fn set_initiator_task_tag(&mut self, itt: u32) {
        BigEndian::write_u32(&mut self.raw[16..20], itt);
    }

    /// Get the opcode name for debugging
    pub fn opcode_name(&self) -> &'static str {
        match self.opcode() {
            opcode::NOP_OUT => "NOP-Out",
            opcode::SCSI_COMMAND => "SCSI Command",
            opcode::TASK_MANAGEMENT_REQUEST => "Task Management Request",
            opcode::LOGIN_REQUEST => "Login Request",
            opcode::TEXT_REQUEST => "Text Request",
            opcode::SCSI_DATA_OUT => "SCSI Data-Out",
            opcode::LOGOUT_REQUEST => "Logout Request",
            opcode::SNACK_REQUEST => "SNACK Request",
            opcode::NOP_IN => "NOP-In",
            opcode::SCSI_RESPONSE => "SCSI Response",
            opcode::TASK_MANAGEMENT_RESPONSE => "Task Management Response",
            opcode::LOGIN_RESPONSE => "Login Response",
            opcode::TEXT_RESPONSE => "Text Response",
            opcode::SCSI_DATA_IN => "SCSI Data-In",
            opcode::LOGOUT_RESPONSE => "Logout Response",
            opcode::R2T => "Ready To Transfer",
            opcode::ASYNC_MESSAGE => "Async Message",
            opcode::REJECT => "Reject",
            _ => "Unknown",
        }
    }
}

/// Data segment of a received PDU, padding included
///
/// An empty segment owns no allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataSegment {
    buf: Vec<u8>,
}

impl DataSegment {
    pub fn empty() -> Self {
        DataSegment { buf: Vec::new() }
    }

    /// Allocate a zeroed segment of exactly `len` bytes
    pub(crate) fn allocate(len: usize) -> KernelResult<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| KernelError::OutOfMemory(len))?;
        buf.resize(len, 0);
        Ok(DataSegment { buf })
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes currently allocated for the segment
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

impl Deref for DataSegment {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for DataSegment {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl AsRef<[u8]> for DataSegment {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl From<DataSegment> for Vec<u8> {
    fn from(segment: DataSegment) -> Self {
        segment.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bhs_new() {
        let bhs = BasicHeaderSegment::new();
        assert_eq!(bhs.opcode(), 0);
        assert!(!bhs.immediate());
        assert_eq!(bhs.flags(), 0);
        assert_eq!(bhs.data_segment_length(), 0);
        assert_eq!(bhs.padded_data_segment_length(), 0);
    }

    #[test]
    fn test_bhs_field_layout() {
        let mut bhs = BasicHeaderSegment::new();
        bhs.set_opcode(opcode::LOGIN_REQUEST);
        bhs.set_immediate(true);
        bhs.set_flags(0x87);
        bhs.set_data_segment_length(0x012345).unwrap();
        bhs.set_lun(0x0001020304050607);
        bhs.set_initiator_task_tag(0x12345678);

        let bytes = bhs.as_bytes();
        assert_eq!(bytes[0], 0x43);
        assert_eq!(bytes[1], 0x87);
        assert_eq!(&bytes[5..8], &[0x01, 0x23, 0x45]);
        assert_eq!(&bytes[8..16], &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(&bytes[16..20], &[0x12, 0x34, 0x56, 0x78]);

        let parsed = BasicHeaderSegment::from_bytes(bytes).unwrap();
        assert_eq!(parsed.opcode(), opcode::LOGIN_REQUEST);
        assert!(parsed.immediate());
        assert_eq!(parsed.data_segment_length(), 0x012345);
        assert_eq!(parsed.initiator_task_tag(), 0x12345678);
    }

    #[test]
    fn test_bhs_too_short() {
        let result = BasicHeaderSegment::from_bytes(&[0u8; 20]);
        assert!(matches!(result, Err(KernelError::InvalidArgument(_))));
    }

    #[test]
    fn test_data_segment_length_limit() {
        let mut bhs = BasicHeaderSegment::new();
        assert!(bhs.set_data_segment_length(MAX_DATA_SEGMENT_LENGTH).is_ok());
        assert!(bhs.set_data_segment_length(MAX_DATA_SEGMENT_LENGTH + 1).is_err());
        assert_eq!(bhs.data_segment_length(), MAX_DATA_SEGMENT_LENGTH);
    }

    #[test]
    fn test_padding() {
        assert_eq!(padded_length(0), 0);
        assert_eq!(padded_length(1), 4);
        assert_eq!(padded_length(4), 4);
        assert_eq!(padded_length(10), 12);

        let mut bhs = BasicHeaderSegment::new();
        bhs.set_data_segment_length(3).unwrap();
        assert_eq!(bhs.padded_data_segment_length(), 4);
    }

    #[test]
    fn test_opcode_names() {
        let mut bhs = BasicHeaderSegment::new();

        bhs.set_opcode(opcode::LOGIN_REQUEST);
        assert_eq!(bhs.opcode_name(), "Login Request");

        bhs.set_opcode(opcode::SCSI_RESPONSE);
        assert_eq!(bhs.opcode_name(), "SCSI Response");

        bhs.set_opcode(0x3E);
        assert_eq!(bhs.opcode_name(), "Unknown");
    }

    #[test]
    fn test_data_segment_allocation() {
        let empty = DataSegment::empty();
        assert!(empty.is_empty());
        assert_eq!(empty.capacity(), 0);

        let segment = DataSegment::allocate(12).unwrap();
        assert_eq!(segment.len(), 12);
        assert!(segment.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_data_segment_allocation_failure() {
        let result = DataSegment::allocate(usize::MAX);
        assert!(matches!(result, Err(KernelError::OutOfMemory(_))));
    }
}
