//! sACN (ANSI E1.31) data packet codec
//!
//! Layout of a data packet:
//!
//! ```text
//! Root layer     0..38    preamble, ACN identifier, flags/length, vector 0x04, CID
//! Framing layer  38..115  flags/length, vector 0x02, source name, priority,
//!                         sync address, sequence, options, universe
//! DMP layer      115..    flags/length, vector 0x02, address/data type 0xa1,
//!                         first address, increment, value count, START code, slots
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::constants::{MAX_UNIVERSE, SACN_PORT, UNIVERSE_SIZE};
use crate::dmx::DmxFrame;
use crate::error::NetworkError;

/// ACN packet identifier
pub const ACN_PACKET_IDENTIFIER: [u8; 12] = *b"ASC-E1.17\0\0\0";

pub const VECTOR_ROOT_E131_DATA: u32 = 0x0000_0004;
pub const VECTOR_ROOT_E131_EXTENDED: u32 = 0x0000_0008;
pub const VECTOR_E131_DATA_PACKET: u32 = 0x0000_0002;
pub const VECTOR_DMP_SET_PROPERTY: u8 = 0x02;

const ADDRESS_DATA_TYPE: u8 = 0xa1;

/// Option bits in the framing layer
pub const OPTION_PREVIEW_DATA: u8 = 0x80;
pub const OPTION_STREAM_TERMINATED: u8 = 0x40;

const ROOT_VECTOR: usize = 18;
const CID: usize = 22;
const FRAMING_VECTOR: usize = 40;
const SOURCE_NAME: usize = 44;
const PRIORITY: usize = 108;
const SEQUENCE: usize = 111;
const OPTIONS: usize = 112;
const UNIVERSE: usize = 113;
const DMP_FLAGS_LENGTH: usize = 115;
const DMP_VECTOR: usize = 117;
const DMP_TYPE: usize = 118;
const PROPERTY_COUNT: usize = 123;
const START_CODE: usize = 125;
const SLOTS: usize = 126;

/// Smallest valid data packet (START code, no slots)
pub const MIN_PACKET_LEN: usize = SLOTS;

/// Decoded E1.31 data packet
#[derive(Debug, Clone)]
pub struct SacnPacket {
    pub cid: [u8; 16],
    pub source_name: String,
    pub priority: u8,
    pub sequence: u8,
    pub options: u8,
    pub universe: u16,
    pub start_code: u8,
    /// Slot values, zero-padded to a full universe
    pub data: Box<DmxFrame>,
    /// Number of slots actually carried by the packet
    pub slot_count: usize,
}

impl SacnPacket {
    /// Parse a data packet
    pub fn parse(buf: &[u8]) -> Result<Self, NetworkError> {
        if buf.len() < MIN_PACKET_LEN {
            return Err(NetworkError::PacketTooShort(buf.len()));
        }
        if buf[4..16] != ACN_PACKET_IDENTIFIER {
            return Err(NetworkError::InvalidPacket("bad ACN identifier"));
        }

        let root_vector = read_u32(buf, ROOT_VECTOR);
        if root_vector != VECTOR_ROOT_E131_DATA {
            return Err(NetworkError::UnsupportedVector(root_vector));
        }
        let framing_vector = read_u32(buf, FRAMING_VECTOR);
        if framing_vector != VECTOR_E131_DATA_PACKET {
            return Err(NetworkError::UnsupportedVector(framing_vector));
        }
        if buf[DMP_VECTOR] != VECTOR_DMP_SET_PROPERTY || buf[DMP_TYPE] != ADDRESS_DATA_TYPE {
            return Err(NetworkError::InvalidPacket("bad DMP layer"));
        }

        let universe = read_u16(buf, UNIVERSE);
        if universe == 0 || universe > MAX_UNIVERSE {
            return Err(NetworkError::InvalidPacket("universe out of range"));
        }

        // Property count includes the START code
        let property_count = usize::from(read_u16(buf, PROPERTY_COUNT));
        if property_count == 0 || property_count > UNIVERSE_SIZE + 1 {
            return Err(NetworkError::InvalidPacket("bad property count"));
        }
        let slot_count = property_count - 1;
        if buf.len() < SLOTS + slot_count {
            return Err(NetworkError::InvalidPacket("slot data truncated"));
        }
        // DMP length covers its own 10 header bytes plus every property
        if usize::from(read_u16(buf, DMP_FLAGS_LENGTH) & 0x0fff) < 10 + property_count {
            return Err(NetworkError::InvalidPacket("bad DMP length"));
        }

        let mut data = Box::new([0u8; UNIVERSE_SIZE]);
        data[..slot_count].copy_from_slice(&buf[SLOTS..SLOTS + slot_count]);

        let mut cid = [0u8; 16];
        cid.copy_from_slice(&buf[CID..CID + 16]);

        let name_bytes = &buf[SOURCE_NAME..SOURCE_NAME + 64];
        let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(64);
        let source_name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();

        Ok(Self {
            cid,
            source_name,
            priority: buf[PRIORITY],
            sequence: buf[SEQUENCE],
            options: buf[OPTIONS],
            universe,
            start_code: buf[START_CODE],
            data,
            slot_count,
        })
    }

    /// Level data (START code 0), not preview
    pub fn is_live_dmx(&self) -> bool {
        self.start_code == 0 && self.options & OPTION_PREVIEW_DATA == 0
    }

    /// Source announced it is going away
    pub fn is_terminated(&self) -> bool {
        self.options & OPTION_STREAM_TERMINATED != 0
    }
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Multicast group carrying a universe: 239.255.{hi}.{lo}
pub fn multicast_group(universe: u16) -> Ipv4Addr {
    let [hi, lo] = universe.to_be_bytes();
    Ipv4Addr::new(239, 255, hi, lo)
}

/// Socket address of a universe's multicast group
pub fn multicast_addr(universe: u16) -> SocketAddrV4 {
    SocketAddrV4::new(multicast_group(universe), SACN_PORT)
}

/// Build a data packet. Used by tests and diagnostics.
pub fn encode_data_packet(
    universe: u16,
    sequence: u8,
    source_name: &str,
    options: u8,
    slots: &[u8],
) -> Vec<u8> {
    let slots = &slots[..slots.len().min(UNIVERSE_SIZE)];
    let total = SLOTS + slots.len();
    let mut buf = vec![0u8; total];

    buf[0..2].copy_from_slice(&0x0010u16.to_be_bytes());
    buf[4..16].copy_from_slice(&ACN_PACKET_IDENTIFIER);
    buf[16..18].copy_from_slice(&flags_length(total - 16));
    buf[ROOT_VECTOR..ROOT_VECTOR + 4].copy_from_slice(&VECTOR_ROOT_E131_DATA.to_be_bytes());

    buf[38..40].copy_from_slice(&flags_length(total - 38));
    buf[FRAMING_VECTOR..FRAMING_VECTOR + 4]
        .copy_from_slice(&VECTOR_E131_DATA_PACKET.to_be_bytes());
    let name = source_name.as_bytes();
    let name_len = name.len().min(63);
    buf[SOURCE_NAME..SOURCE_NAME + name_len].copy_from_slice(&name[..name_len]);
    buf[PRIORITY] = 100;
    buf[SEQUENCE] = sequence;
    buf[OPTIONS] = options;
    buf[UNIVERSE..UNIVERSE + 2].copy_from_slice(&universe.to_be_bytes());

    buf[DMP_FLAGS_LENGTH..DMP_VECTOR].copy_from_slice(&flags_length(total - DMP_FLAGS_LENGTH));
    buf[DMP_VECTOR] = VECTOR_DMP_SET_PROPERTY;
    buf[DMP_TYPE] = ADDRESS_DATA_TYPE;
    buf[121..123].copy_from_slice(&1u16.to_be_bytes());
    buf[PROPERTY_COUNT..PROPERTY_COUNT + 2]
        .copy_from_slice(&((slots.len() + 1) as u16).to_be_bytes());
    buf[SLOTS..].copy_from_slice(slots);
    buf
}

fn flags_length(len: usize) -> [u8; 2] {
    (0x7000 | (len as u16 & 0x0fff)).to_be_bytes()
}
