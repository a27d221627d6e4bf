//! E1.31 (sACN) packet parsing
//!
//! Only data packets are decoded. Synchronization and discovery packets
//! (extended root vector) are recognised and ignored.
//!
//! Data packet layout (offsets in bytes):
//!
//! | offset | field                                   |
//! |--------|-----------------------------------------|
//! | 0      | preamble size `0x0010`                  |
//! | 2      | postamble size `0x0000`                 |
//! | 4      | ACN packet identifier (12 bytes)        |
//! | 16     | root flags/length                       |
//! | 18     | root vector `0x00000004`                |
//! | 22     | CID (16 bytes)                          |
//! | 38     | framing flags/length                    |
//! | 40     | framing vector `0x00000002`             |
//! | 44     | source name (64 bytes, NUL padded)      |
//! | 108    | priority                                |
//! | 109    | synchronization address                 |
//! | 111    | sequence number                         |
//! | 112    | options                                 |
//! | 113    | universe                                |
//! | 115    | DMP flags/length                        |
//! | 117    | DMP vector `0x02`                       |
//! | 118    | address/data type `0xa1`                |
//! | 119    | first property address `0x0000`         |
//! | 121    | address increment `0x0001`              |
//! | 123    | property value count (1 + slots)        |
//! | 125    | start code                              |
//! | 126    | slot data                               |

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use thiserror::Error;

use super::framing::{FrameBuilder, FrameReader, MAX_DATAGRAM_SIZE};

/// Default E1.31 UDP port
pub const ACN_SDT_MULTICAST_PORT: u16 = 5568;
pub const ACN_PACKET_IDENTIFIER: [u8; 12] = *b"ASC-E1.17\0\0\0";
pub const PREAMBLE_SIZE: u16 = 0x0010;
pub const VECTOR_ROOT_E131_DATA: u32 = 0x0000_0004;
pub const VECTOR_ROOT_E131_EXTENDED: u32 = 0x0000_0008;
pub const VECTOR_E131_DATA_PACKET: u32 = 0x0000_0002;
pub const VECTOR_DMP_SET_PROPERTY: u8 = 0x02;
pub const DMP_ADDRESS_DATA_TYPE: u8 = 0xa1;
/// Bytes before the first slot
pub const DATA_HEADER_LEN: usize = 126;
pub const MAX_SLOTS: usize = 512;
/// Null start code: slots carry dimmer-style levels
pub const START_CODE_NULL: u8 = 0x00;

pub const OPTION_PREVIEW: u8 = 0x80;
pub const OPTION_STREAM_TERMINATED: u8 = 0x40;

const SOURCE_NAME_LEN: usize = 64;
const ROOT_LENGTH_OFFSET: usize = 16;
const FRAMING_LENGTH_OFFSET: usize = 38;
const DMP_LENGTH_OFFSET: usize = 115;
/// Sequence numbers this far behind the last one are treated as stale
const SEQUENCE_WINDOW: i8 = -20;

/// Malformed datagram
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),
    #[error("datagram too long: {0} bytes")]
    TooLong(usize),
    #[error("bad preamble or postamble")]
    BadPreamble,
    #[error("not an ACN packet")]
    BadIdentifier,
    #[error("unsupported root vector {0:#010x}")]
    UnsupportedRootVector(u32),
    #[error("unsupported framing vector {0:#010x}")]
    UnsupportedFramingVector(u32),
    #[error("{layer} PDU length {declared} does not match {actual} bytes")]
    LengthMismatch {
        layer: &'static str,
        declared: usize,
        actual: usize,
    },
    #[error("malformed DMP layer")]
    BadDmpLayer,
    #[error("property count {0} out of range")]
    BadPropertyCount(u16),
}

/// Decoded E1.31 data packet borrowing its slots from the datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket<'a> {
    pub cid: [u8; 16],
    pub source_name: String,
    pub priority: u8,
    pub sync_address: u16,
    pub sequence: u8,
    pub options: u8,
    pub universe: u16,
    pub start_code: u8,
    pub slots: &'a [u8],
}

impl DataPacket<'_> {
    pub fn is_preview(&self) -> bool {
        self.options & OPTION_PREVIEW != 0
    }

    pub fn is_terminated(&self) -> bool {
        self.options & OPTION_STREAM_TERMINATED != 0
    }

    /// Level of a 1-based channel
    pub fn slot(&self, channel: u16) -> Option<u8> {
        let index = usize::from(channel).checked_sub(1)?;
        self.slots.get(index).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet<'a> {
    Data(DataPacket<'a>),
    /// Synchronization or universe discovery
    Extended,
}

/// Root and framing PDU lengths are the low 12 bits of their flags/length word
fn pdu_length(flags_length: u16) -> usize {
    usize::from(flags_length & 0x0fff)
}

fn check_length(layer: &'static str, flags_length: u16, buf_len: usize, offset: usize) -> Result<(), ProtocolError> {
    let declared = pdu_length(flags_length);
    let actual = buf_len - offset;
    if declared != actual {
        return Err(ProtocolError::LengthMismatch {
            layer,
            declared,
            actual,
        });
    }
    Ok(())
}

/// Parse one datagram
pub fn parse(buf: &[u8]) -> Result<Packet<'_>, ProtocolError> {
    if buf.len() > MAX_DATAGRAM_SIZE {
        return Err(ProtocolError::TooLong(buf.len()));
    }

    let mut reader = FrameReader::new(buf);
    let too_short = || ProtocolError::TooShort(buf.len());

    // Root layer
    let preamble = reader.read_u16().ok_or_else(too_short)?;
    let postamble = reader.read_u16().ok_or_else(too_short)?;
    if preamble != PREAMBLE_SIZE || postamble != 0 {
        return Err(ProtocolError::BadPreamble);
    }
    let identifier = reader.read_array::<12>().ok_or_else(too_short)?;
    if identifier != ACN_PACKET_IDENTIFIER {
        return Err(ProtocolError::BadIdentifier);
    }
    let root_flags_length = reader.read_u16().ok_or_else(too_short)?;
    let root_vector = reader.read_u32().ok_or_else(too_short)?;
    match root_vector {
        VECTOR_ROOT_E131_DATA => {}
        VECTOR_ROOT_E131_EXTENDED => return Ok(Packet::Extended),
        other => return Err(ProtocolError::UnsupportedRootVector(other)),
    }

    if buf.len() < DATA_HEADER_LEN {
        return Err(too_short());
    }
    check_length("root", root_flags_length, buf.len(), ROOT_LENGTH_OFFSET)?;

    let cid = reader.read_array::<16>().ok_or_else(too_short)?;

    // Framing layer
    let framing_flags_length = reader.read_u16().ok_or_else(too_short)?;
    check_length("framing", framing_flags_length, buf.len(), FRAMING_LENGTH_OFFSET)?;
    let framing_vector = reader.read_u32().ok_or_else(too_short)?;
    if framing_vector != VECTOR_E131_DATA_PACKET {
        return Err(ProtocolError::UnsupportedFramingVector(framing_vector));
    }
    let name_bytes = reader.read(SOURCE_NAME_LEN).ok_or_else(too_short)?;
    let name_end = name_bytes.iter().position(|&b| b == 0).unwrap_or(SOURCE_NAME_LEN);
    let source_name = String::from_utf8_lossy(&name_bytes[..name_end]).into_owned();
    let priority = reader.read_u8().ok_or_else(too_short)?;
    let sync_address = reader.read_u16().ok_or_else(too_short)?;
    let sequence = reader.read_u8().ok_or_else(too_short)?;
    let options = reader.read_u8().ok_or_else(too_short)?;
    let universe = reader.read_u16().ok_or_else(too_short)?;

    // DMP layer
    let dmp_flags_length = reader.read_u16().ok_or_else(too_short)?;
    check_length("DMP", dmp_flags_length, buf.len(), DMP_LENGTH_OFFSET)?;
    let dmp_vector = reader.read_u8().ok_or_else(too_short)?;
    let address_type = reader.read_u8().ok_or_else(too_short)?;
    let first_address = reader.read_u16().ok_or_else(too_short)?;
    let increment = reader.read_u16().ok_or_else(too_short)?;
    if dmp_vector != VECTOR_DMP_SET_PROPERTY
        || address_type != DMP_ADDRESS_DATA_TYPE
        || first_address != 0
        || increment != 1
    {
        return Err(ProtocolError::BadDmpLayer);
    }
    let count = reader.read_u16().ok_or_else(too_short)?;
    if count == 0 || usize::from(count) > MAX_SLOTS + 1 {
        return Err(ProtocolError::BadPropertyCount(count));
    }
    let start_code = reader.read_u8().ok_or_else(too_short)?;
    let slot_count = usize::from(count) - 1;
    if reader.remaining().len() != slot_count {
        return Err(ProtocolError::LengthMismatch {
            layer: "property values",
            declared: slot_count,
            actual: reader.remaining().len(),
        });
    }
    let slots = reader.read(slot_count).ok_or_else(too_short)?;

    Ok(Packet::Data(DataPacket {
        cid,
        source_name,
        priority,
        sync_address,
        sequence,
        options,
        universe,
        start_code,
        slots,
    }))
}

/// Multicast group carrying `universe`
pub fn universe_multicast_group(universe: u16) -> Ipv4Addr {
    let [hi, lo] = universe.to_be_bytes();
    Ipv4Addr::new(239, 255, hi, lo)
}

/// Per-source sequence ordering as described in E1.31 section 6.7.2
#[derive(Debug, Default)]
pub struct SequenceTracker {
    sources: HashMap<[u8; 16], SourceSequence>,
}

#[derive(Debug, Clone, Copy)]
struct SourceSequence {
    last: u8,
    seen_at: Instant,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when `sequence` is a duplicate or arrived late
    pub fn accept(&mut self, cid: [u8; 16], sequence: u8, now: Instant) -> bool {
        match self.sources.get_mut(&cid) {
            Some(source) => {
                let diff = sequence.wrapping_sub(source.last) as i8;
                if diff <= 0 && diff > SEQUENCE_WINDOW {
                    return false;
                }
                source.last = sequence;
                source.seen_at = now;
                true
            }
            None => {
                self.sources.insert(cid, SourceSequence { last: sequence, seen_at: now });
                true
            }
        }
    }

    /// Forget a source (after it terminated its stream)
    pub fn forget(&mut self, cid: &[u8; 16]) {
        self.sources.remove(cid);
    }

    /// Drop sources not heard from within `max_silence`; returns how many went
    pub fn evict_silent(&mut self, now: Instant, max_silence: Duration) -> usize {
        let before = self.sources.len();
        self.sources
            .retain(|_, source| now.saturating_duration_since(source.seen_at) <= max_silence);
        before - self.sources.len()
    }

    pub fn sources(&self) -> usize {
        self.sources.len()
    }
}

/// Fields of an outgoing data packet
#[derive(Debug, Clone)]
pub struct DataPacketSpec<'a> {
    pub cid: [u8; 16],
    pub source_name: &'a str,
    pub priority: u8,
    pub sequence: u8,
    pub options: u8,
    pub universe: u16,
    pub slots: &'a [u8],
}

impl Default for DataPacketSpec<'_> {
    fn default() -> Self {
        Self {
            cid: [0x42; 16],
            source_name: "EmptyEpsilon",
            priority: 100,
            sequence: 0,
            options: 0,
            universe: 1,
            slots: &[],
        }
    }
}

/// Encode a data packet. Used by the benchmark and tests to stand in for
/// the broadcaster.
pub fn encode_data_packet(spec: &DataPacketSpec<'_>) -> Vec<u8> {
    let slots = &spec.slots[..spec.slots.len().min(MAX_SLOTS)];
    let total = DATA_HEADER_LEN + slots.len();
    let flags_length = |offset: usize| 0x7000 | ((total - offset) as u16 & 0x0fff);

    FrameBuilder::new()
        .write_u16(PREAMBLE_SIZE)
        .write_u16(0)
        .write(&ACN_PACKET_IDENTIFIER)
        .write_u16(flags_length(ROOT_LENGTH_OFFSET))
        .write_u32(VECTOR_ROOT_E131_DATA)
        .write(&spec.cid)
        .write_u16(flags_length(FRAMING_LENGTH_OFFSET))
        .write_u32(VECTOR_E131_DATA_PACKET)
        .write_padded(spec.source_name.as_bytes(), SOURCE_NAME_LEN)
        .write_u8(spec.priority)
        .write_u16(0)
        .write_u8(spec.sequence)
        .write_u8(spec.options)
        .write_u16(spec.universe)
        .write_u16(flags_length(DMP_LENGTH_OFFSET))
        .write_u8(VECTOR_DMP_SET_PROPERTY)
        .write_u8(DMP_ADDRESS_DATA_TYPE)
        .write_u16(0)
        .write_u16(1)
        .write_u16(slots.len() as u16 + 1)
        .write_u8(START_CODE_NULL)
        .write(slots)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn packet(slots: &[u8]) -> Vec<u8> {
        encode_data_packet(&DataPacketSpec {
            universe: 2,
            sequence: 7,
            slots,
            ..Default::default()
        })
    }

    #[test]
    fn test_parse_data_packet() {
        let bytes = packet(&[255, 0, 128]);
        assert_eq!(bytes.len(), DATA_HEADER_LEN + 3);

        let Packet::Data(data) = parse(&bytes).unwrap() else {
            panic!("expected data packet");
        };
        assert_eq!(data.universe, 2);
        assert_eq!(data.sequence, 7);
        assert_eq!(data.source_name, "EmptyEpsilon");
        assert_eq!(data.start_code, START_CODE_NULL);
        assert_eq!(data.slots, &[255, 0, 128]);
        assert_eq!(data.slot(1), Some(255));
        assert_eq!(data.slot(4), None);
        assert_eq!(data.slot(0), None);
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let bytes = packet(&[1, 2, 3]);
        assert!(parse(&bytes[..100]).is_err());
        assert!(parse(&bytes[..bytes.len() - 1]).is_err());
        assert_eq!(parse(&[]), Err(ProtocolError::TooShort(0)));
    }

    #[test]
    fn test_parse_rejects_bad_identifier() {
        let mut bytes = packet(&[1]);
        bytes[4] = b'X';
        assert_eq!(parse(&bytes), Err(ProtocolError::BadIdentifier));
    }

    #[test]
    fn test_parse_rejects_length_mismatch() {
        let mut bytes = packet(&[1, 2]);
        bytes.push(0);
        assert!(matches!(parse(&bytes), Err(ProtocolError::LengthMismatch { .. })));
    }

    #[test]
    fn test_extended_packets_are_ignored() {
        let mut bytes = packet(&[1]);
        bytes[18..22].copy_from_slice(&VECTOR_ROOT_E131_EXTENDED.to_be_bytes());
        assert_eq!(parse(&bytes), Ok(Packet::Extended));
    }

    #[test]
    fn test_terminated_option() {
        let bytes = encode_data_packet(&DataPacketSpec {
            options: OPTION_STREAM_TERMINATED,
            slots: &[0],
            ..Default::default()
        });
        let Packet::Data(data) = parse(&bytes).unwrap() else {
            panic!("expected data packet");
        };
        assert!(data.is_terminated());
        assert!(!data.is_preview());
    }

    #[test]
    fn test_random_garbage_never_panics() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5ac1);
        let valid = packet(&[10; 50]);

        for _ in 0..5000 {
            let len = rng.gen_range(0..700);
            let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let _ = parse(&bytes);

            // Mutate a valid packet too, so deeper layers get exercised
            let mut mutated = valid.clone();
            let flips = rng.gen_range(1..4);
            for _ in 0..flips {
                let idx = rng.gen_range(0..mutated.len());
                mutated[idx] = rng.gen();
            }
            let cut = rng.gen_range(0..=mutated.len());
            let _ = parse(&mutated[..cut]);
        }
    }

    #[test]
    fn test_multicast_group() {
        assert_eq!(universe_multicast_group(1), Ipv4Addr::new(239, 255, 0, 1));
        assert_eq!(universe_multicast_group(0x0102), Ipv4Addr::new(239, 255, 1, 2));
    }

    #[test]
    fn test_sequence_window() {
        let mut tracker = SequenceTracker::new();
        let cid = [1u8; 16];
        let now = Instant::now();

        assert!(tracker.accept(cid, 10, now));
        assert!(tracker.accept(cid, 11, now));
        // Duplicate and late packets
        assert!(!tracker.accept(cid, 11, now));
        assert!(!tracker.accept(cid, 5, now));
        // Far behind counts as a restart
        assert!(tracker.accept(cid, 200, now));
        // Wrap-around
        assert!(tracker.accept(cid, 255, now));
        assert!(tracker.accept(cid, 0, now));

        // Independent per source
        assert!(tracker.accept([2u8; 16], 0, now));
        assert_eq!(tracker.sources(), 2);
        tracker.forget(&cid);
        assert!(tracker.accept(cid, 0, now));
    }

    #[test]
    fn test_silent_sources_are_evicted() {
        let mut tracker = SequenceTracker::new();
        let start = Instant::now();
        let quiet = [1u8; 16];
        let chatty = [2u8; 16];

        assert!(tracker.accept(quiet, 10, start));
        assert!(tracker.accept(chatty, 10, start));
        assert!(tracker.accept(chatty, 11, start + Duration::from_millis(900)));

        assert_eq!(tracker.evict_silent(start + Duration::from_secs(1), Duration::from_millis(500)), 1);
        assert_eq!(tracker.sources(), 1);

        // An evicted source starts over, so an old sequence number is accepted again
        assert!(tracker.accept(quiet, 3, start + Duration::from_secs(2)));
        assert!(!tracker.accept(chatty, 11, start + Duration::from_secs(2)));
    }
}
