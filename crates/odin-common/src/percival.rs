//! Percival emulator packet and frame buffer layout.
//!
//! A Percival frame is split into two data types (sample and reset), each
//! split into subframes, each carried by a run of primary packets followed by
//! optional tail packets. Every packet starts with a fixed header:
//!
//! | Offset | Size | Field |
//! |---|---|---|
//! | 0 | 1 | packet type (0 sample, 1 reset) |
//! | 1 | 1 | subframe number |
//! | 2 | 4 | frame number, big-endian |
//! | 6 | 2 | packet number, big-endian |
//! | 8 | `frame_info_size` | opaque frame info |
//!
//! A frame buffer starts with a [`FrameHeader`] followed by the payload of
//! every packet at its computed slot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const PACKET_TYPE_OFFSET: usize = 0;
const SUBFRAME_OFFSET: usize = 1;
const FRAME_NUMBER_OFFSET: usize = 2;
const PACKET_NUMBER_OFFSET: usize = 6;
/// Offset of the frame-info block within a packet header.
pub const FRAME_INFO_OFFSET: usize = 8;

const HDR_FRAME_NUMBER: usize = 0;
const HDR_FRAME_STATE: usize = 4;
const HDR_START_SECS: usize = 8;
const HDR_START_NSECS: usize = 16;
const HDR_PACKETS_RECEIVED: usize = 20;
const HDR_FRAME_INFO: usize = 24;

/// Data type carried by a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Sample image
    Sample,
    /// Reset image
    Reset,
}

impl PacketType {
    /// Dataset name used for frames of this type.
    #[must_use]
    pub fn dataset_name(self) -> &'static str {
        match self {
            PacketType::Sample => "data",
            PacketType::Reset => "reset",
        }
    }

    /// Type for a data type index.
    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(PacketType::Sample),
            1 => Some(PacketType::Reset),
            _ => None,
        }
    }
}

/// Dimensions of the Percival packet stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketLayout {
    /// Payload bytes in a primary packet
    pub primary_packet_size: usize,
    /// Primary packets per subframe
    pub num_primary_packets: usize,
    /// Payload bytes in a tail packet
    pub tail_packet_size: usize,
    /// Tail packets per subframe
    pub num_tail_packets: usize,
    /// Subframes per data type
    pub num_subframes: usize,
    /// Data types per frame
    pub num_data_types: usize,
    /// Bytes in a packet header
    pub packet_header_size: usize,
    /// Bytes of frame info in a packet header
    pub frame_info_size: usize,
}

impl Default for PacketLayout {
    fn default() -> Self {
        Self {
            primary_packet_size: 8192,
            num_primary_packets: 255,
            tail_packet_size: 512,
            num_tail_packets: 1,
            num_subframes: 2,
            num_data_types: 2,
            packet_header_size: 22,
            frame_info_size: 14,
        }
    }
}

impl PacketLayout {
    /// Packets per subframe.
    #[must_use]
    pub fn packets_per_subframe(&self) -> usize {
        self.num_primary_packets + self.num_tail_packets
    }

    /// Payload bytes per subframe.
    #[must_use]
    pub fn subframe_size(&self) -> usize {
        self.num_primary_packets * self.primary_packet_size
            + self.num_tail_packets * self.tail_packet_size
    }

    /// Payload bytes per data type.
    #[must_use]
    pub fn data_type_size(&self) -> usize {
        self.subframe_size() * self.num_subframes
    }

    /// Packets in a complete frame.
    #[must_use]
    pub fn num_frame_packets(&self) -> usize {
        self.num_data_types * self.num_subframes * self.packets_per_subframe()
    }

    /// Frame header size, rounded up to a multiple of 8.
    #[must_use]
    pub fn frame_header_size(&self) -> usize {
        let raw = HDR_FRAME_INFO + self.frame_info_size + self.num_frame_packets();
        raw.div_ceil(8) * 8
    }

    /// Total bytes needed for one frame buffer.
    #[must_use]
    pub fn frame_buffer_size(&self) -> usize {
        self.frame_header_size() + self.data_type_size() * self.num_data_types
    }

    /// True when the header fields address a packet of this layout.
    #[must_use]
    pub fn contains(&self, header: &PacketHeader) -> bool {
        usize::from(header.packet_type) < self.num_data_types
            && usize::from(header.subframe) < self.num_subframes
            && usize::from(header.packet_number) < self.packets_per_subframe()
    }

    /// Payload bytes carried by packet `packet_number`.
    #[must_use]
    pub fn payload_size(&self, packet_number: usize) -> usize {
        if packet_number < self.num_primary_packets {
            self.primary_packet_size
        } else {
            self.tail_packet_size
        }
    }

    /// Offset of a packet payload from the start of the frame buffer.
    #[must_use]
    pub fn payload_offset(&self, packet_type: usize, subframe: usize, packet_number: usize) -> usize {
        let within_subframe = if packet_number < self.num_primary_packets {
            self.primary_packet_size * packet_number
        } else {
            self.primary_packet_size * self.num_primary_packets
                + self.tail_packet_size * (packet_number - self.num_primary_packets)
        };
        self.frame_header_size()
            + self.data_type_size() * packet_type
            + self.subframe_size() * subframe
            + within_subframe
    }

    /// Index of a packet in the frame header's packet state map.
    #[must_use]
    pub fn packet_index(&self, packet_type: usize, subframe: usize, packet_number: usize) -> usize {
        (packet_type * self.num_subframes + subframe) * self.packets_per_subframe() + packet_number
    }

    /// Offset of the data region for `packet_type` from the start of the frame buffer.
    #[must_use]
    pub fn data_type_offset(&self, packet_type: usize) -> usize {
        self.frame_header_size() + self.data_type_size() * packet_type
    }
}

/// Decoded packet header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    /// Data type index
    pub packet_type: u8,
    /// Subframe number
    pub subframe: u8,
    /// Frame number
    pub frame_number: u32,
    /// Packet number within the subframe
    pub packet_number: u16,
}

impl PacketHeader {
    /// Decode the fixed fields of a raw header. Returns `None` when `raw` is
    /// shorter than the fixed fields.
    #[must_use]
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < FRAME_INFO_OFFSET {
            return None;
        }
        let mut frame = [0u8; 4];
        frame.copy_from_slice(&raw[FRAME_NUMBER_OFFSET..FRAME_NUMBER_OFFSET + 4]);
        let mut packet = [0u8; 2];
        packet.copy_from_slice(&raw[PACKET_NUMBER_OFFSET..PACKET_NUMBER_OFFSET + 2]);
        Some(Self {
            packet_type: raw[PACKET_TYPE_OFFSET],
            subframe: raw[SUBFRAME_OFFSET],
            frame_number: u32::from_be_bytes(frame),
            packet_number: u16::from_be_bytes(packet),
        })
    }

    /// Encode the fixed fields into `raw`, leaving the frame info untouched.
    pub fn write_to(&self, raw: &mut [u8]) {
        if raw.len() < FRAME_INFO_OFFSET {
            return;
        }
        raw[PACKET_TYPE_OFFSET] = self.packet_type;
        raw[SUBFRAME_OFFSET] = self.subframe;
        raw[FRAME_NUMBER_OFFSET..FRAME_NUMBER_OFFSET + 4]
            .copy_from_slice(&self.frame_number.to_be_bytes());
        raw[PACKET_NUMBER_OFFSET..PACKET_NUMBER_OFFSET + 2]
            .copy_from_slice(&self.packet_number.to_be_bytes());
    }

    /// Build a full header of `layout.packet_header_size` bytes.
    #[must_use]
    pub fn to_bytes(&self, layout: &PacketLayout) -> Vec<u8> {
        let mut raw = vec![0u8; layout.packet_header_size.max(FRAME_INFO_OFFSET)];
        self.write_to(&mut raw);
        raw
    }
}

/// Assembly state of a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum FrameState {
    /// Not yet written
    Empty = 0,
    /// Packets still missing
    Incomplete = 1,
    /// Every packet received
    Complete = 2,
    /// Released before completion by the timeout sweep
    TimedOut = 3,
}

impl FrameState {
    /// Decode a raw state value.
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(FrameState::Empty),
            1 => Some(FrameState::Incomplete),
            2 => Some(FrameState::Complete),
            3 => Some(FrameState::TimedOut),
            _ => None,
        }
    }

    /// Lowercase name for logs and status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FrameState::Empty => "empty",
            FrameState::Incomplete => "incomplete",
            FrameState::Complete => "complete",
            FrameState::TimedOut => "timed_out",
        }
    }
}

/// View of the header at the start of a frame buffer.
///
/// Works over `&[u8]` for reading and `&mut [u8]` for writing. Construction
/// fails when the buffer is shorter than the layout's header.
#[derive(Debug)]
pub struct FrameHeader<B> {
    buf: B,
    frame_info_size: usize,
    num_packets: usize,
}

impl<B: AsRef<[u8]>> FrameHeader<B> {
    /// View the header at the start of `buf`.
    pub fn new(buf: B, layout: &PacketLayout) -> Option<Self> {
        if buf.as_ref().len() < layout.frame_header_size() {
            return None;
        }
        Some(Self {
            buf,
            frame_info_size: layout.frame_info_size,
            num_packets: layout.num_frame_packets(),
        })
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buf.as_ref()[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }

    fn read_u64(&self, offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.buf.as_ref()[offset..offset + 8]);
        u64::from_le_bytes(bytes)
    }

    fn state_map_offset(&self) -> usize {
        HDR_FRAME_INFO + self.frame_info_size
    }

    /// Frame number.
    #[must_use]
    pub fn frame_number(&self) -> u32 {
        self.read_u32(HDR_FRAME_NUMBER)
    }

    /// Raw frame state value.
    #[must_use]
    pub fn raw_frame_state(&self) -> u32 {
        self.read_u32(HDR_FRAME_STATE)
    }

    /// Frame state, `None` when the raw value is unknown.
    #[must_use]
    pub fn frame_state(&self) -> Option<FrameState> {
        FrameState::from_raw(self.raw_frame_state())
    }

    /// Arrival time of the first packet as seconds and nanoseconds.
    #[must_use]
    pub fn start_time_raw(&self) -> (u64, u32) {
        (self.read_u64(HDR_START_SECS), self.read_u32(HDR_START_NSECS))
    }

    /// Arrival time of the first packet.
    #[must_use]
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        let (secs, nsecs) = self.start_time_raw();
        DateTime::from_timestamp(i64::try_from(secs).ok()?, nsecs)
    }

    /// Packets received so far.
    #[must_use]
    pub fn packets_received(&self) -> u32 {
        self.read_u32(HDR_PACKETS_RECEIVED)
    }

    /// Frame info copied from the first packet.
    #[must_use]
    pub fn frame_info(&self) -> &[u8] {
        &self.buf.as_ref()[HDR_FRAME_INFO..HDR_FRAME_INFO + self.frame_info_size]
    }

    /// Received flag of packet `index`.
    #[must_use]
    pub fn packet_received(&self, index: usize) -> bool {
        index < self.num_packets && self.buf.as_ref()[self.state_map_offset() + index] != 0
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> FrameHeader<B> {
    fn write_u32(&mut self, offset: usize, value: u32) {
        self.buf.as_mut()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u64(&mut self, offset: usize, value: u64) {
        self.buf.as_mut()[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Start a new frame: Incomplete, no packets, state map cleared.
    pub fn initialize(&mut self, frame_number: u32, start: DateTime<Utc>) {
        let end = self.state_map_offset() + self.num_packets;
        self.buf.as_mut()[..end].fill(0);
        self.write_u32(HDR_FRAME_NUMBER, frame_number);
        self.set_frame_state(FrameState::Incomplete);
        self.set_start_time(start);
    }

    /// Set the frame state.
    pub fn set_frame_state(&mut self, state: FrameState) {
        self.write_u32(HDR_FRAME_STATE, state as u32);
    }

    /// Set the frame start time.
    pub fn set_start_time(&mut self, start: DateTime<Utc>) {
        let secs = u64::try_from(start.timestamp()).unwrap_or(0);
        self.write_u64(HDR_START_SECS, secs);
        self.write_u32(HDR_START_NSECS, start.timestamp_subsec_nanos());
    }

    /// Set the received packet count.
    pub fn set_packets_received(&mut self, count: u32) {
        self.write_u32(HDR_PACKETS_RECEIVED, count);
    }

    /// Copy `info` into the frame info block, truncated to its size.
    pub fn set_frame_info(&mut self, info: &[u8]) {
        let len = info.len().min(self.frame_info_size);
        self.buf.as_mut()[HDR_FRAME_INFO..HDR_FRAME_INFO + len].copy_from_slice(&info[..len]);
    }

    /// Mark packet `index` as received. Returns false if it already was.
    pub fn mark_packet(&mut self, index: usize) -> bool {
        if index >= self.num_packets {
            return false;
        }
        let offset = self.state_map_offset() + index;
        let slot = &mut self.buf.as_mut()[offset];
        if *slot != 0 {
            return false;
        }
        *slot = 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_layout() -> PacketLayout {
        PacketLayout {
            primary_packet_size: 16,
            num_primary_packets: 3,
            tail_packet_size: 4,
            num_tail_packets: 1,
            num_subframes: 2,
            num_data_types: 2,
            packet_header_size: 22,
            frame_info_size: 14,
        }
    }

    #[test]
    fn test_packet_header_decodes_fields() {
        let mut raw = [0u8; 22];
        raw[0] = 1;
        raw[1] = 15;
        raw[2..6].copy_from_slice(&[0x12, 0x34, 0x56, 0x78]);
        raw[6..8].copy_from_slice(&[0xAA, 0x55]);

        let header = PacketHeader::parse(&raw).unwrap();
        assert_eq!(header.packet_type, 1);
        assert_eq!(header.subframe, 15);
        assert_eq!(header.frame_number, 0x1234_5678);
        assert_eq!(header.packet_number, 0xAA55);
    }

    #[test]
    fn test_packet_header_too_short() {
        assert!(PacketHeader::parse(&[0u8; 7]).is_none());
    }

    #[test]
    fn test_header_write_then_parse() {
        let header = PacketHeader {
            packet_type: 0,
            subframe: 1,
            frame_number: 99,
            packet_number: 255,
        };
        let raw = header.to_bytes(&PacketLayout::default());
        assert_eq!(raw.len(), 22);
        assert_eq!(PacketHeader::parse(&raw), Some(header));
    }

    #[test]
    fn test_default_layout_sizes() {
        let layout = PacketLayout::default();
        assert_eq!(layout.packets_per_subframe(), 256);
        assert_eq!(layout.num_frame_packets(), 1024);
        assert_eq!(layout.subframe_size(), 8192 * 255 + 512);
        assert_eq!(layout.frame_header_size() % 8, 0);
        assert_eq!(layout.frame_header_size(), (24 + 14 + 1024usize).div_ceil(8) * 8);
        assert_eq!(
            layout.frame_buffer_size(),
            layout.frame_header_size() + 2 * 2 * layout.subframe_size()
        );
    }

    #[test]
    fn test_payload_offsets() {
        let layout = small_layout();
        let base = layout.frame_header_size();
        assert_eq!(layout.subframe_size(), 52);
        assert_eq!(layout.payload_offset(0, 0, 0), base);
        assert_eq!(layout.payload_offset(0, 0, 2), base + 32);
        // Tail packet follows the primaries.
        assert_eq!(layout.payload_offset(0, 0, 3), base + 48);
        assert_eq!(layout.payload_offset(0, 1, 0), base + 52);
        assert_eq!(layout.payload_offset(1, 0, 0), base + 104);
        assert_eq!(layout.payload_size(2), 16);
        assert_eq!(layout.payload_size(3), 4);

        let last = layout.payload_offset(1, 1, 3) + layout.payload_size(3);
        assert_eq!(last, layout.frame_buffer_size());
    }

    #[test]
    fn test_contains_rejects_out_of_range() {
        let layout = small_layout();
        let ok = PacketHeader {
            packet_type: 1,
            subframe: 1,
            frame_number: 0,
            packet_number: 3,
        };
        assert!(layout.contains(&ok));
        assert!(!layout.contains(&PacketHeader { packet_type: 2, ..ok }));
        assert!(!layout.contains(&PacketHeader { subframe: 2, ..ok }));
        assert!(!layout.contains(&PacketHeader { packet_number: 4, ..ok }));
    }

    #[test]
    fn test_frame_header_view() {
        let layout = small_layout();
        let mut buf = vec![0xFFu8; layout.frame_buffer_size()];
        let start = Utc::now();
        {
            let mut header = FrameHeader::new(buf.as_mut_slice(), &layout).unwrap();
            header.initialize(7, start);
            assert!(header.mark_packet(3));
            assert!(!header.mark_packet(3));
            header.set_packets_received(1);
            header.set_frame_info(&[9u8; 20]);
        }

        let header = FrameHeader::new(buf.as_slice(), &layout).unwrap();
        assert_eq!(header.frame_number(), 7);
        assert_eq!(header.frame_state(), Some(FrameState::Incomplete));
        assert_eq!(header.packets_received(), 1);
        assert_eq!(header.frame_info(), &[9u8; 14]);
        assert!(header.packet_received(3));
        assert!(!header.packet_received(2));
        assert_eq!(header.start_time(), Some(start));
        assert_eq!(&buf[0..4], &7u32.to_le_bytes());
    }

    #[test]
    fn test_frame_header_rejects_short_buffer() {
        let layout = small_layout();
        let buf = vec![0u8; layout.frame_header_size() - 1];
        assert!(FrameHeader::new(buf.as_slice(), &layout).is_none());
    }
}
