//! Decoder for the Percival emulator packet stream.

use super::{DecoderCore, FrameDecoder, FrameReceiveState, PACKET_LOG_TARGET};
use crate::error::{DecoderError, DecoderResult};
use chrono::Utc;
use odin_common::percival::FRAME_INFO_OFFSET;
use odin_common::{FrameHeader, FrameState, IpcMessage, PacketHeader, PacketLayout};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Where the packets of the tracked frame are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    /// A shared buffer owned by the decoder
    Buffer(usize),
    /// The private scratch frame, contents discarded
    Scratch,
    /// The current packet is invalid; payload goes to the discard buffer
    Discard,
}

/// Reassembles Percival frames into shared buffers.
pub struct PercivalDecoder {
    core: DecoderCore,
    layout: PacketLayout,

    current_header: PacketHeader,
    current_raw_header: Vec<u8>,
    current_frame: Option<u32>,
    target: Target,

    dropping: bool,
    dropped_frames: HashMap<u32, Instant>,
    scratch_frame: Option<u32>,
    scratch: Vec<u8>,
    discard: Vec<u8>,

    packets_received: u64,
    packets_duplicated: u64,
    packets_invalid: u64,
}

impl Default for PercivalDecoder {
    fn default() -> Self {
        Self::new(PacketLayout::default())
    }
}

impl PercivalDecoder {
    /// Registered type name.
    pub const NAME: &'static str = "PercivalDecoder";

    /// Decoder for `layout`.
    #[must_use]
    pub fn new(layout: PacketLayout) -> Self {
        let mut decoder = Self {
            core: DecoderCore::new(),
            layout: PacketLayout::default(),
            current_header: PacketHeader::default(),
            current_raw_header: Vec::new(),
            current_frame: None,
            target: Target::Discard,
            dropping: false,
            dropped_frames: HashMap::new(),
            scratch_frame: None,
            scratch: Vec::new(),
            discard: Vec::new(),
            packets_received: 0,
            packets_duplicated: 0,
            packets_invalid: 0,
        };
        decoder.set_layout(layout);
        decoder
    }

    /// Current packet layout.
    #[must_use]
    pub fn layout(&self) -> &PacketLayout {
        &self.layout
    }

    /// True while frames are being dropped for lack of buffers.
    #[must_use]
    pub fn is_dropping(&self) -> bool {
        self.dropping
    }

    /// Packets that repeated an already received packet of their frame.
    #[must_use]
    pub fn packets_duplicated(&self) -> u64 {
        self.packets_duplicated
    }

    /// Packets discarded for an out-of-range header.
    #[must_use]
    pub fn packets_invalid(&self) -> u64 {
        self.packets_invalid
    }

    fn set_layout(&mut self, layout: PacketLayout) {
        self.scratch = vec![0u8; layout.frame_buffer_size()];
        self.discard = vec![0u8; layout.primary_packet_size.max(layout.tail_packet_size)];
        self.current_raw_header = vec![0u8; layout.packet_header_size];
        self.layout = layout;
        self.forget_tracking();
    }

    fn forget_tracking(&mut self) {
        self.current_frame = None;
        self.target = Target::Discard;
        self.scratch_frame = None;
        self.dropped_frames.clear();
    }

    /// Make `frame_number` the tracked frame, finding or allocating its buffer.
    fn track_frame(&mut self, frame_number: u32) {
        if self.current_frame == Some(frame_number) && self.target != Target::Discard {
            return;
        }

        if let Some(buffer_id) = self.core.mapped_buffer(frame_number) {
            self.target = Target::Buffer(buffer_id);
        } else if self.dropped_frames.contains_key(&frame_number) {
            self.use_scratch(frame_number);
        } else if let Some(buffer_id) = self.core.pop_empty_buffer() {
            if self.dropping {
                self.dropping = false;
                info!(
                    frame = frame_number,
                    "Free buffer available again, leaving dropping mode"
                );
            }
            self.core.map_frame(frame_number, buffer_id);
            match self.core.buffer_mut(buffer_id) {
                Some(buffer) => {
                    if let Some(mut header) = FrameHeader::new(buffer, &self.layout) {
                        header.initialize(frame_number, Utc::now());
                    }
                    self.target = Target::Buffer(buffer_id);
                    debug!(frame = frame_number, buffer_id, "Mapped new frame to buffer");
                }
                None => {
                    error!(buffer_id, "Empty buffer is not addressable, discarding frame");
                    self.core.unmap_frame(frame_number);
                    self.target = Target::Discard;
                    return;
                }
            }
        } else {
            self.core.record_dropped();
            self.dropped_frames.insert(frame_number, Instant::now());
            if !self.dropping {
                self.dropping = true;
                error!(
                    frame = frame_number,
                    "No free buffers available for frame, dropping packets"
                );
            }
            self.use_scratch(frame_number);
        }

        self.current_frame = Some(frame_number);
    }

    fn use_scratch(&mut self, frame_number: u32) {
        if self.scratch_frame != Some(frame_number) {
            if let Some(mut header) = FrameHeader::new(self.scratch.as_mut_slice(), &self.layout) {
                header.initialize(frame_number, Utc::now());
            }
            self.scratch_frame = Some(frame_number);
        }
        self.target = Target::Scratch;
    }

    fn write_layout(&self, prefix: &str, reply: &mut IpcMessage) {
        let l = &self.layout;
        let fields = [
            ("primary_packet_size", l.primary_packet_size),
            ("num_primary_packets", l.num_primary_packets),
            ("tail_packet_size", l.tail_packet_size),
            ("num_tail_packets", l.num_tail_packets),
            ("num_subframes", l.num_subframes),
            ("num_data_types", l.num_data_types),
            ("packet_header_size", l.packet_header_size),
            ("frame_info_size", l.frame_info_size),
        ];
        for (key, value) in fields {
            reply.set_param(&format!("{prefix}layout/{key}"), value);
        }
    }
}

impl FrameDecoder for PercivalDecoder {
    fn core(&self) -> &DecoderCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DecoderCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn frame_buffer_size(&self) -> usize {
        self.layout.frame_buffer_size()
    }

    fn frame_header_size(&self) -> usize {
        self.layout.frame_header_size()
    }

    fn packet_header_size(&self) -> usize {
        self.layout.packet_header_size
    }

    fn process_packet_header(&mut self, header: &[u8], from: SocketAddr) {
        let parsed = PacketHeader::parse(header).filter(|h| self.layout.contains(h));
        let Some(parsed) = parsed else {
            self.packets_invalid += 1;
            self.target = Target::Discard;
            warn!(
                from = %from,
                len = header.len(),
                "Discarding packet with invalid header"
            );
            return;
        };

        if self.core.packet_logging_enabled() {
            trace!(
                target: PACKET_LOG_TARGET,
                from = %from,
                packet_type = parsed.packet_type,
                subframe = parsed.subframe,
                packet = parsed.packet_number,
                frame = parsed.frame_number,
                "Packet header"
            );
        }

        let len = header.len().min(self.current_raw_header.len());
        self.current_raw_header[..len].copy_from_slice(&header[..len]);
        self.current_raw_header[len..].fill(0);
        self.current_header = parsed;
        self.track_frame(parsed.frame_number);
    }

    fn next_payload_buffer(&mut self) -> &mut [u8] {
        let h = self.current_header;
        let offset = self.layout.payload_offset(
            usize::from(h.packet_type),
            usize::from(h.subframe),
            usize::from(h.packet_number),
        );
        let size = self.layout.payload_size(usize::from(h.packet_number));

        let in_frame = match self.target {
            Target::Buffer(buffer_id) => self.core.buffer_mut(buffer_id),
            Target::Scratch => Some(self.scratch.as_mut_slice()),
            Target::Discard => None,
        };
        match in_frame {
            Some(buffer) if offset + size <= buffer.len() => &mut buffer[offset..offset + size],
            _ => self.discard.as_mut_slice(),
        }
    }

    fn process_packet(&mut self, bytes_received: usize) -> FrameReceiveState {
        if self.target == Target::Discard {
            return FrameReceiveState::Error;
        }
        let Some(frame_number) = self.current_frame else {
            return FrameReceiveState::Empty;
        };

        let h = self.current_header;
        let expected = self.layout.payload_size(usize::from(h.packet_number));
        if bytes_received != expected {
            debug!(
                frame = frame_number,
                packet = h.packet_number,
                bytes_received,
                expected,
                "Unexpected payload size"
            );
        }

        let index = self.layout.packet_index(
            usize::from(h.packet_type),
            usize::from(h.subframe),
            usize::from(h.packet_number),
        );
        let total = self.layout.num_frame_packets();
        let target = self.target;
        let info_end = (FRAME_INFO_OFFSET + self.layout.frame_info_size).min(self.current_raw_header.len());
        let info_start = FRAME_INFO_OFFSET.min(info_end);

        let buffer = match target {
            Target::Buffer(buffer_id) => self.core.buffer_mut(buffer_id),
            Target::Scratch => Some(self.scratch.as_mut_slice()),
            Target::Discard => None,
        };
        let Some(mut header) = buffer.and_then(|b| FrameHeader::new(b, &self.layout)) else {
            return FrameReceiveState::Error;
        };

        if !header.mark_packet(index) {
            self.packets_duplicated += 1;
            debug!(
                frame = frame_number,
                packet = h.packet_number,
                subframe = h.subframe,
                packet_type = h.packet_type,
                "Duplicate packet ignored"
            );
            return FrameReceiveState::Incomplete;
        }

        let received = header.packets_received();
        if received == 0 {
            header.set_frame_info(&self.current_raw_header[info_start..info_end]);
        }
        let received = received + 1;
        header.set_packets_received(received);
        self.packets_received += 1;

        if (received as usize) < total {
            return FrameReceiveState::Incomplete;
        }

        header.set_frame_state(FrameState::Complete);
        match target {
            Target::Buffer(buffer_id) => {
                self.core.unmap_frame(frame_number);
                debug!(frame = frame_number, buffer_id, "Frame complete");
                self.core.emit_ready(buffer_id, frame_number);
            }
            Target::Scratch => {
                self.dropped_frames.remove(&frame_number);
                self.scratch_frame = None;
                debug!(frame = frame_number, "Dropped frame complete, discarded");
            }
            Target::Discard => {}
        }
        self.current_frame = None;
        self.target = Target::Discard;
        FrameReceiveState::Complete
    }

    fn monitor_buffers(&mut self) {
        let now = Instant::now();
        let stale = self.core.take_stale_frames(now);
        for (frame_number, buffer_id) in stale {
            if let Some(buffer) = self.core.buffer_mut(buffer_id) {
                if let Some(mut header) = FrameHeader::new(buffer, &self.layout) {
                    header.set_frame_state(FrameState::TimedOut);
                }
            }
            warn!(
                frame = frame_number,
                buffer_id,
                "Frame timed out, releasing incomplete buffer"
            );
            if self.current_frame == Some(frame_number) {
                self.current_frame = None;
                self.target = Target::Discard;
            }
            self.core.record_timed_out();
            self.core.emit_ready(buffer_id, frame_number);
        }

        let timeout = Duration::from_millis(self.core.frame_timeout_ms());
        self.dropped_frames
            .retain(|_, seen| now.saturating_duration_since(*seen) <= timeout);
        if let Some(frame) = self.scratch_frame {
            if !self.dropped_frames.contains_key(&frame) {
                self.scratch_frame = None;
                if self.current_frame == Some(frame) {
                    self.current_frame = None;
                    self.target = Target::Discard;
                }
            }
        }
    }

    fn init(&mut self, config: &IpcMessage) -> DecoderResult<()> {
        self.core.configure(config)?;
        if config.has_param("layout") {
            let layout: PacketLayout = config.get_param("layout")?;
            if layout.num_frame_packets() == 0 || layout.packet_header_size < FRAME_INFO_OFFSET {
                return Err(DecoderError::InvalidConfig(format!(
                    "packet layout describes no packets or a header shorter than {FRAME_INFO_OFFSET} bytes"
                )));
            }
            if layout != self.layout {
                info!(?layout, "Applying packet layout");
                self.set_layout(layout);
            }
        }
        Ok(())
    }

    fn drop_all_buffers(&mut self) {
        self.core.drop_all_buffers();
        self.forget_tracking();
    }

    fn reset_statistics(&mut self) {
        self.core.reset_statistics();
        self.packets_received = 0;
        self.packets_duplicated = 0;
        self.packets_invalid = 0;
    }

    fn request_configuration(&self, prefix: &str, reply: &mut IpcMessage) {
        self.core.write_configuration(prefix, reply);
        self.write_layout(prefix, reply);
    }

    fn get_status(&self, prefix: &str, status: &mut IpcMessage) {
        status.set_param(&format!("{prefix}name"), Self::NAME);
        self.core.write_status(prefix, status);
        status.set_param(&format!("{prefix}packets_received"), self.packets_received);
        status.set_param(&format!("{prefix}packets_duplicated"), self.packets_duplicated);
        status.set_param(&format!("{prefix}packets_invalid"), self.packets_invalid);
        status.set_param(&format!("{prefix}dropping"), self.dropping);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odin_common::shared_buffer::HEADER_SIZE;
    use odin_common::{MsgType, MsgVal, SharedBufferManager};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;
    use tracing_test::traced_test;

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

    struct Harness {
        decoder: PercivalDecoder,
        manager: Arc<SharedBufferManager>,
        ready: Arc<Mutex<Vec<(usize, u32)>>>,
        _dir: TempDir,
    }

    fn harness(num_buffers: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let layout = small_layout();
        let size = layout.frame_buffer_size();
        let manager = Arc::new(
            SharedBufferManager::create_at(&dir.path().join("frames"), HEADER_SIZE + 4 * size, size)
                .unwrap(),
        );

        let mut decoder = PercivalDecoder::new(layout);
        decoder.register_buffer_manager(Arc::clone(&manager)).unwrap();
        for id in 0..num_buffers {
            decoder.push_empty_buffer(id);
        }

        let ready = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ready);
        decoder.register_frame_ready_callback(Box::new(move |buffer_id, frame| {
            sink.lock().push((buffer_id, frame));
        }));

        Harness {
            decoder,
            manager,
            ready,
            _dir: dir,
        }
    }

    fn frame_packets(layout: &PacketLayout, frame_number: u32) -> Vec<PacketHeader> {
        let mut packets = Vec::new();
        for packet_type in 0..layout.num_data_types {
            for subframe in 0..layout.num_subframes {
                for packet in 0..layout.packets_per_subframe() {
                    packets.push(PacketHeader {
                        packet_type: packet_type as u8,
                        subframe: subframe as u8,
                        frame_number,
                        packet_number: packet as u16,
                    });
                }
            }
        }
        packets
    }

    fn send(decoder: &mut PercivalDecoder, header: &PacketHeader, fill: u8) -> FrameReceiveState {
        let mut raw = header.to_bytes(decoder.layout());
        raw[FRAME_INFO_OFFSET..].fill(0x5A);
        decoder.process_packet_header(&raw, "127.0.0.1:9000".parse().unwrap());
        let payload = decoder.next_payload_buffer();
        payload.fill(fill);
        let len = payload.len();
        decoder.process_packet(len)
    }

    fn header_of(manager: &SharedBufferManager, buffer_id: usize) -> (u32, Option<FrameState>, u32) {
        let header = FrameHeader::new(manager.buffer(buffer_id).unwrap(), &small_layout()).unwrap();
        (header.frame_number(), header.frame_state(), header.packets_received())
    }

    #[test]
    fn test_complete_frame_fires_callback_once() {
        let mut h = harness(2);
        let packets = frame_packets(&small_layout(), 7);
        let (last, rest) = packets.split_last().unwrap();

        for packet in rest {
            assert_eq!(send(&mut h.decoder, packet, 1), FrameReceiveState::Incomplete);
            assert!(h.ready.lock().is_empty());
        }
        assert_eq!(h.decoder.num_mapped_buffers(), 1);
        assert_eq!(send(&mut h.decoder, last, 1), FrameReceiveState::Complete);

        assert_eq!(*h.ready.lock(), vec![(0, 7)]);
        assert_eq!(h.decoder.num_mapped_buffers(), 0);
        assert_eq!(h.decoder.num_empty_buffers(), 1);
        assert_eq!(
            header_of(&h.manager, 0),
            (7, Some(FrameState::Complete), packets.len() as u32)
        );

        let header = FrameHeader::new(h.manager.buffer(0).unwrap(), &small_layout()).unwrap();
        assert_eq!(header.frame_info(), &[0x5A; 14]);
    }

    #[test]
    fn test_duplicate_packet_does_not_advance() {
        let mut h = harness(1);
        let packets = frame_packets(&small_layout(), 3);
        let (last, rest) = packets.split_last().unwrap();

        for packet in rest {
            send(&mut h.decoder, packet, 2);
        }
        assert_eq!(send(&mut h.decoder, &rest[0], 2), FrameReceiveState::Incomplete);
        assert_eq!(h.decoder.packets_duplicated(), 1);
        assert!(h.ready.lock().is_empty());
        assert_eq!(header_of(&h.manager, 0).2, rest.len() as u32);

        assert_eq!(send(&mut h.decoder, last, 2), FrameReceiveState::Complete);
        assert_eq!(*h.ready.lock(), vec![(0, 3)]);
    }

    #[test]
    fn test_interleaved_frame_does_not_corrupt() {
        let layout = small_layout();
        let mut h = harness(2);
        let first = frame_packets(&layout, 10);
        let second = frame_packets(&layout, 11);
        let (head, tail) = first.split_at(first.len() / 2);

        for packet in head {
            send(&mut h.decoder, packet, 0xAA);
        }
        for packet in &second {
            send(&mut h.decoder, packet, 0xBB);
        }
        for packet in tail {
            send(&mut h.decoder, packet, 0xAA);
        }

        assert_eq!(*h.ready.lock(), vec![(1, 11), (0, 10)]);
        let data_start = layout.frame_header_size();
        let frame_end = layout.frame_buffer_size();
        assert!(h.manager.buffer(0).unwrap()[data_start..frame_end]
            .iter()
            .all(|&b| b == 0xAA));
        assert!(h.manager.buffer(1).unwrap()[data_start..frame_end]
            .iter()
            .all(|&b| b == 0xBB));
    }

    #[test]
    fn test_repeated_release_does_not_share_buffer() {
        let layout = small_layout();
        let mut h = harness(1);
        assert!(!h.decoder.push_empty_buffer(0));
        assert!(!h.decoder.push_empty_buffer(9));
        assert_eq!(h.decoder.num_empty_buffers(), 1);

        let first = frame_packets(&layout, 10);
        let second = frame_packets(&layout, 11);
        let (head, tail) = first.split_at(first.len() / 2);
        for packet in head {
            send(&mut h.decoder, packet, 0xAA);
        }
        for packet in &second {
            send(&mut h.decoder, packet, 0xBB);
        }
        assert!(!h.decoder.push_empty_buffer(0));
        for packet in tail {
            send(&mut h.decoder, packet, 0xAA);
        }

        assert_eq!(*h.ready.lock(), vec![(0, 10)]);
        assert_eq!(h.decoder.frames_dropped(), 1);
        let data_start = layout.frame_header_size();
        let frame_end = layout.frame_buffer_size();
        assert!(h.manager.buffer(0).unwrap()[data_start..frame_end]
            .iter()
            .all(|&b| b == 0xAA));
        assert_eq!(h.decoder.core().buffers_rejected(), 3);
    }

    #[test]
    #[traced_test]
    fn test_dropping_logged_once_and_recovers() {
        let layout = small_layout();
        let mut h = harness(0);

        for frame in [1, 2] {
            for packet in frame_packets(&layout, frame) {
                send(&mut h.decoder, &packet, 3);
            }
        }
        assert!(h.decoder.is_dropping());
        assert_eq!(h.decoder.frames_dropped(), 2);
        assert!(h.ready.lock().is_empty());
        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .filter(|line| line.contains("No free buffers available"))
                .count()
            {
                1 => Ok(()),
                n => Err(format!("expected one drop log, found {n}")),
            }
        });

        h.decoder.push_empty_buffer(0);
        for packet in frame_packets(&layout, 3) {
            send(&mut h.decoder, &packet, 3);
        }
        assert!(!h.decoder.is_dropping());
        assert_eq!(*h.ready.lock(), vec![(0, 3)]);
        assert!(logs_contain("leaving dropping mode"));
    }

    #[test]
    fn test_invalid_header_is_discarded() {
        let mut h = harness(1);
        let bad = PacketHeader {
            packet_type: 5,
            subframe: 0,
            frame_number: 1,
            packet_number: 0,
        };
        assert_eq!(send(&mut h.decoder, &bad, 9), FrameReceiveState::Error);

        h.decoder
            .process_packet_header(&[0u8; 4], "127.0.0.1:9000".parse().unwrap());
        let len = h.decoder.next_payload_buffer().len();
        assert_eq!(h.decoder.process_packet(len), FrameReceiveState::Error);

        assert_eq!(h.decoder.packets_invalid(), 2);
        assert_eq!(h.decoder.num_empty_buffers(), 1);
        assert_eq!(h.decoder.num_mapped_buffers(), 0);
    }

    #[test]
    fn test_timeout_sweep_releases_buffer() {
        let mut h = harness(1);
        let mut config = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        config.set_param("frame_timeout_ms", 10u64);
        h.decoder.init(&config).unwrap();

        for packet in frame_packets(&small_layout(), 4).iter().take(5) {
            send(&mut h.decoder, packet, 4);
        }
        h.decoder.monitor_buffers();
        assert!(h.ready.lock().is_empty());

        thread::sleep(Duration::from_millis(30));
        h.decoder.monitor_buffers();

        assert_eq!(*h.ready.lock(), vec![(0, 4)]);
        assert_eq!(h.decoder.frames_timed_out(), 1);
        assert_eq!(h.decoder.num_mapped_buffers(), 0);
        assert_eq!(header_of(&h.manager, 0), (4, Some(FrameState::TimedOut), 5));

        h.decoder.reset_statistics();
        assert_eq!(h.decoder.frames_timed_out(), 0);
    }

    #[test]
    fn test_buffer_manager_too_small() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(
            SharedBufferManager::create_at(&dir.path().join("tiny"), HEADER_SIZE + 64, 64).unwrap(),
        );
        let mut decoder = PercivalDecoder::new(small_layout());
        assert!(matches!(
            decoder.register_buffer_manager(manager),
            Err(DecoderError::BufferTooSmall { buffer_size: 64, .. })
        ));
    }

    #[test]
    fn test_commands_unsupported_by_default() {
        let mut decoder = PercivalDecoder::default();
        assert!(decoder.request_commands().is_empty());

        let mut reply = IpcMessage::new(MsgType::Ack, MsgVal::Execute);
        let err = decoder.execute("flush", &mut reply).unwrap_err();
        assert_eq!(err.to_string(), "Submitted command not supported: flush");
    }

    #[test]
    fn test_layout_configuration() {
        let mut decoder = PercivalDecoder::default();
        let mut config = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        config.set_param("layout/num_primary_packets", 3u64);
        config.set_param("layout/primary_packet_size", 16u64);
        decoder.init(&config).unwrap();
        assert_eq!(decoder.layout().num_primary_packets, 3);
        assert_eq!(decoder.layout().tail_packet_size, 512);

        let mut reply = IpcMessage::new(MsgType::Ack, MsgVal::RequestConfiguration);
        decoder.request_configuration("decoder_config/", &mut reply);
        assert_eq!(
            reply.get_param::<usize>("decoder_config/layout/primary_packet_size").unwrap(),
            16
        );
        assert!(reply.has_param("decoder_config/frame_timeout_ms"));

        let mut status = IpcMessage::new(MsgType::Ack, MsgVal::Status);
        decoder.get_status("decoder/", &mut status);
        assert_eq!(
            status.get_param::<String>("decoder/name").unwrap(),
            PercivalDecoder::NAME
        );
        assert_eq!(status.get_param::<u64>("decoder/frames_dropped").unwrap(), 0);
    }
}
