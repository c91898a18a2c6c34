//! Frame decoders: turn a stream of detector packets into complete frames.
//!
//! A decoder owns the set of empty shared buffers handed to it by the
//! controller and the in-flight map of frames being assembled. For every
//! datagram the RX thread calls, in order:
//!
//! 1. [`FrameDecoder::process_packet_header`] with the header bytes
//! 2. [`FrameDecoder::next_payload_buffer`] to find where the payload goes
//! 3. [`FrameDecoder::process_packet`] once the payload has been copied
//!
//! When a frame completes (or is swept by [`FrameDecoder::monitor_buffers`]
//! after `frame_timeout_ms`), the registered ready callback receives the
//! buffer id and frame number, and the buffer leaves the decoder's ownership
//! until it is pushed back with [`FrameDecoder::push_empty_buffer`].
//!
//! Shared state and bookkeeping live in [`DecoderCore`]; concrete decoders
//! embed one and implement the layout-specific parts of the trait.

mod percival;
mod registry;

pub use percival::PercivalDecoder;
pub use registry::{DecoderFactory, DecoderRegistry};

use crate::error::{DecoderError, DecoderResult};
use odin_common::{IpcMessage, SharedBufferManager, VersionInfo};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Tracing target for per-packet logging.
pub const PACKET_LOG_TARGET: &str = "odin::packet_logger";

/// Default in-flight frame timeout.
pub const DEFAULT_FRAME_TIMEOUT_MS: u64 = 1000;

/// Callback fired with `(buffer_id, frame_number)` when a frame is ready.
pub type FrameReadyCallback = Box<dyn FnMut(usize, u32) + Send>;

/// State of the frame a packet belonged to, after the packet was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameReceiveState {
    /// No frame tracked
    Empty,
    /// More packets expected
    Incomplete,
    /// The packet completed its frame
    Complete,
    /// The frame was evicted by the timeout sweep
    TimedOut,
    /// The packet was discarded
    Error,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    buffer_id: usize,
    started: Instant,
}

/// Buffer bookkeeping and statistics shared by every decoder.
pub struct DecoderCore {
    buffer_manager: Option<Arc<SharedBufferManager>>,
    ready_callback: Option<FrameReadyCallback>,
    empty_buffers: VecDeque<usize>,
    frame_buffer_map: HashMap<u32, InFlight>,
    enable_packet_logging: bool,
    frame_timeout_ms: u64,
    frames_timed_out: u64,
    frames_dropped: u64,
    buffers_rejected: u64,
}

impl Default for DecoderCore {
    fn default() -> Self {
        Self::new()
    }
}

impl DecoderCore {
    /// Empty core with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer_manager: None,
            ready_callback: None,
            empty_buffers: VecDeque::new(),
            frame_buffer_map: HashMap::new(),
            enable_packet_logging: false,
            frame_timeout_ms: DEFAULT_FRAME_TIMEOUT_MS,
            frames_timed_out: 0,
            frames_dropped: 0,
            buffers_rejected: 0,
        }
    }

    /// Apply `enable_packet_logging` and `frame_timeout_ms` from `config`.
    pub fn configure(&mut self, config: &IpcMessage) -> DecoderResult<()> {
        self.enable_packet_logging =
            config.get_param_or("enable_packet_logging", self.enable_packet_logging)?;
        self.frame_timeout_ms = config.get_param_or("frame_timeout_ms", self.frame_timeout_ms)?;
        Ok(())
    }

    /// Write the common configuration under `prefix`.
    pub fn write_configuration(&self, prefix: &str, reply: &mut IpcMessage) {
        reply.set_param(
            &format!("{prefix}enable_packet_logging"),
            self.enable_packet_logging,
        );
        reply.set_param(&format!("{prefix}frame_timeout_ms"), self.frame_timeout_ms);
    }

    /// Write buffer counts and statistics under `prefix`.
    pub fn write_status(&self, prefix: &str, status: &mut IpcMessage) {
        status.set_param(&format!("{prefix}empty_buffers"), self.empty_buffers.len());
        status.set_param(&format!("{prefix}mapped_buffers"), self.frame_buffer_map.len());
        status.set_param(&format!("{prefix}frames_timedout"), self.frames_timed_out);
        status.set_param(&format!("{prefix}frames_dropped"), self.frames_dropped);
        status.set_param(&format!("{prefix}buffers_rejected"), self.buffers_rejected);
    }

    /// Record the buffer manager. Any previously held buffer ids are forgotten.
    pub fn set_buffer_manager(&mut self, manager: Arc<SharedBufferManager>) {
        self.drop_all_buffers();
        self.buffer_manager = Some(manager);
    }

    /// The registered buffer manager.
    #[must_use]
    pub fn buffer_manager(&self) -> Option<&Arc<SharedBufferManager>> {
        self.buffer_manager.as_ref()
    }

    /// Mutable view of shared buffer `buffer_id`.
    ///
    /// Returns `None` without a manager or for an id out of range.
    #[allow(unsafe_code)]
    pub fn buffer_mut(&mut self, buffer_id: usize) -> Option<&mut [u8]> {
        let manager = self.buffer_manager.as_ref()?;
        // SAFETY: the decoder only writes buffers it owns, either queued as
        // empty or mapped to an in-flight frame. Ownership passes to the
        // processor with the ready callback and returns with
        // `push_empty_buffer`, and `&mut self` keeps the slice unique here.
        unsafe { manager.buffer_mut(buffer_id).ok() }
    }

    /// Set the frame ready callback.
    pub fn set_ready_callback(&mut self, callback: FrameReadyCallback) {
        self.ready_callback = Some(callback);
    }

    /// Hand a finished buffer to the ready callback.
    pub fn emit_ready(&mut self, buffer_id: usize, frame_number: u32) {
        match self.ready_callback.as_mut() {
            Some(callback) => callback(buffer_id, frame_number),
            None => debug!(buffer_id, frame = frame_number, "Frame ready with no callback registered"),
        }
    }

    /// Queue an empty buffer.
    ///
    /// A buffer id is owned by exactly one of the empty queue, an in-flight
    /// frame or the processor. Ids outside the registered region, or already
    /// queued or in flight, are rejected and counted. Returns whether the id
    /// was queued.
    pub fn push_empty_buffer(&mut self, buffer_id: usize) -> bool {
        let reason = match self.buffer_manager.as_ref() {
            None => Some("no shared buffer manager registered"),
            Some(manager) if buffer_id >= manager.num_buffers() => Some("buffer id out of range"),
            Some(_) if self.empty_buffers.contains(&buffer_id) => Some("buffer already empty"),
            Some(_)
                if self
                    .frame_buffer_map
                    .values()
                    .any(|f| f.buffer_id == buffer_id) =>
            {
                Some("buffer holds an in-flight frame")
            }
            Some(_) => None,
        };
        if let Some(reason) = reason {
            self.buffers_rejected += 1;
            warn!(buffer_id, reason, "Rejected empty buffer");
            return false;
        }
        self.empty_buffers.push_back(buffer_id);
        true
    }

    /// Number of buffers in the registered region, zero without one.
    #[must_use]
    pub fn num_buffers(&self) -> usize {
        self.buffer_manager
            .as_ref()
            .map_or(0, |manager| manager.num_buffers())
    }

    /// Empty buffers refused by [`push_empty_buffer`](Self::push_empty_buffer).
    #[must_use]
    pub fn buffers_rejected(&self) -> u64 {
        self.buffers_rejected
    }

    /// Take the next empty buffer.
    pub fn pop_empty_buffer(&mut self) -> Option<usize> {
        self.empty_buffers.pop_front()
    }

    /// Empty buffers available.
    #[must_use]
    pub fn num_empty_buffers(&self) -> usize {
        self.empty_buffers.len()
    }

    /// Buffers mapped to in-flight frames.
    #[must_use]
    pub fn num_mapped_buffers(&self) -> usize {
        self.frame_buffer_map.len()
    }

    /// Forget every empty and in-flight buffer.
    pub fn drop_all_buffers(&mut self) {
        self.empty_buffers.clear();
        self.frame_buffer_map.clear();
    }

    /// Map `frame_number` to `buffer_id` as of now.
    pub fn map_frame(&mut self, frame_number: u32, buffer_id: usize) {
        self.frame_buffer_map.insert(
            frame_number,
            InFlight {
                buffer_id,
                started: Instant::now(),
            },
        );
    }

    /// Buffer holding the in-flight frame `frame_number`.
    #[must_use]
    pub fn mapped_buffer(&self, frame_number: u32) -> Option<usize> {
        self.frame_buffer_map.get(&frame_number).map(|f| f.buffer_id)
    }

    /// Remove `frame_number` from the in-flight map, returning its buffer.
    pub fn unmap_frame(&mut self, frame_number: u32) -> Option<usize> {
        self.frame_buffer_map
            .remove(&frame_number)
            .map(|f| f.buffer_id)
    }

    /// Remove and return every in-flight frame older than the timeout, as
    /// `(frame_number, buffer_id)` sorted by frame number.
    pub fn take_stale_frames(&mut self, now: Instant) -> Vec<(u32, usize)> {
        let timeout = Duration::from_millis(self.frame_timeout_ms);
        let mut stale: Vec<(u32, usize)> = self
            .frame_buffer_map
            .iter()
            .filter(|(_, f)| now.saturating_duration_since(f.started) > timeout)
            .map(|(&frame, f)| (frame, f.buffer_id))
            .collect();
        stale.sort_unstable();
        for (frame, _) in &stale {
            self.frame_buffer_map.remove(frame);
        }
        stale
    }

    /// Frame timeout in milliseconds.
    #[must_use]
    pub fn frame_timeout_ms(&self) -> u64 {
        self.frame_timeout_ms
    }

    /// Whether per-packet logging is on.
    #[must_use]
    pub fn packet_logging_enabled(&self) -> bool {
        self.enable_packet_logging
    }

    /// Frames evicted by the timeout sweep.
    #[must_use]
    pub fn frames_timed_out(&self) -> u64 {
        self.frames_timed_out
    }

    /// Count one timed-out frame.
    pub fn record_timed_out(&mut self) {
        self.frames_timed_out += 1;
    }

    /// Frames dropped for lack of a buffer.
    #[must_use]
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    /// Count one dropped frame.
    pub fn record_dropped(&mut self) {
        self.frames_dropped += 1;
    }

    /// Zero the counters.
    pub fn reset_statistics(&mut self) {
        self.frames_timed_out = 0;
        self.frames_dropped = 0;
        self.buffers_rejected = 0;
    }
}

/// A packet decoder for one detector type.
///
/// Only called from the RX thread. Cross-thread readers see decoder state
/// through the status messages the RX thread sends.
pub trait FrameDecoder: Send {
    /// Shared bookkeeping.
    fn core(&self) -> &DecoderCore;

    /// Shared bookkeeping, mutable.
    fn core_mut(&mut self) -> &mut DecoderCore;

    /// Registered decoder type name.
    fn name(&self) -> &'static str;

    // -------------------------------------------------------------------------
    // Layout
    // -------------------------------------------------------------------------

    /// Bytes needed to hold one frame, header included.
    fn frame_buffer_size(&self) -> usize;

    /// Bytes of the frame header at the start of each buffer.
    fn frame_header_size(&self) -> usize;

    /// Bytes of the header at the start of each packet.
    fn packet_header_size(&self) -> usize;

    // -------------------------------------------------------------------------
    // Packet path
    // -------------------------------------------------------------------------

    /// Decode a packet header received from `from`.
    fn process_packet_header(&mut self, header: &[u8], from: SocketAddr);

    /// Where the payload of the current packet must be copied.
    fn next_payload_buffer(&mut self) -> &mut [u8];

    /// Account for a payload of `bytes_received` bytes copied into
    /// [`next_payload_buffer`](Self::next_payload_buffer).
    fn process_packet(&mut self, bytes_received: usize) -> FrameReceiveState;

    /// Sweep in-flight frames older than the timeout.
    fn monitor_buffers(&mut self);

    // -------------------------------------------------------------------------
    // Provided
    // -------------------------------------------------------------------------

    /// Apply a decoder configuration.
    fn init(&mut self, config: &IpcMessage) -> DecoderResult<()> {
        self.core_mut().configure(config)
    }

    /// Attach the shared buffers frames are assembled in.
    fn register_buffer_manager(&mut self, manager: Arc<SharedBufferManager>) -> DecoderResult<()> {
        let required = self.frame_buffer_size();
        if manager.buffer_size() < required {
            return Err(DecoderError::BufferTooSmall {
                buffer_size: manager.buffer_size(),
                required,
            });
        }
        info!(
            decoder = self.name(),
            num_buffers = manager.num_buffers(),
            buffer_size = manager.buffer_size(),
            "Registered shared buffer manager"
        );
        self.core_mut().set_buffer_manager(manager);
        Ok(())
    }

    /// Set the callback fired for every ready frame.
    fn register_frame_ready_callback(&mut self, callback: FrameReadyCallback) {
        self.core_mut().set_ready_callback(callback);
    }

    /// Return a buffer to the empty queue. Returns false when the id was
    /// rejected.
    fn push_empty_buffer(&mut self, buffer_id: usize) -> bool {
        self.core_mut().push_empty_buffer(buffer_id)
    }

    /// Empty buffers available.
    fn num_empty_buffers(&self) -> usize {
        self.core().num_empty_buffers()
    }

    /// Buffers mapped to in-flight frames.
    fn num_mapped_buffers(&self) -> usize {
        self.core().num_mapped_buffers()
    }

    /// Forget every empty and in-flight buffer.
    fn drop_all_buffers(&mut self) {
        self.core_mut().drop_all_buffers();
    }

    /// Frame timeout in milliseconds.
    fn frame_timeout_ms(&self) -> u64 {
        self.core().frame_timeout_ms()
    }

    /// Frames evicted by the timeout sweep.
    fn frames_timed_out(&self) -> u64 {
        self.core().frames_timed_out()
    }

    /// Frames dropped for lack of a buffer.
    fn frames_dropped(&self) -> u64 {
        self.core().frames_dropped()
    }

    /// Whether per-packet logging is on.
    fn packet_logging_enabled(&self) -> bool {
        self.core().packet_logging_enabled()
    }

    /// Zero the statistics.
    fn reset_statistics(&mut self) {
        self.core_mut().reset_statistics();
    }

    /// Commands accepted by [`execute`](Self::execute).
    fn request_commands(&self) -> Vec<String> {
        Vec::new()
    }

    /// Execute a decoder command.
    fn execute(&mut self, command: &str, _reply: &mut IpcMessage) -> DecoderResult<()> {
        Err(DecoderError::UnsupportedCommand(command.to_string()))
    }

    /// Write the decoder configuration under `prefix`.
    fn request_configuration(&self, prefix: &str, reply: &mut IpcMessage) {
        self.core().write_configuration(prefix, reply);
    }

    /// Write decoder status under `prefix`.
    fn get_status(&self, prefix: &str, status: &mut IpcMessage) {
        status.set_param(&format!("{prefix}name"), self.name());
        self.core().write_status(prefix, status);
    }

    /// Version of the decoder.
    fn version(&self) -> VersionInfo {
        odin_common::version()
    }
}
