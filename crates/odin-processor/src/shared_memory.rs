//! Frame source fed by a frame receiver through shared memory.
//!
//! The controller subscribes to the receiver's frame-ready notifications,
//! wraps each announced buffer in a shared [`Frame`] and pushes it to every
//! registered consumer. When the last consumer drops the frame the buffer is
//! released back to the receiver on the release channel.

use crate::error::Result;
use crate::frame::{ChannelReleaseNotifier, Frame, FramePtr, ReleaseNotifier};
use crate::meta_data::{CompressionType, DataType, FrameMetaData};
use crate::plugin::FrameCallback;
use odin_common::{ChannelType, IpcChannel, IpcMessage, MsgType, MsgVal, SharedBufferManager};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Producer name consumers see for frames from the receiver.
pub const FRAME_RECEIVER: &str = "frame_receiver";

/// Dataset of frames wrapped from the receiver's buffers.
///
/// The receiver does not describe the pixel layout of its buffers, so each
/// shared frame is handed on as the whole slot of bytes. Detector specific
/// plugins such as `PercivalProcessPlugin` re-type it into image datasets.
pub const RAW_DATASET: &str = "raw";

const POLL_TIMEOUT_MS: i64 = 50;
const DEFAULT_BUFFER_CONFIG_RETRY: Duration = Duration::from_secs(1);

struct Shared {
    callbacks: RwLock<BTreeMap<String, Arc<dyn FrameCallback>>>,
    manager: RwLock<Option<Arc<SharedBufferManager>>>,
    notifier: Arc<ChannelReleaseNotifier>,
    frames_received: AtomicU64,
    running: AtomicBool,
}

impl Shared {
    fn push(&self, frame: FramePtr) {
        let consumers: Vec<_> = self.callbacks.read().values().cloned().collect();
        for consumer in consumers {
            consumer.callback(Arc::clone(&frame));
        }
    }

    fn request_buffer_config(&self) {
        let request = IpcMessage::new(MsgType::Cmd, MsgVal::RequestBufferConfig);
        match self.notifier.send(&request) {
            Ok(()) => debug!("Requested shared buffer configuration"),
            Err(e) => warn!(error = %e, "Failed to request shared buffer configuration"),
        }
    }

    fn handle_message(&self, text: &str) {
        let msg = match IpcMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Malformed message on frame ready channel");
                return;
            }
        };
        match (msg.msg_type(), msg.msg_val()) {
            (MsgType::Notify, MsgVal::FrameReady) => self.handle_frame_ready(&msg),
            (MsgType::Notify, MsgVal::BufferConfig) => self.handle_buffer_config(&msg),
            _ => debug!(message = %msg, "Ignoring message on frame ready channel"),
        }
    }

    fn handle_frame_ready(&self, msg: &IpcMessage) {
        let (frame_number, buffer_id) = match (
            msg.get_param::<u32>("frame"),
            msg.get_param::<usize>("buffer_id"),
        ) {
            (Ok(frame), Ok(buffer_id)) => (frame, buffer_id),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Frame ready notification without frame and buffer_id");
                return;
            }
        };
        self.frames_received.fetch_add(1, Ordering::Relaxed);

        let Some(manager) = self.manager.read().clone() else {
            error!(
                frame = frame_number,
                buffer_id, "Frame ready before shared buffer configuration, releasing"
            );
            self.notifier.release(frame_number, buffer_id);
            return;
        };

        let meta = FrameMetaData::new(
            i64::from(frame_number),
            RAW_DATASET,
            DataType::Raw8,
            "",
            vec![manager.buffer_size() as u64],
            CompressionType::None,
        );
        let notifier: Arc<dyn ReleaseNotifier> = self.notifier.clone();
        match Frame::shared(manager, buffer_id, frame_number, notifier, meta) {
            Ok(frame) => {
                debug!(frame = frame_number, buffer_id, "Frame ready");
                self.push(Arc::new(frame));
            }
            Err(e) => error!(frame = frame_number, buffer_id, error = %e, "Cannot wrap shared buffer"),
        }
    }

    fn handle_buffer_config(&self, msg: &IpcMessage) {
        let name: String = match msg.get_param("shared_buffer_name") {
            Ok(name) => name,
            Err(e) => {
                warn!(error = %e, "Buffer config notification without a buffer name");
                return;
            }
        };
        if self
            .manager
            .read()
            .as_ref()
            .is_some_and(|m| m.name() == name)
        {
            debug!(name = %name, "Shared buffer already attached");
            return;
        }
        match SharedBufferManager::open(&name) {
            Ok(manager) => {
                info!(
                    name = %name,
                    num_buffers = manager.num_buffers(),
                    buffer_size = manager.buffer_size(),
                    "Attached shared buffer"
                );
                *self.manager.write() = Some(Arc::new(manager));
            }
            Err(e) => error!(name = %name, error = %e, "Failed to attach shared buffer"),
        }
    }
}

/// Receives frames from a frame receiver and pushes them to consumers.
pub struct SharedMemoryController {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl SharedMemoryController {
    /// Connect to the receiver's frame-ready and frame-release endpoints and
    /// start listening.
    pub fn start(ready_endpoint: &str, release_endpoint: &str) -> Result<Self> {
        Self::with_retry_interval(ready_endpoint, release_endpoint, DEFAULT_BUFFER_CONFIG_RETRY)
    }

    /// As [`start`](Self::start), re-requesting the buffer configuration
    /// every `retry` until it arrives.
    pub fn with_retry_interval(
        ready_endpoint: &str,
        release_endpoint: &str,
        retry: Duration,
    ) -> Result<Self> {
        let mut ready = IpcChannel::new(ChannelType::Sub)?;
        ready.connect(ready_endpoint)?;
        ready.subscribe("")?;
        let mut release = IpcChannel::new(ChannelType::Pub)?;
        release.connect(release_endpoint)?;

        let shared = Arc::new(Shared {
            callbacks: RwLock::new(BTreeMap::new()),
            manager: RwLock::new(None),
            notifier: Arc::new(ChannelReleaseNotifier::new(release)),
            frames_received: AtomicU64::new(0),
            running: AtomicBool::new(true),
        });
        info!(
            frame_ready = ready_endpoint,
            frame_release = release_endpoint,
            "Shared memory controller connected"
        );

        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("shared_memory".to_string())
                .spawn(move || listen(&shared, &ready, retry))?
        };
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Push frames to `consumer` under `name`. Registering a name twice is a
    /// no-op; the first consumer stays.
    pub fn register_callback(&self, name: &str, consumer: Arc<dyn FrameCallback>) {
        {
            let mut callbacks = self.shared.callbacks.write();
            if callbacks.contains_key(name) {
                debug!(consumer = name, "Already registered with shared memory controller");
                return;
            }
            callbacks.insert(name.to_string(), Arc::clone(&consumer));
        }
        consumer.confirm_registration(FRAME_RECEIVER);
        debug!(consumer = name, "Registered with shared memory controller");
    }

    /// Stop pushing frames to `name`.
    pub fn remove_callback(&self, name: &str) {
        let removed = self.shared.callbacks.write().remove(name);
        if let Some(consumer) = removed {
            consumer.confirm_removal(FRAME_RECEIVER);
        }
    }

    /// Names of registered consumers.
    #[must_use]
    pub fn callback_names(&self) -> Vec<String> {
        self.shared.callbacks.read().keys().cloned().collect()
    }

    /// True once a shared buffer is attached.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.shared.manager.read().is_some()
    }

    /// Frame ready notifications received.
    #[must_use]
    pub fn frames_received(&self) -> u64 {
        self.shared.frames_received.load(Ordering::Relaxed)
    }

    /// Write `shared_memory/*` status into `reply`.
    pub fn status(&self, reply: &mut IpcMessage) {
        reply.set_param("shared_memory/configured", self.is_configured());
        reply.set_param("shared_memory/frames_received", self.frames_received());
    }

    /// Reset the received frame count.
    pub fn reset_statistics(&self) {
        self.shared.frames_received.store(0, Ordering::Relaxed);
    }

    /// Push an end of acquisition marker to every consumer.
    pub fn inject_eoa(&self) {
        info!("Injecting end of acquisition");
        self.shared.push(Arc::new(Frame::end_of_acquisition()));
    }

    /// Stop listening and join the listener thread.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Shared memory listener panicked");
            }
            info!("Shared memory controller stopped");
        }
    }
}

impl Drop for SharedMemoryController {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for SharedMemoryController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemoryController")
            .field("configured", &self.is_configured())
            .field("callbacks", &self.callback_names())
            .finish_non_exhaustive()
    }
}

fn listen(shared: &Shared, ready: &IpcChannel, retry: Duration) {
    let mut next_request = Instant::now();
    while shared.running.load(Ordering::Acquire) {
        if shared.manager.read().is_none() && Instant::now() >= next_request {
            shared.request_buffer_config();
            next_request = Instant::now() + retry;
        }
        match ready.poll(POLL_TIMEOUT_MS) {
            Ok(true) => match ready.recv() {
                Ok(text) => shared.handle_message(&text),
                Err(e) => warn!(error = %e, "Frame ready receive failed"),
            },
            Ok(false) => {}
            Err(e) => {
                error!(error = %e, "Frame ready poll failed");
                thread::sleep(Duration::from_millis(POLL_TIMEOUT_MS.unsigned_abs()));
            }
        }
    }
}
