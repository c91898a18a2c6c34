//! Frame receiver controller.
//!
//! Owns the control, RX, frame-ready and frame-release channels and polls
//! them from a single thread. Configuration builds the decoder, creates the
//! shared buffer region and starts the [`RxThread`]; afterwards the controller
//! relays buffer ownership between the RX thread and downstream processors.

use crate::config::{ConfigChanges, ReceiverConfig};
use crate::decoder::{DecoderRegistry, FrameDecoder};
use crate::error::{ReceiverError, Result};
use crate::rx_thread::{RxThread, RxThreadConfig};
use odin_common::{
    poll_channels, ChannelType, IpcChannel, IpcMessage, IpcResult, MsgType, MsgVal,
    SharedBufferManager,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Poll timeout of the control loop.
const POLL_TIMEOUT_MS: i64 = 100;

/// Cloneable handle that stops a running controller from another thread.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Ask the control loop to exit after its current poll.
    pub fn stop(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A command relayed to the RX thread, waiting for its reply.
#[derive(Debug)]
struct PendingReply {
    client: Vec<u8>,
    client_id: u32,
}

/// Frame receiver control loop.
pub struct FrameReceiverController {
    config: ReceiverConfig,
    decoders: DecoderRegistry,

    ctrl_channel: IpcChannel,
    rx_channel: IpcChannel,
    frame_ready_channel: IpcChannel,
    frame_release_channel: IpcChannel,

    buffer_manager: Option<Arc<SharedBufferManager>>,
    rx_thread: Option<RxThread>,
    rx_identity: Option<Vec<u8>>,
    rx_status: Map<String, Value>,

    pending_replies: HashMap<u32, PendingReply>,
    next_relay_id: u32,
    deferred_buffer_config: Option<Instant>,

    ipc_configured: bool,
    decoder_configured: bool,
    buffer_manager_configured: bool,
    rx_thread_configured: bool,

    frames_received: u64,
    frames_released: u64,
    running: Arc<AtomicBool>,
}

impl FrameReceiverController {
    /// Controller with the built-in decoders. Nothing is bound until the
    /// first [`configure`](Self::configure).
    pub fn new() -> Result<Self> {
        Self::with_decoders(DecoderRegistry::with_builtins())
    }

    /// Controller with an explicit decoder registry.
    pub fn with_decoders(decoders: DecoderRegistry) -> Result<Self> {
        let frame_release_channel = IpcChannel::new(ChannelType::Sub)?;
        frame_release_channel.subscribe("")?;
        Ok(Self {
            config: ReceiverConfig::default(),
            decoders,
            ctrl_channel: IpcChannel::new(ChannelType::Router)?,
            rx_channel: IpcChannel::new(ChannelType::Router)?,
            frame_ready_channel: IpcChannel::new(ChannelType::Pub)?,
            frame_release_channel,
            buffer_manager: None,
            rx_thread: None,
            rx_identity: None,
            rx_status: Map::new(),
            pending_replies: HashMap::new(),
            next_relay_id: 1,
            deferred_buffer_config: None,
            ipc_configured: false,
            decoder_configured: false,
            buffer_manager_configured: false,
            rx_thread_configured: false,
            frames_received: 0,
            frames_released: 0,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Handle that stops [`run`](Self::run).
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.running))
    }

    /// Addresses the RX thread's UDP sockets are bound to.
    #[must_use]
    pub fn rx_addrs(&self) -> Vec<std::net::SocketAddr> {
        self.rx_thread
            .as_ref()
            .map(|rx| rx.local_addrs().to_vec())
            .unwrap_or_default()
    }

    /// True once every part has been configured.
    #[must_use]
    pub fn configuration_complete(&self) -> bool {
        self.ipc_configured
            && self.decoder_configured
            && self.buffer_manager_configured
            && self.rx_thread_configured
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Apply a configuration message, writing `configured/*` flags into
    /// `reply`. On error the reply is left for the caller to nack.
    pub fn configure(&mut self, msg: &IpcMessage, reply: &mut IpcMessage) -> Result<()> {
        let result = self.apply_configuration(msg);
        reply.set_param("configured/ipc", self.ipc_configured);
        reply.set_param("configured/decoder", self.decoder_configured);
        reply.set_param("configured/buffer_manager", self.buffer_manager_configured);
        reply.set_param("configured/rx_thread", self.rx_thread_configured);
        result
    }

    fn apply_configuration(&mut self, msg: &IpcMessage) -> Result<()> {
        let previous = self.config.clone();
        let mut changes = self.config.apply(msg)?;
        if !self.ipc_configured {
            changes.ipc = true;
        }
        if !self.decoder_configured {
            changes.decoder = true;
        }
        if !self.buffer_manager_configured {
            changes.buffer_manager = true;
        }
        if !self.rx_thread_configured {
            changes.rx_thread = true;
        }
        debug!(?changes, "Applying receiver configuration");

        // Everything below the IPC layer lives in, or is shared with, the RX
        // thread, so any change restarts it.
        let restart_rx = changes.decoder
            || changes.buffer_manager
            || changes.rx_thread
            || previous.rx_endpoint != self.config.rx_endpoint;
        if restart_rx {
            self.stop_rx_thread();
        }

        if changes.ipc {
            self.ipc_configured = false;
            self.setup_ipc()?;
            self.ipc_configured = true;
        }

        if restart_rx {
            self.start_receiving(changes)?;
        }
        Ok(())
    }

    fn setup_ipc(&mut self) -> Result<()> {
        rebind(&mut self.ctrl_channel, &self.config.ctrl_endpoint)?;
        rebind(&mut self.rx_channel, &self.config.rx_endpoint)?;
        rebind(&mut self.frame_ready_channel, &self.config.frame_ready_endpoint)?;
        rebind(&mut self.frame_release_channel, &self.config.frame_release_endpoint)?;
        info!(
            ctrl = %self.config.ctrl_endpoint,
            rx = %self.config.rx_endpoint,
            frame_ready = %self.config.frame_ready_endpoint,
            frame_release = %self.config.frame_release_endpoint,
            "Control interfaces bound"
        );
        Ok(())
    }

    fn start_receiving(&mut self, changes: ConfigChanges) -> Result<()> {
        self.decoder_configured = false;
        let mut decoder = self.build_decoder()?;
        self.decoder_configured = true;

        if changes.buffer_manager || self.buffer_manager.is_none() {
            self.buffer_manager_configured = false;
            self.buffer_manager = None;
            let manager = SharedBufferManager::create(
                &self.config.shared_buffer_name,
                self.config.max_buffer_mem,
                decoder.frame_buffer_size(),
            )?;
            info!(
                name = %self.config.shared_buffer_name,
                num_buffers = manager.num_buffers(),
                buffer_size = manager.buffer_size(),
                "Shared buffer manager created"
            );
            self.buffer_manager = Some(Arc::new(manager));
        }
        let manager = self
            .buffer_manager
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| ReceiverError::Config("no shared buffer manager".to_string()))?;
        decoder.register_buffer_manager(manager)?;
        self.buffer_manager_configured = true;

        self.rx_thread_configured = false;
        self.rx_identity = None;
        self.rx_status.clear();
        self.rx_thread = Some(RxThread::start(decoder, RxThreadConfig::from(&self.config))?);
        self.rx_thread_configured = true;

        self.deferred_buffer_config = Some(
            Instant::now() + Duration::from_millis(self.config.deferred_action_delay_ms),
        );
        Ok(())
    }

    fn build_decoder(&self) -> Result<Box<dyn FrameDecoder>> {
        let mut decoder = self.decoders.create(&self.config.decoder_type)?;
        decoder.init(&self.config.decoder_message())?;
        info!(decoder = decoder.name(), "Frame decoder configured");
        Ok(decoder)
    }

    fn stop_rx_thread(&mut self) {
        if let Some(mut rx) = self.rx_thread.take() {
            rx.stop();
        }
        self.rx_thread_configured = false;
        self.rx_identity = None;
    }

    // =========================================================================
    // Control loop
    // =========================================================================

    /// Poll the channels until stopped by `shutdown`, a [`StopHandle`] or the
    /// frame count being reached. Stops the RX thread on exit.
    pub fn run(&mut self) -> Result<()> {
        self.running.store(true, Ordering::Release);
        info!("Frame receiver controller running");

        let result = loop {
            if !self.running.load(Ordering::Acquire) {
                break Ok(());
            }
            let ready = match poll_channels(
                &[&self.ctrl_channel, &self.rx_channel, &self.frame_release_channel],
                POLL_TIMEOUT_MS,
            ) {
                Ok(ready) => ready,
                Err(e) => break Err(ReceiverError::from(e)),
            };
            if ready[0] {
                self.handle_ctrl_channel();
            }
            if ready[1] {
                self.handle_rx_channel();
            }
            if ready[2] {
                self.handle_frame_release_channel();
            }
            self.run_deferred_actions();
        };

        self.stop_rx_thread();
        info!(
            frames_received = self.frames_received,
            frames_released = self.frames_released,
            "Frame receiver controller stopped"
        );
        result
    }

    fn run_deferred_actions(&mut self) {
        if self
            .deferred_buffer_config
            .is_some_and(|due| Instant::now() >= due)
        {
            self.deferred_buffer_config = None;
            self.notify_buffer_config();
        }
    }

    fn handle_ctrl_channel(&mut self) {
        let (client, text) = match self.ctrl_channel.recv_from() {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "Control channel receive failed");
                return;
            }
        };
        let request = match IpcMessage::parse(&text) {
            Ok(request) => request,
            Err(e) => {
                let mut nack = IpcMessage::new(MsgType::Nack, MsgVal::Reset);
                nack.set_nack(format!("Error parsing control message: {e}"));
                self.reply_to_client(&client, &nack);
                return;
            }
        };
        debug!(msg_val = %request.msg_val(), id = request.id(), "Control message received");

        if request.msg_type() != MsgType::Cmd {
            let mut nack = IpcMessage::reply_to(&request, MsgType::Nack);
            nack.set_nack(format!(
                "Illegal command request type: {}",
                request.msg_type()
            ));
            self.reply_to_client(&client, &nack);
            return;
        }

        let mut reply = IpcMessage::reply_to(&request, MsgType::Ack);
        match request.msg_val() {
            MsgVal::Configure => {
                if let Err(e) = self.configure(&request, &mut reply) {
                    error!(error = %e, "Configuration failed");
                    reply.set_nack(e.to_string());
                }
            }
            MsgVal::RequestConfiguration => self.request_configuration(&mut reply),
            MsgVal::Status => self.get_status(&mut reply),
            MsgVal::RequestVersion => odin_common::version().write_to(&mut reply, "version"),
            MsgVal::ResetStatistics => {
                self.frames_received = 0;
                self.frames_released = 0;
                let forward = IpcMessage::new(MsgType::Cmd, MsgVal::ResetStatistics);
                if let Err(e) = self.send_to_rx(&forward) {
                    warn!(error = %e, "Could not forward statistics reset to RX thread");
                }
            }
            MsgVal::RequestCommands | MsgVal::Execute => {
                match self.relay_to_rx(&request, &client) {
                    Ok(()) => return,
                    Err(e) => reply.set_nack(e.to_string()),
                }
            }
            MsgVal::Shutdown => {
                info!("Shutdown requested");
                self.running.store(false, Ordering::Release);
            }
            other => {
                reply.set_nack(format!("Illegal command request value: {other}"));
            }
        }
        self.reply_to_client(&client, &reply);
    }

    fn handle_rx_channel(&mut self) {
        let (identity, text) = match self.rx_channel.recv_from() {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "RX channel receive failed");
                return;
            }
        };
        let msg = match IpcMessage::parse(&text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Malformed message from RX thread");
                return;
            }
        };

        match (msg.msg_type(), msg.msg_val()) {
            (MsgType::Notify, MsgVal::Identity) => {
                info!(identity = %String::from_utf8_lossy(&identity), "RX thread identified");
                self.rx_identity = Some(identity);
                let ack = IpcMessage::reply_to(&msg, MsgType::Ack);
                if let Err(e) = self.send_to_rx(&ack) {
                    warn!(error = %e, "Failed to acknowledge RX thread identity");
                }
            }
            (MsgType::Cmd, MsgVal::RequestBufferPrecharge) => self.precharge_buffers(),
            (MsgType::Notify, MsgVal::FrameReady) => {
                self.frames_received += 1;
                if let Err(e) = self.frame_ready_channel.send(&msg.encode()) {
                    warn!(error = %e, "Failed to publish frame ready");
                }
            }
            (MsgType::Notify, MsgVal::Status) => {
                self.rx_status = msg.params().clone();
            }
            (MsgType::Ack | MsgType::Nack, _) => {
                if let Some(pending) = self.pending_replies.remove(&msg.id()) {
                    let mut reply = msg;
                    reply.set_id(pending.client_id);
                    self.reply_to_client(&pending.client, &reply);
                } else {
                    debug!(msg_val = %msg.msg_val(), "Unsolicited reply from RX thread");
                }
            }
            _ => warn!(message = %msg, "Unexpected message from RX thread"),
        }
    }

    fn handle_frame_release_channel(&mut self) {
        let text = match self.frame_release_channel.recv() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Frame release channel receive failed");
                return;
            }
        };
        let msg = match IpcMessage::parse(&text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Malformed frame release message");
                return;
            }
        };

        match (msg.msg_type(), msg.msg_val()) {
            (MsgType::Notify, MsgVal::FrameRelease) => {
                if let Err(e) = self.send_to_rx(&msg) {
                    warn!(error = %e, "Failed to return released buffer to RX thread");
                }
                self.frames_released += 1;
                if self.config.frame_count > 0 && self.frames_released >= self.config.frame_count {
                    info!(
                        frames = self.frames_released,
                        "Specified number of frames released, stopping"
                    );
                    self.running.store(false, Ordering::Release);
                }
            }
            (MsgType::Cmd, MsgVal::RequestBufferConfig) => self.notify_buffer_config(),
            _ => warn!(message = %msg, "Unexpected message on frame release channel"),
        }
    }

    // =========================================================================
    // Replies and notifications
    // =========================================================================

    fn request_configuration(&self, reply: &mut IpcMessage) {
        self.config.write_to(reply);
        reply.merge_params("decoder_config", &self.config.decoder_config);
    }

    fn get_status(&self, reply: &mut IpcMessage) {
        reply.set_param("status/ipc_configured", self.ipc_configured);
        reply.set_param("status/decoder_configured", self.decoder_configured);
        reply.set_param("status/buffer_manager_configured", self.buffer_manager_configured);
        reply.set_param("status/rx_thread_configured", self.rx_thread_configured);
        reply.set_param("status/configuration_complete", self.configuration_complete());

        let snapshot = |key: &str| -> u64 {
            self.rx_status
                .get("rx_thread")
                .and_then(|v| v.get(key))
                .and_then(Value::as_u64)
                .unwrap_or(0)
        };
        let total = self.buffer_manager.as_ref().map_or(0, |m| m.num_buffers());
        reply.set_param("buffers/total", total);
        reply.set_param("buffers/empty", snapshot("empty_buffers"));
        reply.set_param("buffers/mapped", snapshot("mapped_buffers"));

        reply.set_param("frames/timedout", snapshot("frames_timedout"));
        reply.set_param("frames/received", self.frames_received);
        reply.set_param("frames/released", self.frames_released);
        reply.set_param("frames/dropped", snapshot("frames_dropped"));

        if let Some(Value::Object(decoder)) = self.rx_status.get("decoder") {
            reply.merge_params("decoder", decoder);
        }
    }

    fn precharge_buffers(&mut self) {
        let Some(manager) = self.buffer_manager.as_ref() else {
            warn!("Buffer precharge requested with no shared buffer manager");
            return;
        };
        let mut precharge = IpcMessage::new(MsgType::Notify, MsgVal::BufferPrecharge);
        precharge.set_param("start_buffer_id", 0u64);
        precharge.set_param("num_buffers", manager.num_buffers());
        info!(num_buffers = manager.num_buffers(), "Precharging RX thread with empty buffers");
        if let Err(e) = self.send_to_rx(&precharge) {
            warn!(error = %e, "Failed to precharge buffers");
        }
    }

    fn notify_buffer_config(&self) {
        if !self.buffer_manager_configured {
            debug!("Buffer configuration requested before the buffer manager exists");
            return;
        }
        let mut notify = IpcMessage::new(MsgType::Notify, MsgVal::BufferConfig);
        notify.set_param("shared_buffer_name", self.config.shared_buffer_name.clone());
        debug!(name = %self.config.shared_buffer_name, "Publishing buffer configuration");
        if let Err(e) = self.frame_ready_channel.send(&notify.encode()) {
            warn!(error = %e, "Failed to publish buffer configuration");
        }
    }

    fn relay_to_rx(&mut self, request: &IpcMessage, client: &[u8]) -> Result<()> {
        let relay_id = self.next_relay_id;
        self.next_relay_id = self.next_relay_id.wrapping_add(1).max(1);

        let mut forward = request.clone();
        forward.set_id(relay_id);
        self.send_to_rx(&forward)?;
        self.pending_replies.insert(
            relay_id,
            PendingReply {
                client: client.to_vec(),
                client_id: request.id(),
            },
        );
        Ok(())
    }

    fn send_to_rx(&self, msg: &IpcMessage) -> Result<()> {
        let identity = self
            .rx_identity
            .as_deref()
            .ok_or_else(|| ReceiverError::RxThread("RX thread has not identified".to_string()))?;
        self.rx_channel.send_to(identity, &msg.encode())?;
        Ok(())
    }

    fn reply_to_client(&self, client: &[u8], reply: &IpcMessage) {
        if let Err(e) = self.ctrl_channel.send_to(client, &reply.encode()) {
            warn!(error = %e, "Failed to send control reply");
        }
    }
}

impl Drop for FrameReceiverController {
    fn drop(&mut self) {
        self.stop_rx_thread();
    }
}

/// Bind `channel` to `endpoint`, first unbinding any other endpoint.
fn rebind(channel: &mut IpcChannel, endpoint: &str) -> IpcResult<()> {
    if channel.has_bound_endpoint(endpoint) {
        return Ok(());
    }
    for old in channel.bound_endpoints() {
        channel.unbind(&old)?;
    }
    channel.bind(endpoint)?;
    Ok(())
}
