//! Frame processor controller.
//!
//! Serves the control channel, loads and wires plugins, and owns the
//! connection to the frame receiver. Configuration arrives as `configure`
//! messages, either over the control channel or directly from the binary.

use crate::error::{ProcessorError, Result};
use crate::frame::FramePtr;
use crate::plugin::{FrameCallback, PluginRunner};
use crate::registry::{PluginEnv, PluginRegistry};
use crate::shared_memory::{SharedMemoryController, FRAME_RECEIVER};
use odin_common::{ChannelType, IpcChannel, IpcMessage, MsgType, MsgVal};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Poll timeout of the control loop.
const POLL_TIMEOUT_MS: i64 = 100;

/// Consumer name of the end-of-chain frame counter.
pub const CONTROLLER: &str = "controller";

/// Cloneable handle that stops a running controller from another thread.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Ask the control loop to exit after its current poll.
    pub fn stop(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Counts frames reaching the end of a chain and stops the controller once
/// a configured number has arrived.
#[derive(Debug)]
struct FrameCounter {
    frames: AtomicU64,
    target: AtomicU64,
    running: Arc<AtomicBool>,
}

impl FrameCallback for FrameCounter {
    fn name(&self) -> &str {
        CONTROLLER
    }

    fn callback(&self, frame: FramePtr) {
        if frame.is_end_of_acquisition() {
            return;
        }
        let frames = self.frames.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(frames, "Frame complete");
        let target = self.target.load(Ordering::Acquire);
        if target > 0 && frames == target {
            info!(frames, "Dataset complete, stopping");
            self.running.store(false, Ordering::Release);
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoadRequest {
    index: String,
    name: String,
    #[serde(default)]
    library: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConnectRequest {
    index: String,
    connection: String,
}

/// Frame processor control loop.
pub struct FrameProcessorController {
    ctrl_channel: IpcChannel,
    ctrl_endpoint: Option<String>,
    registry: PluginRegistry,
    shared_memory: Option<SharedMemoryController>,
    fr_ready_endpoint: Option<String>,
    fr_release_endpoint: Option<String>,
    receiver_consumers: BTreeSet<String>,
    counter: Arc<FrameCounter>,
    running: Arc<AtomicBool>,
    shut_down: bool,
}

impl FrameProcessorController {
    /// Controller with the built-in plugins and a fresh pool registry.
    pub fn new() -> Result<Self> {
        Self::with_registry(PluginRegistry::with_builtins(PluginEnv::default()))
    }

    /// Controller loading plugins from `registry`.
    pub fn with_registry(registry: PluginRegistry) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(false));
        Ok(Self {
            ctrl_channel: IpcChannel::new(ChannelType::Router)?,
            ctrl_endpoint: None,
            registry,
            shared_memory: None,
            fr_ready_endpoint: None,
            fr_release_endpoint: None,
            receiver_consumers: BTreeSet::new(),
            counter: Arc::new(FrameCounter {
                frames: AtomicU64::new(0),
                target: AtomicU64::new(0),
                running: Arc::clone(&running),
            }),
            running,
            shut_down: false,
        })
    }

    /// Handle that stops [`run`](Self::run).
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.running))
    }

    /// Resolved control endpoint, once bound.
    #[must_use]
    pub fn ctrl_endpoint(&self) -> Option<&str> {
        self.ctrl_endpoint.as_deref()
    }

    /// Loaded plugin `index`.
    #[must_use]
    pub fn plugin(&self, index: &str) -> Option<Arc<PluginRunner>> {
        self.registry.get(index)
    }

    /// Indexes of loaded plugins in load order.
    #[must_use]
    pub fn plugin_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// The frame receiver connection, once set up.
    #[must_use]
    pub fn shared_memory(&self) -> Option<&SharedMemoryController> {
        self.shared_memory.as_ref()
    }

    /// Frames counted at the end of chains connected to `controller`.
    #[must_use]
    pub fn frames_processed(&self) -> u64 {
        self.counter.frames.load(Ordering::Acquire)
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Apply a configuration message. Plugin configuration failures nack
    /// `reply` directly; other failures are returned for the caller to nack.
    pub fn configure(&mut self, config: &IpcMessage, reply: &mut IpcMessage) -> Result<()> {
        debug!(config = %config, "Configuration submitted");

        if config.get_param_or("clear_errors", false)? {
            for plugin in self.registry.loaded() {
                plugin.context().clear_errors();
            }
        }
        if config.has_param("frames") {
            let frames: u64 = config.get_param("frames")?;
            self.counter.target.store(frames, Ordering::Release);
            info!(frames, "Dataset size set");
        }
        if config.has_param("ctrl_endpoint") {
            let endpoint: String = config.get_param("ctrl_endpoint")?;
            self.setup_control_interface(&endpoint)?;
        }
        if config.has_param("fr_setup") {
            let ready: String = config.get_param("fr_setup/fr_ready_cnxn")?;
            let release: String = config.get_param("fr_setup/fr_release_cnxn")?;
            self.setup_frame_receiver_interface(&ready, &release)?;
        }
        if config.has_param("plugin") {
            self.configure_plugins(&config.sub_message("plugin")?)?;
        }

        for plugin in self.registry.loaded() {
            if config.params_at(plugin.name()).is_some() {
                let sub = config.sub_message(plugin.name())?;
                plugin.configure(&sub, reply);
            }
        }

        if config.get_param_or("inject_eoa", false)? {
            match &self.shared_memory {
                Some(smc) => smc.inject_eoa(),
                None => warn!("End of acquisition requested without a frame receiver connection"),
            }
        }
        if config.get_param_or("shutdown", false)? {
            info!("Shutdown requested through configuration");
            self.running.store(false, Ordering::Release);
        }
        Ok(())
    }

    fn setup_control_interface(&mut self, endpoint: &str) -> Result<()> {
        if self.ctrl_channel.has_bound_endpoint(endpoint) {
            return Ok(());
        }
        if let Some(previous) = self.ctrl_endpoint.take() {
            self.ctrl_channel.unbind(&previous)?;
        }
        let resolved = self.ctrl_channel.bind(endpoint)?;
        info!(endpoint = %resolved, "Control interface bound");
        self.ctrl_endpoint = Some(resolved);
        Ok(())
    }

    fn setup_frame_receiver_interface(&mut self, ready: &str, release: &str) -> Result<()> {
        if self.fr_ready_endpoint.as_deref() == Some(ready)
            && self.fr_release_endpoint.as_deref() == Some(release)
            && self.shared_memory.is_some()
        {
            return Ok(());
        }
        if let Some(mut previous) = self.shared_memory.take() {
            previous.stop();
        }
        let smc = SharedMemoryController::start(ready, release)?;
        for index in &self.receiver_consumers {
            if let Some(plugin) = self.registry.get(index) {
                smc.register_callback(index, plugin);
            }
        }
        self.shared_memory = Some(smc);
        self.fr_ready_endpoint = Some(ready.to_string());
        self.fr_release_endpoint = Some(release.to_string());
        Ok(())
    }

    fn configure_plugins(&mut self, config: &IpcMessage) -> Result<()> {
        if config.has_param("load") {
            let load: LoadRequest = config.get_param("load")?;
            if let Some(library) = &load.library {
                debug!(library = %library, "Ignoring plugin library, plugins are built in");
            }
            self.registry.load(&load.name, &load.index)?;
        }
        if config.has_param("connect") {
            let connect: ConnectRequest = config.get_param("connect")?;
            self.connect_plugin(&connect.index, &connect.connection)?;
        }
        if config.has_param("disconnect") {
            let disconnect: ConnectRequest = config.get_param("disconnect")?;
            self.disconnect_plugin(&disconnect.index, &disconnect.connection)?;
        }
        Ok(())
    }

    /// Make plugin `index` (or the `controller` counter) a consumer of
    /// `connection` (a plugin index or `frame_receiver`).
    fn connect_plugin(&mut self, index: &str, connection: &str) -> Result<()> {
        let consumer: Arc<dyn FrameCallback> = if index == CONTROLLER {
            Arc::clone(&self.counter) as Arc<dyn FrameCallback>
        } else {
            self.registry
                .get(index)
                .ok_or_else(|| ProcessorError::NoSuchConnection(index.to_string()))?
                as Arc<dyn FrameCallback>
        };

        if connection == FRAME_RECEIVER {
            let smc = self.shared_memory.as_ref().ok_or_else(|| {
                ProcessorError::Config(format!(
                    "Cannot connect {index} to {FRAME_RECEIVER}, {FRAME_RECEIVER} is not configured"
                ))
            })?;
            smc.register_callback(index, consumer);
            self.receiver_consumers.insert(index.to_string());
        } else {
            let producer = self
                .registry
                .get(connection)
                .ok_or_else(|| ProcessorError::NoSuchConnection(connection.to_string()))?;
            producer.register_callback(index, consumer, index == CONTROLLER);
        }
        info!(index, connection, "Plugin connected");
        Ok(())
    }

    fn disconnect_plugin(&mut self, index: &str, connection: &str) -> Result<()> {
        if index != CONTROLLER && self.registry.get(index).is_none() {
            return Err(ProcessorError::NoSuchConnection(index.to_string()));
        }
        if connection == FRAME_RECEIVER {
            if let Some(smc) = &self.shared_memory {
                smc.remove_callback(index);
            }
            self.receiver_consumers.remove(index);
        } else {
            let producer = self
                .registry
                .get(connection)
                .ok_or_else(|| ProcessorError::NoSuchConnection(connection.to_string()))?;
            producer.remove_callback(index);
        }
        info!(index, connection, "Plugin disconnected");
        Ok(())
    }

    // =========================================================================
    // Control loop
    // =========================================================================

    /// Serve the control channel until shutdown, then stop the frame
    /// receiver connection and every plugin.
    pub fn run(&mut self) -> Result<()> {
        self.running.store(true, Ordering::Release);
        info!("Frame processor controller running");

        let result = loop {
            if !self.running.load(Ordering::Acquire) {
                break Ok(());
            }
            match self.ctrl_channel.poll(POLL_TIMEOUT_MS) {
                Ok(true) => self.handle_ctrl_channel(),
                Ok(false) => {}
                Err(e) => break Err(ProcessorError::from(e)),
            }
        };

        self.shutdown();
        result
    }

    /// Stop the frame receiver connection, then the plugins in load order.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.running.store(false, Ordering::Release);
        if let Some(mut smc) = self.shared_memory.take() {
            smc.stop();
        }
        self.registry.stop_all();
        info!(
            frames = self.frames_processed(),
            "Frame processor controller stopped"
        );
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
        let reply = self.handle_request(&request);
        self.reply_to_client(&client, &reply);
    }

    /// Build the reply to one control request.
    pub fn handle_request(&mut self, request: &IpcMessage) -> IpcMessage {
        let mut reply = IpcMessage::reply_to(request, MsgType::Ack);
        if request.msg_type() != MsgType::Cmd {
            reply.set_nack(format!(
                "Illegal command request type: {}",
                request.msg_type()
            ));
            return reply;
        }

        match request.msg_val() {
            MsgVal::Configure => {
                if let Err(e) = self.configure(request, &mut reply) {
                    error!(error = %e, "Configuration failed");
                    reply.set_nack(e.to_string());
                }
            }
            MsgVal::RequestConfiguration => self.request_configuration(&mut reply),
            MsgVal::Status => self.provide_status(&mut reply),
            MsgVal::ResetStatistics => {
                if let Err(e) = self.reset_statistics() {
                    reply.set_nack(e.to_string());
                }
            }
            MsgVal::RequestVersion => self.provide_version(&mut reply),
            MsgVal::RequestCommands => self.request_commands(&mut reply),
            MsgVal::Execute => {
                if let Err(e) = self.execute(request, &mut reply) {
                    reply.set_nack(e.to_string());
                }
            }
            MsgVal::Shutdown => {
                info!("Shutdown requested");
                self.running.store(false, Ordering::Release);
            }
            other => reply.set_nack(format!("Illegal command request value: {other}")),
        }
        reply
    }

    fn reply_to_client(&self, client: &[u8], reply: &IpcMessage) {
        if let Err(e) = self.ctrl_channel.send_to(client, &reply.encode()) {
            warn!(error = %e, "Failed to send control reply");
        }
    }

    // =========================================================================
    // Replies
    // =========================================================================

    fn request_configuration(&self, reply: &mut IpcMessage) {
        if let Some(endpoint) = &self.ctrl_endpoint {
            reply.set_param("ctrl_endpoint", endpoint.clone());
        }
        if let (Some(ready), Some(release)) = (&self.fr_ready_endpoint, &self.fr_release_endpoint) {
            reply.set_param("fr_setup/fr_ready_cnxn", ready.clone());
            reply.set_param("fr_setup/fr_release_cnxn", release.clone());
        }
        reply.set_param("frames", self.counter.target.load(Ordering::Acquire));
        for plugin in self.registry.loaded() {
            plugin.request_configuration(reply);
        }
    }

    fn provide_status(&self, reply: &mut IpcMessage) {
        if let Some(smc) = &self.shared_memory {
            smc.status(reply);
        }
        reply.set_param("plugins/names", self.registry.names());
        let mut errors = Vec::new();
        for plugin in self.registry.loaded() {
            plugin.status(reply);
            errors.extend(plugin.context().errors());
        }
        reply.set_param("error", errors);
        reply.set_param("frames/processed", self.frames_processed());
    }

    fn reset_statistics(&self) -> Result<()> {
        self.counter.frames.store(0, Ordering::Release);
        if let Some(smc) = &self.shared_memory {
            smc.reset_statistics();
        }
        let failed: Vec<String> = self
            .registry
            .loaded()
            .iter()
            .filter(|plugin| !plugin.reset_statistics())
            .map(|plugin| plugin.name().to_string())
            .collect();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(ProcessorError::Config(format!(
                "Failed to reset statistics for {}",
                failed.join(", ")
            )))
        }
    }

    fn provide_version(&self, reply: &mut IpcMessage) {
        odin_common::version().write_to(reply, "version");
        for plugin in self.registry.loaded() {
            plugin
                .version()
                .write_to(reply, &format!("version/{}", plugin.name()));
        }
    }

    fn request_commands(&self, reply: &mut IpcMessage) {
        for plugin in self.registry.loaded() {
            reply.set_param(
                &format!("command/{}/supported", plugin.name()),
                plugin.request_commands(),
            );
        }
    }

    /// Run `<plugin>/command` for every loaded plugin named in the request.
    fn execute(&self, request: &IpcMessage, reply: &mut IpcMessage) -> Result<()> {
        let mut executed = false;
        for plugin in self.registry.loaded() {
            let path = format!("{}/command", plugin.name());
            if request.has_param(&path) {
                let command: String = request.get_param(&path)?;
                info!(plugin = plugin.name(), command = %command, "Executing command");
                plugin.execute(&command, reply)?;
                executed = true;
            }
        }
        if executed {
            Ok(())
        } else {
            Err(ProcessorError::Config(
                "execute request names no loaded plugin".to_string(),
            ))
        }
    }
}

impl Drop for FrameProcessorController {
    fn drop(&mut self) {
        self.shutdown();
    }
}
