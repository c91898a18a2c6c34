//! Plugin trait and the stage runner that gives each plugin its own queue and
//! worker thread.
//!
//! # Data Flow
//!
//! ```text
//! producer.push(frame)
//!   ├── blocking consumer:      consumer.callback_blocking(frame)   (inline)
//!   └── non-blocking consumer:  consumer.callback(frame) -> WorkQueue
//!                                        │
//!                               worker thread: plugin.process_frame(frame, ctx)
//!                                        │
//!                                   ctx.push(frame) -> next stage
//! ```

use crate::error::{PluginError, PluginResult};
use crate::frame::FramePtr;
use crate::work_queue::WorkQueue;
use odin_common::{IpcMessage, VersionInfo};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

// =============================================================================
// Traits
// =============================================================================

/// Anything that can receive frames from a producer.
pub trait FrameCallback: Send + Sync {
    /// Name the consumer registers under.
    fn name(&self) -> &str;

    /// Deliver a frame for later processing.
    fn callback(&self, frame: FramePtr);

    /// Deliver a frame and process it on the caller's thread.
    fn callback_blocking(&self, frame: FramePtr) {
        self.callback(frame);
    }

    /// `producer` now pushes frames to this consumer.
    fn confirm_registration(&self, _producer: &str) {}

    /// `producer` no longer pushes frames to this consumer.
    fn confirm_removal(&self, _producer: &str) {}
}

/// User logic of a processing stage.
///
/// Methods take `&self`: a plugin is called from its worker thread and from
/// the controller thread, so mutable state lives behind the plugin's own locks.
pub trait FrameProcessorPlugin: Send + Sync {
    /// Process one frame. Frames that should continue down the chain must be
    /// pushed through `ctx`.
    fn process_frame(&self, frame: FramePtr, ctx: &PluginContext) -> PluginResult<()>;

    /// Called before an end of acquisition marker is passed on.
    fn process_end_of_acquisition(&self, _ctx: &PluginContext) {}

    /// Apply configuration parameters.
    fn configure(&self, _config: &IpcMessage, _reply: &mut IpcMessage) -> PluginResult<()> {
        Ok(())
    }

    /// Write the current configuration under `prefix`.
    fn request_configuration(&self, _prefix: &str, _reply: &mut IpcMessage) {}

    /// Write status under `prefix`.
    fn status(&self, _prefix: &str, _status: &mut IpcMessage) {}

    /// Commands accepted by [`execute`](Self::execute).
    fn request_commands(&self) -> Vec<String> {
        Vec::new()
    }

    /// Execute a named command.
    fn execute(&self, command: &str, _reply: &mut IpcMessage) -> PluginResult<()> {
        Err(PluginError::UnsupportedCommand(command.to_string()))
    }

    /// Reset plugin statistics. Returns false if the plugin could not.
    fn reset_statistics(&self) -> bool {
        true
    }

    /// Version of the plugin.
    fn version(&self) -> VersionInfo {
        odin_common::version()
    }
}

// =============================================================================
// PluginContext
// =============================================================================

#[derive(Default)]
struct Callbacks {
    non_blocking: BTreeMap<String, Arc<dyn FrameCallback>>,
    blocking: BTreeMap<String, Arc<dyn FrameCallback>>,
}

/// Processing time statistics in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessTiming {
    /// Most recent frame
    pub last: u64,
    /// Slowest frame
    pub max: u64,
    /// Mean over all frames since the last reset
    pub mean: u64,
    count: u64,
    total: u64,
}

impl ProcessTiming {
    fn record(&mut self, elapsed: Duration) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.last = us;
        self.max = self.max.max(us);
        self.count += 1;
        self.total = self.total.saturating_add(us);
        self.mean = self.total / self.count;
    }
}

/// The side of a stage a plugin talks to: its consumers, error and warning
/// lists and timing.
pub struct PluginContext {
    name: String,
    callbacks: RwLock<Callbacks>,
    errors: Mutex<Vec<String>>,
    warnings: Mutex<Vec<String>>,
    timing: Mutex<ProcessTiming>,
}

impl PluginContext {
    /// Context for the stage `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            callbacks: RwLock::new(Callbacks::default()),
            errors: Mutex::new(Vec::new()),
            warnings: Mutex::new(Vec::new()),
            timing: Mutex::new(ProcessTiming::default()),
        }
    }

    /// Stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send `frame` to every registered consumer. Blocking consumers run
    /// first, on this thread.
    pub fn push(&self, frame: FramePtr) {
        let (blocking, non_blocking): (Vec<_>, Vec<_>) = {
            let callbacks = self.callbacks.read();
            (
                callbacks.blocking.values().cloned().collect(),
                callbacks.non_blocking.values().cloned().collect(),
            )
        };
        for consumer in blocking {
            consumer.callback_blocking(Arc::clone(&frame));
        }
        for consumer in non_blocking {
            consumer.callback(Arc::clone(&frame));
        }
    }

    /// Send `frame` to the consumer `name` only. Returns false when no such
    /// consumer is registered.
    pub fn push_to(&self, name: &str, frame: FramePtr) -> bool {
        let callbacks = self.callbacks.read();
        if let Some(consumer) = callbacks.blocking.get(name).cloned() {
            drop(callbacks);
            consumer.callback_blocking(frame);
            true
        } else if let Some(consumer) = callbacks.non_blocking.get(name).cloned() {
            drop(callbacks);
            consumer.callback(frame);
            true
        } else {
            warn!(plugin = %self.name, consumer = name, "No consumer registered under this name");
            false
        }
    }

    /// Names of the registered consumers, blocking and non-blocking.
    #[must_use]
    pub fn consumer_names(&self) -> Vec<String> {
        let callbacks = self.callbacks.read();
        callbacks
            .blocking
            .keys()
            .chain(callbacks.non_blocking.keys())
            .cloned()
            .collect()
    }

    /// Record an error, once per distinct message.
    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        let mut errors = self.errors.lock();
        if !errors.contains(&message) {
            error!(plugin = %self.name, "{message}");
            errors.push(message);
        }
    }

    /// Record a warning, once per distinct message.
    pub fn set_warning(&self, message: impl Into<String>) {
        let message = message.into();
        let mut warnings = self.warnings.lock();
        if !warnings.contains(&message) {
            warn!(plugin = %self.name, "{message}");
            warnings.push(message);
        }
    }

    /// Forget recorded errors and warnings.
    pub fn clear_errors(&self) {
        self.errors.lock().clear();
        self.warnings.lock().clear();
    }

    /// Recorded errors.
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    /// Recorded warnings.
    #[must_use]
    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }

    /// Processing time statistics.
    #[must_use]
    pub fn timing(&self) -> ProcessTiming {
        *self.timing.lock()
    }

    fn record_timing(&self, elapsed: Duration) {
        self.timing.lock().record(elapsed);
    }

    fn reset_timing(&self) {
        *self.timing.lock() = ProcessTiming::default();
    }

    /// Insert `consumer` under `name`. Returns false, leaving the existing
    /// registration in place, when `name` is already registered.
    fn register(&self, name: &str, consumer: Arc<dyn FrameCallback>, blocking: bool) -> bool {
        let mut callbacks = self.callbacks.write();
        if callbacks.blocking.contains_key(name) || callbacks.non_blocking.contains_key(name) {
            if callbacks.blocking.contains_key(name) != blocking {
                warn!(
                    plugin = %self.name,
                    consumer = name,
                    blocking,
                    "Consumer already registered with the other blocking mode"
                );
            }
            return false;
        }
        let target = if blocking {
            &mut callbacks.blocking
        } else {
            &mut callbacks.non_blocking
        };
        target.insert(name.to_string(), consumer);
        true
    }

    fn unregister(&self, name: &str) -> Option<Arc<dyn FrameCallback>> {
        let mut callbacks = self.callbacks.write();
        callbacks
            .blocking
            .remove(name)
            .or_else(|| callbacks.non_blocking.remove(name))
    }

    fn unregister_all(&self) -> Vec<Arc<dyn FrameCallback>> {
        let mut callbacks = self.callbacks.write();
        let blocking = std::mem::take(&mut callbacks.blocking);
        let non_blocking = std::mem::take(&mut callbacks.non_blocking);
        blocking.into_values().chain(non_blocking.into_values()).collect()
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("name", &self.name)
            .field("consumers", &self.consumer_names())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// PluginRunner
// =============================================================================

/// A loaded plugin with its queue and worker thread.
pub struct PluginRunner {
    class_name: String,
    plugin: Box<dyn FrameProcessorPlugin>,
    queue: Mutex<Arc<WorkQueue<FramePtr>>>,
    context: PluginContext,
    worker: Mutex<Option<JoinHandle<()>>>,
    producers: Mutex<BTreeSet<String>>,
}

impl PluginRunner {
    /// Wrap `plugin` as the stage `name`. The worker is not started.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        class_name: impl Into<String>,
        plugin: Box<dyn FrameProcessorPlugin>,
    ) -> Arc<Self> {
        Arc::new(Self {
            class_name: class_name.into(),
            plugin,
            queue: Mutex::new(Arc::new(WorkQueue::new())),
            context: PluginContext::new(name),
            worker: Mutex::new(None),
            producers: Mutex::new(BTreeSet::new()),
        })
    }

    /// Stage name (the plugin index).
    #[must_use]
    pub fn name(&self) -> &str {
        self.context.name()
    }

    /// Registered class of the plugin.
    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// The stage's context.
    #[must_use]
    pub fn context(&self) -> &PluginContext {
        &self.context
    }

    /// Spawn the worker thread. Starting a running stage does nothing; a
    /// stopped stage gets a fresh queue.
    pub fn start(self: &Arc<Self>) -> std::io::Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let queue = {
            let mut queue = self.queue.lock();
            if queue.is_closed() {
                *queue = Arc::new(WorkQueue::new());
            }
            Arc::clone(&queue)
        };
        let runner = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("plugin-{}", self.name()))
            .spawn(move || {
                debug!(plugin = runner.name(), "Worker started");
                while let Some(frame) = queue.remove() {
                    runner.process(frame);
                }
                debug!(plugin = runner.name(), "Worker exiting");
            })?;
        *worker = Some(handle);
        info!(plugin = self.name(), class = %self.class_name, "Plugin started");
        Ok(())
    }

    /// Close the queue, let the worker drain it, and join the worker.
    pub fn stop(&self) {
        self.queue.lock().close();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!(plugin = self.name(), "Plugin worker panicked");
            }
            info!(plugin = self.name(), "Plugin stopped");
        }
    }

    /// True while the worker thread is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Frames waiting in the queue.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    fn process(&self, frame: FramePtr) {
        if frame.is_end_of_acquisition() {
            debug!(plugin = self.name(), "End of acquisition");
            self.plugin.process_end_of_acquisition(&self.context);
            self.context.push(frame);
            return;
        }
        let frame_number = frame.frame_number();
        let start = Instant::now();
        let result = self.plugin.process_frame(frame, &self.context);
        self.context.record_timing(start.elapsed());
        if let Err(e) = result {
            self.context
                .set_error(format!("Frame {frame_number} dropped: {e}"));
        }
    }

    // -------------------------------------------------------------------------
    // Connections
    // -------------------------------------------------------------------------

    /// Push frames to `consumer` under `name`. Registering a name twice is a
    /// no-op; the first consumer stays.
    pub fn register_callback(&self, name: &str, consumer: Arc<dyn FrameCallback>, blocking: bool) {
        if !self.context.register(name, Arc::clone(&consumer), blocking) {
            debug!(plugin = self.name(), consumer = name, "Callback already registered");
            return;
        }
        consumer.confirm_registration(self.name());
        debug!(plugin = self.name(), consumer = name, blocking, "Callback registered");
    }

    /// Stop pushing frames to `name`.
    pub fn remove_callback(&self, name: &str) {
        match self.context.unregister(name) {
            Some(consumer) => consumer.confirm_removal(self.name()),
            None => debug!(plugin = self.name(), consumer = name, "No callback to remove"),
        }
    }

    /// Stop pushing frames to every consumer.
    pub fn remove_all_callbacks(&self) {
        for consumer in self.context.unregister_all() {
            consumer.confirm_removal(self.name());
        }
    }

    /// Producers currently pushing to this stage.
    #[must_use]
    pub fn producers(&self) -> Vec<String> {
        self.producers.lock().iter().cloned().collect()
    }

    /// Push `frame` to every consumer of this stage.
    pub fn push(&self, frame: FramePtr) {
        self.context.push(frame);
    }

    /// Push `frame` to one consumer of this stage.
    pub fn push_to(&self, name: &str, frame: FramePtr) -> bool {
        self.context.push_to(name, frame)
    }

    // -------------------------------------------------------------------------
    // Control
    // -------------------------------------------------------------------------

    /// Configure the plugin. Failures nack `reply` and are recorded.
    pub fn configure(&self, config: &IpcMessage, reply: &mut IpcMessage) {
        if config.get_param_or("clear_errors", false).unwrap_or(false) {
            self.context.clear_errors();
        }
        if let Err(e) = self.plugin.configure(config, reply) {
            let message = format!("Configuration of {} failed: {e}", self.name());
            self.context.set_error(message.clone());
            reply.set_nack(message);
        }
    }

    /// Plugin configuration under `<name>/`.
    pub fn request_configuration(&self, reply: &mut IpcMessage) {
        self.plugin
            .request_configuration(&format!("{}/", self.name()), reply);
    }

    /// Plugin status, timing, errors and warnings under `<name>/`.
    pub fn status(&self, status: &mut IpcMessage) {
        let prefix = format!("{}/", self.name());
        self.plugin.status(&prefix, status);

        let timing = self.context.timing();
        status.set_param(&format!("{prefix}timing/last_process"), timing.last);
        status.set_param(&format!("{prefix}timing/max_process"), timing.max);
        status.set_param(&format!("{prefix}timing/mean_process"), timing.mean);
        status.set_param(&format!("{prefix}errors"), self.context.errors());
        status.set_param(&format!("{prefix}warnings"), self.context.warnings());
    }

    /// Reset timing and plugin statistics.
    pub fn reset_statistics(&self) -> bool {
        self.context.reset_timing();
        self.plugin.reset_statistics()
    }

    /// Commands the plugin accepts.
    #[must_use]
    pub fn request_commands(&self) -> Vec<String> {
        self.plugin.request_commands()
    }

    /// Execute a plugin command.
    pub fn execute(&self, command: &str, reply: &mut IpcMessage) -> PluginResult<()> {
        self.plugin.execute(command, reply)
    }

    /// Plugin version.
    #[must_use]
    pub fn version(&self) -> VersionInfo {
        self.plugin.version()
    }
}

impl FrameCallback for PluginRunner {
    fn name(&self) -> &str {
        self.context.name()
    }

    fn callback(&self, frame: FramePtr) {
        let queue = Arc::clone(&self.queue.lock());
        if let Err(rejected) = queue.add(frame) {
            warn!(
                plugin = self.name(),
                frame = rejected.0.frame_number(),
                "Plugin stopped, dropping frame"
            );
        }
    }

    fn callback_blocking(&self, frame: FramePtr) {
        self.process(frame);
    }

    fn confirm_registration(&self, producer: &str) {
        self.producers.lock().insert(producer.to_string());
    }

    fn confirm_removal(&self, producer: &str) {
        self.producers.lock().remove(producer);
    }
}

impl fmt::Debug for PluginRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRunner")
            .field("name", &self.name())
            .field("class_name", &self.class_name)
            .field("queue", &*self.queue.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::meta_data::{CompressionType, DataType, FrameMetaData};
    use odin_common::{MsgType, MsgVal};
    use odin_pool::PoolRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Passes frames on, failing every frame numbered 13.
    struct Forward;

    impl FrameProcessorPlugin for Forward {
        fn process_frame(&self, frame: FramePtr, ctx: &PluginContext) -> PluginResult<()> {
            if frame.frame_number() == 13 {
                return Err(PluginError::Processing("unlucky".to_string()));
            }
            ctx.push(frame);
            Ok(())
        }

        fn configure(&self, config: &IpcMessage, _reply: &mut IpcMessage) -> PluginResult<()> {
            config.get_param_or("gain", 1u64)?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Sink {
        frames: Mutex<Vec<i64>>,
        registered: Mutex<Vec<String>>,
        count: AtomicUsize,
    }

    impl FrameCallback for Sink {
        fn name(&self) -> &str {
            "sink"
        }

        fn callback(&self, frame: FramePtr) {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.frames.lock().push(frame.frame_number());
        }

        fn confirm_registration(&self, producer: &str) {
            self.registered.lock().push(producer.to_string());
        }

        fn confirm_removal(&self, producer: &str) {
            self.registered.lock().retain(|p| p != producer);
        }
    }

    fn frame(pools: &PoolRegistry, number: i64) -> FramePtr {
        let meta = FrameMetaData::new(number, "data", DataType::Raw8, "", vec![1], CompressionType::None);
        Arc::new(Frame::from_bytes(pools, "test", meta, &[0]).unwrap())
    }

    #[test]
    fn test_registration_is_confirmed() {
        let producer = PluginRunner::new("source", "Forward", Box::new(Forward));
        let consumer = PluginRunner::new("next", "Forward", Box::new(Forward));

        producer.register_callback("next", consumer.clone(), false);
        assert_eq!(consumer.producers(), vec!["source".to_string()]);
        assert_eq!(producer.context().consumer_names(), vec!["next".to_string()]);

        producer.remove_callback("next");
        assert!(consumer.producers().is_empty());
        assert!(producer.context().consumer_names().is_empty());
    }

    #[test]
    fn test_duplicate_registration_keeps_first_consumer() {
        let producer = PluginRunner::new("source", "Forward", Box::new(Forward));
        let first = Arc::new(Sink::default());
        let second = Arc::new(Sink::default());
        producer.register_callback("x", first.clone(), false);
        producer.register_callback("x", second.clone(), false);
        producer.register_callback("x", second.clone(), true);
        assert_eq!(producer.context().consumer_names(), vec!["x".to_string()]);
        assert_eq!(*first.registered.lock(), vec!["source".to_string()]);
        assert!(second.registered.lock().is_empty());

        let pools = PoolRegistry::new();
        producer.push(frame(&pools, 1));
        assert_eq!(first.count.load(Ordering::SeqCst), 1);
        assert_eq!(second.count.load(Ordering::SeqCst), 0);

        producer.remove_callback("x");
        assert!(first.registered.lock().is_empty());
    }

    #[test]
    fn test_worker_drains_in_order_and_records_errors() {
        let pools = PoolRegistry::new();
        let runner = PluginRunner::new("forward", "Forward", Box::new(Forward));
        let sink = Arc::new(Sink::default());
        runner.register_callback("sink", sink.clone(), true);
        runner.start().unwrap();

        for number in [1, 13, 2, 3] {
            runner.callback(frame(&pools, number));
        }
        runner.stop();

        assert_eq!(*sink.frames.lock(), vec![1, 2, 3]);
        assert_eq!(runner.context().errors().len(), 1);
        assert!(runner.context().errors()[0].contains("Frame 13"));
        assert!(!runner.is_running());
        assert_eq!(pools.stats("test").used_blocks, 0);
    }

    #[test]
    fn test_end_of_acquisition_is_passed_on() {
        let runner = PluginRunner::new("forward", "Forward", Box::new(Forward));
        let sink = Arc::new(Sink::default());
        runner.register_callback("sink", sink.clone(), true);

        runner.callback_blocking(Arc::new(Frame::end_of_acquisition()));
        assert_eq!(sink.count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_configure_failure_nacks_and_records() {
        let runner = PluginRunner::new("forward", "Forward", Box::new(Forward));
        let mut config = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        config.set_param("gain", "high");
        let mut reply = IpcMessage::reply_to(&config, MsgType::Ack);

        runner.configure(&config, &mut reply);
        assert_eq!(reply.msg_type(), MsgType::Nack);
        assert_eq!(runner.context().errors().len(), 1);

        runner.configure(&config, &mut IpcMessage::reply_to(&config, MsgType::Ack));
        assert_eq!(runner.context().errors().len(), 1);
    }

    #[test]
    fn test_status_reports_timing_and_errors() {
        let pools = PoolRegistry::new();
        let runner = PluginRunner::new("forward", "Forward", Box::new(Forward));
        runner.callback_blocking(frame(&pools, 13));

        let mut status = IpcMessage::new(MsgType::Ack, MsgVal::Status);
        runner.status(&mut status);
        assert!(status.has_param("forward/timing/max_process"));
        assert_eq!(status.get_param::<Vec<String>>("forward/errors").unwrap().len(), 1);

        assert!(runner.reset_statistics());
        assert_eq!(runner.context().timing(), ProcessTiming::default());
    }

    #[test]
    fn test_restart_after_stop_processes_frames() {
        let pools = PoolRegistry::new();
        let runner = PluginRunner::new("forward", "Forward", Box::new(Forward));
        let sink = Arc::new(Sink::default());
        runner.register_callback("sink", sink.clone(), true);

        runner.start().unwrap();
        runner.callback(frame(&pools, 1));
        runner.stop();
        assert!(!runner.is_running());

        runner.start().unwrap();
        assert!(runner.is_running());
        runner.callback(frame(&pools, 2));
        runner.stop();

        assert_eq!(*sink.frames.lock(), vec![1, 2]);
        assert_eq!(pools.stats("test").used_blocks, 0);
    }

    #[test]
    fn test_callback_after_stop_drops_frame() {
        let pools = PoolRegistry::new();
        let runner = PluginRunner::new("forward", "Forward", Box::new(Forward));
        runner.start().unwrap();
        runner.stop();

        runner.callback(frame(&pools, 1));
        assert_eq!(runner.queue_len(), 0);
        assert_eq!(pools.stats("test").used_blocks, 0);
    }
}
