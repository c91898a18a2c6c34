//! Packet receive thread.
//!
//! The RX thread owns the frame decoder. It runs a current-thread tokio
//! runtime on a dedicated OS thread, waiting on datagram readiness across all
//! UDP sockets, and talks to the controller over a DEALER channel connected to
//! the controller's RX endpoint.

use crate::config::ReceiverConfig;
use crate::decoder::FrameDecoder;
use crate::error::{ReceiverError, Result};
use futures::future::select_all;
use odin_common::{ChannelType, IpcChannel, IpcError, IpcMessage, MsgType, MsgVal};
use std::io;
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

/// Largest datagram accepted.
const MAX_DATAGRAM_SIZE: usize = 65_536;

/// Datagrams handled per readiness wakeup before control is serviced again.
const MAX_DATAGRAMS_PER_WAKE: usize = 1024;

/// Shortest buffer monitor period.
const MIN_MONITOR_PERIOD_MS: u64 = 10;

/// Settings the RX thread needs from the receiver configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxThreadConfig {
    /// Controller endpoint the DEALER channel connects to
    pub rx_endpoint: String,
    /// Address the UDP sockets bind to
    pub rx_address: String,
    /// UDP ports, one socket each; 0 picks a free port
    pub rx_ports: Vec<u16>,
    /// Control channel service period
    pub tick_period_ms: u64,
}

impl From<&ReceiverConfig> for RxThreadConfig {
    fn from(config: &ReceiverConfig) -> Self {
        Self {
            rx_endpoint: config.rx_endpoint.clone(),
            rx_address: config.rx_address.clone(),
            rx_ports: config.rx_ports.clone(),
            tick_period_ms: config.tick_period_ms,
        }
    }
}

/// Handle to a running RX thread.
#[derive(Debug)]
pub struct RxThread {
    running: Arc<AtomicBool>,
    local_addrs: Vec<SocketAddr>,
    handle: Option<JoinHandle<()>>,
}

impl RxThread {
    /// Spawn the thread and wait for it to finish initialising.
    ///
    /// Returns the initialisation error if the runtime, sockets or control
    /// channel could not be set up.
    pub fn start(decoder: Box<dyn FrameDecoder>, config: RxThreadConfig) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let (init_tx, init_rx) = std_mpsc::channel();

        let thread_running = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("rx_thread".to_string())
            .spawn(move || run_thread(decoder, config, thread_running, init_tx))?;

        match init_rx.recv() {
            Ok(Ok(local_addrs)) => Ok(Self {
                running,
                local_addrs,
                handle: Some(handle),
            }),
            Ok(Err(reason)) => {
                let _ = handle.join();
                Err(ReceiverError::RxThread(reason))
            }
            Err(_) => {
                let _ = handle.join();
                Err(ReceiverError::RxThread(
                    "thread exited during startup".to_string(),
                ))
            }
        }
    }

    /// Addresses the UDP sockets are bound to.
    #[must_use]
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Whether the receive loop is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the receive loop and join the thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("RX thread panicked");
            }
            info!("RX thread stopped");
        }
    }
}

impl Drop for RxThread {
    fn drop(&mut self) {
        self.stop();
    }
}

type InitResult = std::result::Result<Vec<SocketAddr>, String>;

fn run_thread(
    decoder: Box<dyn FrameDecoder>,
    config: RxThreadConfig,
    running: Arc<AtomicBool>,
    init_tx: std_mpsc::Sender<InitResult>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = init_tx.send(Err(format!("failed to build runtime: {e}")));
            return;
        }
    };

    runtime.block_on(async move {
        let (mut service, sockets) = match RxService::setup(decoder, &config).await {
            Ok(parts) => parts,
            Err(e) => {
                let _ = init_tx.send(Err(e.to_string()));
                return;
            }
        };
        let addrs = sockets
            .iter()
            .filter_map(|s| s.local_addr().ok())
            .collect::<Vec<_>>();
        info!(
            endpoint = %config.rx_endpoint,
            sockets = ?addrs,
            decoder = service.decoder.name(),
            "RX thread started"
        );
        let _ = init_tx.send(Ok(addrs));

        service.run(&sockets, &config, &running).await;
    });
}

// =============================================================================
// Receive service
// =============================================================================

struct RxService {
    decoder: Box<dyn FrameDecoder>,
    channel: IpcChannel,
    ready_rx: mpsc::UnboundedReceiver<(usize, u32)>,
    datagram: Vec<u8>,
}

impl RxService {
    async fn setup(
        mut decoder: Box<dyn FrameDecoder>,
        config: &RxThreadConfig,
    ) -> Result<(Self, Vec<UdpSocket>)> {
        let mut channel = IpcChannel::new(ChannelType::Dealer)?;
        channel.connect(&config.rx_endpoint)?;

        let mut sockets = Vec::with_capacity(config.rx_ports.len());
        for &port in &config.rx_ports {
            sockets.push(bind_udp(&config.rx_address, port)?);
        }

        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        decoder.register_frame_ready_callback(Box::new(move |buffer_id, frame| {
            // The receiver lives as long as the service.
            let _ = ready_tx.send((buffer_id, frame));
        }));

        let service = Self {
            decoder,
            channel,
            ready_rx,
            datagram: vec![0u8; MAX_DATAGRAM_SIZE],
        };

        service.send(&IpcMessage::new(MsgType::Notify, MsgVal::Identity))?;
        if service.decoder.num_empty_buffers() == 0 {
            service.send(&IpcMessage::new(MsgType::Cmd, MsgVal::RequestBufferPrecharge))?;
        }

        Ok((service, sockets))
    }

    async fn run(&mut self, sockets: &[UdpSocket], config: &RxThreadConfig, running: &AtomicBool) {
        let mut tick = tokio::time::interval(Duration::from_millis(config.tick_period_ms.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let monitor_period = (self.decoder.frame_timeout_ms() / 2).max(MIN_MONITOR_PERIOD_MS);
        let mut monitor = tokio::time::interval(Duration::from_millis(monitor_period));
        monitor.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while running.load(Ordering::Acquire) {
            tokio::select! {
                ready = wait_readable(sockets) => match ready {
                    Ok(index) => self.drain_socket(&sockets[index]),
                    Err(e) => warn!(error = %e, "UDP socket readiness failed"),
                },
                _ = tick.tick() => self.service_channel(),
                _ = monitor.tick() => {
                    self.decoder.monitor_buffers();
                    self.flush_ready();
                    let mut status = IpcMessage::new(MsgType::Notify, MsgVal::Status);
                    self.write_status(&mut status);
                    self.send_or_log(&status);
                }
            }
        }
        debug!("RX thread loop exited");
    }

    fn drain_socket(&mut self, socket: &UdpSocket) {
        for _ in 0..MAX_DATAGRAMS_PER_WAKE {
            match socket.try_recv_from(&mut self.datagram) {
                Ok((len, from)) => {
                    let datagram = std::mem::take(&mut self.datagram);
                    self.handle_datagram(&datagram[..len], from);
                    self.datagram = datagram;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "UDP receive failed");
                    break;
                }
            }
        }
        self.flush_ready();
    }

    fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        let header_size = self.decoder.packet_header_size().min(datagram.len());
        let (header, payload) = datagram.split_at(header_size);
        self.decoder.process_packet_header(header, from);

        let target = self.decoder.next_payload_buffer();
        let copied = payload.len().min(target.len());
        if copied < payload.len() {
            warn!(
                received = payload.len(),
                capacity = target.len(),
                "Packet payload larger than its slot, truncating"
            );
        }
        target[..copied].copy_from_slice(&payload[..copied]);
        let state = self.decoder.process_packet(copied);
        trace!(?state, bytes = copied, %from, "Packet processed");
    }

    fn flush_ready(&mut self) {
        while let Ok((buffer_id, frame)) = self.ready_rx.try_recv() {
            let mut ready = IpcMessage::new(MsgType::Notify, MsgVal::FrameReady);
            ready.set_param("frame", frame);
            ready.set_param("buffer_id", buffer_id);
            self.send_or_log(&ready);
        }
    }

    fn service_channel(&mut self) {
        loop {
            match self.channel.poll(0) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!(error = %e, "RX control channel poll failed");
                    break;
                }
            }
            let text = match self.channel.recv() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "RX control channel receive failed");
                    break;
                }
            };
            let reply = match IpcMessage::parse(&text) {
                Ok(msg) => self.handle_control_message(&msg),
                Err(e) => {
                    let mut nack = IpcMessage::new(MsgType::Nack, MsgVal::Status);
                    nack.set_nack(e.to_string());
                    Some(nack)
                }
            };
            if let Some(reply) = reply {
                self.send_or_log(&reply);
            }
        }
        self.flush_ready();
    }

    /// Handle one control message; returns the reply to send, if any.
    fn handle_control_message(&mut self, msg: &IpcMessage) -> Option<IpcMessage> {
        match (msg.msg_type(), msg.msg_val()) {
            (MsgType::Cmd, MsgVal::Status) => {
                let mut reply = IpcMessage::reply_to(msg, MsgType::Ack);
                reply.merge_params("", msg.params());
                self.write_status(&mut reply);
                Some(reply)
            }
            (MsgType::Notify, MsgVal::BufferPrecharge) => {
                match (
                    msg.get_param::<usize>("start_buffer_id"),
                    msg.get_param::<usize>("num_buffers"),
                ) {
                    (Ok(start), Ok(num)) => {
                        let limit = self.decoder.core().num_buffers();
                        let end = match start.checked_add(num) {
                            Some(end) if end <= limit => end,
                            _ => {
                                warn!(start, num, limit, "Precharge range exceeds the shared buffer region");
                                let mut reply = IpcMessage::reply_to(msg, MsgType::Nack);
                                reply.set_nack(format!(
                                    "Precharge of {num} buffers from {start} exceeds {limit} buffers"
                                ));
                                return Some(reply);
                            }
                        };
                        let accepted = (start..end)
                            .filter(|&buffer_id| self.decoder.push_empty_buffer(buffer_id))
                            .count();
                        debug!(start, num, accepted, "Buffers precharged");
                        None
                    }
                    (Err(e), _) | (_, Err(e)) => Some(nack(msg, &e)),
                }
            }
            (MsgType::Notify, MsgVal::FrameRelease) => match msg.get_param::<usize>("buffer_id") {
                Ok(buffer_id) => {
                    if !self.decoder.push_empty_buffer(buffer_id) {
                        warn!(
                            buffer_id,
                            frame = msg.get_param::<u32>("frame").ok(),
                            "Ignoring release of a buffer the decoder already owns"
                        );
                    }
                    None
                }
                Err(e) => Some(nack(msg, &e)),
            },
            (MsgType::Ack, MsgVal::Identity) => None,
            (MsgType::Cmd, MsgVal::RequestCommands) => {
                let mut reply = IpcMessage::reply_to(msg, MsgType::Ack);
                reply.set_param("decoder/supported", self.decoder.request_commands());
                Some(reply)
            }
            (MsgType::Cmd, MsgVal::Execute) => {
                let mut reply = IpcMessage::reply_to(msg, MsgType::Ack);
                match msg.get_param::<String>("command") {
                    Ok(command) => {
                        if let Err(e) = self.decoder.execute(&command, &mut reply) {
                            reply.set_nack(e.to_string());
                        }
                    }
                    Err(e) => reply.set_nack(e.to_string()),
                }
                Some(reply)
            }
            (MsgType::Cmd, MsgVal::ResetStatistics) => {
                self.decoder.reset_statistics();
                Some(IpcMessage::reply_to(msg, MsgType::Ack))
            }
            _ => {
                let mut reply = IpcMessage::reply_to(msg, MsgType::Nack);
                reply.set_nack(format!("Unexpected message: {}", msg.encode()));
                Some(reply)
            }
        }
    }

    fn write_status(&self, status: &mut IpcMessage) {
        self.decoder.core().write_status("rx_thread/", status);
        self.decoder.get_status("decoder/", status);
    }

    fn send(&self, msg: &IpcMessage) -> std::result::Result<(), IpcError> {
        self.channel.send(&msg.encode())
    }

    fn send_or_log(&self, msg: &IpcMessage) {
        if let Err(e) = self.send(msg) {
            warn!(error = %e, msg_val = %msg.msg_val(), "Failed to send RX thread message");
        }
    }
}

fn nack(request: &IpcMessage, error: &IpcError) -> IpcMessage {
    let mut reply = IpcMessage::reply_to(request, MsgType::Nack);
    reply.set_nack(error.to_string());
    reply
}

fn bind_udp(address: &str, port: u16) -> Result<UdpSocket> {
    let socket = StdUdpSocket::bind((address, port)).map_err(|e| {
        ReceiverError::RxThread(format!("failed to bind UDP socket {address}:{port}: {e}"))
    })?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket)?)
}

/// Resolves with the index of the first readable socket. Never resolves when
/// there are no sockets.
async fn wait_readable(sockets: &[UdpSocket]) -> io::Result<usize> {
    if sockets.is_empty() {
        return futures::future::pending().await;
    }
    let (result, index, _) = select_all(sockets.iter().map(|s| Box::pin(s.readable()))).await;
    result.map(|()| index)
}
