//! Message-oriented IPC channels over ZeroMQ.
//!
//! An [`IpcChannel`] wraps one zmq socket with the bookkeeping the receiver
//! and processor need: resolved bind endpoints, idempotent connects, routed
//! sends for ROUTER sockets and readiness polling. Channels created with
//! [`IpcChannel::new`] share one process-wide context, so `inproc://`
//! endpoints work between any two of them.

use crate::error::{IpcError, IpcResult};
use once_cell::sync::Lazy;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

static CONTEXT: Lazy<zmq::Context> = Lazy::new(zmq::Context::new);

/// The process-wide zmq context used by [`IpcChannel::new`].
#[must_use]
pub fn default_context() -> zmq::Context {
    CONTEXT.clone()
}

/// Socket pattern of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    /// Exclusive pair
    Pair,
    /// Publisher
    Pub,
    /// Subscriber
    Sub,
    /// Asynchronous requester with an identity
    Dealer,
    /// Identity-routed server
    Router,
}

impl ChannelType {
    fn socket_type(self) -> zmq::SocketType {
        match self {
            ChannelType::Pair => zmq::PAIR,
            ChannelType::Pub => zmq::PUB,
            ChannelType::Sub => zmq::SUB,
            ChannelType::Dealer => zmq::DEALER,
            ChannelType::Router => zmq::ROUTER,
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelType::Pair => "PAIR",
            ChannelType::Pub => "PUB",
            ChannelType::Sub => "SUB",
            ChannelType::Dealer => "DEALER",
            ChannelType::Router => "ROUTER",
        };
        f.write_str(name)
    }
}

/// A single zmq socket plus endpoint bookkeeping.
///
/// Not `Sync`: a channel belongs to one thread at a time. Wrap it in a mutex
/// to share it.
pub struct IpcChannel {
    socket: zmq::Socket,
    channel_type: ChannelType,
    /// requested endpoint -> resolved endpoint
    bound: HashMap<String, String>,
    connected: HashSet<String>,
}

impl IpcChannel {
    /// Create a channel on the process-wide context.
    pub fn new(channel_type: ChannelType) -> IpcResult<Self> {
        Self::with_context(&CONTEXT, channel_type)
    }

    /// Create a channel on an explicit context.
    pub fn with_context(context: &zmq::Context, channel_type: ChannelType) -> IpcResult<Self> {
        let socket = context
            .socket(channel_type.socket_type())
            .map_err(|e| IpcError::Socket(e.to_string()))?;
        socket
            .set_linger(0)
            .map_err(|e| IpcError::Socket(e.to_string()))?;

        if channel_type == ChannelType::Dealer {
            let mut rng = rand::thread_rng();
            let identity = format!("{:04X}-{:04X}", rng.gen::<u16>(), rng.gen::<u16>());
            socket
                .set_identity(identity.as_bytes())
                .map_err(|e| IpcError::Socket(e.to_string()))?;
        }

        Ok(Self {
            socket,
            channel_type,
            bound: HashMap::new(),
            connected: HashSet::new(),
        })
    }

    /// Socket pattern of this channel.
    #[must_use]
    pub fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    /// Bind to `endpoint` and return the resolved endpoint, which differs
    /// from the request for wildcard ports such as `tcp://127.0.0.1:*`.
    pub fn bind(&mut self, endpoint: &str) -> IpcResult<String> {
        if self.bound.contains_key(endpoint) {
            return Err(IpcError::AlreadyBound(endpoint.to_string()));
        }
        self.socket.bind(endpoint).map_err(|e| IpcError::Bind {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

        let resolved = match self.socket.get_last_endpoint() {
            Ok(Ok(resolved)) => resolved,
            _ => endpoint.to_string(),
        };
        debug!("{} channel bound to {}", self.channel_type, resolved);
        self.bound.insert(endpoint.to_string(), resolved.clone());
        Ok(resolved)
    }

    /// Unbind from an endpoint given either as requested or as resolved.
    pub fn unbind(&mut self, endpoint: &str) -> IpcResult<()> {
        let requested = self
            .bound
            .iter()
            .find(|(requested, resolved)| *requested == endpoint || *resolved == endpoint)
            .map(|(requested, _)| requested.clone())
            .ok_or_else(|| IpcError::NotBound(endpoint.to_string()))?;

        if let Some(resolved) = self.bound.remove(&requested) {
            self.socket.unbind(&resolved).map_err(|e| IpcError::Bind {
                endpoint: resolved.clone(),
                reason: e.to_string(),
            })?;
            debug!("{} channel unbound from {}", self.channel_type, resolved);
        }
        Ok(())
    }

    /// True when the channel is bound to `endpoint` (requested or resolved).
    #[must_use]
    pub fn has_bound_endpoint(&self, endpoint: &str) -> bool {
        self.bound
            .iter()
            .any(|(requested, resolved)| requested == endpoint || resolved == endpoint)
    }

    /// Resolved endpoints this channel is bound to.
    #[must_use]
    pub fn bound_endpoints(&self) -> Vec<String> {
        self.bound.values().cloned().collect()
    }

    /// Connect to `endpoint`. Connecting twice to the same endpoint is a no-op.
    pub fn connect(&mut self, endpoint: &str) -> IpcResult<()> {
        if self.connected.contains(endpoint) {
            return Ok(());
        }
        self.socket.connect(endpoint).map_err(|e| IpcError::Connect {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        debug!("{} channel connected to {}", self.channel_type, endpoint);
        self.connected.insert(endpoint.to_string());
        Ok(())
    }

    /// Disconnect from `endpoint` if connected.
    pub fn disconnect(&mut self, endpoint: &str) -> IpcResult<()> {
        if self.connected.remove(endpoint) {
            self.socket.disconnect(endpoint).map_err(|e| IpcError::Connect {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Subscribe to messages starting with `topic`; empty means everything.
    pub fn subscribe(&self, topic: &str) -> IpcResult<()> {
        self.socket
            .set_subscribe(topic.as_bytes())
            .map_err(|e| IpcError::Socket(e.to_string()))
    }

    /// Override the socket identity. Must be called before connecting.
    pub fn set_identity(&self, identity: &str) -> IpcResult<()> {
        self.socket
            .set_identity(identity.as_bytes())
            .map_err(|e| IpcError::Socket(e.to_string()))
    }

    /// Current socket identity.
    pub fn identity(&self) -> IpcResult<Vec<u8>> {
        self.socket
            .get_identity()
            .map_err(|e| IpcError::Socket(e.to_string()))
    }

    /// Send a text message. ROUTER channels must use [`send_to`](Self::send_to).
    pub fn send(&self, message: &str) -> IpcResult<()> {
        self.send_bytes(message.as_bytes())
    }

    /// Send a binary message.
    pub fn send_bytes(&self, data: &[u8]) -> IpcResult<()> {
        if self.channel_type == ChannelType::Router {
            return Err(IpcError::Send(
                "ROUTER channels need a peer identity".to_string(),
            ));
        }
        self.socket
            .send(data, 0)
            .map_err(|e| IpcError::Send(e.to_string()))
    }

    /// Send a message to the peer `identity` on a ROUTER channel.
    pub fn send_to(&self, identity: &[u8], message: &str) -> IpcResult<()> {
        self.socket
            .send(identity, zmq::SNDMORE)
            .map_err(|e| IpcError::Send(e.to_string()))?;
        self.socket
            .send(message.as_bytes(), 0)
            .map_err(|e| IpcError::Send(e.to_string()))
    }

    /// Send every part as one multipart message.
    pub fn send_multipart(&self, parts: &[&[u8]]) -> IpcResult<()> {
        self.socket
            .send_multipart(parts.iter().copied(), 0)
            .map_err(|e| IpcError::Send(e.to_string()))
    }

    /// Receive a text message. For multipart messages the last part is the
    /// body and earlier parts are routing envelope.
    pub fn recv(&self) -> IpcResult<String> {
        let body = self.recv_bytes()?;
        String::from_utf8(body).map_err(|e| IpcError::Receive(e.to_string()))
    }

    /// Receive a message along with the sender identity (ROUTER channels).
    pub fn recv_from(&self) -> IpcResult<(Vec<u8>, String)> {
        let mut parts = self.recv_multipart()?;
        if parts.len() < 2 {
            return Err(IpcError::Receive(format!(
                "expected identity and body, received {} part(s)",
                parts.len()
            )));
        }
        let body = parts.pop().unwrap_or_default();
        let identity = parts.swap_remove(0);
        let body = String::from_utf8(body).map_err(|e| IpcError::Receive(e.to_string()))?;
        Ok((identity, body))
    }

    /// Receive a binary message, keeping only the last part.
    pub fn recv_bytes(&self) -> IpcResult<Vec<u8>> {
        let mut parts = self.recv_multipart()?;
        parts
            .pop()
            .ok_or_else(|| IpcError::Receive("empty message".to_string()))
    }

    /// Receive all parts of one message.
    pub fn recv_multipart(&self) -> IpcResult<Vec<Vec<u8>>> {
        self.socket
            .recv_multipart(0)
            .map_err(|e| IpcError::Receive(e.to_string()))
    }

    /// Wait up to `timeout_ms` for a message; `-1` waits forever, `0` returns
    /// immediately. True when a message can be received without blocking.
    pub fn poll(&self, timeout_ms: i64) -> IpcResult<bool> {
        let ready = self
            .socket
            .poll(zmq::POLLIN, timeout_ms)
            .map_err(|e| IpcError::Poll(e.to_string()))?;
        Ok(ready > 0)
    }

    /// Poll item for use with `zmq::poll` across several channels.
    #[must_use]
    pub fn poll_item(&self) -> zmq::PollItem<'_> {
        self.socket.as_poll_item(zmq::POLLIN)
    }
}

impl fmt::Debug for IpcChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcChannel")
            .field("channel_type", &self.channel_type)
            .field("bound", &self.bound)
            .field("connected", &self.connected)
            .finish()
    }
}

/// Poll several channels at once. Returns one readiness flag per channel, in
/// order.
pub fn poll_channels(channels: &[&IpcChannel], timeout_ms: i64) -> IpcResult<Vec<bool>> {
    let mut items: Vec<zmq::PollItem<'_>> = channels.iter().map(|c| c.poll_item()).collect();
    zmq::poll(&mut items, timeout_ms).map_err(|e| IpcError::Poll(e.to_string()))?;
    Ok(items.iter().map(zmq::PollItem::is_readable).collect())
}
