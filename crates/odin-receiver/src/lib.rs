//! UDP frame receiver.
//!
//! Packets arrive on one or more UDP ports and are assembled by a
//! [`FrameDecoder`] directly into shared memory buffers. Complete (or timed
//! out) frames are announced with `frame_ready` notifications; processors hand
//! buffers back with `frame_release`.
//!
//! - [`decoder`]: decoder trait, shared bookkeeping and the Percival decoder
//! - [`rx_thread`]: the receive loop that owns the decoder
//! - [`controller`]: the control loop tying channels, buffers and RX thread together
//! - [`config`]: runtime configuration applied by `configure` messages

pub mod config;
pub mod controller;
pub mod decoder;
pub mod error;
pub mod rx_thread;

pub use config::{ConfigChanges, ReceiverConfig};
pub use controller::{FrameReceiverController, StopHandle};
pub use decoder::{
    DecoderCore, DecoderRegistry, FrameDecoder, FrameReceiveState, FrameReadyCallback,
    PercivalDecoder,
};
pub use error::{DecoderError, DecoderResult, ReceiverError, Result};
pub use rx_thread::{RxThread, RxThreadConfig};
