//! Shared plumbing for the frame receiver and frame processor.
//!
//! - [`IpcMessage`]: JSON control and notification envelope
//! - [`IpcChannel`]: zmq socket wrapper shared by every control loop
//! - [`SharedBufferManager`]: memory-mapped frame buffers handed between processes
//! - [`percival`]: packet layout and frame header of the reference detector

pub mod error;
pub mod ipc_channel;
pub mod ipc_message;
pub mod percival;
pub mod shared_buffer;

pub use error::{IpcError, IpcResult, ShmError, ShmResult};
pub use ipc_channel::{default_context, poll_channels, ChannelType, IpcChannel};
pub use ipc_message::{IpcMessage, MsgType, MsgVal};
pub use percival::{FrameHeader, FrameState, PacketHeader, PacketLayout, PacketType};
pub use shared_buffer::SharedBufferManager;

/// Release version of the odin-data crates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
    /// Patch version
    pub patch: u32,
    /// `major.minor.patch`
    pub short: String,
    /// Version with build suffix, when one was supplied at build time
    pub full: String,
}

/// Version of this build.
#[must_use]
pub fn version() -> VersionInfo {
    let short = env!("CARGO_PKG_VERSION").to_string();
    let full = match option_env!("ODIN_DATA_BUILD_SUFFIX") {
        Some(suffix) => format!("{short}-{suffix}"),
        None => short.clone(),
    };
    VersionInfo {
        major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        patch: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
        short,
        full,
    }
}

impl VersionInfo {
    /// Write the version under `<prefix>/odin-data/` in `reply`.
    pub fn write_to(&self, reply: &mut IpcMessage, prefix: &str) {
        let base = if prefix.is_empty() {
            "odin-data".to_string()
        } else {
            format!("{prefix}/odin-data")
        };
        reply.set_param(&format!("{base}/major"), self.major);
        reply.set_param(&format!("{base}/minor"), self.minor);
        reply.set_param(&format!("{base}/patch"), self.patch);
        reply.set_param(&format!("{base}/short"), self.short.clone());
        reply.set_param(&format!("{base}/full"), self.full.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_matches_package() {
        let v = version();
        assert_eq!(v.short, format!("{}.{}.{}", v.major, v.minor, v.patch));
        assert!(v.full.starts_with(&v.short));
    }

    #[test]
    fn test_version_written_under_prefix() {
        let mut reply = IpcMessage::new(MsgType::Ack, MsgVal::RequestVersion);
        version().write_to(&mut reply, "version");
        assert!(reply.has_param("version/odin-data/major"));
        assert_eq!(
            reply.get_param::<String>("version/odin-data/short").unwrap(),
            env!("CARGO_PKG_VERSION")
        );
    }
}
