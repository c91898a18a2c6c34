//! Plugins shipped with the frame processor.

mod dummy;
mod live_view;
mod offset_adjustment;
mod parameter_adjustment;
mod percival_process;
mod raw_file_writer;
mod sum;

pub use dummy::DummyPlugin;
pub use live_view::{LiveViewPlugin, DEFAULT_LIVE_VIEW_ADDR};
pub use offset_adjustment::OffsetAdjustmentPlugin;
pub use parameter_adjustment::ParameterAdjustmentPlugin;
pub use percival_process::PercivalProcessPlugin;
pub use raw_file_writer::RawFileWriterPlugin;
pub use sum::SumPlugin;
