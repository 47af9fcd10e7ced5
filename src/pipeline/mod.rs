pub mod acquisition;
pub mod buffer;

pub use acquisition::{AcquisitionLoop, AcquisitionSettings, SessionState, SharedState, StepOutcome};
pub use buffer::{BufferStats, FrameBuffer};
