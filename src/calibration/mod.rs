//! Intrinsic mapping and single-shot extrinsic calibration against a planar
//! checkerboard

pub mod detect;
pub mod engine;
pub mod extrinsics;
pub mod intrinsics;
mod plane;
pub mod pose;
pub mod prompt;
pub mod rodrigues;
pub mod storage;
pub mod subpix;
pub mod target;

pub use engine::{CalibrationEngine, ExtrinsicsSource, CONFIRMATION_MESSAGE};
pub use extrinsics::ExtrinsicParameters;
pub use intrinsics::{Distortion, IntrinsicParameters};
pub use pose::PoseEstimate;
pub use prompt::{ChannelPrompt, Confirmation, ConfirmHandle, OperatorPrompt, TerminalPrompt};
pub use storage::CalibrationPaths;
pub use target::CalibrationTarget;
