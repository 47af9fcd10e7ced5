pub mod decode;
pub mod frame;
pub mod source;
pub mod synthetic;

pub use frame::{Frame, FrameMetadata, PixelFormat, Resolution, StreamKind};
pub use source::{FramePair, FrameSource, SourceIntrinsics, StreamHandle};
pub use synthetic::{SyntheticControl, SyntheticScene, SyntheticSource};
