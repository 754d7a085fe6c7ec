pub mod adapter;
pub mod frame;
pub mod synthetic;

pub use adapter::{extract_frame, Delivery, FrameSourceAdapter, NativeFrame, PlaneLayout};
pub use frame::{FrameMetadata, PixelFormat, RawFrame};
pub use synthetic::{SyntheticCamera, SyntheticFrame};
