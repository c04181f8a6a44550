pub mod engine;
pub mod stats;
pub mod transform;

pub use engine::{EngineState, StopHandle, StopReason, StreamConfig, StreamEngine};
pub use stats::{StatisticsCollector, StreamStats};
pub use transform::{BufferOutcome, CaptureTransform, PlaybackTransform, Transform};
