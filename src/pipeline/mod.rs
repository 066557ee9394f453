pub mod fps;
pub mod frame_buffer;
pub mod orchestrator;
pub mod processor;
pub mod supervisor;

pub use fps::{FpsCounter, MAX_FPS};
pub use frame_buffer::{frame_buffer, BufferStats, FrameConsumer, FrameProducer};
pub use orchestrator::{validate, Orchestrator, ShutdownSummary, StreamResources};
pub use processor::FrameProcessor;
pub use supervisor::{StreamReport, StreamSupervisor};
