//! Task history recording.

mod recorder;

pub use recorder::{JsonlRecorder, TaskRecorder, TracingRecorder};
