//! Agent module for orchestrating phone automation.

mod agent_loop;
mod collaborators;
mod control;
mod service;

pub use agent_loop::{AgentConfig, AgentLoop};
pub use collaborators::{
    ActionExecutor, CaptureError, DenialChoice, DenialHandler, EndOnDenial, ExecutionError,
    ScreenCapture, Screenshot,
};
pub use control::LoopControl;
pub use service::AgentService;
