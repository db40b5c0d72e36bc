//! Interfaces the agent loop drives: screen capture, action execution and
//! the user's answer to a policy denial.

use async_trait::async_trait;
use thiserror::Error;

use crate::actions::{DoAction, TargetApp};

/// Screenshot data from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screenshot {
    /// Base64-encoded PNG image data.
    pub base64_data: String,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Whether the screen could not be captured because it shows protected content.
    pub is_sensitive: bool,
    /// Package in the foreground, when the device reports one.
    pub current_app: Option<String>,
}

/// Screen capture failed in a way the loop cannot work around.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Screen capture failed: {reason}")]
pub struct CaptureError {
    pub reason: String,
}

impl CaptureError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Execution of an action failed. The reason is shown to the user as is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct ExecutionError {
    pub reason: String,
}

impl ExecutionError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Source of screen snapshots.
#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture(&self) -> Result<Screenshot, CaptureError>;
}

/// Applies `do(...)` actions to the device.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// `target` is the resolved app for actions that name one. The loop only
    /// passes targets the access policy allows.
    async fn execute(
        &self,
        action: &DoAction,
        target: Option<&TargetApp>,
    ) -> Result<(), ExecutionError>;
}

/// What to do after an action was blocked by the access policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialChoice {
    /// Abort the task.
    EndTask,
    /// Keep going with the same instruction.
    Continue,
}

/// Asks the user how to proceed when the agent targets a disabled app.
#[async_trait]
pub trait DenialHandler: Send + Sync {
    async fn on_denied(&self, conversation_id: &str, target: &TargetApp) -> DenialChoice;
}

/// Denial handler that always ends the task.
#[derive(Debug, Default, Clone, Copy)]
pub struct EndOnDenial;

#[async_trait]
impl DenialHandler for EndOnDenial {
    async fn on_denied(&self, _conversation_id: &str, _target: &TargetApp) -> DenialChoice {
        DenialChoice::EndTask
    }
}
