//! Task lifecycle for one conversation.
//!
//! A conversation runs at most one task at a time. Once a task leaves
//! `Running` it is frozen; the next `start` moves it into history and
//! begins a fresh one. Only the last [`HISTORY_LIMIT`] superseded tasks are
//! kept; the full record goes to the task recorder.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

/// Superseded tasks kept per conversation.
pub const HISTORY_LIMIT: usize = 20;

/// Result message recorded when the user stops a running task.
pub const STOPPED_BY_USER: &str = "Stopped by user";

/// Task status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// No task yet.
    #[default]
    Idle,
    /// Agent loop is working on the task.
    Running,
    /// Model reported the task done.
    Completed,
    /// Stopped by the user, the step limit, or a failed finish.
    Aborted,
    /// Unrecoverable error.
    Ended,
}

impl TaskStatus {
    /// Whether the status is terminal.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Ended)
    }
}

/// Time spent in each phase of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTiming {
    pub step: u32,
    pub screenshot_ms: u64,
    pub network_ms: u64,
    pub execution_ms: u64,
}

impl StepTiming {
    pub fn new(step: u32, screenshot: Duration, network: Duration, execution: Duration) -> Self {
        Self {
            step,
            screenshot_ms: screenshot.as_millis() as u64,
            network_ms: network.as_millis() as u64,
            execution_ms: execution.as_millis() as u64,
        }
    }

    pub fn total_ms(&self) -> u64 {
        self.screenshot_ms + self.network_ms + self.execution_ms
    }
}

/// One run of the agent loop for a single instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub conversation_id: String,
    pub instruction: String,
    pub status: TaskStatus,
    pub step_count: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result_message: Option<String>,
    pub step_timings: Vec<StepTiming>,
}

impl Task {
    fn new(conversation_id: &str, instruction: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.to_string(),
            instruction: instruction.to_string(),
            status: TaskStatus::Running,
            step_count: 0,
            started_at: Utc::now(),
            ended_at: None,
            result_message: None,
            step_timings: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == TaskStatus::Running
    }

    /// Wall-clock duration, up to now for a running task.
    pub fn elapsed(&self) -> chrono::Duration {
        self.ended_at.unwrap_or_else(Utc::now) - self.started_at
    }
}

/// What observers of a conversation see.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub task_id: Option<Uuid>,
    pub status: TaskStatus,
    pub step_count: u32,
    pub latest_timing: Option<StepTiming>,
    pub result_message: Option<String>,
}

impl From<&Task> for TaskSnapshot {
    fn from(task: &Task) -> Self {
        Self {
            task_id: Some(task.id),
            status: task.status,
            step_count: task.step_count,
            latest_timing: task.step_timings.last().copied(),
            result_message: task.result_message.clone(),
        }
    }
}

/// Owns the tasks of one conversation and publishes their state.
#[derive(Debug)]
pub struct TaskStateMachine {
    conversation_id: String,
    current: Option<Task>,
    history: VecDeque<Task>,
    updates: watch::Sender<TaskSnapshot>,
}

impl TaskStateMachine {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        let (updates, _) = watch::channel(TaskSnapshot::default());
        Self {
            conversation_id: conversation_id.into(),
            current: None,
            history: VecDeque::new(),
            updates,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Status of the latest task, `Idle` before the first one.
    pub fn status(&self) -> TaskStatus {
        self.current
            .as_ref()
            .map(|task| task.status)
            .unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.status() == TaskStatus::Running
    }

    /// Latest task, running or settled.
    pub fn current(&self) -> Option<&Task> {
        self.current.as_ref()
    }

    /// Superseded tasks, oldest first.
    pub fn history(&self) -> &VecDeque<Task> {
        &self.history
    }

    /// Watch the latest task's status, step count and timing.
    pub fn subscribe(&self) -> watch::Receiver<TaskSnapshot> {
        self.updates.subscribe()
    }

    /// Begin a new task. Rejected while one is running.
    pub fn start(&mut self, instruction: &str) -> bool {
        if self.is_running() {
            tracing::warn!(
                "Conversation {} already has a running task",
                self.conversation_id
            );
            return false;
        }

        if let Some(previous) = self.current.take() {
            if self.history.len() == HISTORY_LIMIT {
                self.history.pop_front();
            }
            self.history.push_back(previous);
        }

        let task = Task::new(&self.conversation_id, instruction);
        tracing::info!("Task {} started: {}", task.id, instruction);
        self.current = Some(task);
        self.publish();
        true
    }

    /// Append the timing of a completed iteration. Steps must arrive in
    /// order starting at 0.
    pub fn record_step(&mut self, timing: StepTiming) -> bool {
        let Some(task) = self.current.as_mut().filter(|task| task.is_running()) else {
            return false;
        };

        if timing.step != task.step_count {
            tracing::warn!(
                "Out-of-order step {} for task {} (expected {})",
                timing.step,
                task.id,
                task.step_count
            );
            return false;
        }

        task.step_timings.push(timing);
        task.step_count += 1;
        tracing::debug!(
            "Task {} step {}: screenshot={}ms network={}ms execution={}ms",
            task.id,
            timing.step,
            timing.screenshot_ms,
            timing.network_ms,
            timing.execution_ms
        );
        self.publish();
        true
    }

    pub fn complete(&mut self, message: impl Into<String>) -> bool {
        self.settle(TaskStatus::Completed, message.into())
    }

    pub fn abort(&mut self, message: impl Into<String>) -> bool {
        self.settle(TaskStatus::Aborted, message.into())
    }

    pub fn end(&mut self, message: impl Into<String>) -> bool {
        self.settle(TaskStatus::Ended, message.into())
    }

    /// User stop. No-op unless a task is running.
    pub fn stop(&mut self) -> bool {
        self.abort(STOPPED_BY_USER)
    }

    fn settle(&mut self, status: TaskStatus, message: String) -> bool {
        let Some(task) = self.current.as_mut().filter(|task| task.is_running()) else {
            return false;
        };

        task.status = status;
        task.ended_at = Some(Utc::now());
        task.result_message = Some(message);
        tracing::info!(
            "Task {} {:?} after {} steps: {}",
            task.id,
            status,
            task.step_count,
            task.result_message.as_deref().unwrap_or_default()
        );
        self.publish();
        true
    }

    fn publish(&self) {
        let snapshot = self
            .current
            .as_ref()
            .map(TaskSnapshot::from)
            .unwrap_or_default();
        self.updates.send_replace(snapshot);
    }
}
