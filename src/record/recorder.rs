//! Recorders that persist task progress.
//!
//! Recording is fire-and-forget for the agent loop: implementations swallow
//! and log their own failures.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::config::AppSettings;
use crate::task::{StepTiming, Task, TaskStatus};

/// Sink for task progress.
pub trait TaskRecorder: Send + Sync {
    fn append_step(&self, task: &Task, timing: &StepTiming);

    fn update_status(&self, task: &Task, status: TaskStatus, result_message: Option<&str>);
}

/// Recorder that only emits tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecorder;

impl TaskRecorder for TracingRecorder {
    fn append_step(&self, task: &Task, timing: &StepTiming) {
        tracing::info!(
            task_id = %task.id,
            step = timing.step,
            screenshot_ms = timing.screenshot_ms,
            network_ms = timing.network_ms,
            execution_ms = timing.execution_ms,
            "step recorded"
        );
    }

    fn update_status(&self, task: &Task, status: TaskStatus, result_message: Option<&str>) {
        tracing::info!(
            task_id = %task.id,
            status = ?status,
            result = result_message.unwrap_or_default(),
            "task status changed"
        );
    }
}

#[derive(Debug, Serialize)]
struct RecordEntry<'a> {
    timestamp: DateTime<Local>,
    task_id: Uuid,
    conversation_id: &'a str,
    #[serde(flatten)]
    event: RecordEvent<'a>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum RecordEvent<'a> {
    Step {
        #[serde(flatten)]
        timing: &'a StepTiming,
    },
    Status {
        status: TaskStatus,
        step_count: u32,
        result_message: Option<&'a str>,
    },
}

/// Recorder that appends one JSON object per event to a file.
#[derive(Debug)]
pub struct JsonlRecorder {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// `tasks.jsonl` in the application logs directory.
    pub fn default_path() -> Option<PathBuf> {
        AppSettings::logs_dir().map(|dir| dir.join("tasks.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, task: &Task, event: RecordEvent<'_>) {
        let entry = RecordEntry {
            timestamp: Local::now(),
            task_id: task.id,
            conversation_id: &task.conversation_id,
            event,
        };

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.append_line(&entry) {
            tracing::warn!("Failed to record task event to {}: {}", self.path.display(), e);
        }
    }

    fn append_line(&self, entry: &RecordEntry<'_>) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let line = serde_json::to_string(entry)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)
    }

    /// Read back every recorded event.
    pub fn read_entries(path: &Path) -> std::io::Result<Vec<Value>> {
        let reader = BufReader::new(File::open(path)?);
        Ok(reader
            .lines()
            .map_while(Result::ok)
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect())
    }
}

impl TaskRecorder for JsonlRecorder {
    fn append_step(&self, task: &Task, timing: &StepTiming) {
        self.write(task, RecordEvent::Step { timing });
    }

    fn update_status(&self, task: &Task, status: TaskStatus, result_message: Option<&str>) {
        self.write(
            task,
            RecordEvent::Status {
                status,
                step_count: task.step_count,
                result_message,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStateMachine;
    use std::time::Duration;

    #[test]
    fn test_jsonl_recorder_appends_events() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = JsonlRecorder::new(dir.path().join("logs").join("tasks.jsonl"));

        let mut machine = TaskStateMachine::new("conv-1");
        machine.start("open settings");
        let timing = StepTiming::new(
            0,
            Duration::from_millis(5),
            Duration::from_millis(50),
            Duration::from_millis(7),
        );
        machine.record_step(timing);
        let task = machine.current().unwrap().clone();

        recorder.append_step(&task, &timing);
        recorder.update_status(&task, TaskStatus::Completed, Some("done"));

        let entries = JsonlRecorder::read_entries(recorder.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["event"], "step");
        assert_eq!(entries[0]["network_ms"], 50);
        assert_eq!(entries[0]["conversation_id"], "conv-1");
        assert_eq!(entries[1]["event"], "status");
        assert_eq!(entries[1]["status"], "COMPLETED");
        assert_eq!(entries[1]["step_count"], 1);
        assert_eq!(entries[1]["result_message"], "done");
    }
}
