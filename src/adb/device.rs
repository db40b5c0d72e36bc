//! Device control through the `adb` command line.

use std::collections::BTreeSet;
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::sleep;

use crate::actions::{DoAction, TargetApp};
use crate::agent::{ActionExecutor, ExecutionError};

/// Default pause after every gesture so the UI can settle.
const DEFAULT_ACTION_DELAY_MS: u64 = 1000;
const DEFAULT_LONG_PRESS_MS: u64 = 3000;
/// Largest pixel coordinate accepted from the model.
const MAX_COORDINATE: i64 = 100_000;

/// ADB errors.
#[derive(Error, Debug)]
pub enum AdbError {
    #[error("Failed to run adb: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("adb {command} failed: {stderr}")]
    Command { command: String, stderr: String },
}

/// One Android device reached through `adb`.
#[derive(Debug, Clone)]
pub struct AdbDevice {
    adb_path: String,
    device_id: Option<String>,
    action_delay: Duration,
}

impl Default for AdbDevice {
    fn default() -> Self {
        Self::new(None)
    }
}

impl AdbDevice {
    pub fn new(device_id: Option<String>) -> Self {
        Self {
            adb_path: "adb".to_string(),
            device_id: device_id.filter(|id| !id.is_empty()),
            action_delay: Duration::from_millis(DEFAULT_ACTION_DELAY_MS),
        }
    }

    pub fn with_adb_path(mut self, adb_path: impl Into<String>) -> Self {
        self.adb_path = adb_path.into();
        self
    }

    pub fn with_action_delay(mut self, delay: Duration) -> Self {
        self.action_delay = delay;
        self
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Leading arguments selecting the device.
    fn device_args(&self) -> Vec<&str> {
        match &self.device_id {
            Some(id) => vec!["-s", id.as_str()],
            None => Vec::new(),
        }
    }

    /// Run `adb [-s id] <args>` and collect its output.
    pub(crate) async fn run(&self, args: &[&str]) -> Result<Output, AdbError> {
        let output = Command::new(&self.adb_path)
            .args(self.device_args())
            .args(args)
            .output()
            .await?;
        Ok(output)
    }

    /// Run `adb shell <args>`, failing on a non-zero exit status.
    pub(crate) async fn shell(&self, args: &[&str]) -> Result<String, AdbError> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        let output = self.run(&full).await?;

        if !output.status.success() {
            return Err(AdbError::Command {
                command: full.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Packages installed on the device.
    pub async fn installed_packages(&self) -> Result<BTreeSet<String>, AdbError> {
        let stdout = self.shell(&["pm", "list", "packages"]).await?;
        Ok(stdout
            .lines()
            .filter_map(|line| line.trim().strip_prefix("package:"))
            .map(str::to_string)
            .collect())
    }

    /// Package of the focused window, `None` on the launcher or when unknown.
    pub async fn current_package(&self) -> Option<String> {
        match self.shell(&["dumpsys", "window"]).await {
            Ok(stdout) => focused_package(&stdout),
            Err(e) => {
                tracing::debug!("Failed to query focused window: {}", e);
                None
            }
        }
    }

    async fn settle(&self) {
        sleep(self.action_delay).await;
    }

    pub async fn tap(&self, x: i64, y: i64) -> Result<(), AdbError> {
        self.shell(&["input", "tap", &x.to_string(), &y.to_string()])
            .await?;
        self.settle().await;
        Ok(())
    }

    pub async fn double_tap(&self, x: i64, y: i64) -> Result<(), AdbError> {
        let (x, y) = (x.to_string(), y.to_string());
        self.shell(&["input", "tap", &x, &y]).await?;
        sleep(Duration::from_millis(100)).await;
        self.shell(&["input", "tap", &x, &y]).await?;
        self.settle().await;
        Ok(())
    }

    pub async fn long_press(&self, x: i64, y: i64, duration_ms: u64) -> Result<(), AdbError> {
        let (x, y) = (x.to_string(), y.to_string());
        self.shell(&["input", "swipe", &x, &y, &x, &y, &duration_ms.to_string()])
            .await?;
        self.settle().await;
        Ok(())
    }

    pub async fn swipe(&self, start: (i64, i64), end: (i64, i64)) -> Result<(), AdbError> {
        let duration = swipe_duration_ms(start, end);
        self.shell(&[
            "input",
            "swipe",
            &start.0.to_string(),
            &start.1.to_string(),
            &end.0.to_string(),
            &end.1.to_string(),
            &duration.to_string(),
        ])
        .await?;
        self.settle().await;
        Ok(())
    }

    pub async fn back(&self) -> Result<(), AdbError> {
        self.shell(&["input", "keyevent", "4"]).await?;
        self.settle().await;
        Ok(())
    }

    pub async fn home(&self) -> Result<(), AdbError> {
        self.shell(&["input", "keyevent", "KEYCODE_HOME"]).await?;
        self.settle().await;
        Ok(())
    }

    pub async fn launch(&self, package: &str) -> Result<(), AdbError> {
        self.shell(&[
            "monkey",
            "-p",
            package,
            "-c",
            "android.intent.category.LAUNCHER",
            "1",
        ])
        .await?;
        self.settle().await;
        Ok(())
    }
}

#[async_trait]
impl ActionExecutor for AdbDevice {
    async fn execute(
        &self,
        action: &DoAction,
        target: Option<&TargetApp>,
    ) -> Result<(), ExecutionError> {
        let args = &action.args;
        let result = match normalize(&action.name).as_str() {
            "launch" | "open_app" | "openapp" => match target {
                Some(target) => self.launch(&target.package).await,
                None => return skip(action, "no app named"),
            },
            "tap" | "click" => match point(args, "element") {
                Some((x, y)) => self.tap(x, y).await,
                None => return skip(action, "missing or off-screen element"),
            },
            "double_tap" => match point(args, "element") {
                Some((x, y)) => self.double_tap(x, y).await,
                None => return skip(action, "missing or off-screen element"),
            },
            "long_press" => match point(args, "element") {
                Some((x, y)) => self.long_press(x, y, DEFAULT_LONG_PRESS_MS).await,
                None => return skip(action, "missing or off-screen element"),
            },
            "swipe" => match (point(args, "start"), point(args, "end")) {
                (Some(start), Some(end)) => self.swipe(start, end).await,
                _ => return skip(action, "missing or off-screen start/end"),
            },
            "type" | "type_name" => match args.get("text").and_then(Value::as_str) {
                Some(text) => self.type_text_with_keyboard_handling(text).await,
                None => return skip(action, "missing text"),
            },
            "back" => self.back().await,
            "home" => self.home().await,
            "wait" => {
                sleep(wait_duration(args)).await;
                Ok(())
            }
            _ => return skip(action, "unsupported action"),
        };

        result.map_err(|e| ExecutionError::new(e.to_string()))
    }
}

/// Log and ignore an action the device cannot carry out.
fn skip(action: &DoAction, why: &str) -> Result<(), ExecutionError> {
    tracing::warn!("Skipping action {} ({}): {}", action.name, why, action.raw);
    Ok(())
}

/// `Long Press` -> `long_press`.
fn normalize(name: &str) -> String {
    name.trim().to_lowercase().replace([' ', '-'], "_")
}

/// `[x, y]` argument as a pair of on-screen pixel coordinates.
fn point(args: &Map<String, Value>, key: &str) -> Option<(i64, i64)> {
    let coords = args.get(key)?.as_array()?;
    match coords.as_slice() {
        [x, y] => Some((coordinate(x)?, coordinate(y)?)),
        _ => None,
    }
}

fn coordinate(value: &Value) -> Option<i64> {
    number(value).filter(|n| (0..=MAX_COORDINATE).contains(n))
}

fn number(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f.round() as i64))
}

/// `duration="3 seconds"` style argument, one second by default.
fn wait_duration(args: &Map<String, Value>) -> Duration {
    let seconds = match args.get("duration") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s
            .split_whitespace()
            .next()
            .and_then(|n| n.parse::<f64>().ok()),
        _ => None,
    };
    Duration::from_secs_f64(seconds.unwrap_or(1.0).clamp(0.0, 60.0))
}

/// Longer swipes take longer, within 1-2 seconds.
fn swipe_duration_ms(start: (i64, i64), end: (i64, i64)) -> u64 {
    let dx = start.0.saturating_sub(end.0);
    let dy = start.1.saturating_sub(end.1);
    let dist_sq = dx.saturating_mul(dx).saturating_add(dy.saturating_mul(dy));
    (dist_sq.unsigned_abs() / 1000).clamp(1000, 2000)
}

/// Package of the `mCurrentFocus`/`mFocusedApp` line in `dumpsys window` output.
fn focused_package(dumpsys: &str) -> Option<String> {
    dumpsys
        .lines()
        .filter(|line| line.contains("mCurrentFocus") || line.contains("mFocusedApp"))
        .find_map(|line| {
            line.split_whitespace()
                .find_map(|token| token.split_once('/'))
                .map(|(package, _)| package.trim_start_matches('{').to_string())
        })
        .filter(|package| !package.is_empty() && !package.contains("launcher"))
}
