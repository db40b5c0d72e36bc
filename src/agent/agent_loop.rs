//! The per-conversation decision loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::collaborators::{
    ActionExecutor, DenialChoice, DenialHandler, EndOnDenial, ScreenCapture, Screenshot,
};
use super::control::LoopControl;
use crate::actions::{Action, FinishOutcome, TargetApp};
use crate::config::{get_messages, get_system_prompt, AppRegistry, Messages};
use crate::model::{MessageBuilder, ModelTransport};
use crate::parser::parse;
use crate::policy::AccessPolicy;
use crate::record::{TaskRecorder, TracingRecorder};
use crate::task::{StepTiming, TaskStateMachine};

/// Label reported to the model when no app is in the foreground.
const HOME_SCREEN: &str = "System Home";

/// Configuration for the agent loop.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Maximum number of steps before the task is aborted.
    pub max_steps: u32,
    /// Language code ("cn" for Chinese, "en" for English).
    pub lang: String,
    /// Custom system prompt (if None, uses default based on lang).
    pub system_prompt: Option<String>,
    /// Model name sent with every request.
    pub model_name: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 100,
            lang: "cn".to_string(),
            system_prompt: None,
            model_name: "autoglm-phone-9b".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    /// Get the system prompt (custom or default based on language) for a
    /// screen of the given size.
    pub fn system_prompt(&self, width: u32, height: u32) -> String {
        self.system_prompt
            .clone()
            .unwrap_or_else(|| get_system_prompt(&self.lang, width, height))
    }

    fn messages(&self) -> &'static Messages {
        get_messages(&self.lang)
    }
}

/// How a step ended the task.
enum Settle {
    Complete(String),
    Abort(String),
    End(String),
}

/// Result of checking a target app against the policy.
enum Gate {
    Allowed,
    Skipped,
    EndTask,
    Stopped,
}

/// Drives one task at a time: capture, ask the model, act, record.
#[derive(Clone)]
pub struct AgentLoop {
    config: AgentConfig,
    transport: Arc<dyn ModelTransport>,
    capture: Arc<dyn ScreenCapture>,
    executor: Arc<dyn ActionExecutor>,
    denials: Arc<dyn DenialHandler>,
    recorder: Arc<dyn TaskRecorder>,
    registry: Arc<AppRegistry>,
}

impl AgentLoop {
    pub fn new(
        config: AgentConfig,
        transport: Arc<dyn ModelTransport>,
        capture: Arc<dyn ScreenCapture>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        Self {
            config,
            transport,
            capture,
            executor,
            denials: Arc::new(EndOnDenial),
            recorder: Arc::new(TracingRecorder),
            registry: Arc::new(AppRegistry::with_defaults()),
        }
    }

    pub fn with_denial_handler(mut self, denials: Arc<dyn DenialHandler>) -> Self {
        self.denials = denials;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn TaskRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_registry(mut self, registry: AppRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn registry(&self) -> &AppRegistry {
        &self.registry
    }

    pub fn recorder(&self) -> &Arc<dyn TaskRecorder> {
        &self.recorder
    }

    /// Run the current task of `machine` until it settles or `control` stops it.
    ///
    /// Failures never escape: they settle the task with a result message.
    pub async fn run(
        &self,
        machine: Arc<Mutex<TaskStateMachine>>,
        policy: &AccessPolicy,
        control: &LoopControl,
    ) {
        let (task_id, conversation_id, instruction) = {
            let machine = machine.lock().await;
            let Some(task) = machine.current().filter(|task| task.is_running()) else {
                return;
            };
            self.recorder
                .update_status(task, task.status, task.result_message.as_deref());
            (task.id, task.conversation_id.clone(), task.instruction.clone())
        };

        let msgs = self.config.messages();
        let mut context: Vec<Value> = Vec::new();
        let mut note: Option<String> = None;
        let mut step: u32 = 0;

        loop {
            if step >= self.config.max_steps {
                self.settle(&machine, task_id, Settle::Abort(msgs.max_steps_reached.to_string()))
                    .await;
                break;
            }

            if !control.wait_if_paused().await || !Self::owns(&machine, task_id).await {
                break;
            }

            let started = Instant::now();
            let screenshot = match self.capture.capture().await {
                Ok(screenshot) => screenshot,
                Err(e) => {
                    self.settle(&machine, task_id, Settle::End(e.to_string())).await;
                    break;
                }
            };
            let screenshot_time = started.elapsed();

            let screen_info =
                MessageBuilder::build_screen_info(&self.current_app_label(&screenshot));
            let mut text = if context.is_empty() {
                context.push(MessageBuilder::create_system_message(
                    &self.config.system_prompt(screenshot.width, screenshot.height),
                ));
                format!("{}\n\n{}", instruction, screen_info)
            } else {
                format!("** Screen Info **\n\n{}", screen_info)
            };
            if let Some(note) = note.take() {
                text = format!("{}\n\n{}", note, text);
            }
            context.push(MessageBuilder::create_user_message(
                &text,
                Some(&screenshot.base64_data),
            ));

            if control.is_stopped() {
                break;
            }
            let started = Instant::now();
            let reply = match self.transport.send(&context, &self.config.model_name).await {
                Ok(reply) => reply,
                Err(e) => {
                    self.settle(&machine, task_id, Settle::End(e.to_string())).await;
                    break;
                }
            };
            let network_time = started.elapsed();

            if let Some(last) = context.last_mut() {
                MessageBuilder::remove_images_from_message(last);
            }

            let parsed = parse(&reply.raw_content);
            context.push(MessageBuilder::create_assistant_message(
                &parsed.thinking,
                &parsed.action,
            ));
            tracing::info!(
                conversation = %conversation_id,
                step,
                thinking = %parsed.thinking,
                action = %parsed.action,
                "model replied"
            );

            let action = match Action::classify(&parsed.action) {
                Action::Finish(finish) => {
                    let timing =
                        StepTiming::new(step, screenshot_time, network_time, Duration::ZERO);
                    if self.record(&machine, task_id, timing).await {
                        let message = finish
                            .message
                            .unwrap_or_else(|| msgs.task_completed.to_string());
                        let outcome = match finish.outcome {
                            FinishOutcome::Success => Settle::Complete(message),
                            FinishOutcome::Failure => Settle::Abort(message),
                        };
                        self.settle(&machine, task_id, outcome).await;
                    }
                    break;
                }
                Action::Empty => {
                    tracing::warn!(
                        conversation = %conversation_id,
                        step,
                        "model returned an empty reply"
                    );
                    note = Some(msgs.empty_reply_note.to_string());
                    let timing =
                        StepTiming::new(step, screenshot_time, network_time, Duration::ZERO);
                    if !self.record(&machine, task_id, timing).await {
                        break;
                    }
                    step += 1;
                    continue;
                }
                Action::Do(action) => action,
            };

            let target = action.target_app(&self.registry);
            let gate = match &target {
                Some(target) => self.check_access(&conversation_id, target, policy, control).await,
                None => Gate::Allowed,
            };

            let mut execution_time = Duration::ZERO;
            match gate {
                Gate::Stopped => break,
                Gate::EndTask => {
                    let package = target.map(|t| t.package).unwrap_or_default();
                    self.settle(
                        &machine,
                        task_id,
                        Settle::Abort(format!("{}: {}", msgs.app_disabled, package)),
                    )
                    .await;
                    break;
                }
                Gate::Skipped => {
                    let package = target.map(|t| t.package).unwrap_or_default();
                    note = Some(format!("{} ({})", msgs.app_blocked_note, package));
                }
                Gate::Allowed => {
                    if control.is_stopped() {
                        break;
                    }
                    let started = Instant::now();
                    if let Err(e) = self.executor.execute(&action, target.as_ref()).await {
                        self.settle(&machine, task_id, Settle::End(e.reason)).await;
                        break;
                    }
                    execution_time = started.elapsed();
                }
            }

            let timing = StepTiming::new(step, screenshot_time, network_time, execution_time);
            if !self.record(&machine, task_id, timing).await {
                break;
            }
            step += 1;
        }
    }

    /// Consult the stored policy, re-read for every check, before acting on
    /// `target`. Asks the user on denial.
    async fn check_access(
        &self,
        conversation_id: &str,
        target: &TargetApp,
        policy: &AccessPolicy,
        control: &LoopControl,
    ) -> Gate {
        policy.reload();
        if policy.is_enabled(&target.package) {
            return Gate::Allowed;
        }

        tracing::warn!(
            conversation = %conversation_id,
            package = %target.package,
            "action blocked by access policy"
        );

        let choice = tokio::select! {
            choice = self.denials.on_denied(conversation_id, target) => choice,
            _ = control.stopped() => return Gate::Stopped,
        };

        match choice {
            DenialChoice::EndTask => Gate::EndTask,
            DenialChoice::Continue => {
                policy.reload();
                if policy.is_enabled(&target.package) {
                    Gate::Allowed
                } else {
                    Gate::Skipped
                }
            }
        }
    }

    fn current_app_label(&self, screenshot: &Screenshot) -> String {
        match screenshot.current_app.as_deref() {
            Some(package) => self
                .registry
                .name_for(package)
                .unwrap_or(package)
                .to_string(),
            None => HOME_SCREEN.to_string(),
        }
    }

    /// Whether `task_id` is still the running task of `machine`.
    async fn owns(machine: &Mutex<TaskStateMachine>, task_id: Uuid) -> bool {
        machine
            .lock()
            .await
            .current()
            .is_some_and(|task| task.id == task_id && task.is_running())
    }

    async fn record(
        &self,
        machine: &Mutex<TaskStateMachine>,
        task_id: Uuid,
        timing: StepTiming,
    ) -> bool {
        let mut machine = machine.lock().await;
        if machine.current().map(|task| task.id) != Some(task_id) || !machine.record_step(timing) {
            return false;
        }
        if let Some(task) = machine.current() {
            self.recorder.append_step(task, &timing);
        }
        true
    }

    async fn settle(&self, machine: &Mutex<TaskStateMachine>, task_id: Uuid, settle: Settle) {
        let mut machine = machine.lock().await;
        if machine.current().map(|task| task.id) != Some(task_id) {
            return;
        }
        let settled = match settle {
            Settle::Complete(message) => machine.complete(message),
            Settle::Abort(message) => machine.abort(message),
            Settle::End(message) => machine.end(message),
        };
        if settled {
            if let Some(task) = machine.current() {
                self.recorder
                    .update_status(task, task.status, task.result_message.as_deref());
            }
        }
    }
}
