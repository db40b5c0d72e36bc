//! Conversation-level entry points for the presentation layer.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::{JoinError, JoinHandle};
use uuid::Uuid;

use super::agent_loop::AgentLoop;
use super::control::LoopControl;
use crate::policy::{AccessPolicy, PolicyStore};
use crate::task::{Task, TaskSnapshot, TaskStateMachine};

struct Conversation {
    machine: Arc<Mutex<TaskStateMachine>>,
    control: LoopControl,
    handle: Option<JoinHandle<()>>,
}

impl Conversation {
    fn new(conversation_id: &str) -> Self {
        Self {
            machine: Arc::new(Mutex::new(TaskStateMachine::new(conversation_id))),
            control: LoopControl::new(),
            handle: None,
        }
    }
}

/// Runs agent loops for any number of conversations, one task each at a time.
///
/// Every task gets its own policy cache, refreshed from the shared store before
/// each access check. The service-level policy is the one apps are toggled
/// through.
pub struct AgentService {
    agent: AgentLoop,
    store: Arc<dyn PolicyStore>,
    policy: AccessPolicy,
    conversations: Mutex<HashMap<String, Conversation>>,
}

impl AgentService {
    /// Create the service and reconcile the policy against the installed apps.
    pub fn new(
        agent: AgentLoop,
        store: Arc<dyn PolicyStore>,
        installed: &BTreeSet<String>,
    ) -> Self {
        let policy = AccessPolicy::open(store.clone(), installed);
        Self {
            agent,
            store,
            policy,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    pub fn agent(&self) -> &AgentLoop {
        &self.agent
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    /// Start a task. Returns `false` if the conversation already runs one.
    pub async fn start(&self, conversation_id: &str, instruction: &str) -> bool {
        let mut conversations = self.conversations.lock().await;
        let conversation = conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| Conversation::new(conversation_id));

        let task_id = {
            let mut machine = conversation.machine.lock().await;
            if !machine.start(instruction) {
                return false;
            }
            machine.current().map(|task| task.id)
        };

        let control = LoopControl::new();
        conversation.control = control.clone();

        let agent = self.agent.clone();
        let machine = conversation.machine.clone();
        let policy = AccessPolicy::load(self.store.clone());
        conversation.handle = Some(tokio::spawn(async move {
            let run = tokio::spawn({
                let agent = agent.clone();
                let machine = machine.clone();
                async move { agent.run(machine, &policy, &control).await }
            });
            if let (Err(e), Some(task_id)) = (run.await, task_id) {
                settle_crashed(&agent, &machine, task_id, e).await;
            }
        }));
        true
    }

    /// Hold the loop before its next step. Returns `false` without a running task.
    pub async fn pause(&self, conversation_id: &str) -> bool {
        self.with_running(conversation_id, |control| control.pause())
            .await
    }

    pub async fn resume(&self, conversation_id: &str) -> bool {
        self.with_running(conversation_id, |control| control.resume())
            .await
    }

    /// Abort the running task. No-op when it has already settled.
    pub async fn stop(&self, conversation_id: &str) -> bool {
        let conversations = self.conversations.lock().await;
        let Some(conversation) = conversations.get(conversation_id) else {
            return false;
        };

        conversation.control.stop();
        let mut machine = conversation.machine.lock().await;
        if !machine.stop() {
            return false;
        }
        if let Some(task) = machine.current() {
            self.agent
                .recorder()
                .update_status(task, task.status, task.result_message.as_deref());
        }
        true
    }

    /// Forget a conversation and its tasks. Refused while a task is running.
    pub async fn close(&self, conversation_id: &str) -> bool {
        let mut conversations = self.conversations.lock().await;
        let Some(conversation) = conversations.get(conversation_id) else {
            return false;
        };
        if conversation.machine.lock().await.is_running() {
            return false;
        }
        conversations.remove(conversation_id);
        true
    }

    /// Observe the conversation's latest task.
    pub async fn subscribe(&self, conversation_id: &str) -> watch::Receiver<TaskSnapshot> {
        let mut conversations = self.conversations.lock().await;
        let conversation = conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| Conversation::new(conversation_id));
        let machine = conversation.machine.lock().await;
        machine.subscribe()
    }

    /// Latest task of the conversation, running or settled.
    pub async fn task(&self, conversation_id: &str) -> Option<Task> {
        let machine = self.machine(conversation_id).await?;
        let machine = machine.lock().await;
        machine.current().cloned()
    }

    pub async fn is_paused(&self, conversation_id: &str) -> bool {
        self.conversations
            .lock()
            .await
            .get(conversation_id)
            .map(|conversation| conversation.control.is_paused())
            .unwrap_or(false)
    }

    /// Wait for the conversation's loop to exit and return the settled task.
    pub async fn wait(&self, conversation_id: &str) -> Option<Task> {
        let handle = self
            .conversations
            .lock()
            .await
            .get_mut(conversation_id)
            .and_then(|conversation| conversation.handle.take());

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Agent loop supervisor for {} failed: {}", conversation_id, e);
            }
        }
        self.task(conversation_id).await
    }

    async fn machine(&self, conversation_id: &str) -> Option<Arc<Mutex<TaskStateMachine>>> {
        self.conversations
            .lock()
            .await
            .get(conversation_id)
            .map(|conversation| conversation.machine.clone())
    }

    async fn with_running(&self, conversation_id: &str, f: impl FnOnce(&LoopControl)) -> bool {
        let conversations = self.conversations.lock().await;
        let Some(conversation) = conversations.get(conversation_id) else {
            return false;
        };
        if !conversation.machine.lock().await.is_running() {
            return false;
        }
        f(&conversation.control);
        true
    }
}

/// End the task a crashed loop left running, with the panic text as result.
async fn settle_crashed(
    agent: &AgentLoop,
    machine: &Mutex<TaskStateMachine>,
    task_id: Uuid,
    error: JoinError,
) {
    let reason = if error.is_panic() {
        let payload = error.into_panic();
        payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string())
    } else {
        error.to_string()
    };
    tracing::error!("Agent loop crashed: {}", reason);

    let mut machine = machine.lock().await;
    if machine.current().map(|task| task.id) != Some(task_id) {
        return;
    }
    if machine.end(format!("Agent loop crashed: {}", reason)) {
        if let Some(task) = machine.current() {
            agent
                .recorder()
                .update_status(task, task.status, task.result_message.as_deref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::Semaphore;

    use crate::actions::{DoAction, TargetApp};
    use crate::agent::{
        ActionExecutor, AgentConfig, CaptureError, DenialChoice, DenialHandler, ExecutionError,
        ScreenCapture, Screenshot,
    };
    use crate::model::{ModelResponse, ModelTransport, TransportError};
    use crate::policy::{AccessMode, MemoryStore, PolicyState};
    use crate::record::TaskRecorder;
    use crate::task::{StepTiming, TaskStatus, STOPPED_BY_USER};

    const TAP: &str = "<think>tap it</think><answer>do(action=\"Tap\", element=[100,200])</answer>";
    const DONE: &str = "<think>all good</think><answer>finish(message=\"done\")</answer>";
    const BLOCKED: &str = "do(action=\"Launch\", app=\"com.example.blocked\")";

    struct FakeTransport {
        replies: StdMutex<VecDeque<Result<String, TransportError>>>,
        fallback: String,
        hold: Option<Arc<Semaphore>>,
        calls: AtomicUsize,
        sent: StdMutex<Vec<Vec<Value>>>,
    }

    impl FakeTransport {
        fn new(replies: &[&str], fallback: &str) -> Self {
            Self {
                replies: StdMutex::new(replies.iter().map(|r| Ok(r.to_string())).collect()),
                fallback: fallback.to_string(),
                hold: None,
                calls: AtomicUsize::new(0),
                sent: StdMutex::new(Vec::new()),
            }
        }

        fn failing(error: TransportError) -> Self {
            let transport = Self::new(&[], DONE);
            transport.replies.lock().unwrap().push_back(Err(error));
            transport
        }

        fn held(mut self, hold: Arc<Semaphore>) -> Self {
            self.hold = Some(hold);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelTransport for FakeTransport {
        async fn send(
            &self,
            messages: &[Value],
            _model_name: &str,
        ) -> Result<ModelResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sent.lock().unwrap().push(messages.to_vec());
            if let Some(hold) = &self.hold {
                hold.acquire().await.unwrap().forget();
            }
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(self.fallback.clone()))?;
            Ok(ModelResponse { raw_content: reply })
        }
    }

    #[derive(Default)]
    struct FakeScreen {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ScreenCapture for FakeScreen {
        async fn capture(&self) -> Result<Screenshot, CaptureError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CaptureError::new("device offline"));
            }
            Ok(Screenshot {
                base64_data: "aW1n".to_string(),
                width: 1080,
                height: 2400,
                is_sensitive: false,
                current_app: Some("com.android.settings".to_string()),
            })
        }
    }

    #[derive(Default)]
    struct FakeExecutor {
        fail_with: Option<String>,
        panic_with: Option<String>,
        executed: StdMutex<Vec<(String, Option<String>)>>,
    }

    impl FakeExecutor {
        fn executed(&self) -> Vec<(String, Option<String>)> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ActionExecutor for FakeExecutor {
        async fn execute(
            &self,
            action: &DoAction,
            target: Option<&TargetApp>,
        ) -> Result<(), ExecutionError> {
            if let Some(reason) = &self.fail_with {
                return Err(ExecutionError::new(reason.clone()));
            }
            if let Some(reason) = &self.panic_with {
                panic!("{}", reason);
            }
            self.executed
                .lock()
                .unwrap()
                .push((action.name.clone(), target.map(|t| t.package.clone())));
            Ok(())
        }
    }

    /// Answers every denial with `choice`, optionally enabling the app first.
    struct FakeDenials {
        choice: DenialChoice,
        enable_with: Option<Arc<dyn PolicyStore>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DenialHandler for FakeDenials {
        async fn on_denied(&self, _conversation_id: &str, target: &TargetApp) -> DenialChoice {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(store) = &self.enable_with {
                AccessPolicy::load(store.clone())
                    .toggle(&target.package, true)
                    .unwrap();
            }
            self.choice
        }
    }

    #[derive(Default)]
    struct CollectingRecorder {
        steps: StdMutex<Vec<StepTiming>>,
        statuses: StdMutex<Vec<TaskStatus>>,
    }

    impl TaskRecorder for CollectingRecorder {
        fn append_step(&self, _task: &Task, timing: &StepTiming) {
            self.steps.lock().unwrap().push(*timing);
        }

        fn update_status(&self, _task: &Task, status: TaskStatus, _result_message: Option<&str>) {
            self.statuses.lock().unwrap().push(status);
        }
    }

    struct Harness {
        service: AgentService,
        transport: Arc<FakeTransport>,
        screen: Arc<FakeScreen>,
        executor: Arc<FakeExecutor>,
        recorder: Arc<CollectingRecorder>,
        store: Arc<dyn PolicyStore>,
    }

    fn blocked_state() -> PolicyState {
        PolicyState {
            mode: Some(AccessMode::DenyList),
            denied: ["com.example.blocked".to_string()].into(),
            ..Default::default()
        }
    }

    fn harness(transport: FakeTransport) -> Harness {
        build(
            transport,
            FakeScreen::default(),
            FakeExecutor::default(),
            PolicyState::default(),
            |agent, _| agent,
        )
    }

    fn build(
        transport: FakeTransport,
        screen: FakeScreen,
        executor: FakeExecutor,
        state: PolicyState,
        customize: impl FnOnce(AgentLoop, Arc<dyn PolicyStore>) -> AgentLoop,
    ) -> Harness {
        let transport = Arc::new(transport);
        let screen = Arc::new(screen);
        let executor = Arc::new(executor);
        let recorder = Arc::new(CollectingRecorder::default());
        let store: Arc<dyn PolicyStore> = Arc::new(MemoryStore::new(state));

        let agent = AgentLoop::new(
            AgentConfig::default().with_lang("en").with_max_steps(5),
            transport.clone(),
            screen.clone(),
            executor.clone(),
        )
        .with_recorder(recorder.clone());
        let agent = customize(agent, store.clone());

        Harness {
            service: AgentService::new(agent, store.clone(), &BTreeSet::new()),
            transport,
            screen,
            executor,
            recorder,
            store,
        }
    }

    async fn finish(h: &Harness, conversation_id: &str) -> Task {
        tokio::time::timeout(Duration::from_secs(5), h.service.wait(conversation_id))
            .await
            .expect("loop did not settle")
            .expect("no task")
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_task_completes_on_finish() {
        let h = harness(FakeTransport::new(&[TAP, DONE], DONE));
        assert!(h.service.start("conv", "open settings").await);

        let task = finish(&h, "conv").await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result_message.as_deref(), Some("done"));
        assert_eq!(task.step_count, 2);
        assert!(task.ended_at.is_some());
        assert_eq!(h.executor.executed(), vec![("Tap".to_string(), None)]);
        assert_eq!(h.recorder.steps.lock().unwrap().len(), 2);
        assert_eq!(
            *h.recorder.statuses.lock().unwrap(),
            vec![TaskStatus::Running, TaskStatus::Completed]
        );
    }

    #[tokio::test]
    async fn test_history_carries_instruction_and_assistant_turns() {
        let h = harness(FakeTransport::new(&[TAP, DONE], DONE));
        h.service.start("conv", "open settings").await;
        finish(&h, "conv").await;

        let sent = h.transport.sent.lock().unwrap();
        let first = &sent[0];
        assert_eq!(first[0]["role"], "system");
        let text = first[1]["content"][1]["text"].as_str().unwrap();
        assert!(text.starts_with("open settings"));
        assert!(text.contains("Settings"));

        let second = &sent[1];
        assert_eq!(second.len(), 4);
        assert_eq!(second[1]["content"].as_array().unwrap().len(), 1);
        assert_eq!(second[2]["role"], "assistant");
        assert!(second[2]["content"]
            .as_str()
            .unwrap()
            .contains("do(action=\"Tap\", element=[100,200])"));
    }

    #[tokio::test]
    async fn test_failed_finish_aborts() {
        let h = harness(FakeTransport::new(
            &["finish(message=\"no network\", success=False)"],
            DONE,
        ));
        h.service.start("conv", "book a ticket").await;

        let task = finish(&h, "conv").await;
        assert_eq!(task.status, TaskStatus::Aborted);
        assert_eq!(task.result_message.as_deref(), Some("no network"));
    }

    #[tokio::test]
    async fn test_transport_failure_ends_task() {
        let h = harness(FakeTransport::failing(TransportError {
            code: Some(500),
            message: "Max retries exceeded".to_string(),
        }));
        h.service.start("conv", "open settings").await;

        let task = finish(&h, "conv").await;
        assert_eq!(task.status, TaskStatus::Ended);
        assert_eq!(task.result_message.as_deref(), Some("HTTP 500: Max retries exceeded"));
        assert_eq!(task.step_count, 0);
    }

    #[tokio::test]
    async fn test_execution_error_ends_task_verbatim() {
        let h = build(
            FakeTransport::new(&[TAP], DONE),
            FakeScreen::default(),
            FakeExecutor {
                fail_with: Some("accessibility service disconnected".to_string()),
                ..Default::default()
            },
            PolicyState::default(),
            |agent, _| agent,
        );
        h.service.start("conv", "open settings").await;

        let task = finish(&h, "conv").await;
        assert_eq!(task.status, TaskStatus::Ended);
        assert_eq!(
            task.result_message.as_deref(),
            Some("accessibility service disconnected")
        );
    }

    #[tokio::test]
    async fn test_executor_panic_ends_task() {
        let h = build(
            FakeTransport::new(&[TAP], DONE),
            FakeScreen::default(),
            FakeExecutor {
                panic_with: Some("gesture overflowed".to_string()),
                ..Default::default()
            },
            PolicyState::default(),
            |agent, _| agent,
        );
        h.service.start("conv", "swipe down").await;

        let task = finish(&h, "conv").await;
        assert_eq!(task.status, TaskStatus::Ended);
        assert!(task
            .result_message
            .as_deref()
            .unwrap()
            .contains("gesture overflowed"));
        assert_eq!(
            h.recorder.statuses.lock().unwrap().last(),
            Some(&TaskStatus::Ended)
        );

        assert!(h.service.start("conv", "try again").await);
        assert_eq!(finish(&h, "conv").await.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_empty_reply_is_a_step_not_a_finish() {
        let h = harness(FakeTransport::new(&["", DONE], DONE));
        h.service.start("conv", "open settings").await;

        let task = finish(&h, "conv").await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result_message.as_deref(), Some("done"));
        assert_eq!(task.step_count, 2);
        assert_eq!(task.step_timings[0].execution_ms, 0);
        assert!(h.executor.executed().is_empty());

        let sent = h.transport.sent.lock().unwrap();
        let note = sent[1].last().unwrap()["content"][1]["text"].as_str().unwrap();
        assert!(note.contains("previous reply was empty"));
    }

    #[tokio::test]
    async fn test_empty_replies_run_into_step_limit() {
        let h = harness(FakeTransport::new(&[], ""));
        h.service.start("conv", "open settings").await;

        let task = finish(&h, "conv").await;
        assert_eq!(task.status, TaskStatus::Aborted);
        assert_eq!(task.result_message.as_deref(), Some("Reached max steps"));
    }

    #[tokio::test]
    async fn test_disabling_app_mid_task_blocks_it() {
        let hold = Arc::new(Semaphore::new(0));
        let h = harness(FakeTransport::new(&[TAP, BLOCKED], DONE).held(hold.clone()));
        h.service.start("conv", "tap then open the app").await;

        hold.add_permits(1);
        let transport = h.transport.clone();
        wait_until(|| transport.calls() == 2).await;
        assert_eq!(h.executor.executed(), vec![("Tap".to_string(), None)]);

        h.service
            .policy()
            .toggle("com.example.blocked", false)
            .unwrap();
        assert!(!h.service.policy().is_enabled("com.example.blocked"));
        hold.add_permits(10);

        let task = finish(&h, "conv").await;
        assert_eq!(task.status, TaskStatus::Aborted);
        assert!(task
            .result_message
            .as_deref()
            .unwrap()
            .contains("com.example.blocked"));
        assert_eq!(h.executor.executed(), vec![("Tap".to_string(), None)]);
    }

    #[tokio::test]
    async fn test_capture_failure_ends_task() {
        let h = build(
            FakeTransport::new(&[], DONE),
            FakeScreen {
                fail: true,
                ..Default::default()
            },
            FakeExecutor::default(),
            PolicyState::default(),
            |agent, _| agent,
        );
        h.service.start("conv", "open settings").await;

        let task = finish(&h, "conv").await;
        assert_eq!(task.status, TaskStatus::Ended);
        assert_eq!(h.transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_step_limit_aborts() {
        let h = harness(FakeTransport::new(&[], TAP));
        h.service.start("conv", "scroll forever").await;

        let task = finish(&h, "conv").await;
        assert_eq!(task.status, TaskStatus::Aborted);
        assert_eq!(task.result_message.as_deref(), Some("Reached max steps"));
        assert_eq!(task.step_count, 5);
        assert_eq!(h.executor.executed().len(), 5);
    }

    #[tokio::test]
    async fn test_denial_can_end_task() {
        let h = build(
            FakeTransport::new(&[BLOCKED], DONE),
            FakeScreen::default(),
            FakeExecutor::default(),
            blocked_state(),
            |agent, _| agent,
        );
        h.service.start("conv", "open the blocked app").await;

        let task = finish(&h, "conv").await;
        assert_eq!(task.status, TaskStatus::Aborted);
        assert!(task
            .result_message
            .as_deref()
            .unwrap()
            .contains("com.example.blocked"));
        assert!(h.executor.executed().is_empty());
        assert_eq!(task.step_count, 0);
    }

    #[tokio::test]
    async fn test_denial_continue_skips_still_disabled_app() {
        let denials = Arc::new(FakeDenials {
            choice: DenialChoice::Continue,
            enable_with: None,
            calls: AtomicUsize::new(0),
        });
        let handler = denials.clone();
        let h = build(
            FakeTransport::new(&[BLOCKED, DONE], DONE),
            FakeScreen::default(),
            FakeExecutor::default(),
            blocked_state(),
            move |agent, _| agent.with_denial_handler(handler),
        );
        h.service.start("conv", "open the blocked app").await;

        let task = finish(&h, "conv").await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(denials.calls.load(Ordering::SeqCst), 1);
        assert!(h.executor.executed().is_empty());
        assert_eq!(task.step_count, 2);
        assert_eq!(task.step_timings[0].execution_ms, 0);

        let sent = h.transport.sent.lock().unwrap();
        let note = sent[1].last().unwrap()["content"][1]["text"].as_str().unwrap();
        assert!(note.contains("com.example.blocked"));
    }

    #[tokio::test]
    async fn test_denial_continue_after_enabling_executes() {
        let h = build(
            FakeTransport::new(&[BLOCKED, DONE], DONE),
            FakeScreen::default(),
            FakeExecutor::default(),
            blocked_state(),
            |agent, store| {
                agent.with_denial_handler(Arc::new(FakeDenials {
                    choice: DenialChoice::Continue,
                    enable_with: Some(store),
                    calls: AtomicUsize::new(0),
                }))
            },
        );
        h.service.start("conv", "open the blocked app").await;

        let task = finish(&h, "conv").await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(
            h.executor.executed(),
            vec![("Launch".to_string(), Some("com.example.blocked".to_string()))]
        );
        assert!(h.service.policy().lookup("com.example.blocked").is_some());
        assert!(h.store.load().unwrap().denied.is_empty());
    }

    #[tokio::test]
    async fn test_start_rejected_while_running() {
        let hold = Arc::new(Semaphore::new(0));
        let h = harness(FakeTransport::new(&[DONE], DONE).held(hold.clone()));

        assert!(h.service.start("conv", "first").await);
        let before = h.service.task("conv").await.unwrap();
        assert!(!h.service.start("conv", "second").await);
        assert_eq!(h.service.task("conv").await.unwrap(), before);

        hold.add_permits(1);
        let task = finish(&h, "conv").await;
        assert_eq!(task.instruction, "first");
        assert_eq!(task.status, TaskStatus::Completed);

        assert!(h.service.start("conv", "second").await);
        hold.add_permits(1);
        assert_eq!(finish(&h, "conv").await.instruction, "second");
    }

    #[tokio::test]
    async fn test_stop_aborts_before_next_step() {
        let hold = Arc::new(Semaphore::new(0));
        let h = harness(FakeTransport::new(&[], TAP).held(hold.clone()));
        h.service.start("conv", "open settings").await;

        let transport = h.transport.clone();
        wait_until(|| transport.calls() == 1).await;
        assert!(h.service.stop("conv").await);
        assert!(!h.service.stop("conv").await);

        hold.add_permits(10);
        let task = finish(&h, "conv").await;
        assert_eq!(task.status, TaskStatus::Aborted);
        assert_eq!(task.result_message.as_deref(), Some(STOPPED_BY_USER));
        assert!(h.executor.executed().is_empty());
        assert_eq!(task.step_count, 0);
        assert_eq!(h.transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_pause_holds_loop_between_steps() {
        let hold = Arc::new(Semaphore::new(0));
        let h = harness(FakeTransport::new(&[TAP, DONE], DONE).held(hold.clone()));
        let updates = h.service.subscribe("conv").await;
        h.service.start("conv", "open settings").await;

        let transport = h.transport.clone();
        wait_until(|| transport.calls() == 1).await;
        assert!(h.service.pause("conv").await);
        hold.add_permits(10);

        wait_until(|| updates.borrow().step_count == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.transport.calls(), 1);
        assert_eq!(h.screen.calls.load(Ordering::SeqCst), 1);
        {
            let snapshot = updates.borrow();
            assert_eq!(snapshot.status, TaskStatus::Running);
            assert!(snapshot.latest_timing.is_some());
        }
        assert!(h.service.is_paused("conv").await);

        assert!(h.service.resume("conv").await);
        let task = finish(&h, "conv").await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(h.transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_stop_while_paused() {
        let hold = Arc::new(Semaphore::new(0));
        let h = harness(FakeTransport::new(&[TAP], DONE).held(hold.clone()));
        h.service.start("conv", "open settings").await;

        let transport = h.transport.clone();
        wait_until(|| transport.calls() == 1).await;
        h.service.pause("conv").await;
        hold.add_permits(10);

        assert!(h.service.stop("conv").await);
        let task = finish(&h, "conv").await;
        assert_eq!(task.status, TaskStatus::Aborted);
        assert_eq!(h.transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_close_drops_settled_conversation_only() {
        let hold = Arc::new(Semaphore::new(0));
        let h = harness(FakeTransport::new(&[], DONE).held(hold.clone()));
        h.service.start("conv", "open settings").await;

        assert!(!h.service.close("conv").await);
        hold.add_permits(1);
        finish(&h, "conv").await;

        assert!(h.service.close("conv").await);
        assert!(h.service.task("conv").await.is_none());
        assert!(!h.service.close("conv").await);
    }

    #[tokio::test]
    async fn test_conversations_are_isolated() {
        let hold = Arc::new(Semaphore::new(0));
        let h = harness(FakeTransport::new(&[], DONE).held(hold.clone()));

        assert!(h.service.start("a", "first").await);
        assert!(h.service.start("b", "second").await);
        let transport = h.transport.clone();
        wait_until(|| transport.calls() == 2).await;

        assert!(h.service.stop("a").await);
        hold.add_permits(10);

        assert_eq!(finish(&h, "a").await.status, TaskStatus::Aborted);
        let b = finish(&h, "b").await;
        assert_eq!(b.status, TaskStatus::Completed);
        assert_eq!(b.instruction, "second");
        assert!(!h.service.pause("unknown").await);
    }
}
