//! Phone Orchestrator - AI-powered Android phone automation
//!
//! This is the CLI entry point for the phone-orchestrator tool.
//! Run with: cargo run --bin phone-orchestrator [task...]

use std::collections::BTreeSet;
use std::env;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::EnvFilter;

use phone_orchestrator::actions::TargetApp;
use phone_orchestrator::adb::AdbDevice;
use phone_orchestrator::agent::{AgentConfig, AgentLoop, AgentService, DenialChoice, DenialHandler};
use phone_orchestrator::config::{get_messages, AppRegistry, AppSettings, Messages};
use phone_orchestrator::model::{ModelClient, ModelConfig};
use phone_orchestrator::policy::{JsonFileStore, PolicyStore};
use phone_orchestrator::record::{JsonlRecorder, TaskRecorder, TracingRecorder};
use phone_orchestrator::task::{TaskSnapshot, TaskStatus};

const CONVERSATION: &str = "cli";

/// A blocked action waiting for the user's y/n.
struct DenialRequest {
    target: TargetApp,
    reply: oneshot::Sender<DenialChoice>,
}

/// Forwards denials to the input loop, which owns stdin.
struct CliDenials {
    requests: mpsc::Sender<DenialRequest>,
}

#[async_trait]
impl DenialHandler for CliDenials {
    async fn on_denied(&self, _conversation_id: &str, target: &TargetApp) -> DenialChoice {
        let (reply, answer) = oneshot::channel();
        let request = DenialRequest {
            target: target.clone(),
            reply,
        };
        if self.requests.send(request).await.is_err() {
            return DenialChoice::EndTask;
        }
        answer.await.unwrap_or(DenialChoice::EndTask)
    }
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

struct Cli {
    service: AgentService,
    installed: BTreeSet<String>,
    msgs: &'static Messages,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();

    let mut settings = AppSettings::load();
    settings.apply_env(|key| env::var(key).ok());
    let msgs = get_messages(&settings.lang);

    let model_config = ModelConfig::default()
        .with_base_url(&settings.base_url)
        .with_api_key(&settings.api_key)
        .with_model_name(&settings.model_name)
        .with_max_retries(settings.max_retries)
        .with_retry_delay(settings.retry_delay);

    let agent_config = AgentConfig::default()
        .with_lang(&settings.lang)
        .with_max_steps(settings.max_steps)
        .with_model_name(&settings.model_name);

    let device = Arc::new(AdbDevice::new(Some(settings.device_id.clone())));
    let installed = device.installed_packages().await.unwrap_or_else(|e| {
        tracing::warn!("Could not list installed packages: {}", e);
        BTreeSet::new()
    });

    let policy_path = settings
        .policy_file()
        .context("Cannot determine access policy location")?;
    let store: Arc<dyn PolicyStore> = Arc::new(JsonFileStore::new(&policy_path));

    let recorder: Arc<dyn TaskRecorder> = match settings.task_log_file() {
        Some(path) => Arc::new(JsonlRecorder::new(path)),
        None => Arc::new(TracingRecorder),
    };

    let (denial_tx, mut denial_rx) = mpsc::channel(1);
    let agent = AgentLoop::new(
        agent_config,
        Arc::new(ModelClient::new(model_config)),
        device.clone(),
        device.clone(),
    )
    .with_denial_handler(Arc::new(CliDenials {
        requests: denial_tx,
    }))
    .with_recorder(recorder)
    .with_registry(AppRegistry::with_defaults());

    println!("🤖 Phone Orchestrator - AI-powered Android Automation");
    println!("================================================");
    println!("Model: {} @ {}", settings.model_name, settings.base_url);
    println!("Language: {}", settings.lang);
    println!(
        "Retry: max {} attempts, {}s delay",
        settings.max_retries, settings.retry_delay
    );
    if let Some(id) = device.device_id() {
        println!("Device: {}", id);
    }
    println!("Access policy: {}", policy_path.display());
    println!("================================================\n");

    let cli = Cli {
        service: AgentService::new(agent, store, &installed),
        installed,
        msgs,
    };

    let one_shot = !args.is_empty();
    let mut updates = cli.service.subscribe(CONVERSATION).await;
    if one_shot {
        let task = args.join(" ");
        println!("📝 {}: {}\n", msgs.starting_task, task);
        cli.service.start(CONVERSATION, &task).await;
    } else {
        println!("Interactive mode. Type your task and press Enter.");
        println!(
            "Commands: pause, resume, stop, status, apps, enable <app>, disable <app>, quit\n"
        );
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut pending: Option<DenialRequest> = None;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line? else {
                    stdin_open = false;
                    if let Some(request) = pending.take() {
                        let _ = request.reply.send(DenialChoice::EndTask);
                    }
                    if one_shot {
                        continue;
                    }
                    break;
                };
                let input = line.trim();

                if let Some(request) = pending.take() {
                    let choice = match input.to_lowercase().as_str() {
                        "y" | "yes" => DenialChoice::Continue,
                        _ => DenialChoice::EndTask,
                    };
                    let _ = request.reply.send(choice);
                    continue;
                }

                if cli.handle(input).await == Flow::Quit {
                    break;
                }
            }
            Some(request) = denial_rx.recv() => {
                let target = &request.target;
                let label = match &target.name {
                    Some(name) if name != &target.package => {
                        format!("{} ({})", name, target.package)
                    }
                    _ => target.package.clone(),
                };
                println!("\n⚠️ {}: {}", msgs.app_disabled, label);
                println!("{}", msgs.continue_prompt);
                if stdin_open {
                    pending = Some(request);
                } else {
                    let _ = request.reply.send(DenialChoice::EndTask);
                }
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                report(&snapshot, msgs);
                if one_shot && snapshot.status.is_settled() {
                    break;
                }
            }
        }
    }

    cli.service.stop(CONVERSATION).await;
    println!("Goodbye! 👋");
    Ok(())
}

impl Cli {
    async fn handle(&self, input: &str) -> Flow {
        let msgs = self.msgs;
        let (command, rest) = input
            .split_once(char::is_whitespace)
            .map(|(c, r)| (c, r.trim()))
            .unwrap_or((input, ""));

        match command {
            "" => {}
            "quit" | "exit" => return Flow::Quit,
            "pause" => self.report_control(self.service.pause(CONVERSATION).await, msgs.paused),
            "resume" => self.report_control(self.service.resume(CONVERSATION).await, msgs.resumed),
            "stop" => {
                if !self.service.stop(CONVERSATION).await {
                    println!("{}", msgs.no_task);
                }
            }
            "status" => self.print_status().await,
            "apps" => self.print_apps(),
            "enable" | "disable" if !rest.is_empty() => self.toggle(rest, command == "enable"),
            _ => {
                if self.service.start(CONVERSATION, input).await {
                    println!("📝 {}: {}\n", msgs.starting_task, input);
                } else {
                    println!("{}", msgs.task_busy);
                }
            }
        }
        Flow::Continue
    }

    fn report_control(&self, applied: bool, done: &str) {
        if applied {
            println!("{}", done);
        } else {
            println!("{}", self.msgs.no_task);
        }
    }

    async fn print_status(&self) {
        let Some(task) = self.service.task(CONVERSATION).await else {
            println!("{}", self.msgs.no_task);
            return;
        };
        let paused = self.service.is_paused(CONVERSATION).await && task.is_running();
        println!(
            "{:?}{} | {} | {} {} | {}s",
            task.status,
            if paused { " (paused)" } else { "" },
            task.instruction,
            self.msgs.step,
            task.step_count,
            task.elapsed().num_seconds()
        );
        if let Some(message) = &task.result_message {
            println!("{}: {}", self.msgs.result, message);
        }
    }

    fn print_apps(&self) {
        let registry = self.service.agent().registry();
        let policy = self.service.policy();
        for package in &self.installed {
            let state = if policy.is_listed_enabled(package) {
                self.msgs.enabled
            } else {
                self.msgs.disabled
            };
            match registry.name_for(package) {
                Some(name) => println!("  [{}] {} ({})", state, name, package),
                None => println!("  [{}] {}", state, package),
            }
        }
    }

    fn toggle(&self, app: &str, enabled: bool) {
        let package = self
            .service
            .agent()
            .registry()
            .package_for(app)
            .unwrap_or(app)
            .to_string();
        match self.service.policy().toggle(&package, enabled) {
            Ok(()) => println!(
                "{} {}",
                package,
                if enabled { self.msgs.enabled } else { self.msgs.disabled }
            ),
            Err(e) => eprintln!("❌ {}", e),
        }
    }
}

fn report(snapshot: &TaskSnapshot, msgs: &Messages) {
    match snapshot.status {
        TaskStatus::Running => {
            if let Some(timing) = snapshot.latest_timing {
                println!(
                    "⏱️ {} {}: screenshot {}ms, network {}ms, execution {}ms",
                    msgs.step,
                    timing.step + 1,
                    timing.screenshot_ms,
                    timing.network_ms,
                    timing.execution_ms
                );
            }
        }
        TaskStatus::Completed => println!(
            "\n✅ {}: {}\n",
            msgs.task_completed,
            snapshot.result_message.as_deref().unwrap_or_default()
        ),
        TaskStatus::Aborted => println!(
            "\n⏹️ {}: {}\n",
            msgs.task_aborted,
            snapshot.result_message.as_deref().unwrap_or_default()
        ),
        TaskStatus::Ended => eprintln!(
            "\n❌ {}: {}\n",
            msgs.task_ended,
            snapshot.result_message.as_deref().unwrap_or_default()
        ),
        TaskStatus::Idle => {}
    }
}
