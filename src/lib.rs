// Copyright 2025 Zhipu AI (Original Python implementation)
// Copyright 2025 ModerRAS (Rust implementation)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Phone Orchestrator
//!
//! Decision loop for an AI agent that operates an Android phone.
//!
//! Each step captures the screen, asks a vision-language model what to do,
//! turns its free-form reply into a command, checks the target app against
//! the access policy and executes it, while the task state machine records
//! status and per-step timing for whoever is watching.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use phone_orchestrator::adb::AdbDevice;
//! use phone_orchestrator::policy::JsonFileStore;
//! use phone_orchestrator::{AgentConfig, AgentLoop, AgentService, ModelClient, ModelConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let device = Arc::new(AdbDevice::default());
//!     let agent = AgentLoop::new(
//!         AgentConfig::default(),
//!         Arc::new(ModelClient::new(ModelConfig::default())),
//!         device.clone(),
//!         device.clone(),
//!     );
//!     let installed = device.installed_packages().await?;
//!     let store = Arc::new(JsonFileStore::new("access_policy.json"));
//!     let service = AgentService::new(agent, store, &installed);
//!
//!     service.start("main", "打开微信").await;
//!     let task = service.wait("main").await;
//!     println!("Task result: {:?}", task.and_then(|t| t.result_message));
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod adb;
pub mod agent;
pub mod config;
pub mod model;
pub mod parser;
pub mod policy;
pub mod record;
pub mod task;

pub use actions::Action;
pub use agent::{AgentConfig, AgentLoop, AgentService, LoopControl};
pub use config::{AppRegistry, AppSettings};
pub use model::{ModelClient, ModelConfig, ModelResponse};
pub use parser::{parse, ParsedAction};
pub use policy::{AccessList, AccessPolicy};
pub use task::{Task, TaskStateMachine, TaskStatus};
