//! Configuration module for the phone orchestrator.

mod apps;
mod i18n;
mod prompts;
mod settings;

pub use apps::{looks_like_package, AppRegistry};
pub use i18n::{get_messages, Messages};
pub use prompts::{get_system_prompt, SYSTEM_PROMPT_EN, SYSTEM_PROMPT_ZH};
pub use settings::{AppSettings, SettingsError};
