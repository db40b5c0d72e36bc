//! Extraction of an actionable command from free-form model output.

mod response;

pub use response::{parse, ParsedAction, Recovery, Strategy, RECOVERIES, STRATEGIES};
