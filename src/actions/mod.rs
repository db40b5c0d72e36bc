//! Actions module for interpreting AI model commands.

mod command;

pub use command::{Action, DoAction, FinishAction, FinishOutcome, TargetApp, CALL_KEY};
