//! Task lifecycle tracking.

mod state;

pub use state::{
    StepTiming, Task, TaskSnapshot, TaskStateMachine, TaskStatus, HISTORY_LIMIT, STOPPED_BY_USER,
};
