//! App access policy: which packages the agent may act on.

mod access;
mod store;

pub use access::{AccessList, AccessMode, AccessPolicy, PolicyState, OVERSIZED_ALLOW_LIST_PERCENT};
pub use store::{JsonFileStore, MemoryStore, PolicyError, PolicyStore};
