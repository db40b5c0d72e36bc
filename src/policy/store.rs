//! Backing stores for the app access policy.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use super::access::PolicyState;

/// Access policy errors.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Policy store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Policy state is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),
    #[error("Policy store could not be read")]
    Uninitialized,
}

/// Persistent home of the policy state.
///
/// `update` is a read-modify-write that must be atomic with respect to other
/// `update` calls on the same store.
pub trait PolicyStore: Send + Sync {
    /// Read the current state. A store that was never written yields the default.
    fn load(&self) -> Result<PolicyState, PolicyError>;

    /// Apply `f` to the stored state and persist the result.
    fn update(
        &self,
        f: &mut dyn FnMut(&mut PolicyState),
    ) -> Result<PolicyState, PolicyError>;
}

/// Policy state kept as a pretty-printed JSON file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<PolicyState, PolicyError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PolicyState::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, state: &PolicyState) -> Result<(), PolicyError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string_pretty(state)?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}

impl PolicyStore for JsonFileStore {
    fn load(&self) -> Result<PolicyState, PolicyError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.read()
    }

    fn update(
        &self,
        f: &mut dyn FnMut(&mut PolicyState),
    ) -> Result<PolicyState, PolicyError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = self.read()?;
        f(&mut state);
        self.write(&state)?;
        Ok(state)
    }
}

/// Policy state held in memory only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<PolicyState>,
}

impl MemoryStore {
    pub fn new(state: PolicyState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }
}

impl PolicyStore for MemoryStore {
    fn load(&self) -> Result<PolicyState, PolicyError> {
        Ok(self.state.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn update(
        &self,
        f: &mut dyn FnMut(&mut PolicyState),
    ) -> Result<PolicyState, PolicyError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state);
        Ok(state.clone())
    }
}
