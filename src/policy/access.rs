//! Which installed apps the agent may operate.
//!
//! The persisted [`PolicyState`] keeps the historical two-set layout so old
//! files still load. In memory the policy is an [`AccessList`], where allow
//! and deny sets cannot coexist.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use super::store::{PolicyError, PolicyStore};

/// Share of installed packages an unmoded allow-list must cover before it
/// is replaced by an empty deny-list.
pub const OVERSIZED_ALLOW_LIST_PERCENT: usize = 95;

/// Explicitly recorded policy mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    DenyList,
    AllowList,
}

/// On-disk policy layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyState {
    pub mode: Option<AccessMode>,
    pub allowed: BTreeSet<String>,
    pub denied: BTreeSet<String>,
}

/// The policy in effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessList {
    /// No mode recorded. Empty means every app is allowed; otherwise only
    /// the listed apps are.
    Legacy(BTreeSet<String>),
    /// Every app except the listed ones.
    DenyList(BTreeSet<String>),
    /// Only the listed apps.
    AllowList(BTreeSet<String>),
}

impl Default for AccessList {
    fn default() -> Self {
        Self::Legacy(BTreeSet::new())
    }
}

impl From<PolicyState> for AccessList {
    fn from(state: PolicyState) -> Self {
        match state.mode {
            Some(AccessMode::DenyList) => Self::DenyList(state.denied),
            Some(AccessMode::AllowList) => Self::AllowList(state.allowed),
            None => Self::Legacy(state.allowed),
        }
    }
}

impl From<&AccessList> for PolicyState {
    fn from(list: &AccessList) -> Self {
        match list {
            AccessList::Legacy(allowed) => PolicyState {
                mode: None,
                allowed: allowed.clone(),
                denied: BTreeSet::new(),
            },
            AccessList::DenyList(denied) => PolicyState {
                mode: Some(AccessMode::DenyList),
                allowed: BTreeSet::new(),
                denied: denied.clone(),
            },
            AccessList::AllowList(allowed) => PolicyState {
                mode: Some(AccessMode::AllowList),
                allowed: allowed.clone(),
                denied: BTreeSet::new(),
            },
        }
    }
}

impl AccessList {
    /// Recorded mode, `None` for legacy state.
    pub fn mode(&self) -> Option<AccessMode> {
        match self {
            Self::Legacy(_) => None,
            Self::DenyList(_) => Some(AccessMode::DenyList),
            Self::AllowList(_) => Some(AccessMode::AllowList),
        }
    }

    /// Mode a toggle would write: the recorded one, else allow-list when
    /// legacy entries exist, else deny-list.
    pub fn effective_mode(&self) -> AccessMode {
        match self {
            Self::Legacy(allowed) if !allowed.is_empty() => AccessMode::AllowList,
            Self::Legacy(_) => AccessMode::DenyList,
            Self::DenyList(_) => AccessMode::DenyList,
            Self::AllowList(_) => AccessMode::AllowList,
        }
    }

    pub fn is_enabled(&self, package: &str) -> bool {
        match self {
            Self::Legacy(allowed) => allowed.is_empty() || allowed.contains(package),
            Self::DenyList(denied) => !denied.contains(package),
            Self::AllowList(allowed) => allowed.contains(package),
        }
    }

    /// Enable or disable one package, committing to the effective mode.
    pub fn toggle(&mut self, package: &str, enabled: bool) {
        let (mut listed, allow_list) = match std::mem::take(self) {
            Self::Legacy(allowed) if !allowed.is_empty() => (allowed, true),
            Self::Legacy(_) => (BTreeSet::new(), false),
            Self::DenyList(denied) => (denied, false),
            Self::AllowList(allowed) => (allowed, true),
        };

        // Enabling adds to an allow-list and removes from a deny-list.
        if enabled == allow_list {
            listed.insert(package.to_string());
        } else {
            listed.remove(package);
        }

        *self = if allow_list {
            Self::AllowList(listed)
        } else {
            Self::DenyList(listed)
        };
    }

    /// Replace a legacy allow-list that covers nearly every installed app
    /// with an empty deny-list. Returns whether anything changed.
    pub fn migrate_if_oversized(&mut self, installed: &BTreeSet<String>) -> bool {
        let Self::Legacy(allowed) = self else {
            return false;
        };
        if allowed.is_empty() || installed.is_empty() {
            return false;
        }

        let covered = installed.intersection(allowed).count();
        if covered * 100 < installed.len() * OVERSIZED_ALLOW_LIST_PERCENT {
            return false;
        }

        *self = Self::DenyList(BTreeSet::new());
        true
    }
}

/// Shared, store-backed access policy with a local cache.
///
/// A cache of `None` means the store could not be read. Callers about to act
/// on a device use [`AccessPolicy::is_enabled`], which then denies; app
/// listings use [`AccessPolicy::is_listed_enabled`], which then allows.
pub struct AccessPolicy {
    store: Arc<dyn PolicyStore>,
    cache: RwLock<Option<AccessList>>,
}

impl AccessPolicy {
    /// Load the policy without migrating it.
    pub fn load(store: Arc<dyn PolicyStore>) -> Self {
        let policy = Self {
            store,
            cache: RwLock::new(None),
        };
        policy.reload();
        policy
    }

    /// Load the policy and run the one-time allow-list migration.
    pub fn open(store: Arc<dyn PolicyStore>, installed: &BTreeSet<String>) -> Self {
        let policy = Self::load(store);
        if let Err(e) = policy.migrate_if_oversized_allow_list(installed) {
            tracing::warn!("Access policy migration skipped: {}", e);
        }
        policy
    }

    /// Refresh the cache from the store.
    pub fn reload(&self) {
        let loaded = match self.store.load() {
            Ok(state) => Some(AccessList::from(state)),
            Err(e) => {
                tracing::error!("Failed to read access policy: {}", e);
                None
            }
        };
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = loaded;
    }

    /// Current policy, `None` when the store is unreadable.
    pub fn snapshot(&self) -> Option<AccessList> {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Decision for `package`, `None` when the store is unreadable.
    pub fn lookup(&self, package: &str) -> Option<bool> {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|list| list.is_enabled(package))
    }

    /// Whether the agent may act on `package`. Denies when the policy is unknown.
    pub fn is_enabled(&self, package: &str) -> bool {
        self.lookup(package).unwrap_or(false)
    }

    /// Whether an app listing should show `package` as enabled. Allows when
    /// the policy is unknown.
    pub fn is_listed_enabled(&self, package: &str) -> bool {
        self.lookup(package).unwrap_or(true)
    }

    /// Enable or disable a package and persist the result.
    pub fn toggle(&self, package: &str, enabled: bool) -> Result<(), PolicyError> {
        self.modify(|list| {
            list.toggle(package, enabled);
            true
        })?;
        tracing::info!(
            "App {} {}",
            package,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Run the oversized allow-list migration. Idempotent.
    pub fn migrate_if_oversized_allow_list(
        &self,
        installed: &BTreeSet<String>,
    ) -> Result<bool, PolicyError> {
        let migrated = self.modify(|list| list.migrate_if_oversized(installed))?;
        if migrated {
            tracing::info!(
                "Legacy allow-list covers at least {}% of {} installed apps, switched to deny-list",
                OVERSIZED_ALLOW_LIST_PERCENT,
                installed.len()
            );
        }
        Ok(migrated)
    }

    /// Read-modify-write against the store; `f` reports whether it changed anything.
    fn modify(&self, mut f: impl FnMut(&mut AccessList) -> bool) -> Result<bool, PolicyError> {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        let mut changed = false;
        let state = self.store.update(&mut |state| {
            let mut list = AccessList::from(std::mem::take(state));
            changed = f(&mut list);
            *state = PolicyState::from(&list);
        })?;
        *cache = Some(AccessList::from(state));
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::MemoryStore;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn policy(state: PolicyState) -> AccessPolicy {
        AccessPolicy::load(Arc::new(MemoryStore::new(state)))
    }

    fn assert_exclusive(state: &PolicyState) {
        match state.mode {
            Some(AccessMode::DenyList) => assert!(state.allowed.is_empty()),
            Some(AccessMode::AllowList) => assert!(state.denied.is_empty()),
            None => {}
        }
    }

    struct UnreadableStore;

    impl PolicyStore for UnreadableStore {
        fn load(&self) -> Result<PolicyState, PolicyError> {
            Err(PolicyError::Uninitialized)
        }

        fn update(
            &self,
            _f: &mut dyn FnMut(&mut PolicyState),
        ) -> Result<PolicyState, PolicyError> {
            Err(PolicyError::Uninitialized)
        }
    }

    #[test]
    fn test_open_default() {
        let policy = policy(PolicyState::default());
        assert!(policy.is_enabled("com.any.pkg"));
        assert_eq!(policy.snapshot().unwrap().mode(), None);
    }

    #[test]
    fn test_legacy_allow_list_membership() {
        let policy = policy(PolicyState {
            allowed: set(&["com.a"]),
            ..Default::default()
        });
        assert!(policy.is_enabled("com.a"));
        assert!(!policy.is_enabled("com.b"));
    }

    #[test]
    fn test_deny_list_mode() {
        let list = AccessList::DenyList(set(&["com.blocked"]));
        assert!(list.is_enabled("com.other"));
        assert!(!list.is_enabled("com.blocked"));
    }

    #[test]
    fn test_loading_drops_the_inactive_set() {
        let list = AccessList::from(PolicyState {
            mode: Some(AccessMode::DenyList),
            allowed: set(&["com.stale"]),
            denied: set(&["com.x"]),
        });
        assert_eq!(list, AccessList::DenyList(set(&["com.x"])));
        assert_exclusive(&PolicyState::from(&list));
    }

    #[test]
    fn test_toggle_from_open_default_uses_deny_list() {
        let policy = policy(PolicyState::default());
        policy.toggle("com.a", false).unwrap();

        assert!(!policy.is_enabled("com.a"));
        assert!(policy.is_enabled("com.b"));
        assert_eq!(
            policy.snapshot(),
            Some(AccessList::DenyList(set(&["com.a"])))
        );
    }

    #[test]
    fn test_toggle_from_legacy_allow_list_uses_allow_list() {
        let policy = policy(PolicyState {
            allowed: set(&["com.a"]),
            ..Default::default()
        });
        policy.toggle("com.b", true).unwrap();

        assert_eq!(
            policy.snapshot(),
            Some(AccessList::AllowList(set(&["com.a", "com.b"])))
        );
    }

    #[test]
    fn test_disable_then_enable_restores() {
        let starts = [
            PolicyState::default(),
            PolicyState {
                allowed: set(&["com.p", "com.q"]),
                ..Default::default()
            },
            PolicyState {
                mode: Some(AccessMode::DenyList),
                denied: set(&["com.q"]),
                ..Default::default()
            },
            PolicyState {
                mode: Some(AccessMode::AllowList),
                allowed: set(&["com.p"]),
                ..Default::default()
            },
        ];

        for start in starts {
            let policy = policy(start);
            let before = policy.is_enabled("com.p");
            policy.toggle("com.p", false).unwrap();
            assert!(!policy.is_enabled("com.p"));
            policy.toggle("com.p", true).unwrap();
            assert_eq!(policy.is_enabled("com.p"), before);
        }
    }

    #[test]
    fn test_toggles_keep_sets_exclusive() {
        let store = Arc::new(MemoryStore::new(PolicyState {
            allowed: set(&["com.a"]),
            ..Default::default()
        }));
        let policy = AccessPolicy::load(store.clone());

        for (pkg, enabled) in [("com.a", false), ("com.b", true), ("com.c", false)] {
            policy.toggle(pkg, enabled).unwrap();
            assert_exclusive(&store.load().unwrap());
        }
    }

    #[test]
    fn test_migration_of_oversized_allow_list() {
        let installed: BTreeSet<String> = (0..20).map(|i| format!("com.app{}", i)).collect();
        let allowed: BTreeSet<String> = installed.iter().take(19).cloned().collect();
        let store = Arc::new(MemoryStore::new(PolicyState {
            allowed,
            ..Default::default()
        }));

        let policy = AccessPolicy::open(store.clone(), &installed);

        let state = store.load().unwrap();
        assert_eq!(state.mode, Some(AccessMode::DenyList));
        assert!(state.denied.is_empty());
        assert!(state.allowed.is_empty());
        assert!(policy.is_enabled("com.app19"));

        assert!(!policy.migrate_if_oversized_allow_list(&installed).unwrap());
        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn test_small_allow_list_is_not_migrated() {
        let installed: BTreeSet<String> = (0..20).map(|i| format!("com.app{}", i)).collect();
        let allowed: BTreeSet<String> = installed.iter().take(18).cloned().collect();
        let policy = policy(PolicyState {
            allowed: allowed.clone(),
            ..Default::default()
        });

        assert!(!policy.migrate_if_oversized_allow_list(&installed).unwrap());
        assert_eq!(policy.snapshot(), Some(AccessList::Legacy(allowed)));
    }

    #[test]
    fn test_explicit_mode_is_never_migrated() {
        let installed = set(&["com.a"]);
        let mut list = AccessList::AllowList(set(&["com.a"]));
        assert!(!list.migrate_if_oversized(&installed));
        assert_eq!(list, AccessList::AllowList(set(&["com.a"])));
    }

    #[test]
    fn test_unreadable_store_call_sites_differ() {
        let policy = AccessPolicy::load(Arc::new(UnreadableStore));
        assert!(!policy.is_enabled("com.a"));
        assert!(policy.is_listed_enabled("com.a"));
        assert!(policy.toggle("com.a", true).is_err());
    }
}
