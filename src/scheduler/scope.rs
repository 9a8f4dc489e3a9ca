use std::collections::{BTreeSet, HashMap};

use crate::scheduler::job::{WorkerId, DEFAULT_SCOPE};

/// Worker identity to virtual scope bindings, plus the reverse index.
///
/// One instance lives for the lifetime of a broker. Bindings are never
/// evicted on their own; an empty scope removes the binding.
#[derive(Debug, Default)]
pub struct ScopeRegistry {
    bindings: HashMap<WorkerId, String>,
    members: HashMap<String, BTreeSet<WorkerId>>,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `worker` to `scope`, replacing any earlier binding.
    /// Binding to the default scope drops the entry.
    pub fn set_scope(&mut self, worker: &WorkerId, scope: &str) {
        if let Some(previous) = self.bindings.remove(worker) {
            if previous == scope {
                self.bindings.insert(worker.clone(), previous);
                return;
            }
            self.detach(worker, &previous);
        }

        if scope == DEFAULT_SCOPE {
            tracing::debug!(worker = %worker, "Scope binding reset to default");
            return;
        }

        self.bindings.insert(worker.clone(), scope.to_string());
        self.members
            .entry(scope.to_string())
            .or_default()
            .insert(worker.clone());
        tracing::debug!(worker = %worker, scope, "Scope bound");
    }

    /// Current scope of `worker`, or the default scope if it never bound one.
    pub fn get_scope(&self, worker: &WorkerId) -> &str {
        self.bindings
            .get(worker)
            .map(String::as_str)
            .unwrap_or(DEFAULT_SCOPE)
    }

    /// Workers currently bound to `scope`.
    pub fn workers_in(&self, scope: &str) -> Vec<&WorkerId> {
        self.members
            .get(scope)
            .map(|set| set.iter().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
        self.members.clear();
    }

    fn detach(&mut self, worker: &WorkerId, scope: &str) {
        if let Some(set) = self.members.get_mut(scope) {
            set.remove(worker);
            if set.is_empty() {
                self.members.remove(scope);
            }
        }
    }
}
