//! The single predicate deciding whether a worker may take a job.
//!
//! Both the synchronous claim path and the notification fan-out go through
//! [`MatchEngine::matches`], so "who gets woken" and "who can claim" never
//! disagree.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::scheduler::job::{Job, WorkerId, DEFAULT_SCOPE, WORKER_NODE_SCOPE_PREFIX};

/// Per-call affinity interest of a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AffinityFilter {
    /// Accept jobs regardless of their affinity tags.
    pub any: bool,
    /// Tags the worker is interested in when `any` is false.
    pub tags: BTreeSet<String>,
}

impl AffinityFilter {
    pub fn any() -> Self {
        Self {
            any: true,
            tags: BTreeSet::new(),
        }
    }

    pub fn tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            any: false,
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    pub fn accepts(&self, job_tags: &BTreeSet<String>) -> bool {
        self.any || !self.tags.is_disjoint(job_tags)
    }
}

/// Everything the predicate needs to know about the requesting worker,
/// captured at call time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerView {
    pub worker: WorkerId,
    pub scope: String,
    pub affinity: AffinityFilter,
    /// A worker bound to a named scope also takes unscoped jobs.
    pub accept_unscoped: bool,
}

impl WorkerView {
    pub fn new(worker: WorkerId, scope: impl Into<String>, affinity: AffinityFilter) -> Self {
        Self {
            worker,
            scope: scope.into(),
            affinity,
            accept_unscoped: false,
        }
    }

    pub fn accepting_unscoped(mut self, accept: bool) -> Self {
        self.accept_unscoped = accept;
        self
    }

    fn takes_unscoped(&self) -> bool {
        self.scope == DEFAULT_SCOPE || self.accept_unscoped
    }
}

/// Scope and affinity matching rules.
#[derive(Debug, Clone, Copy)]
pub struct MatchEngine {
    /// Route `WN_SCOPE:::<node>` jobs to an unbound worker named `<node>`.
    worker_node_scopes: bool,
}

impl Default for MatchEngine {
    fn default() -> Self {
        Self::new(true)
    }
}

impl MatchEngine {
    pub fn new(worker_node_scopes: bool) -> Self {
        Self { worker_node_scopes }
    }

    pub fn matches(&self, job: &Job, view: &WorkerView) -> bool {
        self.scope_matches(&job.scope, view) && view.affinity.accepts(&job.affinities)
    }

    pub fn scope_matches(&self, job_scope: &str, view: &WorkerView) -> bool {
        if job_scope == view.scope {
            return true;
        }
        if job_scope == DEFAULT_SCOPE {
            return view.takes_unscoped();
        }
        self.worker_node_scopes
            && view.scope == DEFAULT_SCOPE
            && job_scope
                .strip_prefix(WORKER_NODE_SCOPE_PREFIX)
                .is_some_and(|node| node == view.worker.node)
    }
}
