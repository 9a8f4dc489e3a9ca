use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scope tag of jobs and workers that never declared one.
pub const DEFAULT_SCOPE: &str = "";

/// Prefix of scopes that address a single worker node by name.
pub const WORKER_NODE_SCOPE_PREFIX: &str = "WN_SCOPE:::";

pub type JobId = Uuid;

/// Identity a client presents: node name plus session token.
///
/// Caller supplied; uniqueness is not validated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId {
    pub node: String,
    pub session: String,
}

impl WorkerId {
    pub fn new(node: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            session: session.into(),
        }
    }

    /// The scope that addresses this worker node directly.
    pub fn node_scope(&self) -> String {
        format!("{}{}", WORKER_NODE_SCOPE_PREFIX, self.node)
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.node, self.session)
    }
}

/// A pending unit of work. Immutable once created; ownership moves to the
/// worker that claims it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: String,
    pub scope: String,
    pub affinities: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(payload: String, scope: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            scope: scope.into(),
            affinities: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_affinities<I, S>(mut self, affinities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.affinities = affinities.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_unscoped(&self) -> bool {
        self.scope == DEFAULT_SCOPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_defaults() {
        let job = Job::new("blah".to_string(), DEFAULT_SCOPE);
        assert!(job.is_unscoped());
        assert!(job.affinities.is_empty());
        assert_eq!(job.payload, "blah");
    }

    #[test]
    fn node_scope_uses_prefix() {
        let worker = WorkerId::new("test_wn", "session");
        assert_eq!(worker.node_scope(), "WN_SCOPE:::test_wn");
        assert_eq!(worker.to_string(), "test_wn/session");
    }

    #[test]
    fn job_ids_are_unique() {
        let a = Job::new("a".to_string(), "s");
        let b = Job::new("a".to_string(), "s");
        assert_ne!(a.id, b.id);
    }
}
