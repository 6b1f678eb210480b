//! Cached view of container lifecycle state.
//!
//! The cache records what the controller last *observed*; it is not a source
//! of truth and may be stale relative to the remote host (someone else may
//! have stopped or removed a container in the meantime). Entries never
//! expire on their own and are dropped only through explicit invalidation.
//!
//! `Removed` is terminal for a container name until the same name is seen
//! being created again.

use crate::host::{ContainerRef, HostId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Lifecycle state of one container as last observed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ContainerState {
    Unknown,
    Creating,
    Running,
    Stopped,
    Removed,
    Error(String),
}

impl ContainerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Removed)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Removed => write!(f, "removed"),
            Self::Error(detail) => write!(f, "error ({})", detail),
        }
    }
}

/// How a new observation came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Result of an operation that creates the container under this name
    Create,
    /// Any other operation or inspection
    Report,
}

/// A cached state and when it was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedState {
    pub state: ContainerState,
    pub observed_at: DateTime<Utc>,
}

/// One row of [`StateCache::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub host: HostId,
    pub container: ContainerRef,
    pub state: ContainerState,
    pub observed_at: DateTime<Utc>,
}

type Key = (HostId, ContainerRef);

/// Last observed state per (host, container).
#[derive(Debug, Default)]
pub struct StateCache {
    entries: DashMap<Key, CachedState>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, host: &HostId, container: &ContainerRef) -> Option<CachedState> {
        self.entries
            .get(&(host.clone(), container.clone()))
            .map(|entry| entry.value().clone())
    }

    /// Cached state, or `Unknown` if nothing was observed yet.
    pub fn state(&self, host: &HostId, container: &ContainerRef) -> ContainerState {
        self.get(host, container)
            .map(|cached| cached.state)
            .unwrap_or(ContainerState::Unknown)
    }

    /// Record an observation and return the state now cached.
    ///
    /// An observation of a removed container is ignored unless it shows the
    /// name being created again.
    pub fn observe(
        &self,
        host: &HostId,
        container: &ContainerRef,
        state: ContainerState,
        how: Observation,
    ) -> ContainerState {
        let mut entry = self
            .entries
            .entry((host.clone(), container.clone()))
            .or_insert_with(|| CachedState {
                state: ContainerState::Unknown,
                observed_at: Utc::now(),
            });

        let reuses_name = how == Observation::Create || state == ContainerState::Creating;
        if entry.state.is_terminal() && !reuses_name {
            debug!(
                "Ignoring {} for removed container {} on {}",
                state, container, host
            );
            return entry.state.clone();
        }

        if entry.state != state {
            debug!("{} on {}: {} -> {}", container, host, entry.state, state);
        }
        entry.state = state.clone();
        entry.observed_at = Utc::now();
        state
    }

    /// The runtime reported the container does not exist.
    ///
    /// Only containers already tracked move to `Removed`; unknown names are
    /// not added.
    pub fn mark_missing(&self, host: &HostId, container: &ContainerRef) -> Option<ContainerState> {
        let mut entry = self.entries.get_mut(&(host.clone(), container.clone()))?;
        entry.state = ContainerState::Removed;
        entry.observed_at = Utc::now();
        Some(ContainerState::Removed)
    }

    /// Forget one container.
    pub fn invalidate(&self, host: &HostId, container: &ContainerRef) -> bool {
        self.entries
            .remove(&(host.clone(), container.clone()))
            .is_some()
    }

    /// Forget every container on `host`.
    pub fn invalidate_host(&self, host: &HostId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(h, _), _| h != host);
        before - self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every cached entry, sorted by host then container.
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        let mut rows: Vec<_> = self
            .entries
            .iter()
            .map(|entry| {
                let (host, container) = entry.key().clone();
                CacheEntry {
                    host,
                    container,
                    state: entry.state.clone(),
                    observed_at: entry.observed_at,
                }
            })
            .collect();
        rows.sort_by(|a, b| (&a.host, &a.container).cmp(&(&b.host, &b.container)));
        rows
    }
}
