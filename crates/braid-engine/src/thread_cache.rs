use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use tracing::debug;

use braid_core::ids::SessionId;
use braid_core::settings::ThreadCacheSettings;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadBinding {
    pub external_thread_id: String,
    pub last_used_at: DateTime<Utc>,
}

/// Session to external-CLI-thread bindings, bounded by idle TTL and entry count.
#[derive(Clone)]
pub struct ToolThreadCache {
    entries: Cache<SessionId, ThreadBinding>,
}

impl ToolThreadCache {
    pub fn new(ttl: Duration, max_entries: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(max_entries)
                .time_to_idle(ttl)
                .eviction_listener(|session_id, _binding, cause| {
                    debug!(session_id = %session_id, ?cause, "thread binding evicted");
                })
                .build(),
        }
    }

    pub fn from_settings(settings: &ThreadCacheSettings) -> Self {
        Self::new(settings.ttl(), settings.max_entries)
    }

    pub fn bind(&self, session_id: &SessionId, external_thread_id: impl Into<String>) {
        self.entries.insert(
            session_id.clone(),
            ThreadBinding {
                external_thread_id: external_thread_id.into(),
                last_used_at: Utc::now(),
            },
        );
    }

    /// Returns the bound thread id and marks the binding as used.
    pub fn lookup(&self, session_id: &SessionId) -> Option<String> {
        let mut binding = self.entries.get(session_id)?;
        binding.last_used_at = Utc::now();
        let thread_id = binding.external_thread_id.clone();
        self.entries.insert(session_id.clone(), binding);
        Some(thread_id)
    }

    pub fn binding(&self, session_id: &SessionId) -> Option<ThreadBinding> {
        self.entries.get(session_id)
    }

    pub fn evict(&self, session_id: &SessionId) {
        self.entries.invalidate(session_id);
    }

    /// Apply pending expirations and evictions now.
    pub fn sweep(&self) {
        self.entries.run_pending_tasks();
    }

    pub fn len(&self) -> u64 {
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
