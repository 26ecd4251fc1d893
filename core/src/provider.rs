//! Provider-side records: profile dimension, program events and the
//! engagement activity feed consumed from CRM / call-center systems.

use crate::types::{ProgramId, ProviderKey, SnapshotDate, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub provider_id:        ProviderKey,
    pub npi:                Option<String>,
    pub state:              Option<String>,
    pub city:               Option<String>,
    pub onboarding_date:    Option<SnapshotDate>,
    pub onboarding_channel: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgramEventKind {
    Enrolled,
    Paused,
    Resumed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramEvent {
    pub provider_id: ProviderKey,
    pub program_id:  ProgramId,
    pub kind:        ProgramEventKind,
    pub event_date:  SnapshotDate,
}

// ── Engagement feed ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngagementChannel {
    Crm,
    CallCenter,
}

impl EngagementChannel {
    pub const ALL: [EngagementChannel; 2] = [Self::Crm, Self::CallCenter];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementActivity {
    pub provider_id: ProviderKey,
    pub channel:     EngagementChannel,
    pub activity:    String,
    pub occurred_at: Timestamp,
}

/// CRM / call-center activity, owned by an external system.
pub trait EngagementFeed: Send + Sync {
    /// Every activity recorded for `provider_id` strictly before `before`,
    /// ordered by timestamp.
    fn activities_before(&self, provider_id: &str, before: Timestamp) -> Vec<EngagementActivity>;
}

/// An engagement feed held in memory, indexed by provider.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEngagementFeed {
    by_provider: HashMap<ProviderKey, Vec<EngagementActivity>>,
}

impl InMemoryEngagementFeed {
    pub fn new(activities: impl IntoIterator<Item = EngagementActivity>) -> Self {
        let mut by_provider: HashMap<ProviderKey, Vec<EngagementActivity>> = HashMap::new();
        for a in activities {
            by_provider.entry(a.provider_id.clone()).or_default().push(a);
        }
        for list in by_provider.values_mut() {
            list.sort_by_key(|a| a.occurred_at);
        }
        Self { by_provider }
    }

    pub fn len(&self) -> usize {
        self.by_provider.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EngagementFeed for InMemoryEngagementFeed {
    fn activities_before(&self, provider_id: &str, before: Timestamp) -> Vec<EngagementActivity> {
        match self.by_provider.get(provider_id) {
            Some(list) => {
                let end = list.partition_point(|a| a.occurred_at < before);
                list[..end].to_vec()
            }
            None => Vec::new(),
        }
    }
}
