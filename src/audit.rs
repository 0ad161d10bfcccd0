use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::store::FolderId;

/// One recorded engine operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub op: Operation,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tale_id: Option<FolderId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub subject_id: Option<FolderId>,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    VersionCreate,
    VersionRename,
    VersionDelete,
    VersionRestore,
    RunCreate,
    RunRename,
    RunDelete,
    RunStatus,
    RunStart,
    Fork,
    TaleCreate,
    TaleRemove,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operation::VersionCreate => "version.create",
            Operation::VersionRename => "version.rename",
            Operation::VersionDelete => "version.delete",
            Operation::VersionRestore => "version.restore",
            Operation::RunCreate => "run.create",
            Operation::RunRename => "run.rename",
            Operation::RunDelete => "run.delete",
            Operation::RunStatus => "run.status",
            Operation::RunStart => "run.start",
            Operation::Fork => "fork",
            Operation::TaleCreate => "tale.create",
            Operation::TaleRemove => "tale.remove",
        };
        f.write_str(s)
    }
}

/// Bounded in-memory log of engine operations, oldest dropped first.
pub struct AuditLog {
    events: Mutex<VecDeque<AuditEvent>>,
    max_size: usize,
}

impl AuditLog {
    pub fn new(max_size: usize) -> Self {
        AuditLog { events: Mutex::new(VecDeque::new()), max_size }
    }

    pub fn record(
        &self,
        op: Operation,
        tale_id: Option<&FolderId>,
        subject_id: Option<&FolderId>,
        detail: impl Into<String>,
    ) {
        let event = AuditEvent {
            timestamp: Utc::now(),
            op,
            tale_id: tale_id.cloned(),
            subject_id: subject_id.cloned(),
            detail: detail.into(),
        };
        log::debug!("{} {}", event.op, event.detail);

        let Ok(mut events) = self.events.lock() else {
            return;
        };
        events.push_back(event);
        while events.len() > self.max_size {
            events.pop_front();
        }
    }

    pub fn recent(&self, n: usize) -> Vec<AuditEvent> {
        let Ok(events) = self.events.lock() else {
            return Vec::new();
        };
        events.iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One JSON object per line.
    pub fn export_jsonl(&self) -> String {
        let Ok(events) = self.events.lock() else {
            return String::new();
        };
        events
            .iter()
            .map(|e| serde_json::to_string(e).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        AuditLog::new(10_000)
    }
}
