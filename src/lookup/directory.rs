use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// One user as seen by the directory sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// Protocol identifier returned by lookups, e.g. `@dwho:example.com`.
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// Source of the addresses to index (LDAP, SQL user table, ...).
#[async_trait]
pub trait Directory: Send + Sync {
    async fn entries(&self) -> Result<Vec<DirectoryEntry>>;
}

/// Fixed list of entries, optionally read from a JSON array on disk.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    entries: Vec<DirectoryEntry>,
}

impl StaticDirectory {
    pub fn new(entries: Vec<DirectoryEntry>) -> Self {
        Self { entries }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read directory file {}", path.display()))?;
        let entries: Vec<DirectoryEntry> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse directory file {}", path.display()))?;
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn entries(&self) -> Result<Vec<DirectoryEntry>> {
        Ok(self.entries.clone())
    }
}
