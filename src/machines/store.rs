// SPDX-License-Identifier: MIT
//! Machine definition records and their storage.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

/// Definition of one machine hosted on this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineRecord {
    pub uuid: String,
    pub name: String,
    pub memory_mb: u64,
    pub vcpus: u32,
    /// Node that owns the record.
    pub host: String,
    pub created_at: DateTime<Utc>,
}

/// Storage seam for machine records, injectable for tests.
#[async_trait]
pub trait MachineStore: Send + Sync {
    async fn exists(&self, uuid: &str) -> Result<bool>;
    async fn create(&self, record: &MachineRecord) -> Result<()>;
    async fn load(&self, uuid: &str) -> Result<Option<MachineRecord>>;
    /// Returns whether a record was actually removed.
    async fn remove(&self, uuid: &str) -> Result<bool>;
    async fn list(&self) -> Result<Vec<MachineRecord>>;
}

/// One pretty-printed JSON file per machine under the agent's data dir.
///
/// Record ids arrive pre-validated by the task pipeline; this store never
/// sees an id with path separators in it.
pub struct FsMachineStore {
    dir: PathBuf,
}

impl FsMachineStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, uuid: &str) -> PathBuf {
        self.dir.join(format!("{uuid}.json"))
    }
}

#[async_trait]
impl MachineStore for FsMachineStore {
    async fn exists(&self, uuid: &str) -> Result<bool> {
        Ok(fs::try_exists(self.record_path(uuid)).await?)
    }

    async fn create(&self, record: &MachineRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating machine dir {}", self.dir.display()))?;

        let path = self.record_path(&record.uuid);
        // Creators for one uuid are serialized by the provisioning guard, so
        // an existing file here is a settled record, never a half-write.
        if fs::try_exists(&path).await? {
            anyhow::bail!("machine record '{}' already exists", record.uuid);
        }
        let body = serde_json::to_string_pretty(record)?;

        // Atomic write: write to tmp, then rename.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body)
            .await
            .with_context(|| format!("writing machine record {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("committing machine record {}", path.display()))?;

        debug!(uuid = %record.uuid, name = %record.name, "machine record written");
        Ok(())
    }

    async fn load(&self, uuid: &str) -> Result<Option<MachineRecord>> {
        let path = self.record_path(uuid);
        let body = match fs::read_to_string(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading machine record {}", path.display()))
            }
        };
        let record = serde_json::from_str(&body)
            .with_context(|| format!("parsing machine record {}", path.display()))?;
        Ok(Some(record))
    }

    async fn remove(&self, uuid: &str) -> Result<bool> {
        let path = self.record_path(uuid);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(uuid, "machine record removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("removing machine record {}", path.display())),
        }
    }

    async fn list(&self) -> Result<Vec<MachineRecord>> {
        let mut records = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("listing machine dir {}", self.dir.display()))
            }
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let body = fs::read_to_string(&path).await?;
            match serde_json::from_str(&body) {
                Ok(record) => records.push(record),
                Err(e) => debug!(path = %path.display(), err = %e, "skipping unreadable record"),
            }
        }
        records.sort_by(|a: &MachineRecord, b: &MachineRecord| a.uuid.cmp(&b.uuid));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(uuid: &str) -> MachineRecord {
        MachineRecord {
            uuid: uuid.to_string(),
            name: format!("vm-{uuid}"),
            memory_mb: 2048,
            vcpus: 2,
            host: "station-test".to_string(),
            created_at: Utc::now(),
        }
    }

    fn store() -> FsMachineStore {
        FsMachineStore::new(tempfile::tempdir().unwrap().keep().join("machines"))
    }

    #[tokio::test]
    async fn create_then_load_roundtrips() {
        let store = store();
        let rec = record("bd4e9c");
        store.create(&rec).await.unwrap();

        assert!(store.exists("bd4e9c").await.unwrap());
        assert_eq!(store.load("bd4e9c").await.unwrap(), Some(rec));
        assert_eq!(store.load("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn create_refuses_to_overwrite() {
        let store = store();
        let original = record("bd4e9c");
        store.create(&original).await.unwrap();

        let mut replacement = record("bd4e9c");
        replacement.memory_mb = 8192;
        let err = store.create(&replacement).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(store.load("bd4e9c").await.unwrap(), Some(original));
    }

    #[tokio::test]
    async fn remove_reports_whether_anything_was_there() {
        let store = store();
        store.create(&record("bd4e9c")).await.unwrap();

        assert!(store.remove("bd4e9c").await.unwrap());
        assert!(!store.remove("bd4e9c").await.unwrap());
        assert!(!store.exists("bd4e9c").await.unwrap());
    }

    #[tokio::test]
    async fn list_is_sorted_and_skips_leftover_tmp_files() {
        let store = store();
        store.create(&record("bbb")).await.unwrap();
        store.create(&record("aaa")).await.unwrap();
        // A crashed write leaves a tmp file behind; list must ignore it.
        std::fs::write(store.record_path("zzz").with_extension("json.tmp"), "{").unwrap();

        let uuids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.uuid)
            .collect();
        assert_eq!(uuids, vec!["aaa", "bbb"]);
    }

    #[tokio::test]
    async fn empty_store_lists_nothing() {
        let store = store();
        assert!(store.list().await.unwrap().is_empty());
        assert!(!store.exists("anything").await.unwrap());
    }
}
