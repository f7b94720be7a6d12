//! Pluggable checkpoint / recovery provider (C11).
//!
//! SHA-256 hash-chained records, one append-only `.jsonl` file per agent,
//! write-then-flush persistence, and an integrity-verification walk over
//! the chain (§11 supplemented hash-chained checkpoint integrity feature).

use crate::callstack::ExecutionState;
use crate::error::CheckpointError;
use crate::identifiers::AgentID;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Per-agent checkpoint record (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub schema_version: u32,
    pub agent_id: String,
    pub checkpoint_id: String,
    pub created_at: DateTime<Utc>,
    pub execution_state: ExecutionState,
    pub last_directive: Option<String>,
    pub last_yield_kind: Option<String>,
    /// Hash of the previous record in this agent's chain, `None` for the
    /// first record.
    pub prev_hash: Option<String>,
    pub hash: String,
}

fn canonical_hash_input(
    agent_id: &str,
    checkpoint_id: &str,
    created_at: &DateTime<Utc>,
    execution_state: &ExecutionState,
    prev_hash: &Option<String>,
) -> String {
    format!(
        "{}|{}|{}|{}|{:?}",
        agent_id,
        checkpoint_id,
        created_at.to_rfc3339(),
        serde_json::to_string(execution_state).unwrap_or_default(),
        prev_hash,
    )
}

fn compute_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Program-level coordinator checkpoint (§6): references "latest known"
/// agent checkpoint ids, which may be stale relative to what each agent has
/// independently persisted since (§4.11 resume policy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramCheckpoint {
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub agent_checkpoint_refs: HashMap<String, String>,
    pub open_meetings: Vec<String>,
}

/// Pluggable checkpoint storage (§4.11). One filesystem provider
/// ([`FilesystemCheckpointProvider`]) is required; others can be layered on
/// for testing or alternate backends.
#[async_trait]
pub trait CheckpointProvider: Send + Sync {
    async fn save_checkpoint(&self, record: &CheckpointRecord) -> Result<(), CheckpointError>;
    async fn load_checkpoint(
        &self,
        agent_id: &AgentID,
        checkpoint_id: &str,
    ) -> Result<CheckpointRecord, CheckpointError>;
    /// Ordered oldest-to-newest.
    async fn list_checkpoints(&self, agent_id: &AgentID) -> Result<Vec<String>, CheckpointError>;
    async fn latest_checkpoint(
        &self,
        agent_id: &AgentID,
    ) -> Result<Option<CheckpointRecord>, CheckpointError>;
    async fn delete_old(&self, agent_id: &AgentID, keep_last_n: usize) -> Result<(), CheckpointError>;
    async fn save_program_checkpoint(&self, checkpoint: &ProgramCheckpoint) -> Result<(), CheckpointError>;
    async fn load_program_checkpoint(&self) -> Result<Option<ProgramCheckpoint>, CheckpointError>;
}

/// Filesystem-backed provider: one append-only `.jsonl` file per agent
/// (`<storage_path>/<agent_id>.jsonl`), and a single `program.json` for the
/// coordinator checkpoint. Writes are write-temp-then-rename for atomicity
/// (§5 shared-resource guarantee).
pub struct FilesystemCheckpointProvider {
    storage_path: PathBuf,
    max_checkpoint_size_bytes: usize,
}

impl FilesystemCheckpointProvider {
    pub fn new(storage_path: impl Into<PathBuf>, max_checkpoint_size_mb: usize) -> Self {
        FilesystemCheckpointProvider {
            storage_path: storage_path.into(),
            max_checkpoint_size_bytes: max_checkpoint_size_mb * 1024 * 1024,
        }
    }

    fn agent_chain_path(&self, agent_id: &AgentID) -> PathBuf {
        self.storage_path.join(format!("{}.jsonl", agent_id.as_str()))
    }

    fn program_checkpoint_path(&self) -> PathBuf {
        self.storage_path.join("program.json")
    }

    async fn read_chain(&self, agent_id: &AgentID) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        let path = self.agent_chain_path(agent_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&path).await?;
        let mut records = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str::<CheckpointRecord>(line)?);
        }
        Ok(records)
    }

    async fn write_temp_then_rename(&self, path: &Path, contents: &str) -> Result<(), CheckpointError> {
        tokio::fs::create_dir_all(&self.storage_path).await?;
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, contents).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    /// Walks an agent's chain verifying every record's hash matches its
    /// recomputed value and that `prev_hash` links correctly. The oldest
    /// surviving record is exempt from the `prev_hash` link check: `delete_old`
    /// prunes the head of the chain without rewriting it, so a legitimately
    /// pruned chain's first record still points at a hash that is no longer
    /// on disk. Its own content hash is still verified, so this only widens
    /// what "broken" means for the record pruning is expected to leave
    /// dangling, not for any other record in the chain.
    pub async fn verify_integrity(&self, agent_id: &AgentID) -> Result<bool, CheckpointError> {
        let records = self.read_chain(agent_id).await?;
        let mut expected_prev: Option<String> = None;
        for (i, record) in records.iter().enumerate() {
            if i > 0 && record.prev_hash != expected_prev {
                log::warn!(
                    "checkpoint chain broken for agent '{}' at '{}': prev_hash mismatch",
                    agent_id.as_str(),
                    record.checkpoint_id
                );
                return Ok(false);
            }
            let input = canonical_hash_input(
                &record.agent_id,
                &record.checkpoint_id,
                &record.created_at,
                &record.execution_state,
                &record.prev_hash,
            );
            if compute_hash(&input) != record.hash {
                log::warn!(
                    "checkpoint chain corrupted for agent '{}' at '{}': hash mismatch",
                    agent_id.as_str(),
                    record.checkpoint_id
                );
                return Ok(false);
            }
            expected_prev = Some(record.hash.clone());
        }
        Ok(true)
    }
}

#[async_trait]
impl CheckpointProvider for FilesystemCheckpointProvider {
    async fn save_checkpoint(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let serialized = serde_json::to_string(record)?;
        if serialized.len() > self.max_checkpoint_size_bytes {
            return Err(CheckpointError::CheckpointTooLarge {
                limit_bytes: self.max_checkpoint_size_bytes,
                actual_bytes: serialized.len(),
            });
        }
        let path = self.agent_chain_path(&AgentID::new(record.agent_id.clone()));
        tokio::fs::create_dir_all(&self.storage_path).await?;
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(serialized.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        agent_id: &AgentID,
        checkpoint_id: &str,
    ) -> Result<CheckpointRecord, CheckpointError> {
        let records = self.read_chain(agent_id).await?;
        records
            .into_iter()
            .find(|r| r.checkpoint_id == checkpoint_id)
            .ok_or_else(|| {
                CheckpointError::RecoveryFailed(format!(
                    "no checkpoint {} for agent {}",
                    checkpoint_id,
                    agent_id.as_str()
                ))
            })
    }

    async fn list_checkpoints(&self, agent_id: &AgentID) -> Result<Vec<String>, CheckpointError> {
        Ok(self
            .read_chain(agent_id)
            .await?
            .into_iter()
            .map(|r| r.checkpoint_id)
            .collect())
    }

    async fn latest_checkpoint(
        &self,
        agent_id: &AgentID,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        Ok(self.read_chain(agent_id).await?.into_iter().last())
    }

    async fn delete_old(&self, agent_id: &AgentID, keep_last_n: usize) -> Result<(), CheckpointError> {
        let mut records = self.read_chain(agent_id).await?;
        if records.len() <= keep_last_n {
            return Ok(());
        }
        let drop_count = records.len() - keep_last_n;
        records.drain(..drop_count);
        log::debug!("pruned {} checkpoint(s) for agent '{}'", drop_count, agent_id.as_str());
        let serialized = records
            .iter()
            .map(|r| serde_json::to_string(r).map_err(CheckpointError::from))
            .collect::<Result<Vec<_>, _>>()?
            .join("\n");
        let path = self.agent_chain_path(agent_id);
        self.write_temp_then_rename(&path, &format!("{}\n", serialized)).await
    }

    async fn save_program_checkpoint(&self, checkpoint: &ProgramCheckpoint) -> Result<(), CheckpointError> {
        let serialized = serde_json::to_string_pretty(checkpoint)?;
        self.write_temp_then_rename(&self.program_checkpoint_path(), &serialized)
            .await
    }

    async fn load_program_checkpoint(&self) -> Result<Option<ProgramCheckpoint>, CheckpointError> {
        let path = self.program_checkpoint_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

/// Builds the next record in an agent's chain, hashing it against the
/// previous record's hash (or `None` for the first).
pub fn build_next_record(
    agent_id: &AgentID,
    checkpoint_id: impl Into<String>,
    execution_state: ExecutionState,
    last_directive: Option<String>,
    last_yield_kind: Option<String>,
    prev_hash: Option<String>,
    created_at: DateTime<Utc>,
) -> CheckpointRecord {
    let checkpoint_id = checkpoint_id.into();
    let input = canonical_hash_input(agent_id.as_str(), &checkpoint_id, &created_at, &execution_state, &prev_hash);
    let hash = compute_hash(&input);
    CheckpointRecord {
        schema_version: 1,
        agent_id: agent_id.as_str().to_string(),
        checkpoint_id,
        created_at,
        execution_state,
        last_directive,
        last_yield_kind,
        prev_hash,
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn save_and_load_round_trips() {
        let dir = tempdir().unwrap();
        let provider = FilesystemCheckpointProvider::new(dir.path(), 8);
        let agent_id = AgentID::new("a1");
        let record = build_next_record(
            &agent_id,
            "cp1",
            ExecutionState::new(),
            None,
            None,
            None,
            Utc::now(),
        );
        provider.save_checkpoint(&record).await.unwrap();
        let loaded = provider.load_checkpoint(&agent_id, "cp1").await.unwrap();
        assert_eq!(loaded.checkpoint_id, "cp1");
    }

    #[tokio::test]
    async fn latest_checkpoint_is_the_last_appended() {
        let dir = tempdir().unwrap();
        let provider = FilesystemCheckpointProvider::new(dir.path(), 8);
        let agent_id = AgentID::new("agent-1000");
        let mut prev_hash = None;
        for i in 1..=7 {
            let record = build_next_record(
                &agent_id,
                format!("cp{}", i),
                ExecutionState::new(),
                None,
                None,
                prev_hash.clone(),
                Utc::now(),
            );
            prev_hash = Some(record.hash.clone());
            provider.save_checkpoint(&record).await.unwrap();
        }
        let latest = provider.latest_checkpoint(&agent_id).await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, "cp7");
    }

    #[tokio::test]
    async fn integrity_detects_tampering() {
        let dir = tempdir().unwrap();
        let provider = FilesystemCheckpointProvider::new(dir.path(), 8);
        let agent_id = AgentID::new("a1");
        let record = build_next_record(&agent_id, "cp1", ExecutionState::new(), None, None, None, Utc::now());
        provider.save_checkpoint(&record).await.unwrap();
        assert!(provider.verify_integrity(&agent_id).await.unwrap());

        let path = provider.agent_chain_path(&agent_id);
        let mut tampered: CheckpointRecord =
            serde_json::from_str(&tokio::fs::read_to_string(&path).await.unwrap().lines().next().unwrap()).unwrap();
        tampered.hash = "deadbeef".to_string();
        tokio::fs::write(&path, format!("{}\n", serde_json::to_string(&tampered).unwrap()))
            .await
            .unwrap();
        assert!(!provider.verify_integrity(&agent_id).await.unwrap());
    }

    #[tokio::test]
    async fn oversize_checkpoint_fails() {
        let dir = tempdir().unwrap();
        let provider = FilesystemCheckpointProvider::new(dir.path(), 0);
        let agent_id = AgentID::new("a1");
        let record = build_next_record(&agent_id, "cp1", ExecutionState::new(), None, None, None, Utc::now());
        let result = provider.save_checkpoint(&record).await;
        assert!(matches!(result, Err(CheckpointError::CheckpointTooLarge { .. })));
    }

    #[tokio::test]
    async fn delete_old_keeps_last_n() {
        let dir = tempdir().unwrap();
        let provider = FilesystemCheckpointProvider::new(dir.path(), 8);
        let agent_id = AgentID::new("a1");
        let mut prev_hash = None;
        for i in 1..=5 {
            let record = build_next_record(&agent_id, format!("cp{}", i), ExecutionState::new(), None, None, prev_hash.clone(), Utc::now());
            prev_hash = Some(record.hash.clone());
            provider.save_checkpoint(&record).await.unwrap();
        }
        provider.delete_old(&agent_id, 2).await.unwrap();
        let remaining = provider.list_checkpoints(&agent_id).await.unwrap();
        assert_eq!(remaining, vec!["cp4".to_string(), "cp5".to_string()]);
        assert!(provider.verify_integrity(&agent_id).await.unwrap());
    }
}
