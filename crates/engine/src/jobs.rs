use std::fmt;
use std::path::PathBuf;

use cardforge_core::ClientId;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::write_atomic;

/// Lifecycle states of a generation job.
///
/// Transitions run `queued -> processing -> {completed, failed}`; terminal
/// writes are idempotent and regressions are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted and enqueued, not yet attempted.
    Queued,
    /// A dispatcher invocation is (or was) working on it.
    Processing,
    /// Finished; `artifact_key` points at the result.
    Completed,
    /// Finished with a terminal error.
    Failed,
}

impl JobStatus {
    /// Whether the status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Durable per-job record, authoritative for status polls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRecord {
    /// Job identifier (UUID).
    pub job_id: String,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// The card-generation prompt.
    pub prompt: String,
    /// Quota session current at intake time.
    pub session_id: String,
    /// Client IP at intake time.
    pub client_ip: String,
    /// Opaque device identifier.
    pub device_id: String,
    /// Kiosk user number.
    pub user_number: u32,
    /// Display name for the kiosk UI.
    pub display_name: String,
    /// Result artifact key, set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_key: Option<String>,
    /// Terminal error text, set on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Creation time, ISO-8601 UTC.
    pub created_at: String,
    /// Last transition time, ISO-8601 UTC.
    pub updated_at: String,
    /// Completion time, ISO-8601 UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

impl JobRecord {
    /// Create a fresh `queued` record with a new job id.
    pub fn new(
        prompt: impl Into<String>,
        session_id: impl Into<String>,
        client: &ClientId,
        user_number: u32,
        display_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            job_id: Uuid::new_v4().to_string(),
            status: JobStatus::Queued,
            prompt: prompt.into(),
            session_id: session_id.into(),
            client_ip: client.ip.clone(),
            device_id: client.device_id.clone(),
            user_number,
            display_name: display_name.into(),
            artifact_key: None,
            error: None,
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
        }
    }
}

/// A status write that would move a record backwards.
#[derive(Debug, thiserror::Error)]
#[error("job {job_id}: cannot transition {from} -> {to}")]
pub struct InvalidTransition {
    /// Affected job.
    pub job_id: String,
    /// Status on disk.
    pub from: JobStatus,
    /// Rejected target status.
    pub to: JobStatus,
}

/// Single-item-keyed store of [`JobRecord`]s (one JSON document per job).
#[derive(Debug)]
pub struct JobStore {
    dir: PathBuf,
}

impl JobStore {
    /// Open a store rooted at `dir` (created lazily on first write).
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, job_id: &str) -> Option<PathBuf> {
        // Job ids are UUIDs we minted; anything else is not a record.
        if job_id.is_empty()
            || !job_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return None;
        }
        Some(self.dir.join(format!("{job_id}.json")))
    }

    /// Persist a freshly created record.
    pub async fn create(&self, record: &JobRecord) -> anyhow::Result<()> {
        let path = self
            .path_for(&record.job_id)
            .ok_or_else(|| anyhow::anyhow!("invalid job id: {:?}", record.job_id))?;
        write_atomic(&path, &serde_json::to_vec_pretty(record)?).await
    }

    /// Load a record, or `None` if it does not exist.
    pub async fn get(&self, job_id: &str) -> anyhow::Result<Option<JobRecord>> {
        let Some(path) = self.path_for(job_id) else {
            return Ok(None);
        };
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Mark a job as `processing`.
    pub async fn mark_processing(&self, job_id: &str) -> anyhow::Result<JobRecord> {
        self.transition(job_id, JobStatus::Processing, |_| {}).await
    }

    /// Mark a job as `completed` with its result artifact.
    pub async fn mark_completed(
        &self,
        job_id: &str,
        artifact_key: &str,
    ) -> anyhow::Result<JobRecord> {
        let artifact_key = artifact_key.to_string();
        self.transition(job_id, JobStatus::Completed, move |record| {
            record.artifact_key = Some(artifact_key.clone());
            record.completed_at = Some(Utc::now().to_rfc3339());
        })
        .await
    }

    /// Mark a job as `failed` with a reason.
    pub async fn mark_failed(&self, job_id: &str, error: &str) -> anyhow::Result<JobRecord> {
        let error = error.to_string();
        self.transition(job_id, JobStatus::Failed, move |record| {
            record.error = Some(error.clone());
        })
        .await
    }

    async fn transition(
        &self,
        job_id: &str,
        to: JobStatus,
        apply: impl Fn(&mut JobRecord),
    ) -> anyhow::Result<JobRecord> {
        let mut record = self
            .get(job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("unknown job: {job_id}"))?;

        if record.status == to && to.is_terminal() {
            // Idempotent terminal write; leave the stored record untouched.
            return Ok(record);
        }
        if !allowed(record.status, to) {
            return Err(InvalidTransition {
                job_id: job_id.to_string(),
                from: record.status,
                to,
            }
            .into());
        }

        record.status = to;
        record.updated_at = Utc::now().to_rfc3339();
        apply(&mut record);

        let path = self
            .path_for(job_id)
            .ok_or_else(|| anyhow::anyhow!("invalid job id: {job_id:?}"))?;
        write_atomic(&path, &serde_json::to_vec_pretty(&record)?).await?;
        Ok(record)
    }
}

fn allowed(from: JobStatus, to: JobStatus) -> bool {
    matches!(
        (from, to),
        (JobStatus::Queued, JobStatus::Processing)
            | (JobStatus::Queued, JobStatus::Failed)
            | (JobStatus::Processing, JobStatus::Processing)
            | (JobStatus::Processing, JobStatus::Completed)
            | (JobStatus::Processing, JobStatus::Failed)
    )
}
