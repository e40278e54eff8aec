use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};

use crate::store::write_atomic;

/// Message body carried through the generation queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Job identifier.
    pub job_id: String,
    /// Card-generation prompt.
    pub prompt: String,
    /// Kiosk user number.
    pub user_number: u32,
    /// Display name for the kiosk UI.
    pub display_name: String,
    /// Opaque device identifier.
    pub device_id: String,
    /// Quota session current at intake time.
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    seq: u64,
    body: QueueMessage,
    #[serde(default)]
    invisible_until_ms: i64,
    #[serde(default)]
    receive_count: u32,
}

/// One received message. Not acknowledging it puts it back on the queue
/// after the visibility window.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Queue sequence number; pass to [`JobQueue::ack`].
    pub seq: u64,
    /// Message body.
    pub message: QueueMessage,
    /// How many times this message has been delivered, this one included.
    pub receive_count: u32,
}

/// Durable FIFO queue with hidden-then-redelivered semantics.
///
/// Sequence numbers are assigned at send and strictly increase; `receive`
/// returns the oldest *visible* messages in sequence order and hides them for
/// the visibility window. Messages never acknowledged become visible again by
/// timestamp comparison alone.
#[derive(Debug)]
pub struct JobQueue {
    dir: PathBuf,
    visibility: Duration,
    state: Mutex<QueueState>,
    pub(crate) arrived: Notify,
}

#[derive(Debug, Default)]
struct QueueState {
    next_seq: u64,
    messages: BTreeMap<u64, StoredMessage>,
}

impl JobQueue {
    /// Open (and if needed recover) a queue rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>, visibility: Duration) -> anyhow::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut state = QueueState::default();
        let mut reader = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read(&path).await?;
            let message: StoredMessage = serde_json::from_slice(&raw)?;
            state.next_seq = state.next_seq.max(message.seq + 1);
            state.messages.insert(message.seq, message);
        }

        Ok(Self {
            dir,
            visibility,
            state: Mutex::new(state),
            arrived: Notify::new(),
        })
    }

    fn path_for(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{seq:020}.json"))
    }

    /// Append a message and wake any waiting consumer.
    pub async fn send(&self, message: QueueMessage) -> anyhow::Result<u64> {
        let stored = {
            let mut state = self.state.lock().await;
            let seq = state.next_seq;
            state.next_seq += 1;
            let stored = StoredMessage {
                seq,
                body: message,
                invisible_until_ms: 0,
                receive_count: 0,
            };
            state.messages.insert(seq, stored.clone());
            stored
        };
        write_atomic(&self.path_for(stored.seq), &serde_json::to_vec_pretty(&stored)?).await?;
        self.arrived.notify_one();
        Ok(stored.seq)
    }

    /// Receive up to `max` visible messages, oldest first, hiding each for
    /// the visibility window.
    pub async fn receive(&self, max: usize) -> anyhow::Result<Vec<Delivery>> {
        let now = Utc::now().timestamp_millis();
        let hidden_until = now + self.visibility.as_millis() as i64;

        let mut taken = Vec::new();
        {
            let mut state = self.state.lock().await;
            for stored in state.messages.values_mut() {
                if taken.len() >= max {
                    break;
                }
                if stored.invisible_until_ms > now {
                    continue;
                }
                stored.invisible_until_ms = hidden_until;
                stored.receive_count += 1;
                taken.push(stored.clone());
            }
        }

        let mut deliveries = Vec::with_capacity(taken.len());
        for stored in taken {
            write_atomic(&self.path_for(stored.seq), &serde_json::to_vec_pretty(&stored)?).await?;
            deliveries.push(Delivery {
                seq: stored.seq,
                message: stored.body,
                receive_count: stored.receive_count,
            });
        }
        Ok(deliveries)
    }

    /// Acknowledge (delete) a message; returns whether it still existed.
    pub async fn ack(&self, seq: u64) -> anyhow::Result<bool> {
        let existed = {
            let mut state = self.state.lock().await;
            state.messages.remove(&seq).is_some()
        };
        if existed {
            match tokio::fs::remove_file(self.path_for(seq)).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(existed)
    }

    /// Total messages on the queue, visible or hidden.
    pub async fn depth(&self) -> usize {
        self.state.lock().await.messages.len()
    }
}
