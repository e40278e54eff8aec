use std::sync::Arc;

use cardforge_core::limits::Usage;
use cardforge_core::session::{
    card_key, override_number_in_key, pending_marker_key, print_key, video_key,
};
use cardforge_core::{ArtifactKind, QuotaKind, QuotaLimits, Remaining, SessionId};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::store::{ArtifactMeta, ObjectStore};

const PROMPT_EXCERPT_LEN: usize = 100;

/// Outcome of a quota check: the session the caller is currently in and
/// whether one more artifact of the requested kind is allowed.
#[derive(Debug, Clone)]
pub struct QuotaDecision {
    /// Session current at decision time.
    pub session: SessionId,
    /// Whether the request is within the limit.
    pub allowed: bool,
    /// Remaining counts for the session.
    pub remaining: Remaining,
}

/// Quota and session accounting derived from the artifact store.
///
/// There is no separate counter: artifact names are the ledger. The current
/// session is the pending-override marker when present, otherwise the highest
/// override number observed across all artifact prefixes for the IP. Usage is
/// a prefix count, so state self-heals from the objects themselves.
#[derive(Debug, Clone)]
pub struct SessionLedger {
    store: Arc<ObjectStore>,
    limits: QuotaLimits,
}

impl SessionLedger {
    /// Build a ledger over `store` with configured per-session limits.
    pub fn new(store: Arc<ObjectStore>, limits: QuotaLimits) -> Self {
        Self { store, limits }
    }

    /// Configured per-session limits.
    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    /// Read the pending-override marker for an IP, if any.
    pub async fn pending_override(&self, ip: &str) -> anyhow::Result<Option<u32>> {
        let Some(raw) = self.store.get(&pending_marker_key(ip)).await? else {
            return Ok(None);
        };
        match String::from_utf8_lossy(&raw).trim().parse::<u32>() {
            Ok(number) if number >= 1 => Ok(Some(number)),
            _ => {
                warn!(ip, "ignoring unreadable pending-override marker");
                Ok(None)
            }
        }
    }

    /// Highest override number recorded by any artifact for an IP (0 when
    /// the IP has never produced anything).
    async fn recorded_override(&self, ip: &str) -> anyhow::Result<u32> {
        let mut highest = 0;
        for kind in [ArtifactKind::Card, ArtifactKind::Video, ArtifactKind::Print] {
            let prefix = format!("{}/{ip}_override", kind.folder());
            for key in self.store.list(&prefix).await? {
                if let Some(number) = override_number_in_key(&key) {
                    highest = highest.max(number);
                }
            }
        }
        Ok(highest)
    }

    /// Resolve the session the caller is currently in.
    ///
    /// A pending-override marker takes precedence; otherwise the highest
    /// override observed in artifact names (floored at 1).
    pub async fn current_session(&self, ip: &str) -> anyhow::Result<SessionId> {
        if let Some(pending) = self.pending_override(ip).await? {
            debug!(ip, pending, "session resolved from pending override");
            return Ok(SessionId::new(ip, pending));
        }
        let recorded = self.recorded_override(ip).await?;
        Ok(SessionId::new(ip, recorded.max(1)))
    }

    /// Count artifacts of each kind produced by a session.
    pub async fn usage(&self, session: &SessionId) -> anyhow::Result<Usage> {
        Ok(Usage {
            cards: self.store.count(&format!("cards/{session}_")).await?,
            videos: self.store.count(&format!("videos/{session}_")).await?,
            prints: self.store.count(&format!("print-queue/{session}_")).await?,
        })
    }

    /// Current session and its remaining quota for an IP.
    pub async fn remaining_for(&self, ip: &str) -> anyhow::Result<(SessionId, Remaining)> {
        let session = self.current_session(ip).await?;
        let usage = self.usage(&session).await?;
        Ok((session, self.limits.remaining(&usage)))
    }

    /// Decide whether one more artifact of `kind` fits the caller's session.
    pub async fn check_quota(&self, ip: &str, kind: QuotaKind) -> anyhow::Result<QuotaDecision> {
        let session = self.current_session(ip).await?;
        let usage = self.usage(&session).await?;
        Ok(QuotaDecision {
            allowed: usage.get(kind) < self.limits.get(kind),
            remaining: self.limits.remaining(&usage),
            session,
        })
    }

    /// Staff override: open the next session for an IP.
    ///
    /// The new number is derived from *recorded* artifacts only, so pressing
    /// the button repeatedly before any artifact lands advances the session
    /// once, not once per press. The marker realizes the `pending` state and
    /// is consumed by the first artifact written for the new session.
    pub async fn apply_override(&self, ip: &str) -> anyhow::Result<(u32, SessionId)> {
        let stable = self.recorded_override(ip).await?.max(1);
        let next = stable + 1;
        self.store
            .put(&pending_marker_key(ip), next.to_string().as_bytes(), None)
            .await?;
        info!(ip, from = stable, to = next, "staff override applied");
        Ok((next, SessionId::new(ip, next)))
    }

    async fn consume_pending(&self, session: &SessionId) -> anyhow::Result<()> {
        // Only the session the marker opened may consume it; an artifact
        // landing late for an older session must not cancel the override.
        if self.pending_override(session.ip()).await? == Some(session.number()) {
            self.store.delete(&pending_marker_key(session.ip())).await?;
            debug!(session = %session, "pending-override marker consumed");
        }
        Ok(())
    }

    /// Next card sequence number for a session.
    pub async fn next_card_number(&self, session: &SessionId) -> anyhow::Result<u32> {
        Ok(self.store.count(&format!("cards/{session}_card_")).await? + 1)
    }

    /// Next video sequence number for a session.
    pub async fn next_video_number(&self, session: &SessionId) -> anyhow::Result<u32> {
        Ok(self.store.count(&format!("videos/{session}_video_")).await? + 1)
    }

    /// Next print-queue position for a session.
    ///
    /// Prints are sequenced per session, not per card: the counter is the
    /// number of existing `_print_` artifacts plus one.
    pub async fn next_print_number(&self, session: &SessionId) -> anyhow::Result<u32> {
        let keys = self
            .store
            .list(&format!("print-queue/{session}_card_"))
            .await?;
        let prints = keys.iter().filter(|key| key.contains("_print_")).count() as u32;
        Ok(prints + 1)
    }

    /// Store a card artifact under the next sequence number.
    pub async fn store_card(
        &self,
        session: &SessionId,
        bytes: &[u8],
        username: &str,
        prompt: &str,
        job_id: Option<&str>,
    ) -> anyhow::Result<String> {
        let number = self.next_card_number(session).await?;
        let key = card_key(session, number);
        let meta = self.meta(session, username, prompt, job_id, Some(number), None);
        self.store.put(&key, bytes, Some(&meta)).await?;
        self.consume_pending(session).await?;
        info!(session = %session, %key, "card artifact stored");
        Ok(key)
    }

    /// Store a video artifact under the next sequence number.
    pub async fn store_video(
        &self,
        session: &SessionId,
        bytes: &[u8],
        username: &str,
        prompt: &str,
    ) -> anyhow::Result<String> {
        let number = self.next_video_number(session).await?;
        let key = video_key(session, number);
        let meta = self.meta(session, username, prompt, None, Some(number), None);
        self.store.put(&key, bytes, Some(&meta)).await?;
        self.consume_pending(session).await?;
        info!(session = %session, %key, "video artifact stored");
        Ok(key)
    }

    /// Store a print artifact for `card_number`, assigning the next
    /// print-queue position. Returns the key and the assigned position.
    pub async fn store_print(
        &self,
        session: &SessionId,
        card_number: u32,
        bytes: &[u8],
        username: &str,
        prompt: &str,
    ) -> anyhow::Result<(String, u32)> {
        let print_number = self.next_print_number(session).await?;
        let key = print_key(session, card_number, print_number);
        let meta = self.meta(
            session,
            username,
            prompt,
            None,
            Some(card_number),
            Some(print_number),
        );
        self.store.put(&key, bytes, Some(&meta)).await?;
        self.consume_pending(session).await?;
        info!(session = %session, %key, print_number, "print artifact stored");
        Ok((key, print_number))
    }

    fn meta(
        &self,
        session: &SessionId,
        username: &str,
        prompt: &str,
        job_id: Option<&str>,
        card_number: Option<u32>,
        print_number: Option<u32>,
    ) -> ArtifactMeta {
        ArtifactMeta {
            session_id: session.to_string(),
            username: username.to_string(),
            prompt: prompt.chars().take(PROMPT_EXCERPT_LEN).collect(),
            created_at: Utc::now().to_rfc3339(),
            job_id: job_id.map(str::to_string),
            card_number,
            print_number,
        }
    }
}
