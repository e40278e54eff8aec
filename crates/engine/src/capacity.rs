use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::store::write_atomic;

/// Tunables for the capacity learner.
#[derive(Debug, Clone, Copy)]
pub struct CapacitySettings {
    /// Slots assumed before anything has been learned.
    pub initial_slots: u32,
    /// Raise the ceiling by one every this many successes.
    pub success_step: u64,
    /// Hard ceiling the learner never exceeds.
    pub max_slots: u32,
    /// Age after which an in-flight entry is presumed dead and reclaimed.
    pub stale_after: Duration,
}

impl CapacitySettings {
    /// Conservative starting ceiling.
    pub const DEFAULT_INITIAL_SLOTS: u32 = 2;
    /// Default success step.
    pub const DEFAULT_SUCCESS_STEP: u64 = 5;
    /// Default hard ceiling.
    pub const DEFAULT_MAX_SLOTS: u32 = 10;
    /// Default stale-entry threshold.
    pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(600);
}

impl Default for CapacitySettings {
    fn default() -> Self {
        Self {
            initial_slots: Self::DEFAULT_INITIAL_SLOTS,
            success_step: Self::DEFAULT_SUCCESS_STEP,
            max_slots: Self::DEFAULT_MAX_SLOTS,
            stale_after: Self::DEFAULT_STALE_AFTER,
        }
    }
}

/// How a model call ended, from the learner's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The call succeeded.
    Success,
    /// The provider throttled us (including service-quota exhaustion).
    Throttled,
    /// The call failed for a non-capacity reason.
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CapacityState {
    available_slots: u32,
    #[serde(default)]
    in_flight: BTreeMap<String, i64>,
    #[serde(default)]
    total_successes: u64,
    #[serde(default)]
    total_throttles: u64,
    #[serde(default)]
    last_success_time: Option<String>,
    #[serde(default)]
    last_throttle_time: Option<String>,
}

/// Read-only view of the learner state.
#[derive(Debug, Clone, Serialize)]
pub struct CapacityStats {
    /// Learned concurrency ceiling.
    pub available_slots: u32,
    /// Calls currently in flight.
    pub in_flight: u32,
    /// Successes observed so far.
    pub total_successes: u64,
    /// Throttles observed so far.
    pub total_throttles: u64,
    /// Last success, ISO-8601 UTC.
    pub last_success_time: Option<String>,
    /// Last throttle, ISO-8601 UTC.
    pub last_throttle_time: Option<String>,
}

/// Learns the provider's true concurrency ceiling from observed throttles
/// and successes, and gates every model call through [`admit`].
///
/// Raising is slow (one slot per `success_step` successes, capped); dropping
/// is fast (a throttle pegs the ceiling to whatever concurrency was actually
/// working). State is persisted after every mutation so the learned ceiling
/// survives restarts.
///
/// [`admit`]: CapacityController::admit
#[derive(Debug)]
pub struct CapacityController {
    path: PathBuf,
    settings: CapacitySettings,
    state: Mutex<CapacityState>,
}

impl CapacityController {
    /// Load persisted state, or start fresh with the configured defaults.
    pub async fn load(
        path: impl Into<PathBuf>,
        settings: CapacitySettings,
    ) -> anyhow::Result<Self> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(raw) => {
                let mut state: CapacityState = serde_json::from_slice(&raw)?;
                state.available_slots = state.available_slots.max(1);
                info!(
                    slots = state.available_slots,
                    in_flight = state.in_flight.len(),
                    "capacity state loaded"
                );
                state
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => CapacityState {
                available_slots: settings.initial_slots.max(1),
                in_flight: BTreeMap::new(),
                total_successes: 0,
                total_throttles: 0,
                last_success_time: None,
                last_throttle_time: None,
            },
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path,
            settings,
            state: Mutex::new(state),
        })
    }

    /// Ask for one more in-flight slot.
    ///
    /// Inserts the job into the in-flight set and returns `true` iff the
    /// current in-flight count is below the learned ceiling. Stale entries
    /// are reclaimed first.
    pub async fn admit(&self, job_id: &str) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        sweep(&mut state, self.settings.stale_after);

        if state.in_flight.len() as u32 >= state.available_slots {
            return Ok(false);
        }
        state
            .in_flight
            .insert(job_id.to_string(), Utc::now().timestamp_millis());
        self.persist(&state).await?;
        Ok(true)
    }

    /// Report the end of an admitted call and apply the learning rule.
    pub async fn complete(&self, job_id: &str, outcome: Completion) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.in_flight.remove(job_id);

        match outcome {
            Completion::Success => {
                state.total_successes += 1;
                state.last_success_time = Some(Utc::now().to_rfc3339());
                let step = self.settings.success_step.max(1);
                if state.total_successes % step == 0 {
                    let raised = (state.available_slots + 1).min(self.settings.max_slots);
                    if raised > state.available_slots {
                        info!(
                            from = state.available_slots,
                            to = raised,
                            successes = state.total_successes,
                            "raising capacity ceiling"
                        );
                        state.available_slots = raised;
                    }
                }
            }
            Completion::Throttled => {
                state.total_throttles += 1;
                state.last_throttle_time = Some(Utc::now().to_rfc3339());
                // Whatever is still in flight is the concurrency that works.
                let contracted = (state.in_flight.len() as u32).max(1);
                warn!(
                    from = state.available_slots,
                    to = contracted,
                    throttles = state.total_throttles,
                    "throttled; contracting capacity ceiling"
                );
                state.available_slots = contracted;
            }
            Completion::Error => {}
        }

        self.persist(&state).await
    }

    /// Reclaim in-flight entries older than the stale threshold.
    pub async fn sweep_stale(&self) -> anyhow::Result<usize> {
        let mut state = self.state.lock().await;
        let removed = sweep(&mut state, self.settings.stale_after);
        if removed > 0 {
            warn!(removed, "reclaimed stale in-flight entries");
            self.persist(&state).await?;
        }
        Ok(removed)
    }

    /// Current learner state, for health reporting.
    pub async fn stats(&self) -> CapacityStats {
        let state = self.state.lock().await;
        CapacityStats {
            available_slots: state.available_slots,
            in_flight: state.in_flight.len() as u32,
            total_successes: state.total_successes,
            total_throttles: state.total_throttles,
            last_success_time: state.last_success_time.clone(),
            last_throttle_time: state.last_throttle_time.clone(),
        }
    }

    async fn persist(&self, state: &CapacityState) -> anyhow::Result<()> {
        write_atomic(&self.path, &serde_json::to_vec_pretty(state)?).await
    }

    #[cfg(test)]
    async fn backdate_in_flight(&self, job_id: &str, age: Duration) {
        let mut state = self.state.lock().await;
        let admitted = Utc::now().timestamp_millis() - age.as_millis() as i64;
        state.in_flight.insert(job_id.to_string(), admitted);
    }
}

fn sweep(state: &mut CapacityState, stale_after: Duration) -> usize {
    let cutoff = Utc::now().timestamp_millis() - stale_after.as_millis() as i64;
    let before = state.in_flight.len();
    state.in_flight.retain(|_, admitted| *admitted > cutoff);
    before - state.in_flight.len()
}
