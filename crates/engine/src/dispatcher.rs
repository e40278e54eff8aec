use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use cardforge_core::SessionId;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::capacity::{CapacityController, Completion};
use crate::jobs::JobStore;
use crate::ledger::SessionLedger;
use crate::model::{ImageModel, ModelError};
use crate::queue::{Delivery, JobQueue};

/// Timing knobs for the dispatch loop.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// How long to sleep when the queue is empty or the head message cannot
    /// be attempted yet.
    pub poll_interval: Duration,
    /// How often to reclaim stale in-flight capacity entries.
    pub sweep_interval: Duration,
}

impl DispatcherConfig {
    /// Default idle/backoff poll interval.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
    /// Default stale-sweep interval.
    pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            sweep_interval: Self::DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// What one dispatcher invocation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No visible message on the queue.
    Idle,
    /// The head message was left on the queue because no slot was available.
    AtCapacity,
    /// The head job completed and its result was placed in the store.
    Completed {
        /// Completed job.
        job_id: String,
    },
    /// The model throttled; the message stays for redelivery and the
    /// capacity ceiling contracted.
    Throttled {
        /// Throttled job.
        job_id: String,
    },
    /// A transient failure; the message stays for one redelivery cycle.
    Deferred {
        /// Deferred job.
        job_id: String,
    },
    /// The job failed terminally and was acknowledged.
    Failed {
        /// Failed job.
        job_id: String,
    },
    /// The message referenced a missing or already-terminal job and was
    /// acknowledged without a model call.
    Discarded {
        /// Discarded job.
        job_id: String,
    },
}

/// Ordered queue consumer.
///
/// Each invocation processes at most one message, and a message is only
/// removed from the queue once a terminal decision exists for it. Refusing
/// to acknowledge is the sole backpressure mechanism: an unacked message
/// reappears after the visibility window, and because nothing later can be
/// processed past it, head-of-line order is preserved.
pub struct Dispatcher {
    queue: Arc<JobQueue>,
    jobs: Arc<JobStore>,
    ledger: SessionLedger,
    capacity: Arc<CapacityController>,
    model: Arc<dyn ImageModel>,
}

impl Dispatcher {
    /// Assemble a dispatcher over the shared stores.
    pub fn new(
        queue: Arc<JobQueue>,
        jobs: Arc<JobStore>,
        ledger: SessionLedger,
        capacity: Arc<CapacityController>,
        model: Arc<dyn ImageModel>,
    ) -> Self {
        Self {
            queue,
            jobs,
            ledger,
            capacity,
            model,
        }
    }

    /// Run one dispatch invocation: take the head message, consult the
    /// capacity controller, and either process it or leave it visible.
    pub async fn run_cycle(&self) -> anyhow::Result<DispatchOutcome> {
        let Some(delivery) = self.queue.receive(1).await?.pop() else {
            return Ok(DispatchOutcome::Idle);
        };
        self.process(delivery).await
    }

    async fn process(&self, delivery: Delivery) -> anyhow::Result<DispatchOutcome> {
        let message = &delivery.message;
        let job_id = message.job_id.clone();

        let Some(record) = self.jobs.get(&job_id).await? else {
            // Nothing to report back to; drop the message.
            warn!(%job_id, "queue message without a job record; discarding");
            self.queue.ack(delivery.seq).await?;
            return Ok(DispatchOutcome::Discarded { job_id });
        };
        if record.status.is_terminal() {
            debug!(%job_id, status = %record.status, "job already terminal; discarding message");
            self.queue.ack(delivery.seq).await?;
            return Ok(DispatchOutcome::Discarded { job_id });
        }

        if !self.capacity.admit(&job_id).await? {
            // No slot: do not acknowledge, do not call the model. The message
            // reappears after the visibility window and the cycle retries.
            debug!(%job_id, "no capacity; leaving message on the queue");
            return Ok(DispatchOutcome::AtCapacity);
        }

        if let Err(err) = self.jobs.mark_processing(&job_id).await {
            self.capacity.complete(&job_id, Completion::Error).await?;
            return Err(err);
        }

        match self.model.generate_card(&message.prompt).await {
            Ok(bytes) => {
                let session = SessionId::parse(&message.session_id)
                    .unwrap_or_else(|_| SessionId::new(&record.client_ip, 1));
                match self
                    .ledger
                    .store_card(
                        &session,
                        &bytes,
                        &message.display_name,
                        &message.prompt,
                        Some(&job_id),
                    )
                    .await
                {
                    Ok(key) => {
                        let marked = self.jobs.mark_completed(&job_id, &key).await;
                        self.capacity.complete(&job_id, Completion::Success).await?;
                        marked?;
                        self.queue.ack(delivery.seq).await?;
                        info!(%job_id, %key, "job completed");
                        Ok(DispatchOutcome::Completed { job_id })
                    }
                    Err(err) => {
                        // Store outage: leave the message for the next
                        // invocation rather than losing the job.
                        self.capacity.complete(&job_id, Completion::Error).await?;
                        Err(err)
                    }
                }
            }
            Err(err) if err.is_capacity_signal() => {
                self.capacity.complete(&job_id, Completion::Throttled).await?;
                // No ack: the queue redelivers after the visibility window.
                // The record stays `processing`; the next successful attempt
                // overwrites it.
                warn!(%job_id, %err, "model throttled; message left for redelivery");
                Ok(DispatchOutcome::Throttled { job_id })
            }
            Err(ModelError::Rejected(reason)) => {
                let marked = self.jobs.mark_failed(&job_id, &reason).await;
                self.capacity.complete(&job_id, Completion::Error).await?;
                marked?;
                self.queue.ack(delivery.seq).await?;
                warn!(%job_id, %reason, "model rejected the job; marked failed");
                Ok(DispatchOutcome::Failed { job_id })
            }
            Err(err) => {
                self.capacity.complete(&job_id, Completion::Error).await?;
                if delivery.receive_count > 1 {
                    // Already had its one natural redelivery cycle.
                    let reason = err.to_string();
                    let marked = self.jobs.mark_failed(&job_id, &reason).await;
                    marked?;
                    self.queue.ack(delivery.seq).await?;
                    warn!(%job_id, %reason, "transient failure persisted; marked failed");
                    Ok(DispatchOutcome::Failed { job_id })
                } else {
                    warn!(%job_id, %err, "transient failure; message left for redelivery");
                    Ok(DispatchOutcome::Deferred { job_id })
                }
            }
        }
    }
}

struct HandleInner {
    stop_requested: AtomicBool,
    notify: Notify,
}

/// Handle to a running dispatch loop.
pub struct DispatcherHandle {
    inner: Arc<HandleInner>,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Ask the loop to stop after the current invocation.
    pub fn request_stop(&self) {
        if !self.inner.stop_requested.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Wait for the loop to exit.
    pub async fn wait(self) -> anyhow::Result<()> {
        self.join
            .await
            .map_err(|err| anyhow::anyhow!("dispatcher task join error: {err}"))
    }
}

/// Spawn the supervised dispatch loop.
pub fn start_dispatcher(dispatcher: Arc<Dispatcher>, cfg: DispatcherConfig) -> DispatcherHandle {
    let inner = Arc::new(HandleInner {
        stop_requested: AtomicBool::new(false),
        notify: Notify::new(),
    });
    let join = tokio::spawn(run_loop(dispatcher, cfg, inner.clone()));
    DispatcherHandle { inner, join }
}

async fn run_loop(dispatcher: Arc<Dispatcher>, cfg: DispatcherConfig, inner: Arc<HandleInner>) {
    info!("dispatcher started");
    let mut last_sweep = Instant::now();

    loop {
        if inner.stop_requested.load(Ordering::SeqCst) {
            break;
        }

        if last_sweep.elapsed() >= cfg.sweep_interval {
            last_sweep = Instant::now();
            if let Err(err) = dispatcher.capacity.sweep_stale().await {
                warn!(error = %err, "capacity sweep failed");
            }
        }

        match dispatcher.run_cycle().await {
            Ok(
                DispatchOutcome::Completed { .. }
                | DispatchOutcome::Failed { .. }
                | DispatchOutcome::Discarded { .. },
            ) => {
                // A terminal decision frees the head; try the next message
                // right away.
            }
            Ok(_) => {
                // Idle, at capacity, or waiting on redelivery: sleep until a
                // new message arrives or the poll interval elapses.
                tokio::select! {
                    () = dispatcher.queue.arrived.notified() => {}
                    () = inner.notify.notified() => {}
                    () = tokio::time::sleep(cfg.poll_interval) => {}
                }
            }
            Err(err) => {
                error!("dispatch cycle failed: {err:#}");
                tokio::time::sleep(cfg.poll_interval).await;
            }
        }
    }
    info!("dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use cardforge_core::{ClientId, QuotaLimits};

    use super::*;
    use crate::capacity::CapacitySettings;
    use crate::jobs::{JobRecord, JobStatus};
    use crate::queue::QueueMessage;
    use crate::store::ObjectStore;

    struct ScriptedModel {
        script: Mutex<VecDeque<Result<Vec<u8>, ModelError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedModel {
        fn new(script: Vec<Result<Vec<u8>, ModelError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ImageModel for ScriptedModel {
        async fn generate_card(&self, _prompt: &str) -> Result<Vec<u8>, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or_else(|| Ok(b"png-bytes".to_vec()))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        queue: Arc<JobQueue>,
        jobs: Arc<JobStore>,
        ledger: SessionLedger,
        capacity: Arc<CapacityController>,
        dispatcher: Dispatcher,
    }

    async fn fixture(model: Arc<ScriptedModel>) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(ObjectStore::open(dir.path().join("artifacts")));
        let ledger = SessionLedger::new(store, QuotaLimits::default());
        let jobs = Arc::new(JobStore::open(dir.path().join("jobs")));
        let queue = Arc::new(
            JobQueue::open(dir.path().join("queue"), Duration::ZERO)
                .await
                .expect("queue"),
        );
        let capacity = Arc::new(
            CapacityController::load(dir.path().join("capacity.json"), CapacitySettings::default())
                .await
                .expect("capacity"),
        );
        let dispatcher = Dispatcher::new(
            queue.clone(),
            jobs.clone(),
            ledger.clone(),
            capacity.clone(),
            model,
        );
        Fixture {
            _dir: dir,
            queue,
            jobs,
            ledger,
            capacity,
            dispatcher,
        }
    }

    async fn submit(fixture: &Fixture, prompt: &str) -> String {
        let client = ClientId::new("1.2.3.4", "d1");
        let record = JobRecord::new(prompt, "1.2.3.4_override1", &client, 1, "Guest");
        fixture.jobs.create(&record).await.expect("create record");
        fixture
            .queue
            .send(QueueMessage {
                job_id: record.job_id.clone(),
                prompt: prompt.to_string(),
                user_number: 1,
                display_name: "Guest".to_string(),
                device_id: "d1".to_string(),
                session_id: "1.2.3.4_override1".to_string(),
            })
            .await
            .expect("enqueue");
        record.job_id
    }

    #[tokio::test]
    async fn happy_path_places_the_artifact_and_completes_the_job() {
        let model = ScriptedModel::new(vec![Ok(b"png-bytes".to_vec())]);
        let fixture = fixture(model.clone()).await;
        let job_id = submit(&fixture, "An AWS Solutions Architect").await;

        let outcome = fixture.dispatcher.run_cycle().await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed { job_id: job_id.clone() });

        let record = fixture.jobs.get(&job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        let key = record.artifact_key.expect("artifact key");
        assert!(key.starts_with("cards/1.2.3.4_override1_card_1_"));
        assert!(key.ends_with(".png"));

        let (_, remaining) = fixture.ledger.remaining_for("1.2.3.4").await.unwrap();
        assert_eq!(remaining.cards, 4);

        assert_eq!(fixture.queue.depth().await, 0);
        let stats = fixture.capacity.stats().await;
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.total_successes, 1);
    }

    #[tokio::test]
    async fn jobs_complete_in_submission_order() {
        let model = ScriptedModel::new(Vec::new());
        let fixture = fixture(model).await;
        let mut submitted = Vec::new();
        for i in 0..4 {
            submitted.push(submit(&fixture, &format!("prompt number {i} padded out")).await);
        }

        let mut completed = Vec::new();
        for _ in 0..4 {
            match fixture.dispatcher.run_cycle().await.unwrap() {
                DispatchOutcome::Completed { job_id } => completed.push(job_id),
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(completed, submitted);
    }

    #[tokio::test]
    async fn at_capacity_leaves_the_message_and_the_record_untouched() {
        let model = ScriptedModel::new(Vec::new());
        let fixture = fixture(model.clone()).await;
        let job_id = submit(&fixture, "a perfectly ordinary prompt").await;

        // Fill both initial slots with unrelated in-flight work.
        assert!(fixture.capacity.admit("blocker-1").await.unwrap());
        assert!(fixture.capacity.admit("blocker-2").await.unwrap());

        let outcome = fixture.dispatcher.run_cycle().await.unwrap();
        assert_eq!(outcome, DispatchOutcome::AtCapacity);
        assert_eq!(model.calls(), 0);
        assert_eq!(fixture.queue.depth().await, 1);
        let record = fixture.jobs.get(&job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Queued);

        // A slot frees up; the same message is attempted next.
        fixture.capacity.complete("blocker-1", Completion::Success).await.unwrap();
        let outcome = fixture.dispatcher.run_cycle().await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed { job_id });
    }

    #[tokio::test]
    async fn throttle_contracts_capacity_and_the_job_eventually_completes() {
        let model = ScriptedModel::new(vec![
            Err(ModelError::Throttled),
            Ok(b"png-bytes".to_vec()),
        ]);
        let fixture = fixture(model.clone()).await;
        let job_id = submit(&fixture, "a perfectly ordinary prompt").await;

        let outcome = fixture.dispatcher.run_cycle().await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Throttled { job_id: job_id.clone() });

        // Message still queued, record parked in processing, ceiling pegged
        // to the observed working concurrency.
        assert_eq!(fixture.queue.depth().await, 1);
        let record = fixture.jobs.get(&job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Processing);
        let stats = fixture.capacity.stats().await;
        assert_eq!(stats.available_slots, 1);
        assert_eq!(stats.total_throttles, 1);

        let outcome = fixture.dispatcher.run_cycle().await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed { job_id: job_id.clone() });
        let record = fixture.jobs.get(&job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn service_quota_exhaustion_is_treated_as_a_throttle() {
        let model = ScriptedModel::new(vec![
            Err(ModelError::QuotaExceeded),
            Ok(b"png-bytes".to_vec()),
        ]);
        let fixture = fixture(model).await;
        let job_id = submit(&fixture, "a perfectly ordinary prompt").await;

        let outcome = fixture.dispatcher.run_cycle().await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Throttled { job_id: job_id.clone() });
        assert_eq!(fixture.queue.depth().await, 1);
        assert_eq!(fixture.capacity.stats().await.total_throttles, 1);
    }

    #[tokio::test]
    async fn model_rejection_is_terminal() {
        let model = ScriptedModel::new(vec![Err(ModelError::Rejected(
            "prompt blocked by content filter".to_string(),
        ))]);
        let fixture = fixture(model).await;
        let job_id = submit(&fixture, "a perfectly ordinary prompt").await;

        let outcome = fixture.dispatcher.run_cycle().await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Failed { job_id: job_id.clone() });

        let record = fixture.jobs.get(&job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(
            record.error.as_deref(),
            Some("prompt blocked by content filter")
        );
        assert_eq!(fixture.queue.depth().await, 0);
        assert_eq!(fixture.capacity.stats().await.total_throttles, 0);
    }

    #[tokio::test]
    async fn transient_failures_get_one_redelivery_then_fail() {
        let model = ScriptedModel::new(vec![
            Err(ModelError::Transport("connection reset".to_string())),
            Err(ModelError::Transport("connection reset".to_string())),
        ]);
        let fixture = fixture(model).await;
        let job_id = submit(&fixture, "a perfectly ordinary prompt").await;

        let outcome = fixture.dispatcher.run_cycle().await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Deferred { job_id: job_id.clone() });
        assert_eq!(fixture.queue.depth().await, 1);

        let outcome = fixture.dispatcher.run_cycle().await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Failed { job_id: job_id.clone() });
        assert_eq!(fixture.queue.depth().await, 0);
        let record = fixture.jobs.get(&job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn messages_without_a_record_are_discarded() {
        let model = ScriptedModel::new(Vec::new());
        let fixture = fixture(model.clone()).await;
        fixture
            .queue
            .send(QueueMessage {
                job_id: "ghost-job".to_string(),
                prompt: "a perfectly ordinary prompt".to_string(),
                user_number: 1,
                display_name: "Guest".to_string(),
                device_id: "d1".to_string(),
                session_id: "1.2.3.4_override1".to_string(),
            })
            .await
            .unwrap();

        let outcome = fixture.dispatcher.run_cycle().await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Discarded { job_id: "ghost-job".to_string() }
        );
        assert_eq!(model.calls(), 0);
        assert_eq!(fixture.queue.depth().await, 0);
    }

    #[tokio::test]
    async fn redelivery_of_a_completed_job_acks_without_a_model_call() {
        let model = ScriptedModel::new(vec![Ok(b"png-bytes".to_vec())]);
        let fixture = fixture(model.clone()).await;
        let job_id = submit(&fixture, "a perfectly ordinary prompt").await;

        let outcome = fixture.dispatcher.run_cycle().await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed { job_id: job_id.clone() });
        assert_eq!(model.calls(), 1);

        // A duplicate delivery of the same job (at-least-once broker).
        fixture
            .queue
            .send(QueueMessage {
                job_id: job_id.clone(),
                prompt: "a perfectly ordinary prompt".to_string(),
                user_number: 1,
                display_name: "Guest".to_string(),
                device_id: "d1".to_string(),
                session_id: "1.2.3.4_override1".to_string(),
            })
            .await
            .unwrap();

        let outcome = fixture.dispatcher.run_cycle().await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Discarded { job_id });
        assert_eq!(model.calls(), 1);
        assert_eq!(fixture.queue.depth().await, 0);
    }

    #[tokio::test]
    async fn started_loop_drains_the_queue() {
        let model = ScriptedModel::new(Vec::new());
        let fixture = fixture(model).await;
        let job_id = submit(&fixture, "a perfectly ordinary prompt").await;

        let dispatcher = Arc::new(Dispatcher::new(
            fixture.queue.clone(),
            fixture.jobs.clone(),
            fixture.ledger.clone(),
            fixture.capacity.clone(),
            ScriptedModel::new(Vec::new()),
        ));
        let handle = start_dispatcher(
            dispatcher,
            DispatcherConfig {
                poll_interval: Duration::from_millis(10),
                sweep_interval: Duration::from_secs(60),
            },
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let record = fixture.jobs.get(&job_id).await.unwrap().unwrap();
            if record.status == JobStatus::Completed {
                break;
            }
            assert!(Instant::now() < deadline, "job did not complete in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.request_stop();
        handle.wait().await.unwrap();
    }
}
