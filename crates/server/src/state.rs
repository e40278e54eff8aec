use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cardforge_core::Authenticator;
use cardforge_engine::capacity::CapacityController;
use cardforge_engine::dispatcher::Dispatcher;
use cardforge_engine::jobs::JobStore;
use cardforge_engine::ledger::SessionLedger;
use cardforge_engine::model::{HttpImageModel, HttpVideoModel, VideoModel};
use cardforge_engine::queue::JobQueue;
use cardforge_engine::store::ObjectStore;

use crate::cli::Cli;

/// Shared state behind every request handler.
pub struct AppState {
    pub auth: Authenticator,
    pub override_code: String,
    pub ledger: SessionLedger,
    pub jobs: Arc<JobStore>,
    pub queue: Arc<JobQueue>,
    pub capacity: Arc<CapacityController>,
    pub video_model: Arc<dyn VideoModel>,
    pub artifacts_root: PathBuf,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Open every durable component under the configured data directory and
    /// assemble the dispatcher alongside the shared state.
    pub async fn build(cli: &Cli) -> anyhow::Result<(SharedState, Arc<Dispatcher>)> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        let artifacts_root = cli.data_dir.join("artifacts");
        let store = Arc::new(ObjectStore::open(&artifacts_root));
        let ledger = SessionLedger::new(store, cli.limits());
        let jobs = Arc::new(JobStore::open(cli.data_dir.join("jobs")));
        let queue = Arc::new(JobQueue::open(cli.data_dir.join("queue"), cli.visibility()).await?);
        let capacity = Arc::new(
            CapacityController::load(cli.data_dir.join("capacity.json"), cli.capacity_settings())
                .await?,
        );

        let image_model = Arc::new(HttpImageModel::new(
            http.clone(),
            cli.model_base_url.clone(),
            cli.image_model_id.clone(),
        ));
        let video_model: Arc<dyn VideoModel> = Arc::new(HttpVideoModel::new(
            http,
            cli.model_base_url.clone(),
            cli.video_model_id.clone(),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            jobs.clone(),
            ledger.clone(),
            capacity.clone(),
            image_model,
        ));

        let state = Arc::new(AppState {
            auth: Authenticator::new(&cli.event_username, &cli.event_password),
            override_code: cli.override_code.clone(),
            ledger,
            jobs,
            queue,
            capacity,
            video_model,
            artifacts_root,
        });
        Ok((state, dispatcher))
    }
}
