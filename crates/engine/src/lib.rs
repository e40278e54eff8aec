#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Job intake engine for `cardforge` (artifact store and quota ledger,
//! durable FIFO queue, adaptive capacity learning, ordered dispatch).

/// Adaptive capacity controller.
pub mod capacity;
/// Ordered queue dispatcher.
pub mod dispatcher;
/// Job lifecycle records.
pub mod jobs;
/// Quota and session accounting over the artifact store.
pub mod ledger;
/// Image and video model provider clients.
pub mod model;
/// Durable FIFO queue with visibility-window redelivery.
pub mod queue;
/// Filesystem-backed object store.
pub mod store;

pub use capacity::{CapacityController, CapacitySettings, CapacityStats, Completion};
pub use dispatcher::{
    DispatchOutcome, Dispatcher, DispatcherConfig, DispatcherHandle, start_dispatcher,
};
pub use jobs::{JobRecord, JobStatus, JobStore};
pub use ledger::SessionLedger;
pub use model::{AnimationStatus, HttpImageModel, HttpVideoModel, ImageModel, ModelError, VideoModel};
pub use queue::{Delivery, JobQueue, QueueMessage};
pub use store::{ArtifactMeta, ObjectStore};
