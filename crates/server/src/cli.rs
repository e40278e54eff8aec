use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use reqwest::Url;

use cardforge_core::QuotaLimits;
use cardforge_engine::capacity::CapacitySettings;

fn default_model_base_url() -> Url {
    Url::parse("http://127.0.0.1:8091/").expect("default model base URL must be valid")
}

#[derive(Debug, Clone, Parser)]
#[command(name = "cardforge", version, about = "Event kiosk card generation service")]
pub struct Cli {
    /// Address the intake API listens on.
    #[arg(long, env = "CARDFORGE_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Root directory for artifacts, job records, queue and capacity state.
    #[arg(long, env = "CARDFORGE_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Event login username.
    #[arg(long, env = "CARDFORGE_EVENT_USERNAME", default_value = "demo")]
    pub event_username: String,

    /// Event login password.
    #[arg(long, env = "CARDFORGE_EVENT_PASSWORD", default_value = "demo")]
    pub event_password: String,

    /// Secret staff enter to reset a visitor's quota.
    #[arg(long, env = "CARDFORGE_OVERRIDE_CODE", default_value = "snap")]
    pub override_code: String,

    /// Cards allowed per session.
    #[arg(long, env = "CARDFORGE_CARDS_PER_USER", default_value_t = 5)]
    pub cards_per_user: u32,

    /// Videos allowed per session.
    #[arg(long, env = "CARDFORGE_VIDEOS_PER_USER", default_value_t = 3)]
    pub videos_per_user: u32,

    /// Prints allowed per session.
    #[arg(long, env = "CARDFORGE_PRINTS_PER_USER", default_value_t = 1)]
    pub prints_per_user: u32,

    /// Base URL of the model provider gateway.
    #[arg(long, env = "CARDFORGE_MODEL_BASE_URL", default_value_t = default_model_base_url())]
    pub model_base_url: Url,

    /// Text-to-image model identifier.
    #[arg(long, env = "CARDFORGE_IMAGE_MODEL_ID", default_value = "canvas-image-v1")]
    pub image_model_id: String,

    /// Image-to-video model identifier.
    #[arg(long, env = "CARDFORGE_VIDEO_MODEL_ID", default_value = "reel-video-v1")]
    pub video_model_id: String,

    /// Queue visibility window in seconds.
    #[arg(long, env = "CARDFORGE_VISIBILITY_SECS", default_value_t = 30)]
    pub visibility_secs: u64,

    /// Age in seconds after which an in-flight capacity entry is reclaimed.
    #[arg(long, env = "CARDFORGE_STALE_AFTER_SECS", default_value_t = 600)]
    pub stale_after_secs: u64,

    /// Concurrency ceiling assumed before anything has been learned.
    #[arg(
        long,
        env = "CARDFORGE_INITIAL_SLOTS",
        default_value_t = CapacitySettings::DEFAULT_INITIAL_SLOTS
    )]
    pub initial_slots: u32,

    /// Raise the learned ceiling every this many successes.
    #[arg(
        long,
        env = "CARDFORGE_SUCCESS_STEP",
        default_value_t = CapacitySettings::DEFAULT_SUCCESS_STEP
    )]
    pub success_step: u64,

    /// Hard ceiling the capacity learner never exceeds.
    #[arg(
        long,
        env = "CARDFORGE_MAX_SLOTS",
        default_value_t = CapacitySettings::DEFAULT_MAX_SLOTS
    )]
    pub max_slots: u32,
}

impl Cli {
    pub fn limits(&self) -> QuotaLimits {
        QuotaLimits {
            cards: self.cards_per_user,
            videos: self.videos_per_user,
            prints: self.prints_per_user,
        }
    }

    pub fn capacity_settings(&self) -> CapacitySettings {
        CapacitySettings {
            initial_slots: self.initial_slots.max(1),
            success_step: self.success_step.max(1),
            max_slots: self.max_slots.max(1),
            stale_after: Duration::from_secs(self.stale_after_secs),
        }
    }

    pub fn visibility(&self) -> Duration {
        Duration::from_secs(self.visibility_secs)
    }
}
