use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use reqwest::Url;
use serde::{Deserialize, Serialize};

/// Provider failure, classified for the dispatcher.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    /// The provider rate-limited the call.
    #[error("model provider throttled the request")]
    Throttled,
    /// Service-wide quota exhaustion; handled like a throttle.
    #[error("model provider service quota exhausted")]
    QuotaExceeded,
    /// The provider rejected the request itself (bad prompt, bad payload);
    /// retrying is useless.
    #[error("model provider rejected the request: {0}")]
    Rejected(String),
    /// Transport-level or unclassified failure; may be transient.
    #[error("model provider transport failure: {0}")]
    Transport(String),
}

impl ModelError {
    /// Whether this failure means the provider is out of capacity, i.e. the
    /// capacity learner should contract and the message be redelivered.
    pub fn is_capacity_signal(&self) -> bool {
        matches!(self, ModelError::Throttled | ModelError::QuotaExceeded)
    }
}

/// Text-to-image provider.
#[async_trait]
pub trait ImageModel: Send + Sync {
    /// Generate a card image for a prompt; returns PNG bytes.
    async fn generate_card(&self, prompt: &str) -> Result<Vec<u8>, ModelError>;
}

/// State of an asynchronous animation invocation.
#[derive(Debug, Clone)]
pub enum AnimationStatus {
    /// Still rendering; poll again later.
    InProgress,
    /// Finished; base64 MP4 bytes ready to be placed in the store.
    Completed {
        /// Base64-encoded MP4.
        video_b64: String,
    },
    /// The provider gave up on the invocation.
    Failed {
        /// Provider failure message.
        message: String,
    },
}

/// Image-to-video provider with an asynchronous invocation interface.
#[async_trait]
pub trait VideoModel: Send + Sync {
    /// Start an animation job; returns the provider's opaque invocation
    /// handle for later polling.
    async fn start_animation(
        &self,
        image_jpeg_b64: &str,
        prompt: &str,
    ) -> Result<String, ModelError>;

    /// Poll an invocation started by [`start_animation`].
    ///
    /// [`start_animation`]: VideoModel::start_animation
    async fn animation_status(&self, invocation: &str) -> Result<AnimationStatus, ModelError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageRequest<'a> {
    task_type: &'static str,
    text_to_image_params: TextToImageParams<'a>,
    image_generation_config: ImageGenerationConfig,
}

#[derive(Debug, Serialize)]
struct TextToImageParams<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageGenerationConfig {
    number_of_images: u32,
    quality: &'static str,
    height: u32,
    width: u32,
    cfg_scale: f32,
    seed: u32,
}

impl ImageGenerationConfig {
    fn card() -> Self {
        Self {
            number_of_images: 1,
            quality: "premium",
            height: 720,
            width: 1280,
            cfg_scale: 7.0,
            seed: 42,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    images: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnimationRequest<'a> {
    task_type: &'static str,
    text_to_video_params: TextToVideoParams<'a>,
    video_generation_config: VideoGenerationConfig,
}

#[derive(Debug, Serialize)]
struct TextToVideoParams<'a> {
    text: &'a str,
    images: Vec<InputImage<'a>>,
}

#[derive(Debug, Serialize)]
struct InputImage<'a> {
    format: &'static str,
    source: ImageSource<'a>,
}

#[derive(Debug, Serialize)]
struct ImageSource<'a> {
    bytes: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoGenerationConfig {
    duration_seconds: u32,
    fps: u32,
    dimension: &'static str,
    seed: u32,
}

impl VideoGenerationConfig {
    fn card_animation() -> Self {
        Self {
            duration_seconds: 6,
            fps: 24,
            dimension: "1280x720",
            seed: 42,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnimationStartResponse {
    invocation_arn: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnimationStatusResponse {
    status: String,
    #[serde(default)]
    video_b64: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn classify(status: reqwest::StatusCode, body: &str) -> ModelError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || body.contains("ThrottlingException")
        || body.contains("TooManyRequestsException")
    {
        return ModelError::Throttled;
    }
    if body.contains("ServiceQuotaExceededException") {
        return ModelError::QuotaExceeded;
    }
    if status.is_client_error() {
        return ModelError::Rejected(format!("http {status}: {body}"));
    }
    ModelError::Transport(format!("http {status}: {body}"))
}

fn transport(err: reqwest::Error) -> ModelError {
    ModelError::Transport(err.to_string())
}

/// HTTP adapter for the text-to-image model.
#[derive(Debug, Clone)]
pub struct HttpImageModel {
    http: reqwest::Client,
    base_url: Url,
    model_id: String,
}

impl HttpImageModel {
    /// Build an adapter against `base_url` for the given model id.
    pub fn new(http: reqwest::Client, base_url: Url, model_id: impl Into<String>) -> Self {
        Self {
            http,
            base_url,
            model_id: model_id.into(),
        }
    }
}

#[async_trait]
impl ImageModel for HttpImageModel {
    async fn generate_card(&self, prompt: &str) -> Result<Vec<u8>, ModelError> {
        let url = self
            .base_url
            .join(&format!("model/{}/invoke", self.model_id))
            .map_err(|err| ModelError::Transport(err.to_string()))?;

        let request = ImageRequest {
            task_type: "TEXT_IMAGE",
            text_to_image_params: TextToImageParams { text: prompt },
            image_generation_config: ImageGenerationConfig::card(),
        };

        let res = self
            .http
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(transport)?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(classify(status, &body));
        }

        let body: ImageResponse = res.json().await.map_err(transport)?;
        let Some(first) = body.images.first() else {
            return Err(ModelError::Rejected(
                "no images returned by the model".to_string(),
            ));
        };
        B64.decode(first.as_bytes())
            .map_err(|err| ModelError::Transport(format!("bad image payload: {err}")))
    }
}

/// HTTP adapter for the asynchronous image-to-video model.
#[derive(Debug, Clone)]
pub struct HttpVideoModel {
    http: reqwest::Client,
    base_url: Url,
    model_id: String,
}

impl HttpVideoModel {
    /// Build an adapter against `base_url` for the given model id.
    pub fn new(http: reqwest::Client, base_url: Url, model_id: impl Into<String>) -> Self {
        Self {
            http,
            base_url,
            model_id: model_id.into(),
        }
    }
}

#[async_trait]
impl VideoModel for HttpVideoModel {
    async fn start_animation(
        &self,
        image_jpeg_b64: &str,
        prompt: &str,
    ) -> Result<String, ModelError> {
        let url = self
            .base_url
            .join(&format!("model/{}/start", self.model_id))
            .map_err(|err| ModelError::Transport(err.to_string()))?;

        let request = AnimationRequest {
            task_type: "TEXT_VIDEO",
            text_to_video_params: TextToVideoParams {
                text: prompt,
                images: vec![InputImage {
                    format: "jpeg",
                    source: ImageSource {
                        bytes: image_jpeg_b64,
                    },
                }],
            },
            video_generation_config: VideoGenerationConfig::card_animation(),
        };

        let res = self
            .http
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(transport)?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(classify(status, &body));
        }

        let body: AnimationStartResponse = res.json().await.map_err(transport)?;
        Ok(body.invocation_arn)
    }

    async fn animation_status(&self, invocation: &str) -> Result<AnimationStatus, ModelError> {
        // Provider handles are ARN-shaped; the trailing segment is the
        // invocation id used in the status path.
        let id = invocation.rsplit('/').next().unwrap_or(invocation);
        let url = self
            .base_url
            .join(&format!("invocations/{id}"))
            .map_err(|err| ModelError::Transport(err.to_string()))?;

        let res = self.http.get(url).send().await.map_err(transport)?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(classify(status, &body));
        }

        let body: AnimationStatusResponse = res.json().await.map_err(transport)?;
        map_animation_status(body)
    }
}

fn map_animation_status(body: AnimationStatusResponse) -> Result<AnimationStatus, ModelError> {
    match body.status.as_str() {
        "InProgress" => Ok(AnimationStatus::InProgress),
        "Completed" => match body.video_b64 {
            Some(video_b64) => Ok(AnimationStatus::Completed { video_b64 }),
            None => Err(ModelError::Transport(
                "completed invocation carried no video payload".to_string(),
            )),
        },
        "Failed" => Ok(AnimationStatus::Failed {
            message: body
                .message
                .unwrap_or_else(|| "video generation failed".to_string()),
        }),
        // An unrecognized status must not read as "still rendering": the
        // caller would poll forever. Surface it instead.
        other => Err(ModelError::Transport(format!(
            "unrecognized invocation status: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttles_are_classified_as_capacity_signals() {
        let err = classify(reqwest::StatusCode::TOO_MANY_REQUESTS, "");
        assert!(err.is_capacity_signal());

        let err = classify(
            reqwest::StatusCode::BAD_REQUEST,
            "{\"code\": \"ThrottlingException\"}",
        );
        assert!(matches!(err, ModelError::Throttled));

        let err = classify(
            reqwest::StatusCode::BAD_REQUEST,
            "{\"code\": \"ServiceQuotaExceededException\"}",
        );
        assert!(matches!(err, ModelError::QuotaExceeded));
        assert!(err.is_capacity_signal());
    }

    #[test]
    fn client_errors_are_terminal_rejections() {
        let err = classify(reqwest::StatusCode::BAD_REQUEST, "prompt blocked");
        assert!(matches!(err, ModelError::Rejected(_)));
        assert!(!err.is_capacity_signal());
    }

    #[test]
    fn server_errors_are_transport_failures() {
        let err = classify(reqwest::StatusCode::BAD_GATEWAY, "upstream down");
        assert!(matches!(err, ModelError::Transport(_)));
    }

    fn status_body(status: &str) -> AnimationStatusResponse {
        AnimationStatusResponse {
            status: status.to_string(),
            video_b64: None,
            message: None,
        }
    }

    #[test]
    fn known_invocation_statuses_map_cleanly() {
        assert!(matches!(
            map_animation_status(status_body("InProgress")),
            Ok(AnimationStatus::InProgress)
        ));
        assert!(matches!(
            map_animation_status(status_body("Failed")),
            Ok(AnimationStatus::Failed { .. })
        ));

        let mut completed = status_body("Completed");
        completed.video_b64 = Some("bXA0".to_string());
        assert!(matches!(
            map_animation_status(completed),
            Ok(AnimationStatus::Completed { .. })
        ));
    }

    #[test]
    fn unrecognized_invocation_statuses_fail_loudly() {
        assert!(matches!(
            map_animation_status(status_body("Pending")),
            Err(ModelError::Transport(_))
        ));
        // Completed without a payload is an error, not an endless poll.
        assert!(matches!(
            map_animation_status(status_body("Completed")),
            Err(ModelError::Transport(_))
        ));
    }
}
