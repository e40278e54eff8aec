/// Card prompt length bounds, inclusive.
pub const CARD_PROMPT_LEN: (usize, usize) = (10, 1024);
/// Animation prompt length bounds, inclusive.
pub const ANIMATION_PROMPT_LEN: (usize, usize) = (5, 512);

/// A request payload the intake API must reject with 400.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The prompt is missing or outside the allowed length range.
    #[error("prompt must be between {min} and {max} characters")]
    PromptLength {
        /// Minimum accepted length.
        min: usize,
        /// Maximum accepted length.
        max: usize,
    },
    /// The supplied image is not a JPEG.
    #[error("image must be in JPEG format for video generation")]
    NotJpeg,
}

fn check_prompt(prompt: &str, bounds: (usize, usize)) -> Result<(), ValidationError> {
    let len = prompt.trim().chars().count();
    if len < bounds.0 || len > bounds.1 {
        return Err(ValidationError::PromptLength {
            min: bounds.0,
            max: bounds.1,
        });
    }
    Ok(())
}

/// Validate a card-generation prompt.
pub fn validate_card_prompt(prompt: &str) -> Result<(), ValidationError> {
    check_prompt(prompt, CARD_PROMPT_LEN)
}

/// Validate a video animation prompt.
pub fn validate_animation_prompt(prompt: &str) -> Result<(), ValidationError> {
    check_prompt(prompt, ANIMATION_PROMPT_LEN)
}

/// Require JPEG magic bytes; the downstream video model only accepts JPEG.
pub fn require_jpeg(image: &[u8]) -> Result<(), ValidationError> {
    if image.starts_with(&[0xff, 0xd8, 0xff]) {
        Ok(())
    } else {
        Err(ValidationError::NotJpeg)
    }
}
