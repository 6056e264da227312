use super::AIModel;
use image::DynamicImage;

/// Generation budget used when the caller does not pick one.
pub const DEFAULT_MAX_NEW_TOKENS: usize = 2000;

#[derive(Debug, Clone)]
pub struct ImageCaptionInput {
    pub image: DynamicImage,
    pub prompt: String,
    pub max_new_tokens: usize,
}

impl ImageCaptionInput {
    pub fn new(image: DynamicImage, prompt: impl Into<String>) -> Self {
        Self {
            image,
            prompt: prompt.into(),
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
        }
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }
}

pub type ImageCaptionOutput = String;
pub type ImageCaptionModel = AIModel<ImageCaptionInput, ImageCaptionOutput>;
