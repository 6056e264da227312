use crate::batch::{OnImageError, BATCH_PROMPT};
use ai::{llava::DeviceKind, DEFAULT_MAX_NEW_TOKENS};
use std::{env, fmt::Display, path::PathBuf, str::FromStr};

pub const DEFAULT_IMAGES_URL: &str =
    "https://drive.usercontent.google.com/u/0/uc?id=1IG6CXJipcApR34xtKWJpxm03Ud-5pwIx&export=download";

/// Read `key` from the environment, falling back to `default` when unset.
/// A value that is set but does not parse is an error.
pub fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid value {:?} for ${}: {}", value, key, e)),
        _ => Ok(default),
    }
}

/// Where the model artifacts come from and where they run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub resources_dir: PathBuf,
    pub device: DeviceKind,
    pub download_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resources_dir: PathBuf::from("resources"),
            device: DeviceKind::Cpu,
            download_url: "https://huggingface.co".to_string(),
        }
    }
}

impl EngineConfig {
    /// `.env` should already be loaded, see `analytics_tracing::init_tracing`.
    pub fn from_env() -> anyhow::Result<Self> {
        let default = Self::default();
        Ok(Self {
            resources_dir: env_or("LOCAL_RESOURCES_DIR", default.resources_dir)?,
            device: env_or("CAPTION_MODEL_DEVICE", default.device)?,
            download_url: env_or("CAPTION_MODEL_DOWNLOAD_URL", default.download_url)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub images_url: String,
    pub output_archive: PathBuf,
    pub workers: usize,
    pub on_error: OnImageError,
    pub prompt: String,
    pub max_new_tokens: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            images_url: DEFAULT_IMAGES_URL.to_string(),
            output_archive: PathBuf::from("result.zip"),
            workers: 1,
            on_error: OnImageError::Abort,
            prompt: BATCH_PROMPT.to_string(),
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
        }
    }
}

impl BatchConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let default = Self::default();
        let workers = env_or("CAPTION_WORKERS", default.workers)?;
        if workers == 0 {
            anyhow::bail!("$CAPTION_WORKERS must be at least 1");
        }
        Ok(Self {
            images_url: env_or("CAPTION_IMAGES_URL", default.images_url)?,
            output_archive: env_or("CAPTION_OUTPUT_ARCHIVE", default.output_archive)?,
            workers,
            on_error: env_or("CAPTION_ON_IMAGE_ERROR", default.on_error)?,
            ..default
        })
    }
}

#[cfg(test)]
mod test {
    use super::env_or;
    use crate::OnImageError;
    use ai::llava::DeviceKind;

    #[test]
    fn test_env_or() {
        std::env::remove_var("CAPTIONING_TEST_UNSET");
        assert_eq!(env_or("CAPTIONING_TEST_UNSET", 3usize).unwrap(), 3);

        std::env::set_var("CAPTIONING_TEST_WORKERS", "4");
        assert_eq!(env_or("CAPTIONING_TEST_WORKERS", 1usize).unwrap(), 4);

        std::env::set_var("CAPTIONING_TEST_BAD", "many");
        assert!(env_or("CAPTIONING_TEST_BAD", 1usize).is_err());

        std::env::set_var("CAPTIONING_TEST_DEVICE", "metal");
        assert_eq!(
            env_or("CAPTIONING_TEST_DEVICE", DeviceKind::Cpu).unwrap(),
            DeviceKind::Metal
        );

        std::env::set_var("CAPTIONING_TEST_ON_ERROR", "skip");
        assert_eq!(
            env_or("CAPTIONING_TEST_ON_ERROR", OnImageError::Abort).unwrap(),
            OnImageError::Skip
        );
    }
}
