use crate::{
    config::EngineConfig,
    error::{CaptionError, CaptionResult},
};
use ai::{
    llava::{QuantizationConfig, LLaVA},
    AIModel, ImageCaptionInput, ImageCaptionModel,
};
use file_downloader::{FileDownload, FileDownloadConfig};
use image::DynamicImage;
use std::path::{Path, PathBuf};

pub const MODEL_ID: &str = "llava-v1.5-7b";

const MODEL_URI: &str = "mys/ggml_llava-v1.5-7b/resolve/main/ggml-model-q4_k.gguf";
const MMPROJ_URI: &str = "mys/ggml_llava-v1.5-7b/resolve/main/mmproj-model-f16.gguf";
const TOKENIZER_URI: &str = "llava-hf/llava-1.5-7b-hf/resolve/main/tokenizer.json";

#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    pub model: PathBuf,
    pub mmproj: PathBuf,
    pub tokenizer: PathBuf,
}

/// Make sure the weights and the tokenizer are in
/// `<resources_dir>/llava-v1.5-7b/`, downloading whatever is missing.
pub async fn ensure_model_artifacts(config: &EngineConfig) -> CaptionResult<ModelArtifacts> {
    let download = FileDownload::new(FileDownloadConfig {
        url: config.download_url.clone(),
        resources_dir: config.resources_dir.clone(),
    });
    let model_dir = download.resources_dir().join(MODEL_ID);

    Ok(ModelArtifacts {
        model: fetch_artifact(&download, &model_dir, MODEL_URI).await?,
        mmproj: fetch_artifact(&download, &model_dir, MMPROJ_URI).await?,
        tokenizer: fetch_artifact(&download, &model_dir, TOKENIZER_URI).await?,
    })
}

async fn fetch_artifact(
    download: &FileDownload,
    model_dir: &Path,
    uri: &str,
) -> CaptionResult<PathBuf> {
    let file_name = uri.rsplit('/').next().unwrap_or(uri);
    let path = download
        .download_to_path_if_not_exists(uri, model_dir.join(file_name))
        .await?;
    Ok(path)
}

/// Download missing artifacts and load the model on its own thread.
/// The returned handle is shared by everything that captions.
pub async fn load_engine(config: &EngineConfig) -> anyhow::Result<ImageCaptionModel> {
    let artifacts = ensure_model_artifacts(config).await?;
    let device = config.device;
    tracing::info!("loading {} from {:?}", MODEL_ID, artifacts);

    AIModel::new(MODEL_ID, move || async move {
        LLaVA::new(
            device,
            artifacts.model,
            artifacts.mmproj,
            artifacts.tokenizer,
            QuantizationConfig::default(),
        )
        .await
    })
    .await
}

/// Run one image through the engine. `max_new_tokens` must be at least 1.
pub async fn caption(
    engine: &ImageCaptionModel,
    image: DynamicImage,
    prompt: impl Into<String>,
    max_new_tokens: usize,
) -> CaptionResult<String> {
    if max_new_tokens == 0 {
        return Err(CaptionError::InvalidRequest(
            "max_new_tokens must be at least 1".to_string(),
        ));
    }
    let input = ImageCaptionInput::new(image, prompt).with_max_new_tokens(max_new_tokens);
    engine
        .process_single(input)
        .await
        .map_err(CaptionError::ModelInference)
}

#[cfg(test)]
mod test {
    use super::{caption, ensure_model_artifacts, MODEL_ID};
    use crate::{testing::fake_engine, CaptionError, EngineConfig};
    use axum::{routing::get, Router};
    use image::DynamicImage;

    #[test_log::test(tokio::test)]
    async fn test_caption_passes_token_budget() {
        let engine = fake_engine().await;
        let text = caption(&engine, DynamicImage::new_rgb8(3, 2), "describe", 17)
            .await
            .unwrap();
        assert_eq!(text, "3x2 17");

        let err = caption(&engine, DynamicImage::new_rgb8(3, 2), "fail", 17)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptionError::ModelInference(_)));
    }

    #[test_log::test(tokio::test)]
    async fn test_caption_rejects_zero_token_budget() {
        let engine = fake_engine().await;
        let err = caption(&engine, DynamicImage::new_rgb8(3, 2), "describe", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptionError::InvalidRequest(_)));

        // the engine is untouched and keeps serving
        let text = caption(&engine, DynamicImage::new_rgb8(3, 2), "describe", 1)
            .await
            .unwrap();
        assert_eq!(text, "3x2 1");
    }

    #[test_log::test(tokio::test)]
    async fn test_artifacts_are_downloaded_once() {
        let app = Router::new().route("/*path", get(|| async { "weights" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            resources_dir: dir.path().to_path_buf(),
            download_url: format!("http://{}", addr),
            ..Default::default()
        };

        let artifacts = ensure_model_artifacts(&config).await.unwrap();
        let model_dir = dir.path().join(MODEL_ID);
        assert_eq!(artifacts.model, model_dir.join("ggml-model-q4_k.gguf"));
        assert_eq!(artifacts.mmproj, model_dir.join("mmproj-model-f16.gguf"));
        assert_eq!(artifacts.tokenizer, model_dir.join("tokenizer.json"));
        assert_eq!(std::fs::read_to_string(&artifacts.tokenizer).unwrap(), "weights");

        // already there, the server is not needed anymore
        let offline = EngineConfig {
            download_url: "http://127.0.0.1:1".to_string(),
            ..config
        };
        ensure_model_artifacts(&offline).await.unwrap();
    }
}
