use crate::{
    archive::{list_files, pack_archive, unpack_archive},
    decode::decode_image_file,
    engine::caption,
    error::{CaptionError, CaptionResult},
};
use ai::ImageCaptionModel;
use futures::{stream, StreamExt};
use std::path::{Path, PathBuf};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::Instrument;

pub const BATCH_PROMPT: &str = "USER: <image>\nFind construction entities on the image. Split answer in two sections LIST and EXPLANATION. Put detected object to LIST section. Put explanation of the answer into EXPLANATION section.\nASSISTANT:";

/// What a batch does when one image cannot be captioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr, Display)]
#[strum(ascii_case_insensitive)]
pub enum OnImageError {
    /// Fail the whole job, no output archive is written.
    #[default]
    Abort,
    /// Log, record in `BatchReport::failed` and go on with the next image.
    Skip,
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub prompt: String,
    pub max_new_tokens: usize,
    /// images in flight at once, at least 1
    pub workers: usize,
    pub on_error: OnImageError,
}

impl From<&crate::config::BatchConfig> for BatchOptions {
    fn from(config: &crate::config::BatchConfig) -> Self {
        Self {
            prompt: config.prompt.clone(),
            max_new_tokens: config.max_new_tokens,
            workers: config.workers,
            on_error: config.on_error,
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    /// file names of captioned images, sorted
    pub captioned: Vec<String>,
    pub failed: Vec<(String, CaptionError)>,
}

pub struct BatchJob {
    engine: ImageCaptionModel,
    options: BatchOptions,
}

impl BatchJob {
    pub fn new(engine: ImageCaptionModel, options: BatchOptions) -> Self {
        Self { engine, options }
    }

    /// Download the zip at `images_url`, caption every image in it and
    /// write `<image name>.txt` files into `output_path`.
    pub async fn run(
        &self,
        images_url: &str,
        output_path: impl AsRef<Path>,
    ) -> CaptionResult<BatchReport> {
        let scratch_dir = tempfile::tempdir()?;
        let archive_path = scratch_dir.path().join("input.zip");

        tracing::info!("downloading images from {}", images_url);
        file_downloader::download_to_path(images_url, &archive_path).await?;

        self.caption_archive(&archive_path, output_path).await
    }

    /// Same as `run`, for an archive that is already on disk.
    pub async fn caption_archive(
        &self,
        archive_path: impl AsRef<Path>,
        output_path: impl AsRef<Path>,
    ) -> CaptionResult<BatchReport> {
        // removed on drop, whichever way this returns
        let scratch_dir = tempfile::tempdir()?;
        let images_dir = scratch_dir.path().join("images");
        let results_dir = scratch_dir.path().join("results");
        tokio::fs::create_dir_all(&results_dir).await?;

        let images = {
            let archive_path = archive_path.as_ref().to_path_buf();
            let images_dir = images_dir.clone();
            tokio::task::spawn_blocking(move || -> CaptionResult<Vec<PathBuf>> {
                unpack_archive(&archive_path, &images_dir)?;
                if !images_dir.exists() {
                    // empty archive
                    return Ok(vec![]);
                }
                list_files(&images_dir)
            })
            .await??
        };
        tracing::info!("{} images to caption", images.len());

        let results_dir_ref = results_dir.as_path();
        let mut captions = stream::iter(images)
            .map(move |image_path| self.caption_image(image_path, results_dir_ref))
            .buffer_unordered(self.options.workers.max(1));

        let mut report = BatchReport::default();
        while let Some((name, result)) = captions.next().await {
            match result {
                Ok(()) => report.captioned.push(name),
                Err(e) => match self.options.on_error {
                    OnImageError::Abort => {
                        tracing::error!("failed to caption {}, abort: {}", name, e);
                        return Err(e);
                    }
                    OnImageError::Skip => {
                        tracing::warn!("failed to caption {}, skip: {}", name, e);
                        report.failed.push((name, e));
                    }
                },
            }
        }
        report.captioned.sort();
        report.failed.sort_by(|a, b| a.0.cmp(&b.0));

        let result_files = report
            .captioned
            .iter()
            .map(|name| results_dir.join(caption_file_name(name)))
            .collect::<Vec<_>>();
        let output_path = output_path.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || pack_archive(&result_files, &output_path)).await??;

        tracing::info!(
            "{} images captioned, {} failed",
            report.captioned.len(),
            report.failed.len()
        );

        Ok(report)
    }

    async fn caption_image(
        &self,
        image_path: PathBuf,
        results_dir: &Path,
    ) -> (String, CaptionResult<()>) {
        let name = image_path
            .file_name()
            .map(|v| v.to_string_lossy().to_string())
            .unwrap_or_default();
        let span = tracing::info_span!("caption_image", name = %name);

        let result = async {
            let image = tokio::task::spawn_blocking(move || decode_image_file(image_path)).await??;
            let text = caption(
                &self.engine,
                image,
                self.options.prompt.clone(),
                self.options.max_new_tokens,
            )
            .await?;
            tokio::fs::write(results_dir.join(caption_file_name(&name)), text).await?;
            tracing::debug!("caption written");
            Ok::<(), CaptionError>(())
        }
        .instrument(span)
        .await;

        (name, result)
    }
}

fn caption_file_name(image_name: &str) -> String {
    format!("{}.txt", image_name)
}
