use file_downloader::DownloadError;
use image::ImageError;
use thiserror::Error;
use zip::result::ZipError;

pub type CaptionResult<T> = std::result::Result<T, CaptionError>;

#[derive(Error, Debug)]
pub enum CaptionError {
    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Archive error: {0}")]
    Archive(#[from] ZipError),

    #[error("Failed to decode image {name}: {source}")]
    ImageDecode {
        name: String,
        #[source]
        source: ImageError,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Model inference error: {0:#}")]
    ModelInference(anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
