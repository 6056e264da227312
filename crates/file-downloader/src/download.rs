use crate::error::{DownloadError, DownloadResult};
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{info, warn};

pub struct FileDownloadConfig {
    pub url: String,
    pub resources_dir: PathBuf,
}

pub struct FileDownload {
    url: String,
    resources_dir: PathBuf,
}

impl Default for FileDownloadConfig {
    fn default() -> Self {
        Self {
            url: "https://huggingface.co".to_string(),
            resources_dir: PathBuf::from("resources"),
        }
    }
}

/// Stream `url` into `file_path`, replacing whatever is there.
///
/// The body goes to `<file name>.temp` first and is renamed once complete.
/// The staging file is removed again when the transfer fails.
pub async fn download_to_path(url: &str, file_path: impl AsRef<Path>) -> DownloadResult<PathBuf> {
    let file_path = file_path.as_ref().to_path_buf();
    let request_error = |source| DownloadError::Request {
        url: url.to_string(),
        source,
    };

    let mut response = reqwest::get(url).await.map_err(request_error)?;
    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::Status {
            url: url.to_string(),
            status,
        });
    }

    // create parent folder
    if let Some(parent_dir) = file_path.parent() {
        fs::create_dir_all(parent_dir).await?;
    }

    let temp_download_path = staging_path(&file_path);
    let transfer = async {
        let mut file = File::create(&temp_download_path).await?;
        let mut size = 0;
        while let Some(chunk) = response.chunk().await.map_err(request_error)? {
            size += chunk.len();
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);
        fs::rename(&temp_download_path, &file_path).await?;
        DownloadResult::Ok(size)
    };
    let size = match transfer.await {
        Ok(size) => size,
        Err(e) => {
            if let Err(remove_error) = fs::remove_file(&temp_download_path).await {
                warn!(
                    "failed to remove {:?}: {}",
                    temp_download_path, remove_error
                );
            }
            return Err(e);
        }
    };

    info!("file {:?} downloaded, {} bytes", file_path, size);

    Ok(file_path)
}

/// `a.zip` is staged as `a.zip.temp`, never clobbering a sibling `a.temp`.
fn staging_path(file_path: &Path) -> PathBuf {
    let mut file_name = file_path
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    file_name.push(".temp");
    file_path.with_file_name(file_name)
}

impl FileDownload {
    pub fn new(config: FileDownloadConfig) -> Self {
        Self {
            url: config.url.trim_end_matches('/').to_string(),
            resources_dir: config.resources_dir,
        }
    }

    pub fn resources_dir(&self) -> &Path {
        &self.resources_dir
    }

    pub async fn download_to_path_if_not_exists(
        &self,
        uri: impl AsRef<str>,
        file_path: impl AsRef<Path>,
    ) -> DownloadResult<PathBuf> {
        let file_path = file_path.as_ref().to_path_buf();
        info!("check file path: {:?}", file_path);
        if file_path.exists() {
            return Ok(file_path);
        }

        let download_url = format!("{}/{}", self.url, uri.as_ref().trim_start_matches('/'));
        download_to_path(&download_url, file_path).await
    }

    /// Download `uri` relative to the configured base url into the same
    /// relative path under the resources dir, unless it is already there.
    pub async fn download_if_not_exists(&self, uri: impl AsRef<str>) -> DownloadResult<PathBuf> {
        let file_path = self.resources_dir.join(uri.as_ref());
        self.download_to_path_if_not_exists(uri, file_path).await
    }
}

#[cfg(test)]
mod test {
    use super::{download_to_path, staging_path, FileDownload, FileDownloadConfig};
    use crate::DownloadError;
    use axum::{body::Body, http::StatusCode, routing::get, Router};
    use std::path::Path;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    /// Serves `/ok/*` with a fixed body and everything else with 404.
    async fn serve(hits: Arc<AtomicUsize>) -> String {
        let app = Router::new()
            .route(
                "/ok/*path",
                get(move || {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        "model bytes"
                    }
                }),
            )
            .route(
                "/cut/*path",
                get(|| async {
                    // the connection drops after the first chunk
                    let chunks: Vec<Result<&'static str, std::io::Error>> = vec![
                        Ok("partial bytes"),
                        Err(std::io::Error::new(std::io::ErrorKind::Other, "cut")),
                    ];
                    Body::from_stream(futures::stream::iter(chunks))
                }),
            )
            .fallback(|| async { (StatusCode::NOT_FOUND, "missing") });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test_log::test(tokio::test)]
    async fn test_download_to_path() {
        let base = serve(Default::default()).await;
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("input.zip");

        let path = download_to_path(&format!("{}/ok/input.zip", base), &target)
            .await
            .unwrap();

        assert_eq!(path, target);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "model bytes");
        assert!(!dir.path().join("nested").join("input.zip.temp").exists());
    }

    #[test]
    fn test_staging_path_keeps_extension() {
        assert_eq!(
            staging_path(Path::new("resources/a.zip")),
            Path::new("resources/a.zip.temp")
        );
        assert_eq!(
            staging_path(Path::new("resources/model.Q4_K_M.gguf")),
            Path::new("resources/model.Q4_K_M.gguf.temp")
        );
        assert_eq!(staging_path(Path::new("tokenizer")), Path::new("tokenizer.temp"));
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_transfer_removes_staging_file() {
        let base = serve(Default::default()).await;
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("input.zip");
        // a sibling that only shares the stem is left alone
        let sibling = dir.path().join("input.temp");
        std::fs::write(&sibling, "keep").unwrap();

        let err = download_to_path(&format!("{}/cut/input.zip", base), &target)
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Request { .. }));
        assert!(!target.exists());
        assert!(!dir.path().join("input.zip.temp").exists());
        assert_eq!(std::fs::read_to_string(&sibling).unwrap(), "keep");
    }

    #[test_log::test(tokio::test)]
    async fn test_download_status_error() {
        let base = serve(Default::default()).await;
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("input.zip");

        let err = download_to_path(&format!("{}/gone.zip", base), &target)
            .await
            .unwrap_err();

        match err {
            DownloadError::Status { status, .. } => assert_eq!(status, StatusCode::NOT_FOUND),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!target.exists());
    }

    #[test_log::test(tokio::test)]
    async fn test_download_if_not_exists_skips_existing() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(hits.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let download = FileDownload::new(FileDownloadConfig {
            url: format!("{}/", base),
            resources_dir: dir.path().to_path_buf(),
        });

        let path = download
            .download_if_not_exists("ok/llava/tokenizer.json")
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("ok/llava/tokenizer.json"));

        download
            .download_if_not_exists("ok/llava/tokenizer.json")
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_connection_refused() {
        let err = download_to_path("http://127.0.0.1:1/file", "unused")
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Request { .. }));
    }
}
