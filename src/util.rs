use std::path::{Path, PathBuf};

use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use tokio::{fs::File, io::AsyncWriteExt};

/// Wrapper around [`reqwest::Client`] that retries transient HTTP failures.
pub struct HttpClient {
    pub client: ClientWithMiddleware,
}

#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    #[error("reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("reqwest middleware error: {0}")]
    ReqwestMiddlewareError(#[from] reqwest_middleware::Error),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

impl HttpClient {
    pub fn new() -> reqwest::Result<HttpClient> {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let client = reqwest::Client::builder()
            .user_agent(concat!("ytplay-rs/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let client = reqwest_middleware::ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(HttpClient { client })
    }

    /// Streams `url` into `path`, going through a `.tmp` sibling so a failed
    /// download never leaves a truncated file at the final location. The
    /// `.tmp` file is removed again when the download fails.
    pub async fn download_file(&self, url: &str, path: &Path) -> Result<u64, DownloadError> {
        let temp_path = tmp_sibling(path);
        let size = match self.write_body(url, &temp_path).await {
            Ok(size) => size,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(e);
            }
        };

        tokio::fs::rename(&temp_path, path).await?;
        Ok(size)
    }

    async fn write_body(&self, url: &str, path: &Path) -> Result<u64, DownloadError> {
        let mut file = File::create(path).await?;
        let mut resp = self.client.get(url).send().await?.error_for_status()?;
        let mut size = 0;

        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }

        file.flush().await?;
        Ok(size)
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, DownloadError> {
        self.client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
            .map_err(|e| e.into())
    }
}

/// `foo/bar.json` -> `foo/bar.json.tmp`
pub fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

pub fn format_bytes(bytes: u64) -> String {
    let mut bytes = bytes as f64;
    let mut suffix = "B";

    for next in ["KiB", "MiB", "GiB", "TiB"] {
        if bytes <= 1024.0 {
            break;
        }
        bytes /= 1024.0;
        suffix = next;
    }

    format!("{:.2} {}", bytes, suffix)
}
