//! Media Downloader: stream a remote URL to a local file under a
//! deterministic path. No retries here; retry policy lives one level
//! up, in the Sync Engine's per-post processing.

use std::path::PathBuf;

use tokio::io::AsyncWriteExt;

use crate::error::DownloadError;
use crate::state::MediaType;

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub media_key: String,
    pub media_url: String,
    pub media_type: MediaType,
    pub dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LocalFile {
    pub media_key: String,
    pub media_url: String,
    pub media_type: MediaType,
    pub path: PathBuf,
    pub size_bytes: u64,
}

pub struct MediaDownloader {
    client: reqwest::Client,
}

impl Default for MediaDownloader {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaDownloader {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub async fn download(&self, req: DownloadRequest) -> Result<LocalFile, DownloadError> {
        let path = req.dir.join(format!(
            "{}{}",
            req.media_key,
            req.media_type.extension()
        ));

        tokio::fs::create_dir_all(&req.dir).await?;

        let resp = self.client.get(&req.media_url).send().await?;
        if !resp.status().is_success() {
            return Err(DownloadError::EmptyBody);
        }

        let mut stream = resp.bytes_stream();
        let mut file = tokio::fs::File::create(&path).await?;
        let mut size_bytes: u64 = 0;

        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            size_bytes += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        if size_bytes == 0 {
            tokio::fs::remove_file(&path).await.ok();
            return Err(DownloadError::EmptyBody);
        }

        Ok(LocalFile {
            media_key: req.media_key,
            media_url: req.media_url,
            media_type: req.media_type,
            path,
            size_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_path_uses_media_key_and_extension() {
        let dir = tempfile::tempdir().unwrap();
        let req = DownloadRequest {
            media_key: "abc123".to_string(),
            media_url: "https://example.com/a.jpg".to_string(),
            media_type: MediaType::Photo,
            dir: dir.path().to_path_buf(),
        };
        let expected = dir.path().join("abc123.jpg");
        let actual = req.dir.join(format!(
            "{}{}",
            req.media_key,
            req.media_type.extension()
        ));
        assert_eq!(actual, expected);
    }
}
