//! Sink Adapter: interface to the archive channel on the messaging
//! platform. The concrete wire format is out of scope beyond "send an
//! ordered group of local files with a caption and receive back message
//! ids"; [`HttpSink`] is a thin `reqwest`-multipart client that satisfies
//! that contract without modeling the full messaging protocol.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::downloader::LocalFile;
use crate::error::SinkError;

const MAX_GROUP_SIZE: usize = 10;

#[derive(Debug, Clone)]
pub struct SendMediaGroupRequest {
    pub post_url: String,
    pub handle: String,
    pub posted_at: DateTime<Utc>,
    pub files: Vec<LocalFile>,
}

#[async_trait]
pub trait SinkAdapter: Send + Sync {
    async fn send_media_group(
        &self,
        req: SendMediaGroupRequest,
    ) -> Result<Vec<String>, SinkError>;

    async fn send_text(&self, message: &str) -> Result<(), SinkError>;

    async fn health_check(&self) -> Result<(), SinkError>;

    async fn disconnect(&self);
}

/// Groups of at most [`MAX_GROUP_SIZE`] files, each captioned
/// `"@<handle>\n<iso_posted_at>\n<post_url>\n[part N]"`, the "part N" line
/// present only on groups after the first.
pub fn caption_for_group(req: &SendMediaGroupRequest, group_index: usize) -> String {
    let mut caption = format!(
        "@{}\n{}\n{}",
        req.handle,
        req.posted_at.to_rfc3339(),
        req.post_url
    );
    if group_index > 0 {
        caption.push_str(&format!("\n[part {}]", group_index + 1));
    }
    caption
}

pub fn partition_into_groups(files: &[LocalFile]) -> Vec<&[LocalFile]> {
    files.chunks(MAX_GROUP_SIZE).collect()
}

pub struct HttpSink {
    client: reqwest::Client,
    base_url: String,
    api_id: String,
    api_hash: String,
    string_session: String,
    channel: String,
}

impl HttpSink {
    pub fn new(
        base_url: impl Into<String>,
        api_id: impl Into<String>,
        api_hash: impl Into<String>,
        string_session: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_id: api_id.into(),
            api_hash: api_hash.into(),
            string_session: string_session.into(),
            channel: channel.into(),
        }
    }

    fn session_header(&self) -> String {
        format!(
            "{}:{}:{}",
            self.api_id, self.api_hash, self.string_session
        )
    }

    async fn upload_group(
        &self,
        files: &[LocalFile],
        caption: &str,
    ) -> Result<Vec<String>, SinkError> {
        let mut form = reqwest::multipart::Form::new()
            .text("channel", self.channel.clone())
            .text("caption", caption.to_string());

        for file in files {
            let bytes = tokio::fs::read(&file.path)
                .await
                .map_err(|e| SinkError::Request(e.to_string()))?;
            let file_name = file
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("media")
                .to_string();
            let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
            form = form.part("files[]", part);
        }

        let resp = self
            .client
            .post(format!("{}/sendMediaGroup", self.base_url))
            .header("X-Session", self.session_header())
            .multipart(form)
            .send()
            .await
            .map_err(|e| SinkError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(SinkError::Rejected(format!("HTTP {}", resp.status())));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| SinkError::Request(e.to_string()))?;

        body.get("message_ids")
            .and_then(|v| v.as_array())
            .map(|ids| {
                ids.iter()
                    .map(|id| id.as_str().unwrap_or_default().to_string())
                    .collect()
            })
            .ok_or_else(|| SinkError::Rejected("response missing message_ids".to_string()))
    }
}

#[async_trait]
impl SinkAdapter for HttpSink {
    async fn send_media_group(
        &self,
        req: SendMediaGroupRequest,
    ) -> Result<Vec<String>, SinkError> {
        let mut all_ids = Vec::new();
        let groups = partition_into_groups(&req.files);
        for (i, group) in groups.iter().enumerate() {
            let caption = caption_for_group(&req, i);
            let ids = self.upload_group(group, &caption).await?;
            all_ids.extend(ids);
        }
        Ok(all_ids)
    }

    async fn send_text(&self, message: &str) -> Result<(), SinkError> {
        let resp = self
            .client
            .post(format!("{}/sendMessage", self.base_url))
            .header("X-Session", self.session_header())
            .json(&serde_json::json!({ "channel": self.channel, "text": message }))
            .send()
            .await
            .map_err(|e| SinkError::Request(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(SinkError::Rejected(format!("HTTP {}", resp.status())));
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), SinkError> {
        let resp = self
            .client
            .get(format!("{}/health", self.base_url))
            .header("X-Session", self.session_header())
            .send()
            .await
            .map_err(|e| SinkError::Request(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(SinkError::Rejected(format!("HTTP {}", resp.status())));
        }
        Ok(())
    }

    async fn disconnect(&self) {}
}
