//! Sync Engine: the per-run orchestration pipeline tying the source
//! adapter, state store, downloader, and sink together.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::downloader::{DownloadRequest, LocalFile, MediaDownloader};
use crate::error::{EngineError, SinkError, SourceError};
use crate::retry::retry;
use crate::sink::{SendMediaGroupRequest, SinkAdapter};
use crate::source::{Direction, ListPostsRequest, Post, SourceAdapter};
use crate::state::{media_key, AccountCursor, MediaRecord, MediaStatus, StateStore};

const JOB_NAME: &str = "daily-sync";

pub struct EngineConfig {
    pub accounts: Vec<String>,
    pub backfill_pages_per_run: u32,
    pub max_media_per_run: u32,
    pub download_tmp_dir: PathBuf,
    pub job_lock_ttl_seconds: u64,
    pub max_upload_video_bytes: u64,
    pub source_rate_limit_cooldown_seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountSummary {
    pub handle: String,
    pub uploaded: u32,
    pub skipped: u32,
    pub failed: u32,
    pub incremental_candidates: usize,
    pub incremental_selected: usize,
    pub backfill_candidates: usize,
    pub backfill_selected: usize,
    pub backfill_done: bool,
    pub cooldown_active: bool,
    pub cooldown_until: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub skipped_by_lock: bool,
    pub accounts: Vec<AccountSummary>,
    pub started_at: chrono::DateTime<Utc>,
    pub finished_at: chrono::DateTime<Utc>,
}

pub struct SyncEngine {
    pub(crate) state: StateStore,
    source: Arc<dyn SourceAdapter>,
    sink: Arc<dyn SinkAdapter>,
    downloader: MediaDownloader,
    config: EngineConfig,
}

impl SyncEngine {
    pub fn new(
        state: StateStore,
        source: Arc<dyn SourceAdapter>,
        sink: Arc<dyn SinkAdapter>,
        config: EngineConfig,
    ) -> Self {
        Self {
            state,
            source,
            sink,
            downloader: MediaDownloader::new(),
            config,
        }
    }

    pub async fn run(&self) -> Result<RunSummary, EngineError> {
        let started_at = Utc::now();
        let holder_id = format!("sync-{}-{}", std::process::id(), started_at.timestamp_millis());

        self.state.init().await?;
        tokio::fs::create_dir_all(&self.config.download_tmp_dir).await?;

        let acquired = self
            .state
            .acquire_lock(JOB_NAME, &holder_id, self.config.job_lock_ttl_seconds)
            .await?;

        if !acquired {
            return Ok(RunSummary {
                skipped_by_lock: true,
                accounts: Vec::new(),
                started_at,
                finished_at: Utc::now(),
            });
        }

        let mut accounts = Vec::with_capacity(self.config.accounts.len());
        for handle in &self.config.accounts {
            accounts.push(self.process_account(handle).await);
        }

        if let Err(e) = self.sink.send_text(&render_run_report(&accounts)).await {
            warn!(error = %e, "failed to send aggregated run report");
        }

        self.state.release_lock(JOB_NAME, &holder_id).await?;

        Ok(RunSummary {
            skipped_by_lock: false,
            accounts,
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn process_account(&self, handle: &str) -> AccountSummary {
        let now = Utc::now();
        let cursor = match self.state.get_account(handle).await {
            Ok(c) => c,
            Err(e) => {
                warn!(handle, error = %e, "failed to load account cursor");
                return AccountSummary {
                    handle: handle.to_string(),
                    failed: 1,
                    ..Default::default()
                };
            }
        };

        if cursor.is_in_cooldown(now) {
            return AccountSummary {
                handle: handle.to_string(),
                cooldown_active: true,
                cooldown_until: cursor.rate_limited_until,
                backfill_done: cursor.backfill_done,
                ..Default::default()
            };
        }

        match self.sync_account(handle, &cursor).await {
            Ok(summary) => summary,
            Err(SourceError::RateLimited { hosts }) => {
                let until =
                    now + chrono::Duration::seconds(self.config.source_rate_limit_cooldown_seconds as i64);
                let mut updated = cursor.clone();
                updated.rate_limited_until = Some(until);
                updated.updated_at = now;
                if let Err(e) = self.state.put_account(&updated).await {
                    warn!(handle, error = %e, "failed to persist cooldown cursor");
                }
                info!(handle, ?hosts, "account entered cooldown after rate limit");
                AccountSummary {
                    handle: handle.to_string(),
                    failed: 1,
                    backfill_done: cursor.backfill_done,
                    cooldown_active: true,
                    cooldown_until: Some(until),
                    ..Default::default()
                }
            }
            Err(e) => {
                warn!(handle, error = %e, "account sync failed");
                if let Err(send_err) = self
                    .sink
                    .send_text(&format!("sync failed for @{handle}: {e}"))
                    .await
                {
                    warn!(handle, error = %send_err, "failed to send failure report");
                }
                AccountSummary {
                    handle: handle.to_string(),
                    failed: 1,
                    backfill_done: cursor.backfill_done,
                    ..Default::default()
                }
            }
        }
    }

    async fn sync_account(
        &self,
        handle: &str,
        cursor: &AccountCursor,
    ) -> Result<AccountSummary, SourceError> {
        let incremental = self
            .source
            .list_posts_with_media(ListPostsRequest {
                handle: handle.to_string(),
                direction: Direction::Newer,
                cursor: None,
                page_limit: self.config.backfill_pages_per_run,
            })
            .await?;

        let newest_seen_id = incremental
            .posts
            .first()
            .map(|p| p.id.clone())
            .or_else(|| cursor.latest_seen_post_id.clone());

        let mut accepted_incremental = Vec::new();
        for post in incremental.posts {
            if Some(&post.id) == cursor.latest_seen_post_id.as_ref() {
                break;
            }
            accepted_incremental.push(post);
        }

        let (backfill_posts, next_cursor, backfill_done) = if cursor.backfill_done {
            (Vec::new(), cursor.backfill_cursor.clone(), true)
        } else {
            let result = self
                .source
                .list_posts_with_media(ListPostsRequest {
                    handle: handle.to_string(),
                    direction: Direction::Older,
                    cursor: cursor.backfill_cursor.clone(),
                    page_limit: self.config.backfill_pages_per_run,
                })
                .await?;
            let done = result.next_cursor.is_none();
            (result.posts, result.next_cursor, done)
        };

        let incremental_candidates = accepted_incremental.len();
        let backfill_candidates = backfill_posts.len();

        let mut merged: HashMap<String, Post> = HashMap::new();
        let incremental_ids: std::collections::HashSet<String> =
            accepted_incremental.iter().map(|p| p.id.clone()).collect();
        for post in accepted_incremental.into_iter().chain(backfill_posts) {
            merged.entry(post.id.clone()).or_insert(post);
        }
        let mut candidates: Vec<Post> = merged.into_values().collect();
        candidates.sort_by_key(|p| p.numeric_id);

        let incremental_candidates_list: Vec<Post> = candidates
            .iter()
            .filter(|p| incremental_ids.contains(&p.id))
            .cloned()
            .collect();
        let backfill_candidates_list: Vec<Post> = candidates
            .into_iter()
            .filter(|p| !incremental_ids.contains(&p.id))
            .collect();

        let mut budget = self.config.max_media_per_run as i64;
        let mut selected = Vec::new();
        let mut incremental_selected = 0usize;
        let mut backfill_selected = 0usize;

        for post in incremental_candidates_list {
            if budget <= 0 {
                break;
            }
            if post.media_count() as i64 > budget && !selected.is_empty() {
                continue;
            }
            budget -= post.media_count() as i64;
            incremental_selected += 1;
            selected.push(post);
        }
        for post in backfill_candidates_list {
            if budget <= 0 {
                break;
            }
            if post.media_count() as i64 > budget && !selected.is_empty() {
                continue;
            }
            budget -= post.media_count() as i64;
            backfill_selected += 1;
            selected.push(post);
        }

        let mut uploaded = 0u32;
        let mut skipped = 0u32;
        let mut failed = 0u32;

        for post in selected {
            let counters = self.process_post(handle, &post).await;
            uploaded += counters.0;
            skipped += counters.1;
            failed += counters.2;
        }

        let updated_cursor = AccountCursor {
            handle: handle.to_string(),
            latest_seen_post_id: newest_seen_id,
            backfill_cursor: next_cursor,
            backfill_done,
            rate_limited_until: None,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.state.put_account(&updated_cursor).await {
            warn!(handle, error = %e, "failed to persist updated cursor");
        }

        Ok(AccountSummary {
            handle: handle.to_string(),
            uploaded,
            skipped,
            failed,
            incremental_candidates,
            incremental_selected,
            backfill_candidates,
            backfill_selected,
            backfill_done,
            cooldown_active: false,
            cooldown_until: None,
        })
    }

    /// Returns `(uploaded, skipped, failed)` for one post.
    async fn process_post(&self, handle: &str, post: &Post) -> (u32, u32, u32) {
        let account_dir = self.config.download_tmp_dir.join(handle);
        let mut downloaded: Vec<LocalFile> = Vec::new();
        let mut send_list: Vec<LocalFile> = Vec::new();
        let mut uploaded = 0u32;
        let mut skipped = 0u32;
        let mut failed = 0u32;
        let mut had_error = false;

        for media in &post.media {
            let key = media_key(&post.id, &media.url);

            match self.state.is_media_uploaded(&key).await {
                Ok(true) => {
                    skipped += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(handle, post_id = %post.id, error = %e, "dedupe lookup failed");
                    failed += 1;
                    had_error = true;
                    break;
                }
            }

            let download_result = retry(2, Duration::from_secs(1), 2.0, || {
                self.downloader.download(DownloadRequest {
                    media_key: key.clone(),
                    media_url: media.url.clone(),
                    media_type: media.media_type,
                    dir: account_dir.clone(),
                })
            })
            .await;

            let local_file = match download_result {
                Ok(f) => f,
                Err(e) => {
                    warn!(handle, post_id = %post.id, error = %e, "download failed");
                    failed += 1;
                    had_error = true;
                    break;
                }
            };
            downloaded.push(local_file.clone());

            let is_oversize = !matches!(media.media_type, crate::state::MediaType::Photo)
                && local_file.size_bytes > self.config.max_upload_video_bytes;

            if is_oversize {
                let record = MediaRecord {
                    media_key: key.clone(),
                    post_id: post.id.clone(),
                    account_handle: handle.to_string(),
                    media_url: media.url.clone(),
                    media_type: media.media_type,
                    uploaded_at: Utc::now(),
                    sink_message_ids: Vec::new(),
                    status: MediaStatus::SkippedOversize,
                };
                if let Err(e) = self.state.mark_media(&record).await {
                    warn!(handle, post_id = %post.id, error = %e, "failed to record oversize skip");
                }
                tokio::fs::remove_file(&local_file.path).await.ok();
                skipped += 1;
                continue;
            }

            send_list.push(local_file);
        }

        if !had_error && !send_list.is_empty() {
            let files = send_list.clone();
            let send_result: Result<Vec<String>, SinkError> = retry(
                2,
                Duration::from_millis(1500),
                2.0,
                || {
                    let req = SendMediaGroupRequest {
                        post_url: format!("https://source.example/status/{}", post.id),
                        handle: handle.to_string(),
                        posted_at: Utc::now(),
                        files: files.clone(),
                    };
                    self.sink.send_media_group(req)
                },
            )
            .await;

            match send_result {
                Ok(message_ids) => {
                    for (i, file) in send_list.iter().enumerate() {
                        let ids = if message_ids.len() == send_list.len() {
                            vec![message_ids[i].clone()]
                        } else {
                            message_ids.clone()
                        };
                        let record = MediaRecord {
                            media_key: file.media_key.clone(),
                            post_id: post.id.clone(),
                            account_handle: handle.to_string(),
                            media_url: file.media_url.clone(),
                            media_type: file.media_type,
                            uploaded_at: Utc::now(),
                            sink_message_ids: ids,
                            status: MediaStatus::Uploaded,
                        };
                        if let Err(e) = self.state.mark_media(&record).await {
                            warn!(handle, post_id = %post.id, error = %e, "failed to record upload");
                        }
                    }
                    uploaded += send_list.len() as u32;
                }
                Err(e) => {
                    warn!(handle, post_id = %post.id, error = %e, "sink upload failed");
                    failed += 1;
                }
            }
        }

        for file in &downloaded {
            tokio::fs::remove_file(&file.path).await.ok();
        }

        (uploaded, skipped, failed)
    }
}

fn render_run_report(accounts: &[AccountSummary]) -> String {
    let mut lines = vec!["daily sync complete".to_string()];
    for a in accounts {
        lines.push(format!(
            "@{}: uploaded={} skipped={} failed={} cooldown={}",
            a.handle, a.uploaded, a.skipped, a.failed, a.cooldown_active
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SendMediaGroupRequest as SinkReq;
    use crate::source::{ListPostsResult, MediaItem, SessionCheck};
    use crate::state::MediaType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeSource {
        pages: StdMutex<Vec<ListPostsResult>>,
    }

    #[async_trait::async_trait]
    impl SourceAdapter for FakeSource {
        async fn list_posts_with_media(
            &self,
            _req: ListPostsRequest,
        ) -> Result<ListPostsResult, SourceError> {
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                Ok(ListPostsResult::default())
            } else {
                Ok(pages.remove(0))
            }
        }

        async fn check_session(&self) -> SessionCheck {
            SessionCheck {
                logged_in: true,
                host: None,
                reason: None,
            }
        }

        async fn health_check(&self, _handle: &str) -> Result<(), SourceError> {
            Ok(())
        }
    }

    struct FakeSink {
        next_id: AtomicUsize,
        pub texts: StdMutex<Vec<String>>,
    }

    impl Default for FakeSink {
        fn default() -> Self {
            Self {
                next_id: AtomicUsize::new(1),
                texts: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl SinkAdapter for FakeSink {
        async fn send_media_group(&self, req: SinkReq) -> Result<Vec<String>, SinkError> {
            Ok(req
                .files
                .iter()
                .map(|_| self.next_id.fetch_add(1, Ordering::SeqCst).to_string())
                .collect())
        }

        async fn send_text(&self, message: &str) -> Result<(), SinkError> {
            self.texts.lock().unwrap().push(message.to_string());
            Ok(())
        }

        async fn health_check(&self) -> Result<(), SinkError> {
            Ok(())
        }

        async fn disconnect(&self) {}
    }

    fn post(id: &str, media_urls: &[&str]) -> Post {
        Post {
            id: id.to_string(),
            numeric_id: id.parse().unwrap(),
            media: media_urls
                .iter()
                .map(|u| MediaItem {
                    url: u.to_string(),
                    media_type: MediaType::Photo,
                })
                .collect(),
        }
    }

    async fn engine_with(
        pages: Vec<ListPostsResult>,
        sink: Arc<FakeSink>,
        dir: &std::path::Path,
    ) -> SyncEngine {
        let state = StateStore::connect(dir.join("state.sqlite")).await.unwrap();
        let source = Arc::new(FakeSource {
            pages: StdMutex::new(pages),
        });
        SyncEngine::new(
            state,
            source,
            sink,
            EngineConfig {
                accounts: vec!["alice".to_string()],
                backfill_pages_per_run: 2,
                max_media_per_run: 300,
                download_tmp_dir: dir.join("scratch"),
                job_lock_ttl_seconds: 3300,
                max_upload_video_bytes: 512 * 1024 * 1024,
                source_rate_limit_cooldown_seconds: 7200,
            },
        )
    }

    #[tokio::test]
    async fn lock_held_skips_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateStore::connect(dir.path().join("state.sqlite"))
            .await
            .unwrap();
        state.init().await.unwrap();
        state.acquire_lock("daily-sync", "other", 100).await.unwrap();

        let source = Arc::new(FakeSource {
            pages: StdMutex::new(Vec::new()),
        });
        let sink = Arc::new(FakeSink::default());
        let engine = SyncEngine::new(
            state,
            source,
            sink,
            EngineConfig {
                accounts: vec!["alice".to_string()],
                backfill_pages_per_run: 2,
                max_media_per_run: 300,
                download_tmp_dir: dir.path().join("scratch"),
                job_lock_ttl_seconds: 3300,
                max_upload_video_bytes: 512 * 1024 * 1024,
                source_rate_limit_cooldown_seconds: 7200,
            },
        );

        let summary = engine.run().await.unwrap();
        assert!(summary.skipped_by_lock);
        assert!(summary.accounts.is_empty());
    }

    #[tokio::test]
    async fn empty_account_list_still_completes_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(FakeSink::default());
        let mut engine = engine_with(Vec::new(), sink.clone(), dir.path()).await;
        engine.config.accounts = Vec::new();
        let summary = engine.run().await.unwrap();
        assert!(!summary.skipped_by_lock);
        assert!(summary.accounts.is_empty());
        assert_eq!(sink.texts.lock().unwrap().len(), 1);
    }

    async fn downloadable_server(url_path: &str, body: &'static [u8]) -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let path = url_path.to_string();
        let handle = tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                let _ = path; // path unused beyond documentation of intent
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.write_all(body).await;
            }
        });
        (format!("http://{addr}"), handle)
    }

    #[tokio::test]
    async fn first_run_uploads_then_second_run_sees_no_new_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let (base_url, _server) = downloadable_server("/a.jpg", b"fake-jpeg-bytes").await;

        let page = ListPostsResult {
            posts: vec![post("1", &[&format!("{base_url}/a.jpg")])],
            next_cursor: None,
        };
        let sink = Arc::new(FakeSink::default());
        let engine = engine_with(vec![page.clone(), ListPostsResult::default()], sink.clone(), dir.path()).await;

        let summary = engine.run().await.unwrap();
        let alice = &summary.accounts[0];
        assert_eq!(alice.uploaded, 1);
        assert_eq!(alice.skipped, 0);
        assert_eq!(alice.failed, 0);

        let cursor = engine.state.get_account("alice").await.unwrap();
        assert_eq!(cursor.latest_seen_post_id.as_deref(), Some("1"));

        // Second run observes the same newest post again: the incremental
        // stop-at-latest-seen rule means it is never re-selected.
        let engine2 = engine_with(
            vec![
                ListPostsResult {
                    posts: vec![post("1", &[&format!("{base_url}/a.jpg")])],
                    next_cursor: None,
                },
                ListPostsResult::default(),
            ],
            sink,
            dir.path(),
        )
        .await;
        // Share the same database file as the first engine.
        let engine2 = SyncEngine {
            state: StateStore::connect(dir.path().join("state.sqlite")).await.unwrap(),
            ..engine2
        };
        let summary2 = engine2.run().await.unwrap();
        let alice2 = &summary2.accounts[0];
        assert_eq!(alice2.uploaded, 0);
        assert_eq!(alice2.skipped, 0);

        // The dedupe registry still rejects re-processing the same media
        // key directly, independent of candidate selection.
        let key = media_key("1", &format!("{base_url}/a.jpg"));
        assert!(engine2.state.is_media_uploaded(&key).await.unwrap());
    }
}
