//! Source Adapter: authenticated, paged retrieval of a user's
//! media-bearing posts, with host failover, credential rotation, and
//! rate-limit classification.

mod protocol;

use std::collections::BTreeSet;
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use sync_config::CookieEntry;

use crate::error::SourceError;
use crate::state::MediaType;

/// Built-in bearer fallbacks, used only when `SOURCE_WEB_BEARER_TOKEN` is
/// unset. Treated as configuration, not a secret the system controls the
/// lifetime of.
const DEFAULT_BEARER_CANDIDATES: &[&str] = &[
    "AAAAAAAAAAAAAAAAAAAAANRILgAAAAAAnNwIzUejRCOuH5E6I8xnZz4puTs%3D1Zv7ttfk8LF81IUq16cHjhLTvJu4FA33AGWWjCpTnA",
];

const PAGE_SIZE: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Newer,
    Older,
}

#[derive(Debug, Clone)]
pub struct ListPostsRequest {
    pub handle: String,
    pub direction: Direction,
    pub cursor: Option<String>,
    pub page_limit: u32,
}

#[derive(Debug, Clone)]
pub struct MediaItem {
    pub url: String,
    pub media_type: MediaType,
}

#[derive(Debug, Clone)]
pub struct Post {
    pub id: String,
    pub numeric_id: u64,
    pub media: Vec<MediaItem>,
}

impl Post {
    pub fn media_count(&self) -> usize {
        self.media.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListPostsResult {
    pub posts: Vec<Post>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionCheck {
    pub logged_in: bool,
    pub host: Option<String>,
    pub reason: Option<String>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    async fn list_posts_with_media(
        &self,
        req: ListPostsRequest,
    ) -> Result<ListPostsResult, SourceError>;

    async fn check_session(&self) -> SessionCheck;

    async fn health_check(&self, handle: &str) -> Result<(), SourceError>;
}

/// Outcome of a single request to a single host.
enum Outcome {
    Success(serde_json::Value),
    RateLimit,
    AuthFailure,
    Generic(String),
}

pub struct HttpSourceAdapter {
    client: Client,
    hosts: Mutex<Vec<String>>,
    auth_pairs: Vec<(String, String)>,
    auth_pair_index: Mutex<usize>,
    bearer_candidates: Vec<String>,
    bearer_index: Mutex<usize>,
    other_cookies: String,
    guest_token: Option<String>,
}

impl HttpSourceAdapter {
    pub fn new(
        cookies: &[CookieEntry],
        bearer_override: Option<String>,
        primary_host: impl Into<String>,
        alternate_host: impl Into<String>,
    ) -> Self {
        let auth_pairs = extract_auth_pairs(cookies);
        let other_cookies = cookies
            .iter()
            .filter(|c| c.name != "auth_token" && c.name != "ct0")
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ");
        let guest_token = cookies
            .iter()
            .find(|c| c.name == "gt")
            .map(|c| c.value.clone());

        let bearer_candidates = match bearer_override {
            Some(token) => vec![token],
            None => DEFAULT_BEARER_CANDIDATES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };

        Self {
            client: Client::new(),
            hosts: Mutex::new(vec![primary_host.into(), alternate_host.into()]),
            auth_pairs,
            auth_pair_index: Mutex::new(0),
            bearer_candidates,
            bearer_index: Mutex::new(0),
            other_cookies,
            guest_token,
        }
    }

    fn preferred_hosts(&self) -> Vec<String> {
        self.hosts.lock().expect("hosts mutex poisoned").clone()
    }

    fn prefer_host(&self, host: &str) {
        let mut hosts = self.hosts.lock().expect("hosts mutex poisoned");
        if let Some(pos) = hosts.iter().position(|h| h == host) {
            let preferred = hosts.remove(pos);
            hosts.insert(0, preferred);
        }
    }

    fn current_auth_pair(&self) -> Option<(String, String)> {
        let idx = *self.auth_pair_index.lock().expect("mutex poisoned");
        self.auth_pairs.get(idx).cloned()
    }

    fn current_bearer(&self) -> Option<String> {
        let idx = *self.bearer_index.lock().expect("mutex poisoned");
        self.bearer_candidates.get(idx).cloned()
    }

    /// Rotate auth-pair index; if none remain, rotate bearer index.
    /// Returns false if neither can rotate further.
    fn rotate_credentials(&self) -> bool {
        let mut auth_idx = self.auth_pair_index.lock().expect("mutex poisoned");
        if *auth_idx + 1 < self.auth_pairs.len() {
            *auth_idx += 1;
            return true;
        }
        drop(auth_idx);

        let mut bearer_idx = self.bearer_index.lock().expect("mutex poisoned");
        if *bearer_idx + 1 < self.bearer_candidates.len() {
            *bearer_idx += 1;
            return true;
        }
        false
    }

    async fn request(
        &self,
        host: &str,
        query_path: &str,
        params: &[(&str, String)],
    ) -> Outcome {
        let Some((auth_token, ct0)) = self.current_auth_pair() else {
            return Outcome::AuthFailure;
        };
        let Some(bearer) = self.current_bearer() else {
            return Outcome::AuthFailure;
        };

        let cookie_header = if self.other_cookies.is_empty() {
            format!("auth_token={auth_token}; ct0={ct0}")
        } else {
            format!("auth_token={auth_token}; ct0={ct0}; {}", self.other_cookies)
        };

        let mut req = self
            .client
            .get(format!("{host}{query_path}"))
            .query(params)
            .header("Authorization", format!("Bearer {bearer}"))
            .header("x-csrf-token", &ct0)
            .header("Cookie", cookie_header)
            .header(
                "User-Agent",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36",
            )
            .header("Origin", host)
            .header("Referer", format!("{host}/"));

        if let Some(gt) = &self.guest_token {
            req = req.header("x-guest-token", gt);
        }

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => return Outcome::Generic(e.to_string()),
        };

        let status = resp.status();
        let body: serde_json::Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => {
                if status == StatusCode::TOO_MANY_REQUESTS {
                    return Outcome::RateLimit;
                }
                if status == StatusCode::UNAUTHORIZED {
                    return Outcome::AuthFailure;
                }
                return Outcome::Generic(e.to_string());
            }
        };

        let errors = body.get("errors").and_then(|e| e.as_array());
        let has_code = |code: i64| {
            errors
                .map(|errs| {
                    errs.iter()
                        .any(|e| e.get("code").and_then(|c| c.as_i64()) == Some(code))
                })
                .unwrap_or(false)
        };

        if status == StatusCode::TOO_MANY_REQUESTS || has_code(88) {
            return Outcome::RateLimit;
        }
        if status == StatusCode::UNAUTHORIZED || has_code(32) {
            return Outcome::AuthFailure;
        }
        if !status.is_success() || errors.map(|e| !e.is_empty()).unwrap_or(false) {
            return Outcome::Generic(format!("HTTP {status}"));
        }

        Outcome::Success(body)
    }

    /// Tries each preferred host in turn, rotating credentials on auth
    /// failure and giving up only once every host and every credential
    /// combination has been exhausted.
    async fn request_with_failover(
        &self,
        query_path: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value, SourceError> {
        let mut last_error = String::new();

        for _attempt in 0..3 {
            let hosts = self.preferred_hosts();
            let mut rate_limited_hosts = BTreeSet::new();
            let mut saw_auth_failure = false;
            let mut succeeded = None;

            for host in &hosts {
                match self.request(host, query_path, params).await {
                    Outcome::Success(body) => {
                        self.prefer_host(host);
                        succeeded = Some(body);
                        break;
                    }
                    Outcome::RateLimit => {
                        rate_limited_hosts.insert(host.clone());
                    }
                    Outcome::AuthFailure => {
                        saw_auth_failure = true;
                    }
                    Outcome::Generic(msg) => {
                        last_error = msg;
                    }
                }
            }

            if let Some(body) = succeeded {
                return Ok(body);
            }

            if rate_limited_hosts.len() == hosts.len() {
                return Err(SourceError::RateLimited {
                    hosts: rate_limited_hosts,
                });
            }

            if saw_auth_failure {
                if self.rotate_credentials() {
                    continue;
                }
                return Err(SourceError::AuthInvalid(
                    "auth rotation exhausted".to_string(),
                ));
            }

            return Err(SourceError::Generic(if last_error.is_empty() {
                "request failed on every host".to_string()
            } else {
                last_error
            }));
        }

        Err(SourceError::Generic(last_error))
    }

    async fn resolve_user_id(&self, handle: &str) -> Result<String, SourceError> {
        let body = self
            .request_with_failover(
                "/graphql/user-by-screen-name",
                &[("variables", format!(r#"{{"screen_name":"{handle}"}}"#))],
            )
            .await?;
        protocol::extract_user_id(&body)
            .ok_or_else(|| SourceError::Generic(format!("no user id for handle {handle}")))
    }
}

#[async_trait]
impl SourceAdapter for HttpSourceAdapter {
    async fn list_posts_with_media(
        &self,
        req: ListPostsRequest,
    ) -> Result<ListPostsResult, SourceError> {
        let user_id = self.resolve_user_id(&req.handle).await?;

        let mut all_posts = Vec::new();
        let mut cursor = req.cursor.clone();
        let mut last_bottom_cursor = None;

        for _page in 0..req.page_limit {
            let direction_key = match req.direction {
                Direction::Newer => "top",
                Direction::Older => "bottom",
            };
            let mut variables = format!(
                r#"{{"userId":"{user_id}","count":{PAGE_SIZE},"direction":"{direction_key}""#
            );
            if let Some(c) = &cursor {
                variables.push_str(&format!(r#","cursor":"{c}""#));
            }
            variables.push('}');

            let body = self
                .request_with_failover("/graphql/user-posts", &[("variables", variables)])
                .await?;

            let page = protocol::extract_page(&body);
            all_posts.extend(page.posts);

            match page.bottom_cursor {
                Some(next) if Some(&next) != cursor.as_ref() => {
                    cursor = Some(next.clone());
                    last_bottom_cursor = Some(next);
                }
                _ => break,
            }
        }

        let mut by_id = std::collections::HashMap::new();
        for post in all_posts {
            by_id.entry(post.id.clone()).or_insert(post);
        }
        let mut posts: Vec<Post> = by_id.into_values().collect();
        posts.sort_by_key(|p| std::cmp::Reverse(p.numeric_id));

        let next_cursor = match req.direction {
            Direction::Older => last_bottom_cursor,
            Direction::Newer => None,
        };

        Ok(ListPostsResult { posts, next_cursor })
    }

    async fn check_session(&self) -> SessionCheck {
        const PROBE_HANDLE: &str = "jack";
        let result = self
            .request_with_failover(
                "/graphql/user-by-screen-name",
                &[(
                    "variables",
                    format!(r#"{{"screen_name":"{PROBE_HANDLE}"}}"#),
                )],
            )
            .await;

        match result {
            Ok(_) => SessionCheck {
                logged_in: true,
                host: self.preferred_hosts().into_iter().next(),
                reason: None,
            },
            Err(e) => SessionCheck {
                logged_in: false,
                host: None,
                reason: Some(e.to_string()),
            },
        }
    }

    async fn health_check(&self, handle: &str) -> Result<(), SourceError> {
        let check = self.check_session().await;
        if !check.logged_in {
            return Err(SourceError::AuthInvalid(
                check.reason.unwrap_or_else(|| "session check failed".to_string()),
            ));
        }
        self.resolve_user_id(handle).await?;
        Ok(())
    }
}

fn extract_auth_pairs(cookies: &[CookieEntry]) -> Vec<(String, String)> {
    use std::collections::HashMap;

    let mut by_domain: HashMap<String, (Option<String>, Option<String>)> = HashMap::new();
    let mut flat: (Option<String>, Option<String>) = (None, None);

    for cookie in cookies {
        match cookie.name.as_str() {
            "auth_token" => {
                flat.0 = Some(cookie.value.clone());
                if let Some(domain) = &cookie.domain {
                    by_domain.entry(domain.clone()).or_default().0 = Some(cookie.value.clone());
                }
            }
            "ct0" => {
                flat.1 = Some(cookie.value.clone());
                if let Some(domain) = &cookie.domain {
                    by_domain.entry(domain.clone()).or_default().1 = Some(cookie.value.clone());
                }
            }
            _ => {}
        }
    }

    let mut pairs: Vec<(String, String)> = by_domain
        .into_values()
        .filter_map(|(a, c)| a.zip(c))
        .collect();

    if let (Some(a), Some(c)) = flat {
        let flat_pair = (a, c);
        if !pairs.contains(&flat_pair) {
            pairs.push(flat_pair);
        }
    }

    pairs.sort();
    pairs.dedup();
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_config::CookieEntry;

    fn cookie(name: &str, value: &str, domain: &str) -> CookieEntry {
        CookieEntry {
            name: name.to_string(),
            value: value.to_string(),
            domain: Some(domain.to_string()),
            path: None,
        }
    }

    #[test]
    fn dedupes_auth_pairs_across_domains() {
        let cookies = vec![
            cookie("auth_token", "tok1", ".twitter.com"),
            cookie("ct0", "csrf1", ".twitter.com"),
            cookie("auth_token", "tok1", ".twitter.com"),
            cookie("ct0", "csrf1", ".twitter.com"),
        ];
        let pairs = extract_auth_pairs(&cookies);
        assert_eq!(pairs, vec![("tok1".to_string(), "csrf1".to_string())]);
    }

    #[test]
    fn rotate_credentials_exhausts_auth_pairs_then_bearer() {
        let cookies = vec![
            cookie("auth_token", "tok1", ".twitter.com"),
            cookie("ct0", "csrf1", ".twitter.com"),
            cookie("auth_token", "tok2", ".x.com"),
            cookie("ct0", "csrf2", ".x.com"),
        ];
        let adapter = HttpSourceAdapter::new(
            &cookies,
            Some("bearer-1".to_string()),
            "https://primary.example",
            "https://alt.example",
        );
        assert_eq!(adapter.auth_pairs.len(), 2);
        assert!(adapter.rotate_credentials());
        assert!(!adapter.rotate_credentials());
    }

    async fn stub_server(status_line: &'static str, body: &'static [u8]) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!("{status_line}\r\nContent-Length: {}\r\n\r\n", body.len());
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.write_all(body).await;
        });
        format!("http://{addr}")
    }

    fn adapter() -> HttpSourceAdapter {
        let cookies = vec![
            cookie("auth_token", "tok1", ".twitter.com"),
            cookie("ct0", "csrf1", ".twitter.com"),
        ];
        HttpSourceAdapter::new(
            &cookies,
            Some("bearer-1".to_string()),
            "https://primary.example",
            "https://alt.example",
        )
    }

    #[tokio::test]
    async fn a_429_with_a_non_json_body_is_still_classified_as_rate_limited() {
        let host = stub_server(
            "HTTP/1.1 429 Too Many Requests",
            b"<html>rate limited</html>",
        )
        .await;
        let outcome = adapter().request(&host, "/x", &[]).await;
        assert!(matches!(outcome, Outcome::RateLimit));
    }

    #[tokio::test]
    async fn a_401_with_a_non_json_body_is_still_classified_as_auth_failure() {
        let host = stub_server("HTTP/1.1 401 Unauthorized", b"<html>nope</html>").await;
        let outcome = adapter().request(&host, "/x", &[]).await;
        assert!(matches!(outcome, Outcome::AuthFailure));
    }
}
